//! Shared fixtures for the integration tests: a scheduler backed by a
//! condition variable, a capture device, a back-to-back wire between two
//! stacks and frame builders.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use rustrial_net::drivers::net::{LinkStatus, NetworkDevice, TransmitError};
use rustrial_net::net::checksum;
use rustrial_net::net::config::{InterfaceConfig, NetConfig};
use rustrial_net::net::ethernet::{self, EthernetHeader, ETHERTYPE_IPV4};
use rustrial_net::net::ipv4::{self, protocol, Ipv4Header};
use rustrial_net::net::udp::{UdpHeader, UDP_HEADER_SIZE};
use rustrial_net::task::{Scheduler, WaitCause, WaitTicket};
use rustrial_net::NetStack;

pub const MASK: Ipv4Addr = Ipv4Addr::new(255, 255, 255, 0);
pub const IP_A: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);
pub const IP_B: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 2);
pub const MAC_A: [u8; 6] = [0x52, 0x54, 0x00, 0x12, 0x34, 0x01];
pub const MAC_B: [u8; 6] = [0x52, 0x54, 0x00, 0x12, 0x34, 0x02];

/// Scheduler for threaded tests
///
/// Counts wakeups per cause. A sleeper blocks until the count of its cause
/// moves past its ticket, with no timeout: a lost wakeup hangs the test.
#[derive(Default)]
pub struct CondvarScheduler {
    wakeups: Mutex<HashMap<WaitCause, u64>>,
    cond: Condvar,
}

impl Scheduler for CondvarScheduler {
    fn prepare_sleep(&self, cause: WaitCause) -> WaitTicket {
        WaitTicket(self.wakeups.lock().unwrap().get(&cause).copied().unwrap_or(0))
    }

    fn sleep(&self, cause: WaitCause, ticket: WaitTicket) {
        let guard = self.wakeups.lock().unwrap();
        let _guard = self
            .cond
            .wait_while(guard, |w| w.get(&cause).copied().unwrap_or(0) == ticket.0)
            .unwrap();
    }

    fn wakeup(&self, cause: WaitCause) {
        *self.wakeups.lock().unwrap().entry(cause).or_insert(0) += 1;
        self.cond.notify_all();
    }
}

/// Shared ends of a [`CaptureDevice`]
#[derive(Clone, Default)]
pub struct Link {
    inbox: Arc<Mutex<VecDeque<Vec<u8>>>>,
    sent: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl Link {
    /// Queue a frame for the stack to receive on its next poll
    pub fn inject(&self, frame: Vec<u8>) {
        self.inbox.lock().unwrap().push_back(frame);
    }

    /// Take every frame the stack transmitted so far
    pub fn take_sent(&self) -> Vec<Vec<u8>> {
        std::mem::take(&mut *self.sent.lock().unwrap())
    }
}

/// Device whose traffic is driven and inspected by the test
pub struct CaptureDevice {
    mac: [u8; 6],
    mtu: usize,
    link: Link,
}

impl NetworkDevice for CaptureDevice {
    fn mac_address(&self) -> [u8; 6] {
        self.mac
    }

    fn transmit(&mut self, frame: &[u8]) -> Result<(), TransmitError> {
        self.link.sent.lock().unwrap().push(frame.to_vec());
        Ok(())
    }

    fn receive(&mut self) -> Option<Vec<u8>> {
        self.link.inbox.lock().unwrap().pop_front()
    }

    fn link_status(&self) -> LinkStatus {
        LinkStatus::Up
    }

    fn device_name(&self) -> &str {
        "capture"
    }

    fn is_ready(&self) -> bool {
        true
    }

    fn mtu(&self) -> usize {
        self.mtu
    }
}

/// A stack on `IP_A` whose only interface is a capture device
pub fn capture_stack() -> (NetStack, Link) {
    capture_stack_with(NetConfig::default(), 1500)
}

pub fn capture_stack_with(config: NetConfig, mtu: usize) -> (NetStack, Link) {
    let link = Link::default();
    let mut stack = NetStack::new(config, Arc::new(CondvarScheduler::default()));
    stack
        .add_interface(
            InterfaceConfig::new("eth0", IP_A, MASK).with_mtu(mtu),
            Box::new(CaptureDevice {
                mac: MAC_A,
                mtu,
                link: link.clone(),
            }),
        )
        .unwrap();
    (stack, link)
}

/// One end of a back-to-back cable
pub struct WireDevice {
    mac: [u8; 6],
    tx: Arc<Mutex<VecDeque<Vec<u8>>>>,
    rx: Arc<Mutex<VecDeque<Vec<u8>>>>,
    /// Frames to swallow before delivering again
    drop_next: Arc<Mutex<usize>>,
}

impl NetworkDevice for WireDevice {
    fn mac_address(&self) -> [u8; 6] {
        self.mac
    }

    fn transmit(&mut self, frame: &[u8]) -> Result<(), TransmitError> {
        let mut drop_next = self.drop_next.lock().unwrap();
        if *drop_next > 0 {
            *drop_next -= 1;
            return Ok(());
        }
        self.tx.lock().unwrap().push_back(frame.to_vec());
        Ok(())
    }

    fn receive(&mut self) -> Option<Vec<u8>> {
        self.rx.lock().unwrap().pop_front()
    }

    fn link_status(&self) -> LinkStatus {
        LinkStatus::Up
    }

    fn device_name(&self) -> &str {
        "wire"
    }

    fn is_ready(&self) -> bool {
        true
    }
}

/// Two stacks on one wire, driven by a background thread that polls both and
/// ticks and runs their timers every millisecond
pub struct Pair {
    pub a: Arc<NetStack>,
    pub b: Arc<NetStack>,
    /// Make A's device drop its next N frames
    pub drop_from_a: Arc<Mutex<usize>>,
    running: Arc<AtomicBool>,
    pump: Option<JoinHandle<()>>,
}

impl Pair {
    pub fn new() -> Self {
        Self::with_config(NetConfig::default())
    }

    pub fn with_config(config: NetConfig) -> Self {
        let a_to_b = Arc::new(Mutex::new(VecDeque::new()));
        let b_to_a = Arc::new(Mutex::new(VecDeque::new()));
        let drop_from_a = Arc::new(Mutex::new(0));

        let mut a = NetStack::new(config.clone(), Arc::new(CondvarScheduler::default()));
        a.add_interface(
            InterfaceConfig::new("eth0", IP_A, MASK),
            Box::new(WireDevice {
                mac: MAC_A,
                tx: a_to_b.clone(),
                rx: b_to_a.clone(),
                drop_next: drop_from_a.clone(),
            }),
        )
        .unwrap();
        let mut b = NetStack::new(config, Arc::new(CondvarScheduler::default()));
        b.add_interface(
            InterfaceConfig::new("eth0", IP_B, MASK),
            Box::new(WireDevice {
                mac: MAC_B,
                tx: b_to_a,
                rx: a_to_b,
                drop_next: Arc::new(Mutex::new(0)),
            }),
        )
        .unwrap();

        let a = Arc::new(a);
        let b = Arc::new(b);
        let running = Arc::new(AtomicBool::new(true));
        let pump = {
            let (a, b, running) = (a.clone(), b.clone(), running.clone());
            thread::spawn(move || {
                let mut last_tick = Instant::now();
                while running.load(Ordering::Acquire) {
                    let moved = a.poll() + b.poll();
                    if last_tick.elapsed() >= Duration::from_millis(1) {
                        a.tick();
                        b.tick();
                        a.run_timers();
                        b.run_timers();
                        last_tick = Instant::now();
                    }
                    if moved == 0 {
                        thread::sleep(Duration::from_micros(100));
                    }
                }
            })
        };

        Self {
            a,
            b,
            drop_from_a,
            running,
            pump: Some(pump),
        }
    }
}

impl Drop for Pair {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(pump) = self.pump.take() {
            let _ = pump.join();
        }
    }
}

/// Poll `cond` until it holds or `timeout` passes
pub fn wait_for(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    cond()
}

/// Ethernet frame around `payload`
pub fn eth_frame(dest_mac: [u8; 6], src_mac: [u8; 6], ethertype: u16, payload: &[u8]) -> Vec<u8> {
    let mut frame = vec![0u8; ethernet::HEADER_SIZE];
    EthernetHeader {
        dest_mac,
        src_mac,
        ethertype,
    }
    .write(&mut frame);
    frame.extend_from_slice(payload);
    frame
}

/// IPv4 datagram (unfragmented) around `payload`
pub fn ip_packet(src: Ipv4Addr, dst: Ipv4Addr, proto: u8, payload: &[u8]) -> Vec<u8> {
    let mut packet = vec![0u8; ipv4::MIN_HEADER_SIZE];
    Ipv4Header::new(src, dst, proto, payload.len() as u16).write(&mut packet);
    packet.extend_from_slice(payload);
    packet
}

/// UDP datagram with a valid checksum
pub fn udp_datagram(src: Ipv4Addr, dst: Ipv4Addr, sport: u16, dport: u16, payload: &[u8]) -> Vec<u8> {
    let mut datagram = vec![0u8; UDP_HEADER_SIZE];
    UdpHeader {
        src_port: sport,
        dest_port: dport,
        length: (UDP_HEADER_SIZE + payload.len()) as u16,
        checksum: 0,
    }
    .write(&mut datagram);
    datagram.extend_from_slice(payload);
    let pseudo = checksum::pseudo_header(src, dst, protocol::UDP, datagram.len() as u16);
    let sum = checksum::checksum(&[&pseudo, &datagram]);
    datagram[6..8].copy_from_slice(&sum.to_be_bytes());
    datagram
}

/// Frame from B to A carrying `payload` in IP
pub fn ip_frame_from_b(proto: u8, payload: &[u8]) -> Vec<u8> {
    eth_frame(MAC_A, MAC_B, ETHERTYPE_IPV4, &ip_packet(IP_B, IP_A, proto, payload))
}

/// IP header and payload of an IPv4 frame
pub fn parse_ip(frame: &[u8]) -> Option<(Ipv4Header, Vec<u8>)> {
    let eth = EthernetHeader::from_bytes(frame).ok()?;
    if eth.ethertype != ETHERTYPE_IPV4 {
        return None;
    }
    let packet = &frame[ethernet::HEADER_SIZE..];
    let header = Ipv4Header::from_bytes(packet).ok()?;
    let payload = packet[header.header_length()..header.total_length as usize].to_vec();
    Some((header, payload))
}
