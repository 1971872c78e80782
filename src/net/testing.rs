//! Test doubles for the unit tests: a device that records every frame and
//! helpers to inject and decode TCP segments

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::net::{Ipv4Addr, SocketAddrV4};

use spin::Mutex;

use crate::drivers::net::{LinkStatus, NetworkDevice, TransmitError};
use crate::net::buffer::PacketBuffer;
use crate::net::checksum;
use crate::net::config::{InterfaceConfig, NetConfig, MTU};
use crate::net::ethernet::{self, EthernetHeader, ETHERTYPE_IPV4};
use crate::net::ipv4::{self, protocol, Ipv4Header};
use crate::net::stack::NetStack;
use crate::net::tcp::{with_table, TcpHeader, TcpState};
use crate::task::SpinScheduler;

pub(crate) const LOCAL_IP: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);
pub(crate) const PEER_IP: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 2);
pub(crate) const LOCAL_MAC: [u8; 6] = [0x52, 0x54, 0, 0, 0, 1];
pub(crate) const PEER_MAC: [u8; 6] = [0x52, 0x54, 0, 0, 0, 2];

/// Ports and initial sequence numbers of [`established`] connections
pub(crate) const PORT: u16 = 80;
pub(crate) const PEER_PORT: u16 = 40000;
pub(crate) const ISS: u32 = 1000;
pub(crate) const IRS: u32 = 0xffff_ff00;

/// Frames transmitted through a [`CaptureDevice`]
#[derive(Clone, Default)]
pub(crate) struct Capture {
    sent: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl Capture {
    /// Take every frame sent so far
    pub fn take(&self) -> Vec<Vec<u8>> {
        core::mem::take(&mut *self.sent.lock())
    }

    /// Take the frames sent so far and decode the TCP segments among them
    pub fn segments(&self) -> Vec<(TcpHeader, Vec<u8>)> {
        self.take().iter().filter_map(|f| decode_tcp(f)).collect()
    }
}

pub(crate) struct CaptureDevice {
    capture: Capture,
}

/// A device recording into a fresh [`Capture`]
pub(crate) fn device() -> (Box<dyn NetworkDevice>, Capture) {
    let capture = Capture::default();
    let device = Box::new(CaptureDevice {
        capture: capture.clone(),
    });
    (device, capture)
}

impl NetworkDevice for CaptureDevice {
    fn mac_address(&self) -> [u8; 6] {
        LOCAL_MAC
    }

    fn transmit(&mut self, frame: &[u8]) -> Result<(), TransmitError> {
        self.capture.sent.lock().push(frame.to_vec());
        Ok(())
    }

    fn receive(&mut self) -> Option<Vec<u8>> {
        None
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
}

/// A stack on 10.0.0.1/24 whose peer 10.0.0.2 is already resolved
pub(crate) fn stack() -> (NetStack, Capture) {
    stack_with_mtu(MTU)
}

/// Same as [`stack`] with a smaller link
pub(crate) fn stack_with_mtu(mtu: usize) -> (NetStack, Capture) {
    let (device, capture) = device();
    let mut stack = NetStack::new(NetConfig::default(), Arc::new(SpinScheduler::new()));
    stack
        .add_interface(
            InterfaceConfig::new("eth0", LOCAL_IP, Ipv4Addr::new(255, 255, 255, 0)).with_mtu(mtu),
            device,
        )
        .unwrap();
    stack.arp_register(PEER_IP, PEER_MAC, true);
    (stack, capture)
}

/// A connection that completed its handshake with the peer
pub(crate) fn established(stack: &NetStack) -> u32 {
    with_table(stack, |tcp| {
        let id = tcp.alloc();
        let tcb = tcp.get_mut(id).unwrap();
        tcb.local = SocketAddrV4::new(LOCAL_IP, PORT);
        tcb.remote = SocketAddrV4::new(PEER_IP, PEER_PORT);
        tcb.iss = ISS;
        tcb.snd_una = ISS + 1;
        tcb.snd_nxt = ISS + 1;
        tcb.snd_wnd = 4096;
        tcb.snd_wl1 = IRS;
        tcb.snd_wl2 = ISS + 1;
        tcb.irs = IRS;
        tcb.rcv_nxt = IRS.wrapping_add(1);
        tcb.mss = 1460;
        tcb.state = TcpState::Established;
        id
    })
}

/// Raise `n` ticks and run their timers one at a time
pub(crate) fn advance(stack: &NetStack, n: u64) {
    for _ in 0..n {
        stack.tick();
        stack.run_timers();
    }
}

/// Decode an Ethernet frame carrying a TCP segment
pub(crate) fn decode_tcp(frame: &[u8]) -> Option<(TcpHeader, Vec<u8>)> {
    let eth = EthernetHeader::from_bytes(frame).ok()?;
    if eth.ethertype != ETHERTYPE_IPV4 {
        return None;
    }
    let ip = &frame[ethernet::HEADER_SIZE..];
    let header = Ipv4Header::from_bytes(ip).ok()?;
    if header.protocol != protocol::TCP {
        return None;
    }
    let segment = &ip[header.header_length()..header.total_length as usize];
    let tcp = TcpHeader::parse(segment, header.src_ip, header.dest_ip).ok()?;
    Some((tcp, segment[tcp.header_len()..].to_vec()))
}

/// Deliver a segment from the peer to the stack
pub(crate) fn inject_tcp(stack: &NetStack, header: &TcpHeader, payload: &[u8]) {
    let mut segment = alloc::vec![0u8; header.header_len()];
    header.write(&mut segment);
    segment.extend_from_slice(payload);
    let pseudo = checksum::pseudo_header(PEER_IP, LOCAL_IP, protocol::TCP, segment.len() as u16);
    let sum = checksum::checksum(&[&pseudo, &segment]);
    segment[16..18].copy_from_slice(&sum.to_be_bytes());

    let mut frame = alloc::vec![0u8; ethernet::HEADER_SIZE + ipv4::MIN_HEADER_SIZE];
    EthernetHeader {
        dest_mac: LOCAL_MAC,
        src_mac: PEER_MAC,
        ethertype: ETHERTYPE_IPV4,
    }
    .write(&mut frame);
    Ipv4Header::new(PEER_IP, LOCAL_IP, protocol::TCP, segment.len() as u16)
        .write(&mut frame[ethernet::HEADER_SIZE..]);
    frame.extend_from_slice(&segment);

    ethernet::rx(stack, 0, PacketBuffer::from_vec(frame));
}
