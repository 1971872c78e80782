//! Network Stack Integration
//!
//! [`NetStack`] owns every table the protocol layers share: interfaces, the
//! ARP table, reassembly contexts, UDP and TCP control blocks, the socket
//! operation tables and the timer wheel. Each table has its own lock. Layer
//! code takes `&NetStack` and locks only what it touches, releasing before it
//! calls into another layer or wakes a sleeper.
//!
//! Lock order, where two are ever held together: tcp -> timers and
//! tcp -> arp -> device.
//!
//! The interrupt-side entry points, [`NetStack::tick`] and
//! [`NetStack::notify_rx`], take no lock at all. They record the event and wake
//! a worker; timers run from [`NetStack::run_timers`] in thread context, where
//! waiting on a lock held by the interrupted thread cannot deadlock.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::net::{Ipv4Addr, SocketAddrV4};
use core::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, Ordering};

use log::{debug, info, trace, warn};
use spin::Mutex;

use crate::drivers::net::NetworkDevice;
use crate::net::arp::{self, ArpEntryInfo, ArpTable};
use crate::net::buffer::{PacketBuffer, MAX_HDRLEN_IP};
use crate::net::config::{mss_for_mtu, InterfaceConfig, NetConfig, DEFAULT_PEER_MSS, MIN_MTU, SWEEP_TICKS};
use crate::net::error::NetError;
use crate::net::ethernet::{self, format_mac};
use crate::net::icmp;
use crate::net::ipv4::{self, protocol, Route};
use crate::net::reassembly::ReassemblyTable;
use crate::net::socket::{Domain, MsgFlags, SockType, Socket, SocketOps, TcpSocketOps, UdpSocketOps};
use crate::net::tcp::{self, TcpState, TcpTable};
use crate::net::timer::{FiredTimer, TimerKind, TimerWheel};
use crate::net::udp::{self, UdpTable};
use crate::task::{Scheduler, WaitCause};

/// Frames taken from one interface per [`NetStack::poll`] call
const RX_BUDGET: usize = 16;

/// An attached network interface
pub struct Interface {
    pub name: String,
    pub addr: Ipv4Addr,
    pub netmask: Ipv4Addr,
    pub mac: [u8; 6],
    /// Largest IP datagram the link carries
    pub mtu: usize,
    pub(crate) device: Mutex<Box<dyn NetworkDevice>>,
}

impl Interface {
    /// Subnet broadcast address
    pub fn broadcast(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.addr) | !u32::from(self.netmask))
    }

    /// Whether `ip` is on this interface's network
    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        let mask = u32::from(self.netmask);
        u32::from(ip) & mask == u32::from(self.addr) & mask
    }
}

/// The network stack context
pub struct NetStack {
    config: NetConfig,
    interfaces: Vec<Interface>,
    pub(crate) arp: Mutex<ArpTable>,
    pub(crate) reassembly: Mutex<ReassemblyTable>,
    pub(crate) udp: Mutex<UdpTable>,
    pub(crate) tcp: Mutex<TcpTable>,
    ops: Mutex<BTreeMap<(Domain, SockType), Arc<dyn SocketOps>>>,
    pub(crate) timers: TimerWheel,
    pub(crate) scheduler: Arc<dyn Scheduler>,
    ip_id: AtomicU16,
    /// Ticks raised by [`NetStack::tick`]; the wheel catches up to this
    ticks: AtomicU64,
}

impl NetStack {
    /// Create a stack with no interfaces and the UDP and TCP socket types registered
    pub fn new(config: NetConfig, scheduler: Arc<dyn Scheduler>) -> Self {
        let mut ops: BTreeMap<(Domain, SockType), Arc<dyn SocketOps>> = BTreeMap::new();
        ops.insert((Domain::Inet, SockType::Datagram), Arc::new(UdpSocketOps));
        ops.insert((Domain::Inet, SockType::Stream), Arc::new(TcpSocketOps));

        let stack = Self {
            arp: Mutex::new(ArpTable::new(config.arp_table_size)),
            reassembly: Mutex::new(ReassemblyTable::new(config.reassembly_slots)),
            udp: Mutex::new(UdpTable::new(config.udp_queue_len)),
            tcp: Mutex::new(TcpTable::new(config.tcp_send_buf, config.tcp_recv_buf)),
            ops: Mutex::new(ops),
            timers: TimerWheel::new(),
            scheduler,
            ip_id: AtomicU16::new(0),
            ticks: AtomicU64::new(0),
            interfaces: Vec::new(),
            config,
        };
        stack.timers.schedule(SWEEP_TICKS, TimerKind::ArpSweep, 0);
        stack.timers.schedule(SWEEP_TICKS, TimerKind::ReassemblySweep, 0);
        stack
    }

    pub fn config(&self) -> &NetConfig {
        &self.config
    }

    /// Attach a device
    ///
    /// The interface's own address is entered in the ARP table as a permanent
    /// mapping.
    ///
    /// # Returns
    /// The interface index used by every other call
    ///
    /// # Errors
    /// `InvalidArgument` if the address is unspecified or the MTU, after
    /// capping it to what the device carries, is below [`MIN_MTU`]
    pub fn add_interface(&mut self, cfg: InterfaceConfig, device: Box<dyn NetworkDevice>) -> Result<usize, NetError> {
        let mtu = cfg.mtu.min(device.mtu());
        if !cfg.is_valid() || mtu < MIN_MTU {
            warn!("net: rejecting {} ({}, mtu {})", cfg.name, cfg.ip_addr, mtu);
            return Err(NetError::InvalidArgument);
        }
        let iface = self.interfaces.len();
        let mac = device.mac_address();
        let interface = Interface {
            mtu,
            name: cfg.name,
            addr: cfg.ip_addr,
            netmask: cfg.netmask,
            mac,
            device: Mutex::new(device),
        };
        info!(
            "net: {} up, {} netmask {} mac {} mtu {}",
            interface.name,
            interface.addr,
            interface.netmask,
            format_mac(&mac),
            interface.mtu
        );

        self.arp.lock().register(interface.addr, mac, iface, true);
        self.interfaces.push(interface);
        Ok(iface)
    }

    pub fn interface(&self, iface: usize) -> Option<&Interface> {
        self.interfaces.get(iface)
    }

    pub fn interfaces(&self) -> &[Interface] {
        &self.interfaces
    }

    /// Whether `ip` is the address of one of our interfaces
    pub fn is_local(&self, ip: Ipv4Addr) -> bool {
        self.interfaces.iter().any(|i| i.addr == ip)
    }

    /// Whether a datagram for `dst` arriving on `iface` is ours to process
    pub fn accepts(&self, iface: usize, dst: Ipv4Addr) -> bool {
        let Some(interface) = self.interface(iface) else {
            return false;
        };
        dst == Ipv4Addr::BROADCAST || dst == interface.broadcast() || self.is_local(dst)
    }

    /// Interface for an on-link destination, preferring the one that owns `src`
    fn on_link(&self, src: Ipv4Addr, dst: Ipv4Addr) -> Option<usize> {
        let mut found = None;
        for (i, interface) in self.interfaces.iter().enumerate() {
            if dst == Ipv4Addr::BROADCAST || interface.contains(dst) {
                if interface.addr == src {
                    return Some(i);
                }
                found.get_or_insert(i);
            }
        }
        found
    }

    /// Pick the outgoing interface, next hop and source address for `dst`
    ///
    /// An unspecified `src` takes the outgoing interface's address.
    /// Destinations off every attached network go through the default
    /// gateway, which must itself be on-link.
    pub fn route(&self, src: Ipv4Addr, dst: Ipv4Addr) -> Option<Route> {
        let (iface, next_hop) = match self.on_link(src, dst) {
            Some(iface) => (iface, dst),
            None => {
                let gateway = self.config.gateway?;
                (self.on_link(src, gateway)?, gateway)
            }
        };
        let interface = self.interface(iface)?;
        let src = if self.is_local(src) { src } else { interface.addr };
        Some(Route { src, next_hop, iface })
    }

    /// MSS for a connection from `src` to `dst`
    ///
    /// Derived from the MTU of the interface the route goes out on; the
    /// default peer MSS if there is no route.
    pub fn mss_to(&self, src: Ipv4Addr, dst: Ipv4Addr) -> u16 {
        self.route(src, dst)
            .and_then(|r| self.interface(r.iface))
            .map_or(DEFAULT_PEER_MSS, |i| mss_for_mtu(i.mtu))
    }

    /// Identification field for the next outgoing datagram
    pub fn next_ip_id(&self) -> u16 {
        self.ip_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Ticks processed by [`run_timers`](Self::run_timers) since the stack was created
    pub fn now(&self) -> u64 {
        self.timers.now()
    }

    /// Process up to `RX_BUDGET` received frames of one interface
    fn poll_interface(&self, iface: usize) -> usize {
        let Some(interface) = self.interface(iface) else {
            return 0;
        };
        let mut handled = 0;
        while handled < RX_BUDGET {
            // Device lock is dropped before the frame climbs the stack
            let Some(frame) = interface.device.lock().receive() else {
                break;
            };
            handled += 1;
            ethernet::rx(self, iface, PacketBuffer::from_vec(frame));
        }
        handled
    }

    /// Drain received frames on every interface
    ///
    /// # Returns
    /// Number of frames handled
    pub fn poll(&self) -> usize {
        (0..self.interfaces.len()).map(|i| self.poll_interface(i)).sum()
    }

    /// Receive loop for one interface; sleeps until [`notify_rx`](Self::notify_rx)
    /// whenever the device is empty
    pub fn rx_worker(&self, iface: usize, running: &AtomicBool) {
        debug!("net: rx worker for interface {} started", iface);
        let cause = WaitCause::Device(iface);
        loop {
            let ticket = self.scheduler.prepare_sleep(cause);
            if !running.load(Ordering::Acquire) {
                break;
            }
            if self.poll_interface(iface) == 0 {
                self.scheduler.sleep(cause, ticket);
            }
        }
        debug!("net: rx worker for interface {} stopped", iface);
    }

    /// Called by a driver when frames arrived on `iface`; safe in interrupt context
    pub fn notify_rx(&self, iface: usize) {
        self.scheduler.wakeup(WaitCause::Device(iface));
    }

    /// Called from the tick interrupt every 100 ms
    ///
    /// Only counts the tick and wakes the timer worker. No lock is taken, so
    /// this never waits on the thread it interrupted.
    pub fn tick(&self) {
        self.ticks.fetch_add(1, Ordering::AcqRel);
        self.scheduler.wakeup(WaitCause::Timer);
    }

    /// Ticks raised by [`tick`](Self::tick) and not yet processed
    pub fn pending_ticks(&self) -> u64 {
        self.ticks.load(Ordering::Acquire).saturating_sub(self.timers.now())
    }

    /// Advance the timer wheel to the last raised tick and run what expired
    ///
    /// Must be called in thread context with no stack lock held.
    ///
    /// # Returns
    /// Number of ticks processed
    pub fn run_timers(&self) -> u64 {
        let target = self.ticks.load(Ordering::Acquire);
        let mut processed = 0;
        while let Some(fired) = self.timers.advance_to(target) {
            processed += 1;
            for timer in fired {
                self.dispatch(timer);
            }
        }
        processed
    }

    /// Timer loop; sleeps until the next [`tick`](Self::tick)
    pub fn timer_worker(&self, running: &AtomicBool) {
        debug!("net: timer worker started");
        loop {
            let ticket = self.scheduler.prepare_sleep(WaitCause::Timer);
            if !running.load(Ordering::Acquire) {
                break;
            }
            if self.run_timers() == 0 {
                self.scheduler.sleep(WaitCause::Timer, ticket);
            }
        }
        debug!("net: timer worker stopped");
    }

    fn dispatch(&self, fired: FiredTimer) {
        match fired.kind {
            TimerKind::ArpSweep => {
                arp::sweep(self);
                self.timers.schedule(SWEEP_TICKS, TimerKind::ArpSweep, 0);
            }
            TimerKind::ReassemblySweep => {
                let freed = self.reassembly.lock().sweep();
                if freed > 0 {
                    debug!("ip: {} reassembly context(s) timed out", freed);
                }
                self.timers.schedule(SWEEP_TICKS, TimerKind::ReassemblySweep, 0);
            }
            TimerKind::TcpRetransmit
            | TimerKind::TcpPersist
            | TimerKind::TcpDelayedAck
            | TimerKind::TcpTimeWait
            | TimerKind::TcpFinWait => tcp::timer::fire(self, fired),
            TimerKind::UdpRecvTimeout => self.scheduler.wakeup(WaitCause::Udp(fired.key)),
        }
    }

    /// Enter a static or dynamic mapping and release frames waiting on it
    pub fn arp_register(&self, ip: Ipv4Addr, mac: [u8; 6], permanent: bool) {
        let iface = self.on_link(Ipv4Addr::UNSPECIFIED, ip).unwrap_or(0);
        arp::register(self, ip, mac, iface, permanent);
    }

    pub fn arp_lookup(&self, ip: Ipv4Addr) -> Option<[u8; 6]> {
        self.arp.lock().lookup(ip)
    }

    /// Snapshot of the ARP table
    pub fn arp_entries(&self) -> Vec<ArpEntryInfo> {
        self.arp.lock().entries()
    }

    /// Send a transport payload in IP
    ///
    /// `payload` must have [`MAX_HDRLEN_IP`] bytes of head-room in front of it.
    pub fn ip_tx(&self, payload: PacketBuffer, src: Ipv4Addr, dst: Ipv4Addr, proto: u8) -> Result<(), NetError> {
        ipv4::tx(self, payload, src, dst, proto)
    }

    /// Number of datagrams currently being reassembled
    pub fn reassembly_count(&self) -> usize {
        self.reassembly.lock().len()
    }

    /// Send an ICMP echo request to `dst`
    pub fn ping(&self, dst: Ipv4Addr, identifier: u16, sequence: u16, data: &[u8]) -> Result<(), NetError> {
        let message = icmp::build_echo_request(identifier, sequence, data);
        trace!("icmp: echo request to {} seq {}", dst, sequence);
        self.ip_tx(
            PacketBuffer::with_payload(MAX_HDRLEN_IP, &message),
            Ipv4Addr::UNSPECIFIED,
            dst,
            protocol::ICMP,
        )
    }

    /// Install the operation table for a socket type, replacing any previous one
    pub fn register_ops(&self, domain: Domain, ty: SockType, ops: Arc<dyn SocketOps>) {
        self.ops.lock().insert((domain, ty), ops);
    }

    /// Create a socket
    pub fn socket(&self, domain: Domain, ty: SockType) -> Result<Socket, NetError> {
        let ops = self.ops.lock().get(&(domain, ty)).cloned().ok_or(NetError::NotSupported)?;
        let pcb = ops.open(self)?;
        Ok(Socket { domain, ty, pcb, ops })
    }

    /// Bind to a local address; port 0 picks an ephemeral port
    pub fn bind(&self, sock: &Socket, addr: SocketAddrV4) -> Result<SocketAddrV4, NetError> {
        sock.ops.bind(self, sock.pcb, addr)
    }

    pub fn connect(&self, sock: &Socket, addr: SocketAddrV4) -> Result<(), NetError> {
        sock.ops.connect(self, sock.pcb, addr)
    }

    pub fn listen(&self, sock: &Socket, backlog: usize) -> Result<(), NetError> {
        sock.ops.listen(self, sock.pcb, backlog)
    }

    /// Wait for a connection on a listening socket
    pub fn accept(&self, sock: &Socket, flags: MsgFlags) -> Result<(Socket, SocketAddrV4), NetError> {
        let (pcb, peer) = sock.ops.accept(self, sock.pcb, flags)?;
        let conn = Socket {
            domain: sock.domain,
            ty: sock.ty,
            pcb,
            ops: sock.ops.clone(),
        };
        Ok((conn, peer))
    }

    pub fn sendto(&self, sock: &Socket, data: &[u8], to: SocketAddrV4, flags: MsgFlags) -> Result<usize, NetError> {
        sock.ops.sendto(self, sock.pcb, data, to, flags)
    }

    pub fn recvfrom(&self, sock: &Socket, buf: &mut [u8], flags: MsgFlags) -> Result<(usize, SocketAddrV4), NetError> {
        sock.ops.recvfrom(self, sock.pcb, buf, flags)
    }

    pub fn send(&self, sock: &Socket, data: &[u8], flags: MsgFlags) -> Result<usize, NetError> {
        sock.ops.send(self, sock.pcb, data, flags)
    }

    pub fn recv(&self, sock: &Socket, buf: &mut [u8], flags: MsgFlags) -> Result<usize, NetError> {
        sock.ops.recv(self, sock.pcb, buf, flags)
    }

    pub fn close(&self, sock: Socket) -> Result<(), NetError> {
        sock.ops.close(self, sock.pcb)
    }

    /// Receive timeout in ticks for a datagram socket; `None` blocks forever
    pub fn set_recv_timeout(&self, sock: &Socket, ticks: Option<u64>) -> Result<(), NetError> {
        match (sock.domain, sock.ty) {
            (Domain::Inet, SockType::Datagram) => udp::set_recv_timeout(self, sock.pcb, ticks),
            _ => Err(NetError::NotSupported),
        }
    }

    /// Address a socket is bound to
    pub fn local_addr(&self, sock: &Socket) -> Option<SocketAddrV4> {
        match (sock.domain, sock.ty) {
            (Domain::Inet, SockType::Datagram) => self.udp.lock().local(sock.pcb),
            (Domain::Inet, SockType::Stream) => tcp::user::endpoints(self, sock.pcb).map(|(local, _)| local),
        }
    }

    /// Connection state of a stream socket
    pub fn tcp_state(&self, sock: &Socket) -> Option<TcpState> {
        match sock.ty {
            SockType::Stream => tcp::user::state(self, sock.pcb),
            SockType::Datagram => None,
        }
    }
}
