//! UDP Protocol Implementation (RFC 768)
//!
//! Provides User Datagram Protocol support for connectionless, packet-based
//! communication. Every socket owns a control block with a bounded receive
//! queue; when the queue is full the oldest datagram is dropped.

use alloc::collections::{BTreeMap, VecDeque};
use core::fmt;
use core::net::{Ipv4Addr, SocketAddrV4};

use log::{debug, trace, warn};

use crate::net::buffer::{PacketBuffer, MAX_HDRLEN_UDP};
use crate::net::checksum;
use crate::net::config::{EPHEMERAL_PORT_END, EPHEMERAL_PORT_START};
use crate::net::error::NetError;
use crate::net::ipv4::{self, protocol, IpMeta};
use crate::net::socket::MsgFlags;
use crate::net::stack::NetStack;
use crate::net::timer::{TimerKind, TimerToken};
use crate::task::WaitCause;

/// Minimum UDP header size (8 bytes)
pub const UDP_HEADER_SIZE: usize = 8;

/// Largest payload a datagram can carry
pub const MAX_DATAGRAM_SIZE: usize = 0xFFFF - UDP_HEADER_SIZE;

/// Errors that can occur while parsing a datagram
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UdpError {
    /// Packet is too short to contain a valid UDP header
    PacketTooShort,
    /// Length field doesn't match actual packet size
    InvalidLength,
    /// Checksum verification failed
    ChecksumMismatch,
}

impl fmt::Display for UdpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UdpError::PacketTooShort => write!(f, "datagram too short"),
            UdpError::InvalidLength => write!(f, "length field does not match"),
            UdpError::ChecksumMismatch => write!(f, "checksum mismatch"),
        }
    }
}

/// UDP header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UdpHeader {
    /// Source port (0-65535)
    pub src_port: u16,
    /// Destination port (0-65535)
    pub dest_port: u16,
    /// Length of UDP header + data (minimum 8 bytes)
    pub length: u16,
    /// Checksum (optional for IPv4, 0 = not computed)
    pub checksum: u16,
}

impl UdpHeader {
    /// Parse and validate a datagram received from `src` to `dst`
    ///
    /// `data` may carry trailing bytes past the declared length.
    pub fn parse(data: &[u8], src: Ipv4Addr, dst: Ipv4Addr) -> Result<Self, UdpError> {
        if data.len() < UDP_HEADER_SIZE {
            return Err(UdpError::PacketTooShort);
        }

        let header = Self {
            src_port: u16::from_be_bytes([data[0], data[1]]),
            dest_port: u16::from_be_bytes([data[2], data[3]]),
            length: u16::from_be_bytes([data[4], data[5]]),
            checksum: u16::from_be_bytes([data[6], data[7]]),
        };

        let length = header.length as usize;
        if length < UDP_HEADER_SIZE || length > data.len() {
            return Err(UdpError::InvalidLength);
        }

        if header.checksum != 0 {
            let pseudo = checksum::pseudo_header(src, dst, protocol::UDP, header.length);
            if !checksum::verify(&[&pseudo, &data[..length]]) {
                return Err(UdpError::ChecksumMismatch);
            }
        }

        Ok(header)
    }

    /// Write the header with a zero checksum
    pub fn write(&self, out: &mut [u8]) {
        out[0..2].copy_from_slice(&self.src_port.to_be_bytes());
        out[2..4].copy_from_slice(&self.dest_port.to_be_bytes());
        out[4..6].copy_from_slice(&self.length.to_be_bytes());
        out[6..8].copy_from_slice(&[0, 0]);
    }
}

/// A queued datagram; the buffer still starts with the UDP header
pub(crate) struct Datagram {
    from: SocketAddrV4,
    pkt: PacketBuffer,
}

/// UDP control block
pub(crate) struct Ucb {
    /// Bound address; port 0 while unbound
    local: SocketAddrV4,
    /// Default destination set by `connect`
    peer: Option<SocketAddrV4>,
    queue: VecDeque<Datagram>,
    /// Receive timeout in ticks
    recv_timeout: Option<u64>,
}

impl Ucb {
    fn new() -> Self {
        Self {
            local: SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0),
            peer: None,
            queue: VecDeque::new(),
            recv_timeout: None,
        }
    }
}

/// All UDP control blocks
pub(crate) struct UdpTable {
    ucbs: BTreeMap<u32, Ucb>,
    next_id: u32,
    queue_len: usize,
}

impl UdpTable {
    pub fn new(queue_len: usize) -> Self {
        Self {
            ucbs: BTreeMap::new(),
            next_id: 1,
            queue_len: queue_len.max(1),
        }
    }

    pub fn alloc(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        self.ucbs.insert(id, Ucb::new());
        id
    }

    pub fn free(&mut self, id: u32) -> bool {
        self.ucbs.remove(&id).is_some()
    }

    fn port_in_use(&self, addr: Ipv4Addr, port: u16) -> bool {
        self.ucbs.values().any(|u| {
            u.local.port() == port
                && (u.local.ip().is_unspecified() || addr.is_unspecified() || *u.local.ip() == addr)
        })
    }

    /// First unused port of the dynamic range
    fn ephemeral_port(&self) -> Option<u16> {
        (EPHEMERAL_PORT_START..=EPHEMERAL_PORT_END).find(|&p| !self.ucbs.values().any(|u| u.local.port() == p))
    }

    pub fn bind(&mut self, id: u32, addr: SocketAddrV4) -> Result<SocketAddrV4, NetError> {
        if self.ucbs.get(&id).ok_or(NetError::BadFd)?.local.port() != 0 {
            return Err(NetError::AddrInUse);
        }
        let port = match addr.port() {
            0 => self.ephemeral_port().ok_or(NetError::AddrInUse)?,
            port if self.port_in_use(*addr.ip(), port) => return Err(NetError::AddrInUse),
            port => port,
        };
        let local = SocketAddrV4::new(*addr.ip(), port);
        self.ucbs.get_mut(&id).ok_or(NetError::BadFd)?.local = local;
        Ok(local)
    }

    /// Local address, binding an ephemeral port first if needed
    fn local_or_bind(&mut self, id: u32) -> Result<SocketAddrV4, NetError> {
        let local = self.ucbs.get(&id).ok_or(NetError::BadFd)?.local;
        if local.port() != 0 {
            return Ok(local);
        }
        self.bind(id, SocketAddrV4::new(*local.ip(), 0))
    }

    /// Control block bound to `dst`, an exact address beating a wildcard
    fn demux(&self, dst: SocketAddrV4) -> Option<u32> {
        let mut wildcard = None;
        for (&id, ucb) in &self.ucbs {
            if ucb.local.port() != dst.port() {
                continue;
            }
            if ucb.local.ip() == dst.ip() {
                return Some(id);
            }
            if ucb.local.ip().is_unspecified() {
                wildcard.get_or_insert(id);
            }
        }
        wildcard
    }

    pub fn local(&self, id: u32) -> Option<SocketAddrV4> {
        self.ucbs.get(&id).map(|u| u.local)
    }
}

/// Handle a received datagram
pub(crate) fn rx(stack: &NetStack, meta: IpMeta, mut pkt: PacketBuffer) {
    let header = match UdpHeader::parse(pkt.data(), meta.src, meta.dst) {
        Ok(header) => header,
        Err(e) => {
            debug!("udp: dropping datagram from {}: {}", meta.src, e);
            return;
        }
    };
    pkt.truncate(header.length as usize);

    let dst = SocketAddrV4::new(meta.dst, header.dest_port);
    let from = SocketAddrV4::new(meta.src, header.src_port);

    let id = {
        let mut udp = stack.udp.lock();
        let Some(id) = udp.demux(dst) else {
            trace!("udp: no socket on {}", dst);
            return;
        };
        let queue_len = udp.queue_len;
        let Some(ucb) = udp.ucbs.get_mut(&id) else {
            return;
        };
        if ucb.queue.len() >= queue_len {
            warn!("udp: receive queue of {} full, dropping oldest datagram", ucb.local);
            ucb.queue.pop_front();
        }
        ucb.queue.push_back(Datagram { from, pkt });
        id
    };

    trace!("udp: {} bytes {} -> {}", header.length, from, dst);
    stack.scheduler.wakeup(WaitCause::Udp(id));
}

/// Send `data` to `to` from control block `id`
///
/// # Returns
/// Number of payload bytes sent
pub(crate) fn sendto(stack: &NetStack, id: u32, data: &[u8], to: SocketAddrV4) -> Result<usize, NetError> {
    if data.len() > MAX_DATAGRAM_SIZE {
        return Err(NetError::MsgSize);
    }

    let local = stack.udp.lock().local_or_bind(id)?;
    // The pseudo-header needs the source address the IP layer will use
    let route = stack.route(*local.ip(), *to.ip()).ok_or(NetError::NoRoute)?;

    let length = (UDP_HEADER_SIZE + data.len()) as u16;
    let mut pkt = PacketBuffer::alloc(MAX_HDRLEN_UDP + data.len());
    pkt.reserve_headroom(MAX_HDRLEN_UDP)?;
    pkt.append(data)?;

    let header = UdpHeader {
        src_port: local.port(),
        dest_port: to.port(),
        length,
        checksum: 0,
    };
    header.write(pkt.add_header(UDP_HEADER_SIZE)?);

    let pseudo = checksum::pseudo_header(route.src, *to.ip(), protocol::UDP, length);
    let sum = checksum::checksum(&[&pseudo, pkt.data()]);
    pkt.data_mut()[6..8].copy_from_slice(&sum.to_be_bytes());

    ipv4::tx(stack, pkt, route.src, *to.ip(), protocol::UDP)?;
    Ok(data.len())
}

/// Send to the peer recorded by [`connect`]
pub(crate) fn send(stack: &NetStack, id: u32, data: &[u8]) -> Result<usize, NetError> {
    let peer = stack
        .udp
        .lock()
        .ucbs
        .get(&id)
        .ok_or(NetError::BadFd)?
        .peer
        .ok_or(NetError::ConnNotExist)?;
    sendto(stack, id, data, peer)
}

/// Record the default destination and make sure the socket has a port
pub(crate) fn connect(stack: &NetStack, id: u32, peer: SocketAddrV4) -> Result<(), NetError> {
    let mut udp = stack.udp.lock();
    udp.local_or_bind(id)?;
    udp.ucbs.get_mut(&id).ok_or(NetError::BadFd)?.peer = Some(peer);
    Ok(())
}

/// Set the receive timeout (`None` blocks forever)
pub(crate) fn set_recv_timeout(stack: &NetStack, id: u32, ticks: Option<u64>) -> Result<(), NetError> {
    stack.udp.lock().ucbs.get_mut(&id).ok_or(NetError::BadFd)?.recv_timeout = ticks;
    Ok(())
}

/// Receive one datagram into `buf`, truncating it if `buf` is short
///
/// # Returns
/// Bytes copied and the sender's address
pub(crate) fn recvfrom(
    stack: &NetStack,
    id: u32,
    buf: &mut [u8],
    flags: MsgFlags,
) -> Result<(usize, SocketAddrV4), NetError> {
    let mut timer = TimerToken::INVALID;
    let mut deadline = None;

    let cause = WaitCause::Udp(id);
    let result = loop {
        let ticket = stack.scheduler.prepare_sleep(cause);
        {
            let mut udp = stack.udp.lock();
            let Some(ucb) = udp.ucbs.get_mut(&id) else {
                break Err(NetError::BadFd);
            };
            if let Some(datagram) = ucb.queue.pop_front() {
                let payload = &datagram.pkt.data()[UDP_HEADER_SIZE..];
                let n = payload.len().min(buf.len());
                buf[..n].copy_from_slice(&payload[..n]);
                break Ok((n, datagram.from));
            }
            if flags.contains(MsgFlags::DONTWAIT) {
                break Err(NetError::Again);
            }
            match (deadline, ucb.recv_timeout) {
                (Some(deadline), _) if stack.now() >= deadline => break Err(NetError::Timeout),
                (None, Some(ticks)) => {
                    deadline = Some(stack.now() + ticks);
                    timer = stack.timers.schedule(ticks, TimerKind::UdpRecvTimeout, id);
                }
                _ => {}
            }
        }
        stack.scheduler.sleep(cause, ticket);
    };

    stack.timers.cancel(timer);
    result
}

/// Release a control block and wake anyone blocked on it
pub(crate) fn close(stack: &NetStack, id: u32) -> Result<(), NetError> {
    if !stack.udp.lock().free(id) {
        return Err(NetError::BadFd);
    }
    stack.scheduler.wakeup(WaitCause::Udp(id));
    Ok(())
}
