//! IPv4 Protocol Implementation
//!
//! Implements IPv4 header parsing and building, routing over the configured
//! interfaces, fragmentation on transmit and protocol dispatch on receive.
//! Reassembly of inbound fragments lives in [`crate::net::reassembly`].
//!
//! # References
//! - RFC 791: Internet Protocol (IPv4)
//! - RFC 1071: Computing the Internet Checksum

use core::fmt;
use core::net::Ipv4Addr;

use log::{debug, trace};

use crate::net::arp;
use crate::net::buffer::{PacketBuffer, MAX_HDRLEN_IP};
use crate::net::checksum;
use crate::net::config::IP_TTL;
use crate::net::error::NetError;
use crate::net::ethernet::{self, BROADCAST_MAC, ETHERTYPE_IPV4};
use crate::net::icmp;
use crate::net::reassembly::FragmentKey;
use crate::net::stack::NetStack;
use crate::net::tcp;
use crate::net::udp;

/// IPv4 Protocol Numbers (IANA assigned)
pub mod protocol {
    pub const ICMP: u8 = 1;
    pub const TCP: u8 = 6;
    pub const UDP: u8 = 17;
}

/// IPv4 Header Flags (in the flags/offset word)
pub mod flags {
    pub const DONT_FRAGMENT: u16 = 0x4000;
    pub const MORE_FRAGMENTS: u16 = 0x2000;
    pub const OFFSET_MASK: u16 = 0x1FFF;
}

/// Minimum IPv4 header size (without options)
pub const MIN_HEADER_SIZE: usize = 20;

/// Maximum IPv4 header size (IHL = 15)
pub const MAX_HEADER_SIZE: usize = 60;

/// Maximum IPv4 packet size
pub const MAX_PACKET_SIZE: usize = 65535;

/// Largest payload a single (possibly fragmented) datagram can carry
pub const MAX_PAYLOAD_SIZE: usize = MAX_PACKET_SIZE - MIN_HEADER_SIZE;

/// IPv4 Header Structure
///
/// ```text
/// 0                   1                   2                   3
/// 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |Version|  IHL  |Type of Service|         Total Length          |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |         Identification        |Flags|      Fragment Offset    |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |  Time to Live |    Protocol   |         Header Checksum       |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                       Source Address                          |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                    Destination Address                        |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ipv4Header {
    /// Internet Header Length in 32-bit words (5-15)
    pub ihl: u8,
    /// Type of service
    pub tos: u8,
    /// Total packet length (header + data) in bytes
    pub total_length: u16,
    /// Identification field for fragmentation
    pub identification: u16,
    /// DF / MF bits as they appear in the flags/offset word
    pub flags: u16,
    /// Fragment offset in 8-byte blocks
    pub fragment_offset: u16,
    /// Time To Live (hops)
    pub ttl: u8,
    /// Protocol number (ICMP=1, TCP=6, UDP=17)
    pub protocol: u8,
    /// Source IP address
    pub src_ip: Ipv4Addr,
    /// Destination IP address
    pub dest_ip: Ipv4Addr,
}

impl Ipv4Header {
    /// Create a new IPv4 header with common defaults
    ///
    /// # Arguments
    /// * `src_ip` - Source IP address
    /// * `dest_ip` - Destination IP address
    /// * `protocol` - Protocol number (use `protocol::*` constants)
    /// * `payload_len` - Length of the payload data
    pub fn new(src_ip: Ipv4Addr, dest_ip: Ipv4Addr, protocol: u8, payload_len: u16) -> Self {
        Self {
            ihl: 5, // 5 * 4 = 20 bytes (minimum header size)
            tos: 0,
            total_length: MIN_HEADER_SIZE as u16 + payload_len,
            identification: 0,
            flags: 0,
            fragment_offset: 0,
            ttl: IP_TTL,
            protocol,
            src_ip,
            dest_ip,
        }
    }

    /// Parse and validate an IPv4 header
    ///
    /// # Validation
    /// - Checks minimum length
    /// - Validates version field (must be 4)
    /// - Validates IHL (must be >= 5)
    /// - Validates total_length against the header and the received bytes
    /// - Verifies header checksum
    pub fn from_bytes(data: &[u8]) -> Result<Self, Ipv4Error> {
        if data.len() < MIN_HEADER_SIZE {
            return Err(Ipv4Error::PacketTooShort);
        }

        let version = data[0] >> 4;
        let ihl = data[0] & 0x0F;
        if version != 4 {
            return Err(Ipv4Error::InvalidVersion(version));
        }
        if ihl < 5 {
            return Err(Ipv4Error::InvalidIhl(ihl));
        }

        let header_len = (ihl as usize) * 4;
        if data.len() < header_len {
            return Err(Ipv4Error::PacketTooShort);
        }

        let total_length = u16::from_be_bytes([data[2], data[3]]);
        if (total_length as usize) < header_len || (total_length as usize) > data.len() {
            return Err(Ipv4Error::InvalidLength);
        }

        if !checksum::verify(&[&data[..header_len]]) {
            return Err(Ipv4Error::ChecksumMismatch);
        }

        let flags_frag = u16::from_be_bytes([data[6], data[7]]);

        Ok(Self {
            ihl,
            tos: data[1],
            total_length,
            identification: u16::from_be_bytes([data[4], data[5]]),
            flags: flags_frag & !flags::OFFSET_MASK,
            fragment_offset: flags_frag & flags::OFFSET_MASK,
            ttl: data[8],
            protocol: data[9],
            src_ip: Ipv4Addr::new(data[12], data[13], data[14], data[15]),
            dest_ip: Ipv4Addr::new(data[16], data[17], data[18], data[19]),
        })
    }

    /// Write a 20-byte header with its checksum into `out`
    pub fn write(&self, out: &mut [u8]) {
        out[0] = (4 << 4) | 5;
        out[1] = self.tos;
        out[2..4].copy_from_slice(&self.total_length.to_be_bytes());
        out[4..6].copy_from_slice(&self.identification.to_be_bytes());
        let flags_frag = (self.flags & !flags::OFFSET_MASK) | (self.fragment_offset & flags::OFFSET_MASK);
        out[6..8].copy_from_slice(&flags_frag.to_be_bytes());
        out[8] = self.ttl;
        out[9] = self.protocol;
        out[10..12].copy_from_slice(&[0, 0]);
        out[12..16].copy_from_slice(&self.src_ip.octets());
        out[16..20].copy_from_slice(&self.dest_ip.octets());

        let sum = checksum::checksum(&[&out[..MIN_HEADER_SIZE]]);
        out[10..12].copy_from_slice(&sum.to_be_bytes());
    }

    /// Check if this packet is part of a fragmented datagram
    pub fn is_fragmented(&self) -> bool {
        (self.flags & flags::MORE_FRAGMENTS) != 0 || self.fragment_offset != 0
    }

    pub fn more_fragments(&self) -> bool {
        (self.flags & flags::MORE_FRAGMENTS) != 0
    }

    /// Get the header length in bytes
    pub fn header_length(&self) -> usize {
        (self.ihl as usize) * 4
    }
}

/// IPv4 Error Types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ipv4Error {
    /// Packet is too short to contain a valid header
    PacketTooShort,
    /// Invalid IP version (not 4)
    InvalidVersion(u8),
    /// Invalid IHL (Internet Header Length < 5)
    InvalidIhl(u8),
    /// Invalid total length field
    InvalidLength,
    /// Header checksum mismatch
    ChecksumMismatch,
}

impl fmt::Display for Ipv4Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Ipv4Error::PacketTooShort => write!(f, "Packet too short"),
            Ipv4Error::InvalidVersion(v) => write!(f, "Invalid IP version: {}", v),
            Ipv4Error::InvalidIhl(ihl) => write!(f, "Invalid IHL: {}", ihl),
            Ipv4Error::InvalidLength => write!(f, "Invalid total length"),
            Ipv4Error::ChecksumMismatch => write!(f, "Checksum mismatch"),
        }
    }
}

/// Addressing of a received datagram, handed to the transport layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpMeta {
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    pub protocol: u8,
    /// Interface the datagram arrived on
    pub iface: usize,
}

/// Result of a routing decision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Route {
    /// Source address to put in the header
    pub src: Ipv4Addr,
    /// Address to resolve with ARP (the destination or the gateway)
    pub next_hop: Ipv4Addr,
    /// Outgoing interface
    pub iface: usize,
}

/// Handle a datagram received on `iface` (Ethernet header already stripped)
pub(crate) fn rx(stack: &NetStack, iface: usize, mut pkt: PacketBuffer) {
    let header = match Ipv4Header::from_bytes(pkt.data()) {
        Ok(header) => header,
        Err(e) => {
            debug!("ip: dropping packet: {}", e);
            return;
        }
    };

    // Drop link-layer padding
    pkt.truncate(header.total_length as usize);

    if !stack.accepts(iface, header.dest_ip) {
        trace!("ip: {} is not for us", header.dest_ip);
        return;
    }

    let meta = IpMeta {
        src: header.src_ip,
        dst: header.dest_ip,
        protocol: header.protocol,
        iface,
    };

    if !header.is_fragmented() {
        if pkt.remove_header(header.header_length()).is_err() {
            return;
        }
        dispatch(stack, meta, pkt);
        return;
    }

    let key = FragmentKey {
        src: header.src_ip,
        dst: header.dest_ip,
        protocol: header.protocol,
        id: header.identification,
    };
    // Assemble under the lock, dispatch after releasing it
    let assembled = stack.reassembly.lock().insert(key, &header, pkt);
    if let Some(mut datagram) = assembled {
        trace!("ip: reassembled {} bytes from {}", datagram.len(), meta.src);
        // The header comes from the first fragment, whose IHL may differ
        let header_len = (datagram.data()[0] & 0x0F) as usize * 4;
        if datagram.remove_header(header_len).is_ok() {
            dispatch(stack, meta, datagram);
        }
    }
}

/// Hand a complete datagram payload to its transport protocol
fn dispatch(stack: &NetStack, meta: IpMeta, pkt: PacketBuffer) {
    match meta.protocol {
        protocol::ICMP => icmp::rx(stack, meta, pkt),
        protocol::UDP => udp::rx(stack, meta, pkt),
        protocol::TCP => tcp::input::rx(stack, meta, pkt),
        other => trace!("ip: unsupported protocol {}", other),
    }
}

/// Payload bytes carried by each non-final fragment on a link with `mtu`
///
/// Fragment payloads must be multiples of 8 bytes, except the last. A link
/// too small to carry 8 bytes after the header cannot fragment at all.
fn fragment_size(mtu: usize) -> Result<usize, NetError> {
    match mtu.checked_sub(MIN_HEADER_SIZE).map(|room| room & !7) {
        Some(chunk) if chunk > 0 => Ok(chunk),
        _ => Err(NetError::MsgSize),
    }
}

/// Send `payload` from `src` to `dst`, fragmenting to the interface MTU
///
/// `src` may be unspecified, in which case the outgoing interface's address
/// is used.
pub(crate) fn tx(
    stack: &NetStack,
    mut payload: PacketBuffer,
    src: Ipv4Addr,
    dst: Ipv4Addr,
    proto: u8,
) -> Result<(), NetError> {
    if payload.len() > MAX_PAYLOAD_SIZE {
        return Err(NetError::MsgSize);
    }

    let route = stack.route(src, dst).ok_or_else(|| {
        debug!("ip: no route to {}", dst);
        NetError::NoRoute
    })?;
    let mtu = stack.interface(route.iface).map(|i| i.mtu).ok_or(NetError::NoRoute)?;

    let mut header = Ipv4Header::new(route.src, dst, proto, 0);
    header.identification = stack.next_ip_id();

    if MIN_HEADER_SIZE + payload.len() <= mtu {
        header.total_length = (MIN_HEADER_SIZE + payload.len()) as u16;
        header.write(payload.add_header(MIN_HEADER_SIZE)?);
        return output(stack, &route, dst, payload);
    }

    let chunk = fragment_size(mtu)?;
    let data = payload.data();
    let mut offset = 0;
    let mut result = Ok(());

    while offset < data.len() {
        let end = (offset + chunk).min(data.len());
        let mut fragment = PacketBuffer::alloc(MAX_HDRLEN_IP + (end - offset));
        fragment.reserve_headroom(MAX_HDRLEN_IP)?;
        fragment.append(&data[offset..end])?;

        header.total_length = (MIN_HEADER_SIZE + end - offset) as u16;
        header.fragment_offset = (offset / 8) as u16;
        header.flags = if end < data.len() { flags::MORE_FRAGMENTS } else { 0 };
        header.write(fragment.add_header(MIN_HEADER_SIZE)?);

        trace!("ip: fragment id {} offset {} len {}", header.identification, offset, end - offset);
        if let Err(e) = output(stack, &route, dst, fragment) {
            result = Err(e);
        }
        offset = end;
    }
    result
}

/// Resolve the next hop and send one datagram
fn output(stack: &NetStack, route: &Route, dst: Ipv4Addr, datagram: PacketBuffer) -> Result<(), NetError> {
    let is_broadcast = stack
        .interface(route.iface)
        .map(|i| dst == Ipv4Addr::BROADCAST || dst == i.broadcast())
        .unwrap_or(false);

    if is_broadcast {
        // Broadcasts need no resolution
        return ethernet::tx(stack, route.iface, BROADCAST_MAC, ETHERTYPE_IPV4, datagram);
    }
    arp::output(stack, route.iface, route.next_hop, ETHERTYPE_IPV4, datagram)
}
