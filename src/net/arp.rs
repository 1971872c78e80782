//! ARP (Address Resolution Protocol) - RFC 826
//!
//! Maps IPv4 addresses to MAC addresses on local networks.
//! Packet format: [HW Type (2)][Proto Type (2)][HW Len (1)][Proto Len (1)]
//!                [Operation (2)][Sender MAC (6)][Sender IP (4)]
//!                [Target MAC (6)][Target IP (4)]
//!
//! The table has a fixed number of slots. An entry whose timeout is 0 is free.
//! Frames sent to an address that is still being resolved wait in the entry's
//! pending queue and go out in submission order once the reply arrives.

use alloc::collections::VecDeque;
use alloc::vec::Vec;
use core::fmt;
use core::net::Ipv4Addr;

use log::{debug, trace, warn};

use crate::net::buffer::PacketBuffer;
use crate::net::config::{ARP_PERMANENT, ARP_TIMEOUT_SWEEPS};
use crate::net::error::NetError;
use crate::net::ethernet::{self, format_mac, BROADCAST_MAC, ETHERTYPE_ARP, ETHERTYPE_IPV4};
use crate::net::stack::NetStack;

/// ARP hardware type for Ethernet
pub const HW_TYPE_ETHERNET: u16 = 1;

/// ARP protocol type for IPv4
pub const PROTO_TYPE_IPV4: u16 = ETHERTYPE_IPV4;

/// ARP operation codes
pub const ARP_REQUEST: u16 = 1;
pub const ARP_REPLY: u16 = 2;

/// ARP packet size (fixed at 28 bytes)
pub const ARP_PACKET_SIZE: usize = 28;

/// Errors that can occur while parsing an ARP packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArpError {
    /// Packet is too short to be valid
    PacketTooShort,
    /// Invalid hardware type (not Ethernet)
    InvalidHardwareType,
    /// Invalid protocol type (not IPv4)
    InvalidProtocolType,
    /// Invalid hardware address length
    InvalidHardwareLength,
    /// Invalid protocol address length
    InvalidProtocolLength,
    /// Unknown operation code
    UnknownOperation,
}

impl fmt::Display for ArpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArpError::PacketTooShort => write!(f, "packet too short"),
            ArpError::InvalidHardwareType => write!(f, "hardware type is not Ethernet"),
            ArpError::InvalidProtocolType => write!(f, "protocol type is not IPv4"),
            ArpError::InvalidHardwareLength => write!(f, "bad hardware address length"),
            ArpError::InvalidProtocolLength => write!(f, "bad protocol address length"),
            ArpError::UnknownOperation => write!(f, "unknown operation"),
        }
    }
}

/// ARP packet structure
#[derive(Debug, Clone, PartialEq)]
pub struct ArpPacket {
    /// Operation (1 = request, 2 = reply)
    pub operation: u16,
    /// Sender MAC address
    pub sender_mac: [u8; 6],
    /// Sender IP address
    pub sender_ip: Ipv4Addr,
    /// Target MAC address
    pub target_mac: [u8; 6],
    /// Target IP address
    pub target_ip: Ipv4Addr,
}

impl ArpPacket {
    /// Create a new ARP request packet
    ///
    /// # Arguments
    /// * `sender_mac` - Our MAC address
    /// * `sender_ip` - Our IP address
    /// * `target_ip` - The IP address we want to resolve
    pub fn new_request(sender_mac: [u8; 6], sender_ip: Ipv4Addr, target_ip: Ipv4Addr) -> Self {
        Self {
            operation: ARP_REQUEST,
            sender_mac,
            sender_ip,
            target_mac: [0; 6], // Unknown, set to zeros
            target_ip,
        }
    }

    /// Parse an ARP packet from raw bytes
    ///
    /// Only Ethernet/IPv4 requests and replies are accepted.
    pub fn from_bytes(data: &[u8]) -> Result<Self, ArpError> {
        if data.len() < ARP_PACKET_SIZE {
            return Err(ArpError::PacketTooShort);
        }

        if u16::from_be_bytes([data[0], data[1]]) != HW_TYPE_ETHERNET {
            return Err(ArpError::InvalidHardwareType);
        }
        if u16::from_be_bytes([data[2], data[3]]) != PROTO_TYPE_IPV4 {
            return Err(ArpError::InvalidProtocolType);
        }
        if data[4] != 6 {
            return Err(ArpError::InvalidHardwareLength);
        }
        if data[5] != 4 {
            return Err(ArpError::InvalidProtocolLength);
        }

        let operation = u16::from_be_bytes([data[6], data[7]]);
        if operation != ARP_REQUEST && operation != ARP_REPLY {
            return Err(ArpError::UnknownOperation);
        }

        let mut sender_mac = [0u8; 6];
        sender_mac.copy_from_slice(&data[8..14]);
        let sender_ip = Ipv4Addr::new(data[14], data[15], data[16], data[17]);

        let mut target_mac = [0u8; 6];
        target_mac.copy_from_slice(&data[18..24]);
        let target_ip = Ipv4Addr::new(data[24], data[25], data[26], data[27]);

        Ok(Self {
            operation,
            sender_mac,
            sender_ip,
            target_mac,
            target_ip,
        })
    }

    /// Write the packet into `out` (at least [`ARP_PACKET_SIZE`] bytes)
    pub fn write(&self, out: &mut [u8]) {
        out[0..2].copy_from_slice(&HW_TYPE_ETHERNET.to_be_bytes());
        out[2..4].copy_from_slice(&PROTO_TYPE_IPV4.to_be_bytes());
        out[4] = 6;
        out[5] = 4;
        out[6..8].copy_from_slice(&self.operation.to_be_bytes());
        out[8..14].copy_from_slice(&self.sender_mac);
        out[14..18].copy_from_slice(&self.sender_ip.octets());
        out[18..24].copy_from_slice(&self.target_mac);
        out[24..28].copy_from_slice(&self.target_ip.octets());
    }

    /// Check if this is an ARP request
    pub fn is_request(&self) -> bool {
        self.operation == ARP_REQUEST
    }
}

/// A frame waiting for its next hop to resolve
pub(crate) struct PendingFrame {
    pub ethertype: u16,
    pub iface: usize,
    pub frame: PacketBuffer,
}

/// One ARP table slot
pub(crate) struct ArpEntry {
    ip: Ipv4Addr,
    mac: [u8; 6],
    /// Remaining sweeps; 0 = free slot, [`ARP_PERMANENT`] = never expires
    timeout: u16,
    iface: usize,
    pending: VecDeque<PendingFrame>,
}

impl ArpEntry {
    fn empty() -> Self {
        Self {
            ip: Ipv4Addr::UNSPECIFIED,
            mac: [0; 6],
            timeout: 0,
            iface: 0,
            pending: VecDeque::new(),
        }
    }

    fn is_valid(&self) -> bool {
        self.timeout > 0
    }
}

/// Snapshot of a table entry for display
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArpEntryInfo {
    pub ip: Ipv4Addr,
    pub mac: [u8; 6],
    pub timeout: u16,
    pub pending: usize,
}

impl ArpEntryInfo {
    pub fn is_permanent(&self) -> bool {
        self.timeout == ARP_PERMANENT
    }
}

/// Outcome of [`ArpTable::resolve`]
pub(crate) enum Resolution {
    /// Address known: send the frame now
    Found([u8; 6], PendingFrame),
    /// Resolution already in flight; the frame was queued behind the others
    Queued,
    /// New entry created and the frame queued; an ARP request must go out
    NotFound,
    /// Every slot is permanent; the frame was dropped
    TableFull,
}

/// Fixed-capacity ARP table with a round-robin write cursor
pub(crate) struct ArpTable {
    entries: Vec<ArpEntry>,
    next_register: usize,
}

impl ArpTable {
    pub fn new(capacity: usize) -> Self {
        let mut entries = Vec::with_capacity(capacity.max(1));
        entries.resize_with(capacity.max(1), ArpEntry::empty);
        Self {
            entries,
            next_register: 0,
        }
    }

    fn find(&mut self, ip: Ipv4Addr) -> Option<&mut ArpEntry> {
        self.entries.iter_mut().find(|e| e.is_valid() && e.ip == ip)
    }

    /// Take the slot under the cursor, skipping permanent entries
    ///
    /// Frames still queued on a recycled slot are dropped.
    fn allocate(&mut self) -> Option<usize> {
        let len = self.entries.len();
        for _ in 0..len {
            let idx = self.next_register;
            self.next_register = (self.next_register + 1) % len;
            let entry = &mut self.entries[idx];
            if entry.timeout == ARP_PERMANENT {
                continue;
            }
            if !entry.pending.is_empty() {
                warn!(
                    "arp: evicting unresolved {} with {} queued frame(s)",
                    entry.ip,
                    entry.pending.len()
                );
                entry.pending.clear();
            }
            return Some(idx);
        }
        None
    }

    /// Look up `ip`, queueing `frame` if it cannot go out yet
    pub fn resolve(&mut self, ip: Ipv4Addr, frame: PendingFrame) -> Resolution {
        if let Some(entry) = self.find(ip) {
            if entry.pending.is_empty() {
                return Resolution::Found(entry.mac, frame);
            }
            // Keep submission order behind the frames already waiting
            entry.pending.push_back(frame);
            return Resolution::Queued;
        }

        let Some(idx) = self.allocate() else {
            return Resolution::TableFull;
        };
        let entry = &mut self.entries[idx];
        entry.ip = ip;
        entry.mac = [0; 6];
        entry.timeout = ARP_TIMEOUT_SWEEPS;
        entry.iface = frame.iface;
        entry.pending.push_back(frame);
        Resolution::NotFound
    }

    /// Record `ip -> mac`, returning the frames that were waiting on it
    ///
    /// `permanent` is applied exactly: registering a static entry again as
    /// dynamic turns it back into an expiring one.
    pub fn register(
        &mut self,
        ip: Ipv4Addr,
        mac: [u8; 6],
        iface: usize,
        permanent: bool,
    ) -> VecDeque<PendingFrame> {
        let timeout = if permanent { ARP_PERMANENT } else { ARP_TIMEOUT_SWEEPS };

        if let Some(entry) = self.find(ip) {
            entry.timeout = timeout;
            entry.mac = mac;
            entry.iface = iface;
            return core::mem::take(&mut entry.pending);
        }

        if let Some(idx) = self.allocate() {
            let entry = &mut self.entries[idx];
            entry.ip = ip;
            entry.mac = mac;
            entry.timeout = timeout;
            entry.iface = iface;
        } else {
            warn!("arp: table full of static entries, cannot add {}", ip);
        }
        VecDeque::new()
    }

    /// Record a mapping observed on the wire
    ///
    /// Static entries are never changed by traffic.
    pub fn learn(&mut self, ip: Ipv4Addr, mac: [u8; 6], iface: usize) -> VecDeque<PendingFrame> {
        if let Some(entry) = self.find(ip) {
            if entry.timeout == ARP_PERMANENT {
                return VecDeque::new();
            }
        }
        self.register(ip, mac, iface, false)
    }

    /// Resolved hardware address of `ip`
    pub fn lookup(&self, ip: Ipv4Addr) -> Option<[u8; 6]> {
        self.entries
            .iter()
            .find(|e| e.is_valid() && e.ip == ip && e.pending.is_empty())
            .map(|e| e.mac)
    }

    /// Age every dynamic entry by one sweep
    ///
    /// # Returns
    /// The still-unresolved addresses whose request must be re-broadcast
    pub fn sweep(&mut self) -> Vec<(usize, Ipv4Addr)> {
        let mut retry = Vec::new();
        for entry in self.entries.iter_mut() {
            if entry.timeout > 0 && entry.timeout != ARP_PERMANENT {
                entry.timeout -= 1;
            }
            if entry.timeout == 0 {
                if !entry.pending.is_empty() {
                    debug!("arp: {} unresolved, dropping {} frame(s)", entry.ip, entry.pending.len());
                    entry.pending.clear();
                }
            } else if !entry.pending.is_empty() {
                retry.push((entry.iface, entry.ip));
            }
        }
        retry
    }

    pub fn entries(&self) -> Vec<ArpEntryInfo> {
        self.entries
            .iter()
            .filter(|e| e.is_valid())
            .map(|e| ArpEntryInfo {
                ip: e.ip,
                mac: e.mac,
                timeout: e.timeout,
                pending: e.pending.len(),
            })
            .collect()
    }
}

/// Send queued frames now that their destination is known
fn flush(stack: &NetStack, mac: [u8; 6], frames: VecDeque<PendingFrame>) {
    for pending in frames {
        let _ = ethernet::tx(stack, pending.iface, mac, pending.ethertype, pending.frame);
    }
}

/// Register a mapping and send anything that was waiting for it
pub(crate) fn register(stack: &NetStack, ip: Ipv4Addr, mac: [u8; 6], iface: usize, permanent: bool) {
    let frames = stack.arp.lock().register(ip, mac, iface, permanent);
    flush(stack, mac, frames);
}

/// Broadcast a request for `target_ip` on `iface`
pub(crate) fn send_request(stack: &NetStack, iface: usize, target_ip: Ipv4Addr) {
    let Some(interface) = stack.interface(iface) else {
        return;
    };

    let mut frame = PacketBuffer::alloc(ethernet::HEADER_SIZE + ARP_PACKET_SIZE);
    if frame.reserve_headroom(ethernet::HEADER_SIZE + ARP_PACKET_SIZE).is_err() {
        return;
    }
    let Ok(body) = frame.add_header(ARP_PACKET_SIZE) else {
        return;
    };
    ArpPacket::new_request(interface.mac, interface.addr, target_ip).write(body);

    trace!("arp: who-has {} tell {}", target_ip, interface.addr);
    let _ = ethernet::tx(stack, iface, BROADCAST_MAC, ETHERTYPE_ARP, frame);
}

/// Send `frame` to `next_hop`, resolving its hardware address first
///
/// # Returns
/// `Ok(())` once the frame was sent or queued for resolution
pub(crate) fn output(
    stack: &NetStack,
    iface: usize,
    next_hop: Ipv4Addr,
    ethertype: u16,
    frame: PacketBuffer,
) -> Result<(), NetError> {
    let pending = PendingFrame { ethertype, iface, frame };
    let resolution = stack.arp.lock().resolve(next_hop, pending);

    match resolution {
        Resolution::Found(mac, pending) => ethernet::tx(stack, iface, mac, pending.ethertype, pending.frame),
        Resolution::Queued => Ok(()),
        Resolution::NotFound => {
            send_request(stack, iface, next_hop);
            Ok(())
        }
        Resolution::TableFull => Err(NetError::Fail),
    }
}

/// Handle an incoming ARP packet
pub(crate) fn rx(stack: &NetStack, iface: usize, mut frame: PacketBuffer) {
    let Some(interface) = stack.interface(iface) else {
        return;
    };

    let packet = match ArpPacket::from_bytes(frame.data()) {
        Ok(packet) => packet,
        Err(e) => {
            debug!("arp: {}: dropping packet: {}", interface.name, e);
            return;
        }
    };

    if packet.is_request() {
        if packet.target_ip != interface.addr {
            return;
        }

        let frames = stack.arp.lock().learn(packet.sender_ip, packet.sender_mac, iface);
        flush(stack, packet.sender_mac, frames);

        // Answer in place: swap sender and target
        let reply = ArpPacket {
            operation: ARP_REPLY,
            sender_mac: interface.mac,
            sender_ip: interface.addr,
            target_mac: packet.sender_mac,
            target_ip: packet.sender_ip,
        };
        frame.truncate(ARP_PACKET_SIZE);
        reply.write(frame.data_mut());

        trace!("arp: {} is-at {}", interface.addr, format_mac(&interface.mac));
        let _ = ethernet::tx(stack, iface, packet.sender_mac, ETHERTYPE_ARP, frame);
    } else {
        trace!("arp: reply {} is-at {}", packet.sender_ip, format_mac(&packet.sender_mac));
        let frames = stack.arp.lock().learn(packet.sender_ip, packet.sender_mac, iface);
        flush(stack, packet.sender_mac, frames);
    }
}

/// Periodic aging; re-broadcasts requests for entries still waiting
pub(crate) fn sweep(stack: &NetStack) {
    let retry = stack.arp.lock().sweep();
    for (iface, ip) in retry {
        send_request(stack, iface, ip);
    }
}
