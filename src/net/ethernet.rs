//Ethernet Frame Layer (OSI Layer 2)
//
//Handles Ethernet header parsing, building, and dispatching.
//Frame structure: [Dest MAC (6)][Src MAC (6)][EtherType (2)][Payload (46-1500)]
//The CRC is generated and stripped by the device.

use core::fmt;

use log::{debug, trace};

use crate::net::arp;
use crate::net::buffer::PacketBuffer;
use crate::net::error::NetError;
use crate::net::ipv4;
use crate::net::stack::NetStack;

/// EtherType constants
pub const ETHERTYPE_IPV4: u16 = 0x0800;
pub const ETHERTYPE_ARP: u16 = 0x0806;

/// Broadcast MAC address (FF:FF:FF:FF:FF:FF)
pub const BROADCAST_MAC: [u8; 6] = [0xFF; 6];

/// Minimum Ethernet payload size (padding required if smaller)
pub const MIN_PAYLOAD_SIZE: usize = 46;

/// Ethernet frame header size (excluding CRC)
pub const HEADER_SIZE: usize = 14;

/// Shortest frame handed to the device (header plus minimum payload)
pub const MIN_FRAME_SIZE: usize = HEADER_SIZE + MIN_PAYLOAD_SIZE;

/// Errors that can occur while parsing an Ethernet header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EthernetError {
    /// Frame is too short to be valid
    FrameTooShort,
}

impl fmt::Display for EthernetError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EthernetError::FrameTooShort => write!(f, "frame shorter than an Ethernet header"),
        }
    }
}

/// Ethernet II header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EthernetHeader {
    /// Destination MAC address
    pub dest_mac: [u8; 6],
    /// Source MAC address
    pub src_mac: [u8; 6],
    /// EtherType field - indicates protocol of payload
    pub ethertype: u16,
}

impl EthernetHeader {
    /// Parse an Ethernet header from the front of a raw frame
    pub fn from_bytes(data: &[u8]) -> Result<Self, EthernetError> {
        if data.len() < HEADER_SIZE {
            return Err(EthernetError::FrameTooShort);
        }

        let mut dest_mac = [0u8; 6];
        dest_mac.copy_from_slice(&data[0..6]);

        let mut src_mac = [0u8; 6];
        src_mac.copy_from_slice(&data[6..12]);

        let ethertype = u16::from_be_bytes([data[12], data[13]]);

        Ok(Self {
            dest_mac,
            src_mac,
            ethertype,
        })
    }

    /// Write the header into `out` (at least [`HEADER_SIZE`] bytes)
    pub fn write(&self, out: &mut [u8]) {
        out[0..6].copy_from_slice(&self.dest_mac);
        out[6..12].copy_from_slice(&self.src_mac);
        out[12..14].copy_from_slice(&self.ethertype.to_be_bytes());
    }

    /// Check if the frame is a broadcast frame
    pub fn is_broadcast(&self) -> bool {
        self.dest_mac == BROADCAST_MAC
    }
}

/// Handle one received frame: filter by destination and dispatch on EtherType
pub(crate) fn rx(stack: &NetStack, iface: usize, mut frame: PacketBuffer) {
    let Some(interface) = stack.interface(iface) else {
        return;
    };

    let header = match EthernetHeader::from_bytes(frame.data()) {
        Ok(header) => header,
        Err(e) => {
            debug!("eth: {}: dropping frame: {}", interface.name, e);
            return;
        }
    };

    // Frame filtering: only process unicast to us or broadcast
    if !header.is_broadcast() && header.dest_mac != interface.mac {
        trace!("eth: {}: frame for {} is not ours", interface.name, format_mac(&header.dest_mac));
        return;
    }

    if frame.remove_header(HEADER_SIZE).is_err() {
        return;
    }

    match header.ethertype {
        ETHERTYPE_ARP => arp::rx(stack, iface, frame),
        ETHERTYPE_IPV4 => ipv4::rx(stack, iface, frame),
        other => trace!("eth: {}: unknown EtherType 0x{:04X}", interface.name, other),
    }
}

/// Prepend the Ethernet header and hand the frame to the device
///
/// # Arguments
/// * `dest_mac` - Resolved destination hardware address
/// * `ethertype` - Protocol of the payload
///
/// # Returns
/// The device error if transmission failed. The frame is dropped either way;
/// this layer never retries.
pub(crate) fn tx(
    stack: &NetStack,
    iface: usize,
    dest_mac: [u8; 6],
    ethertype: u16,
    mut frame: PacketBuffer,
) -> Result<(), NetError> {
    let interface = stack.interface(iface).ok_or(NetError::NoRoute)?;

    let header = EthernetHeader {
        dest_mac,
        src_mac: interface.mac,
        ethertype,
    };
    header.write(frame.add_header(HEADER_SIZE)?);

    trace!(
        "eth: {}: tx {} bytes to {} type 0x{:04X}",
        interface.name,
        frame.len(),
        format_mac(&dest_mac),
        ethertype
    );

    let result = {
        let mut device = interface.device.lock();
        if frame.len() < MIN_FRAME_SIZE {
            // Pad payload to the minimum frame size
            let mut padded = [0u8; MIN_FRAME_SIZE];
            padded[..frame.len()].copy_from_slice(frame.data());
            device.transmit(&padded)
        } else {
            device.transmit(frame.data())
        }
    };

    result.map_err(|e| {
        debug!("eth: {}: transmit failed: {:?}", interface.name, e);
        NetError::from(e)
    })
}

/// Format a MAC address for display
pub fn format_mac(mac: &[u8; 6]) -> MacDisplay<'_> {
    MacDisplay(mac)
}

/// Display adapter returned by [`format_mac`]
pub struct MacDisplay<'a>(&'a [u8; 6]);

impl fmt::Display for MacDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mac = self.0;
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            mac[0], mac[1], mac[2], mac[3], mac[4], mac[5]
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::string::ToString;

    #[test]
    fn test_header_parse_and_write() {
        let raw = [
            0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, // dst
            0x52, 0x54, 0x00, 0x12, 0x34, 0x56, // src
            0x08, 0x06, // ARP
        ];
        let header = EthernetHeader::from_bytes(&raw).unwrap();
        assert!(header.is_broadcast());
        assert_eq!(header.ethertype, ETHERTYPE_ARP);

        let mut out = [0u8; HEADER_SIZE];
        header.write(&mut out);
        assert_eq!(out, raw);
    }

    #[test]
    fn test_short_frame_rejected() {
        assert_eq!(EthernetHeader::from_bytes(&[0u8; 13]), Err(EthernetError::FrameTooShort));
    }

    #[test]
    fn test_format_mac() {
        let mac = [0x52, 0x54, 0x00, 0xab, 0xcd, 0xef];
        assert_eq!(format_mac(&mac).to_string(), "52:54:00:AB:CD:EF");
    }
}
