//! ICMP (Internet Control Message Protocol) Implementation
//! RFC 792 - https://www.rfc-editor.org/rfc/rfc792
//!
//! Only echo is handled: requests are answered in place, replies are logged.
//! Everything else is dropped.

use alloc::vec::Vec;
use core::fmt;

use log::{debug, trace};

use crate::net::buffer::PacketBuffer;
use crate::net::checksum;
use crate::net::ipv4::{self, protocol, IpMeta};
use crate::net::stack::NetStack;

/// ICMP message types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IcmpType {
    /// Echo Reply (Type 0)
    EchoReply,
    /// Destination Unreachable (Type 3)
    DestinationUnreachable,
    /// Echo Request (Type 8)
    EchoRequest,
    /// Time Exceeded (Type 11)
    TimeExceeded,
    /// Unknown type
    Unknown(u8),
}

impl From<u8> for IcmpType {
    fn from(value: u8) -> Self {
        match value {
            0 => IcmpType::EchoReply,
            3 => IcmpType::DestinationUnreachable,
            8 => IcmpType::EchoRequest,
            11 => IcmpType::TimeExceeded,
            other => IcmpType::Unknown(other),
        }
    }
}

impl From<IcmpType> for u8 {
    fn from(icmp_type: IcmpType) -> Self {
        match icmp_type {
            IcmpType::EchoReply => 0,
            IcmpType::DestinationUnreachable => 3,
            IcmpType::EchoRequest => 8,
            IcmpType::TimeExceeded => 11,
            IcmpType::Unknown(val) => val,
        }
    }
}

impl fmt::Display for IcmpType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IcmpType::EchoReply => write!(f, "Echo Reply"),
            IcmpType::DestinationUnreachable => write!(f, "Destination Unreachable"),
            IcmpType::EchoRequest => write!(f, "Echo Request"),
            IcmpType::TimeExceeded => write!(f, "Time Exceeded"),
            IcmpType::Unknown(val) => write!(f, "Unknown({})", val),
        }
    }
}

/// ICMP parsing errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IcmpError {
    /// Packet too short (minimum 8 bytes)
    PacketTooShort,
    /// Invalid checksum
    InvalidChecksum,
}

impl fmt::Display for IcmpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IcmpError::PacketTooShort => write!(f, "ICMP packet too short"),
            IcmpError::InvalidChecksum => write!(f, "Invalid ICMP checksum"),
        }
    }
}

/// ICMP echo header
///
/// Format:
/// ```text
/// [Type (1)][Code (1)][Checksum (2)]
/// [Identifier (2)][Sequence (2)][Data (variable)]
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IcmpHeader {
    pub icmp_type: IcmpType,
    pub code: u8,
    pub identifier: u16,
    pub sequence: u16,
}

/// Minimum ICMP packet size (header only)
pub const HEADER_SIZE: usize = 8;

impl IcmpHeader {
    /// Parse the header of a complete ICMP message, verifying its checksum
    pub fn from_bytes(data: &[u8]) -> Result<Self, IcmpError> {
        if data.len() < HEADER_SIZE {
            return Err(IcmpError::PacketTooShort);
        }
        if !checksum::verify(&[data]) {
            return Err(IcmpError::InvalidChecksum);
        }

        Ok(Self {
            icmp_type: IcmpType::from(data[0]),
            code: data[1],
            identifier: u16::from_be_bytes([data[4], data[5]]),
            sequence: u16::from_be_bytes([data[6], data[7]]),
        })
    }
}

/// Build a complete echo request message
///
/// # Arguments
/// * `identifier` - Ping identifier (typically process ID)
/// * `sequence` - Sequence number
/// * `data` - Payload echoed back by the peer
pub fn build_echo_request(identifier: u16, sequence: u16, data: &[u8]) -> Vec<u8> {
    let mut message = Vec::with_capacity(HEADER_SIZE + data.len());
    message.push(u8::from(IcmpType::EchoRequest));
    message.push(0);
    message.extend_from_slice(&[0, 0]);
    message.extend_from_slice(&identifier.to_be_bytes());
    message.extend_from_slice(&sequence.to_be_bytes());
    message.extend_from_slice(data);

    let sum = checksum::checksum(&[&message]);
    message[2..4].copy_from_slice(&sum.to_be_bytes());
    message
}

/// Handle a received ICMP message
pub(crate) fn rx(stack: &NetStack, meta: IpMeta, mut pkt: PacketBuffer) {
    let header = match IcmpHeader::from_bytes(pkt.data()) {
        Ok(header) => header,
        Err(e) => {
            debug!("icmp: dropping message from {}: {}", meta.src, e);
            return;
        }
    };

    match header.icmp_type {
        IcmpType::EchoRequest => {
            trace!("icmp: echo request from {} seq {}", meta.src, header.sequence);

            // Turn the request into the reply in place
            let data = pkt.data_mut();
            data[0] = u8::from(IcmpType::EchoReply);
            data[2..4].copy_from_slice(&[0, 0]);
            let sum = checksum::checksum(&[data]);
            data[2..4].copy_from_slice(&sum.to_be_bytes());

            if let Err(e) = ipv4::tx(stack, pkt, meta.dst, meta.src, protocol::ICMP) {
                debug!("icmp: echo reply to {} failed: {}", meta.src, e);
            }
        }
        IcmpType::EchoReply => {
            debug!(
                "icmp: echo reply from {} id {} seq {}",
                meta.src, header.identifier, header.sequence
            );
        }
        other => trace!("icmp: ignoring {} from {}", other, meta.src),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_echo_request_roundtrip() {
        let message = build_echo_request(0x1234, 7, b"ping");
        let header = IcmpHeader::from_bytes(&message).unwrap();
        assert_eq!(header.icmp_type, IcmpType::EchoRequest);
        assert_eq!(header.identifier, 0x1234);
        assert_eq!(header.sequence, 7);
        assert_eq!(&message[HEADER_SIZE..], b"ping");
    }

    #[test]
    fn test_bad_messages_rejected() {
        assert_eq!(IcmpHeader::from_bytes(&[8, 0, 0, 0]), Err(IcmpError::PacketTooShort));

        let mut message = build_echo_request(1, 1, b"x");
        message[8] ^= 0xff;
        assert_eq!(IcmpHeader::from_bytes(&message), Err(IcmpError::InvalidChecksum));
    }
}
