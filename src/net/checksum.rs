//! Internet checksum (RFC 1071)
//!
//! The 16-bit one's complement of the one's complement sum of the data taken as
//! big-endian words. Input may be split across several slices (pseudo-header,
//! header, payload); an odd byte at the end of one slice pairs with the first
//! byte of the next.

use core::net::Ipv4Addr;

/// Fold `parts` into a 16-bit one's complement sum
pub fn ones_complement_sum(parts: &[&[u8]]) -> u16 {
    let mut sum: u32 = 0;
    let mut pending: Option<u8> = None;

    for part in parts {
        let mut bytes = part.iter();
        if let Some(hi) = pending.take() {
            match bytes.next() {
                Some(&lo) => sum += u16::from_be_bytes([hi, lo]) as u32,
                None => {
                    pending = Some(hi);
                    continue;
                }
            }
        }
        let rest = bytes.as_slice();
        let mut chunks = rest.chunks_exact(2);
        for chunk in &mut chunks {
            sum += u16::from_be_bytes([chunk[0], chunk[1]]) as u32;
            if sum > 0xFFFF_0000 {
                sum = (sum & 0xFFFF) + (sum >> 16);
            }
        }
        if let [last] = chunks.remainder() {
            pending = Some(*last);
        }
    }
    if let Some(hi) = pending {
        sum += u16::from_be_bytes([hi, 0]) as u32;
    }

    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    sum as u16
}

/// Checksum to place in a header
///
/// A computed value of 0 is sent as 0xFFFF, which is the same number in one's
/// complement arithmetic and keeps 0 free to mean "not computed" for UDP.
pub fn checksum(parts: &[&[u8]]) -> u16 {
    match !ones_complement_sum(parts) {
        0 => 0xFFFF,
        sum => sum,
    }
}

/// Check data that already carries its checksum field
pub fn verify(parts: &[&[u8]]) -> bool {
    !ones_complement_sum(parts) == 0
}

/// TCP/UDP pseudo-header
pub fn pseudo_header(src: Ipv4Addr, dst: Ipv4Addr, protocol: u8, length: u16) -> [u8; 12] {
    let mut hdr = [0u8; 12];
    hdr[0..4].copy_from_slice(&src.octets());
    hdr[4..8].copy_from_slice(&dst.octets());
    hdr[9] = protocol;
    hdr[10..12].copy_from_slice(&length.to_be_bytes());
    hdr
}
