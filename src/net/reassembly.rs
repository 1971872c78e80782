//! IPv4 fragment reassembly (RFC 815 hole list)
//!
//! Each datagram being reassembled has a context keyed by source, destination,
//! protocol and identification. The context keeps the byte ranges still missing
//! (holes) and the fragments received so far. It starts with one hole covering
//! `[0, INF)`; the final fragment (MF = 0) tells us where the datagram ends and
//! turns that hole into a finite one. The datagram is complete exactly when no
//! hole is left.

use alloc::vec::Vec;
use core::net::Ipv4Addr;

use log::{debug, warn};

use crate::net::buffer::PacketBuffer;
use crate::net::config::IPFRAG_TIMEOUT_SWEEPS;
use crate::net::ethernet;
use crate::net::ipv4::{Ipv4Header, MAX_PACKET_SIZE, MIN_HEADER_SIZE};

/// Open end of the initial hole
const INF: u32 = u32::MAX;

/// Identity of a fragmented datagram
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentKey {
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    pub protocol: u8,
    pub id: u16,
}

/// Missing byte range `[start, end)`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Hole {
    start: u32,
    end: u32,
}

struct Fragment {
    offset: u32,
    payload: PacketBuffer,
}

struct Context {
    key: FragmentKey,
    holes: Vec<Hole>,
    fragments: Vec<Fragment>,
    /// Header of the offset-0 fragment
    header: Option<Vec<u8>>,
    /// Payload length, known once the last fragment arrived
    data_len: u32,
    /// Remaining sweeps before the context is dropped
    timeout: i32,
    /// Creation order, used to pick the eviction victim
    serial: u64,
}

impl Context {
    fn new(key: FragmentKey, serial: u64) -> Self {
        Self {
            key,
            holes: alloc::vec![Hole { start: 0, end: INF }],
            fragments: Vec::new(),
            header: None,
            data_len: 0,
            timeout: IPFRAG_TIMEOUT_SWEEPS,
            serial,
        }
    }

    /// Punch `[start, end)` out of the hole list
    ///
    /// # Returns
    /// `true` if the range covered any missing byte
    fn fill(&mut self, start: u32, end: u32) -> bool {
        let mut covered = false;
        let mut holes = Vec::with_capacity(self.holes.len() + 1);
        for hole in self.holes.drain(..) {
            if start >= hole.end || end <= hole.start {
                holes.push(hole);
                continue;
            }
            covered = true;
            if start > hole.start {
                holes.push(Hole { start: hole.start, end: start });
            }
            if end < hole.end {
                holes.push(Hole { start: end, end: hole.end });
            }
        }
        self.holes = holes;
        covered
    }

    /// The datagram ends at `len`: bound the open hole
    fn set_length(&mut self, len: u32) {
        self.data_len = len;
        self.holes.retain_mut(|hole| {
            if hole.end == INF {
                hole.end = len;
            }
            hole.start < hole.end
        });
    }

    /// Build the complete datagram (header included)
    ///
    /// Fails if the offset-0 header plus the payload exceeds the largest
    /// datagram IP can describe.
    fn assemble(self) -> Option<PacketBuffer> {
        let header = self.header?;
        let header_len = header.len();
        let data_len = self.data_len as usize;
        let Ok(total) = u16::try_from(header_len + data_len) else {
            debug!(
                "ip: reassembled datagram {} from {} is {} bytes, dropped",
                self.key.id,
                self.key.src,
                header_len + data_len
            );
            return None;
        };

        let mut datagram = PacketBuffer::alloc(ethernet::HEADER_SIZE + header_len + data_len);
        datagram.reserve_headroom(ethernet::HEADER_SIZE).ok()?;
        datagram.append(&header).ok()?;

        for fragment in &self.fragments {
            let offset = fragment.offset as usize;
            if offset >= data_len {
                continue;
            }
            let bytes = fragment.payload.data();
            let take = bytes.len().min(data_len - offset);
            datagram.copy_in(&bytes[..take], header_len + offset).ok()?;
        }

        // Patch length and fragment fields, then the checksum
        let raw = datagram.data_mut();
        raw[2..4].copy_from_slice(&total.to_be_bytes());
        raw[6] &= 0x40; // keep DF only
        raw[7] = 0;
        raw[10..12].copy_from_slice(&[0, 0]);
        let sum = crate::net::checksum::checksum(&[&raw[..header_len]]);
        raw[10..12].copy_from_slice(&sum.to_be_bytes());

        Some(datagram)
    }
}

/// Contexts of all datagrams currently being reassembled
pub(crate) struct ReassemblyTable {
    contexts: Vec<Context>,
    capacity: usize,
    serial: u64,
}

impl ReassemblyTable {
    pub fn new(capacity: usize) -> Self {
        Self {
            contexts: Vec::new(),
            capacity: capacity.max(1),
            serial: 0,
        }
    }

    /// Number of live contexts
    pub fn len(&self) -> usize {
        self.contexts.len()
    }

    fn context(&mut self, key: FragmentKey) -> usize {
        if let Some(idx) = self.contexts.iter().position(|c| c.key == key && c.timeout > 0) {
            return idx;
        }

        if self.contexts.len() >= self.capacity {
            // Slots exhausted: recycle the oldest context
            if let Some(oldest) = self
                .contexts
                .iter()
                .enumerate()
                .min_by_key(|(_, c)| c.serial)
                .map(|(i, _)| i)
            {
                let victim = self.contexts.swap_remove(oldest);
                warn!(
                    "ip: reassembly slots full, dropping datagram {} from {}",
                    victim.key.id, victim.key.src
                );
            }
        }

        self.serial += 1;
        self.contexts.push(Context::new(key, self.serial));
        self.contexts.len() - 1
    }

    /// Add one fragment (`datagram` still carries its IP header)
    ///
    /// # Returns
    /// The reassembled datagram, header included, once the last hole is filled
    pub fn insert(&mut self, key: FragmentKey, header: &Ipv4Header, mut datagram: PacketBuffer) -> Option<PacketBuffer> {
        let header_len = header.header_length();
        let first = header.fragment_offset as u32 * 8;
        let more = header.more_fragments();

        let head = if first == 0 {
            Some(datagram.data().get(..header_len)?.to_vec())
        } else {
            None
        };
        datagram.remove_header(header_len).ok()?;
        let len = datagram.len() as u32;

        if len == 0 && more {
            debug!("ip: dropping empty non-final fragment of {}", key.id);
            return None;
        }
        let end = first + len;
        // The offset-0 header decides the final size; no header is shorter
        if end as usize > MAX_PACKET_SIZE - MIN_HEADER_SIZE {
            debug!("ip: fragment of {} ends past the datagram limit", key.id);
            return None;
        }

        let idx = self.context(key);
        let ctx = &mut self.contexts[idx];

        if ctx.fill(first, end) {
            ctx.timeout = IPFRAG_TIMEOUT_SWEEPS;
            if head.is_some() {
                ctx.header = head;
            }
            ctx.fragments.push(Fragment {
                offset: first,
                payload: datagram,
            });
        }
        if !more {
            ctx.set_length(end);
        }

        if !ctx.holes.is_empty() {
            return None;
        }
        let ctx = self.contexts.swap_remove(idx);
        ctx.assemble()
    }

    /// Age every context by one sweep
    ///
    /// # Returns
    /// Number of contexts freed
    pub fn sweep(&mut self) -> usize {
        let before = self.contexts.len();
        self.contexts.retain_mut(|ctx| {
            ctx.timeout -= 1;
            let keep = ctx.timeout > 0 && !ctx.holes.is_empty();
            if !keep {
                debug!("ip: reassembly of {} from {} timed out", ctx.key.id, ctx.key.src);
            }
            keep
        });
        before - self.contexts.len()
    }
}
