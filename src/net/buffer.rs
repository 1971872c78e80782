//! Packet buffers
//!
//! A [`PacketBuffer`] owns a fixed byte region `[0, capacity)` and a window
//! `[head, tail)` of currently valid bytes. Each layer prepends its header into
//! the head-room on transmit and strips it on receive, so a packet moves through
//! the stack without being copied. Buffers are move-only: whoever holds one owns
//! it and dropping it frees it.
//!
//! ```text
//!  0          head                 tail           capacity
//!  |-headroom-|====== valid =======|---tailroom---|
//! ```

use alloc::boxed::Box;
use alloc::vec;
use alloc::vec::Vec;
use core::fmt;

use crate::net::ethernet;
use crate::net::ipv4;
use crate::net::tcp;

/// Worst-case header room for a TCP segment (Ethernet + IP + TCP, all with options)
pub const MAX_HDRLEN_TCP: usize = ethernet::HEADER_SIZE + ipv4::MAX_HEADER_SIZE + tcp::TCP_MAX_HEADER_SIZE;

/// Worst-case header room for a UDP datagram
pub const MAX_HDRLEN_UDP: usize = ethernet::HEADER_SIZE + ipv4::MAX_HEADER_SIZE + crate::net::udp::UDP_HEADER_SIZE;

/// Header room for anything carried directly in IP (ICMP, fragments)
pub const MAX_HDRLEN_IP: usize = ethernet::HEADER_SIZE + ipv4::MAX_HEADER_SIZE;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferError {
    /// Not enough head-room to prepend a header
    NoHeadroom,
    /// Not enough tail-room to grow the window
    NoTailroom,
    /// Tried to strip more bytes than the window holds
    Underflow,
    /// Head-room can only be reserved on an empty buffer
    NotEmpty,
}

impl fmt::Display for BufferError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BufferError::NoHeadroom => write!(f, "no head-room left"),
            BufferError::NoTailroom => write!(f, "no tail-room left"),
            BufferError::Underflow => write!(f, "window shorter than requested"),
            BufferError::NotEmpty => write!(f, "buffer already holds data"),
        }
    }
}

/// A packet buffer with head-room and tail-room
pub struct PacketBuffer {
    data: Box<[u8]>,
    head: usize,
    tail: usize,
    /// Invoked exactly once when the buffer is freed
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl PacketBuffer {
    /// Allocate a buffer of `size` bytes with an empty window at offset 0
    ///
    /// Capacity is fixed from here on; callers reserve worst-case head-room
    /// up front with [`reserve_headroom`](Self::reserve_headroom).
    pub fn alloc(size: usize) -> Self {
        Self {
            data: vec![0u8; size].into_boxed_slice(),
            head: 0,
            tail: 0,
            release: None,
        }
    }

    /// Allocate a buffer with `headroom` bytes reserved in front of `payload`
    pub fn with_payload(headroom: usize, payload: &[u8]) -> Self {
        let mut buf = Self::alloc(headroom + payload.len());
        buf.head = headroom;
        buf.tail = headroom + payload.len();
        buf.data[headroom..].copy_from_slice(payload);
        buf
    }

    /// Wrap a received frame; the whole vector becomes the valid window
    pub fn from_vec(frame: Vec<u8>) -> Self {
        let len = frame.len();
        Self {
            data: frame.into_boxed_slice(),
            head: 0,
            tail: len,
            release: None,
        }
    }

    /// Attach the callback run when this buffer is freed
    pub fn set_release(&mut self, release: Box<dyn FnOnce() + Send>) {
        self.release = Some(release);
    }

    /// Move the (empty) window `n` bytes forward so later layers can prepend into it
    pub fn reserve_headroom(&mut self, n: usize) -> Result<(), BufferError> {
        if self.head != self.tail {
            return Err(BufferError::NotEmpty);
        }
        if self.head + n > self.data.len() {
            return Err(BufferError::NoTailroom);
        }
        self.head += n;
        self.tail = self.head;
        Ok(())
    }

    /// Grow the window backward by `n` bytes and return the new header area
    pub fn add_header(&mut self, n: usize) -> Result<&mut [u8], BufferError> {
        if n > self.head {
            return Err(BufferError::NoHeadroom);
        }
        self.head -= n;
        Ok(&mut self.data[self.head..self.head + n])
    }

    /// Shrink the window from the front by `n` bytes
    pub fn remove_header(&mut self, n: usize) -> Result<(), BufferError> {
        if n > self.len() {
            return Err(BufferError::Underflow);
        }
        self.head += n;
        Ok(())
    }

    /// Copy `bytes` into the window at `offset` from its start, extending the tail if needed
    pub fn copy_in(&mut self, bytes: &[u8], offset: usize) -> Result<(), BufferError> {
        let start = self.head + offset;
        let end = start + bytes.len();
        if end > self.data.len() {
            return Err(BufferError::NoTailroom);
        }
        if start > self.tail {
            // Bytes between the old tail and `start` are part of the window now
            self.data[self.tail..start].fill(0);
        }
        self.data[start..end].copy_from_slice(bytes);
        self.tail = self.tail.max(end);
        Ok(())
    }

    /// Append `bytes` at the tail
    pub fn append(&mut self, bytes: &[u8]) -> Result<(), BufferError> {
        let len = self.len();
        self.copy_in(bytes, len)
    }

    /// Cut the window down to `len` bytes (drops link-layer padding)
    pub fn truncate(&mut self, len: usize) {
        if len < self.len() {
            self.tail = self.head + len;
        }
    }

    /// Valid bytes
    pub fn data(&self) -> &[u8] {
        &self.data[self.head..self.tail]
    }

    /// Valid bytes, mutable
    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data[self.head..self.tail]
    }

    pub fn len(&self) -> usize {
        self.tail - self.head
    }

    pub fn is_empty(&self) -> bool {
        self.head == self.tail
    }

    pub fn headroom(&self) -> usize {
        self.head
    }

    pub fn tailroom(&self) -> usize {
        self.data.len() - self.tail
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Free the buffer now (same as dropping it)
    pub fn free(self) {}
}

impl Drop for PacketBuffer {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl fmt::Debug for PacketBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PacketBuffer")
            .field("head", &self.head)
            .field("tail", &self.tail)
            .field("capacity", &self.data.len())
            .finish()
    }
}
