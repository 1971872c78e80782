//! Loopback Network Interface (127.0.0.1)
//!
//! A virtual device that hands every transmitted frame back as a received
//! one, so the whole stack can run without hardware.

use alloc::vec::Vec;

use crossbeam_queue::ArrayQueue;

use crate::drivers::net::{LinkStatus, NetworkDevice, TransmitError};
use crate::net::config::MTU;

/// Frames buffered when no capacity is given
pub const DEFAULT_QUEUE_LEN: usize = 64;

/// Loopback network device
///
/// Transmitted frames land in a bounded queue and come back out of
/// `receive()` in order. A full queue rejects the frame with
/// [`TransmitError::BufferFull`].
pub struct LoopbackDevice {
    /// All zeros for loopback
    mac_addr: [u8; 6],
    rx_queue: ArrayQueue<Vec<u8>>,
}

impl LoopbackDevice {
    /// Create a loopback device holding at most `max_queue_size` frames
    pub fn new(max_queue_size: usize) -> Self {
        Self {
            mac_addr: [0; 6],
            rx_queue: ArrayQueue::new(max_queue_size.max(1)),
        }
    }

    /// Frames waiting to be received
    pub fn pending(&self) -> usize {
        self.rx_queue.len()
    }
}

impl Default for LoopbackDevice {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_LEN)
    }
}

impl NetworkDevice for LoopbackDevice {
    fn mac_address(&self) -> [u8; 6] {
        self.mac_addr
    }

    fn transmit(&mut self, frame: &[u8]) -> Result<(), TransmitError> {
        if frame.len() > MTU + crate::net::ethernet::HEADER_SIZE {
            return Err(TransmitError::PacketTooLarge);
        }
        self.rx_queue
            .push(frame.to_vec())
            .map_err(|_| TransmitError::BufferFull)
    }

    fn receive(&mut self) -> Option<Vec<u8>> {
        self.rx_queue.pop()
    }

    fn link_status(&self) -> LinkStatus {
        LinkStatus::Up
    }

    fn device_name(&self) -> &str {
        "lo (loopback)"
    }

    fn is_ready(&self) -> bool {
        true
    }
}
