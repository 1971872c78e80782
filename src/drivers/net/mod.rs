// Network Device Abstraction Layer
use alloc::vec::Vec;

/// link status of a network interface
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkStatus {
    Up,
    Down,
    Unknown,
}

/// Errors that can occur during packet transmission
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransmitError {
    /// Packet too large for the device
    PacketTooLarge,
    /// TX ring is full, try again later
    BufferFull,
    /// Device is not ready
    NotReady,
    /// Hardware error during transmission
    HardwareError,
    /// Device is not initialized
    NotInitialized,
}

/// Network device trait that all network drivers must implement
///
/// The stack owns each device behind its own lock and is the only caller, so
/// drivers need no internal locking of their own.
pub trait NetworkDevice: Send + Sync {
    /// Get the MAC address of this device
    fn mac_address(&self) -> [u8; 6];

    /// Transmit a frame
    ///
    /// # Arguments
    /// * `frame` - The raw Ethernet frame to transmit (including header)
    ///
    /// # Returns
    /// * `Ok(())` if the frame was queued for transmission
    /// * `Err(TransmitError)` if transmission failed
    fn transmit(&mut self, frame: &[u8]) -> Result<(), TransmitError>;

    /// Receive a frame if one is available
    ///
    /// # Returns
    /// * `Some(frame)` if a frame was received
    /// * `None` if the receive queue is empty
    fn receive(&mut self) -> Option<Vec<u8>>;

    /// Get the current link status
    fn link_status(&self) -> LinkStatus;

    /// Get device name/identifier
    fn device_name(&self) -> &str;

    /// Check if the device is initialized and ready
    fn is_ready(&self) -> bool;

    /// Largest IP datagram the link carries
    fn mtu(&self) -> usize {
        crate::net::config::MTU
    }
}
