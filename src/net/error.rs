//! Socket-level error taxonomy
//!
//! These are the only errors that reach callers of the socket interface. Malformed
//! input on the receive path never produces one: it is dropped where it is detected.

use core::fmt;

use crate::drivers::net::TransmitError;
use crate::net::buffer::BufferError;

/// Errors returned by socket operations and the transmit path
///
/// Every variant has a stable negative code (see [`NetError::code`]) so the
/// syscall layer can hand it to user space unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetError {
    /// Socket handle does not refer to a live control block
    BadFd,
    /// Operation would block and the caller asked not to
    Again,
    /// Timed out (receive timeout or retransmission exhausted)
    Timeout,
    /// Message too large for the protocol
    MsgSize,
    /// Connection already exists or is being set up
    ConnExist,
    /// Connection is not established
    ConnNotExist,
    /// Connection is shutting down
    ConnClosing,
    /// `accept` on a socket that is not listening
    NotListening,
    /// Peer reset the connection
    ConnReset,
    /// Peer refused the connection
    ConnRefused,
    /// Generic failure
    Fail,
    /// Local address already bound
    AddrInUse,
    /// No interface can reach the destination
    NoRoute,
    /// Operation not offered by this socket type
    NotSupported,
    /// Configuration or argument out of range
    InvalidArgument,
}

impl NetError {
    /// Numeric errno value handed to user space
    pub fn code(&self) -> i32 {
        match self {
            NetError::BadFd => -1,
            NetError::Again => -2,
            NetError::Timeout => -3,
            NetError::MsgSize => -4,
            NetError::ConnExist => -5,
            NetError::ConnNotExist => -6,
            NetError::ConnClosing => -7,
            NetError::NotListening => -8,
            NetError::ConnReset => -9,
            NetError::ConnRefused => -10,
            NetError::Fail => -11,
            NetError::AddrInUse => -12,
            NetError::NoRoute => -13,
            NetError::NotSupported => -14,
            NetError::InvalidArgument => -15,
        }
    }
}

impl fmt::Display for NetError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetError::BadFd => write!(f, "Bad socket handle"),
            NetError::Again => write!(f, "Operation would block"),
            NetError::Timeout => write!(f, "Timed out"),
            NetError::MsgSize => write!(f, "Message too long"),
            NetError::ConnExist => write!(f, "Connection already exists"),
            NetError::ConnNotExist => write!(f, "Connection does not exist"),
            NetError::ConnClosing => write!(f, "Connection closing"),
            NetError::NotListening => write!(f, "Socket is not listening"),
            NetError::ConnReset => write!(f, "Connection reset by peer"),
            NetError::ConnRefused => write!(f, "Connection refused"),
            NetError::Fail => write!(f, "Operation failed"),
            NetError::AddrInUse => write!(f, "Address already in use"),
            NetError::NoRoute => write!(f, "No route to host"),
            NetError::NotSupported => write!(f, "Operation not supported"),
            NetError::InvalidArgument => write!(f, "Invalid argument"),
        }
    }
}

impl From<BufferError> for NetError {
    fn from(_: BufferError) -> Self {
        NetError::MsgSize
    }
}

impl From<TransmitError> for NetError {
    fn from(err: TransmitError) -> Self {
        match err {
            TransmitError::BufferFull => NetError::Again,
            TransmitError::PacketTooLarge => NetError::MsgSize,
            _ => NetError::Fail,
        }
    }
}
