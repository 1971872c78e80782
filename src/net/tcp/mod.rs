//! TCP Protocol Implementation (RFC 793)
//!
//! Provides Transmission Control Protocol support for reliable, connection-oriented communication.
//!
//! # Features
//! - TCP segment parsing and building, MSS option
//! - Connection establishment (3-way handshake), listen backlog
//! - Sliding send window, zero window probing (persist timer)
//! - Out-of-order receive through the arrival list
//! - Retransmission with a doubling timer, delayed ACK
//! - Connection teardown (FIN/ACK), TIME_WAIT
//!
//! # Limitations
//! - No congestion control
//! - No options beyond MSS
//!
//! Control blocks live in one [`TcpTable`] behind `NetStack::tcp`. Every entry
//! point runs under that lock through [`with_table`], which wakes blocked
//! callers only after the lock is released.

pub mod seq;
pub(crate) mod tcb;
pub(crate) mod input;
pub(crate) mod output;
pub(crate) mod timer;
pub(crate) mod user;

use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use core::fmt;
use core::net::{Ipv4Addr, SocketAddrV4};

use crate::net::checksum;
use crate::net::config::{EPHEMERAL_PORT_END, EPHEMERAL_PORT_START};
use crate::net::error::NetError;
use crate::net::ipv4::protocol;
use crate::net::stack::NetStack;
use crate::task::WaitCause;

use self::tcb::Tcb;

/// Minimum TCP header size (20 bytes, no options)
pub const TCP_HEADER_SIZE: usize = 20;

/// Maximum TCP header size (60 bytes with options)
pub const TCP_MAX_HEADER_SIZE: usize = 60;

/// Length of the MSS option as we send it
pub const MSS_OPTION_SIZE: usize = 4;

/// TCP Control Flags
pub mod flags {
    pub const FIN: u8 = 0x01; // Finish (no more data)
    pub const SYN: u8 = 0x02; // Synchronize sequence numbers
    pub const RST: u8 = 0x04; // Reset connection
    pub const PSH: u8 = 0x08; // Push function
    pub const ACK: u8 = 0x10; // Acknowledgment field significant
    pub const URG: u8 = 0x20; // Urgent pointer field significant
}

/// Option kinds
mod option {
    pub const END_OF_LIST: u8 = 0;
    pub const NOP: u8 = 1;
    pub const MSS: u8 = 2;
}

/// TCP Connection State (RFC 793)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpState {
    /// Connection closed
    Closed,
    /// Waiting for connection request
    Listen,
    /// Sent SYN, waiting for SYN-ACK
    SynSent,
    /// Received SYN, sent SYN-ACK, waiting for ACK
    SynReceived,
    /// Connection established, data transfer
    Established,
    /// Sent FIN, waiting for ACK
    FinWait1,
    /// Received ACK of FIN, waiting for FIN
    FinWait2,
    /// Both sides sent FIN, waiting for the ACK of ours
    Closing,
    /// Waiting out stray segments before the connection is forgotten
    TimeWait,
    /// Received FIN, waiting for the local close
    CloseWait,
    /// Sent FIN after receiving FIN, waiting for ACK
    LastAck,
}

impl TcpState {
    /// States in which the peer may still send us data
    pub fn can_receive(&self) -> bool {
        matches!(self, TcpState::Established | TcpState::FinWait1 | TcpState::FinWait2)
    }

    /// States in which queued data and our FIN are pushed out
    pub fn can_transmit(&self) -> bool {
        matches!(
            self,
            TcpState::Established | TcpState::CloseWait | TcpState::FinWait1 | TcpState::Closing | TcpState::LastAck
        )
    }
}

impl fmt::Display for TcpState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TcpState::Closed => "CLOSED",
            TcpState::Listen => "LISTEN",
            TcpState::SynSent => "SYN_SENT",
            TcpState::SynReceived => "SYN_RCVD",
            TcpState::Established => "ESTABLISHED",
            TcpState::FinWait1 => "FIN_WAIT_1",
            TcpState::FinWait2 => "FIN_WAIT_2",
            TcpState::Closing => "CLOSING",
            TcpState::TimeWait => "TIME_WAIT",
            TcpState::CloseWait => "CLOSE_WAIT",
            TcpState::LastAck => "LAST_ACK",
        };
        f.write_str(name)
    }
}

/// Errors that can occur while parsing a segment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpError {
    /// Packet is too short to contain a valid TCP header
    PacketTooShort,
    /// Invalid data offset (header length)
    InvalidDataOffset,
    /// Checksum verification failed
    ChecksumMismatch,
}

impl fmt::Display for TcpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TcpError::PacketTooShort => write!(f, "segment too short"),
            TcpError::InvalidDataOffset => write!(f, "invalid data offset"),
            TcpError::ChecksumMismatch => write!(f, "checksum mismatch"),
        }
    }
}

/// TCP header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpHeader {
    /// Source port (0-65535)
    pub src_port: u16,
    /// Destination port (0-65535)
    pub dest_port: u16,
    /// Sequence number
    pub sequence: u32,
    /// Acknowledgment number (if ACK flag set)
    pub acknowledgment: u32,
    /// Data offset (header length in 32-bit words)
    pub data_offset: u8,
    /// Control flags (FIN, SYN, RST, PSH, ACK, URG)
    pub flags: u8,
    /// Window size (flow control)
    pub window: u16,
    /// MSS option, if present
    pub mss: Option<u16>,
}

impl TcpHeader {
    /// Parse and validate a segment received from `src` to `dst`
    ///
    /// # Arguments
    /// * `data` - Raw segment bytes (TCP header + payload)
    /// * `src` - Source IP address (for checksum verification)
    /// * `dst` - Destination IP address (for checksum verification)
    pub fn parse(data: &[u8], src: Ipv4Addr, dst: Ipv4Addr) -> Result<Self, TcpError> {
        if data.len() < TCP_HEADER_SIZE {
            return Err(TcpError::PacketTooShort);
        }

        let data_offset = data[12] >> 4;
        let header_len = data_offset as usize * 4;
        if header_len < TCP_HEADER_SIZE {
            return Err(TcpError::InvalidDataOffset);
        }
        if header_len > data.len() {
            return Err(TcpError::PacketTooShort);
        }

        let pseudo = checksum::pseudo_header(src, dst, protocol::TCP, data.len() as u16);
        if !checksum::verify(&[&pseudo, data]) {
            return Err(TcpError::ChecksumMismatch);
        }

        Ok(Self {
            src_port: u16::from_be_bytes([data[0], data[1]]),
            dest_port: u16::from_be_bytes([data[2], data[3]]),
            sequence: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
            acknowledgment: u32::from_be_bytes([data[8], data[9], data[10], data[11]]),
            data_offset,
            flags: data[13],
            window: u16::from_be_bytes([data[14], data[15]]),
            mss: parse_mss(&data[TCP_HEADER_SIZE..header_len]),
        })
    }

    /// Header length in bytes, options included
    pub fn header_len(&self) -> usize {
        self.data_offset as usize * 4
    }

    pub fn has(&self, flag: u8) -> bool {
        self.flags & flag != 0
    }

    /// Write the header (and the MSS option, if set) with a zero checksum
    ///
    /// `out` must be `header_len()` bytes long.
    pub fn write(&self, out: &mut [u8]) {
        out[0..2].copy_from_slice(&self.src_port.to_be_bytes());
        out[2..4].copy_from_slice(&self.dest_port.to_be_bytes());
        out[4..8].copy_from_slice(&self.sequence.to_be_bytes());
        out[8..12].copy_from_slice(&self.acknowledgment.to_be_bytes());
        out[12] = self.data_offset << 4;
        out[13] = self.flags;
        out[14..16].copy_from_slice(&self.window.to_be_bytes());
        out[16..20].copy_from_slice(&[0, 0, 0, 0]);
        if let Some(mss) = self.mss {
            out[20] = option::MSS;
            out[21] = MSS_OPTION_SIZE as u8;
            out[22..24].copy_from_slice(&mss.to_be_bytes());
        }
    }
}

/// Find the MSS option in an option list
fn parse_mss(mut options: &[u8]) -> Option<u16> {
    while let Some(&kind) = options.first() {
        match kind {
            option::END_OF_LIST => return None,
            option::NOP => options = &options[1..],
            _ => {
                let len = *options.get(1)? as usize;
                if len < 2 || len > options.len() {
                    return None;
                }
                if kind == option::MSS && len == MSS_OPTION_SIZE {
                    return Some(u16::from_be_bytes([options[2], options[3]]));
                }
                options = &options[len..];
            }
        }
    }
    None
}

/// All TCP control blocks
pub(crate) struct TcpTable {
    pub(crate) tcbs: BTreeMap<u32, Tcb>,
    next_id: u32,
    isn_counter: u32,
    send_buf: usize,
    recv_buf: usize,
    /// Control blocks whose waiters must be woken once the lock is dropped
    wakeups: Vec<u32>,
}

impl TcpTable {
    pub fn new(send_buf: usize, recv_buf: usize) -> Self {
        Self {
            tcbs: BTreeMap::new(),
            next_id: 1,
            isn_counter: 0,
            send_buf: send_buf.max(1),
            recv_buf: recv_buf.clamp(1, u16::MAX as usize),
            wakeups: Vec::new(),
        }
    }

    /// Create a control block in CLOSED
    pub fn alloc(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        self.tcbs.insert(id, Tcb::new(id, self.send_buf, self.recv_buf));
        id
    }

    pub fn get(&self, id: u32) -> Option<&Tcb> {
        self.tcbs.get(&id)
    }

    pub fn get_mut(&mut self, id: u32) -> Option<&mut Tcb> {
        self.tcbs.get_mut(&id)
    }

    /// Wake everything blocked on `id` once the table is unlocked
    pub fn wake(&mut self, id: u32) {
        if !self.wakeups.contains(&id) {
            self.wakeups.push(id);
        }
    }

    /// Initial send sequence number, derived from the tick counter
    pub fn isn(&mut self, now: u64) -> u32 {
        self.isn_counter = self.isn_counter.wrapping_add(1);
        64000u32
            .wrapping_add((now as u32).wrapping_mul(250))
            .wrapping_add(self.isn_counter)
    }

    /// Control block for a segment from `remote` to `local`
    ///
    /// A block connected to `remote` wins over a listener on the same port.
    pub fn demux(&self, local: SocketAddrV4, remote: SocketAddrV4) -> Option<u32> {
        let mut listener = None;
        for (&id, tcb) in &self.tcbs {
            if tcb.local.port() != local.port() {
                continue;
            }
            if !tcb.local.ip().is_unspecified() && tcb.local.ip() != local.ip() {
                continue;
            }
            if tcb.remote == remote {
                return Some(id);
            }
            if tcb.state == TcpState::Listen && tcb.parent.is_none() {
                listener.get_or_insert(id);
            }
        }
        listener
    }

    fn port_in_use(&self, addr: Ipv4Addr, port: u16) -> bool {
        self.tcbs.values().any(|t| {
            t.parent.is_none()
                && t.local.port() == port
                && (t.local.ip().is_unspecified() || addr.is_unspecified() || *t.local.ip() == addr)
        })
    }

    /// First unused port of the dynamic range
    pub fn ephemeral_port(&self) -> Option<u16> {
        (EPHEMERAL_PORT_START..=EPHEMERAL_PORT_END).find(|&p| !self.tcbs.values().any(|t| t.local.port() == p))
    }

    /// Bind `id` to `addr`; port 0 picks an ephemeral port
    pub fn bind(&mut self, id: u32, addr: SocketAddrV4) -> Result<SocketAddrV4, NetError> {
        if self.get(id).ok_or(NetError::BadFd)?.local.port() != 0 {
            return Err(NetError::AddrInUse);
        }
        let port = match addr.port() {
            0 => self.ephemeral_port().ok_or(NetError::AddrInUse)?,
            port if self.port_in_use(*addr.ip(), port) => return Err(NetError::AddrInUse),
            port => port,
        };
        let local = SocketAddrV4::new(*addr.ip(), port);
        self.get_mut(id).ok_or(NetError::BadFd)?.local = local;
        Ok(local)
    }

    /// Tear a control block down and wake everything blocked on it
    ///
    /// Pending connections in its backlog are aborted. A block its user
    /// already closed is freed; any other returns to CLOSED, keeping its
    /// binding and the error to report.
    pub fn reset(&mut self, stack: &NetStack, id: u32) {
        let Some(tcb) = self.tcbs.get_mut(&id) else {
            return;
        };
        tcb.cancel_timers(&stack.timers);
        tcb.set_state(TcpState::Closed);
        let backlog: Vec<u32> = tcb.backlog.drain(..).collect();
        if tcb.user_closed {
            self.tcbs.remove(&id);
        } else {
            tcb.reinit();
        }
        self.wake(id);

        for child in backlog {
            if let Some(pending) = self.tcbs.get_mut(&child) {
                pending.user_closed = true;
            }
            self.abort(stack, child);
        }
    }

    /// Reset the peer if the connection was synchronized, then [`reset`](Self::reset)
    pub fn abort(&mut self, stack: &NetStack, id: u32) {
        if let Some(tcb) = self.tcbs.get(&id) {
            if matches!(
                tcb.state,
                TcpState::SynReceived
                    | TcpState::Established
                    | TcpState::FinWait1
                    | TcpState::FinWait2
                    | TcpState::CloseWait
            ) {
                output::send_rst(stack, tcb);
            }
        }
        self.reset(stack, id);
    }
}

/// Run `f` under the TCP lock, then deliver the wakeups it produced
pub(crate) fn with_table<R>(stack: &NetStack, f: impl FnOnce(&mut TcpTable) -> R) -> R {
    let (result, wakeups) = {
        let mut table = stack.tcp.lock();
        let result = f(&mut table);
        (result, core::mem::take(&mut table.wakeups))
    };
    for id in wakeups {
        stack.scheduler.wakeup(WaitCause::Tcp(id));
    }
    result
}
