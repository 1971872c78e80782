//! TCP control block and its receive-side arrival list

use alloc::collections::VecDeque;
use alloc::vec::Vec;
use core::net::{Ipv4Addr, SocketAddrV4};

use log::debug;

use crate::net::buffer::PacketBuffer;
use crate::net::config::{DEFAULT_PEER_MSS, TCP_RTT_INIT};
use crate::net::error::NetError;
use crate::net::timer::{TimerKind, TimerToken, TimerWheel};

use super::TcpState;

/// Progress of our own FIN
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FinState {
    NotRequested,
    /// `close` was called; sent once the send buffer is empty
    Requested,
    Sent,
    Acked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OpenType {
    Active,
    Passive,
}

/// What a TCP timer does when it fires
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TcpTimerKind {
    /// Resend `[start, end)` unless it was acknowledged meanwhile
    Resend {
        start: u32,
        end: u32,
        flags: u8,
        mss: bool,
        /// Zero window persist segment rather than a retransmission
        persist: bool,
        /// Current interval in ticks; doubles on every retry
        interval: u64,
    },
    /// Send a bare ACK unless one was sent after `ack_counter`
    DelayedAck { ack_counter: u32 },
    TimeWait,
    FinWait,
}

impl TcpTimerKind {
    fn wheel_kind(&self) -> TimerKind {
        match self {
            TcpTimerKind::Resend { persist: true, .. } => TimerKind::TcpPersist,
            TcpTimerKind::Resend { .. } => TimerKind::TcpRetransmit,
            TcpTimerKind::DelayedAck { .. } => TimerKind::TcpDelayedAck,
            TcpTimerKind::TimeWait => TimerKind::TcpTimeWait,
            TcpTimerKind::FinWait => TimerKind::TcpFinWait,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct TcpTimer {
    pub token: TimerToken,
    pub kind: TcpTimerKind,
}

/// Received bytes `[start, start + len)`, kept as the segments they arrived in
pub(crate) struct Arrival {
    pub start: u32,
    pub len: u32,
    pub pkts: VecDeque<PacketBuffer>,
}

impl Arrival {
    /// Wrap a segment payload starting at sequence `start`
    pub fn new(start: u32, pkt: PacketBuffer) -> Self {
        let len = pkt.len() as u32;
        let mut pkts = VecDeque::new();
        if len > 0 {
            pkts.push_back(pkt);
        }
        Self { start, len, pkts }
    }

    pub fn end(&self) -> u32 {
        self.start.wrapping_add(self.len)
    }

    /// Drop everything past the first `n` bytes
    pub fn keep_front(&mut self, n: u32) {
        let mut remaining = n as usize;
        let mut kept = VecDeque::new();
        while let Some(mut pkt) = self.pkts.pop_front() {
            if remaining == 0 {
                break;
            }
            if pkt.len() > remaining {
                pkt.truncate(remaining);
            }
            remaining -= pkt.len();
            kept.push_back(pkt);
        }
        self.len = n.min(self.len);
        self.pkts = kept;
    }

    /// Drop the first `n` bytes
    pub fn drop_front(&mut self, n: u32) {
        let n = n.min(self.len);
        let mut remaining = n as usize;
        while remaining > 0 {
            let Some(front) = self.pkts.front_mut() else {
                break;
            };
            if front.len() <= remaining {
                remaining -= front.len();
                self.pkts.pop_front();
            } else {
                // Cannot fail: the window holds more than `remaining` bytes
                let _ = front.remove_header(remaining);
                remaining = 0;
            }
        }
        self.start = self.start.wrapping_add(n);
        self.len -= n;
    }

    /// Copy up to `buf.len()` bytes from the front and consume them
    pub fn read(&mut self, buf: &mut [u8]) -> usize {
        let mut copied = 0;
        for pkt in &self.pkts {
            if copied == buf.len() {
                break;
            }
            let n = pkt.len().min(buf.len() - copied);
            buf[copied..copied + n].copy_from_slice(&pkt.data()[..n]);
            copied += n;
        }
        self.drop_front(copied as u32);
        copied
    }
}

/// Out-of-order receive buffer: disjoint, non-adjacent ranges past `rcv_nxt`
#[derive(Default)]
pub(crate) struct ArrivalList {
    ranges: Vec<Arrival>,
}

impl ArrivalList {
    /// Merge `new` into the list
    ///
    /// Overlapping and adjacent ranges collapse into one; bytes already held
    /// are kept and the duplicates in `new` dropped. Positions are compared as
    /// distances from `rcv_nxt`, so every range must lie at or after it.
    pub fn add(&mut self, rcv_nxt: u32, new: Arrival) {
        let off = |seq: u32| seq.wrapping_sub(rcv_nxt);
        let mut merged = new;
        let mut kept = Vec::with_capacity(self.ranges.len() + 1);

        for mut a in self.ranges.drain(..) {
            if off(a.end()) < off(merged.start) || off(a.start) > off(merged.end()) {
                kept.push(a);
                continue;
            }

            if off(a.start) <= off(merged.start) && off(a.end()) >= off(merged.end()) {
                // Already fully held
                merged = a;
            } else if off(a.start) < off(merged.start) {
                // Extend the head with the part of `a` in front of `merged`
                a.keep_front(merged.start.wrapping_sub(a.start));
                a.len += merged.len;
                a.pkts.extend(merged.pkts);
                merged = a;
            } else if off(a.end()) > off(merged.end()) {
                // Extend the tail with the part of `a` past `merged`
                a.drop_front(merged.end().wrapping_sub(a.start));
                merged.len += a.len;
                merged.pkts.extend(a.pkts);
            }
            // Otherwise `a` lies inside `merged` and is dropped
        }

        kept.push(merged);
        kept.sort_by_key(|a| off(a.start));
        self.ranges = kept;
    }

    /// Remove the range starting exactly at `rcv_nxt`, if any
    pub fn take_ready(&mut self, rcv_nxt: u32) -> Option<Arrival> {
        let idx = self.ranges.iter().position(|a| a.start == rcv_nxt && a.len > 0)?;
        Some(self.ranges.remove(idx))
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    #[cfg(test)]
    pub fn ranges(&self) -> impl Iterator<Item = (u32, u32)> + '_ {
        self.ranges.iter().map(|a| (a.start, a.len))
    }
}

/// TCP Connection Control Block
pub(crate) struct Tcb {
    pub id: u32,
    pub state: TcpState,
    pub local: SocketAddrV4,
    pub remote: SocketAddrV4,
    pub open: OpenType,

    /// Oldest unacknowledged sequence number
    pub snd_una: u32,
    /// Next sequence number to send
    pub snd_nxt: u32,
    pub snd_wnd: u32,
    /// Segment sequence and ack numbers used for the last window update
    pub snd_wl1: u32,
    pub snd_wl2: u32,
    /// Bytes from `snd_una` onwards, sent or not
    pub send_buf: VecDeque<u8>,
    pub send_buf_size: usize,
    /// A zero window persist segment is outstanding
    pub persist: bool,
    pub iss: u32,

    pub rcv_nxt: u32,
    pub rcv_wnd: u32,
    pub recv_buf_size: usize,
    /// Bumped on every ACK we send
    pub ack_counter: u32,
    /// Sequence number of the peer's FIN once accepted
    pub rcv_fin: Option<u32>,
    pub irs: u32,
    pub arrivals: ArrivalList,
    /// In-order bytes ready for the reader
    pub recv_list: VecDeque<Arrival>,

    pub fin: FinState,
    pub fin_seq: u32,

    pub rtt: u64,
    pub mss: u16,
    /// Reported to blocked callers once the block is reset
    pub error: Option<NetError>,

    /// Half-open connections waiting for `accept`
    pub backlog: VecDeque<u32>,
    pub backlog_cap: usize,
    /// Listener this connection was spawned from
    pub parent: Option<u32>,

    /// `close` was called; the block is freed on its next reset
    pub user_closed: bool,
    pub timers: Vec<TcpTimer>,
}

impl Tcb {
    pub fn new(id: u32, send_buf_size: usize, recv_buf_size: usize) -> Self {
        let unspecified = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0);
        Self {
            id,
            state: TcpState::Closed,
            local: unspecified,
            remote: unspecified,
            open: OpenType::Active,
            snd_una: 0,
            snd_nxt: 0,
            snd_wnd: 0,
            snd_wl1: 0,
            snd_wl2: 0,
            send_buf: VecDeque::new(),
            send_buf_size,
            persist: false,
            iss: 0,
            rcv_nxt: 0,
            rcv_wnd: recv_buf_size as u32,
            recv_buf_size,
            ack_counter: 0,
            rcv_fin: None,
            irs: 0,
            arrivals: ArrivalList::default(),
            recv_list: VecDeque::new(),
            fin: FinState::NotRequested,
            fin_seq: 0,
            rtt: TCP_RTT_INIT,
            mss: DEFAULT_PEER_MSS,
            error: None,
            backlog: VecDeque::new(),
            backlog_cap: 0,
            parent: None,
            user_closed: false,
            timers: Vec::new(),
        }
    }

    /// Return to CLOSED, dropping buffers and connection state
    ///
    /// The local binding and any pending error survive. Timers must already
    /// be cancelled.
    pub fn reinit(&mut self) {
        let mut fresh = Tcb::new(self.id, self.send_buf_size, self.recv_buf_size);
        fresh.local = self.local;
        fresh.error = self.error;
        *self = fresh;
    }

    pub fn set_state(&mut self, state: TcpState) {
        if self.state != state {
            debug!("tcp: {} <-> {}: {} -> {}", self.local, self.remote, self.state, state);
            self.state = state;
        }
    }

    /// Take a new send window from a segment acknowledging `ack`
    ///
    /// `snd_wnd` counts what may still be sent from `snd_nxt`, so bytes
    /// already in flight past `ack` are deducted.
    pub fn update_window(&mut self, seq: u32, ack: u32, window: u16) {
        let window = (window as u32).min(self.send_buf_size as u32);
        let in_flight = self.snd_nxt.wrapping_sub(ack);
        self.snd_wnd = window.saturating_sub(in_flight);
        self.snd_wl1 = seq;
        self.snd_wl2 = ack;
    }

    /// Buffered bytes not yet sent
    pub fn unsent(&self) -> usize {
        let sent = self.snd_nxt.wrapping_sub(self.snd_una) as usize;
        self.send_buf.len().saturating_sub(sent)
    }

    pub fn send_space(&self) -> usize {
        self.send_buf_size.saturating_sub(self.send_buf.len())
    }

    /// Copy `len` buffered bytes starting at sequence `seq`
    pub fn send_bytes(&self, seq: u32, len: usize) -> Vec<u8> {
        let from = seq.wrapping_sub(self.snd_una) as usize;
        let to = (from + len).min(self.send_buf.len());
        self.send_buf.range(from.min(to)..to).copied().collect()
    }

    /// Window value to advertise
    pub fn window(&self) -> u16 {
        self.rcv_wnd.min(u16::MAX as u32) as u16
    }

    /// Bytes ready for the reader
    pub fn readable(&self) -> usize {
        self.recv_list.iter().map(|a| a.len as usize).sum()
    }

    /// Schedule a timer and remember it
    pub fn add_timer(&mut self, wheel: &TimerWheel, delay: u64, kind: TcpTimerKind) {
        let token = wheel.schedule(delay, kind.wheel_kind(), self.id);
        self.timers.push(TcpTimer { token, kind });
    }

    /// Forget the timer `token`, returning what it was for
    pub fn take_timer(&mut self, token: TimerToken) -> Option<TcpTimerKind> {
        let idx = self.timers.iter().position(|t| t.token == token)?;
        Some(self.timers.swap_remove(idx).kind)
    }

    pub fn cancel_timers(&mut self, wheel: &TimerWheel) {
        for timer in self.timers.drain(..) {
            wheel.cancel(timer.token);
        }
    }
}
