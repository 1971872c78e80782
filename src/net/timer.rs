//! Timer wheel for the network stack
//!
//! Every protocol timer (ARP and reassembly sweeps, the TCP retransmit,
//! persist, delayed ACK, TIME_WAIT and FIN_WAIT_2 timers) is an entry in one
//! wheel advanced by [`NetStack::run_timers`](crate::NetStack::run_timers). A timer is a
//! typed [`TimerKind`], a `key` naming the resource it belongs to and a unique
//! [`TimerToken`]. Handlers look the resource up again when the timer fires, so
//! a timer that outlived its resource does nothing.
//!
//! Expired entries are collected under the wheel lock and dispatched after it
//! is released, so handlers may schedule and cancel freely.

use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use spin::Mutex;

/// Number of slots in the wheel; longer delays take several rotations
const NUM_SLOTS: usize = 256;

/// Which subsystem a timer belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    /// 10 s ARP aging sweep
    ArpSweep,
    /// 10 s reassembly timeout sweep
    ReassemblySweep,
    TcpRetransmit,
    /// Zero window persist
    TcpPersist,
    TcpDelayedAck,
    TcpTimeWait,
    /// Guard against a peer that never sends its FIN
    TcpFinWait,
    /// Receive timeout of a blocked UDP reader
    UdpRecvTimeout,
}

/// Handle of a scheduled timer; never reused
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct TimerToken(u64);

impl TimerToken {
    /// Never matches any scheduled timer
    pub const INVALID: Self = Self(0);
}

struct TimerEntry {
    deadline: u64,
    kind: TimerKind,
    key: u32,
    token: TimerToken,
    cancelled: bool,
}

/// A timer that expired and must be dispatched
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FiredTimer {
    pub kind: TimerKind,
    pub key: u32,
    pub token: TimerToken,
}

struct WheelInner {
    slots: Vec<Vec<TimerEntry>>,
    current_tick: u64,
}

pub struct TimerWheel {
    inner: Mutex<WheelInner>,
    next_token: AtomicU64,
}

impl TimerWheel {
    pub fn new() -> Self {
        let mut slots = Vec::with_capacity(NUM_SLOTS);
        slots.resize_with(NUM_SLOTS, Vec::new);
        Self {
            inner: Mutex::new(WheelInner { slots, current_tick: 0 }),
            next_token: AtomicU64::new(1),
        }
    }

    /// Schedule a timer `delay` ticks from now (0 fires on the next tick)
    pub fn schedule(&self, delay: u64, kind: TimerKind, key: u32) -> TimerToken {
        let token = TimerToken(self.next_token.fetch_add(1, Ordering::Relaxed));
        let mut inner = self.inner.lock();
        let deadline = inner.current_tick + delay.max(1);
        let slot = (deadline % NUM_SLOTS as u64) as usize;
        inner.slots[slot].push(TimerEntry {
            deadline,
            kind,
            key,
            token,
            cancelled: false,
        });
        token
    }

    /// Cancel a pending timer
    ///
    /// Returns `false` if it already fired or was never scheduled.
    pub fn cancel(&self, token: TimerToken) -> bool {
        if token == TimerToken::INVALID {
            return false;
        }
        let mut inner = self.inner.lock();
        for slot in inner.slots.iter_mut() {
            if let Some(entry) = slot.iter_mut().find(|e| e.token == token && !e.cancelled) {
                entry.cancelled = true;
                return true;
            }
        }
        false
    }

    /// Advance one tick towards `target` and return the timers that expired
    ///
    /// Returns `None` once the wheel has reached `target`. Several threads may
    /// drive the same wheel; each tick is consumed by exactly one caller.
    pub fn advance_to(&self, target: u64) -> Option<Vec<FiredTimer>> {
        let mut inner = self.inner.lock();
        if inner.current_tick >= target {
            return None;
        }
        inner.current_tick += 1;
        let now = inner.current_tick;
        let slot = &mut inner.slots[(now % NUM_SLOTS as u64) as usize];

        let mut fired = Vec::new();
        let mut i = 0;
        while i < slot.len() {
            if slot[i].cancelled {
                slot.swap_remove(i);
            } else if slot[i].deadline <= now {
                let entry = slot.swap_remove(i);
                fired.push(FiredTimer {
                    kind: entry.kind,
                    key: entry.key,
                    token: entry.token,
                });
            } else {
                i += 1;
            }
        }
        // Keep scheduling order among timers expiring together
        fired.sort_by_key(|t| t.token);
        Some(fired)
    }

    /// Ticks elapsed since the wheel was created
    pub fn now(&self) -> u64 {
        self.inner.lock().current_tick
    }

    /// Number of live (not cancelled) timers
    pub fn pending(&self) -> usize {
        let inner = self.inner.lock();
        inner
            .slots
            .iter()
            .map(|s| s.iter().filter(|e| !e.cancelled).count())
            .sum()
    }
}

impl Default for TimerWheel {
    fn default() -> Self {
        Self::new()
    }
}
