//! Blocking hooks into the kernel scheduler
//!
//! Socket calls that have to wait (connect, accept, recv, send on a full
//! buffer) park the calling task on a [`WaitCause`]. The stack wakes every task
//! parked on a cause when the matching control block makes progress.
//!
//! Waiting is two-phase. A caller takes a [`WaitTicket`] with
//! [`Scheduler::prepare_sleep`] before it checks its condition and hands the
//! ticket to [`Scheduler::sleep`] afterwards. A wakeup delivered anywhere in
//! between makes that sleep return at once, so a wakeup cannot fall into the
//! gap between the check and the sleep.

use core::sync::atomic::{AtomicU64, Ordering};

/// What a blocked task is waiting for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum WaitCause {
    /// State change or data on a TCP control block
    Tcp(u32),
    /// Datagram arrival on a UDP control block
    Udp(u32),
    /// Frames pending on an interface
    Device(usize),
    /// Ticks raised by the tick interrupt and not yet run
    Timer,
}

/// Number of wakeups a cause had seen when a waiter started checking
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitTicket(pub u64);

/// Scheduler interface used by the network stack
///
/// `sleep` is always called with no stack lock held. It may return early or
/// spuriously; every caller re-checks its condition in a loop. `wakeup` may be
/// called from interrupt context.
pub trait Scheduler: Send + Sync {
    /// Start waiting on `cause`; called before the condition is checked
    fn prepare_sleep(&self, cause: WaitCause) -> WaitTicket;

    /// Block the current task until `cause` is woken after `ticket` was taken
    ///
    /// Returns at once if that already happened.
    fn sleep(&self, cause: WaitCause, ticket: WaitTicket);

    /// Make runnable every task sleeping on `cause`
    fn wakeup(&self, cause: WaitCause);
}

/// Scheduler for single-threaded or polled setups
///
/// `sleep` just yields the CPU once unless a wakeup already arrived. Anything
/// waiting makes progress only when something else drives the stack between
/// retries.
#[derive(Debug, Default)]
pub struct SpinScheduler {
    wakeups: AtomicU64,
}

impl SpinScheduler {
    pub const fn new() -> Self {
        Self {
            wakeups: AtomicU64::new(0),
        }
    }

    /// Number of wakeups delivered so far
    pub fn wakeups(&self) -> u64 {
        self.wakeups.load(Ordering::Acquire)
    }
}

impl Scheduler for SpinScheduler {
    fn prepare_sleep(&self, _cause: WaitCause) -> WaitTicket {
        WaitTicket(self.wakeups())
    }

    fn sleep(&self, _cause: WaitCause, ticket: WaitTicket) {
        if self.wakeups() == ticket.0 {
            core::hint::spin_loop();
        }
    }

    fn wakeup(&self, _cause: WaitCause) {
        self.wakeups.fetch_add(1, Ordering::AcqRel);
    }
}
