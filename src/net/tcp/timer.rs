//! TCP timer expiry: retransmission, persist segments, delayed ACKs, TIME_WAIT
//! and the FIN_WAIT_2 guard

use log::{debug, trace, warn};

use crate::net::config::{TCP_PERSIST_WAIT_MAX, TCP_RESEND_WAIT_MAX};
use crate::net::error::NetError;
use crate::net::stack::NetStack;
use crate::net::timer::FiredTimer;

use super::output;
use super::seq::lt_le;
use super::tcb::{TcpTimerKind, Tcb};
use super::{flags, with_table, TcpState};

/// Dispatch one expired TCP timer
///
/// A timer whose block is gone, or that the block no longer tracks, is ignored.
pub(crate) fn fire(stack: &NetStack, fired: FiredTimer) {
    with_table(stack, |tcp| {
        let id = fired.key;
        let Some(tcb) = tcp.get_mut(id) else {
            return;
        };
        let Some(kind) = tcb.take_timer(fired.token) else {
            return;
        };

        let reset = match kind {
            TcpTimerKind::Resend { persist: true, start, interval, .. } => {
                persist(stack, tcb, start, interval);
                false
            }
            TcpTimerKind::Resend { start, end, flags, mss, interval, .. } => {
                resend(stack, tcb, start, end, flags, mss, interval)
            }
            TcpTimerKind::DelayedAck { ack_counter } => {
                // Anything sent since carried the ACK already
                if tcb.ack_counter == ack_counter {
                    output::send_ack(stack, tcb);
                }
                false
            }
            TcpTimerKind::TimeWait => {
                trace!("tcp: {} TIME_WAIT over", tcb.remote);
                true
            }
            TcpTimerKind::FinWait => {
                if tcb.state == TcpState::FinWait2 {
                    debug!("tcp: {} never sent its FIN, dropping", tcb.remote);
                    true
                } else {
                    false
                }
            }
        };

        if reset {
            tcp.reset(stack, id);
        }
    });
}

/// Retransmit `[start, end)` unless acknowledged
///
/// # Returns
/// `true` if the connection gave up and must be reset
fn resend(stack: &NetStack, tcb: &mut Tcb, start: u32, end: u32, seg_flags: u8, mss: bool, interval: u64) -> bool {
    if !lt_le(tcb.snd_una, end, tcb.snd_nxt) {
        return false;
    }

    let next = interval * 2;
    if next > TCP_RESEND_WAIT_MAX {
        warn!("tcp: {} not responding, resetting", tcb.remote);
        output::send_rst(stack, tcb);
        tcb.error = Some(NetError::Timeout);
        return true;
    }

    debug!("tcp: {} retransmit [{}, {}) after {} ticks", tcb.remote, start, end, interval);
    if seg_flags & (flags::SYN | flags::FIN) != 0 {
        let ack = seg_flags & flags::ACK != 0;
        let seg = output::Segment {
            local: tcb.local,
            remote: tcb.remote,
            seq: start,
            ack: if ack { tcb.rcv_nxt } else { 0 },
            flags: seg_flags,
            window: tcb.window(),
            mss,
            payload: &[],
        };
        if let Err(e) = output::transmit(stack, &seg) {
            debug!("tcp: retransmit to {} failed: {}", tcb.remote, e);
        }
    } else {
        // Only what is still unacknowledged
        let from = if lt_le(start, tcb.snd_una, end) { tcb.snd_una } else { start };
        let len = end.wrapping_sub(from) as usize;
        output::send_data(stack, tcb, from, len);
    }

    tcb.add_timer(
        &stack.timers,
        next,
        TcpTimerKind::Resend {
            start,
            end,
            flags: seg_flags,
            mss,
            persist: false,
            interval: next,
        },
    );
    false
}

/// Persist timer: keep testing a zero window, or resume once it opens
fn persist(stack: &NetStack, tcb: &mut Tcb, start: u32, interval: u64) {
    if tcb.snd_wnd == 0 && tcb.unsent() > 0 && tcb.state.can_transmit() {
        let seq = tcb.snd_nxt;
        trace!("tcp: {} zero window persist at {}", tcb.remote, seq);
        output::send_data(stack, tcb, seq, 1);
        let next = (interval * 2).min(TCP_PERSIST_WAIT_MAX);
        tcb.add_timer(
            &stack.timers,
            next,
            TcpTimerKind::Resend {
                start,
                end: start.wrapping_add(1),
                flags: flags::ACK,
                mss: false,
                persist: true,
                interval: next,
            },
        );
    } else {
        tcb.persist = false;
        output::flush(stack, tcb);
    }
}
