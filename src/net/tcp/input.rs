//! Segment arrival processing (RFC 793 section 3.9)

use core::net::SocketAddrV4;

use log::{debug, info, trace};

use crate::net::buffer::PacketBuffer;
use crate::net::config::{DEFAULT_PEER_MSS, TCP_DELAYACK_TIME, TCP_FINWAIT_TIME, TCP_TIMEWAIT_TIME};
use crate::net::error::NetError;
use crate::net::ipv4::IpMeta;
use crate::net::stack::NetStack;

use super::output::{self, Segment};
use super::seq::{le_le, le_lt, lt_le};
use super::tcb::{Arrival, FinState, OpenType, TcpTimerKind, Tcb};
use super::{flags, with_table, TcpHeader, TcpState, TcpTable};

/// What the table has to do with a block after a segment was processed
enum Outcome {
    Keep,
    Wake,
    Reset,
}

/// Handle a received segment (IP header already stripped)
pub(crate) fn rx(stack: &NetStack, meta: IpMeta, mut pkt: PacketBuffer) {
    // No broadcast or foreign destinations
    if !stack.is_local(meta.dst) {
        trace!("tcp: dropping segment for {}", meta.dst);
        return;
    }

    let header = match TcpHeader::parse(pkt.data(), meta.src, meta.dst) {
        Ok(header) => header,
        Err(e) => {
            debug!("tcp: dropping segment from {}: {}", meta.src, e);
            return;
        }
    };
    if pkt.remove_header(header.header_len()).is_err() {
        return;
    }

    let local = SocketAddrV4::new(meta.dst, header.dest_port);
    let remote = SocketAddrV4::new(meta.src, header.src_port);
    trace!(
        "tcp: {} -> {} seq {} ack {} flags 0x{:02x} len {}",
        remote,
        local,
        header.sequence,
        header.acknowledgment,
        header.flags,
        pkt.len()
    );

    with_table(stack, |tcp| {
        let target = tcp.demux(local, remote).and_then(|id| tcp.get(id).map(|t| (id, t.state)));
        match target {
            None | Some((_, TcpState::Closed)) => rx_closed(stack, local, remote, &header, pkt.len()),
            Some((id, TcpState::Listen)) => rx_listen(stack, tcp, id, local, remote, &header),
            Some((id, TcpState::SynSent)) => {
                let outcome = match tcp.get_mut(id) {
                    Some(tcb) => rx_syn_sent(stack, tcb, &header),
                    None => Outcome::Keep,
                };
                finish(stack, tcp, id, outcome);
            }
            Some((id, _)) => {
                let outcome = match tcp.get_mut(id) {
                    Some(tcb) => rx_otherwise(stack, tcb, &header, pkt),
                    None => Outcome::Keep,
                };
                finish(stack, tcp, id, outcome);
            }
        }
    });
}

fn finish(stack: &NetStack, tcp: &mut TcpTable, id: u32, outcome: Outcome) {
    match outcome {
        Outcome::Keep => {}
        Outcome::Wake => tcp.wake(id),
        Outcome::Reset => tcp.reset(stack, id),
    }
}

/// Answer a segment with a reset from `local` to `remote`
fn reply_rst(stack: &NetStack, local: SocketAddrV4, remote: SocketAddrV4, seq: u32, ack: u32, seg_flags: u8) {
    let seg = Segment {
        local,
        remote,
        seq,
        ack,
        flags: seg_flags,
        window: 0,
        mss: false,
        payload: &[],
    };
    if let Err(e) = output::transmit(stack, &seg) {
        debug!("tcp: reset to {} failed: {}", remote, e);
    }
}

/// No connection: reset anything that is not itself a reset
fn rx_closed(stack: &NetStack, local: SocketAddrV4, remote: SocketAddrV4, h: &TcpHeader, payload_len: usize) {
    if h.has(flags::RST) {
        return;
    }
    trace!("tcp: no connection for {} -> {}, resetting", remote, local);
    if h.has(flags::ACK) {
        reply_rst(stack, local, remote, h.acknowledgment, 0, flags::RST);
    } else {
        // SYN and FIN occupy one sequence number each
        let mut len = payload_len as u32;
        if h.has(flags::SYN) {
            len += 1;
        }
        if h.has(flags::FIN) {
            len += 1;
        }
        reply_rst(stack, local, remote, 0, h.sequence.wrapping_add(len), flags::RST | flags::ACK);
    }
}

fn rx_listen(
    stack: &NetStack,
    tcp: &mut TcpTable,
    id: u32,
    local: SocketAddrV4,
    remote: SocketAddrV4,
    h: &TcpHeader,
) {
    let Some(listener) = tcp.get(id) else {
        return;
    };

    // A connection still waiting in a backlog for accept
    if let Some(parent) = listener.parent {
        if h.has(flags::RST) {
            if let Some(p) = tcp.get_mut(parent) {
                p.backlog.retain(|&c| c != id);
            }
            if let Some(pending) = tcp.get_mut(id) {
                pending.user_closed = true;
            }
            tcp.reset(stack, id);
        }
        return;
    }

    if h.has(flags::RST) {
        return;
    }
    if h.has(flags::ACK) {
        reply_rst(stack, local, remote, h.acknowledgment, 0, flags::RST);
        return;
    }
    if !h.has(flags::SYN) {
        return;
    }

    if listener.backlog.len() >= listener.backlog_cap {
        debug!("tcp: {} backlog full, dropping SYN from {}", listener.local, remote);
        return;
    }

    let child = tcp.alloc();
    let Some(pending) = tcp.get_mut(child) else {
        return;
    };
    pending.local = local;
    pending.remote = remote;
    pending.state = TcpState::Listen;
    pending.open = OpenType::Passive;
    pending.parent = Some(id);
    pending.irs = h.sequence;
    pending.rcv_nxt = h.sequence.wrapping_add(1);
    pending.update_window(h.sequence, pending.snd_nxt, h.window);
    pending.mss = h.mss.unwrap_or(DEFAULT_PEER_MSS).min(stack.mss_to(*local.ip(), *remote.ip()));
    debug!("tcp: {} queued connection from {}", local, remote);

    if let Some(listener) = tcp.get_mut(id) {
        listener.backlog.push_back(child);
    }
    tcp.wake(id);
}

fn rx_syn_sent(stack: &NetStack, tcb: &mut Tcb, h: &TcpHeader) -> Outcome {
    let mut ack_ok = false;
    if h.has(flags::ACK) {
        if h.acknowledgment != tcb.iss.wrapping_add(1) {
            if !h.has(flags::RST) {
                reply_rst(stack, tcb.local, tcb.remote, h.acknowledgment, 0, flags::RST);
            }
            return Outcome::Keep;
        }
        ack_ok = true;
    }

    if h.has(flags::RST) {
        if ack_ok {
            debug!("tcp: connection to {} refused", tcb.remote);
            tcb.error = Some(NetError::ConnRefused);
            return Outcome::Reset;
        }
        return Outcome::Keep;
    }

    if !h.has(flags::SYN) {
        return Outcome::Keep;
    }

    tcb.irs = h.sequence;
    tcb.rcv_nxt = h.sequence.wrapping_add(1);
    let mss = h.mss.unwrap_or(DEFAULT_PEER_MSS).min(stack.mss_to(*tcb.local.ip(), *tcb.remote.ip()));

    if ack_ok {
        tcb.snd_una = h.acknowledgment;
        tcb.update_window(h.sequence, h.acknowledgment, h.window);
        tcb.mss = mss;
        tcb.set_state(TcpState::Established);
        output::send_ack(stack, tcb);
        info!("tcp: connected {} -> {}", tcb.local, tcb.remote);
        Outcome::Wake
    } else {
        // Simultaneous open
        tcb.mss = mss;
        tcb.set_state(TcpState::SynReceived);
        let iss = tcb.iss;
        output::send_ctrl(stack, tcb, iss, flags::SYN | flags::ACK, true, true);
        Outcome::Keep
    }
}

/// Whether any part of a segment falls inside the receive window
fn acceptable(tcb: &Tcb, seq: u32, len: u32) -> bool {
    let nxt = tcb.rcv_nxt;
    let edge = nxt.wrapping_add(tcb.rcv_wnd);
    match (len, tcb.rcv_wnd) {
        (0, 0) => seq == nxt,
        (0, _) => le_lt(nxt, seq, edge),
        (_, 0) => false,
        _ => le_lt(nxt, seq, edge) || le_lt(nxt, seq.wrapping_add(len - 1), edge),
    }
}

fn our_fin_acked(tcb: &Tcb, ack: u32) -> bool {
    tcb.fin == FinState::Acked || (tcb.fin == FinState::Sent && ack == tcb.fin_seq.wrapping_add(1))
}

fn enter_time_wait(stack: &NetStack, tcb: &mut Tcb) {
    tcb.set_state(TcpState::TimeWait);
    tcb.cancel_timers(&stack.timers);
    tcb.add_timer(&stack.timers, TCP_TIMEWAIT_TIME, TcpTimerKind::TimeWait);
}

/// Every synchronized state, plus SYN_RCVD
fn rx_otherwise(stack: &NetStack, tcb: &mut Tcb, h: &TcpHeader, mut pkt: PacketBuffer) -> Outcome {
    let seq = h.sequence;
    let ack = h.acknowledgment;
    let payload_len = pkt.len() as u32;

    if !acceptable(tcb, seq, payload_len) {
        if h.has(flags::RST) {
            return Outcome::Keep;
        }
        output::send_ack(stack, tcb);
        // A retransmitted FIN in TIME_WAIT means our last ACK was lost
        if tcb.state == TcpState::TimeWait
            && h.has(flags::FIN)
            && seq.wrapping_add(payload_len).wrapping_add(1) == tcb.rcv_nxt
        {
            enter_time_wait(stack, tcb);
        }
        return Outcome::Keep;
    }

    if h.has(flags::RST) {
        tcb.error = match tcb.state {
            TcpState::SynReceived if tcb.open == OpenType::Active => Some(NetError::ConnRefused),
            TcpState::SynReceived
            | TcpState::Established
            | TcpState::FinWait1
            | TcpState::FinWait2
            | TcpState::CloseWait => Some(NetError::ConnReset),
            _ => None,
        };
        debug!("tcp: {} reset by peer in {}", tcb.remote, tcb.state);
        return Outcome::Reset;
    }

    if h.has(flags::SYN) {
        // A SYN inside the window is an error
        reply_rst(stack, tcb.local, tcb.remote, ack, 0, flags::RST);
        tcb.error = Some(NetError::ConnReset);
        return Outcome::Reset;
    }

    if !h.has(flags::ACK) {
        return Outcome::Keep;
    }

    let mut wake = false;

    if tcb.state == TcpState::SynReceived {
        if le_le(tcb.snd_una, ack, tcb.snd_nxt) {
            tcb.snd_una = ack;
            tcb.update_window(seq, ack, h.window);
            tcb.set_state(TcpState::Established);
            info!("tcp: connected {} <- {}", tcb.local, tcb.remote);
            wake = true;
        } else {
            reply_rst(stack, tcb.local, tcb.remote, ack, 0, flags::RST);
            return Outcome::Keep;
        }
    }

    match tcb.state {
        TcpState::Established
        | TcpState::FinWait1
        | TcpState::FinWait2
        | TcpState::CloseWait
        | TcpState::Closing => {
            // The peer took our zero window persist byte
            if tcb.persist && ack == tcb.snd_nxt.wrapping_add(1) && tcb.unsent() > 0 {
                tcb.snd_nxt = ack;
            }

            if lt_le(tcb.snd_una, ack, tcb.snd_nxt) {
                let acked = ack.wrapping_sub(tcb.snd_una) as usize;
                let drained = acked.min(tcb.send_buf.len());
                tcb.send_buf.drain(..drained);
                tcb.snd_una = ack;
                wake = true;
            } else if ack != tcb.snd_una {
                output::send_ack(stack, tcb);
                return Outcome::Keep;
            }

            let window_edge = tcb.rcv_nxt.wrapping_add(tcb.rcv_wnd);
            if le_le(tcb.snd_una, ack, tcb.snd_nxt)
                && (lt_le(tcb.snd_wl1, seq, window_edge)
                    || (tcb.snd_wl1 == seq && le_le(tcb.snd_wl2, ack, tcb.snd_nxt)))
            {
                tcb.update_window(seq, ack, h.window);
                if tcb.snd_wnd > 0 {
                    tcb.persist = false;
                }
            }

            if tcb.state == TcpState::FinWait1 && our_fin_acked(tcb, ack) {
                tcb.fin = FinState::Acked;
                tcb.set_state(TcpState::FinWait2);
                tcb.add_timer(&stack.timers, TCP_FINWAIT_TIME, TcpTimerKind::FinWait);
                wake = true;
            }
            if tcb.state == TcpState::Closing {
                if !our_fin_acked(tcb, ack) {
                    return Outcome::Keep;
                }
                tcb.fin = FinState::Acked;
                enter_time_wait(stack, tcb);
                wake = true;
            }
        }
        TcpState::LastAck => {
            if our_fin_acked(tcb, ack) {
                tcb.fin = FinState::Acked;
                return Outcome::Reset;
            }
        }
        _ => {}
    }

    if payload_len > 0 && tcb.state.can_receive() && receive_payload(stack, tcb, seq, &mut pkt) {
        wake = true;
    }

    if h.has(flags::FIN) {
        let fin_seq = seq.wrapping_add(payload_len);
        if tcb.rcv_fin.is_none() && fin_seq == tcb.rcv_nxt {
            tcb.rcv_fin = Some(fin_seq);
            tcb.rcv_nxt = tcb.rcv_nxt.wrapping_add(1);
            output::send_ack(stack, tcb);

            match tcb.state {
                TcpState::SynReceived | TcpState::Established => tcb.set_state(TcpState::CloseWait),
                TcpState::FinWait1 => tcb.set_state(TcpState::Closing),
                TcpState::FinWait2 => enter_time_wait(stack, tcb),
                _ => {}
            }
            wake = true;
        } else {
            trace!("tcp: {} FIN at {} ahead of {}, ignored", tcb.remote, fin_seq, tcb.rcv_nxt);
        }
    }

    output::flush(stack, tcb);

    if wake { Outcome::Wake } else { Outcome::Keep }
}

/// Queue acceptable payload in the arrival list
///
/// # Returns
/// `true` if new bytes became readable
fn receive_payload(stack: &NetStack, tcb: &mut Tcb, seq: u32, pkt: &mut PacketBuffer) -> bool {
    let len = pkt.len() as u32;
    let mut start = seq;

    // Trim bytes we already have
    if seq != tcb.rcv_nxt && le_lt(seq, tcb.rcv_nxt, seq.wrapping_add(len)) {
        let dup = tcb.rcv_nxt.wrapping_sub(seq) as usize;
        if pkt.remove_header(dup).is_err() {
            return false;
        }
        start = tcb.rcv_nxt;
    }
    // Trim bytes past the window
    let room = tcb.rcv_nxt.wrapping_add(tcb.rcv_wnd).wrapping_sub(start) as usize;
    if pkt.len() > room {
        pkt.truncate(room);
    }
    if pkt.is_empty() {
        return false;
    }

    let payload = core::mem::replace(pkt, PacketBuffer::alloc(0));
    tcb.arrivals.add(tcb.rcv_nxt, Arrival::new(start, payload));

    match tcb.arrivals.take_ready(tcb.rcv_nxt) {
        Some(ready) => {
            tcb.rcv_nxt = tcb.rcv_nxt.wrapping_add(ready.len);
            tcb.rcv_wnd = tcb.rcv_wnd.saturating_sub(ready.len);
            tcb.recv_list.push_back(ready);
            let ack_counter = tcb.ack_counter;
            tcb.add_timer(&stack.timers, TCP_DELAYACK_TIME, TcpTimerKind::DelayedAck { ack_counter });
            true
        }
        None => {
            // Out of order: tell the peer what we are missing right away
            output::send_ack(stack, tcb);
            false
        }
    }
}
