//! Segment transmission: control segments, data from the send buffer, FIN

use core::net::SocketAddrV4;

use log::{debug, trace};

use crate::net::buffer::{PacketBuffer, MAX_HDRLEN_TCP};
use crate::net::checksum;
use crate::net::config::{mss_for_mtu, DEFAULT_PEER_MSS, TCP_TIMER_UNIT};
use crate::net::error::NetError;
use crate::net::ipv4::{self, protocol};
use crate::net::stack::NetStack;

use super::tcb::{FinState, TcpTimerKind, Tcb};
use super::{flags, TcpHeader, TcpState, MSS_OPTION_SIZE, TCP_HEADER_SIZE};

/// One outgoing segment
#[derive(Debug, Clone, Copy)]
pub(crate) struct Segment<'a> {
    pub local: SocketAddrV4,
    pub remote: SocketAddrV4,
    pub seq: u32,
    pub ack: u32,
    pub flags: u8,
    pub window: u16,
    /// Carry our MSS option (SYN and SYN+ACK)
    pub mss: bool,
    pub payload: &'a [u8],
}

/// Build a segment and hand it to IP
pub(crate) fn transmit(stack: &NetStack, seg: &Segment<'_>) -> Result<(), NetError> {
    let route = stack.route(*seg.local.ip(), *seg.remote.ip()).ok_or(NetError::NoRoute)?;
    let mss = stack.interface(route.iface).map_or(DEFAULT_PEER_MSS, |i| mss_for_mtu(i.mtu));

    let header_len = TCP_HEADER_SIZE + if seg.mss { MSS_OPTION_SIZE } else { 0 };
    let mut pkt = PacketBuffer::alloc(MAX_HDRLEN_TCP + seg.payload.len());
    pkt.reserve_headroom(MAX_HDRLEN_TCP)?;
    pkt.append(seg.payload)?;

    let header = TcpHeader {
        src_port: seg.local.port(),
        dest_port: seg.remote.port(),
        sequence: seg.seq,
        acknowledgment: seg.ack,
        data_offset: (header_len / 4) as u8,
        flags: seg.flags,
        window: seg.window,
        mss: seg.mss.then_some(mss),
    };
    header.write(pkt.add_header(header_len)?);

    let pseudo = checksum::pseudo_header(route.src, *seg.remote.ip(), protocol::TCP, pkt.len() as u16);
    let sum = checksum::checksum(&[&pseudo, pkt.data()]);
    pkt.data_mut()[16..18].copy_from_slice(&sum.to_be_bytes());

    trace!(
        "tcp: {} -> {} seq {} ack {} flags 0x{:02x} len {}",
        seg.local,
        seg.remote,
        seg.seq,
        seg.ack,
        seg.flags,
        seg.payload.len()
    );
    ipv4::tx(stack, pkt, route.src, *seg.remote.ip(), protocol::TCP)
}

/// Send a segment; failures are left to retransmission
fn send(stack: &NetStack, seg: &Segment<'_>) {
    if let Err(e) = transmit(stack, seg) {
        debug!("tcp: send to {} failed: {}", seg.remote, e);
    }
}

/// Send a segment with no payload on behalf of `tcb`
///
/// With `resend`, a retransmission timer covering `[seq, seq + 1)` is armed;
/// only SYN and FIN are sent that way.
pub(crate) fn send_ctrl(stack: &NetStack, tcb: &mut Tcb, seq: u32, seg_flags: u8, mss: bool, resend: bool) {
    let seg = Segment {
        local: tcb.local,
        remote: tcb.remote,
        seq,
        ack: if seg_flags & flags::ACK != 0 { tcb.rcv_nxt } else { 0 },
        flags: seg_flags,
        window: tcb.window(),
        mss,
        payload: &[],
    };
    send(stack, &seg);

    if seg_flags & flags::ACK != 0 {
        tcb.ack_counter = tcb.ack_counter.wrapping_add(1);
    }
    if resend {
        let interval = tcb.rtt * TCP_TIMER_UNIT;
        tcb.add_timer(
            &stack.timers,
            interval,
            TcpTimerKind::Resend {
                start: seq,
                end: seq.wrapping_add(1),
                flags: seg_flags,
                mss,
                persist: false,
                interval,
            },
        );
    }
}

/// Bare ACK of everything received so far
pub(crate) fn send_ack(stack: &NetStack, tcb: &mut Tcb) {
    let seq = tcb.snd_nxt;
    send_ctrl(stack, tcb, seq, flags::ACK, false, false);
}

/// Reset the peer of `tcb`
pub(crate) fn send_rst(stack: &NetStack, tcb: &Tcb) {
    send(
        stack,
        &Segment {
            local: tcb.local,
            remote: tcb.remote,
            seq: tcb.snd_nxt,
            ack: 0,
            flags: flags::RST,
            window: 0,
            mss: false,
            payload: &[],
        },
    );
}

/// Send `len` buffered bytes starting at `seq`
pub(crate) fn send_data(stack: &NetStack, tcb: &mut Tcb, seq: u32, len: usize) {
    let payload = tcb.send_bytes(seq, len);
    let seg = Segment {
        local: tcb.local,
        remote: tcb.remote,
        seq,
        ack: tcb.rcv_nxt,
        flags: flags::ACK,
        window: tcb.window(),
        mss: false,
        payload: &payload,
    };
    send(stack, &seg);
    tcb.ack_counter = tcb.ack_counter.wrapping_add(1);
}

/// Push out whatever the send window allows, then the FIN once it is due
pub(crate) fn flush(stack: &NetStack, tcb: &mut Tcb) {
    if !tcb.state.can_transmit() {
        return;
    }
    let interval = tcb.rtt * TCP_TIMER_UNIT;

    if !tcb.persist && tcb.snd_wnd == 0 && tcb.unsent() > 0 {
        // Zero window: push one byte past flow control to learn when it opens
        tcb.persist = true;
        let seq = tcb.snd_nxt;
        trace!("tcp: {} zero window persist at {}", tcb.remote, seq);
        send_data(stack, tcb, seq, 1);
        tcb.add_timer(
            &stack.timers,
            interval,
            TcpTimerKind::Resend {
                start: seq,
                end: seq.wrapping_add(1),
                flags: flags::ACK,
                mss: false,
                persist: true,
                interval,
            },
        );
    }

    while tcb.snd_wnd > 0 && tcb.unsent() > 0 {
        let len = tcb.unsent().min(tcb.snd_wnd as usize).min(tcb.mss as usize);
        let seq = tcb.snd_nxt;
        let end = seq.wrapping_add(len as u32);
        send_data(stack, tcb, seq, len);
        tcb.snd_nxt = end;
        tcb.snd_wnd -= len as u32;
        tcb.add_timer(
            &stack.timers,
            interval,
            TcpTimerKind::Resend {
                start: seq,
                end,
                flags: flags::ACK,
                mss: false,
                persist: false,
                interval,
            },
        );
    }

    if tcb.fin == FinState::Requested && tcb.send_buf.is_empty() && tcb.snd_nxt == tcb.snd_una {
        tcb.fin = FinState::Sent;
        tcb.fin_seq = tcb.snd_nxt;
        tcb.snd_nxt = tcb.snd_nxt.wrapping_add(1);
        let seq = tcb.fin_seq;
        send_ctrl(stack, tcb, seq, flags::FIN | flags::ACK, false, true);

        if tcb.state == TcpState::CloseWait {
            tcb.state = TcpState::LastAck;
        }
        debug!("tcp: {} FIN sent, {}", tcb.remote, tcb.state);
    }
}
