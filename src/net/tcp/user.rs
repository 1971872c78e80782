//! User calls on TCP control blocks
//!
//! Each call runs its state check under the table lock and sleeps on
//! [`WaitCause::Tcp`] with the lock released until the check resolves. The
//! wait ticket is taken before the check so a wakeup sent between the check
//! and the sleep is not lost.

use core::net::SocketAddrV4;
use core::task::Poll;

use log::{debug, info};

use crate::net::error::NetError;
use crate::net::socket::MsgFlags;
use crate::net::stack::NetStack;
use crate::task::WaitCause;

use super::output;
use super::tcb::{FinState, OpenType};
use super::{flags, with_table, TcpState, TcpTable};

/// Run `check` under the table lock until it is ready, sleeping on `id` in between
fn block_on<R>(stack: &NetStack, id: u32, mut check: impl FnMut(&mut TcpTable) -> Poll<R>) -> R {
    let cause = WaitCause::Tcp(id);
    loop {
        let ticket = stack.scheduler.prepare_sleep(cause);
        match with_table(stack, &mut check) {
            Poll::Ready(r) => return r,
            Poll::Pending => stack.scheduler.sleep(cause, ticket),
        }
    }
}

/// Allocate a CLOSED control block
pub(crate) fn open(stack: &NetStack) -> u32 {
    with_table(stack, |tcp| tcp.alloc())
}

pub(crate) fn bind(stack: &NetStack, id: u32, addr: SocketAddrV4) -> Result<SocketAddrV4, NetError> {
    with_table(stack, |tcp| tcp.bind(id, addr))
}

/// Error to report for a call that needs a synchronized connection
fn not_connected(state: TcpState, error: &mut Option<NetError>) -> NetError {
    match state {
        TcpState::Closed => error.take().unwrap_or(NetError::ConnNotExist),
        TcpState::Listen | TcpState::SynSent | TcpState::SynReceived => NetError::ConnNotExist,
        _ => NetError::ConnClosing,
    }
}

/// Active open towards `remote`; blocks until established or refused
pub(crate) fn connect(stack: &NetStack, id: u32, remote: SocketAddrV4) -> Result<(), NetError> {
    with_table(stack, |tcp| -> Result<(), NetError> {
        let Some(tcb) = tcp.get(id) else {
            return Err(NetError::BadFd);
        };
        let state = tcb.state;
        match state {
            TcpState::Closed => {}
            TcpState::Listen if tcb.parent.is_none() => {
                // Pending connections of the old listener go away
                let pending: alloc::vec::Vec<u32> = tcb.backlog.iter().copied().collect();
                for child in pending {
                    if let Some(c) = tcp.get_mut(child) {
                        c.user_closed = true;
                    }
                    tcp.abort(stack, child);
                }
                if let Some(tcb) = tcp.get_mut(id) {
                    tcb.backlog.clear();
                }
            }
            _ => return Err(NetError::ConnExist),
        }

        let local = tcp.get(id).map(|t| t.local).ok_or(NetError::BadFd)?;
        if local.port() == 0 {
            tcp.bind(id, SocketAddrV4::new(*local.ip(), 0))?;
        }

        let now = stack.now();
        let iss = tcp.isn(now);
        let tcb = tcp.get_mut(id).ok_or(NetError::BadFd)?;
        let route = stack.route(*tcb.local.ip(), *remote.ip()).ok_or(NetError::NoRoute)?;
        tcb.local = SocketAddrV4::new(route.src, tcb.local.port());
        tcb.remote = remote;
        tcb.open = OpenType::Active;
        tcb.error = None;
        tcb.iss = iss;
        tcb.snd_una = iss;
        tcb.snd_nxt = iss.wrapping_add(1);
        tcb.set_state(TcpState::SynSent);
        output::send_ctrl(stack, tcb, iss, flags::SYN, true, true);
        debug!("tcp: {} connecting to {}", tcb.local, remote);
        Ok(())
    })?;

    block_on(stack, id, |tcp| match tcp.get_mut(id) {
        None => Poll::Ready(Err(NetError::BadFd)),
        Some(tcb) => match tcb.state {
            TcpState::SynSent | TcpState::SynReceived => Poll::Pending,
            TcpState::Closed => Poll::Ready(Err(tcb.error.take().unwrap_or(NetError::ConnRefused))),
            _ => Poll::Ready(Ok(())),
        },
    })
}

/// Passive open with room for `backlog` pending connections (at least one)
pub(crate) fn listen(stack: &NetStack, id: u32, backlog: usize) -> Result<(), NetError> {
    with_table(stack, |tcp| {
        let tcb = tcp.get(id).ok_or(NetError::BadFd)?;
        if !matches!(tcb.state, TcpState::Closed | TcpState::Listen) || tcb.parent.is_some() {
            return Err(NetError::ConnExist);
        }
        let local = tcb.local;
        if local.port() == 0 {
            tcp.bind(id, SocketAddrV4::new(*local.ip(), 0))?;
        }

        let tcb = tcp.get_mut(id).ok_or(NetError::BadFd)?;
        tcb.backlog_cap = backlog.max(1);
        tcb.open = OpenType::Passive;
        tcb.set_state(TcpState::Listen);
        info!("tcp: listening on {}", tcb.local);
        Ok(())
    })
}

/// Take the next pending connection off the backlog and complete its handshake
///
/// # Returns
/// The id of the new connection's control block and the peer's address
pub(crate) fn accept(stack: &NetStack, id: u32, msg_flags: MsgFlags) -> Result<(u32, SocketAddrV4), NetError> {
    loop {
        // Pick a child, or find out why there is none
        let child = block_on(stack, id, |tcp| -> Poll<Result<u32, NetError>> {
            let Some(listener) = tcp.get_mut(id) else {
                return Poll::Ready(Err(NetError::BadFd));
            };
            if listener.state != TcpState::Listen || listener.parent.is_some() {
                return Poll::Ready(Err(NetError::NotListening));
            }
            let Some(child) = listener.backlog.pop_front() else {
                if msg_flags.contains(MsgFlags::DONTWAIT) {
                    return Poll::Ready(Err(NetError::Again));
                }
                return Poll::Pending;
            };

            let now = stack.now();
            let iss = tcp.isn(now);
            let Some(tcb) = tcp.get_mut(child) else {
                return Poll::Ready(Ok(child));
            };
            tcb.parent = None;
            tcb.iss = iss;
            tcb.snd_una = iss;
            tcb.snd_nxt = iss.wrapping_add(1);
            tcb.set_state(TcpState::SynReceived);
            output::send_ctrl(stack, tcb, iss, flags::SYN | flags::ACK, true, true);
            Poll::Ready(Ok(child))
        })?;

        // Wait for the peer's ACK of our SYN
        let done = block_on(stack, child, |tcp| match tcp.get_mut(child) {
            None => Poll::Ready(None),
            Some(tcb) => match tcb.state {
                TcpState::SynReceived => Poll::Pending,
                TcpState::Closed => {
                    tcb.user_closed = true;
                    tcp.reset(stack, child);
                    Poll::Ready(None)
                }
                _ => Poll::Ready(Some(tcb.remote)),
            },
        });
        // On None the handshake failed; try the next pending connection
        if let Some(remote) = done {
            info!("tcp: accepted {} on listener {}", remote, id);
            return Ok((child, remote));
        }
    }
}

/// Queue `data` for transmission
///
/// Blocks while the send buffer is full unless `DONTWAIT` is given, in which
/// case a partial count (or [`NetError::Again`]) is returned.
pub(crate) fn send(stack: &NetStack, id: u32, data: &[u8], msg_flags: MsgFlags) -> Result<usize, NetError> {
    let mut sent = 0;
    block_on(stack, id, |tcp| -> Poll<Result<usize, NetError>> {
        let Some(tcb) = tcp.get_mut(id) else {
            return Poll::Ready(Err(NetError::BadFd));
        };
        if !matches!(tcb.state, TcpState::Established | TcpState::CloseWait) || tcb.fin != FinState::NotRequested {
            let err = not_connected(tcb.state, &mut tcb.error);
            return Poll::Ready(if sent > 0 { Ok(sent) } else { Err(err) });
        }

        let n = tcb.send_space().min(data.len() - sent);
        if n > 0 {
            tcb.send_buf.extend(&data[sent..sent + n]);
            sent += n;
            output::flush(stack, tcb);
        }
        if sent == data.len() {
            return Poll::Ready(Ok(sent));
        }
        if msg_flags.contains(MsgFlags::DONTWAIT) {
            return Poll::Ready(if sent > 0 { Ok(sent) } else { Err(NetError::Again) });
        }
        Poll::Pending
    })
}

/// Read in-order bytes into `buf`
///
/// # Returns
/// The byte count, or [`NetError::ConnClosing`] once the peer has closed and
/// everything it sent was read.
pub(crate) fn recv(stack: &NetStack, id: u32, buf: &mut [u8], msg_flags: MsgFlags) -> Result<usize, NetError> {
    block_on(stack, id, |tcp| -> Poll<Result<usize, NetError>> {
        let Some(tcb) = tcp.get_mut(id) else {
            return Poll::Ready(Err(NetError::BadFd));
        };

        if tcb.readable() > 0 {
            let mut n = 0;
            while n < buf.len() {
                let Some(front) = tcb.recv_list.front_mut() else {
                    break;
                };
                n += front.read(&mut buf[n..]);
                if front.len == 0 {
                    tcb.recv_list.pop_front();
                }
            }
            let was_closed = tcb.rcv_wnd == 0;
            tcb.rcv_wnd = (tcb.rcv_wnd + n as u32).min(tcb.recv_buf_size as u32);
            if was_closed && n > 0 && tcb.state.can_receive() {
                // Tell the peer the window reopened
                output::send_ack(stack, tcb);
            }
            return Poll::Ready(Ok(n));
        }

        match tcb.state {
            TcpState::Established | TcpState::FinWait1 | TcpState::FinWait2 => {}
            TcpState::Closed | TcpState::Listen | TcpState::SynSent | TcpState::SynReceived => {
                return Poll::Ready(Err(not_connected(tcb.state, &mut tcb.error)));
            }
            // The peer's FIN was consumed
            _ => return Poll::Ready(Err(NetError::ConnClosing)),
        }
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        if msg_flags.contains(MsgFlags::DONTWAIT) {
            return Poll::Ready(Err(NetError::Again));
        }
        Poll::Pending
    })
}

/// Close the caller's side of a connection
///
/// The control block stays around until the connection is fully shut down and
/// is then freed.
pub(crate) fn close(stack: &NetStack, id: u32) -> Result<(), NetError> {
    with_table(stack, |tcp| {
        let tcb = tcp.get_mut(id).ok_or(NetError::BadFd)?;
        tcb.user_closed = true;
        tcp.wake(id);

        let tcb = tcp.get_mut(id).ok_or(NetError::BadFd)?;
        let state = tcb.state;
        match state {
            TcpState::Closed | TcpState::Listen | TcpState::SynSent => {
                tcp.reset(stack, id);
                Ok(())
            }
            TcpState::SynReceived | TcpState::Established => {
                tcb.fin = FinState::Requested;
                tcb.set_state(TcpState::FinWait1);
                output::flush(stack, tcb);
                Ok(())
            }
            TcpState::CloseWait => {
                tcb.fin = FinState::Requested;
                output::flush(stack, tcb);
                Ok(())
            }
            _ => Err(NetError::ConnClosing),
        }
    })
}

/// Current state of a control block
pub(crate) fn state(stack: &NetStack, id: u32) -> Option<TcpState> {
    with_table(stack, |tcp| tcp.get(id).map(|t| t.state))
}

/// Local and remote address of a control block
pub(crate) fn endpoints(stack: &NetStack, id: u32) -> Option<(SocketAddrV4, SocketAddrV4)> {
    with_table(stack, |tcp| tcp.get(id).map(|t| (t.local, t.remote)))
}
