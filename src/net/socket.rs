//! Socket interface
//!
//! A [`Socket`] is a protocol control block id plus the operation table that
//! was registered for its `(domain, type)` pair. The stack ships tables for
//! UDP datagram and TCP stream sockets; the syscall layer maps descriptors
//! onto `Socket` values and forwards each call unchanged.

use alloc::sync::Arc;
use core::fmt;
use core::net::SocketAddrV4;

use bitflags::bitflags;

use crate::net::error::NetError;
use crate::net::stack::NetStack;
use crate::net::{tcp, udp};

bitflags! {
    /// Per-call flags of send and receive operations
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct MsgFlags: u32 {
        /// Fail with [`NetError::Again`] instead of blocking
        const DONTWAIT = 0x01;
    }
}

/// Address family
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Domain {
    Inet,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SockType {
    Datagram,
    Stream,
}

/// Per-protocol socket operations
///
/// `pcb` is the id of the protocol control block created by
/// [`open`](SocketOps::open). Operations a protocol does not offer return
/// [`NetError::NotSupported`].
pub trait SocketOps: Send + Sync {
    /// Create a control block
    fn open(&self, stack: &NetStack) -> Result<u32, NetError>;

    fn bind(&self, stack: &NetStack, pcb: u32, addr: SocketAddrV4) -> Result<SocketAddrV4, NetError>;

    fn connect(&self, stack: &NetStack, pcb: u32, addr: SocketAddrV4) -> Result<(), NetError>;

    fn listen(&self, _stack: &NetStack, _pcb: u32, _backlog: usize) -> Result<(), NetError> {
        Err(NetError::NotSupported)
    }

    fn accept(&self, _stack: &NetStack, _pcb: u32, _flags: MsgFlags) -> Result<(u32, SocketAddrV4), NetError> {
        Err(NetError::NotSupported)
    }

    fn sendto(
        &self,
        stack: &NetStack,
        pcb: u32,
        data: &[u8],
        to: SocketAddrV4,
        flags: MsgFlags,
    ) -> Result<usize, NetError>;

    fn recvfrom(
        &self,
        stack: &NetStack,
        pcb: u32,
        buf: &mut [u8],
        flags: MsgFlags,
    ) -> Result<(usize, SocketAddrV4), NetError>;

    fn send(&self, stack: &NetStack, pcb: u32, data: &[u8], flags: MsgFlags) -> Result<usize, NetError>;

    fn recv(&self, stack: &NetStack, pcb: u32, buf: &mut [u8], flags: MsgFlags) -> Result<usize, NetError>;

    fn close(&self, stack: &NetStack, pcb: u32) -> Result<(), NetError>;
}

/// An open socket
#[derive(Clone)]
pub struct Socket {
    pub domain: Domain,
    pub ty: SockType,
    pub(crate) pcb: u32,
    pub(crate) ops: Arc<dyn SocketOps>,
}

impl Socket {
    /// Id of the underlying control block
    pub fn pcb(&self) -> u32 {
        self.pcb
    }
}

impl fmt::Debug for Socket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Socket")
            .field("domain", &self.domain)
            .field("ty", &self.ty)
            .field("pcb", &self.pcb)
            .finish()
    }
}

/// UDP datagram sockets
pub struct UdpSocketOps;

impl SocketOps for UdpSocketOps {
    fn open(&self, stack: &NetStack) -> Result<u32, NetError> {
        Ok(stack.udp.lock().alloc())
    }

    fn bind(&self, stack: &NetStack, pcb: u32, addr: SocketAddrV4) -> Result<SocketAddrV4, NetError> {
        stack.udp.lock().bind(pcb, addr)
    }

    fn connect(&self, stack: &NetStack, pcb: u32, addr: SocketAddrV4) -> Result<(), NetError> {
        udp::connect(stack, pcb, addr)
    }

    fn sendto(
        &self,
        stack: &NetStack,
        pcb: u32,
        data: &[u8],
        to: SocketAddrV4,
        _flags: MsgFlags,
    ) -> Result<usize, NetError> {
        udp::sendto(stack, pcb, data, to)
    }

    fn recvfrom(
        &self,
        stack: &NetStack,
        pcb: u32,
        buf: &mut [u8],
        flags: MsgFlags,
    ) -> Result<(usize, SocketAddrV4), NetError> {
        udp::recvfrom(stack, pcb, buf, flags)
    }

    fn send(&self, stack: &NetStack, pcb: u32, data: &[u8], _flags: MsgFlags) -> Result<usize, NetError> {
        udp::send(stack, pcb, data)
    }

    fn recv(&self, stack: &NetStack, pcb: u32, buf: &mut [u8], flags: MsgFlags) -> Result<usize, NetError> {
        udp::recvfrom(stack, pcb, buf, flags).map(|(n, _)| n)
    }

    fn close(&self, stack: &NetStack, pcb: u32) -> Result<(), NetError> {
        udp::close(stack, pcb)
    }
}

/// TCP stream sockets
pub struct TcpSocketOps;

impl SocketOps for TcpSocketOps {
    fn open(&self, stack: &NetStack) -> Result<u32, NetError> {
        Ok(tcp::user::open(stack))
    }

    fn bind(&self, stack: &NetStack, pcb: u32, addr: SocketAddrV4) -> Result<SocketAddrV4, NetError> {
        tcp::user::bind(stack, pcb, addr)
    }

    fn connect(&self, stack: &NetStack, pcb: u32, addr: SocketAddrV4) -> Result<(), NetError> {
        tcp::user::connect(stack, pcb, addr)
    }

    fn listen(&self, stack: &NetStack, pcb: u32, backlog: usize) -> Result<(), NetError> {
        tcp::user::listen(stack, pcb, backlog)
    }

    fn accept(&self, stack: &NetStack, pcb: u32, flags: MsgFlags) -> Result<(u32, SocketAddrV4), NetError> {
        tcp::user::accept(stack, pcb, flags)
    }

    /// The destination is fixed by the connection; `to` is ignored
    fn sendto(
        &self,
        stack: &NetStack,
        pcb: u32,
        data: &[u8],
        _to: SocketAddrV4,
        flags: MsgFlags,
    ) -> Result<usize, NetError> {
        tcp::user::send(stack, pcb, data, flags)
    }

    fn recvfrom(
        &self,
        stack: &NetStack,
        pcb: u32,
        buf: &mut [u8],
        flags: MsgFlags,
    ) -> Result<(usize, SocketAddrV4), NetError> {
        let n = tcp::user::recv(stack, pcb, buf, flags)?;
        let (_, remote) = tcp::user::endpoints(stack, pcb).ok_or(NetError::BadFd)?;
        Ok((n, remote))
    }

    fn send(&self, stack: &NetStack, pcb: u32, data: &[u8], flags: MsgFlags) -> Result<usize, NetError> {
        tcp::user::send(stack, pcb, data, flags)
    }

    fn recv(&self, stack: &NetStack, pcb: u32, buf: &mut [u8], flags: MsgFlags) -> Result<usize, NetError> {
        tcp::user::recv(stack, pcb, buf, flags)
    }

    fn close(&self, stack: &NetStack, pcb: u32) -> Result<(), NetError> {
        tcp::user::close(stack, pcb)
    }
}
