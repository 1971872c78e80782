//! Network configuration and protocol parameters
//!
//! Time is counted in stack ticks. The kernel calls [`crate::NetStack::tick`]
//! every 100 ms and [`crate::NetStack::run_timers`] processes those ticks, so
//! every timeout below is expressed as a multiple of that.

use alloc::string::String;
use core::net::Ipv4Addr;

/// Stack ticks per second (one tick = 100 ms)
pub const TICKS_PER_SECOND: u64 = 10;

/// Default link MTU
pub const MTU: usize = 1500;

/// Smallest MTU an interface may be configured with
pub const MIN_MTU: usize = 68;

/// IP and TCP headers without options
pub const TCP_IP_HEADER_SIZE: usize = 40;

/// Largest TCP payload a link with `mtu` carries in one datagram
pub fn mss_for_mtu(mtu: usize) -> u16 {
    u16::try_from(mtu.saturating_sub(TCP_IP_HEADER_SIZE)).unwrap_or(u16::MAX)
}

/// MSS assumed for a peer that sends no MSS option
pub const DEFAULT_PEER_MSS: u16 = 536;

/// TTL placed on every outgoing datagram
pub const IP_TTL: u8 = 64;

/// Period of the ARP and reassembly sweeps
pub const SWEEP_TICKS: u64 = 10 * TICKS_PER_SECOND;

/// ARP entry lifetime in sweeps (2 hours)
pub const ARP_TIMEOUT_SWEEPS: u16 = 720;

/// Timeout value marking a static ARP entry
pub const ARP_PERMANENT: u16 = 0xffff;

/// Reassembly context lifetime in sweeps (1 minute)
pub const IPFRAG_TIMEOUT_SWEEPS: i32 = 6;

/// Default UDP per-socket receive queue length
pub const UDP_RECVQUEUE_LEN: usize = 32;

/// Base unit of every TCP timer (200 ms)
pub const TCP_TIMER_UNIT: u64 = 2;
pub const TCP_SECOND: u64 = TCP_TIMER_UNIT * 5;
pub const TCP_MINUTE: u64 = TCP_SECOND * 60;

/// Initial retransmission timeout in timer units
pub const TCP_RTT_INIT: u64 = 3;

/// Cap on the persist (zero window) interval
pub const TCP_PERSIST_WAIT_MAX: u64 = TCP_MINUTE;

/// Backoff above which retransmission gives up and resets the peer
pub const TCP_RESEND_WAIT_MAX: u64 = 2 * TCP_MINUTE;

/// How long a half-closed connection may sit in FIN_WAIT_2
pub const TCP_FINWAIT_TIME: u64 = TCP_MINUTE;

pub const TCP_TIMEWAIT_TIME: u64 = 10 * TCP_SECOND;
pub const TCP_DELAYACK_TIME: u64 = TCP_TIMER_UNIT;

/// Dynamic port range shared by UDP and TCP
pub const EPHEMERAL_PORT_START: u16 = 49152;
pub const EPHEMERAL_PORT_END: u16 = 65535;

/// Stack-wide configuration
#[derive(Debug, Clone)]
pub struct NetConfig {
    /// Default gateway used when no interface network matches
    pub gateway: Option<Ipv4Addr>,
    /// Number of ARP table slots
    pub arp_table_size: usize,
    /// Number of concurrent IP reassembly contexts
    pub reassembly_slots: usize,
    /// Datagrams buffered per UDP socket before the oldest is dropped
    pub udp_queue_len: usize,
    /// TCP send buffer size in bytes
    pub tcp_send_buf: usize,
    /// TCP receive buffer size in bytes (also the advertised window)
    pub tcp_recv_buf: usize,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            gateway: None,
            arp_table_size: 1024,
            reassembly_slots: 16,
            udp_queue_len: UDP_RECVQUEUE_LEN,
            tcp_send_buf: 4096,
            tcp_recv_buf: 4096,
        }
    }
}

/// Per-interface addressing
#[derive(Debug, Clone)]
pub struct InterfaceConfig {
    /// Interface name (e.g. "eth0", "lo")
    pub name: String,
    /// Local IP address
    pub ip_addr: Ipv4Addr,
    /// Subnet mask
    pub netmask: Ipv4Addr,
    /// Largest IP datagram the link carries
    pub mtu: usize,
}

impl InterfaceConfig {
    /// Create an interface configuration with the default MTU
    pub fn new(name: &str, ip_addr: Ipv4Addr, netmask: Ipv4Addr) -> Self {
        Self {
            name: String::from(name),
            ip_addr,
            netmask,
            mtu: MTU,
        }
    }

    /// Override the MTU
    pub fn with_mtu(mut self, mtu: usize) -> Self {
        self.mtu = mtu;
        self
    }

    /// Check if configuration is valid (IP is not 0.0.0.0 and the MTU fits a header)
    pub fn is_valid(&self) -> bool {
        !self.ip_addr.is_unspecified() && self.mtu >= MIN_MTU
    }
}
