//! Network stack implementation

pub mod config;
pub mod error;
pub mod buffer;
pub mod checksum;
pub mod ethernet;
pub mod arp;
pub mod ipv4;
pub mod reassembly;
pub mod icmp;
pub mod udp;
pub mod tcp;
pub mod timer;
pub mod socket;
pub mod stack;
pub mod loopback;

#[cfg(test)]
pub(crate) mod testing;
