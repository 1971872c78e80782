#![cfg_attr(not(test), no_std)]

//! Network protocol stack of the rustrial kernel.
//!
//! Ethernet dispatch, ARP, IPv4 (routing, fragmentation, reassembly), ICMP echo,
//! UDP and TCP, all owned by a single [`net::stack::NetStack`] context. The device
//! driver and the thread scheduler are consumed through the traits in
//! [`drivers::net`] and [`task`].

extern crate alloc;

//Collaborator interfaces
pub mod drivers;
pub mod task;

//Networking infrastructure
pub mod net;

pub use net::error::NetError;
pub use net::stack::NetStack;
