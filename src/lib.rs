//! Rustrial network stack
//!
//! In-kernel TCP/IP for Rustrial OS: Ethernet, ARP, IPv4, ICMP, UDP, TCP,
//! a DHCP client, a DNS stub resolver and a small BSD-style socket layer.
//!
//! Everything hangs off a [`net::stack::NetworkStack`] value. Drivers plug in
//! through [`drivers::net::NetworkDevice`]; the rest of the kernel talks to the
//! socket API or the ping/DHCP/DNS helpers.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod serial;
pub mod error;
pub mod config;
pub mod timer;

//Network drivers
pub mod drivers;

//Networking infrastructure
pub mod net;

pub use error::NetError;
pub use net::stack::{network_init, stack, NetworkStack};
