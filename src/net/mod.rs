//! Protocol layers, bottom to top

pub mod buffer;
pub mod checksum;
pub mod interface;
pub mod ethernet;
pub mod arp;
pub mod ipv4;
pub mod icmp;
pub mod udp;
pub mod tcp;
pub mod dhcp;
pub mod dns;
pub mod socket;
pub mod stack;
