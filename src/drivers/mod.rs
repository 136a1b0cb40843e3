//! Device drivers consumed by the network stack
pub mod net;
