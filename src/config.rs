//! Stack configuration
//!
//! Table capacities, timeouts and defaults. [`StackConfig::default`] matches
//! the limits the rest of the kernel expects; callers override individual
//! values with the `with_*` builders before handing the config to
//! [`NetworkStack::new`](crate::net::stack::NetworkStack::new).

use alloc::string::String;
use core::net::Ipv4Addr;

/// ARP cache slots
pub const ARP_CACHE_SIZE: usize = 64;
/// EtherType handler slots
pub const MAX_ETHERTYPE_HANDLERS: usize = 16;
/// Live TCP connections, listeners included
pub const MAX_TCP_CONNECTIONS: usize = 32;
/// TCP receive ring and advertised window
pub const TCP_WINDOW_SIZE: usize = 4096;
/// Largest TCP payload per segment (1500 - 20 IP - 20 TCP)
pub const TCP_MSS: usize = 1460;
/// Live sockets
pub const MAX_SOCKETS: usize = 64;
/// Datagrams queued per UDP port
pub const UDP_QUEUE_DEPTH: usize = 32;
/// DHCP poll attempts per phase (OFFER, then ACK)
pub const DHCP_RETRIES: u32 = 3;
/// Wait per DHCP attempt
pub const DHCP_RETRY_INTERVAL_MS: u64 = 1000;
/// Echo reply wait
pub const PING_TIMEOUT_MS: u64 = 5000;
/// DNS answer wait
pub const DNS_TIMEOUT_MS: u64 = 5000;
/// ARP reply wait for the blocking helpers
pub const ARP_WAIT_MS: u64 = 1000;
/// Fallback resolver (8.8.8.8)
pub const DEFAULT_NAMESERVER: Ipv4Addr = Ipv4Addr::new(8, 8, 8, 8);
/// Interface used for IP traffic
pub const PRIMARY_DEVICE: &str = "eth0";

/// Tunables for one [`NetworkStack`](crate::net::stack::NetworkStack)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackConfig {
    pub arp_cache_size: usize,
    pub max_handlers: usize,
    pub max_tcp_connections: usize,
    pub tcp_window: usize,
    pub tcp_mss: usize,
    pub max_sockets: usize,
    pub udp_queue_depth: usize,
    pub dhcp_retries: u32,
    pub dhcp_retry_interval_ms: u64,
    pub ping_timeout_ms: u64,
    pub dns_timeout_ms: u64,
    pub arp_wait_ms: u64,
    pub default_nameserver: Ipv4Addr,
    /// Name of the interface IP traffic leaves through
    pub primary_device: String,
}

impl Default for StackConfig {
    fn default() -> Self {
        Self {
            arp_cache_size: ARP_CACHE_SIZE,
            max_handlers: MAX_ETHERTYPE_HANDLERS,
            max_tcp_connections: MAX_TCP_CONNECTIONS,
            tcp_window: TCP_WINDOW_SIZE,
            tcp_mss: TCP_MSS,
            max_sockets: MAX_SOCKETS,
            udp_queue_depth: UDP_QUEUE_DEPTH,
            dhcp_retries: DHCP_RETRIES,
            dhcp_retry_interval_ms: DHCP_RETRY_INTERVAL_MS,
            ping_timeout_ms: PING_TIMEOUT_MS,
            dns_timeout_ms: DNS_TIMEOUT_MS,
            arp_wait_ms: ARP_WAIT_MS,
            default_nameserver: DEFAULT_NAMESERVER,
            primary_device: String::from(PRIMARY_DEVICE),
        }
    }
}

impl StackConfig {
    pub fn with_primary_device(mut self, name: &str) -> Self {
        self.primary_device = String::from(name);
        self
    }

    pub fn with_arp_cache_size(mut self, slots: usize) -> Self {
        self.arp_cache_size = slots;
        self
    }

    pub fn with_max_tcp_connections(mut self, max: usize) -> Self {
        self.max_tcp_connections = max;
        self
    }

    pub fn with_max_sockets(mut self, max: usize) -> Self {
        self.max_sockets = max;
        self
    }

    pub fn with_udp_queue_depth(mut self, depth: usize) -> Self {
        self.udp_queue_depth = depth;
        self
    }

    pub fn with_dhcp_retries(mut self, retries: u32, interval_ms: u64) -> Self {
        self.dhcp_retries = retries;
        self.dhcp_retry_interval_ms = interval_ms;
        self
    }

    pub fn with_ping_timeout(mut self, timeout_ms: u64) -> Self {
        self.ping_timeout_ms = timeout_ms;
        self
    }

    pub fn with_dns_timeout(mut self, timeout_ms: u64) -> Self {
        self.dns_timeout_ms = timeout_ms;
        self
    }

    pub fn with_arp_wait(mut self, wait_ms: u64) -> Self {
        self.arp_wait_ms = wait_ms;
        self
    }

    pub fn with_nameserver(mut self, nameserver: Ipv4Addr) -> Self {
        self.default_nameserver = nameserver;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_kernel_limits() {
        let config = StackConfig::default();
        assert_eq!(config.arp_cache_size, 64);
        assert_eq!(config.max_handlers, 16);
        assert_eq!(config.max_tcp_connections, 32);
        assert_eq!(config.tcp_window, 4096);
        assert_eq!(config.dhcp_retries, 3);
        assert_eq!(config.ping_timeout_ms, 5000);
        assert_eq!(config.default_nameserver, Ipv4Addr::new(8, 8, 8, 8));
        assert_eq!(config.primary_device, "eth0");
    }

    #[test]
    fn test_builders_override_single_fields() {
        let config = StackConfig::default()
            .with_primary_device("wlan0")
            .with_dhcp_retries(5, 200);
        assert_eq!(config.primary_device, "wlan0");
        assert_eq!(config.dhcp_retries, 5);
        assert_eq!(config.dhcp_retry_interval_ms, 200);
        assert_eq!(config.arp_cache_size, ARP_CACHE_SIZE);
    }
}
