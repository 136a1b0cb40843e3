//! Network Stack Integration
//!
//! [`NetworkStack`] owns every table the protocol layers share: devices,
//! EtherType handlers, the ARP cache, UDP inboxes, TCP connections, sockets,
//! the echo-reply log and resolver state. Each table has its own lock and
//! no lock is held while a frame is transmitted.
//!
//! The kernel normally installs one instance with [`network_init`] and
//! reaches it through [`stack`]; tests build their own.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use conquer_once::spin::OnceCell;
use core::net::Ipv4Addr;

use crate::config::StackConfig;
use crate::drivers::net::NetworkDevice;
use crate::error::{NetError, NetResult};
use crate::net::arp::{ArpCache, ArpHandler};
use crate::net::dhcp::DhcpClient;
use crate::net::dns::DnsResolver;
use crate::net::ethernet::{self, HandlerTable, ProtocolHandler, ETHERTYPE_ARP, ETHERTYPE_IPV4};
use crate::net::icmp::EchoLog;
use crate::net::interface::{DeviceRegistry, NetInterface, NetworkConfig};
use crate::net::ipv4::Ipv4Handler;
use crate::net::socket::SocketTable;
use crate::net::tcp::TcpTable;
use crate::net::udp::UdpInboxes;
use crate::serial_println;
use crate::timer::{self, Clock};

/// Frames taken from one device per [`NetworkStack::poll`]
const MAX_FRAMES_PER_POLL: usize = 256;

/// All protocol state for one host
pub struct NetworkStack {
    config: StackConfig,
    clock: Arc<dyn Clock>,
    devices: DeviceRegistry,
    handlers: HandlerTable,
    arp: ArpCache,
    echo: EchoLog,
    udp: UdpInboxes,
    tcp: TcpTable,
    sockets: SocketTable,
    dns: DnsResolver,
    dhcp: DhcpClient,
}

impl NetworkStack {
    /// Build a stack with ARP and IPv4 handlers registered
    pub fn new(config: StackConfig, clock: Arc<dyn Clock>) -> Self {
        let stack = Self {
            clock,
            devices: DeviceRegistry::new(),
            handlers: HandlerTable::new(config.max_handlers),
            arp: ArpCache::new(config.arp_cache_size),
            echo: EchoLog::new(),
            udp: UdpInboxes::new(config.udp_queue_depth),
            tcp: TcpTable::new(config.max_tcp_connections, config.tcp_window, config.tcp_mss),
            sockets: SocketTable::new(config.max_sockets),
            dns: DnsResolver::new(config.default_nameserver),
            dhcp: DhcpClient::new(),
            config,
        };

        for (ethertype, handler) in [
            (ETHERTYPE_ARP, Arc::new(ArpHandler) as Arc<dyn ProtocolHandler>),
            (ETHERTYPE_IPV4, Arc::new(Ipv4Handler) as Arc<dyn ProtocolHandler>),
        ] {
            if let Err(e) = stack.handlers.register(ethertype, handler) {
                serial_println!("[ETH] Could not register handler for {:#06x}: {}", ethertype, e);
            }
        }
        stack
    }

    pub fn config(&self) -> &StackConfig {
        &self.config
    }

    pub fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    pub fn devices(&self) -> &DeviceRegistry {
        &self.devices
    }

    pub fn handlers(&self) -> &HandlerTable {
        &self.handlers
    }

    pub fn arp(&self) -> &ArpCache {
        &self.arp
    }

    pub fn echo(&self) -> &EchoLog {
        &self.echo
    }

    pub fn udp(&self) -> &UdpInboxes {
        &self.udp
    }

    pub fn tcp(&self) -> &TcpTable {
        &self.tcp
    }

    pub fn sockets(&self) -> &SocketTable {
        &self.sockets
    }

    pub fn dns(&self) -> &DnsResolver {
        &self.dns
    }

    pub fn dhcp(&self) -> &DhcpClient {
        &self.dhcp
    }

    /// Add a driver under its device name, replacing any interface of the
    /// same name
    pub fn register_device(&self, device: Box<dyn NetworkDevice>) -> Arc<NetInterface> {
        let iface = Arc::new(NetInterface::new(device));
        serial_println!(
            "[ETH] Registered {} ({:?}) {}",
            iface.name(),
            iface.kind(),
            crate::net::arp::format_mac(&iface.mac())
        );
        self.devices.register(iface.clone());
        iface
    }

    pub fn find_device(&self, name: &str) -> Option<Arc<NetInterface>> {
        self.devices.find(name)
    }

    /// The interface IP traffic leaves through
    ///
    /// `DeviceNotFound` if it is not registered. Whether it is up is left to
    /// the caller.
    pub fn primary_interface(&self) -> NetResult<Arc<NetInterface>> {
        self.devices
            .find(&self.config.primary_device)
            .ok_or(NetError::DeviceNotFound)
    }

    /// Assign an address to `name`
    pub fn set_ip(
        &self,
        name: &str,
        ip: Ipv4Addr,
        netmask: Ipv4Addr,
        gateway: Option<Ipv4Addr>,
    ) -> NetResult<()> {
        let iface = self.find_device(name).ok_or(NetError::DeviceNotFound)?;
        iface.set_config(NetworkConfig::new(ip, netmask, gateway));
        serial_println!("[IPv4] {} configured: {} / {} gateway {:?}", name, ip, netmask, gateway);
        Ok(())
    }

    /// Add or replace an EtherType handler
    pub fn register_handler(&self, ethertype: u16, handler: Arc<dyn ProtocolHandler>) -> NetResult<()> {
        self.handlers.register(ethertype, handler)
    }

    /// Drain pending frames from every up device
    ///
    /// Dropped frames are not errors here. Returns the number of frames
    /// taken off the devices.
    pub fn poll(&self) -> usize {
        let mut frames = 0;
        for iface in self.devices.all() {
            if !iface.is_up() {
                continue;
            }
            for _ in 0..MAX_FRAMES_PER_POLL {
                match ethernet::receive(self, &iface) {
                    Ok(false) => break,
                    Ok(true) | Err(_) => frames += 1,
                }
            }
        }
        frames
    }

    /// Poll the devices and run `check` until it yields or `timeout_ms`
    /// passes
    pub fn wait_for<T>(&self, timeout_ms: u64, mut check: impl FnMut() -> Option<T>) -> Option<T> {
        timer::poll_until(self.clock(), timeout_ms, || {
            self.poll();
            check()
        })
    }

    /// Dump interfaces and tables to the log
    pub fn log_config(&self) {
        let devices: Vec<Arc<NetInterface>> = self.devices.all();
        serial_println!("[ETH] {} device(s)", devices.len());
        for iface in devices {
            let config = iface.config();
            serial_println!(
                "[ETH]   {} {} {} ip {} mask {} gw {:?}",
                iface.name(),
                if iface.is_up() { "up" } else { "down" },
                crate::net::arp::format_mac(&iface.mac()),
                config.ip_addr,
                config.netmask,
                config.gateway
            );
        }
        serial_println!("[ARP] {} cached entries", self.arp.len());
        serial_println!("[TCP] {} connection(s)", self.tcp.len());
        serial_println!("[DNS] Nameserver {}", self.dns.nameserver());
    }
}

static STACK: OnceCell<NetworkStack> = OnceCell::uninit();

/// Install the process-wide stack
///
/// `AlreadyExists` if called twice.
pub fn network_init(config: StackConfig, clock: Arc<dyn Clock>) -> NetResult<&'static NetworkStack> {
    STACK
        .try_init_once(|| NetworkStack::new(config, clock))
        .map_err(|_| NetError::AlreadyExists)?;
    serial_println!("[ETH] Network stack initialized");
    stack()
}

/// The stack installed by [`network_init`]
pub fn stack() -> NetResult<&'static NetworkStack> {
    STACK.try_get().map_err(|_| NetError::InvalidState)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::net::loopback::LoopbackDevice;
    use crate::timer::TickClock;

    fn new_stack() -> NetworkStack {
        let config = StackConfig::default().with_primary_device("lo");
        NetworkStack::new(config, Arc::new(TickClock::new()))
    }

    #[test]
    fn test_new_registers_arp_and_ipv4() {
        let stack = new_stack();
        assert!(stack.handlers().lookup(ETHERTYPE_ARP).is_some());
        assert!(stack.handlers().lookup(ETHERTYPE_IPV4).is_some());
        assert_eq!(stack.handlers().len(), 2);
    }

    #[test]
    fn test_primary_interface_lookup() {
        let stack = new_stack();
        assert_eq!(stack.primary_interface().err(), Some(NetError::DeviceNotFound));

        stack.register_device(Box::new(LoopbackDevice::default()));
        assert_eq!(stack.primary_interface().map(|i| i.is_up()), Ok(true));
    }

    #[test]
    fn test_set_ip() {
        let stack = new_stack();
        let lo = Ipv4Addr::new(127, 0, 0, 1);
        let mask = Ipv4Addr::new(255, 0, 0, 0);
        assert_eq!(stack.set_ip("lo", lo, mask, None), Err(NetError::DeviceNotFound));

        let iface = stack.register_device(Box::new(LoopbackDevice::default()));
        stack.set_ip("lo", lo, mask, None).unwrap();
        assert_eq!(iface.ip_addr(), lo);
    }

    #[test]
    fn test_poll_with_no_traffic() {
        let stack = new_stack();
        stack.register_device(Box::new(LoopbackDevice::default()));
        assert_eq!(stack.poll(), 0);
        assert_eq!(stack.wait_for(0, || Some(1)), Some(1));
    }
}
