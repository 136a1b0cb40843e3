//! Network interfaces and the device registry
//!
//! A [`NetInterface`] wraps one driver together with the addressing the
//! stack needs for it (IP, netmask, gateway) and its administrative up/down
//! state. The registry keys interfaces by name.

use alloc::boxed::Box;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::net::Ipv4Addr;
use core::sync::atomic::{AtomicBool, Ordering};
use spin::Mutex;

use crate::drivers::net::{DeviceKind, LinkStatus, NetworkDevice, TransmitError};
use crate::net::ipv4::RoutingTable;

/// Network configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkConfig {
    /// Local IP address
    pub ip_addr: Ipv4Addr,
    /// Subnet mask
    pub netmask: Ipv4Addr,
    /// Default gateway
    pub gateway: Option<Ipv4Addr>,
}

impl NetworkConfig {
    /// Create a new network configuration
    pub fn new(ip_addr: Ipv4Addr, netmask: Ipv4Addr, gateway: Option<Ipv4Addr>) -> Self {
        Self {
            ip_addr,
            netmask,
            gateway,
        }
    }

    /// Unconfigured (0.0.0.0/0, no gateway)
    pub const fn unconfigured() -> Self {
        Self {
            ip_addr: Ipv4Addr::UNSPECIFIED,
            netmask: Ipv4Addr::UNSPECIFIED,
            gateway: None,
        }
    }

    /// Check if configuration is valid (IP is not 0.0.0.0)
    pub fn is_valid(&self) -> bool {
        !self.ip_addr.is_unspecified()
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self::unconfigured()
    }
}

/// A registered device plus its addressing
pub struct NetInterface {
    name: String,
    kind: DeviceKind,
    mac: [u8; 6],
    up: AtomicBool,
    config: Mutex<NetworkConfig>,
    device: Mutex<Box<dyn NetworkDevice>>,
}

impl NetInterface {
    /// Wrap a driver. The interface starts up if the link reports up.
    pub fn new(device: Box<dyn NetworkDevice>) -> Self {
        let name = String::from(device.device_name());
        let kind = device.device_kind();
        let mac = device.mac_address();
        let up = device.link_status() == LinkStatus::Up;

        Self {
            name,
            kind,
            mac,
            up: AtomicBool::new(up),
            config: Mutex::new(NetworkConfig::unconfigured()),
            device: Mutex::new(device),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> DeviceKind {
        self.kind
    }

    pub fn mac(&self) -> [u8; 6] {
        self.mac
    }

    pub fn is_up(&self) -> bool {
        self.up.load(Ordering::Acquire)
    }

    pub fn set_up(&self, up: bool) {
        self.up.store(up, Ordering::Release);
    }

    pub fn config(&self) -> NetworkConfig {
        *self.config.lock()
    }

    pub fn set_config(&self, config: NetworkConfig) {
        *self.config.lock() = config;
    }

    pub fn ip_addr(&self) -> Ipv4Addr {
        self.config.lock().ip_addr
    }

    pub fn routing_table(&self) -> RoutingTable {
        let config = self.config();
        RoutingTable::new(config.ip_addr, config.netmask, config.gateway)
    }

    /// Hand a finished frame to the driver
    pub fn transmit(&self, frame: &[u8]) -> Result<(), TransmitError> {
        self.device.lock().transmit(frame)
    }

    /// Pull one frame from the driver, if any
    pub fn receive(&self) -> Option<Vec<u8>> {
        self.device.lock().receive()
    }

    pub fn link_status(&self) -> LinkStatus {
        self.device.lock().link_status()
    }
}

/// Name-keyed set of interfaces
pub struct DeviceRegistry {
    devices: Mutex<Vec<Arc<NetInterface>>>,
}

impl DeviceRegistry {
    pub const fn new() -> Self {
        Self {
            devices: Mutex::new(Vec::new()),
        }
    }

    /// Add an interface, replacing any existing one with the same name
    pub fn register(&self, iface: Arc<NetInterface>) {
        let mut devices = self.devices.lock();
        match devices.iter_mut().find(|d| d.name() == iface.name()) {
            Some(slot) => *slot = iface,
            None => devices.push(iface),
        }
    }

    pub fn find(&self, name: &str) -> Option<Arc<NetInterface>> {
        self.devices.lock().iter().find(|d| d.name() == name).cloned()
    }

    pub fn remove(&self, name: &str) -> Option<Arc<NetInterface>> {
        let mut devices = self.devices.lock();
        let index = devices.iter().position(|d| d.name() == name)?;
        Some(devices.remove(index))
    }

    /// Snapshot of every registered interface
    pub fn all(&self) -> Vec<Arc<NetInterface>> {
        self.devices.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.devices.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.lock().is_empty()
    }
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::net::loopback::LoopbackDevice;

    fn lo(name: &str) -> Arc<NetInterface> {
        Arc::new(NetInterface::new(Box::new(LoopbackDevice::new(name, [2, 0, 0, 0, 0, 1], 4))))
    }

    #[test]
    fn test_register_replaces_same_name() {
        let registry = DeviceRegistry::new();
        let first = lo("eth0");
        let second = lo("eth0");
        registry.register(first.clone());
        registry.register(second.clone());
        assert_eq!(registry.len(), 1);
        assert!(Arc::ptr_eq(&registry.find("eth0").unwrap(), &second));
    }

    #[test]
    fn test_find_and_remove() {
        let registry = DeviceRegistry::new();
        registry.register(lo("eth0"));
        registry.register(lo("lo"));
        assert!(registry.find("lo").is_some());
        assert!(registry.remove("lo").is_some());
        assert!(registry.find("lo").is_none());
        assert!(registry.find("wlan0").is_none());
    }

    #[test]
    fn test_interface_starts_up_and_unconfigured() {
        let iface = lo("eth0");
        assert!(iface.is_up());
        assert!(!iface.config().is_valid());
        iface.set_config(NetworkConfig::new(
            Ipv4Addr::new(10, 0, 0, 2),
            Ipv4Addr::new(255, 255, 255, 0),
            Some(Ipv4Addr::new(10, 0, 0, 1)),
        ));
        assert_eq!(iface.ip_addr(), Ipv4Addr::new(10, 0, 0, 2));
        iface.set_up(false);
        assert!(!iface.is_up());
    }
}
