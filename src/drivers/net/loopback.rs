//! Loopback Network Interface
//!
//! A virtual device that echoes every transmitted frame back as a received
//! frame. Lets the whole stack talk to itself without hardware.

use alloc::string::String;
use alloc::vec::Vec;
use crossbeam_queue::ArrayQueue;

use super::{DeviceKind, LinkStatus, NetworkDevice, TransmitError};

/// Default number of frames the loopback can hold
pub const DEFAULT_QUEUE_SIZE: usize = 64;

/// Loopback network device
///
/// Transmitted frames land in a bounded queue and come back out of
/// `receive()` in order.
pub struct LoopbackDevice {
    name: String,
    mac_addr: [u8; 6],
    /// Frames waiting to be "received"
    rx_queue: ArrayQueue<Vec<u8>>,
}

impl LoopbackDevice {
    /// Create a new loopback device
    ///
    /// # Arguments
    /// * `name` - Interface name used for registry lookups
    /// * `mac_addr` - MAC address frames are filtered against
    /// * `max_queue_size` - Maximum number of frames held before transmit fails
    pub fn new(name: &str, mac_addr: [u8; 6], max_queue_size: usize) -> Self {
        Self {
            name: String::from(name),
            mac_addr,
            rx_queue: ArrayQueue::new(max_queue_size.max(1)),
        }
    }

    /// Number of frames waiting to be received
    pub fn pending(&self) -> usize {
        self.rx_queue.len()
    }
}

impl Default for LoopbackDevice {
    fn default() -> Self {
        Self::new("lo", [0x02, 0x00, 0x00, 0x00, 0x00, 0x01], DEFAULT_QUEUE_SIZE)
    }
}

impl NetworkDevice for LoopbackDevice {
    fn mac_address(&self) -> [u8; 6] {
        self.mac_addr
    }

    fn transmit(&mut self, packet: &[u8]) -> Result<(), TransmitError> {
        self.rx_queue
            .push(packet.to_vec())
            .map_err(|_| TransmitError::BufferFull)
    }

    fn receive(&mut self) -> Option<Vec<u8>> {
        self.rx_queue.pop()
    }

    fn link_status(&self) -> LinkStatus {
        LinkStatus::Up
    }

    fn device_name(&self) -> &str {
        &self.name
    }

    fn device_kind(&self) -> DeviceKind {
        DeviceKind::Loopback
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_loopback_echoes_in_order() {
        let mut lo = LoopbackDevice::default();
        lo.transmit(&[1, 2, 3]).unwrap();
        lo.transmit(&[4, 5]).unwrap();
        assert_eq!(lo.pending(), 2);
        assert_eq!(lo.receive(), Some(vec![1, 2, 3]));
        assert_eq!(lo.receive(), Some(vec![4, 5]));
        assert_eq!(lo.receive(), None);
    }

    #[test]
    fn test_loopback_full_queue_rejects() {
        let mut lo = LoopbackDevice::new("lo", [0; 6], 1);
        lo.transmit(&[1]).unwrap();
        assert_eq!(lo.transmit(&[2]), Err(TransmitError::BufferFull));
    }

    #[test]
    fn test_loopback_identity() {
        let lo = LoopbackDevice::default();
        assert_eq!(lo.device_name(), "lo");
        assert_eq!(lo.device_kind(), DeviceKind::Loopback);
        assert_eq!(lo.link_status(), LinkStatus::Up);
    }
}
