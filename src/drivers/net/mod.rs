// Network Device Abstraction Layer
//
// Drivers implement `NetworkDevice`; the stack wraps each one in a
// `NetInterface` that carries its addressing and up/down state.
pub mod loopback;

use alloc::vec::Vec;
use core::fmt;

/// link status of a network interface
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkStatus {
    Up,
    Down,
    Unknown,
}

/// What sort of link a device drives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    Ethernet,
    Wifi,
    Loopback,
}

/// Errors that can occur during packet transmission
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransmitError {
    /// Packet too large for the device
    PacketTooLarge,
    /// TX buffer is full, try again later
    BufferFull,
    /// Device is not ready
    NotReady,
    /// Hardware error during transmission
    HardwareError,
    /// Device is not initialized
    NotInitialized,
}

impl fmt::Display for TransmitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransmitError::PacketTooLarge => write!(f, "Packet too large"),
            TransmitError::BufferFull => write!(f, "TX buffer full"),
            TransmitError::NotReady => write!(f, "Device not ready"),
            TransmitError::HardwareError => write!(f, "Hardware error"),
            TransmitError::NotInitialized => write!(f, "Device not initialized"),
        }
    }
}

impl From<TransmitError> for crate::error::NetError {
    fn from(err: TransmitError) -> Self {
        use crate::error::NetError;
        match err {
            TransmitError::NotReady | TransmitError::NotInitialized => NetError::DeviceNotFound,
            TransmitError::PacketTooLarge
            | TransmitError::BufferFull
            | TransmitError::HardwareError => NetError::Failed,
        }
    }
}

/// Network device trait that all network drivers must implement
pub trait NetworkDevice: Send + Sync {
    /// Get the MAC address of this device
    fn mac_address(&self) -> [u8; 6];

    /// Transmit a packet
    ///
    /// # Arguments
    /// * `packet` - The raw Ethernet frame to transmit (including header)
    ///
    /// # Returns
    /// * `Ok(())` if the packet was queued for transmission
    /// * `Err(TransmitError)` if transmission failed
    fn transmit(&mut self, packet: &[u8]) -> Result<(), TransmitError>;

    /// Receive a packet if one is available
    ///
    /// # Returns
    /// * `Some(packet)` if a packet was received
    /// * `None` if no packet is available
    fn receive(&mut self) -> Option<Vec<u8>>;

    /// Get the current link status
    fn link_status(&self) -> LinkStatus;

    /// Get device name/identifier
    fn device_name(&self) -> &str;

    /// Kind of link this device drives
    fn device_kind(&self) -> DeviceKind {
        DeviceKind::Ethernet
    }
}
