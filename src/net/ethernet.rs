//Ethernet Frame Layer (OSI Layer 2)
//
//Handles Ethernet frame parsing, building, and dispatching.
//Frame structure: [Dest MAC (6)][Src MAC (6)][EtherType (2)][Payload (46-1500)]
//The NIC appends and strips the FCS, so it never appears here.

use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::Mutex;

use crate::error::{NetError, NetResult};
use crate::net::interface::NetInterface;
use crate::net::stack::NetworkStack;
use crate::serial_println;

/// EtherType constants
pub const ETHERTYPE_IPV4: u16 = 0x0800;
pub const ETHERTYPE_ARP: u16 = 0x0806;

/// Broadcast MAC address (FF:FF:FF:FF:FF:FF)
pub const BROADCAST_MAC: [u8; 6] = [0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF];

/// Ethernet frame header size
pub const HEADER_SIZE: usize = 14;

/// Shortest frame put on the wire (header + 46 bytes payload, no FCS)
pub const MIN_FRAME_SIZE: usize = 60;

/// Represents an Ethernet frame
#[derive(Debug, Clone, PartialEq)]
pub struct EthernetFrame {
    /// Destination MAC address (6 bytes)
    pub dest_mac: [u8; 6],
    /// Source MAC address (6 bytes)
    pub src_mac: [u8; 6],
    /// EtherType field (2 bytes) - indicates protocol of payload
    pub ethertype: u16,
    /// Payload data, including any trailing pad bytes
    pub payload: Vec<u8>,
}

impl EthernetFrame {
    /// # Arguments
    /// * `dest` - Destination MAC address
    /// * `src` - Source MAC address
    /// * `ethertype` - Protocol type (e.g., 0x0800 for IPv4, 0x0806 for ARP)
    /// * `payload` - Frame payload data
    pub fn new(dest: [u8; 6], src: [u8; 6], ethertype: u16, payload: Vec<u8>) -> Self {
        Self {
            dest_mac: dest,
            src_mac: src,
            ethertype,
            payload,
        }
    }

    /// Parse an Ethernet frame from raw bytes
    ///
    /// Frames shorter than the 14-byte header are rejected with `InvalidArg`.
    pub fn from_bytes(data: &[u8]) -> NetResult<Self> {
        if data.len() < HEADER_SIZE {
            return Err(NetError::InvalidArg);
        }

        let mut dest_mac = [0u8; 6];
        dest_mac.copy_from_slice(&data[0..6]);

        let mut src_mac = [0u8; 6];
        src_mac.copy_from_slice(&data[6..12]);

        let ethertype = u16::from_be_bytes([data[12], data[13]]);

        Ok(Self {
            dest_mac,
            src_mac,
            ethertype,
            payload: data[HEADER_SIZE..].to_vec(),
        })
    }

    /// Convert the frame to bytes, zero-padded to the 60-byte minimum
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut frame = Vec::with_capacity((HEADER_SIZE + self.payload.len()).max(MIN_FRAME_SIZE));

        frame.extend_from_slice(&self.dest_mac);
        frame.extend_from_slice(&self.src_mac);
        frame.extend_from_slice(&self.ethertype.to_be_bytes());
        frame.extend_from_slice(&self.payload);

        if frame.len() < MIN_FRAME_SIZE {
            frame.resize(MIN_FRAME_SIZE, 0x00);
        }

        frame
    }

    /// Check if the frame is a broadcast frame
    pub fn is_broadcast(&self) -> bool {
        self.dest_mac == BROADCAST_MAC
    }

    /// Whether a station with `our_mac` should accept this frame
    pub fn is_for(&self, our_mac: [u8; 6]) -> bool {
        self.is_broadcast() || self.dest_mac == our_mac
    }
}

/// Protocol handler trait for frame dispatching
pub trait ProtocolHandler: Send + Sync {
    /// Handle a received frame that passed address filtering
    fn handle_frame(
        &self,
        stack: &NetworkStack,
        iface: &NetInterface,
        frame: &EthernetFrame,
    ) -> NetResult<()>;
}

/// EtherType-keyed handler table
///
/// Registering an EtherType that is already present replaces its handler.
/// New EtherTypes are refused once `capacity` entries exist.
pub struct HandlerTable {
    entries: Mutex<Vec<(u16, Arc<dyn ProtocolHandler>)>>,
    capacity: usize,
}

impl HandlerTable {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(Vec::with_capacity(capacity)),
            capacity,
        }
    }

    pub fn register(&self, ethertype: u16, handler: Arc<dyn ProtocolHandler>) -> NetResult<()> {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.iter_mut().find(|(ty, _)| *ty == ethertype) {
            entry.1 = handler;
            return Ok(());
        }
        if entries.len() >= self.capacity {
            return Err(NetError::OutOfMemory);
        }
        entries.push((ethertype, handler));
        Ok(())
    }

    pub fn unregister(&self, ethertype: u16) -> bool {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|(ty, _)| *ty != ethertype);
        entries.len() != before
    }

    pub fn lookup(&self, ethertype: u16) -> Option<Arc<dyn ProtocolHandler>> {
        self.entries
            .lock()
            .iter()
            .find(|(ty, _)| *ty == ethertype)
            .map(|(_, handler)| handler.clone())
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

/// Build and transmit one frame on `iface`
///
/// # Returns
/// * `InvalidArg` - empty payload
/// * `DeviceNotFound` - interface is down or the driver is not ready
/// * `Failed` - any other driver transmit error
pub fn send(iface: &NetInterface, dest_mac: [u8; 6], ethertype: u16, payload: &[u8]) -> NetResult<()> {
    if payload.is_empty() {
        return Err(NetError::InvalidArg);
    }
    if !iface.is_up() {
        return Err(NetError::DeviceNotFound);
    }

    let frame = EthernetFrame::new(dest_mac, iface.mac(), ethertype, payload.to_vec());
    iface.transmit(&frame.to_bytes()).map_err(|e| {
        serial_println!("[ETH] {}: transmit failed: {}", iface.name(), e);
        NetError::from(e)
    })
}

/// Pull one frame from the device and dispatch it
///
/// # Returns
/// * `Ok(false)` - the device had nothing pending
/// * `Ok(true)` - a frame was received and handled
/// * `Err(_)` - a frame was received but dropped (see [`process_frame`])
pub fn receive(stack: &NetworkStack, iface: &NetInterface) -> NetResult<bool> {
    match iface.receive() {
        Some(data) => process_frame(stack, iface, &data).map(|_| true),
        None => Ok(false),
    }
}

/// Validate, filter and dispatch a raw frame
///
/// # Returns
/// * `InvalidArg` - shorter than the Ethernet header
/// * `NotFound` - addressed to another station
/// * `NotSupported` - no handler registered for the EtherType
pub fn process_frame(stack: &NetworkStack, iface: &NetInterface, data: &[u8]) -> NetResult<()> {
    let frame = EthernetFrame::from_bytes(data)?;

    if !frame.is_for(iface.mac()) {
        return Err(NetError::NotFound);
    }

    let handler = stack
        .handlers()
        .lookup(frame.ethertype)
        .ok_or(NetError::NotSupported)?;

    handler.handle_frame(stack, iface, &frame)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Nop;

    impl ProtocolHandler for Nop {
        fn handle_frame(&self, _: &NetworkStack, _: &NetInterface, _: &EthernetFrame) -> NetResult<()> {
            Ok(())
        }
    }

    #[test]
    fn test_frame_padded_to_minimum() {
        let frame = EthernetFrame::new(BROADCAST_MAC, [1, 2, 3, 4, 5, 6], ETHERTYPE_ARP, vec![0xAA; 28]);
        let bytes = frame.to_bytes();
        assert_eq!(bytes.len(), MIN_FRAME_SIZE);
        assert_eq!(&bytes[0..6], &BROADCAST_MAC);
        assert_eq!(&bytes[6..12], &[1, 2, 3, 4, 5, 6]);
        assert_eq!(&bytes[12..14], &[0x08, 0x06]);
        assert!(bytes[HEADER_SIZE + 28..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_large_frame_not_padded() {
        let frame = EthernetFrame::new(BROADCAST_MAC, [0; 6], ETHERTYPE_IPV4, vec![7; 100]);
        assert_eq!(frame.to_bytes().len(), HEADER_SIZE + 100);
    }

    #[test]
    fn test_parse_rejects_short_frame() {
        assert_eq!(EthernetFrame::from_bytes(&[0u8; 13]), Err(NetError::InvalidArg));
    }

    #[test]
    fn test_parse_fields() {
        let mut raw = vec![0xFF; 6];
        raw.extend_from_slice(&[0x52, 0x54, 0x00, 0x12, 0x34, 0x56]);
        raw.extend_from_slice(&[0x08, 0x00]);
        raw.extend_from_slice(&[1, 2, 3]);
        let frame = EthernetFrame::from_bytes(&raw).unwrap();
        assert!(frame.is_broadcast());
        assert_eq!(frame.src_mac, [0x52, 0x54, 0x00, 0x12, 0x34, 0x56]);
        assert_eq!(frame.ethertype, ETHERTYPE_IPV4);
        assert_eq!(frame.payload, vec![1, 2, 3]);
    }

    #[test]
    fn test_address_filter() {
        let ours = [2, 0, 0, 0, 0, 9];
        let unicast = EthernetFrame::new(ours, [0; 6], ETHERTYPE_IPV4, Vec::new());
        let other = EthernetFrame::new([2, 0, 0, 0, 0, 8], [0; 6], ETHERTYPE_IPV4, Vec::new());
        let broadcast = EthernetFrame::new(BROADCAST_MAC, [0; 6], ETHERTYPE_IPV4, Vec::new());
        assert!(unicast.is_for(ours));
        assert!(!other.is_for(ours));
        assert!(broadcast.is_for(ours));
    }

    #[test]
    fn test_handler_table_replace_and_capacity() {
        let table = HandlerTable::new(2);
        table.register(ETHERTYPE_IPV4, Arc::new(Nop)).unwrap();
        table.register(ETHERTYPE_IPV4, Arc::new(Nop)).unwrap();
        assert_eq!(table.len(), 1);

        table.register(ETHERTYPE_ARP, Arc::new(Nop)).unwrap();
        assert_eq!(table.register(0x86DD, Arc::new(Nop)), Err(NetError::OutOfMemory));
        assert!(table.lookup(ETHERTYPE_ARP).is_some());
        assert!(table.lookup(0x86DD).is_none());

        assert!(table.unregister(ETHERTYPE_ARP));
        assert!(table.lookup(ETHERTYPE_ARP).is_none());
    }
}
