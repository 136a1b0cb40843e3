//! ARP (Address Resolution Protocol) - RFC 826
//!
//! Maps IPv4 addresses to MAC addresses on local networks.
//! Packet format: [HW Type (2)][Proto Type (2)][HW Len (1)][Proto Len (1)]
//!                [Operation (2)][Sender MAC (6)][Sender IP (4)]
//!                [Target MAC (6)][Target IP (4)]
//!
//! Resolution never blocks: a cache miss sends a broadcast request and fails
//! the lookup. Replies are cached as they arrive, whether or not we asked.

use alloc::string::String;
use alloc::vec::Vec;
use core::fmt;
use core::net::Ipv4Addr;
use spin::Mutex;

use crate::error::{NetError, NetResult};
use crate::net::ethernet::{self, EthernetFrame, ProtocolHandler, BROADCAST_MAC, ETHERTYPE_ARP};
use crate::net::interface::NetInterface;
use crate::net::stack::NetworkStack;
use crate::serial_println;

/// ARP hardware type for Ethernet
pub const HW_TYPE_ETHERNET: u16 = 1;

/// ARP protocol type for IPv4
pub const PROTO_TYPE_IPV4: u16 = 0x0800;

/// ARP operation codes
pub const ARP_REQUEST: u16 = 1;
pub const ARP_REPLY: u16 = 2;

/// ARP packet size (fixed at 28 bytes)
pub const ARP_PACKET_SIZE: usize = 28;

/// Errors that can occur while parsing ARP packets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArpError {
    /// Packet is too short to be valid
    PacketTooShort,
    /// Invalid hardware type (not Ethernet)
    InvalidHardwareType,
    /// Invalid protocol type (not IPv4)
    InvalidProtocolType,
    /// Invalid hardware or protocol address length
    InvalidAddressLength,
    /// Unknown operation code
    UnknownOperation,
}

impl fmt::Display for ArpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArpError::PacketTooShort => write!(f, "ARP packet too short"),
            ArpError::InvalidHardwareType => write!(f, "Unsupported hardware type"),
            ArpError::InvalidProtocolType => write!(f, "Unsupported protocol type"),
            ArpError::InvalidAddressLength => write!(f, "Unexpected address length"),
            ArpError::UnknownOperation => write!(f, "Unknown ARP operation"),
        }
    }
}

impl From<ArpError> for NetError {
    fn from(err: ArpError) -> Self {
        match err {
            ArpError::PacketTooShort => NetError::InvalidArg,
            _ => NetError::NotSupported,
        }
    }
}

/// ARP packet structure
#[derive(Debug, Clone, PartialEq)]
pub struct ArpPacket {
    /// Operation (1 = request, 2 = reply)
    pub operation: u16,
    /// Sender MAC address
    pub sender_mac: [u8; 6],
    /// Sender IP address
    pub sender_ip: Ipv4Addr,
    /// Target MAC address
    pub target_mac: [u8; 6],
    /// Target IP address
    pub target_ip: Ipv4Addr,
}

impl ArpPacket {
    /// Create a new ARP request packet
    ///
    /// # Arguments
    /// * `sender_mac` - Our MAC address
    /// * `sender_ip` - Our IP address
    /// * `target_ip` - The IP address we want to resolve
    pub fn new_request(sender_mac: [u8; 6], sender_ip: Ipv4Addr, target_ip: Ipv4Addr) -> Self {
        Self {
            operation: ARP_REQUEST,
            sender_mac,
            sender_ip,
            target_mac: [0; 6], // Unknown, set to zeros
            target_ip,
        }
    }

    /// Create a new ARP reply packet
    ///
    /// # Arguments
    /// * `sender_mac` - Our MAC address
    /// * `sender_ip` - Our IP address
    /// * `target_mac` - The MAC address of the requester
    /// * `target_ip` - The IP address of the requester
    pub fn new_reply(
        sender_mac: [u8; 6],
        sender_ip: Ipv4Addr,
        target_mac: [u8; 6],
        target_ip: Ipv4Addr,
    ) -> Self {
        Self {
            operation: ARP_REPLY,
            sender_mac,
            sender_ip,
            target_mac,
            target_ip,
        }
    }

    /// Parse an ARP packet from raw bytes
    ///
    /// Trailing bytes (Ethernet padding) are ignored.
    pub fn from_bytes(data: &[u8]) -> Result<Self, ArpError> {
        if data.len() < ARP_PACKET_SIZE {
            return Err(ArpError::PacketTooShort);
        }

        if u16::from_be_bytes([data[0], data[1]]) != HW_TYPE_ETHERNET {
            return Err(ArpError::InvalidHardwareType);
        }
        if u16::from_be_bytes([data[2], data[3]]) != PROTO_TYPE_IPV4 {
            return Err(ArpError::InvalidProtocolType);
        }
        if data[4] != 6 || data[5] != 4 {
            return Err(ArpError::InvalidAddressLength);
        }

        let operation = u16::from_be_bytes([data[6], data[7]]);
        if operation != ARP_REQUEST && operation != ARP_REPLY {
            return Err(ArpError::UnknownOperation);
        }

        let mut sender_mac = [0u8; 6];
        sender_mac.copy_from_slice(&data[8..14]);
        let sender_ip = Ipv4Addr::new(data[14], data[15], data[16], data[17]);

        let mut target_mac = [0u8; 6];
        target_mac.copy_from_slice(&data[18..24]);
        let target_ip = Ipv4Addr::new(data[24], data[25], data[26], data[27]);

        Ok(Self {
            operation,
            sender_mac,
            sender_ip,
            target_mac,
            target_ip,
        })
    }

    /// Convert the ARP packet to bytes for transmission
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(ARP_PACKET_SIZE);
        bytes.extend_from_slice(&HW_TYPE_ETHERNET.to_be_bytes());
        bytes.extend_from_slice(&PROTO_TYPE_IPV4.to_be_bytes());
        bytes.push(6);
        bytes.push(4);
        bytes.extend_from_slice(&self.operation.to_be_bytes());
        bytes.extend_from_slice(&self.sender_mac);
        bytes.extend_from_slice(&self.sender_ip.octets());
        bytes.extend_from_slice(&self.target_mac);
        bytes.extend_from_slice(&self.target_ip.octets());
        bytes
    }

    /// Check if this is an ARP request
    pub fn is_request(&self) -> bool {
        self.operation == ARP_REQUEST
    }

    /// Check if this is an ARP reply
    pub fn is_reply(&self) -> bool {
        self.operation == ARP_REPLY
    }
}

/// One cache slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArpEntry {
    pub ip: Ipv4Addr,
    pub mac: [u8; 6],
    /// Clock reading (ms) when the entry was last written. Not used for expiry.
    pub timestamp: u64,
    pub valid: bool,
}

impl ArpEntry {
    const EMPTY: ArpEntry = ArpEntry {
        ip: Ipv4Addr::UNSPECIFIED,
        mac: [0; 6],
        timestamp: 0,
        valid: false,
    };
}

/// Fixed-size ARP cache
///
/// An update reuses the slot already holding the IP, else the first free
/// slot, else the slot with the oldest timestamp (lowest index on ties).
/// Entries are never aged out.
pub struct ArpCache {
    slots: Mutex<Vec<ArpEntry>>,
}

impl ArpCache {
    /// Create a cache with `capacity` slots
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: Mutex::new(alloc::vec![ArpEntry::EMPTY; capacity]),
        }
    }

    /// Add or update an entry in the cache
    ///
    /// # Arguments
    /// * `ip` - IP address
    /// * `mac` - MAC address
    /// * `now` - Current clock reading in milliseconds
    pub fn insert(&self, ip: Ipv4Addr, mac: [u8; 6], now: u64) {
        let mut slots = self.slots.lock();
        if slots.is_empty() {
            return;
        }

        let index = slots
            .iter()
            .position(|e| e.valid && e.ip == ip)
            .or_else(|| slots.iter().position(|e| !e.valid))
            .unwrap_or_else(|| {
                let mut oldest = 0;
                for (i, entry) in slots.iter().enumerate() {
                    if entry.timestamp < slots[oldest].timestamp {
                        oldest = i;
                    }
                }
                oldest
            });

        slots[index] = ArpEntry {
            ip,
            mac,
            timestamp: now,
            valid: true,
        };
    }

    /// Look up a MAC address for an IP address
    pub fn lookup(&self, ip: Ipv4Addr) -> Option<[u8; 6]> {
        self.slots
            .lock()
            .iter()
            .find(|e| e.valid && e.ip == ip)
            .map(|e| e.mac)
    }

    /// Remove an entry from the cache
    pub fn remove(&self, ip: Ipv4Addr) -> bool {
        let mut slots = self.slots.lock();
        match slots.iter_mut().find(|e| e.valid && e.ip == ip) {
            Some(entry) => {
                *entry = ArpEntry::EMPTY;
                true
            }
            None => false,
        }
    }

    /// Number of valid entries
    pub fn len(&self) -> usize {
        self.slots.lock().iter().filter(|e| e.valid).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.slots.lock().len()
    }

    /// Clear all entries from the cache
    pub fn clear(&self) {
        for entry in self.slots.lock().iter_mut() {
            *entry = ArpEntry::EMPTY;
        }
    }

    /// Get all valid entries (for debugging/display)
    pub fn entries(&self) -> Vec<ArpEntry> {
        self.slots.lock().iter().filter(|e| e.valid).copied().collect()
    }
}

/// Broadcast a request for `target_ip` on `iface`
pub fn request(iface: &NetInterface, target_ip: Ipv4Addr) -> NetResult<()> {
    if !iface.is_up() {
        return Err(NetError::DeviceNotFound);
    }

    let packet = ArpPacket::new_request(iface.mac(), iface.ip_addr(), target_ip);
    serial_println!("[ARP] Who has {}? Tell {}", target_ip, iface.ip_addr());
    ethernet::send(iface, BROADCAST_MAC, ETHERTYPE_ARP, &packet.to_bytes())
}

/// Resolve `ip` from the cache
///
/// On a miss a broadcast request goes out and the lookup fails: the send
/// error if the request could not be sent, `NotFound` otherwise.
pub fn resolve(stack: &NetworkStack, iface: &NetInterface, ip: Ipv4Addr) -> NetResult<[u8; 6]> {
    if let Some(mac) = stack.arp().lookup(ip) {
        return Ok(mac);
    }

    request(iface, ip)?;
    Err(NetError::NotFound)
}

/// Resolve `ip`, polling the stack for a reply for up to `timeout_ms`
///
/// Only used by application-level helpers (ping, DNS). The IP send path
/// always uses the non-blocking [`resolve`].
pub fn resolve_blocking(
    stack: &NetworkStack,
    iface: &NetInterface,
    ip: Ipv4Addr,
    timeout_ms: u64,
) -> NetResult<[u8; 6]> {
    match resolve(stack, iface, ip) {
        Ok(mac) => return Ok(mac),
        Err(NetError::NotFound) => {}
        Err(e) => return Err(e),
    }

    stack
        .wait_for(timeout_ms, || stack.arp().lookup(ip))
        .ok_or(NetError::Timeout)
}

/// Handle an incoming ARP packet
///
/// Requests for our address are answered with a unicast reply. Replies are
/// cached unconditionally. A down interface neither answers nor learns.
pub fn handle_packet(stack: &NetworkStack, iface: &NetInterface, data: &[u8]) -> NetResult<()> {
    if !iface.is_up() {
        return Err(NetError::DeviceNotFound);
    }
    let packet = ArpPacket::from_bytes(data)?;
    let our_ip = iface.ip_addr();

    if packet.is_request() {
        if !our_ip.is_unspecified() && packet.target_ip == our_ip {
            let reply = ArpPacket::new_reply(iface.mac(), our_ip, packet.sender_mac, packet.sender_ip);
            return ethernet::send(iface, packet.sender_mac, ETHERTYPE_ARP, &reply.to_bytes());
        }
    } else if packet.is_reply() {
        serial_println!("[ARP] {} is at {}", packet.sender_ip, format_mac(&packet.sender_mac));
        stack.arp().insert(packet.sender_ip, packet.sender_mac, stack.clock().now_ms());
    }

    Ok(())
}

/// Ethernet handler for EtherType 0x0806
pub struct ArpHandler;

impl ProtocolHandler for ArpHandler {
    fn handle_frame(
        &self,
        stack: &NetworkStack,
        iface: &NetInterface,
        frame: &EthernetFrame,
    ) -> NetResult<()> {
        handle_packet(stack, iface, &frame.payload)
    }
}

/// Format a MAC address for display
pub fn format_mac(mac: &[u8; 6]) -> String {
    use alloc::format;
    format!(
        "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
        mac[0], mac[1], mac[2], mac[3], mac[4], mac[5]
    )
}
