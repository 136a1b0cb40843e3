//! IPv4 Protocol Implementation
//!
//! Implements IPv4 packet parsing, building, checksum calculation, and routing.
//! Options are skipped on receive and never sent; fragmentation is not
//! supported in either direction.
//!
//! # References
//! - RFC 791: Internet Protocol (IPv4)
//! - RFC 1071: Computing the Internet Checksum

use alloc::vec::Vec;
use core::fmt;

/// IPv4 Address type (re-export for convenience)
pub use core::net::Ipv4Addr;

use crate::error::{NetError, NetResult};
use crate::net::checksum::internet_checksum;
use crate::net::ethernet::{self, EthernetFrame, ProtocolHandler, BROADCAST_MAC, ETHERTYPE_IPV4};
use crate::net::interface::NetInterface;
use crate::net::stack::NetworkStack;
use crate::net::{arp, icmp, tcp, udp};
use crate::serial_println;

/// IPv4 Protocol Numbers (IANA assigned)
pub mod protocol {
    pub const ICMP: u8 = 1;
    pub const TCP: u8 = 6;
    pub const UDP: u8 = 17;
}

/// Default TTL (Time To Live) value
pub const DEFAULT_TTL: u8 = 64;

/// Minimum IPv4 header size (without options)
pub const MIN_HEADER_SIZE: usize = 20;

/// Limited broadcast address
pub const BROADCAST: Ipv4Addr = Ipv4Addr::BROADCAST;

/// IPv4 Header Structure
///
/// ```text
/// 0                   1                   2                   3
/// 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |Version|  IHL  |      TOS      |         Total Length          |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |         Identification        |Flags|      Fragment Offset    |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |  Time to Live |    Protocol   |         Header Checksum       |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                       Source Address                          |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                    Destination Address                        |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ipv4Header {
    /// Internet Header Length in 32-bit words (5-15)
    pub ihl: u8,
    /// Type of service
    pub tos: u8,
    /// Total packet length (header + data) in bytes
    pub total_length: u16,
    /// Identification field
    pub identification: u16,
    /// Flags (3 bits) and fragment offset (13 bits), as on the wire
    pub flags_fragment: u16,
    /// Time To Live (hops)
    pub ttl: u8,
    /// Protocol number (ICMP=1, TCP=6, UDP=17)
    pub protocol: u8,
    /// Header checksum
    pub checksum: u16,
    /// Source IP address
    pub src_ip: Ipv4Addr,
    /// Destination IP address
    pub dest_ip: Ipv4Addr,
}

impl Ipv4Header {
    /// Create a new 20-byte header
    ///
    /// TOS, identification and flags are zero; TTL is [`DEFAULT_TTL`]. The
    /// checksum is filled in by [`to_bytes`](Self::to_bytes).
    pub fn new(src_ip: Ipv4Addr, dest_ip: Ipv4Addr, protocol: u8, payload_len: u16) -> Self {
        Self {
            ihl: 5,
            tos: 0,
            total_length: (MIN_HEADER_SIZE as u16).saturating_add(payload_len),
            identification: 0,
            flags_fragment: 0,
            ttl: DEFAULT_TTL,
            protocol,
            checksum: 0,
            src_ip,
            dest_ip,
        }
    }

    /// Parse an IPv4 header from raw bytes
    ///
    /// # Returns
    /// - `Ok((Ipv4Header, payload_offset))` - Parsed header and offset to payload data
    /// - `Err(Ipv4Error)` - Parse error
    ///
    /// # Validation
    /// - Checks minimum length
    /// - Validates version field (must be 4)
    /// - Validates IHL (must be >= 5)
    /// - Validates total_length (must be >= header length)
    /// - Verifies header checksum
    pub fn from_bytes(data: &[u8]) -> Result<(Self, usize), Ipv4Error> {
        if data.len() < MIN_HEADER_SIZE {
            return Err(Ipv4Error::PacketTooShort);
        }

        let version = data[0] >> 4;
        let ihl = data[0] & 0x0F;

        if version != 4 {
            return Err(Ipv4Error::InvalidVersion(version));
        }
        if ihl < 5 {
            return Err(Ipv4Error::InvalidIhl(ihl));
        }

        let header_len = (ihl as usize) * 4;
        if data.len() < header_len {
            return Err(Ipv4Error::PacketTooShort);
        }

        let total_length = u16::from_be_bytes([data[2], data[3]]);
        if (total_length as usize) < header_len {
            return Err(Ipv4Error::InvalidLength);
        }

        if internet_checksum(&data[..header_len]) != 0 {
            return Err(Ipv4Error::ChecksumMismatch);
        }

        let header = Self {
            ihl,
            tos: data[1],
            total_length,
            identification: u16::from_be_bytes([data[4], data[5]]),
            flags_fragment: u16::from_be_bytes([data[6], data[7]]),
            ttl: data[8],
            protocol: data[9],
            checksum: u16::from_be_bytes([data[10], data[11]]),
            src_ip: Ipv4Addr::new(data[12], data[13], data[14], data[15]),
            dest_ip: Ipv4Addr::new(data[16], data[17], data[18], data[19]),
        };

        Ok((header, header_len))
    }

    /// Serialize the header, computing the checksum
    ///
    /// Always emits a 20-byte header.
    pub fn to_bytes(&self) -> [u8; MIN_HEADER_SIZE] {
        let mut bytes = [0u8; MIN_HEADER_SIZE];
        bytes[0] = 0x45;
        bytes[1] = self.tos;
        bytes[2..4].copy_from_slice(&self.total_length.to_be_bytes());
        bytes[4..6].copy_from_slice(&self.identification.to_be_bytes());
        bytes[6..8].copy_from_slice(&self.flags_fragment.to_be_bytes());
        bytes[8] = self.ttl;
        bytes[9] = self.protocol;
        bytes[12..16].copy_from_slice(&self.src_ip.octets());
        bytes[16..20].copy_from_slice(&self.dest_ip.octets());

        let checksum = checksum(&bytes);
        bytes[10..12].copy_from_slice(&checksum.to_be_bytes());
        bytes
    }

    /// Get the payload data from a packet, trimmed to `total_length`
    ///
    /// Ethernet padding past `total_length` is dropped here.
    pub fn payload<'a>(&self, data: &'a [u8]) -> &'a [u8] {
        let header_len = self.header_length();
        let end = (self.total_length as usize).min(data.len());
        if end <= header_len {
            &[]
        } else {
            &data[header_len..end]
        }
    }

    /// Get the header length in bytes
    pub fn header_length(&self) -> usize {
        (self.ihl as usize) * 4
    }
}

/// IPv4 header checksum (RFC 1071)
///
/// One's complement of the one's complement sum of the header's 16-bit
/// words. The header's checksum field must be zero. The result is meant to be
/// stored big-endian (`to_be_bytes`).
pub fn checksum(header: &[u8]) -> u16 {
    internet_checksum(header)
}

/// Determines if a destination IP is local (same subnet) or requires a gateway.
#[derive(Debug, Clone)]
pub struct RoutingTable {
    /// Our local IP address
    pub local_ip: Ipv4Addr,
    /// Network mask (e.g., 255.255.255.0)
    pub netmask: Ipv4Addr,
    /// Default gateway (if any)
    pub gateway: Option<Ipv4Addr>,
}

impl RoutingTable {
    /// Create a new routing table
    pub fn new(local_ip: Ipv4Addr, netmask: Ipv4Addr, gateway: Option<Ipv4Addr>) -> Self {
        Self {
            local_ip,
            netmask,
            gateway,
        }
    }

    /// Determine the next hop for a destination IP
    ///
    /// # Returns
    /// - `Some(ip)` - Next hop IP (either destination if local, or gateway)
    /// - `None` - No route available
    pub fn next_hop(&self, dest_ip: Ipv4Addr) -> Option<Ipv4Addr> {
        if self.is_local(dest_ip) {
            Some(dest_ip)
        } else {
            self.gateway
        }
    }

    /// Check if a destination IP is on the local subnet
    pub fn is_local(&self, dest_ip: Ipv4Addr) -> bool {
        let mask = u32::from(self.netmask);
        (u32::from(dest_ip) & mask) == (u32::from(self.local_ip) & mask)
    }

    /// Check if an IP is our local address
    pub fn is_our_ip(&self, ip: Ipv4Addr) -> bool {
        ip == self.local_ip
    }
}

/// IPv4 Error Types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ipv4Error {
    /// Packet is too short to contain a valid header
    PacketTooShort,
    /// Invalid IP version (not 4)
    InvalidVersion(u8),
    /// Invalid IHL (Internet Header Length < 5)
    InvalidIhl(u8),
    /// Invalid total length field
    InvalidLength,
    /// Header checksum mismatch
    ChecksumMismatch,
}

impl fmt::Display for Ipv4Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Ipv4Error::PacketTooShort => write!(f, "Packet too short"),
            Ipv4Error::InvalidVersion(v) => write!(f, "Invalid IP version: {}", v),
            Ipv4Error::InvalidIhl(ihl) => write!(f, "Invalid IHL: {}", ihl),
            Ipv4Error::InvalidLength => write!(f, "Invalid total length"),
            Ipv4Error::ChecksumMismatch => write!(f, "Checksum mismatch"),
        }
    }
}

impl From<Ipv4Error> for NetError {
    fn from(err: Ipv4Error) -> Self {
        match err {
            Ipv4Error::ChecksumMismatch => NetError::Failed,
            _ => NetError::InvalidArg,
        }
    }
}

/// Send `payload` to `dest_ip` through the primary interface
///
/// The link-layer destination is the broadcast MAC for 255.255.255.255,
/// the destination itself when it shares our subnet, and the gateway
/// otherwise. A failed ARP lookup aborts the send; nothing is queued.
pub fn send(stack: &NetworkStack, dest_ip: Ipv4Addr, protocol: u8, payload: &[u8]) -> NetResult<()> {
    let iface = stack.primary_interface()?;
    send_via(stack, &iface, dest_ip, protocol, payload)
}

/// [`send`] on an explicit interface
pub fn send_via(
    stack: &NetworkStack,
    iface: &NetInterface,
    dest_ip: Ipv4Addr,
    protocol: u8,
    payload: &[u8],
) -> NetResult<()> {
    if !iface.is_up() {
        return Err(NetError::DeviceNotFound);
    }
    let total = MIN_HEADER_SIZE + payload.len();
    if total > u16::MAX as usize {
        return Err(NetError::InvalidArg);
    }

    let config = iface.config();
    let dest_mac = if dest_ip == BROADCAST {
        BROADCAST_MAC
    } else {
        let hop = iface.routing_table().next_hop(dest_ip).ok_or(NetError::NotFound)?;
        arp::resolve(stack, iface, hop)?
    };

    let header = Ipv4Header::new(config.ip_addr, dest_ip, protocol, payload.len() as u16);
    let mut packet = Vec::with_capacity(total);
    packet.extend_from_slice(&header.to_bytes());
    packet.extend_from_slice(payload);

    ethernet::send(iface, dest_mac, ETHERTYPE_IPV4, &packet)
}

/// Validate an inbound packet and hand its payload to the transport layer
///
/// Accepts packets for our address, the limited broadcast address, or any
/// address while the interface is still unconfigured (DHCP). Protocols
/// without a handler are absorbed.
pub fn receive(stack: &NetworkStack, iface: &NetInterface, data: &[u8]) -> NetResult<()> {
    let (header, _) = Ipv4Header::from_bytes(data).map_err(|e| {
        serial_println!("[IPv4] Dropping packet: {}", e);
        NetError::from(e)
    })?;

    let our_ip = iface.ip_addr();
    if header.dest_ip != our_ip && header.dest_ip != BROADCAST && !our_ip.is_unspecified() {
        return Err(NetError::NotFound);
    }

    let payload = header.payload(data);
    match header.protocol {
        protocol::ICMP => icmp::handle_packet(stack, header.src_ip, payload),
        protocol::UDP => udp::handle_packet(stack, header.src_ip, header.dest_ip, payload),
        protocol::TCP => tcp::handle_segment(stack, header.src_ip, header.dest_ip, payload),
        other => {
            serial_println!("[IPv4] Ignoring protocol {} from {}", other, header.src_ip);
            Ok(())
        }
    }
}

/// Ethernet handler for EtherType 0x0800
pub struct Ipv4Handler;

impl ProtocolHandler for Ipv4Handler {
    fn handle_frame(
        &self,
        stack: &NetworkStack,
        iface: &NetInterface,
        frame: &EthernetFrame,
    ) -> NetResult<()> {
        receive(stack, iface, &frame.payload)
    }
}
