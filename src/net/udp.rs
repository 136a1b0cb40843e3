//! UDP Protocol Implementation (RFC 768)
//!
//! Connectionless datagrams. Each open port owns a bounded inbox; datagrams
//! for ports nobody opened are dropped on arrival.

use alloc::collections::{BTreeMap, VecDeque};
use alloc::vec::Vec;
use core::fmt;
use core::net::Ipv4Addr;
use spin::Mutex;

use crate::error::{NetError, NetResult};
use crate::net::checksum::pseudo_header_checksum;
use crate::net::interface::NetInterface;
use crate::net::ipv4::{self, protocol};
use crate::net::stack::NetworkStack;
use crate::serial_println;

/// Minimum UDP header size (8 bytes)
pub const UDP_HEADER_SIZE: usize = 8;

/// UDP port range for ephemeral (dynamic) port allocation
pub const EPHEMERAL_PORT_START: u16 = 49152;
pub const EPHEMERAL_PORT_END: u16 = 65535;

/// UDP packet structure
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdpPacket {
    /// Source port (0-65535)
    pub src_port: u16,
    /// Destination port (0-65535)
    pub dest_port: u16,
    /// Length of UDP header + data (minimum 8 bytes)
    pub length: u16,
    /// Checksum (optional for IPv4, can be 0)
    pub checksum: u16,
    /// Payload data
    pub data: Vec<u8>,
}

/// Errors that can occur while parsing UDP packets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UdpError {
    /// Packet is too short to contain a valid UDP header
    PacketTooShort,
    /// Length field doesn't match actual packet size
    InvalidLength,
}

impl fmt::Display for UdpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UdpError::PacketTooShort => write!(f, "UDP packet too short"),
            UdpError::InvalidLength => write!(f, "UDP length field out of range"),
        }
    }
}

impl From<UdpError> for NetError {
    fn from(_: UdpError) -> Self {
        NetError::InvalidArg
    }
}

impl UdpPacket {
    /// Create a new UDP packet (checksum left at 0)
    pub fn new(src_port: u16, dest_port: u16, data: Vec<u8>) -> Self {
        let length = (UDP_HEADER_SIZE + data.len()) as u16;
        Self {
            src_port,
            dest_port,
            length,
            checksum: 0,
            data,
        }
    }

    /// Parse a UDP packet from raw bytes
    ///
    /// # Returns
    /// * `Ok(UdpPacket)` - Successfully parsed packet
    /// * `Err(UdpError)` - Parsing failed
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, UdpError> {
        if bytes.len() < UDP_HEADER_SIZE {
            return Err(UdpError::PacketTooShort);
        }

        let length = u16::from_be_bytes([bytes[4], bytes[5]]);
        if (length as usize) < UDP_HEADER_SIZE || length as usize > bytes.len() {
            return Err(UdpError::InvalidLength);
        }

        Ok(Self {
            src_port: u16::from_be_bytes([bytes[0], bytes[1]]),
            dest_port: u16::from_be_bytes([bytes[2], bytes[3]]),
            length,
            checksum: u16::from_be_bytes([bytes[6], bytes[7]]),
            data: bytes[UDP_HEADER_SIZE..length as usize].to_vec(),
        })
    }

    /// Serialize the UDP packet to bytes, header first
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.length as usize);
        bytes.extend_from_slice(&self.src_port.to_be_bytes());
        bytes.extend_from_slice(&self.dest_port.to_be_bytes());
        bytes.extend_from_slice(&self.length.to_be_bytes());
        bytes.extend_from_slice(&self.checksum.to_be_bytes());
        bytes.extend_from_slice(&self.data);
        bytes
    }

    /// Calculate UDP checksum with pseudo-header
    ///
    /// A computed value of zero is sent as 0xFFFF (RFC 768).
    pub fn calculate_checksum(&self, src_ip: Ipv4Addr, dest_ip: Ipv4Addr) -> u16 {
        let mut unsummed = self.clone();
        unsummed.checksum = 0;
        match pseudo_header_checksum(src_ip, dest_ip, protocol::UDP, &unsummed.to_bytes()) {
            0 => 0xFFFF,
            sum => sum,
        }
    }
}

/// A queued inbound datagram
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram {
    pub src_ip: Ipv4Addr,
    pub src_port: u16,
    pub data: Vec<u8>,
}

/// Per-port receive queues
///
/// A port must be opened before anything is queued for it. A full inbox
/// drops the newly arrived datagram.
pub struct UdpInboxes {
    ports: Mutex<BTreeMap<u16, VecDeque<Datagram>>>,
    depth: usize,
}

impl UdpInboxes {
    pub fn new(depth: usize) -> Self {
        Self {
            ports: Mutex::new(BTreeMap::new()),
            depth,
        }
    }

    /// Open an inbox for `port`. Returns `false` if it was already open.
    pub fn open(&self, port: u16) -> bool {
        let mut ports = self.ports.lock();
        if ports.contains_key(&port) {
            return false;
        }
        ports.insert(port, VecDeque::new());
        true
    }

    /// Close `port`, discarding anything still queued
    pub fn close(&self, port: u16) {
        self.ports.lock().remove(&port);
    }

    pub fn is_open(&self, port: u16) -> bool {
        self.ports.lock().contains_key(&port)
    }

    /// Queue a datagram for `port`
    ///
    /// # Returns
    /// * `NotFound` - port is not open
    /// * `OutOfMemory` - inbox full, datagram dropped
    pub fn deliver(&self, port: u16, datagram: Datagram) -> NetResult<()> {
        let mut ports = self.ports.lock();
        let inbox = ports.get_mut(&port).ok_or(NetError::NotFound)?;
        if inbox.len() >= self.depth {
            return Err(NetError::OutOfMemory);
        }
        inbox.push_back(datagram);
        Ok(())
    }

    /// Pop the oldest datagram queued for `port`
    pub fn pop(&self, port: u16) -> Option<Datagram> {
        self.ports.lock().get_mut(&port)?.pop_front()
    }

    /// Number of datagrams waiting on `port`
    pub fn pending(&self, port: u16) -> usize {
        self.ports.lock().get(&port).map_or(0, VecDeque::len)
    }

    /// Pick a free port in the ephemeral range and open it
    pub fn open_ephemeral(&self) -> NetResult<u16> {
        let mut ports = self.ports.lock();
        let port = (EPHEMERAL_PORT_START..=EPHEMERAL_PORT_END)
            .find(|p| !ports.contains_key(p))
            .ok_or(NetError::OutOfMemory)?;
        ports.insert(port, VecDeque::new());
        Ok(port)
    }
}

/// Send one datagram from `src_port` to `dest_ip:dest_port`
///
/// The source address in the pseudo-header is the primary interface's
/// current address, which is 0.0.0.0 while unconfigured.
pub fn send(
    stack: &NetworkStack,
    dest_ip: Ipv4Addr,
    dest_port: u16,
    src_port: u16,
    data: &[u8],
) -> NetResult<()> {
    if data.is_empty() {
        return Err(NetError::InvalidArg);
    }
    let iface = stack.primary_interface()?;
    send_via(stack, &iface, dest_ip, dest_port, src_port, data)
}

/// [`send`] on an explicit interface
pub fn send_via(
    stack: &NetworkStack,
    iface: &NetInterface,
    dest_ip: Ipv4Addr,
    dest_port: u16,
    src_port: u16,
    data: &[u8],
) -> NetResult<()> {
    if data.is_empty() || UDP_HEADER_SIZE + data.len() > u16::MAX as usize {
        return Err(NetError::InvalidArg);
    }

    let mut packet = UdpPacket::new(src_port, dest_port, data.to_vec());
    packet.checksum = packet.calculate_checksum(iface.ip_addr(), dest_ip);

    ipv4::send_via(stack, iface, dest_ip, protocol::UDP, &packet.to_bytes())
}

/// Handle an inbound UDP packet
///
/// The checksum is carried but not verified.
pub fn handle_packet(
    stack: &NetworkStack,
    src_ip: Ipv4Addr,
    dest_ip: Ipv4Addr,
    data: &[u8],
) -> NetResult<()> {
    let packet = UdpPacket::from_bytes(data)?;

    let port = packet.dest_port;
    let datagram = Datagram {
        src_ip,
        src_port: packet.src_port,
        data: packet.data,
    };

    stack.udp().deliver(port, datagram).map_err(|e| {
        match e {
            NetError::NotFound => {
                serial_println!("[UDP] No listener on {}:{}, dropping", dest_ip, port)
            }
            _ => serial_println!("[UDP] Inbox for port {} full, dropping", port),
        }
        e
    })
}

/// Poll the devices, then pop the oldest datagram waiting on `port`
pub fn receive(stack: &NetworkStack, port: u16) -> NetResult<Datagram> {
    stack.poll();
    stack.udp().pop(port).ok_or(NetError::NotFound)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn datagram(byte: u8) -> Datagram {
        Datagram {
            src_ip: Ipv4Addr::new(10, 0, 0, 1),
            src_port: 53,
            data: vec![byte],
        }
    }

    #[test]
    fn test_header_layout() {
        let packet = UdpPacket::new(68, 67, vec![1, 2, 3, 4]);
        let bytes = packet.to_bytes();
        assert_eq!(&bytes[0..6], &[0, 68, 0, 67, 0, 12]);
        assert_eq!(UdpPacket::from_bytes(&bytes).unwrap(), packet);
    }

    #[test]
    fn test_checksum_verifies_to_zero() {
        let src = Ipv4Addr::new(192, 168, 1, 2);
        let dst = Ipv4Addr::new(192, 168, 1, 1);
        let mut packet = UdpPacket::new(1234, 53, b"hello".to_vec());
        packet.checksum = packet.calculate_checksum(src, dst);
        assert_ne!(packet.checksum, 0);
        assert_eq!(pseudo_header_checksum(src, dst, protocol::UDP, &packet.to_bytes()), 0);
    }

    #[test]
    fn test_parse_rejects_bad_length() {
        assert_eq!(UdpPacket::from_bytes(&[0; 7]), Err(UdpError::PacketTooShort));
        let mut bytes = UdpPacket::new(1, 2, vec![0; 4]).to_bytes();
        bytes[5] = 40;
        assert_eq!(UdpPacket::from_bytes(&bytes), Err(UdpError::InvalidLength));
    }

    #[test]
    fn test_parse_ignores_trailing_padding() {
        let mut bytes = UdpPacket::new(1, 2, vec![9, 9]).to_bytes();
        bytes.extend_from_slice(&[0; 10]);
        assert_eq!(UdpPacket::from_bytes(&bytes).unwrap().data, vec![9, 9]);
    }

    #[test]
    fn test_inbox_requires_open_port() {
        let inboxes = UdpInboxes::new(4);
        assert_eq!(inboxes.deliver(5000, datagram(1)), Err(NetError::NotFound));
        assert!(inboxes.open(5000));
        assert!(!inboxes.open(5000));
        inboxes.deliver(5000, datagram(1)).unwrap();
        assert_eq!(inboxes.pending(5000), 1);
        inboxes.close(5000);
        assert!(inboxes.pop(5000).is_none());
    }

    #[test]
    fn test_full_inbox_drops_newest() {
        let inboxes = UdpInboxes::new(2);
        inboxes.open(7);
        inboxes.deliver(7, datagram(1)).unwrap();
        inboxes.deliver(7, datagram(2)).unwrap();
        assert_eq!(inboxes.deliver(7, datagram(3)), Err(NetError::OutOfMemory));
        assert_eq!(inboxes.pop(7).unwrap().data, vec![1]);
        assert_eq!(inboxes.pop(7).unwrap().data, vec![2]);
        assert!(inboxes.pop(7).is_none());
    }

    #[test]
    fn test_ephemeral_ports_are_distinct() {
        let inboxes = UdpInboxes::new(1);
        let a = inboxes.open_ephemeral().unwrap();
        let b = inboxes.open_ephemeral().unwrap();
        assert_ne!(a, b);
        assert!(a >= EPHEMERAL_PORT_START);
    }
}
