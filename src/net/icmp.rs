//! ICMP (Internet Control Message Protocol) Implementation
//! RFC 792 - https://www.rfc-editor.org/rfc/rfc792
//!
//! Echo request/reply only. Inbound requests are answered in place; inbound
//! replies are logged so that [`ping`] can match them.

use alloc::collections::VecDeque;
use alloc::vec::Vec;
use core::fmt;
use core::net::Ipv4Addr;
use core::sync::atomic::{AtomicU16, Ordering};
use spin::Mutex;

use crate::error::{NetError, NetResult};
use crate::net::ipv4::{self, protocol, BROADCAST};
use crate::net::stack::NetworkStack;
use crate::net::{arp, dns};
use crate::net::checksum::internet_checksum;
use crate::serial_println;
use crate::timer::Deadline;

/// Identifier placed in every echo request sent by [`ping`]
pub const PING_IDENTIFIER: u16 = 0x5253;

/// Payload length of a ping request
pub const PING_PAYLOAD_SIZE: usize = 32;

/// Replies kept for matching before the oldest is discarded
const ECHO_LOG_DEPTH: usize = 16;

/// ICMP message types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IcmpType {
    /// Echo Reply (Type 0)
    EchoReply,
    /// Destination Unreachable (Type 3)
    DestinationUnreachable,
    /// Echo Request (Type 8)
    EchoRequest,
    /// Time Exceeded (Type 11)
    TimeExceeded,
    /// Unknown type
    Unknown(u8),
}

impl From<u8> for IcmpType {
    fn from(value: u8) -> Self {
        match value {
            0 => IcmpType::EchoReply,
            3 => IcmpType::DestinationUnreachable,
            8 => IcmpType::EchoRequest,
            11 => IcmpType::TimeExceeded,
            other => IcmpType::Unknown(other),
        }
    }
}

impl From<IcmpType> for u8 {
    fn from(icmp_type: IcmpType) -> Self {
        match icmp_type {
            IcmpType::EchoReply => 0,
            IcmpType::DestinationUnreachable => 3,
            IcmpType::EchoRequest => 8,
            IcmpType::TimeExceeded => 11,
            IcmpType::Unknown(val) => val,
        }
    }
}

impl fmt::Display for IcmpType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IcmpType::EchoReply => write!(f, "Echo Reply"),
            IcmpType::DestinationUnreachable => write!(f, "Destination Unreachable"),
            IcmpType::EchoRequest => write!(f, "Echo Request"),
            IcmpType::TimeExceeded => write!(f, "Time Exceeded"),
            IcmpType::Unknown(val) => write!(f, "Unknown({})", val),
        }
    }
}

/// ICMP parsing errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IcmpError {
    /// Packet too short (minimum 8 bytes)
    PacketTooShort,
    /// Invalid checksum
    InvalidChecksum,
}

impl fmt::Display for IcmpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IcmpError::PacketTooShort => write!(f, "ICMP packet too short"),
            IcmpError::InvalidChecksum => write!(f, "Invalid ICMP checksum"),
        }
    }
}

impl From<IcmpError> for NetError {
    fn from(err: IcmpError) -> Self {
        match err {
            IcmpError::PacketTooShort => NetError::InvalidArg,
            IcmpError::InvalidChecksum => NetError::Failed,
        }
    }
}

/// ICMP echo message
///
/// Format:
/// ```text
/// [Type (1)][Code (1)][Checksum (2)]
/// [Identifier (2)][Sequence (2)][Data (variable)]
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IcmpPacket {
    /// ICMP message type
    pub icmp_type: IcmpType,
    /// ICMP code (subtype)
    pub code: u8,
    /// Identifier (for echo request/reply)
    pub identifier: u16,
    /// Sequence number (for echo request/reply)
    pub sequence: u16,
    /// Payload data
    pub data: Vec<u8>,
}

impl IcmpPacket {
    /// Minimum ICMP packet size (header only)
    pub const MIN_SIZE: usize = 8;

    /// Parse an ICMP packet, verifying the checksum over the whole message
    pub fn from_bytes(data: &[u8]) -> Result<Self, IcmpError> {
        if data.len() < Self::MIN_SIZE {
            return Err(IcmpError::PacketTooShort);
        }
        if internet_checksum(data) != 0 {
            return Err(IcmpError::InvalidChecksum);
        }

        Ok(IcmpPacket {
            icmp_type: IcmpType::from(data[0]),
            code: data[1],
            identifier: u16::from_be_bytes([data[4], data[5]]),
            sequence: u16::from_be_bytes([data[6], data[7]]),
            data: data[Self::MIN_SIZE..].to_vec(),
        })
    }

    /// Serialize, computing the checksum over header and payload
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(Self::MIN_SIZE + self.data.len());
        bytes.push(self.icmp_type.into());
        bytes.push(self.code);
        bytes.extend_from_slice(&[0, 0]);
        bytes.extend_from_slice(&self.identifier.to_be_bytes());
        bytes.extend_from_slice(&self.sequence.to_be_bytes());
        bytes.extend_from_slice(&self.data);

        let checksum = internet_checksum(&bytes);
        bytes[2..4].copy_from_slice(&checksum.to_be_bytes());
        bytes
    }

    pub fn new_echo_request(identifier: u16, sequence: u16, data: Vec<u8>) -> Self {
        IcmpPacket {
            icmp_type: IcmpType::EchoRequest,
            code: 0,
            identifier,
            sequence,
            data,
        }
    }

    /// Create an ICMP echo reply mirroring a request's identifier,
    /// sequence and data
    pub fn create_echo_reply(request: &IcmpPacket) -> Self {
        IcmpPacket {
            icmp_type: IcmpType::EchoReply,
            code: 0,
            identifier: request.identifier,
            sequence: request.sequence,
            data: request.data.clone(),
        }
    }
}

impl fmt::Display for IcmpPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ICMP {} (code={}, id={}, seq={}, {} bytes data)",
            self.icmp_type,
            self.code,
            self.identifier,
            self.sequence,
            self.data.len()
        )
    }
}

/// A received echo reply
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EchoRecord {
    pub from: Ipv4Addr,
    pub identifier: u16,
    pub sequence: u16,
    /// Clock reading (ms) at arrival
    pub received_at: u64,
}

/// Recent echo replies and the outgoing sequence counter
pub struct EchoLog {
    replies: Mutex<VecDeque<EchoRecord>>,
    next_sequence: AtomicU16,
}

impl EchoLog {
    pub fn new() -> Self {
        Self {
            replies: Mutex::new(VecDeque::with_capacity(ECHO_LOG_DEPTH)),
            next_sequence: AtomicU16::new(1),
        }
    }

    /// Next ping sequence number (wraps)
    pub fn next_sequence(&self) -> u16 {
        self.next_sequence.fetch_add(1, Ordering::Relaxed)
    }

    /// Remember a reply, discarding the oldest once full
    pub fn record(&self, record: EchoRecord) {
        let mut replies = self.replies.lock();
        if replies.len() >= ECHO_LOG_DEPTH {
            replies.pop_front();
        }
        replies.push_back(record);
    }

    /// Remove and return the reply matching `from`/`identifier`/`sequence`
    pub fn take(&self, from: Ipv4Addr, identifier: u16, sequence: u16) -> Option<EchoRecord> {
        let mut replies = self.replies.lock();
        let index = replies
            .iter()
            .position(|r| r.from == from && r.identifier == identifier && r.sequence == sequence)?;
        replies.remove(index)
    }

    pub fn len(&self) -> usize {
        self.replies.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.replies.lock().is_empty()
    }
}

impl Default for EchoLog {
    fn default() -> Self {
        Self::new()
    }
}

/// Send an echo request to `dest`
pub fn send_echo(
    stack: &NetworkStack,
    dest: Ipv4Addr,
    identifier: u16,
    sequence: u16,
    payload: &[u8],
) -> NetResult<()> {
    let packet = IcmpPacket::new_echo_request(identifier, sequence, payload.to_vec());
    ipv4::send(stack, dest, protocol::ICMP, &packet.to_bytes())
}

/// Handle an inbound ICMP message from `src`
///
/// # Returns
/// * `InvalidArg` - shorter than 8 bytes
/// * `Failed` - checksum mismatch
/// * `NotSupported` - anything but echo request/reply
pub fn handle_packet(stack: &NetworkStack, src: Ipv4Addr, data: &[u8]) -> NetResult<()> {
    let packet = IcmpPacket::from_bytes(data)?;

    match packet.icmp_type {
        IcmpType::EchoRequest => {
            let reply = IcmpPacket::create_echo_reply(&packet);
            ipv4::send(stack, src, protocol::ICMP, &reply.to_bytes())
        }
        IcmpType::EchoReply => {
            stack.echo().record(EchoRecord {
                from: src,
                identifier: packet.identifier,
                sequence: packet.sequence,
                received_at: stack.clock().now_ms(),
            });
            Ok(())
        }
        other => {
            serial_println!("[ICMP] Unhandled {} from {}", other, src);
            Err(NetError::NotSupported)
        }
    }
}

fn ping_payload() -> Vec<u8> {
    (0..PING_PAYLOAD_SIZE).map(|i| b'a' + (i % 23) as u8).collect()
}

/// Send one echo request to `dest` and wait for the reply
///
/// The whole exchange, including next-hop resolution, is bounded by the
/// configured ping timeout.
///
/// # Returns
/// Round-trip time in milliseconds, or `Timeout`.
pub fn ping(stack: &NetworkStack, dest: Ipv4Addr) -> NetResult<u64> {
    let clock = stack.clock();
    let deadline = Deadline::after(clock, stack.config().ping_timeout_ms);

    let iface = stack.primary_interface()?;
    if dest != BROADCAST {
        let hop = iface.routing_table().next_hop(dest).ok_or(NetError::NotFound)?;
        arp::resolve_blocking(stack, &iface, hop, deadline.remaining_ms(clock))?;
    }

    let sequence = stack.echo().next_sequence();
    let sent_at = clock.now_ms();
    send_echo(stack, dest, PING_IDENTIFIER, sequence, &ping_payload())?;

    let reply = stack
        .wait_for(deadline.remaining_ms(clock), || {
            stack.echo().take(dest, PING_IDENTIFIER, sequence)
        })
        .ok_or(NetError::Timeout)?;

    let rtt = reply.received_at.saturating_sub(sent_at);
    serial_println!("[ICMP] Reply from {}: seq={} time={}ms", dest, sequence, rtt);
    Ok(rtt)
}

/// Resolve `hostname` through DNS, then [`ping`] it
///
/// # Returns
/// The resolved address and the round-trip time.
pub fn ping_hostname(stack: &NetworkStack, hostname: &str) -> NetResult<(Ipv4Addr, u64)> {
    let addr = dns::resolve(stack, hostname)?;
    ping(stack, addr).map(|rtt| (addr, rtt))
}
