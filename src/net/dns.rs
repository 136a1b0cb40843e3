//! DNS stub resolver
//!
//! Resolves hostnames to IPv4 addresses with a single A query to the
//! configured nameserver. No caching, no retries, no TCP fallback.
//!
//! # RFC References
//! - RFC 1035: Domain Names - Implementation and Specification

use alloc::string::String;
use alloc::vec::Vec;
use core::fmt;
use core::net::{Ipv4Addr, SocketAddrV4};
use core::sync::atomic::{AtomicU16, Ordering};
use spin::Mutex;

use crate::error::{NetError, NetResult};
use crate::net::arp;
use crate::net::socket::{self, SocketType, AF_INET};
use crate::net::stack::NetworkStack;
use crate::serial_println;
use crate::timer::Deadline;

pub const DNS_PORT: u16 = 53;
pub const HEADER_SIZE: usize = 12;

/// Longest label and longest encoded name
pub const MAX_LABEL_LEN: usize = 63;
pub const MAX_NAME_LEN: usize = 255;

/// Resource record types
pub mod record_type {
    pub const A: u16 = 1;
    pub const CNAME: u16 = 5;
    pub const MX: u16 = 15;
    pub const TXT: u16 = 16;
    pub const AAAA: u16 = 28;
}

pub const CLASS_IN: u16 = 1;

/// Header flag bits
pub mod flags {
    pub const QR: u16 = 0x8000;
    pub const RD: u16 = 0x0100;
    pub const RA: u16 = 0x0080;
    pub const RCODE_MASK: u16 = 0x000F;
}

/// Response codes
pub mod rcode {
    pub const NO_ERROR: u8 = 0;
    pub const FORMAT_ERROR: u8 = 1;
    pub const SERVER_FAILURE: u8 = 2;
    pub const NAME_ERROR: u8 = 3;
    pub const NOT_IMPLEMENTED: u8 = 4;
    pub const REFUSED: u8 = 5;
}

/// DNS error types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DnsError {
    /// Empty or oversized label, or name too long
    InvalidName,
    /// Truncated or otherwise malformed message
    ParseError,
    /// Answer carries a different transaction id
    IdMismatch,
    /// Server answered with a non-zero rcode
    ServerError(u8),
    /// No A record among the answers
    NoRecords,
}

impl fmt::Display for DnsError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            DnsError::InvalidName => write!(f, "Invalid domain name"),
            DnsError::ParseError => write!(f, "Failed to parse DNS response"),
            DnsError::IdMismatch => write!(f, "DNS transaction id mismatch"),
            DnsError::ServerError(code) => write!(f, "DNS server returned rcode {}", code),
            DnsError::NoRecords => write!(f, "No A records found"),
        }
    }
}

impl From<DnsError> for NetError {
    fn from(err: DnsError) -> Self {
        match err {
            DnsError::InvalidName => NetError::InvalidArg,
            _ => NetError::NotFound,
        }
    }
}

/// DNS header (12 bytes)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DnsHeader {
    pub id: u16,
    pub flags: u16,
    pub qdcount: u16,
    pub ancount: u16,
    pub nscount: u16,
    pub arcount: u16,
}

impl DnsHeader {
    /// Standard query, recursion desired, one question
    pub fn query(id: u16) -> Self {
        Self {
            id,
            flags: flags::RD,
            qdcount: 1,
            ancount: 0,
            nscount: 0,
            arcount: 0,
        }
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, DnsError> {
        if data.len() < HEADER_SIZE {
            return Err(DnsError::ParseError);
        }
        let word = |at: usize| u16::from_be_bytes([data[at], data[at + 1]]);
        Ok(Self {
            id: word(0),
            flags: word(2),
            qdcount: word(4),
            ancount: word(6),
            nscount: word(8),
            arcount: word(10),
        })
    }

    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut bytes = [0u8; HEADER_SIZE];
        bytes[0..2].copy_from_slice(&self.id.to_be_bytes());
        bytes[2..4].copy_from_slice(&self.flags.to_be_bytes());
        bytes[4..6].copy_from_slice(&self.qdcount.to_be_bytes());
        bytes[6..8].copy_from_slice(&self.ancount.to_be_bytes());
        bytes[8..10].copy_from_slice(&self.nscount.to_be_bytes());
        bytes[10..12].copy_from_slice(&self.arcount.to_be_bytes());
        bytes
    }

    pub fn is_response(&self) -> bool {
        self.flags & flags::QR != 0
    }

    pub fn rcode(&self) -> u8 {
        (self.flags & flags::RCODE_MASK) as u8
    }
}

/// Encode a hostname as length-prefixed labels
///
/// "example.com" -> `[7]example[3]com[0]`. One trailing dot is accepted.
pub fn encode_name(name: &str) -> Result<Vec<u8>, DnsError> {
    let name = name.strip_suffix('.').unwrap_or(name);
    let mut encoded = Vec::with_capacity(name.len() + 2);

    for label in name.split('.') {
        if label.is_empty() || label.len() > MAX_LABEL_LEN {
            return Err(DnsError::InvalidName);
        }
        encoded.push(label.len() as u8);
        encoded.extend_from_slice(label.as_bytes());
    }
    encoded.push(0);

    if encoded.len() > MAX_NAME_LEN {
        return Err(DnsError::InvalidName);
    }
    Ok(encoded)
}

/// Decode a name starting at `offset`
///
/// Returns the dotted name and the offset just past it in the original
/// message. Only one compression pointer is followed.
pub fn decode_name(data: &[u8], offset: usize) -> Result<(String, usize), DnsError> {
    let mut name = String::new();
    let mut pos = offset;
    // Offset to resume at once a pointer has been taken
    let mut resume = None;

    loop {
        let len = *data.get(pos).ok_or(DnsError::ParseError)?;

        if len & 0xC0 == 0xC0 {
            if resume.is_some() {
                return Err(DnsError::ParseError);
            }
            let low = *data.get(pos + 1).ok_or(DnsError::ParseError)?;
            resume = Some(pos + 2);
            pos = u16::from_be_bytes([len & 0x3F, low]) as usize;
            continue;
        }

        if len == 0 {
            pos += 1;
            break;
        }

        let label = data
            .get(pos + 1..pos + 1 + len as usize)
            .ok_or(DnsError::ParseError)?;
        if !name.is_empty() {
            name.push('.');
        }
        name.extend(label.iter().map(|&b| b as char));
        pos += 1 + len as usize;
    }

    Ok((name, resume.unwrap_or(pos)))
}

/// Build an A/IN query for `name`
pub fn build_query(id: u16, name: &str) -> Result<Vec<u8>, DnsError> {
    let qname = encode_name(name)?;
    let mut packet = Vec::with_capacity(HEADER_SIZE + qname.len() + 4);
    packet.extend_from_slice(&DnsHeader::query(id).to_bytes());
    packet.extend_from_slice(&qname);
    packet.extend_from_slice(&record_type::A.to_be_bytes());
    packet.extend_from_slice(&CLASS_IN.to_be_bytes());
    Ok(packet)
}

/// Pull the first A record out of an answer to query `id`
pub fn parse_response(data: &[u8], id: u16) -> Result<Ipv4Addr, DnsError> {
    let header = DnsHeader::from_bytes(data)?;
    if header.id != id {
        return Err(DnsError::IdMismatch);
    }
    if !header.is_response() {
        return Err(DnsError::ParseError);
    }
    if header.rcode() != rcode::NO_ERROR {
        return Err(DnsError::ServerError(header.rcode()));
    }

    let mut offset = HEADER_SIZE;
    for _ in 0..header.qdcount {
        let (_, next) = decode_name(data, offset)?;
        // QTYPE + QCLASS
        offset = next + 4;
        if offset > data.len() {
            return Err(DnsError::ParseError);
        }
    }

    for _ in 0..header.ancount {
        let (_, next) = decode_name(data, offset)?;
        let fixed = data.get(next..next + 10).ok_or(DnsError::ParseError)?;
        let rtype = u16::from_be_bytes([fixed[0], fixed[1]]);
        let rclass = u16::from_be_bytes([fixed[2], fixed[3]]);
        let rdlength = u16::from_be_bytes([fixed[8], fixed[9]]) as usize;

        let rdata_start = next + 10;
        let rdata = data
            .get(rdata_start..rdata_start + rdlength)
            .ok_or(DnsError::ParseError)?;

        if rtype == record_type::A && rclass == CLASS_IN && rdlength == 4 {
            return Ok(Ipv4Addr::new(rdata[0], rdata[1], rdata[2], rdata[3]));
        }
        offset = rdata_start + rdlength;
    }

    Err(DnsError::NoRecords)
}

/// Resolver state owned by the stack
pub struct DnsResolver {
    nameserver: Mutex<Ipv4Addr>,
    next_id: AtomicU16,
}

impl DnsResolver {
    pub fn new(nameserver: Ipv4Addr) -> Self {
        Self {
            nameserver: Mutex::new(nameserver),
            next_id: AtomicU16::new(1),
        }
    }

    pub fn nameserver(&self) -> Ipv4Addr {
        *self.nameserver.lock()
    }

    pub fn set_nameserver(&self, server: Ipv4Addr) {
        *self.nameserver.lock() = server;
        serial_println!("[DNS] Nameserver set to {}", server);
    }

    pub fn next_id(&self) -> u16 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }
}

fn query(stack: &NetworkStack, fd: socket::SocketFd, hostname: &str) -> NetResult<Ipv4Addr> {
    let resolver = stack.dns();
    let id = resolver.next_id();
    let packet = build_query(id, hostname)?;

    let clock = stack.clock();
    let deadline = Deadline::after(clock, stack.config().dns_timeout_ms);
    let nameserver = resolver.nameserver();

    // The send path never waits on ARP, so warm the cache for the next hop first
    let iface = stack.primary_interface()?;
    let hop = iface.routing_table().next_hop(nameserver).ok_or(NetError::NotFound)?;
    arp::resolve_blocking(stack, &iface, hop, deadline.remaining_ms(clock))?;

    socket::bind(stack, fd, SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0))?;
    socket::connect(stack, fd, SocketAddrV4::new(nameserver, DNS_PORT))?;
    socket::send(stack, fd, &packet)?;

    let mut buf = [0u8; 512];
    let answer = stack.wait_for(deadline.remaining_ms(clock), || {
        match socket::recv(stack, fd, &mut buf) {
            Ok(n) => Some(parse_response(&buf[..n], id)),
            Err(_) => None,
        }
    });

    match answer {
        Some(result) => Ok(result?),
        None => Err(NetError::Timeout),
    }
}

/// Resolve `hostname` to an IPv4 address
///
/// A dotted-quad literal is returned as is without touching the network.
///
/// # Returns
/// * `InvalidArg` - the name cannot be encoded
/// * `Timeout` - no answer within `dns_timeout_ms`
/// * `NotFound` - the answer was malformed, an error, or had no A record
pub fn resolve(stack: &NetworkStack, hostname: &str) -> NetResult<Ipv4Addr> {
    if let Ok(addr) = hostname.parse::<Ipv4Addr>() {
        return Ok(addr);
    }

    let fd = socket::create(stack, AF_INET, SocketType::Datagram, 0)?;
    let result = query(stack, fd, hostname);
    let _ = socket::close(stack, fd);

    match result {
        Ok(addr) => serial_println!("[DNS] {} -> {}", hostname, addr),
        Err(err) => serial_println!("[DNS] {} failed: {}", hostname, err),
    }
    result
}
