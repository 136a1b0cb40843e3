//! DHCP client (RFC 2131 / RFC 2132)
//!
//! Runs the DISCOVER / OFFER / REQUEST / ACK exchange over UDP 68 -> 67.
//! Replies are collected from the port 68 inbox by polling the stack; the
//! client never retransmits.
//!
//! Message layout:
//! ```text
//! [op][htype][hlen][hops][xid (4)][secs (2)][flags (2)]
//! [ciaddr (4)][yiaddr (4)][siaddr (4)][giaddr (4)]
//! [chaddr (16)][sname (64)][file (128)]           <- 236 bytes
//! [magic cookie 99.130.83.99][options (TLV) ... 255]
//! ```

use alloc::vec::Vec;
use core::fmt;
use core::net::Ipv4Addr;
use core::sync::atomic::{AtomicU32, Ordering};

use crate::error::{NetError, NetResult};
use crate::net::interface::{NetInterface, NetworkConfig};
use crate::net::ipv4::BROADCAST;
use crate::net::stack::NetworkStack;
use crate::net::udp;
use crate::serial_println;

/// DHCP ports
pub const DHCP_SERVER_PORT: u16 = 67;
pub const DHCP_CLIENT_PORT: u16 = 68;

/// BOOTP op codes
pub const BOOTREQUEST: u8 = 1;
pub const BOOTREPLY: u8 = 2;

/// Size of the fixed BOOTP portion
pub const CORE_SIZE: usize = 236;

/// Outgoing messages are padded to this length
pub const MIN_MESSAGE_SIZE: usize = 300;

pub const MAGIC_COOKIE: [u8; 4] = [99, 130, 83, 99];

/// Broadcast bit of the flags field
pub const FLAG_BROADCAST: u16 = 0x8000;

/// Lease assumed when the server sends none (one day)
pub const DEFAULT_LEASE_SECS: u32 = 86_400;

/// DHCP message types (option 53)
pub mod message_type {
    pub const DISCOVER: u8 = 1;
    pub const OFFER: u8 = 2;
    pub const REQUEST: u8 = 3;
    pub const DECLINE: u8 = 4;
    pub const ACK: u8 = 5;
    pub const NAK: u8 = 6;
    pub const RELEASE: u8 = 7;
    pub const INFORM: u8 = 8;
}

/// DHCP option codes
pub mod option {
    pub const PAD: u8 = 0;
    pub const SUBNET_MASK: u8 = 1;
    pub const ROUTER: u8 = 3;
    pub const DNS_SERVER: u8 = 6;
    pub const HOSTNAME: u8 = 12;
    pub const DOMAIN_NAME: u8 = 15;
    pub const REQUESTED_IP: u8 = 50;
    pub const LEASE_TIME: u8 = 51;
    pub const MESSAGE_TYPE: u8 = 53;
    pub const SERVER_ID: u8 = 54;
    pub const PARAMETER_REQUEST: u8 = 55;
    pub const END: u8 = 255;
}

/// Options asked for in every DISCOVER and REQUEST
const PARAMETER_LIST: [u8; 3] = [option::SUBNET_MASK, option::ROUTER, option::DNS_SERVER];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DhcpError {
    /// Shorter than the BOOTP core plus cookie
    PacketTooShort,
    /// Cookie is not 99.130.83.99
    BadMagicCookie,
    /// An option's length runs past the end of the message
    TruncatedOption,
}

impl fmt::Display for DhcpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DhcpError::PacketTooShort => write!(f, "DHCP message too short"),
            DhcpError::BadMagicCookie => write!(f, "Bad DHCP magic cookie"),
            DhcpError::TruncatedOption => write!(f, "Truncated DHCP option"),
        }
    }
}

impl From<DhcpError> for NetError {
    fn from(_: DhcpError) -> Self {
        NetError::InvalidArg
    }
}

/// A DHCP message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DhcpMessage {
    pub op: u8,
    pub xid: u32,
    pub flags: u16,
    pub ciaddr: Ipv4Addr,
    pub yiaddr: Ipv4Addr,
    pub siaddr: Ipv4Addr,
    pub giaddr: Ipv4Addr,
    pub chaddr: [u8; 6],
    /// Raw option bytes after the cookie, END included
    pub options: Vec<u8>,
}

impl DhcpMessage {
    /// Client request skeleton: BOOTREQUEST, Ethernet, broadcast flag set
    pub fn request(xid: u32, mac: [u8; 6]) -> Self {
        Self {
            op: BOOTREQUEST,
            xid,
            flags: FLAG_BROADCAST,
            ciaddr: Ipv4Addr::UNSPECIFIED,
            yiaddr: Ipv4Addr::UNSPECIFIED,
            siaddr: Ipv4Addr::UNSPECIFIED,
            giaddr: Ipv4Addr::UNSPECIFIED,
            chaddr: mac,
            options: Vec::new(),
        }
    }

    /// Append one TLV option
    pub fn push_option(&mut self, code: u8, value: &[u8]) {
        self.options.push(code);
        self.options.push(value.len() as u8);
        self.options.extend_from_slice(value);
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = alloc::vec![0u8; CORE_SIZE];
        bytes[0] = self.op;
        bytes[1] = 1; // htype: Ethernet
        bytes[2] = 6; // hlen
        bytes[4..8].copy_from_slice(&self.xid.to_be_bytes());
        bytes[10..12].copy_from_slice(&self.flags.to_be_bytes());
        bytes[12..16].copy_from_slice(&self.ciaddr.octets());
        bytes[16..20].copy_from_slice(&self.yiaddr.octets());
        bytes[20..24].copy_from_slice(&self.siaddr.octets());
        bytes[24..28].copy_from_slice(&self.giaddr.octets());
        bytes[28..34].copy_from_slice(&self.chaddr);

        bytes.extend_from_slice(&MAGIC_COOKIE);
        bytes.extend_from_slice(&self.options);
        if self.options.last() != Some(&option::END) {
            bytes.push(option::END);
        }
        if bytes.len() < MIN_MESSAGE_SIZE {
            bytes.resize(MIN_MESSAGE_SIZE, 0);
        }
        bytes
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, DhcpError> {
        if data.len() < CORE_SIZE + MAGIC_COOKIE.len() {
            return Err(DhcpError::PacketTooShort);
        }
        if data[CORE_SIZE..CORE_SIZE + 4] != MAGIC_COOKIE {
            return Err(DhcpError::BadMagicCookie);
        }

        let addr = |at: usize| Ipv4Addr::new(data[at], data[at + 1], data[at + 2], data[at + 3]);
        let mut chaddr = [0u8; 6];
        chaddr.copy_from_slice(&data[28..34]);

        Ok(Self {
            op: data[0],
            xid: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
            flags: u16::from_be_bytes([data[10], data[11]]),
            ciaddr: addr(12),
            yiaddr: addr(16),
            siaddr: addr(20),
            giaddr: addr(24),
            chaddr,
            options: data[CORE_SIZE + 4..].to_vec(),
        })
    }

    /// Parse this message's options
    pub fn parse_options(&self) -> Result<DhcpOptions, DhcpError> {
        parse_options(&self.options)
    }
}

/// The options this client understands
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DhcpOptions {
    pub message_type: Option<u8>,
    pub subnet_mask: Option<Ipv4Addr>,
    pub router: Option<Ipv4Addr>,
    pub dns_server: Option<Ipv4Addr>,
    pub lease_time: Option<u32>,
    pub server_id: Option<Ipv4Addr>,
    pub requested_ip: Option<Ipv4Addr>,
}

fn ipv4_value(value: &[u8]) -> Option<Ipv4Addr> {
    // Router and DNS options may list several addresses; take the first
    match value {
        [a, b, c, d, ..] => Some(Ipv4Addr::new(*a, *b, *c, *d)),
        _ => None,
    }
}

/// Walk a TLV option list
///
/// PAD bytes are skipped and END stops the walk. An option whose length
/// runs past the buffer is an error; unknown options are ignored.
pub fn parse_options(options: &[u8]) -> Result<DhcpOptions, DhcpError> {
    let mut parsed = DhcpOptions::default();
    let mut offset = 0;

    while offset < options.len() {
        let code = options[offset];
        if code == option::PAD {
            offset += 1;
            continue;
        }
        if code == option::END {
            break;
        }

        let len = *options.get(offset + 1).ok_or(DhcpError::TruncatedOption)? as usize;
        let start = offset + 2;
        let value = options.get(start..start + len).ok_or(DhcpError::TruncatedOption)?;

        match code {
            option::MESSAGE_TYPE => parsed.message_type = value.first().copied(),
            option::SUBNET_MASK => parsed.subnet_mask = ipv4_value(value),
            option::ROUTER => parsed.router = ipv4_value(value),
            option::DNS_SERVER => parsed.dns_server = ipv4_value(value),
            option::SERVER_ID => parsed.server_id = ipv4_value(value),
            option::REQUESTED_IP => parsed.requested_ip = ipv4_value(value),
            option::LEASE_TIME => {
                if let [a, b, c, d, ..] = value {
                    parsed.lease_time = Some(u32::from_be_bytes([*a, *b, *c, *d]));
                }
            }
            _ => {}
        }

        offset = start + len;
    }

    Ok(parsed)
}

/// Lease obtained from a server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DhcpConfig {
    pub ip_address: Ipv4Addr,
    pub subnet_mask: Ipv4Addr,
    pub gateway: Ipv4Addr,
    pub dns_server: Ipv4Addr,
    /// Lease length in seconds
    pub lease_time: u32,
    /// Server that granted the lease (option 54)
    pub server: Ipv4Addr,
    pub configured: bool,
}

impl DhcpConfig {
    /// Build the lease from an ACK
    ///
    /// Missing options fall back to a /24 mask, `default_dns`, a one-day
    /// lease, and the server itself as gateway.
    pub fn from_ack(ack: &DhcpMessage, default_dns: Ipv4Addr) -> Result<Self, DhcpError> {
        let options = ack.parse_options()?;
        let server = options.server_id.unwrap_or(ack.siaddr);

        Ok(Self {
            ip_address: ack.yiaddr,
            subnet_mask: options.subnet_mask.unwrap_or(Ipv4Addr::new(255, 255, 255, 0)),
            gateway: options.router.unwrap_or(server),
            dns_server: options.dns_server.unwrap_or(default_dns),
            lease_time: options.lease_time.unwrap_or(DEFAULT_LEASE_SECS),
            server,
            configured: true,
        })
    }
}

impl fmt::Display for DhcpConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} mask {} gw {} dns {} lease {}s",
            self.ip_address, self.subnet_mask, self.gateway, self.dns_server, self.lease_time
        )
    }
}

/// Per-stack client state
pub struct DhcpClient {
    next_xid: AtomicU32,
}

impl DhcpClient {
    pub const fn new() -> Self {
        Self {
            next_xid: AtomicU32::new(1),
        }
    }

    pub fn next_xid(&self) -> u32 {
        self.next_xid.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for DhcpClient {
    fn default() -> Self {
        Self::new()
    }
}

fn broadcast(stack: &NetworkStack, iface: &NetInterface, message: &DhcpMessage) -> NetResult<()> {
    udp::send_via(stack, iface, BROADCAST, DHCP_SERVER_PORT, DHCP_CLIENT_PORT, &message.to_bytes())
}

/// Poll for a reply carrying `xid` whose type is in `accepted`
///
/// Up to `dhcp_retries` waits of `dhcp_retry_interval_ms` each. Anything
/// else arriving on port 68 is discarded.
fn await_reply(stack: &NetworkStack, xid: u32, accepted: &[u8]) -> Option<(DhcpMessage, DhcpOptions)> {
    let config = stack.config();
    for _ in 0..config.dhcp_retries {
        let reply = stack.wait_for(config.dhcp_retry_interval_ms, || loop {
            let datagram = stack.udp().pop(DHCP_CLIENT_PORT)?;
            let Ok(message) = DhcpMessage::from_bytes(&datagram.data) else {
                continue;
            };
            if message.op != BOOTREPLY || message.xid != xid {
                continue;
            }
            match message.parse_options() {
                Ok(options) if options.message_type.is_some_and(|t| accepted.contains(&t)) => {
                    return Some((message, options));
                }
                _ => continue,
            }
        });
        if reply.is_some() {
            return reply;
        }
    }
    None
}

fn exchange(stack: &NetworkStack, iface: &NetInterface) -> NetResult<DhcpConfig> {
    let xid = stack.dhcp().next_xid();

    let mut discover = DhcpMessage::request(xid, iface.mac());
    discover.push_option(option::MESSAGE_TYPE, &[message_type::DISCOVER]);
    discover.push_option(option::PARAMETER_REQUEST, &PARAMETER_LIST);
    broadcast(stack, iface, &discover)?;
    serial_println!("[DHCP] DISCOVER sent on {} (xid {:#x})", iface.name(), xid);

    let (offer, offer_options) =
        await_reply(stack, xid, &[message_type::OFFER]).ok_or(NetError::Timeout)?;
    let server = offer_options.server_id.unwrap_or(offer.siaddr);
    serial_println!("[DHCP] OFFER {} from {}", offer.yiaddr, server);

    let mut request = DhcpMessage::request(xid, iface.mac());
    request.push_option(option::MESSAGE_TYPE, &[message_type::REQUEST]);
    request.push_option(option::REQUESTED_IP, &offer.yiaddr.octets());
    request.push_option(option::SERVER_ID, &server.octets());
    request.push_option(option::PARAMETER_REQUEST, &PARAMETER_LIST);
    broadcast(stack, iface, &request)?;

    let (reply, reply_options) = await_reply(stack, xid, &[message_type::ACK, message_type::NAK])
        .ok_or(NetError::Timeout)?;
    if reply_options.message_type == Some(message_type::NAK) {
        serial_println!("[DHCP] NAK from {}", server);
        return Err(NetError::Failed);
    }

    let lease = DhcpConfig::from_ack(&reply, stack.config().default_nameserver)?;
    serial_println!("[DHCP] ACK: {}", lease);
    Ok(lease)
}

/// Obtain a lease for `device`
///
/// # Returns
/// * `DeviceNotFound` - no such device, or it is down
/// * `Timeout` - no OFFER or no ACK/NAK within the retry budget
/// * `Failed` - the server answered NAK
pub fn request_config(stack: &NetworkStack, device: &str) -> NetResult<DhcpConfig> {
    let iface = stack.find_device(device).ok_or(NetError::DeviceNotFound)?;
    if !iface.is_up() {
        return Err(NetError::DeviceNotFound);
    }

    let opened = stack.udp().open(DHCP_CLIENT_PORT);
    let result = exchange(stack, &iface);
    if opened {
        stack.udp().close(DHCP_CLIENT_PORT);
    }
    result
}

/// Obtain a lease and apply it to `device` and the resolver
pub fn configure_interface(stack: &NetworkStack, device: &str) -> NetResult<DhcpConfig> {
    let lease = request_config(stack, device)?;
    stack.set_ip(device, lease.ip_address, lease.subnet_mask, Some(lease.gateway))?;
    stack.dns().set_nameserver(lease.dns_server);
    Ok(lease)
}

/// Give a lease back and clear `device`'s address
///
/// The interface is unconfigured even when the RELEASE cannot be sent; the
/// send error is still returned.
pub fn release_config(stack: &NetworkStack, device: &str, lease: &DhcpConfig) -> NetResult<()> {
    let iface = stack.find_device(device).ok_or(NetError::DeviceNotFound)?;

    let mut release = DhcpMessage::request(stack.dhcp().next_xid(), iface.mac());
    release.flags = 0;
    release.ciaddr = lease.ip_address;
    release.push_option(option::MESSAGE_TYPE, &[message_type::RELEASE]);
    release.push_option(option::SERVER_ID, &lease.server.octets());

    let sent = udp::send_via(
        stack,
        &iface,
        lease.server,
        DHCP_SERVER_PORT,
        DHCP_CLIENT_PORT,
        &release.to_bytes(),
    );
    iface.set_config(NetworkConfig::unconfigured());
    serial_println!("[DHCP] Released {} on {}", lease.ip_address, device);
    sent
}
