//! TCP Protocol Implementation (RFC 793)
//!
//! Provides Transmission Control Protocol support for connection-oriented
//! communication.
//!
//! # Features
//! - TCP segment parsing and building
//! - Passive open with a per-listener accept queue
//! - Active open
//! - In-order data delivery into a fixed receive ring
//! - Connection teardown (FIN/ACK)
//!
//! # Limitations (Current Implementation)
//! - No retransmission, congestion control or sliding window
//! - A connection is marked established as soon as its SYN or SYN-ACK
//!   goes out; the peer's final handshake ACK is not awaited
//! - Inbound checksums are not verified
//! - No options support
//!
//! Connection state lives in [`TcpTable`] behind one lock. Operations
//! compute their outgoing segments under the lock and transmit after
//! releasing it.

use alloc::collections::{BTreeMap, VecDeque};
use alloc::vec::Vec;
use core::fmt;
use core::net::Ipv4Addr;
use spin::Mutex;

use crate::error::{NetError, NetResult};
use crate::net::buffer::ByteRing;
use crate::net::checksum::pseudo_header_checksum;
use crate::net::ipv4::{self, protocol};
use crate::net::stack::NetworkStack;
use crate::serial_println;

/// Minimum TCP header size (20 bytes, no options)
pub const TCP_HEADER_SIZE: usize = 20;

/// TCP port range for ephemeral (dynamic) port allocation
pub const EPHEMERAL_PORT_START: u16 = 49152;
pub const EPHEMERAL_PORT_END: u16 = 65535;

/// First initial sequence number handed out by a table
pub const INITIAL_ISN: u32 = 1000;

/// TCP Control Flags
pub mod flags {
    pub const FIN: u8 = 0x01; // Finish (no more data)
    pub const SYN: u8 = 0x02; // Synchronize sequence numbers
    pub const RST: u8 = 0x04; // Reset connection
    pub const PSH: u8 = 0x08; // Push function
    pub const ACK: u8 = 0x10; // Acknowledgment field significant
    pub const URG: u8 = 0x20; // Urgent pointer field significant
}

/// TCP Connection State (RFC 793)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpState {
    /// Connection closed
    Closed,
    /// Waiting for connection request
    Listen,
    /// Sent SYN, waiting for SYN-ACK
    SynSent,
    /// Received SYN, sent SYN-ACK, waiting for ACK
    SynReceived,
    /// Connection established, data transfer
    Established,
    /// Sent FIN, waiting for ACK
    FinWait1,
    /// Received ACK of FIN, waiting for FIN
    FinWait2,
    /// Received FIN, waiting for the local close
    CloseWait,
    /// Both sides sent FIN simultaneously
    Closing,
    /// Sent FIN after receiving FIN, waiting for ACK
    LastAck,
    /// Both FINs acknowledged
    TimeWait,
}

impl TcpState {
    /// States in which buffered data may still be read
    pub fn is_readable(self) -> bool {
        matches!(
            self,
            TcpState::Established
                | TcpState::FinWait1
                | TcpState::FinWait2
                | TcpState::CloseWait
                | TcpState::LastAck
        )
    }
}

/// Errors that can occur while parsing TCP segments
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpError {
    /// Segment is too short to contain a valid TCP header
    PacketTooShort,
    /// Invalid data offset (header length)
    InvalidDataOffset(u8),
}

impl fmt::Display for TcpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TcpError::PacketTooShort => write!(f, "TCP segment too short"),
            TcpError::InvalidDataOffset(off) => write!(f, "Invalid data offset: {}", off),
        }
    }
}

impl From<TcpError> for NetError {
    fn from(_: TcpError) -> Self {
        NetError::InvalidArg
    }
}

/// TCP segment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpSegment {
    /// Source port (0-65535)
    pub src_port: u16,
    /// Destination port (0-65535)
    pub dest_port: u16,
    /// Sequence number
    pub sequence: u32,
    /// Acknowledgment number (if ACK flag set)
    pub acknowledgment: u32,
    /// Control flags (FIN, SYN, RST, PSH, ACK, URG)
    pub flags: u8,
    /// Window size (flow control)
    pub window: u16,
    /// Checksum as received; recomputed by [`build`](Self::build)
    pub checksum: u16,
    /// Urgent pointer (if URG flag set)
    pub urgent_pointer: u16,
    /// Payload data
    pub data: Vec<u8>,
}

impl TcpSegment {
    /// Create a header-only segment
    pub fn new(src_port: u16, dest_port: u16, sequence: u32, acknowledgment: u32, flags: u8, window: u16) -> Self {
        Self {
            src_port,
            dest_port,
            sequence,
            acknowledgment,
            flags,
            window,
            checksum: 0,
            urgent_pointer: 0,
            data: Vec::new(),
        }
    }

    /// Parse a TCP segment from raw bytes
    ///
    /// Options are skipped. The checksum is not verified.
    pub fn parse(data: &[u8]) -> Result<Self, TcpError> {
        if data.len() < TCP_HEADER_SIZE {
            return Err(TcpError::PacketTooShort);
        }

        let data_offset = data[12] >> 4;
        if data_offset < 5 {
            return Err(TcpError::InvalidDataOffset(data_offset));
        }
        let header_len = (data_offset as usize) * 4;
        if data.len() < header_len {
            return Err(TcpError::PacketTooShort);
        }

        Ok(TcpSegment {
            src_port: u16::from_be_bytes([data[0], data[1]]),
            dest_port: u16::from_be_bytes([data[2], data[3]]),
            sequence: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
            acknowledgment: u32::from_be_bytes([data[8], data[9], data[10], data[11]]),
            flags: data[13],
            window: u16::from_be_bytes([data[14], data[15]]),
            checksum: u16::from_be_bytes([data[16], data[17]]),
            urgent_pointer: u16::from_be_bytes([data[18], data[19]]),
            data: data[header_len..].to_vec(),
        })
    }

    /// Build the segment into raw bytes with the pseudo-header checksum
    pub fn build(&self, src_addr: Ipv4Addr, dest_addr: Ipv4Addr) -> Vec<u8> {
        let mut packet = Vec::with_capacity(TCP_HEADER_SIZE + self.data.len());
        packet.extend_from_slice(&self.src_port.to_be_bytes());
        packet.extend_from_slice(&self.dest_port.to_be_bytes());
        packet.extend_from_slice(&self.sequence.to_be_bytes());
        packet.extend_from_slice(&self.acknowledgment.to_be_bytes());
        packet.push(((TCP_HEADER_SIZE / 4) as u8) << 4);
        packet.push(self.flags);
        packet.extend_from_slice(&self.window.to_be_bytes());
        packet.extend_from_slice(&[0, 0]);
        packet.extend_from_slice(&self.urgent_pointer.to_be_bytes());
        packet.extend_from_slice(&self.data);

        let checksum = pseudo_header_checksum(src_addr, dest_addr, protocol::TCP, &packet);
        packet[16..18].copy_from_slice(&checksum.to_be_bytes());
        packet
    }

    /// Check if a flag is set
    pub fn has_flag(&self, flag: u8) -> bool {
        (self.flags & flag) != 0
    }
}

/// Opaque connection handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TcpHandle(u32);

impl TcpHandle {
    pub fn raw(self) -> u32 {
        self.0
    }
}

/// TCP socket identifier (4-tuple)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TcpSocketId {
    pub local_addr: Ipv4Addr,
    pub local_port: u16,
    pub remote_addr: Ipv4Addr,
    pub remote_port: u16,
}

impl TcpSocketId {
    /// Whether an inbound segment from `remote:remote_port` to `local_port`
    /// belongs to this connection
    fn matches(&self, local_port: u16, remote_addr: Ipv4Addr, remote_port: u16) -> bool {
        self.local_port == local_port && self.remote_addr == remote_addr && self.remote_port == remote_port
    }
}

/// Outcome of feeding one segment to a connection
#[derive(Debug, Default)]
pub struct Reaction {
    /// Segments to transmit, in order
    pub replies: Vec<TcpSegment>,
    /// The connection has finished and should leave the table
    pub release: bool,
}

/// TCP Connection Control Block (TCB)
#[derive(Debug, Clone)]
pub struct TcpConnection {
    /// Socket identifier
    pub id: TcpSocketId,
    /// Current connection state
    pub state: TcpState,
    /// Next sequence number to send
    pub send_seq: u32,
    /// Next sequence number expected from the peer
    pub recv_seq: u32,
    /// Advertised receive window (never changes)
    pub window: u16,
    rx: ByteRing,
    /// Established children waiting for `accept` (listeners only)
    backlog: VecDeque<TcpHandle>,
}

impl TcpConnection {
    /// Create a new TCP connection in CLOSED state
    pub fn new(id: TcpSocketId, window: usize) -> Self {
        TcpConnection {
            id,
            state: TcpState::Closed,
            send_seq: 0,
            recv_seq: 0,
            window: window.min(u16::MAX as usize) as u16,
            rx: ByteRing::new(window),
            backlog: VecDeque::new(),
        }
    }

    fn segment(&self, flags: u8) -> TcpSegment {
        TcpSegment::new(
            self.id.local_port,
            self.id.remote_port,
            self.send_seq,
            self.recv_seq,
            flags,
            self.window,
        )
    }

    /// Active open from CLOSED: emit SYN and go straight to ESTABLISHED
    pub fn open_active(&mut self, isn: u32) -> TcpSegment {
        self.send_seq = isn;
        self.state = TcpState::SynSent;
        let syn = self.segment(flags::SYN);
        self.send_seq = self.send_seq.wrapping_add(1);
        self.state = TcpState::Established;
        syn
    }

    /// Passive open from a listener's SYN: emit SYN-ACK and go straight to
    /// ESTABLISHED
    pub fn open_passive(&mut self, syn: &TcpSegment, isn: u32) -> TcpSegment {
        self.recv_seq = syn.sequence.wrapping_add(1);
        self.send_seq = isn;
        self.state = TcpState::SynReceived;
        let syn_ack = self.segment(flags::SYN | flags::ACK);
        self.send_seq = self.send_seq.wrapping_add(1);
        self.state = TcpState::Established;
        syn_ack
    }

    /// Begin the local close. Returns the FIN to send, if any.
    pub fn close(&mut self) -> Option<TcpSegment> {
        let next = match self.state {
            TcpState::Established => TcpState::FinWait1,
            TcpState::CloseWait => TcpState::LastAck,
            _ => return None,
        };
        let fin = self.segment(flags::FIN | flags::ACK);
        self.send_seq = self.send_seq.wrapping_add(1);
        self.state = next;
        Some(fin)
    }

    /// Split `data` into MSS-sized PSH|ACK segments, advancing `send_seq`
    pub fn segments_for(&mut self, data: &[u8], mss: usize) -> Vec<TcpSegment> {
        data.chunks(mss.max(1))
            .map(|chunk| {
                let mut segment = self.segment(flags::PSH | flags::ACK);
                segment.data = chunk.to_vec();
                self.send_seq = self.send_seq.wrapping_add(chunk.len() as u32);
                segment
            })
            .collect()
    }

    /// Copy buffered bytes into `out`
    pub fn read(&mut self, out: &mut [u8]) -> Option<usize> {
        self.rx.pop(out).ok()
    }

    /// Bytes waiting to be read
    pub fn buffered(&self) -> usize {
        self.rx.len()
    }

    /// Feed one inbound segment through the state machine
    pub fn on_segment(&mut self, segment: &TcpSegment) -> Reaction {
        let mut reaction = Reaction::default();

        if segment.has_flag(flags::RST) {
            serial_println!("[TCP] Reset by {}:{}", self.id.remote_addr, self.id.remote_port);
            self.state = TcpState::Closed;
            return reaction;
        }

        match self.state {
            TcpState::Established => self.on_established(segment, &mut reaction),
            TcpState::FinWait1 | TcpState::FinWait2 => {
                self.accept_payload(segment);
                if segment.has_flag(flags::FIN) {
                    self.recv_seq = self.recv_seq.wrapping_add(1);
                    self.state = TcpState::TimeWait;
                    reaction.replies.push(self.segment(flags::ACK));
                } else if segment.has_flag(flags::ACK) && self.state == TcpState::FinWait1 {
                    self.state = TcpState::FinWait2;
                }
            }
            TcpState::LastAck => {
                if segment.has_flag(flags::ACK) {
                    self.state = TcpState::Closed;
                    reaction.release = true;
                }
            }
            _ => {}
        }

        reaction
    }

    fn on_established(&mut self, segment: &TcpSegment, reaction: &mut Reaction) {
        // Peer's SYN-ACK after our early transition to ESTABLISHED
        if segment.has_flag(flags::SYN) {
            self.recv_seq = segment.sequence.wrapping_add(1);
            reaction.replies.push(self.segment(flags::ACK));
            return;
        }

        let had_data = self.accept_payload(segment);

        if segment.has_flag(flags::FIN) {
            self.recv_seq = segment
                .sequence
                .wrapping_add(segment.data.len() as u32)
                .wrapping_add(1);
            reaction.replies.push(self.segment(flags::ACK));
            reaction.replies.push(self.segment(flags::FIN | flags::ACK));
            self.send_seq = self.send_seq.wrapping_add(1);
            self.state = TcpState::LastAck;
            serial_println!("[TCP] Peer closed, entering LAST_ACK");
        } else if had_data {
            reaction.replies.push(self.segment(flags::ACK));
        }
    }

    /// Append an in-order payload to the ring. A payload the ring has no room
    /// for is dropped whole and neither advances the ack point nor gets acked.
    fn accept_payload(&mut self, segment: &TcpSegment) -> bool {
        if segment.data.is_empty() || segment.sequence != self.recv_seq {
            return false;
        }
        if self.rx.push(&segment.data).is_err() {
            serial_println!("[TCP] Receive buffer full, dropping {} bytes", segment.data.len());
            return false;
        }
        self.recv_seq = self.recv_seq.wrapping_add(segment.data.len() as u32);
        true
    }
}

/// A segment ready to hand to the IP layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outbound {
    pub src: Ipv4Addr,
    pub dest: Ipv4Addr,
    pub segment: TcpSegment,
}

struct TableInner {
    connections: BTreeMap<TcpHandle, TcpConnection>,
    next_handle: u32,
    next_isn: u32,
    next_ephemeral: u16,
}

impl TableInner {
    fn isn(&mut self) -> u32 {
        let isn = self.next_isn;
        self.next_isn = self.next_isn.wrapping_add(1);
        isn
    }

    fn insert(&mut self, connection: TcpConnection) -> TcpHandle {
        let handle = TcpHandle(self.next_handle);
        self.next_handle = self.next_handle.wrapping_add(1);
        self.connections.insert(handle, connection);
        handle
    }

    fn port_in_use(&self, port: u16) -> bool {
        self.connections.values().any(|c| c.id.local_port == port)
    }

    fn allocate_ephemeral_port(&mut self) -> NetResult<u16> {
        for _ in EPHEMERAL_PORT_START..=EPHEMERAL_PORT_END {
            let candidate = self.next_ephemeral;
            self.next_ephemeral = if candidate == EPHEMERAL_PORT_END {
                EPHEMERAL_PORT_START
            } else {
                candidate + 1
            };
            if !self.port_in_use(candidate) {
                return Ok(candidate);
            }
        }
        Err(NetError::OutOfMemory)
    }

    fn find(&self, local_port: u16, remote: Ipv4Addr, remote_port: u16) -> Option<TcpHandle> {
        self.connections
            .iter()
            .find(|(_, c)| c.state != TcpState::Listen && c.id.matches(local_port, remote, remote_port))
            .map(|(h, _)| *h)
    }

    fn listener(&self, port: u16) -> Option<TcpHandle> {
        self.connections
            .iter()
            .find(|(_, c)| c.state == TcpState::Listen && c.id.local_port == port)
            .map(|(h, _)| *h)
    }
}

/// Connection table, bounded at `capacity` entries (listeners included)
pub struct TcpTable {
    inner: Mutex<TableInner>,
    capacity: usize,
    window: usize,
    mss: usize,
}

impl TcpTable {
    pub fn new(capacity: usize, window: usize, mss: usize) -> Self {
        Self {
            inner: Mutex::new(TableInner {
                connections: BTreeMap::new(),
                next_handle: 1,
                next_isn: INITIAL_ISN,
                next_ephemeral: EPHEMERAL_PORT_START,
            }),
            capacity,
            window,
            mss,
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().connections.is_empty()
    }

    pub fn state(&self, handle: TcpHandle) -> Option<TcpState> {
        self.inner.lock().connections.get(&handle).map(|c| c.state)
    }

    pub fn socket_id(&self, handle: TcpHandle) -> Option<TcpSocketId> {
        self.inner.lock().connections.get(&handle).map(|c| c.id)
    }

    /// Drop a connection without sending anything
    pub fn remove(&self, handle: TcpHandle) -> bool {
        self.inner.lock().connections.remove(&handle).is_some()
    }

    /// List all connections
    pub fn list(&self) -> Vec<(TcpHandle, TcpSocketId, TcpState)> {
        self.inner
            .lock()
            .connections
            .iter()
            .map(|(h, c)| (*h, c.id, c.state))
            .collect()
    }

    /// Create a listener on `port`
    pub fn listen(&self, port: u16) -> NetResult<TcpHandle> {
        let mut inner = self.inner.lock();
        if inner.listener(port).is_some() {
            return Err(NetError::AlreadyExists);
        }
        if inner.connections.len() >= self.capacity {
            return Err(NetError::OutOfMemory);
        }

        let id = TcpSocketId {
            local_addr: Ipv4Addr::UNSPECIFIED,
            local_port: port,
            remote_addr: Ipv4Addr::UNSPECIFIED,
            remote_port: 0,
        };
        let mut listener = TcpConnection::new(id, 0);
        listener.state = TcpState::Listen;
        Ok(inner.insert(listener))
    }

    /// Register an active open. Returns the handle and, for a new
    /// connection, the SYN to send.
    pub fn open(
        &self,
        local_addr: Ipv4Addr,
        local_port: u16,
        remote_addr: Ipv4Addr,
        remote_port: u16,
    ) -> NetResult<(TcpHandle, Option<Outbound>)> {
        let mut inner = self.inner.lock();

        if local_port != 0 {
            if let Some(existing) = inner.find(local_port, remote_addr, remote_port) {
                return Ok((existing, None));
            }
        }
        if inner.connections.len() >= self.capacity {
            return Err(NetError::OutOfMemory);
        }

        let local_port = match local_port {
            0 => inner.allocate_ephemeral_port()?,
            port => port,
        };
        let id = TcpSocketId {
            local_addr,
            local_port,
            remote_addr,
            remote_port,
        };

        let isn = inner.isn();
        let mut connection = TcpConnection::new(id, self.window);
        let syn = connection.open_active(isn);
        let handle = inner.insert(connection);

        Ok((
            handle,
            Some(Outbound {
                src: local_addr,
                dest: remote_addr,
                segment: syn,
            }),
        ))
    }

    /// Pop the oldest established child of `listener`
    pub fn accept(&self, listener: TcpHandle) -> NetResult<Option<TcpHandle>> {
        let mut inner = self.inner.lock();
        let connection = inner.connections.get_mut(&listener).ok_or(NetError::NotFound)?;
        if connection.state != TcpState::Listen {
            return Err(NetError::InvalidState);
        }
        Ok(connection.backlog.pop_front())
    }

    /// Segment `data` for transmission on `handle`
    pub fn prepare_send(&self, handle: TcpHandle, data: &[u8]) -> NetResult<Vec<Outbound>> {
        if data.is_empty() {
            return Err(NetError::InvalidArg);
        }
        let mut inner = self.inner.lock();
        let connection = inner.connections.get_mut(&handle).ok_or(NetError::NotFound)?;
        if connection.state != TcpState::Established {
            return Err(NetError::InvalidState);
        }

        let (src, dest) = (connection.id.local_addr, connection.id.remote_addr);
        Ok(connection
            .segments_for(data, self.mss)
            .into_iter()
            .map(|segment| Outbound { src, dest, segment })
            .collect())
    }

    /// Read buffered bytes from `handle`
    pub fn read(&self, handle: TcpHandle, out: &mut [u8]) -> NetResult<usize> {
        if out.is_empty() {
            return Err(NetError::InvalidArg);
        }
        let mut inner = self.inner.lock();
        let connection = inner.connections.get_mut(&handle).ok_or(NetError::NotFound)?;
        if !connection.state.is_readable() {
            return Err(NetError::InvalidState);
        }
        connection.read(out).ok_or(NetError::NotFound)
    }

    /// Start closing `handle` and take it out of the table. Returns the FIN
    /// to send, if the state called for one.
    ///
    /// Closing a listener also drops the children it never handed out.
    pub fn close(&self, handle: TcpHandle) -> NetResult<Option<Outbound>> {
        let mut inner = self.inner.lock();
        let mut connection = inner.connections.remove(&handle).ok_or(NetError::NotFound)?;
        if connection.state == TcpState::Listen && !connection.backlog.is_empty() {
            serial_println!(
                "[TCP] Dropping {} unaccepted connections on port {}",
                connection.backlog.len(),
                connection.id.local_port
            );
            for child in connection.backlog.drain(..) {
                inner.connections.remove(&child);
            }
        }
        let (src, dest) = (connection.id.local_addr, connection.id.remote_addr);
        Ok(connection.close().map(|segment| Outbound { src, dest, segment }))
    }

    /// Route one inbound segment
    ///
    /// # Returns
    /// * `Ok(replies)` - segments to transmit
    /// * `NotFound` - no connection and no listener for a SYN
    /// * `OutOfMemory` - SYN for a listener while the table is full
    pub fn dispatch(&self, src: Ipv4Addr, dst: Ipv4Addr, segment: &TcpSegment) -> NetResult<Vec<Outbound>> {
        let mut inner = self.inner.lock();

        if let Some(handle) = inner.find(segment.dest_port, src, segment.src_port) {
            let connection = inner.connections.get_mut(&handle).ok_or(NetError::NotFound)?;
            let reaction = connection.on_segment(segment);
            let local = match connection.id.local_addr {
                addr if addr.is_unspecified() => dst,
                addr => addr,
            };
            if reaction.release {
                inner.connections.remove(&handle);
                serial_println!("[TCP] Connection {}:{} closed", src, segment.src_port);
            }
            return Ok(reaction
                .replies
                .into_iter()
                .map(|segment| Outbound { src: local, dest: src, segment })
                .collect());
        }

        if !segment.has_flag(flags::SYN) || segment.has_flag(flags::ACK) {
            return Err(NetError::NotFound);
        }
        let listener = inner.listener(segment.dest_port).ok_or(NetError::NotFound)?;
        if inner.connections.len() >= self.capacity {
            serial_println!("[TCP] Table full, refusing SYN from {}:{}", src, segment.src_port);
            return Err(NetError::OutOfMemory);
        }

        let id = TcpSocketId {
            local_addr: dst,
            local_port: segment.dest_port,
            remote_addr: src,
            remote_port: segment.src_port,
        };
        let isn = inner.isn();
        let mut child = TcpConnection::new(id, self.window);
        let syn_ack = child.open_passive(segment, isn);
        let child_handle = inner.insert(child);
        if let Some(parent) = inner.connections.get_mut(&listener) {
            parent.backlog.push_back(child_handle);
        }

        serial_println!("[TCP] Accepted {}:{} on port {}", src, segment.src_port, segment.dest_port);
        Ok(alloc::vec![Outbound {
            src: dst,
            dest: src,
            segment: syn_ack,
        }])
    }
}

fn transmit(stack: &NetworkStack, outbound: Outbound) -> NetResult<()> {
    let bytes = outbound.segment.build(outbound.src, outbound.dest);
    ipv4::send(stack, outbound.dest, protocol::TCP, &bytes)
}

/// Listen for incoming connections on `port`
pub fn listen(stack: &NetworkStack, port: u16) -> NetResult<TcpHandle> {
    let handle = stack.tcp().listen(port)?;
    serial_println!("[TCP] Listening on port {}", port);
    Ok(handle)
}

/// Open a connection to `remote:remote_port`
///
/// A `local_port` of 0 picks an ephemeral port. Connecting the same
/// 4-tuple twice returns the existing handle. If the SYN cannot be sent the
/// connection is dropped and the send error returned.
pub fn connect(
    stack: &NetworkStack,
    remote: Ipv4Addr,
    remote_port: u16,
    local_port: u16,
) -> NetResult<TcpHandle> {
    let iface = stack.primary_interface()?;
    if !iface.is_up() {
        return Err(NetError::DeviceNotFound);
    }

    let (handle, syn) = stack.tcp().open(iface.ip_addr(), local_port, remote, remote_port)?;
    if let Some(syn) = syn {
        let local_port = syn.segment.src_port;
        if let Err(e) = transmit(stack, syn) {
            stack.tcp().remove(handle);
            return Err(e);
        }
        serial_println!("[TCP] Connected port {} to {}:{}", local_port, remote, remote_port);
    }
    Ok(handle)
}

/// Take the next pending connection from `listener`
pub fn accept(stack: &NetworkStack, listener: TcpHandle) -> NetResult<Option<TcpHandle>> {
    stack.tcp().accept(listener)
}

/// Send `data` on an established connection
pub fn send(stack: &NetworkStack, handle: TcpHandle, data: &[u8]) -> NetResult<usize> {
    for outbound in stack.tcp().prepare_send(handle, data)? {
        transmit(stack, outbound)?;
    }
    Ok(data.len())
}

/// Poll the devices, then read buffered bytes from `handle`
///
/// `NotFound` when nothing is buffered.
pub fn receive(stack: &NetworkStack, handle: TcpHandle, buf: &mut [u8]) -> NetResult<usize> {
    stack.poll();
    stack.tcp().read(handle, buf)
}

/// Close `handle`, sending FIN when the state requires one
pub fn close(stack: &NetworkStack, handle: TcpHandle) -> NetResult<()> {
    if let Some(fin) = stack.tcp().close(handle)? {
        transmit(stack, fin)?;
    }
    Ok(())
}

/// Connection state, if `handle` is still in the table
pub fn state(stack: &NetworkStack, handle: TcpHandle) -> Option<TcpState> {
    stack.tcp().state(handle)
}

/// Handle an inbound segment from `src` addressed to `dst`
pub fn handle_segment(stack: &NetworkStack, src: Ipv4Addr, dst: Ipv4Addr, data: &[u8]) -> NetResult<()> {
    let segment = TcpSegment::parse(data)?;
    let replies = stack.tcp().dispatch(src, dst, &segment)?;
    for outbound in replies {
        transmit(stack, outbound)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const PEER: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);
    const LOCAL: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 2);

    fn syn(src_port: u16, dest_port: u16, seq: u32) -> TcpSegment {
        TcpSegment::new(src_port, dest_port, seq, 0, flags::SYN, 1024)
    }

    fn established() -> TcpConnection {
        let id = TcpSocketId {
            local_addr: LOCAL,
            local_port: 80,
            remote_addr: PEER,
            remote_port: 40000,
        };
        let mut conn = TcpConnection::new(id, 16);
        conn.open_passive(&syn(40000, 80, 100), 5000);
        conn
    }

    #[test]
    fn test_segment_build_and_parse() {
        let mut segment = TcpSegment::new(1234, 80, 7, 9, flags::PSH | flags::ACK, 4096);
        segment.data = b"GET /".to_vec();
        let bytes = segment.build(LOCAL, PEER);
        assert_eq!(bytes[12], 0x50);
        assert_eq!(pseudo_header_checksum(LOCAL, PEER, protocol::TCP, &bytes), 0);

        let parsed = TcpSegment::parse(&bytes).unwrap();
        assert_eq!(parsed.sequence, 7);
        assert_eq!(parsed.data, b"GET /".to_vec());
        assert!(parsed.has_flag(flags::PSH));
    }

    #[test]
    fn test_parse_rejects_bad_offset() {
        let mut bytes = TcpSegment::new(1, 2, 0, 0, 0, 0).build(LOCAL, PEER);
        bytes[12] = 0x40;
        assert_eq!(TcpSegment::parse(&bytes), Err(TcpError::InvalidDataOffset(4)));
        assert_eq!(TcpSegment::parse(&bytes[..10]), Err(TcpError::PacketTooShort));
    }

    #[test]
    fn test_passive_open_goes_established() {
        let conn = established();
        assert_eq!(conn.state, TcpState::Established);
        assert_eq!(conn.recv_seq, 101);
        assert_eq!(conn.send_seq, 5001);
    }

    #[test]
    fn test_data_is_buffered_and_acked() {
        let mut conn = established();
        let mut data = TcpSegment::new(40000, 80, 101, 5001, flags::PSH | flags::ACK, 1024);
        data.data = b"hello".to_vec();
        let reaction = conn.on_segment(&data);
        assert_eq!(reaction.replies.len(), 1);
        assert_eq!(reaction.replies[0].acknowledgment, 106);

        let mut out = [0u8; 8];
        assert_eq!(conn.read(&mut out), Some(5));
        assert_eq!(&out[..5], b"hello");
        assert_eq!(conn.read(&mut out), None);
    }

    #[test]
    fn test_ring_overflow_drops_segment_without_ack() {
        let mut conn = established();
        let mut fill = TcpSegment::new(40000, 80, 101, 5001, flags::ACK, 1024);
        fill.data = vec![1; 12];
        assert_eq!(conn.on_segment(&fill).replies[0].acknowledgment, 113);

        let mut overflow = TcpSegment::new(40000, 80, 113, 5001, flags::ACK, 1024);
        overflow.data = vec![7; 10];
        let reaction = conn.on_segment(&overflow);
        assert!(reaction.replies.is_empty());
        assert_eq!(conn.buffered(), 12);
        assert_eq!(conn.window, 16);

        // The peer retransmits once the reader has made room
        let mut out = [0u8; 12];
        assert_eq!(conn.read(&mut out), Some(12));
        assert_eq!(conn.on_segment(&overflow).replies[0].acknowledgment, 123);
        assert_eq!(conn.buffered(), 10);
    }

    #[test]
    fn test_peer_fin_moves_to_last_ack() {
        let mut conn = established();
        let fin = TcpSegment::new(40000, 80, 101, 5001, flags::FIN | flags::ACK, 1024);
        let reaction = conn.on_segment(&fin);
        assert_eq!(conn.state, TcpState::LastAck);
        assert_eq!(reaction.replies.len(), 2);
        assert_eq!(reaction.replies[0].flags, flags::ACK);
        assert_eq!(reaction.replies[0].acknowledgment, 102);
        assert_eq!(reaction.replies[1].flags, flags::FIN | flags::ACK);
        assert_eq!(conn.send_seq, 5002);

        let ack = TcpSegment::new(40000, 80, 102, 5002, flags::ACK, 1024);
        let reaction = conn.on_segment(&ack);
        assert!(reaction.release);
        assert_eq!(conn.state, TcpState::Closed);
    }

    #[test]
    fn test_local_close_and_fin_wait_transitions() {
        let mut conn = established();
        let fin = conn.close().unwrap();
        assert_eq!(fin.flags, flags::FIN | flags::ACK);
        assert_eq!(conn.state, TcpState::FinWait1);

        conn.on_segment(&TcpSegment::new(40000, 80, 101, 5002, flags::ACK, 1024));
        assert_eq!(conn.state, TcpState::FinWait2);

        let reaction = conn.on_segment(&TcpSegment::new(40000, 80, 101, 5002, flags::FIN | flags::ACK, 1024));
        assert_eq!(conn.state, TcpState::TimeWait);
        assert_eq!(reaction.replies[0].acknowledgment, 102);
        assert!(conn.close().is_none());
    }

    #[test]
    fn test_rst_closes() {
        let mut conn = established();
        conn.on_segment(&TcpSegment::new(40000, 80, 101, 0, flags::RST, 0));
        assert_eq!(conn.state, TcpState::Closed);
        assert!(!conn.state.is_readable());
    }

    #[test]
    fn test_send_splits_by_mss() {
        let mut conn = established();
        let segments = conn.segments_for(&[1; 3000], 1460);
        let sizes: Vec<usize> = segments.iter().map(|s| s.data.len()).collect();
        assert_eq!(sizes, vec![1460, 1460, 80]);
        assert_eq!(segments[1].sequence, 5001 + 1460);
        assert_eq!(conn.send_seq, 5001 + 3000);
    }

    #[test]
    fn test_table_listen_rules() {
        let table = TcpTable::new(2, 4096, 1460);
        table.listen(80).unwrap();
        assert_eq!(table.listen(80), Err(NetError::AlreadyExists));
        table.listen(81).unwrap();
        assert_eq!(table.listen(82), Err(NetError::OutOfMemory));
    }

    #[test]
    fn test_table_syn_queues_child_fifo() {
        let table = TcpTable::new(8, 4096, 1460);
        let listener = table.listen(80).unwrap();

        let out = table.dispatch(PEER, LOCAL, &syn(40000, 80, 1)).unwrap();
        assert_eq!(out[0].segment.flags, flags::SYN | flags::ACK);
        assert_eq!(out[0].segment.acknowledgment, 2);
        table.dispatch(PEER, LOCAL, &syn(40001, 80, 1)).unwrap();

        let first = table.accept(listener).unwrap().unwrap();
        let second = table.accept(listener).unwrap().unwrap();
        assert_eq!(table.socket_id(first).unwrap().remote_port, 40000);
        assert_eq!(table.socket_id(second).unwrap().remote_port, 40001);
        assert_eq!(table.accept(listener), Ok(None));
        assert_eq!(table.state(first), Some(TcpState::Established));
    }

    #[test]
    fn test_table_syn_without_listener() {
        let table = TcpTable::new(8, 4096, 1460);
        assert_eq!(table.dispatch(PEER, LOCAL, &syn(40000, 80, 1)).unwrap_err(), NetError::NotFound);
        assert!(table.is_empty());
    }

    #[test]
    fn test_table_open_reuses_tuple_and_ephemeral() {
        let table = TcpTable::new(8, 4096, 1460);
        let (h1, syn1) = table.open(LOCAL, 5555, PEER, 80).unwrap();
        assert!(syn1.is_some());
        let (h2, syn2) = table.open(LOCAL, 5555, PEER, 80).unwrap();
        assert_eq!(h1, h2);
        assert!(syn2.is_none());

        let (h3, _) = table.open(LOCAL, 0, PEER, 80).unwrap();
        assert!(table.socket_id(h3).unwrap().local_port >= EPHEMERAL_PORT_START);
    }

    #[test]
    fn test_table_close_removes() {
        let table = TcpTable::new(8, 4096, 1460);
        let (handle, _) = table.open(LOCAL, 5555, PEER, 80).unwrap();
        let fin = table.close(handle).unwrap().unwrap();
        assert_eq!(fin.segment.flags, flags::FIN | flags::ACK);
        assert_eq!(table.state(handle), None);
        assert_eq!(table.close(handle), Err(NetError::NotFound));
    }

    #[test]
    fn test_table_send_and_read_state_checks() {
        let table = TcpTable::new(8, 4096, 1460);
        let listener = table.listen(80).unwrap();
        assert_eq!(table.prepare_send(listener, b"x").unwrap_err(), NetError::InvalidState);
        let mut buf = [0u8; 4];
        assert_eq!(table.read(listener, &mut buf), Err(NetError::InvalidState));

        let (conn, _) = table.open(LOCAL, 5555, PEER, 80).unwrap();
        assert_eq!(table.prepare_send(conn, b"").unwrap_err(), NetError::InvalidArg);
        assert_eq!(table.read(conn, &mut buf), Err(NetError::NotFound));
    }
}
