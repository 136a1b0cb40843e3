//! BSD-style sockets over UDP and TCP
//!
//! Sockets are small integer handles starting at 3. Each one records its
//! type, the local and remote addresses it has been given and, for streams,
//! the TCP connection it owns. All calls are non-blocking: `recv` on an
//! empty socket and `accept` with nothing pending return immediately.
//!
//! The socket table lock is never held while the TCP table is touched.

use alloc::collections::BTreeMap;
use core::net::{Ipv4Addr, SocketAddrV4};
use spin::Mutex;

use crate::error::{NetError, NetResult};
use crate::net::stack::NetworkStack;
use crate::net::tcp::{self, TcpHandle};
use crate::net::udp;
use crate::serial_println;

/// Address family: IPv4
pub const AF_INET: i32 = 2;

/// Option level
pub const SOL_SOCKET: i32 = 1;

/// Socket options
pub const SO_REUSEADDR: i32 = 2;
pub const SO_KEEPALIVE: i32 = 9;

/// First handle handed out
pub const FIRST_FD: SocketFd = 3;

pub type SocketFd = i32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum SocketType {
    Stream = 1,
    Datagram = 2,
    Raw = 3,
}

impl TryFrom<i32> for SocketType {
    type Error = NetError;

    fn try_from(value: i32) -> NetResult<Self> {
        match value {
            1 => Ok(SocketType::Stream),
            2 => Ok(SocketType::Datagram),
            3 => Ok(SocketType::Raw),
            _ => Err(NetError::NotSupported),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketState {
    Created,
    Bound,
    Listening,
    Connected,
}

/// One socket table entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Socket {
    pub socket_type: SocketType,
    pub protocol: i32,
    pub state: SocketState,
    pub local: Option<SocketAddrV4>,
    pub remote: Option<SocketAddrV4>,
    /// Listener or connection owned by a stream socket
    pub tcp: Option<TcpHandle>,
}

impl Socket {
    fn new(socket_type: SocketType, protocol: i32) -> Self {
        Self {
            socket_type,
            protocol,
            state: SocketState::Created,
            local: None,
            remote: None,
            tcp: None,
        }
    }

    fn local_port(&self) -> Option<u16> {
        self.local.map(|addr| addr.port())
    }

    /// Bound or connected
    fn is_attached(&self) -> bool {
        self.local.is_some() || self.remote.is_some()
    }
}

struct TableInner {
    sockets: BTreeMap<SocketFd, Socket>,
    next_fd: SocketFd,
}

/// Live sockets, bounded by `capacity`
pub struct SocketTable {
    inner: Mutex<TableInner>,
    capacity: usize,
}

impl SocketTable {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(TableInner {
                sockets: BTreeMap::new(),
                next_fd: FIRST_FD,
            }),
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().sockets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of a socket
    pub fn get(&self, fd: SocketFd) -> NetResult<Socket> {
        self.inner.lock().sockets.get(&fd).copied().ok_or(NetError::InvalidArg)
    }

    fn insert(&self, socket: Socket) -> NetResult<SocketFd> {
        let mut inner = self.inner.lock();
        if inner.sockets.len() >= self.capacity {
            return Err(NetError::OutOfMemory);
        }
        let fd = inner.next_fd;
        inner.next_fd += 1;
        inner.sockets.insert(fd, socket);
        Ok(fd)
    }

    /// Apply `f` to the socket under the table lock
    fn update<T>(&self, fd: SocketFd, f: impl FnOnce(&mut Socket) -> NetResult<T>) -> NetResult<T> {
        let mut inner = self.inner.lock();
        let socket = inner.sockets.get_mut(&fd).ok_or(NetError::InvalidArg)?;
        f(socket)
    }

    fn remove(&self, fd: SocketFd) -> Option<Socket> {
        self.inner.lock().sockets.remove(&fd)
    }
}

/// Create a socket
///
/// # Returns
/// * `NotSupported` - domain is not `AF_INET`
/// * `OutOfMemory` - the socket table is full
pub fn create(stack: &NetworkStack, domain: i32, socket_type: SocketType, protocol: i32) -> NetResult<SocketFd> {
    if domain != AF_INET {
        return Err(NetError::NotSupported);
    }
    stack.sockets().insert(Socket::new(socket_type, protocol))
}

/// Give a socket its local address
///
/// A datagram socket opens a UDP inbox for the port, picking an ephemeral
/// one for port 0. Binding twice is `InvalidState`; a port already open is
/// `AlreadyExists`.
pub fn bind(stack: &NetworkStack, fd: SocketFd, addr: SocketAddrV4) -> NetResult<()> {
    stack.sockets().update(fd, |socket| {
        if socket.local.is_some() {
            return Err(NetError::InvalidState);
        }

        let port = match socket.socket_type {
            SocketType::Datagram if addr.port() == 0 => stack.udp().open_ephemeral()?,
            SocketType::Datagram => {
                if !stack.udp().open(addr.port()) {
                    return Err(NetError::AlreadyExists);
                }
                addr.port()
            }
            SocketType::Stream | SocketType::Raw => addr.port(),
        };

        socket.local = Some(SocketAddrV4::new(*addr.ip(), port));
        socket.state = SocketState::Bound;
        Ok(())
    })
}

/// Start listening on a bound stream socket
pub fn listen(stack: &NetworkStack, fd: SocketFd, _backlog: usize) -> NetResult<()> {
    let socket = stack.sockets().get(fd)?;
    if socket.socket_type != SocketType::Stream {
        return Err(NetError::NotSupported);
    }
    let port = match (socket.state, socket.local_port()) {
        (SocketState::Bound, Some(port)) => port,
        _ => return Err(NetError::InvalidState),
    };

    let listener = tcp::listen(stack, port)?;
    let attached = stack.sockets().update(fd, |socket| {
        socket.tcp = Some(listener);
        socket.state = SocketState::Listening;
        Ok(())
    });
    if attached.is_err() {
        // Closed while the listener was being set up
        stack.tcp().remove(listener);
    }
    attached
}

/// Connect a socket to `addr`
///
/// Streams open a TCP connection from the bound port (or an ephemeral
/// one). Datagram sockets record the peer and bind an ephemeral port if
/// unbound. Raw sockets only record the peer.
pub fn connect(stack: &NetworkStack, fd: SocketFd, addr: SocketAddrV4) -> NetResult<()> {
    let socket = stack.sockets().get(fd)?;

    match socket.socket_type {
        SocketType::Stream => {
            if socket.tcp.is_some() {
                return Err(NetError::InvalidState);
            }
            let local_port = socket.local_port().unwrap_or(0);
            let handle = tcp::connect(stack, *addr.ip(), addr.port(), local_port)?;
            let local = stack
                .tcp()
                .socket_id(handle)
                .map(|id| SocketAddrV4::new(id.local_addr, id.local_port));

            let attached = stack.sockets().update(fd, |socket| {
                socket.tcp = Some(handle);
                socket.local = local.or(socket.local);
                socket.remote = Some(addr);
                socket.state = SocketState::Connected;
                Ok(())
            });
            if attached.is_err() {
                let _ = tcp::close(stack, handle);
            }
            attached
        }
        SocketType::Datagram => stack.sockets().update(fd, |socket| {
            if socket.local.is_none() {
                let port = stack.udp().open_ephemeral()?;
                socket.local = Some(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port));
            }
            socket.remote = Some(addr);
            socket.state = SocketState::Connected;
            Ok(())
        }),
        SocketType::Raw => stack.sockets().update(fd, |socket| {
            socket.remote = Some(addr);
            socket.state = SocketState::Connected;
            Ok(())
        }),
    }
}

/// Take a pending connection from a listening stream socket
///
/// Polls the devices first. `Ok(None)` when nothing is waiting; otherwise
/// the new connected socket and its peer.
pub fn accept(stack: &NetworkStack, fd: SocketFd) -> NetResult<Option<(SocketFd, SocketAddrV4)>> {
    let socket = stack.sockets().get(fd)?;
    if socket.socket_type != SocketType::Stream {
        return Err(NetError::NotSupported);
    }
    let listener = match (socket.state, socket.tcp) {
        (SocketState::Listening, Some(listener)) => listener,
        _ => return Err(NetError::InvalidState),
    };

    stack.poll();
    let Some(child) = tcp::accept(stack, listener)? else {
        return Ok(None);
    };
    let id = stack.tcp().socket_id(child).ok_or(NetError::NotFound)?;
    let peer = SocketAddrV4::new(id.remote_addr, id.remote_port);

    let connected = Socket {
        socket_type: SocketType::Stream,
        protocol: socket.protocol,
        state: SocketState::Connected,
        local: Some(SocketAddrV4::new(id.local_addr, id.local_port)),
        remote: Some(peer),
        tcp: Some(child),
    };
    match stack.sockets().insert(connected) {
        Ok(new_fd) => Ok(Some((new_fd, peer))),
        Err(e) => {
            let _ = tcp::close(stack, child);
            Err(e)
        }
    }
}

/// Send on a connected socket
pub fn send(stack: &NetworkStack, fd: SocketFd, data: &[u8]) -> NetResult<usize> {
    let socket = stack.sockets().get(fd)?;
    if !socket.is_attached() {
        return Err(NetError::InvalidState);
    }

    match socket.socket_type {
        SocketType::Stream => {
            let handle = socket.tcp.ok_or(NetError::InvalidState)?;
            tcp::send(stack, handle, data)
        }
        SocketType::Datagram => {
            let remote = socket.remote.ok_or(NetError::InvalidState)?;
            let src_port = socket.local_port().ok_or(NetError::InvalidState)?;
            udp::send(stack, *remote.ip(), remote.port(), src_port, data)?;
            Ok(data.len())
        }
        SocketType::Raw => Err(NetError::NotSupported),
    }
}

/// Receive into `buf`
///
/// `NotFound` when nothing is waiting. A datagram larger than `buf` is
/// truncated.
pub fn recv(stack: &NetworkStack, fd: SocketFd, buf: &mut [u8]) -> NetResult<usize> {
    let socket = stack.sockets().get(fd)?;
    if !socket.is_attached() {
        return Err(NetError::InvalidState);
    }

    match socket.socket_type {
        SocketType::Stream => {
            let handle = socket.tcp.ok_or(NetError::InvalidState)?;
            tcp::receive(stack, handle, buf)
        }
        SocketType::Datagram => {
            let port = socket.local_port().ok_or(NetError::InvalidState)?;
            let datagram = udp::receive(stack, port)?;
            Ok(copy_datagram(&datagram.data, buf))
        }
        SocketType::Raw => Err(NetError::NotSupported),
    }
}

/// Send one datagram to `addr`, binding an ephemeral port if needed
pub fn send_to(stack: &NetworkStack, fd: SocketFd, data: &[u8], addr: SocketAddrV4) -> NetResult<usize> {
    let src_port = stack.sockets().update(fd, |socket| {
        if socket.socket_type != SocketType::Datagram {
            return Err(NetError::NotSupported);
        }
        match socket.local_port() {
            Some(port) => Ok(port),
            None => {
                let port = stack.udp().open_ephemeral()?;
                socket.local = Some(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port));
                socket.state = SocketState::Bound;
                Ok(port)
            }
        }
    })?;

    udp::send(stack, *addr.ip(), addr.port(), src_port, data)?;
    Ok(data.len())
}

/// Receive one datagram and its sender
pub fn recv_from(stack: &NetworkStack, fd: SocketFd, buf: &mut [u8]) -> NetResult<(usize, SocketAddrV4)> {
    let socket = stack.sockets().get(fd)?;
    if socket.socket_type != SocketType::Datagram {
        return Err(NetError::NotSupported);
    }
    let port = socket.local_port().ok_or(NetError::InvalidState)?;

    let datagram = udp::receive(stack, port)?;
    let len = copy_datagram(&datagram.data, buf);
    Ok((len, SocketAddrV4::new(datagram.src_ip, datagram.src_port)))
}

fn copy_datagram(data: &[u8], buf: &mut [u8]) -> usize {
    let len = data.len().min(buf.len());
    buf[..len].copy_from_slice(&data[..len]);
    len
}

/// Close a socket
///
/// The socket leaves the table before its TCP connection is closed, so a
/// failed FIN still frees the handle.
pub fn close(stack: &NetworkStack, fd: SocketFd) -> NetResult<()> {
    let socket = stack.sockets().remove(fd).ok_or(NetError::InvalidArg)?;

    if let Some(handle) = socket.tcp {
        match tcp::close(stack, handle) {
            Ok(()) | Err(NetError::NotFound) => {}
            Err(e) => serial_println!("[TCP] Close of socket {} failed: {}", fd, e),
        }
    }
    if socket.socket_type == SocketType::Datagram {
        if let Some(port) = socket.local_port() {
            stack.udp().close(port);
        }
    }
    Ok(())
}

fn check_option(stack: &NetworkStack, fd: SocketFd, level: i32, option: i32, len: usize) -> NetResult<()> {
    stack.sockets().get(fd)?;
    if level != SOL_SOCKET {
        return Err(NetError::NotSupported);
    }
    if option != SO_REUSEADDR && option != SO_KEEPALIVE {
        return Err(NetError::NotSupported);
    }
    if len != 4 {
        return Err(NetError::InvalidArg);
    }
    Ok(())
}

/// Set a socket option. Accepted options are validated but not stored.
pub fn setsockopt(stack: &NetworkStack, fd: SocketFd, level: i32, option: i32, value: &[u8]) -> NetResult<()> {
    check_option(stack, fd, level, option, value.len())
}

/// Read a socket option into `out`, which must be 4 bytes. Always reports 0.
pub fn getsockopt(stack: &NetworkStack, fd: SocketFd, level: i32, option: i32, out: &mut [u8]) -> NetResult<usize> {
    check_option(stack, fd, level, option, out.len())?;
    out.copy_from_slice(&0i32.to_ne_bytes());
    Ok(4)
}
