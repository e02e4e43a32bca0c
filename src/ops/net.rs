//! TCP listeners and streams
//!
//! A listener moves `Bound → Accepting → Bound ...` while accepts are in
//! flight and is only ever ended by closing its handle. An accept pending at
//! that point settles with `Interrupted`.

use super::{nonblocking, Step};
use crate::error::{OpError, OpResult};
use crate::runtime::{Interest, Runtime};
use crate::table::{Handle, Payload};
use socket2::{Domain, Protocol, Socket, Type};
use std::cell::Cell;
use std::fmt;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};
use std::rc::Rc;

/// Transport discriminator carried by every endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transport {
    Tcp,
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transport::Tcp => f.write_str("tcp"),
        }
    }
}

/// Network endpoint
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub transport: Transport,
    pub hostname: String,
    pub port: u16,
}

impl Endpoint {
    pub fn tcp(addr: SocketAddr) -> Self {
        Self {
            transport: Transport::Tcp,
            hostname: addr.ip().to_string(),
            port: addr.port(),
        }
    }

    /// Resolve back to a socket address; the hostname must be an IP literal
    pub fn socket_addr(&self) -> OpResult<SocketAddr> {
        let ip = self.hostname.parse().map_err(|_| {
            OpError::invalid_data(format!("'{}' is not an IP address", self.hostname))
        })?;
        Ok(SocketAddr::new(ip, self.port))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.hostname.contains(':') {
            true => write!(f, "{}://[{}]:{}", self.transport, self.hostname, self.port),
            false => write!(f, "{}://{}:{}", self.transport, self.hostname, self.port),
        }
    }
}

/// An established connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connection {
    pub rid: Handle,
    pub local: Endpoint,
    pub remote: Endpoint,
}

/// A listening socket
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerInfo {
    pub rid: Handle,
    pub local: Endpoint,
}

/// Listener lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    /// Bound and listening, no accept in flight
    Bound,
    /// At least one accept is waiting for a connection
    Accepting,
}

// =============================================================================
// Resources
// =============================================================================

/// A connected TCP stream
pub struct SocketResource {
    stream: TcpStream,
    local: SocketAddr,
    remote: SocketAddr,
}

impl SocketResource {
    pub(crate) fn new(stream: TcpStream, local: SocketAddr, remote: SocketAddr) -> Self {
        Self {
            stream,
            local,
            remote,
        }
    }

    pub fn fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.remote
    }

    pub(crate) fn into_parts(self) -> (TcpStream, SocketAddr, SocketAddr) {
        (self.stream, self.local, self.remote)
    }

    pub(crate) fn read(&mut self, len: usize) -> io::Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        let n = self.stream.read(&mut buf)?;
        buf.truncate(n);
        Ok(buf)
    }

    pub(crate) fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.stream.write(data)
    }

    pub(crate) fn shutdown(&self, how: Shutdown) -> io::Result<()> {
        self.stream.shutdown(how)
    }

    /// Check a non-blocking connect. `Ok(false)` means still in progress.
    fn poll_connect(&mut self) -> io::Result<bool> {
        if let Some(e) = self.stream.take_error()? {
            return Err(e);
        }
        match self.stream.peer_addr() {
            Ok(remote) => {
                self.remote = remote;
                self.local = self.stream.local_addr()?;
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(false),
            Err(e) => Err(e),
        }
    }
}

/// A bound TCP listener
pub struct ListenerResource {
    listener: TcpListener,
    local: SocketAddr,
    in_flight: Rc<Cell<usize>>,
    accepted: u64,
}

impl ListenerResource {
    /// Bind and listen with SO_REUSEADDR (optional) and the given backlog
    pub fn bind(addr: SocketAddr, backlog: i32, reuse_address: bool) -> io::Result<Self> {
        let domain = if addr.is_ipv4() {
            Domain::IPV4
        } else {
            Domain::IPV6
        };
        let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
        if reuse_address {
            socket.set_reuse_address(true)?;
        }
        socket.set_nonblocking(true)?;
        socket.bind(&addr.into())?;
        socket.listen(backlog)?;

        let listener: TcpListener = socket.into();
        let local = listener.local_addr()?;
        Ok(Self {
            listener,
            local,
            in_flight: Rc::new(Cell::new(0)),
            accepted: 0,
        })
    }

    pub fn fd(&self) -> RawFd {
        self.listener.as_raw_fd()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    pub fn state(&self) -> ListenerState {
        match self.in_flight.get() {
            0 => ListenerState::Bound,
            _ => ListenerState::Accepting,
        }
    }

    /// Connections accepted so far
    pub fn accepted(&self) -> u64 {
        self.accepted
    }

    fn begin_accept(&self) -> AcceptGuard {
        self.in_flight.set(self.in_flight.get() + 1);
        AcceptGuard(self.in_flight.clone())
    }

    fn try_accept(&mut self) -> io::Result<(TcpStream, SocketAddr)> {
        let (stream, remote) = self.listener.accept()?;
        stream.set_nonblocking(true)?;
        stream.set_nodelay(true)?;
        self.accepted += 1;
        Ok((stream, remote))
    }
}

/// Keeps the listener in `Accepting` while an accept future is alive
struct AcceptGuard(Rc<Cell<usize>>);

impl Drop for AcceptGuard {
    fn drop(&mut self) {
        self.0.set(self.0.get().saturating_sub(1));
    }
}

// =============================================================================
// Operations
// =============================================================================

pub(crate) fn listen(rt: &Runtime, addr: SocketAddr) -> OpResult<ListenerInfo> {
    let net = &rt.config().net;
    let listener = ListenerResource::bind(addr, net.listen_backlog, net.reuse_address)?;
    let local = Endpoint::tcp(listener.local_addr());
    let rid = rt.register(Payload::Listener(listener))?;
    log::debug!("net: listening on {} as handle {}", local, rid);
    Ok(ListenerInfo { rid, local })
}

fn plain_listener(payload: &mut Payload) -> Option<&mut ListenerResource> {
    match payload {
        Payload::Listener(l) => Some(l),
        _ => None,
    }
}

/// Accept one stream from whichever listener `pick` selects in the payload
pub(crate) async fn accept_stream(
    rt: &Runtime,
    rid: Handle,
    op: &str,
    pick: fn(&mut Payload) -> Option<&mut ListenerResource>,
) -> OpResult<(TcpStream, SocketAddr)> {
    let _accepting = rt.with_payload(rid, |payload| {
        let kind = payload.kind();
        pick(payload)
            .map(|l| l.begin_accept())
            .ok_or_else(|| Runtime::wrong_kind(rid, kind, op))
    })?;

    loop {
        let step = rt.with_payload(rid, |payload| {
            let kind = payload.kind();
            match pick(payload) {
                Some(listener) => nonblocking(listener.try_accept(), Interest::READABLE),
                None => Err(Runtime::wrong_kind(rid, kind, op)),
            }
        })?;
        match step {
            Step::Done(accepted) => return Ok(accepted),
            Step::Wait(interest) => rt.readiness(rid, interest).await,
        }
    }
}

pub(crate) async fn accept(rt: &Runtime, rid: Handle) -> OpResult<Connection> {
    let (stream, remote) = accept_stream(rt, rid, "op_net_accept", plain_listener).await?;
    let local = stream.local_addr()?;
    let rid = rt.register(Payload::Socket(SocketResource::new(stream, local, remote)))?;
    Ok(Connection {
        rid,
        local: Endpoint::tcp(local),
        remote: Endpoint::tcp(remote),
    })
}

/// Closes a half-open connection handle unless the connect succeeded
struct ConnectGuard {
    rt: Runtime,
    rid: Handle,
    armed: bool,
}

impl Drop for ConnectGuard {
    fn drop(&mut self) {
        if self.armed && self.rt.close(self.rid).is_err() {
            log::debug!("net: connecting handle {} was already closed", self.rid);
        }
    }
}

pub(crate) async fn connect(rt: &Runtime, addr: SocketAddr) -> OpResult<Connection> {
    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_nonblocking(true)?;
    socket.set_nodelay(true)?;
    match socket.connect(&addr.into()) {
        Ok(()) => {}
        Err(e) if e.raw_os_error() == Some(libc::EINPROGRESS) => {}
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
        Err(e) => return Err(e.into()),
    }

    let stream: TcpStream = socket.into();
    let unspecified = SocketAddr::new(addr.ip(), 0);
    let rid = rt.register(Payload::Socket(SocketResource::new(stream, unspecified, addr)))?;
    let mut guard = ConnectGuard {
        rt: rt.clone(),
        rid,
        armed: true,
    };

    loop {
        let step = rt.with_payload(rid, |payload| match payload {
            Payload::Socket(s) => match s.poll_connect()? {
                true => Ok(Step::Done((s.local_addr(), s.peer_addr()))),
                false => Ok(Step::Wait(Interest::WRITABLE)),
            },
            other => Err(Runtime::wrong_kind(rid, other.kind(), "op_net_connect")),
        })?;
        match step {
            Step::Done((local, remote)) => {
                guard.armed = false;
                log::debug!("net: connected to {} as handle {}", remote, rid);
                return Ok(Connection {
                    rid,
                    local: Endpoint::tcp(local),
                    remote: Endpoint::tcp(remote),
                });
            }
            Step::Wait(interest) => rt.readiness(rid, interest).await,
        }
    }
}

pub(crate) fn shutdown(rt: &Runtime, rid: Handle, how: Shutdown) -> OpResult<()> {
    rt.with_payload(rid, |payload| match payload {
        Payload::Socket(s) => Ok(s.shutdown(how)?),
        Payload::TlsSocket(s) => s.shutdown(how),
        other => Err(Runtime::wrong_kind(rid, other.kind(), "op_net_shutdown")),
    })
}

/// Current state of a plain or TLS listener
pub fn listener_state(rt: &Runtime, rid: Handle) -> OpResult<ListenerState> {
    rt.with_payload(rid, |payload| match payload {
        Payload::Listener(l) => Ok(l.state()),
        Payload::TlsListener(l) => Ok(l.listener().state()),
        other => Err(Runtime::wrong_kind(rid, other.kind(), "listener_state")),
    })
}
