//! TLS streams using rustls (pure Rust, no OpenSSL).
//!
//! TLS is a layer wrapped around an accepted or connected TCP stream. The
//! handshake is never implicit: every TLS socket starts out handshaking and
//! reads or writes fail with `NotConnected` until `op_tls_handshake` has
//! completed on it.

use super::net::{self, Connection, Endpoint, ListenerInfo, ListenerResource};
use super::Step;
use crate::error::{ErrorKind, OpError, OpResult};
use crate::runtime::{Interest, Runtime};
use crate::table::{Handle, Payload, ResourceKind};
use rustls::pki_types::{CertificateDer, ServerName};
use rustls::{ClientConfig, ClientConnection, RootCertStore, ServerConfig, ServerConnection};
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::Arc;

/// Server identity for `op_tls_listen`
#[derive(Debug, Clone, Default)]
pub struct TlsServerOptions {
    /// PEM certificate chain, leaf first
    pub cert_chain: String,
    /// PEM private key (PKCS#8, PKCS#1 or SEC1)
    pub private_key: String,
    pub alpn_protocols: Vec<String>,
}

/// Client trust settings for `op_tls_connect` and `op_tls_start`
#[derive(Debug, Clone, Default)]
pub struct TlsClientOptions {
    /// Name to verify the server certificate against; defaults to the peer IP
    pub server_name: Option<String>,
    /// PEM CA certificates; the Mozilla roots are used when empty
    pub ca_certs: Vec<String>,
    pub alpn_protocols: Vec<String>,
}

/// Result of a completed handshake
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeInfo {
    pub protocol: Option<String>,
    pub alpn: Option<String>,
}

// =============================================================================
// Configuration
// =============================================================================

fn provider() -> Arc<rustls::crypto::CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

fn parse_certs(pem: &str) -> OpResult<Vec<CertificateDer<'static>>> {
    let certs = rustls_pemfile::certs(&mut pem.as_bytes()).collect::<Result<Vec<_>, _>>()?;
    if certs.is_empty() {
        return Err(OpError::invalid_data("no valid certificates found in PEM"));
    }
    Ok(certs)
}

fn alpn(protocols: &[String]) -> Vec<Vec<u8>> {
    protocols.iter().map(|p| p.as_bytes().to_vec()).collect()
}

/// Build a server config from a PEM certificate chain and key
pub fn server_config(options: &TlsServerOptions) -> OpResult<Arc<ServerConfig>> {
    let certs = parse_certs(&options.cert_chain)?;
    let key = rustls_pemfile::private_key(&mut options.private_key.as_bytes())?
        .ok_or_else(|| OpError::invalid_data("no private key found in PEM"))?;

    let mut config = ServerConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_single_cert(certs, key)?;
    config.alpn_protocols = alpn(&options.alpn_protocols);
    Ok(Arc::new(config))
}

/// Build a client config trusting the given CAs, or the Mozilla roots
pub fn client_config(options: &TlsClientOptions) -> OpResult<Arc<ClientConfig>> {
    let root_store = if options.ca_certs.is_empty() {
        RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned())
    } else {
        let mut store = RootCertStore::empty();
        for pem in &options.ca_certs {
            for cert in parse_certs(pem)? {
                store.add(cert)?;
            }
        }
        store
    };

    let mut config = ClientConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()?
        .with_root_certificates(root_store)
        .with_no_client_auth();
    config.alpn_protocols = alpn(&options.alpn_protocols);
    Ok(Arc::new(config))
}

// =============================================================================
// Resources
// =============================================================================

/// A TLS listener: a plain listener plus the server identity
pub struct TlsListenerResource {
    listener: ListenerResource,
    config: Arc<ServerConfig>,
}

impl TlsListenerResource {
    pub fn fd(&self) -> RawFd {
        self.listener.fd()
    }

    pub fn listener(&self) -> &ListenerResource {
        &self.listener
    }
}

/// A TCP stream wrapped in a client or server TLS session
pub struct TlsSocketResource {
    tcp: TcpStream,
    conn: rustls::Connection,
    local: SocketAddr,
    remote: SocketAddr,
    handshake_done: bool,
    eof: bool,
}

impl TlsSocketResource {
    fn new(tcp: TcpStream, conn: rustls::Connection, local: SocketAddr, remote: SocketAddr) -> Self {
        Self {
            tcp,
            conn,
            local,
            remote,
            handshake_done: false,
            eof: false,
        }
    }

    pub fn fd(&self) -> RawFd {
        self.tcp.as_raw_fd()
    }

    pub fn is_handshake_done(&self) -> bool {
        self.handshake_done
    }

    fn info(&self) -> HandshakeInfo {
        HandshakeInfo {
            protocol: self.conn.protocol_version().map(|v| format!("{:?}", v)),
            alpn: self
                .conn
                .alpn_protocol()
                .map(|p| String::from_utf8_lossy(p).to_string()),
        }
    }

    fn require_handshake(&self) -> OpResult<()> {
        match self.handshake_done {
            true => Ok(()),
            false => Err(OpError::new(
                ErrorKind::NotConnected,
                "TLS handshake has not completed",
            )),
        }
    }

    /// Write queued TLS records. `Ok(false)` means the socket is full.
    fn flush_tls(&mut self) -> OpResult<bool> {
        while self.conn.wants_write() {
            match self.conn.write_tls(&mut self.tcp) {
                Ok(0) => {
                    return Err(OpError::new(
                        ErrorKind::WriteZero,
                        "socket accepted no TLS data",
                    ))
                }
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) => return Err(e.into()),
            }
        }
        Ok(true)
    }

    /// Feed received records to the session, sending any alert it produces
    fn process_packets(&mut self) -> OpResult<()> {
        if let Err(e) = self.conn.process_new_packets() {
            let _ = self.conn.write_tls(&mut self.tcp);
            return Err(e.into());
        }
        Ok(())
    }

    pub(crate) fn handshake_step(&mut self) -> OpResult<Step<HandshakeInfo>> {
        loop {
            if !self.flush_tls()? {
                return Ok(Step::Wait(Interest::WRITABLE));
            }
            if !self.conn.is_handshaking() {
                self.handshake_done = true;
                return Ok(Step::Done(self.info()));
            }
            match self.conn.read_tls(&mut self.tcp) {
                Ok(0) => {
                    return Err(OpError::new(
                        ErrorKind::UnexpectedEof,
                        "peer closed the connection during the TLS handshake",
                    ))
                }
                Ok(_) => self.process_packets()?,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(Step::Wait(Interest::READABLE))
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    pub(crate) fn read(&mut self, len: usize) -> OpResult<Step<Vec<u8>>> {
        self.require_handshake()?;
        let mut buf = vec![0u8; len];
        loop {
            // Post-handshake messages (session tickets, key updates)
            self.flush_tls()?;

            match self.conn.reader().read(&mut buf) {
                Ok(n) => {
                    buf.truncate(n);
                    return Ok(Step::Done(buf));
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                    log::debug!("tls: peer {} closed without close_notify", self.remote);
                    return Ok(Step::Done(Vec::new()));
                }
                Err(e) => return Err(e.into()),
            }
            if self.eof {
                return Ok(Step::Done(Vec::new()));
            }

            match self.conn.read_tls(&mut self.tcp) {
                Ok(0) => self.eof = true,
                Ok(_) => self.process_packets()?,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    // Records left over from a write still have to go out, or
                    // a peer waiting on them never answers
                    let mut interest = Interest::READABLE;
                    if self.conn.wants_write() {
                        interest |= Interest::WRITABLE;
                    }
                    return Ok(Step::Wait(interest));
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Hand plaintext to the session.
    ///
    /// The returned count is final as soon as the session takes the bytes.
    /// Records the socket had no room for stay queued and are pushed out
    /// ahead of anything the next read or write does, so a write never
    /// reports bytes that belong to an earlier call.
    pub(crate) fn write(&mut self, data: &[u8]) -> OpResult<Step<usize>> {
        self.require_handshake()?;
        if !self.flush_tls()? {
            return Ok(Step::Wait(Interest::WRITABLE));
        }
        let accepted = self.conn.writer().write(data)?;
        if !self.flush_tls()? {
            log::trace!("tls: {} bytes to {} queued behind a full socket", accepted, self.remote);
        }
        Ok(Step::Done(accepted))
    }

    pub(crate) fn shutdown(&mut self, how: Shutdown) -> OpResult<()> {
        if matches!(how, Shutdown::Write | Shutdown::Both) {
            self.send_close_notify();
        }
        Ok(self.tcp.shutdown(how)?)
    }

    /// Queue close_notify and push it out if the socket has room
    pub(crate) fn send_close_notify(&mut self) {
        if !self.handshake_done {
            return;
        }
        self.conn.send_close_notify();
        if let Err(e) = self.flush_tls() {
            log::debug!("tls: close_notify to {} not sent: {}", self.remote, e);
        }
    }
}

// =============================================================================
// Operations
// =============================================================================

fn connection(rid: Handle, local: SocketAddr, remote: SocketAddr) -> Connection {
    Connection {
        rid,
        local: Endpoint::tcp(local),
        remote: Endpoint::tcp(remote),
    }
}

/// Wrap a plain listener. The plain handle is consumed.
pub(crate) fn listen(rt: &Runtime, rid: Handle, options: &TlsServerOptions) -> OpResult<ListenerInfo> {
    let config = server_config(options)?;
    let kind = rt.kind(rid)?;
    if kind != ResourceKind::Listener {
        return Err(Runtime::wrong_kind(rid, kind, "op_tls_listen"));
    }
    let listener = match rt.take(rid)? {
        Payload::Listener(l) => l,
        other => return Err(Runtime::wrong_kind(rid, other.kind(), "op_tls_listen")),
    };
    let local = Endpoint::tcp(listener.local_addr());
    let rid = rt.register(Payload::TlsListener(TlsListenerResource { listener, config }))?;
    Ok(ListenerInfo { rid, local })
}

fn tls_listener(payload: &mut Payload) -> Option<&mut ListenerResource> {
    match payload {
        Payload::TlsListener(l) => Some(&mut l.listener),
        _ => None,
    }
}

pub(crate) async fn accept(rt: &Runtime, rid: Handle) -> OpResult<Connection> {
    let (stream, remote) = net::accept_stream(rt, rid, "op_tls_accept", tls_listener).await?;
    let config = rt.with_payload(rid, |payload| match payload {
        Payload::TlsListener(l) => Ok(l.config.clone()),
        other => Err(Runtime::wrong_kind(rid, other.kind(), "op_tls_accept")),
    })?;
    let local = stream.local_addr()?;
    let conn = rustls::Connection::Server(ServerConnection::new(config)?);
    let rid = rt.register(Payload::TlsSocket(TlsSocketResource::new(
        stream, conn, local, remote,
    )))?;
    Ok(connection(rid, local, remote))
}

/// Upgrade a connected plain socket. The plain handle is consumed.
pub(crate) fn start(rt: &Runtime, rid: Handle, options: &TlsClientOptions) -> OpResult<Connection> {
    let config = client_config(options)?;
    let peer = rt.with_payload(rid, |payload| match payload {
        Payload::Socket(s) => Ok(s.peer_addr()),
        other => Err(Runtime::wrong_kind(rid, other.kind(), "op_tls_start")),
    })?;
    let name = options
        .server_name
        .clone()
        .unwrap_or_else(|| peer.ip().to_string());
    let server_name = ServerName::try_from(name.clone())
        .map_err(|_| OpError::invalid_data(format!("invalid server name '{}'", name)))?;
    let conn = rustls::Connection::Client(ClientConnection::new(config, server_name)?);

    // Everything that can fail is done; the plain handle is consumed from here
    let (stream, local, remote) = match rt.take(rid)? {
        Payload::Socket(s) => s.into_parts(),
        other => return Err(Runtime::wrong_kind(rid, other.kind(), "op_tls_start")),
    };
    let new_rid = rt.register(Payload::TlsSocket(TlsSocketResource::new(
        stream, conn, local, remote,
    )))?;
    log::debug!("tls: handle {} upgraded to {}", rid, new_rid);
    Ok(connection(new_rid, local, remote))
}

pub(crate) async fn connect(
    rt: &Runtime,
    addr: SocketAddr,
    options: &TlsClientOptions,
) -> OpResult<Connection> {
    // Reject bad trust settings before touching the network
    client_config(options)?;
    let plain = net::connect(rt, addr).await?;
    start(rt, plain.rid, options).map_err(|e| {
        if rt.close(plain.rid).is_err() {
            log::debug!("tls: plain handle {} already consumed", plain.rid);
        }
        e
    })
}

pub(crate) async fn handshake(rt: &Runtime, rid: Handle) -> OpResult<HandshakeInfo> {
    loop {
        let step = rt.with_payload(rid, |payload| match payload {
            Payload::TlsSocket(s) => s.handshake_step(),
            other => Err(Runtime::wrong_kind(rid, other.kind(), "op_tls_handshake")),
        })?;
        match step {
            Step::Done(info) => return Ok(info),
            Step::Wait(interest) => rt.readiness(rid, interest).await,
        }
    }
}
