//! Operation dispatcher
//!
//! Every operation has a fixed name and a declared mode. Sync ops run to
//! completion inside [`Runtime::dispatch_sync`]; async ops return an
//! [`OpFuture`] whose handles were validated at dispatch time and which is
//! tracked as a pending operation in the resource table until it settles or
//! is dropped.
//!
//! Settlement rules for an async op:
//! - closing its cancel handle settles it with `Interrupted`
//! - closing a handle it references settles it with `Interrupted`, except for
//!   the poll-shaped ops (`op_signal_poll`, `op_fs_watch_poll`), which end
//!   their stream instead

use crate::error::{OpError, OpResult};
use crate::ops::fs::{self, FileInfo, OpenOptions};
use crate::ops::net::{self, Connection, ListenerInfo};
use crate::ops::process::{self, ChildInfo, ProcessStatus, SpawnOptions};
use crate::ops::signal;
use crate::ops::tls::{self, HandshakeInfo, TlsClientOptions, TlsServerOptions};
use crate::ops::watch::{self, FsEvent};
use crate::runtime::Runtime;
use crate::table::{Handle, Interrupt, OpId, Payload, ResourceKind};
use std::fmt;
use std::future::Future;
use std::io::SeekFrom;
use std::net::{Shutdown, SocketAddr};
use std::path::PathBuf;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

/// Whether an op completes synchronously
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpMode {
    Sync,
    Async,
}

/// Name and mode of an operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpDecl {
    pub name: &'static str,
    pub mode: OpMode,
}

const fn sync_op(name: &'static str) -> OpDecl {
    OpDecl {
        name,
        mode: OpMode::Sync,
    }
}

const fn async_op(name: &'static str) -> OpDecl {
    OpDecl {
        name,
        mode: OpMode::Async,
    }
}

pub const OP_CLOSE: OpDecl = sync_op("op_close");
pub const OP_RESOURCES: OpDecl = sync_op("op_resources");
pub const OP_CANCEL_HANDLE: OpDecl = sync_op("op_cancel_handle");
pub const OP_SLEEP: OpDecl = async_op("op_sleep");
pub const OP_OPEN_SYNC: OpDecl = sync_op("op_open_sync");
pub const OP_OPEN_ASYNC: OpDecl = async_op("op_open_async");
pub const OP_READ: OpDecl = async_op("op_read");
pub const OP_WRITE: OpDecl = async_op("op_write");
pub const OP_SEEK: OpDecl = sync_op("op_seek");
pub const OP_FSTAT: OpDecl = sync_op("op_fstat");
pub const OP_FTRUNCATE: OpDecl = sync_op("op_ftruncate");
pub const OP_NET_LISTEN: OpDecl = sync_op("op_net_listen");
pub const OP_NET_ACCEPT: OpDecl = async_op("op_net_accept");
pub const OP_NET_CONNECT: OpDecl = async_op("op_net_connect");
pub const OP_NET_SHUTDOWN: OpDecl = sync_op("op_net_shutdown");
pub const OP_TLS_LISTEN: OpDecl = sync_op("op_tls_listen");
pub const OP_TLS_ACCEPT: OpDecl = async_op("op_tls_accept");
pub const OP_TLS_CONNECT: OpDecl = async_op("op_tls_connect");
pub const OP_TLS_START: OpDecl = sync_op("op_tls_start");
pub const OP_TLS_HANDSHAKE: OpDecl = async_op("op_tls_handshake");
pub const OP_FS_WATCH_OPEN: OpDecl = sync_op("op_fs_watch_open");
pub const OP_FS_WATCH_POLL: OpDecl = async_op("op_fs_watch_poll");
pub const OP_SIGNAL_BIND: OpDecl = sync_op("op_signal_bind");
pub const OP_SIGNAL_POLL: OpDecl = async_op("op_signal_poll");
pub const OP_SIGNAL_UNBIND: OpDecl = sync_op("op_signal_unbind");
pub const OP_SPAWN: OpDecl = sync_op("op_spawn");
pub const OP_PROCESS_STATUS: OpDecl = async_op("op_process_status");
pub const OP_KILL: OpDecl = sync_op("op_kill");

/// Every operation the dispatcher knows, names unique
pub static OPS: &[OpDecl] = &[
    OP_CLOSE,
    OP_RESOURCES,
    OP_CANCEL_HANDLE,
    OP_SLEEP,
    OP_OPEN_SYNC,
    OP_OPEN_ASYNC,
    OP_READ,
    OP_WRITE,
    OP_SEEK,
    OP_FSTAT,
    OP_FTRUNCATE,
    OP_NET_LISTEN,
    OP_NET_ACCEPT,
    OP_NET_CONNECT,
    OP_NET_SHUTDOWN,
    OP_TLS_LISTEN,
    OP_TLS_ACCEPT,
    OP_TLS_CONNECT,
    OP_TLS_START,
    OP_TLS_HANDSHAKE,
    OP_FS_WATCH_OPEN,
    OP_FS_WATCH_POLL,
    OP_SIGNAL_BIND,
    OP_SIGNAL_POLL,
    OP_SIGNAL_UNBIND,
    OP_SPAWN,
    OP_PROCESS_STATUS,
    OP_KILL,
];

/// Look an operation up by name
pub fn lookup(name: &str) -> Option<&'static OpDecl> {
    OPS.iter().find(|decl| decl.name == name)
}

/// An operation and its arguments
#[derive(Debug, Clone)]
pub enum Op {
    Close { rid: Handle },
    Resources,
    CancelHandle,
    Sleep { duration: Duration },
    OpenSync { path: PathBuf, options: OpenOptions },
    OpenAsync { path: PathBuf, options: OpenOptions },
    Read { rid: Handle, len: usize },
    Write { rid: Handle, data: Vec<u8> },
    Seek { rid: Handle, from: SeekFrom },
    Fstat { rid: Handle },
    Ftruncate { rid: Handle, len: u64 },
    NetListen { addr: SocketAddr },
    NetAccept { rid: Handle },
    NetConnect { addr: SocketAddr },
    NetShutdown { rid: Handle, how: Shutdown },
    TlsListen { rid: Handle, options: TlsServerOptions },
    TlsAccept { rid: Handle },
    TlsConnect { addr: SocketAddr, options: TlsClientOptions },
    TlsStart { rid: Handle, options: TlsClientOptions },
    TlsHandshake { rid: Handle },
    FsWatchOpen { paths: Vec<PathBuf>, recursive: bool },
    FsWatchPoll { rid: Handle },
    SignalBind { signal: String },
    SignalPoll { rid: Handle },
    SignalUnbind { rid: Handle },
    Spawn(SpawnOptions),
    ProcessStatus { rid: Handle },
    Kill { pid: i32, signal: String },
}

impl Op {
    pub fn decl(&self) -> &'static OpDecl {
        match self {
            Op::Close { .. } => &OP_CLOSE,
            Op::Resources => &OP_RESOURCES,
            Op::CancelHandle => &OP_CANCEL_HANDLE,
            Op::Sleep { .. } => &OP_SLEEP,
            Op::OpenSync { .. } => &OP_OPEN_SYNC,
            Op::OpenAsync { .. } => &OP_OPEN_ASYNC,
            Op::Read { .. } => &OP_READ,
            Op::Write { .. } => &OP_WRITE,
            Op::Seek { .. } => &OP_SEEK,
            Op::Fstat { .. } => &OP_FSTAT,
            Op::Ftruncate { .. } => &OP_FTRUNCATE,
            Op::NetListen { .. } => &OP_NET_LISTEN,
            Op::NetAccept { .. } => &OP_NET_ACCEPT,
            Op::NetConnect { .. } => &OP_NET_CONNECT,
            Op::NetShutdown { .. } => &OP_NET_SHUTDOWN,
            Op::TlsListen { .. } => &OP_TLS_LISTEN,
            Op::TlsAccept { .. } => &OP_TLS_ACCEPT,
            Op::TlsConnect { .. } => &OP_TLS_CONNECT,
            Op::TlsStart { .. } => &OP_TLS_START,
            Op::TlsHandshake { .. } => &OP_TLS_HANDSHAKE,
            Op::FsWatchOpen { .. } => &OP_FS_WATCH_OPEN,
            Op::FsWatchPoll { .. } => &OP_FS_WATCH_POLL,
            Op::SignalBind { .. } => &OP_SIGNAL_BIND,
            Op::SignalPoll { .. } => &OP_SIGNAL_POLL,
            Op::SignalUnbind { .. } => &OP_SIGNAL_UNBIND,
            Op::Spawn(_) => &OP_SPAWN,
            Op::ProcessStatus { .. } => &OP_PROCESS_STATUS,
            Op::Kill { .. } => &OP_KILL,
        }
    }

    pub fn name(&self) -> &'static str {
        self.decl().name
    }

    /// Handles the op reads or consumes
    pub fn handles(&self) -> Vec<Handle> {
        match self {
            Op::Close { rid }
            | Op::Read { rid, .. }
            | Op::Write { rid, .. }
            | Op::Seek { rid, .. }
            | Op::Fstat { rid }
            | Op::Ftruncate { rid, .. }
            | Op::NetAccept { rid }
            | Op::NetShutdown { rid, .. }
            | Op::TlsListen { rid, .. }
            | Op::TlsAccept { rid }
            | Op::TlsStart { rid, .. }
            | Op::TlsHandshake { rid }
            | Op::FsWatchPoll { rid }
            | Op::SignalPoll { rid }
            | Op::SignalUnbind { rid }
            | Op::ProcessStatus { rid } => vec![*rid],
            _ => Vec::new(),
        }
    }

    /// Value a poll-shaped op settles with when its stream handle closes
    fn end_of_stream(&self) -> Option<(Handle, OpValue)> {
        match self {
            Op::SignalPoll { rid } => Some((*rid, OpValue::Done(true))),
            Op::FsWatchPoll { rid } => Some((*rid, OpValue::FsEvent(None))),
            _ => None,
        }
    }
}

// =============================================================================
// Values
// =============================================================================

/// Successful result of an operation
#[derive(Debug, Clone, PartialEq)]
pub enum OpValue {
    Unit,
    Handle(Handle),
    /// Bytes read; empty means end of stream
    Bytes(Vec<u8>),
    /// Bytes written
    Count(usize),
    Offset(u64),
    FileInfo(FileInfo),
    Listener(ListenerInfo),
    Connection(Connection),
    Handshake(HandshakeInfo),
    /// Next watch event; `None` once the watch is closed
    FsEvent(Option<FsEvent>),
    /// Signal poll outcome; `true` once the binding is gone
    Done(bool),
    Child(ChildInfo),
    Status(ProcessStatus),
    Resources(Vec<(Handle, ResourceKind)>),
}

impl fmt::Display for OpValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OpValue::Unit => "unit",
            OpValue::Handle(_) => "handle",
            OpValue::Bytes(_) => "bytes",
            OpValue::Count(_) => "count",
            OpValue::Offset(_) => "offset",
            OpValue::FileInfo(_) => "file info",
            OpValue::Listener(_) => "listener",
            OpValue::Connection(_) => "connection",
            OpValue::Handshake(_) => "handshake",
            OpValue::FsEvent(_) => "fs event",
            OpValue::Done(_) => "done",
            OpValue::Child(_) => "child",
            OpValue::Status(_) => "status",
            OpValue::Resources(_) => "resources",
        };
        f.write_str(name)
    }
}

macro_rules! into_value {
    ($($fn_name:ident => $variant:ident($ty:ty)),* $(,)?) => {
        impl OpValue {
            $(
                pub fn $fn_name(self) -> OpResult<$ty> {
                    match self {
                        OpValue::$variant(value) => Ok(value),
                        other => Err(OpError::invalid_data(format!(
                            concat!("expected ", stringify!($variant), " value, got {}"),
                            other
                        ))),
                    }
                }
            )*
        }
    };
}

into_value! {
    into_handle => Handle(Handle),
    into_bytes => Bytes(Vec<u8>),
    into_count => Count(usize),
    into_offset => Offset(u64),
    into_file_info => FileInfo(FileInfo),
    into_listener => Listener(ListenerInfo),
    into_connection => Connection(Connection),
    into_handshake => Handshake(HandshakeInfo),
    into_fs_event => FsEvent(Option<FsEvent>),
    into_done => Done(bool),
    into_child => Child(ChildInfo),
    into_status => Status(ProcessStatus),
    into_resources => Resources(Vec<(Handle, ResourceKind)>),
}

impl OpValue {
    pub fn into_unit(self) -> OpResult<()> {
        match self {
            OpValue::Unit => Ok(()),
            other => Err(OpError::invalid_data(format!(
                "expected Unit value, got {}",
                other
            ))),
        }
    }
}

// =============================================================================
// Dispatch
// =============================================================================

fn not_supported_here(decl: &OpDecl, mode: OpMode) -> OpError {
    let how = match mode {
        OpMode::Sync => "synchronously",
        OpMode::Async => "asynchronously",
    };
    OpError::not_supported(format!("{} cannot be dispatched {}", decl.name, how))
}

impl Runtime {
    /// Run a sync op to completion
    pub fn dispatch_sync(&self, op: Op) -> OpResult<OpValue> {
        let decl = op.decl();
        if decl.mode != OpMode::Sync {
            return Err(not_supported_here(decl, OpMode::Sync));
        }
        log::debug!("dispatch: {}", decl.name);

        match op {
            Op::Close { rid } => self.close(rid).map(|_| OpValue::Unit),
            Op::Resources => Ok(OpValue::Resources(self.resources())),
            Op::CancelHandle => self.register(Payload::Cancel).map(OpValue::Handle),
            Op::OpenSync { path, options } => fs::open(self, &path, options).map(OpValue::Handle),
            Op::Seek { rid, from } => fs::seek(self, rid, from).map(OpValue::Offset),
            Op::Fstat { rid } => fs::fstat(self, rid).map(OpValue::FileInfo),
            Op::Ftruncate { rid, len } => fs::ftruncate(self, rid, len).map(|_| OpValue::Unit),
            Op::NetListen { addr } => net::listen(self, addr).map(OpValue::Listener),
            Op::NetShutdown { rid, how } => net::shutdown(self, rid, how).map(|_| OpValue::Unit),
            Op::TlsListen { rid, options } => {
                tls::listen(self, rid, &options).map(OpValue::Listener)
            }
            Op::TlsStart { rid, options } => {
                tls::start(self, rid, &options).map(OpValue::Connection)
            }
            Op::FsWatchOpen { paths, recursive } => watch_open(self, &paths, recursive),
            Op::SignalBind { signal } => signal::bind(self, &signal).map(OpValue::Handle),
            Op::SignalUnbind { rid } => signal::unbind(self, rid).map(|_| OpValue::Unit),
            Op::Spawn(options) => process::spawn(self, &options).map(OpValue::Child),
            Op::Kill { pid, signal } => process::kill(pid, &signal).map(|_| OpValue::Unit),
            other => Err(not_supported_here(other.decl(), OpMode::Sync)),
        }
    }

    /// Start an async op.
    ///
    /// The handles the op names, and `cancel` if given, must be open now;
    /// otherwise the returned future resolves to `BadResource`.
    pub fn dispatch_async(&self, op: Op, cancel: Option<Handle>) -> OpFuture {
        let decl = op.decl();
        if decl.mode != OpMode::Async {
            return OpFuture::failed(self.clone(), decl.name, not_supported_here(decl, OpMode::Async));
        }

        let begun = self
            .table()
            .borrow_mut()
            .begin_op(decl.name, &op.handles(), cancel);
        let id = match begun {
            Ok(id) => id,
            Err(e) => {
                log::debug!("dispatch: {} rejected: {}", decl.name, e);
                return OpFuture::failed(self.clone(), decl.name, e);
            }
        };
        log::debug!("dispatch: {} (async)", decl.name);

        let end_of_stream = op.end_of_stream();
        let rt = self.clone();
        OpFuture {
            rt: self.clone(),
            name: decl.name,
            id: Some(id),
            end_of_stream,
            inner: Some(Box::pin(async move { run_async(rt, op).await })),
            failed: None,
        }
    }
}

#[cfg(target_os = "linux")]
fn watch_open(rt: &Runtime, paths: &[PathBuf], recursive: bool) -> OpResult<OpValue> {
    watch::open(rt, paths, recursive).map(OpValue::Handle)
}

#[cfg(not(target_os = "linux"))]
fn watch_open(_rt: &Runtime, _paths: &[PathBuf], _recursive: bool) -> OpResult<OpValue> {
    Err(OpError::not_supported("filesystem watching requires inotify"))
}

async fn run_async(rt: Runtime, op: Op) -> OpResult<OpValue> {
    match op {
        Op::Sleep { duration } => {
            rt.sleep(duration).await;
            Ok(OpValue::Unit)
        }
        Op::OpenAsync { path, options } => fs::open(&rt, &path, options).map(OpValue::Handle),
        Op::Read { rid, len } => crate::ops::read(&rt, rid, len).await.map(OpValue::Bytes),
        Op::Write { rid, data } => crate::ops::write(&rt, rid, &data).await.map(OpValue::Count),
        Op::NetAccept { rid } => net::accept(&rt, rid).await.map(OpValue::Connection),
        Op::NetConnect { addr } => net::connect(&rt, addr).await.map(OpValue::Connection),
        Op::TlsAccept { rid } => tls::accept(&rt, rid).await.map(OpValue::Connection),
        Op::TlsConnect { addr, options } => tls::connect(&rt, addr, &options)
            .await
            .map(OpValue::Connection),
        Op::TlsHandshake { rid } => tls::handshake(&rt, rid).await.map(OpValue::Handshake),
        #[cfg(target_os = "linux")]
        Op::FsWatchPoll { rid } => watch::poll(&rt, rid)
            .await
            .map(|event| OpValue::FsEvent(Some(event))),
        Op::SignalPoll { rid } => signal::poll(&rt, rid).await.map(OpValue::Done),
        Op::ProcessStatus { rid } => process::status(&rt, rid).await.map(OpValue::Status),
        other => Err(not_supported_here(other.decl(), OpMode::Async)),
    }
}

// =============================================================================
// Op futures
// =============================================================================

type InnerFuture = Pin<Box<dyn Future<Output = OpResult<OpValue>>>>;

/// A dispatched async operation.
///
/// Dropping it before it settles abandons the op and releases its pending
/// record.
pub struct OpFuture {
    rt: Runtime,
    name: &'static str,
    id: Option<OpId>,
    end_of_stream: Option<(Handle, OpValue)>,
    inner: Option<InnerFuture>,
    failed: Option<OpError>,
}

impl OpFuture {
    fn failed(rt: Runtime, name: &'static str, err: OpError) -> Self {
        Self {
            rt,
            name,
            id: None,
            end_of_stream: None,
            inner: None,
            failed: Some(err),
        }
    }

    /// Name of the dispatched op
    pub fn name(&self) -> &'static str {
        self.name
    }

    fn settle(&mut self) {
        if let Some(id) = self.id.take() {
            self.rt.table().borrow_mut().end_op(id);
        }
        self.inner = None;
    }

    fn interrupted(&mut self, reason: Interrupt) -> OpResult<OpValue> {
        match (reason, self.end_of_stream.take()) {
            (Interrupt::Closed(h), Some((stream, value))) if h == stream => Ok(value),
            (Interrupt::Closed(h), _) => Err(OpError::interrupted(format!(
                "resource {} was closed while {} was pending",
                h, self.name
            ))),
            (Interrupt::Canceled(_), _) => Err(OpError::interrupted(format!(
                "{} was canceled",
                self.name
            ))),
        }
    }
}

impl Future for OpFuture {
    type Output = OpResult<OpValue>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;
        if let Some(err) = this.failed.take() {
            return Poll::Ready(Err(err));
        }
        let Some(id) = this.id else {
            return Poll::Ready(Err(OpError::bad_resource(format!(
                "{} was polled after it settled",
                this.name
            ))));
        };

        // A close recorded since the last poll wins over any progress
        let interrupt = this.rt.table().borrow().interrupt(id);
        if let Some(reason) = interrupt {
            this.settle();
            let result = this.interrupted(reason);
            log::debug!("dispatch: {} settled by {:?}", this.name, reason);
            return Poll::Ready(result);
        }

        this.rt.table().borrow_mut().park_op(id, cx.waker());
        let polled = match this.inner.as_mut() {
            Some(inner) => inner.as_mut().poll(cx),
            None => return Poll::Pending,
        };
        match polled {
            Poll::Ready(result) => {
                this.settle();
                Poll::Ready(result)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for OpFuture {
    fn drop(&mut self) {
        if let Some(id) = self.id.take() {
            if let Ok(mut table) = self.rt.table().try_borrow_mut() {
                table.end_op(id);
            }
        }
    }
}
