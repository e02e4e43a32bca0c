//! Resource table
//!
//! Maps opaque integer handles to owned OS resources and keeps the record of
//! every pending asynchronous operation, so that closing a handle can settle
//! whatever is still waiting on it.
//!
//! Handles come from a monotonic counter starting at 1 and are never reused.
//! A handle below the counter that is no longer present is therefore known to
//! be closed, which is how [`ResourceTable::state`] tells Closed from unknown.

use crate::error::{OpError, OpResult};
use crate::ops::fs::FileResource;
use crate::ops::net::{ListenerResource, SocketResource};
use crate::ops::process::{PipeResource, ProcessResource};
use crate::ops::signal::SignalResource;
use crate::ops::tls::{TlsListenerResource, TlsSocketResource};
#[cfg(target_os = "linux")]
use crate::ops::watch::WatchResource;
use crate::runtime::Token;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::os::unix::io::RawFd;
use std::task::Waker;

/// Opaque resource handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Handle(u32);

impl Handle {
    /// Rebuild a handle from its integer form
    pub fn from_raw(raw: u32) -> Self {
        Handle(raw)
    }

    pub fn raw(self) -> u32 {
        self.0
    }

    /// Reactor token for the handle's descriptor
    pub fn token(self) -> Token {
        Token(self.0 as u64)
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Kind of resource behind a handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    File,
    Socket,
    TlsSocket,
    Listener,
    TlsListener,
    FsWatch,
    SignalBinding,
    Process,
    Other,
}

impl ResourceKind {
    pub fn name(self) -> &'static str {
        match self {
            ResourceKind::File => "file",
            ResourceKind::Socket => "socket",
            ResourceKind::TlsSocket => "tlsSocket",
            ResourceKind::Listener => "listener",
            ResourceKind::TlsListener => "tlsListener",
            ResourceKind::FsWatch => "fsWatch",
            ResourceKind::SignalBinding => "signal",
            ResourceKind::Process => "process",
            ResourceKind::Other => "other",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Lifecycle state of a handle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceState {
    Open,
    Closed,
}

/// Owned resource behind a handle
pub enum Payload {
    File(FileResource),
    Socket(SocketResource),
    TlsSocket(TlsSocketResource),
    Listener(ListenerResource),
    TlsListener(TlsListenerResource),
    #[cfg(target_os = "linux")]
    FsWatch(WatchResource),
    SignalBinding(SignalResource),
    Process(ProcessResource),
    /// Child stdio pipe
    Pipe(PipeResource),
    /// Cancel handle: closing it interrupts the ops dispatched against it
    Cancel,
}

impl Payload {
    pub fn kind(&self) -> ResourceKind {
        match self {
            Payload::File(_) => ResourceKind::File,
            Payload::Socket(_) => ResourceKind::Socket,
            Payload::TlsSocket(_) => ResourceKind::TlsSocket,
            Payload::Listener(_) => ResourceKind::Listener,
            Payload::TlsListener(_) => ResourceKind::TlsListener,
            #[cfg(target_os = "linux")]
            Payload::FsWatch(_) => ResourceKind::FsWatch,
            Payload::SignalBinding(_) => ResourceKind::SignalBinding,
            Payload::Process(_) => ResourceKind::Process,
            Payload::Pipe(_) | Payload::Cancel => ResourceKind::Other,
        }
    }

    /// Descriptor to register with the reactor, if the resource is pollable.
    /// Regular files are always ready and cannot be added to epoll.
    pub fn poll_fd(&self) -> Option<RawFd> {
        match self {
            Payload::Socket(s) => Some(s.fd()),
            Payload::TlsSocket(s) => Some(s.fd()),
            Payload::Listener(l) => Some(l.fd()),
            Payload::TlsListener(l) => Some(l.fd()),
            #[cfg(target_os = "linux")]
            Payload::FsWatch(w) => Some(w.fd()),
            Payload::SignalBinding(s) => Some(s.fd()),
            Payload::Pipe(p) => Some(p.fd()),
            Payload::File(_) | Payload::Process(_) | Payload::Cancel => None,
        }
    }

    /// Kind-specific teardown run by close before the payload is dropped
    pub(crate) fn teardown(&mut self) {
        if let Payload::TlsSocket(s) = self {
            s.send_close_notify();
        }
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Payload::{}", self.kind())
    }
}

// =============================================================================
// Pending operations
// =============================================================================

/// Pending operation identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OpId(u64);

/// Why a pending operation must settle without running to completion
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interrupt {
    /// A handle the op references was closed or consumed
    Closed(Handle),
    /// The op's cancel handle was closed
    Canceled(Handle),
}

#[derive(Debug)]
struct PendingOp {
    name: &'static str,
    handles: Vec<Handle>,
    cancel: Option<Handle>,
    waker: Option<Waker>,
    interrupt: Option<Interrupt>,
}

/// Handle to resource mapping plus pending operation records
pub struct ResourceTable {
    entries: BTreeMap<Handle, Payload>,
    next_handle: u32,
    pending: HashMap<OpId, PendingOp>,
    next_op: u64,
}

impl ResourceTable {
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
            next_handle: 1,
            pending: HashMap::new(),
            next_op: 1,
        }
    }

    /// Insert a resource under a fresh handle
    pub fn add(&mut self, payload: Payload) -> Handle {
        let handle = Handle(self.next_handle);
        self.next_handle += 1;
        self.entries.insert(handle, payload);
        handle
    }

    pub fn get(&self, handle: Handle) -> OpResult<&Payload> {
        self.entries.get(&handle).ok_or_else(|| bad_handle(handle))
    }

    pub fn get_mut(&mut self, handle: Handle) -> OpResult<&mut Payload> {
        self.entries.get_mut(&handle).ok_or_else(|| bad_handle(handle))
    }

    pub fn kind(&self, handle: Handle) -> OpResult<ResourceKind> {
        self.get(handle).map(Payload::kind)
    }

    /// Open, Closed, or `None` for a handle that was never issued
    pub fn state(&self, handle: Handle) -> Option<ResourceState> {
        if self.entries.contains_key(&handle) {
            Some(ResourceState::Open)
        } else if handle.0 >= 1 && handle.0 < self.next_handle {
            Some(ResourceState::Closed)
        } else {
            None
        }
    }

    pub fn contains(&self, handle: Handle) -> bool {
        self.entries.contains_key(&handle)
    }

    /// Remove a resource, interrupting every pending op that references it.
    /// Returns the payload and the wakers of the interrupted ops.
    pub fn close(&mut self, handle: Handle) -> OpResult<(Payload, Vec<Waker>)> {
        let payload = self.entries.remove(&handle).ok_or_else(|| bad_handle(handle))?;
        let wakers = self.interrupt_referencing(handle);
        Ok((payload, wakers))
    }

    /// Open resources in handle order
    pub fn resources(&self) -> Vec<(Handle, ResourceKind)> {
        self.entries.iter().map(|(h, p)| (*h, p.kind())).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn interrupt_referencing(&mut self, handle: Handle) -> Vec<Waker> {
        let mut wakers = Vec::new();
        for op in self.pending.values_mut() {
            if op.interrupt.is_some() {
                continue;
            }
            let reason = if op.cancel == Some(handle) {
                Interrupt::Canceled(handle)
            } else if op.handles.contains(&handle) {
                Interrupt::Closed(handle)
            } else {
                continue;
            };
            log::debug!("table: {} interrupted by {:?}", op.name, reason);
            op.interrupt = Some(reason);
            if let Some(waker) = op.waker.take() {
                wakers.push(waker);
            }
        }
        wakers
    }

    /// Record a new pending op after checking every handle it names is open
    pub fn begin_op(
        &mut self,
        name: &'static str,
        handles: &[Handle],
        cancel: Option<Handle>,
    ) -> OpResult<OpId> {
        for &handle in handles {
            self.get(handle)?;
        }
        if let Some(cancel) = cancel {
            match self.get(cancel)? {
                Payload::Cancel => {}
                other => {
                    return Err(OpError::bad_resource(format!(
                        "handle {} is a {} resource, not a cancel handle",
                        cancel,
                        other.kind()
                    )))
                }
            }
        }

        let id = OpId(self.next_op);
        self.next_op += 1;
        self.pending.insert(
            id,
            PendingOp {
                name,
                handles: handles.to_vec(),
                cancel,
                waker: None,
                interrupt: None,
            },
        );
        Ok(id)
    }

    /// Remember the waker to call if the op gets interrupted
    pub fn park_op(&mut self, id: OpId, waker: &Waker) {
        if let Some(op) = self.pending.get_mut(&id) {
            match &op.waker {
                Some(w) if w.will_wake(waker) => {}
                _ => op.waker = Some(waker.clone()),
            }
        }
    }

    pub fn interrupt(&self, id: OpId) -> Option<Interrupt> {
        self.pending.get(&id).and_then(|op| op.interrupt)
    }

    pub fn end_op(&mut self, id: OpId) {
        self.pending.remove(&id);
    }

    /// Number of ops dispatched but not yet settled or dropped
    pub fn pending_ops(&self) -> usize {
        self.pending.len()
    }
}

impl Default for ResourceTable {
    fn default() -> Self {
        Self::new()
    }
}

fn bad_handle(handle: Handle) -> OpError {
    OpError::bad_resource(format!("handle {} is not open", handle))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::task::Wake;

    struct CountingWaker(AtomicUsize);

    impl Wake for CountingWaker {
        fn wake(self: Arc<Self>) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_handles_are_monotonic() {
        let mut table = ResourceTable::new();
        let a = table.add(Payload::Cancel);
        let b = table.add(Payload::Cancel);
        assert_eq!(a.raw(), 1);
        assert_eq!(b.raw(), 2);

        table.close(a).unwrap();
        let c = table.add(Payload::Cancel);
        assert_eq!(c.raw(), 3);
    }

    #[test]
    fn test_state_transitions() {
        let mut table = ResourceTable::new();
        let h = table.add(Payload::Cancel);
        assert_eq!(table.state(h), Some(ResourceState::Open));
        assert_eq!(table.kind(h).unwrap(), ResourceKind::Other);

        table.close(h).unwrap();
        assert_eq!(table.state(h), Some(ResourceState::Closed));
        assert_eq!(table.state(Handle::from_raw(99)), None);
        assert_eq!(table.state(Handle::from_raw(0)), None);
    }

    #[test]
    fn test_double_close_is_bad_resource() {
        let mut table = ResourceTable::new();
        let h = table.add(Payload::Cancel);
        assert!(table.close(h).is_ok());
        let err = table.close(h).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BadResource);
    }

    #[test]
    fn test_begin_op_validates_handles() {
        let mut table = ResourceTable::new();
        let h = table.add(Payload::Cancel);
        let err = table
            .begin_op("op_read", &[Handle::from_raw(42)], None)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BadResource);

        // The cancel handle must itself be a cancel resource
        let target = table.add(Payload::Cancel);
        assert!(table.begin_op("op_sleep", &[], Some(h)).is_ok());
        table.close(target).unwrap();
        assert!(table.begin_op("op_sleep", &[], Some(target)).is_err());
    }

    #[test]
    fn test_close_interrupts_pending_ops() {
        let mut table = ResourceTable::new();
        let h = table.add(Payload::Cancel);
        let cancel = table.add(Payload::Cancel);
        let other = table.add(Payload::Cancel);

        let on_h = table.begin_op("op_read", &[h], None).unwrap();
        let on_cancel = table.begin_op("op_sleep", &[], Some(cancel)).unwrap();
        let unrelated = table.begin_op("op_read", &[other], None).unwrap();

        let counter = Arc::new(CountingWaker(AtomicUsize::new(0)));
        let waker = Waker::from(counter.clone());
        table.park_op(on_h, &waker);
        table.park_op(on_cancel, &waker);
        table.park_op(unrelated, &waker);

        let (_, wakers) = table.close(h).unwrap();
        assert_eq!(wakers.len(), 1);
        assert_eq!(table.interrupt(on_h), Some(Interrupt::Closed(h)));
        assert_eq!(table.interrupt(unrelated), None);

        let (_, wakers) = table.close(cancel).unwrap();
        wakers.into_iter().for_each(Waker::wake);
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);
        assert_eq!(table.interrupt(on_cancel), Some(Interrupt::Canceled(cancel)));

        table.end_op(on_h);
        table.end_op(on_cancel);
        table.end_op(unrelated);
        assert_eq!(table.pending_ops(), 0);
    }

    #[test]
    fn test_resources_listing() {
        let mut table = ResourceTable::new();
        let a = table.add(Payload::Cancel);
        let b = table.add(Payload::Cancel);
        table.close(a).unwrap();
        assert_eq!(table.resources(), vec![(b, ResourceKind::Other)]);
    }
}
