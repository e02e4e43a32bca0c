//! Re-arming poll loops over signal bindings and filesystem watches
//!
//! Both wrappers keep exactly one poll in flight per handle. A settled poll
//! either delivers a value and is re-issued, or reports end of stream and
//! releases the handle. Loops are plain `loop`s over dispatched futures and
//! only talk to the runtime through dispatch and close.

use crate::dispatch::{Op, OpValue};
use crate::error::{ErrorKind, OpResult};
use crate::ops::watch::FsEvent;
use crate::runtime::Runtime;
use crate::table::{Handle, ResourceState};
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::path::PathBuf;
use std::rc::Rc;

/// Identifies one registered signal listener
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Callback = Rc<RefCell<dyn FnMut(&str)>>;

struct Subscription {
    rid: Handle,
    listeners: Vec<(ListenerId, Callback)>,
}

#[derive(Default)]
struct ListenerState {
    subscriptions: HashMap<String, Subscription>,
    next_id: u64,
}

/// Per-signal listener sets.
///
/// The first listener for a signal binds it and starts a poll loop; removing
/// the last one unbinds it, which ends the loop. Listeners run in
/// registration order, once per delivery.
pub struct SignalListeners {
    rt: Runtime,
    state: Rc<RefCell<ListenerState>>,
}

impl SignalListeners {
    pub fn new(rt: &Runtime) -> Self {
        Self {
            rt: rt.clone(),
            state: Rc::new(RefCell::new(ListenerState::default())),
        }
    }

    /// Register `callback` for `signal` (e.g. `"SIGUSR1"`)
    pub fn add(&self, signal: &str, callback: impl FnMut(&str) + 'static) -> OpResult<ListenerId> {
        let callback: Callback = Rc::new(RefCell::new(callback));
        let mut state = self.state.borrow_mut();
        let id = ListenerId(state.next_id);

        if let Some(subscription) = state.subscriptions.get_mut(signal) {
            subscription.listeners.push((id, callback));
            state.next_id += 1;
            return Ok(id);
        }

        let rid = self
            .rt
            .dispatch_sync(Op::SignalBind {
                signal: signal.to_string(),
            })?
            .into_handle()?;
        state.next_id += 1;
        state.subscriptions.insert(
            signal.to_string(),
            Subscription {
                rid,
                listeners: vec![(id, callback)],
            },
        );
        drop(state);

        log::debug!("poll_loop: {} bound as handle {}", signal, rid);
        let _detached = self.rt.spawn(signal_loop(
            self.rt.clone(),
            self.state.clone(),
            signal.to_string(),
            rid,
        ));
        Ok(id)
    }

    /// Remove a listener. Returns false if it was not registered.
    pub fn remove(&self, id: ListenerId) -> bool {
        let mut state = self.state.borrow_mut();
        let Some(signal) = state
            .subscriptions
            .iter()
            .find(|(_, s)| s.listeners.iter().any(|(l, _)| *l == id))
            .map(|(name, _)| name.clone())
        else {
            return false;
        };

        let emptied = match state.subscriptions.get_mut(&signal) {
            Some(subscription) => {
                subscription.listeners.retain(|(l, _)| *l != id);
                subscription.listeners.is_empty()
            }
            None => false,
        };
        if !emptied {
            return true;
        }

        let released = state.subscriptions.remove(&signal);
        drop(state);
        if let Some(subscription) = released {
            if let Err(e) = self.rt.dispatch_sync(Op::SignalUnbind {
                rid: subscription.rid,
            }) {
                log::warn!("poll_loop: unbinding {} failed: {}", signal, e);
            }
        }
        true
    }

    pub fn listener_count(&self, signal: &str) -> usize {
        self.state
            .borrow()
            .subscriptions
            .get(signal)
            .map(|s| s.listeners.len())
            .unwrap_or(0)
    }

    /// Handle of the live binding for `signal`, if any listener exists
    pub fn binding(&self, signal: &str) -> Option<Handle> {
        self.state.borrow().subscriptions.get(signal).map(|s| s.rid)
    }
}

impl Drop for SignalListeners {
    fn drop(&mut self) {
        let released: Vec<(String, Subscription)> = match self.state.try_borrow_mut() {
            Ok(mut state) => state.subscriptions.drain().collect(),
            Err(_) => {
                log::warn!("poll_loop: listener state busy, bindings left to their loops");
                return;
            }
        };
        for (signal, subscription) in released {
            if let Err(e) = self.rt.dispatch_sync(Op::SignalUnbind {
                rid: subscription.rid,
            }) {
                log::debug!("poll_loop: {} binding already gone: {}", signal, e);
            }
        }
    }
}

async fn signal_loop(rt: Runtime, state: Rc<RefCell<ListenerState>>, signal: String, rid: Handle) {
    loop {
        let polled = rt
            .dispatch_async(Op::SignalPoll { rid }, None)
            .await
            .and_then(OpValue::into_done);
        match polled {
            Ok(false) => {}
            Ok(true) => break,
            Err(e) if e.kind() == ErrorKind::BadResource => break,
            Err(e) => {
                log::warn!("poll_loop: polling {} failed: {}", signal, e);
                break;
            }
        }

        // Snapshot so listeners may add or remove listeners while running
        let callbacks: Vec<Callback> = state
            .borrow()
            .subscriptions
            .get(&signal)
            .filter(|s| s.rid == rid)
            .map(|s| s.listeners.iter().map(|(_, cb)| cb.clone()).collect())
            .unwrap_or_default();
        for callback in callbacks {
            (&mut *callback.borrow_mut())(signal.as_str());
        }
    }

    // Ended by an error rather than an unbind: drop the stale subscription
    let stale = {
        let mut state = state.borrow_mut();
        let current = state.subscriptions.get(&signal).map(|s| s.rid) == Some(rid);
        if current {
            state.subscriptions.remove(&signal);
        }
        current
    };
    if stale && rt.close(rid).is_err() {
        log::debug!("poll_loop: binding {} already closed", rid);
    }
    log::debug!("poll_loop: {} loop on handle {} finished", signal, rid);
}

/// Async iterator over filesystem events
pub struct FsWatcher {
    rt: Runtime,
    rid: Handle,
    finished: Cell<bool>,
}

impl FsWatcher {
    pub fn open(rt: &Runtime, paths: &[PathBuf], recursive: bool) -> OpResult<Self> {
        let rid = rt
            .dispatch_sync(Op::FsWatchOpen {
                paths: paths.to_vec(),
                recursive,
            })?
            .into_handle()?;
        Ok(Self {
            rt: rt.clone(),
            rid,
            finished: Cell::new(false),
        })
    }

    pub fn rid(&self) -> Handle {
        self.rid
    }

    /// Next event, or `None` once the watch has been closed.
    ///
    /// A `Busy` poll (another `next` already in flight) also ends the
    /// iteration instead of failing. The handle is then released as soon as
    /// the poll that was in flight settles, after it has delivered.
    pub async fn next(&self) -> OpResult<Option<FsEvent>> {
        if self.finished.get() {
            return Ok(None);
        }
        let polled = self
            .rt
            .dispatch_async(Op::FsWatchPoll { rid: self.rid }, None)
            .await;
        let result = match polled.and_then(OpValue::into_fs_event) {
            Ok(Some(event)) => Ok(Some(event)),
            Ok(None) => {
                self.finished.set(true);
                return Ok(None);
            }
            Err(e) if e.kind() == ErrorKind::Busy => {
                log::debug!("poll_loop: watch {} busy, ending iteration", self.rid);
                self.finished.set(true);
                return Ok(None);
            }
            Err(e) => Err(e),
        };
        if self.finished.get() {
            self.release();
        }
        result
    }

    /// Close the watch; an in-flight `next` resolves to `None`
    pub fn close(&self) -> OpResult<()> {
        self.finished.set(true);
        self.rt.close(self.rid)
    }

    fn release(&self) {
        if self.rt.state(self.rid) == Some(ResourceState::Open) && self.rt.close(self.rid).is_err() {
            log::debug!("poll_loop: watch {} already closed", self.rid);
        }
    }
}

impl Drop for FsWatcher {
    fn drop(&mut self) {
        self.release();
    }
}
