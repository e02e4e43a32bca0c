//! Single-threaded cooperative runtime
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                         RUNTIME                                 │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  EventLoop: epoll (Linux) / kqueue (macOS, BSD)                 │
//! │  Reactor:   registered descriptors and the tasks parked on them │
//! │  TimerWheel: sleeps and periodic re-checks                      │
//! │  Executor:  spawned tasks and the ready queue                   │
//! │  ResourceTable: handles, payloads and pending operations        │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! [`Runtime`] is a cheap, cloneable, `!Send` reference to all of the above.
//! Every operation future holds one, so resources are always reached through
//! the table and never through a raw pointer that could outlive a close.

mod event_loop;
mod executor;
mod reactor;
mod timer;

pub use event_loop::{Event, EventLoop, Interest, Token};
pub use executor::{Executor, JoinHandle, TaskId};
pub use reactor::Reactor;
pub use timer::TimerWheel;

use crate::config::RuntimeConfig;
use crate::error::{OpError, OpResult};
use crate::table::{Handle, Payload, ResourceKind, ResourceState, ResourceTable};
use std::cell::{Cell, RefCell};
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll, Wake, Waker};
use std::time::{Duration, Instant};

struct Inner {
    config: RuntimeConfig,
    table: RefCell<ResourceTable>,
    reactor: RefCell<Reactor>,
    timers: RefCell<TimerWheel>,
    executor: Executor,
    next_timer: Cell<u64>,
}

/// Handle to the runtime that owns every resource
#[derive(Clone)]
pub struct Runtime {
    inner: Rc<Inner>,
}

/// Snapshot of runtime bookkeeping, mostly useful for leak checks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuntimeStats {
    pub resources: usize,
    pub pending_ops: usize,
    pub registrations: usize,
    pub timers: usize,
    pub tasks: usize,
}

impl Runtime {
    /// Create a runtime with the default configuration
    pub fn new() -> OpResult<Self> {
        Self::with_config(RuntimeConfig::default())
    }

    /// Create a runtime with the given configuration
    pub fn with_config(config: RuntimeConfig) -> OpResult<Self> {
        config
            .validate()
            .map_err(|e| OpError::invalid_data(e.to_string()))?;
        let reactor = Reactor::new(config.event_loop.max_events)?;
        Ok(Self {
            inner: Rc::new(Inner {
                config,
                table: RefCell::new(ResourceTable::new()),
                reactor: RefCell::new(reactor),
                timers: RefCell::new(TimerWheel::new()),
                executor: Executor::new(),
                next_timer: Cell::new(1),
            }),
        })
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    // =========================================================================
    // Scheduling
    // =========================================================================

    /// Spawn a task on the runtime. It only makes progress while some
    /// `block_on` call is driving the runtime.
    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + 'static,
        F::Output: 'static,
    {
        executor::spawn_joinable(&self.inner.executor, future)
    }

    /// Drive the runtime until `future` completes.
    ///
    /// # Panics
    ///
    /// Panics when nothing can ever wake the future again: no task is ready,
    /// no timer is armed and no task is parked on I/O.
    pub fn block_on<F: Future>(&self, future: F) -> F::Output {
        let mut future = std::pin::pin!(future);
        let main = Arc::new(MainWaker(AtomicBool::new(true)));
        let waker = Waker::from(main.clone());
        let mut cx = Context::from_waker(&waker);

        loop {
            if main.0.swap(false, Ordering::SeqCst) {
                if let Poll::Ready(output) = future.as_mut().poll(&mut cx) {
                    return output;
                }
            }

            self.inner.executor.run_ready();

            let timeout = if main.0.load(Ordering::SeqCst) || self.inner.executor.has_ready() {
                Some(Duration::ZERO)
            } else if let Some(next) = self.inner.timers.borrow().timeout_until_next() {
                Some(next)
            } else if self.inner.reactor.borrow().has_waiters() {
                None
            } else {
                panic!("block_on stalled: no task, timer or I/O waiter can make progress");
            };

            self.turn(timeout);
        }
    }

    /// Wait for I/O or timers once and wake whatever became ready
    fn turn(&self, timeout: Option<Duration>) {
        let io_wakers = match self.inner.reactor.borrow_mut().turn(timeout) {
            Ok(wakers) => wakers,
            Err(e) => {
                log::warn!("runtime: event loop poll failed: {}", e);
                Vec::new()
            }
        };
        io_wakers.into_iter().for_each(Waker::wake);

        let timer_wakers = self.inner.timers.borrow_mut().advance(Instant::now());
        timer_wakers.into_iter().for_each(Waker::wake);
    }

    /// Drop every spawned task and close every open handle.
    ///
    /// Spawned tasks own `Runtime` clones, so a runtime with pending tasks
    /// (a signal loop, a detached accept) stays alive after the caller drops
    /// its own handles. Call this outside `block_on` when done with it.
    pub fn shutdown(&self) {
        let tasks = self.inner.executor.drain();
        let dropped = tasks.len();
        drop(tasks);

        let open = self.resources();
        for (handle, _) in &open {
            if let Err(e) = self.close(*handle) {
                log::debug!("runtime: handle {} gone before shutdown closed it: {}", handle, e);
            }
        }

        // Only a task spawned by a destructor above, or a sleep held outside
        // the runtime, can leave anything behind
        if !self.inner.executor.is_empty()
            || !self.inner.reactor.borrow().is_empty()
            || !self.inner.timers.borrow().is_empty()
        {
            log::warn!("runtime: tasks, registrations or timers outlived shutdown");
        }
        log::debug!(
            "runtime: shut down, dropped {} task(s) and closed {} handle(s)",
            dropped,
            open.len()
        );
    }

    /// Give other ready tasks a chance to run
    pub fn yield_now(&self) -> YieldNow {
        YieldNow { yielded: false }
    }

    /// Future that completes once `duration` has elapsed
    pub fn sleep(&self, duration: Duration) -> Sleep {
        let token = Token(self.inner.next_timer.get());
        self.inner.next_timer.set(token.0 + 1);
        Sleep {
            rt: self.clone(),
            token,
            deadline: Instant::now() + duration,
        }
    }

    /// Future that completes after the handle's descriptor reports readiness
    pub(crate) fn readiness(&self, handle: Handle, interest: Interest) -> Readiness {
        Readiness {
            rt: self.clone(),
            token: handle.token(),
            interest,
            parked: false,
        }
    }

    // =========================================================================
    // Resources
    // =========================================================================

    /// Insert a resource and register its descriptor with the reactor
    pub fn register(&self, payload: Payload) -> OpResult<Handle> {
        let fd = payload.poll_fd();
        let kind = payload.kind();
        let handle = self.inner.table.borrow_mut().add(payload);

        if let Some(fd) = fd {
            if let Err(e) = self.inner.reactor.borrow_mut().register(handle.token(), fd) {
                let removed = self.inner.table.borrow_mut().close(handle);
                drop(removed);
                return Err(e.into());
            }
        }

        log::debug!("runtime: registered {} resource as handle {}", kind, handle);
        Ok(handle)
    }

    /// Close a handle.
    ///
    /// Pending ops referencing it are marked interrupted before this returns,
    /// so none of them can complete as if the resource were still open.
    pub fn close(&self, handle: Handle) -> OpResult<()> {
        let (mut payload, mut wakers) = self.inner.table.borrow_mut().close(handle)?;
        wakers.extend(self.inner.reactor.borrow_mut().deregister(handle.token()));

        let kind = payload.kind();
        payload.teardown();
        drop(payload);

        log::debug!("runtime: closed {} handle {}", kind, handle);
        wakers.into_iter().for_each(Waker::wake);
        Ok(())
    }

    /// Remove a handle without tearing its resource down, for ownership
    /// transfer into a new resource
    pub fn take(&self, handle: Handle) -> OpResult<Payload> {
        let (payload, mut wakers) = self.inner.table.borrow_mut().close(handle)?;
        wakers.extend(self.inner.reactor.borrow_mut().deregister(handle.token()));
        log::debug!("runtime: handle {} consumed", handle);
        wakers.into_iter().for_each(Waker::wake);
        Ok(payload)
    }

    /// Run `f` against the payload of an open handle
    pub fn with_payload<T>(
        &self,
        handle: Handle,
        f: impl FnOnce(&mut Payload) -> OpResult<T>,
    ) -> OpResult<T> {
        let mut table = self.inner.table.borrow_mut();
        let payload = table.get_mut(handle)?;
        f(payload)
    }

    pub fn kind(&self, handle: Handle) -> OpResult<ResourceKind> {
        self.inner.table.borrow().kind(handle)
    }

    pub fn state(&self, handle: Handle) -> Option<ResourceState> {
        self.inner.table.borrow().state(handle)
    }

    /// Open handles and their kinds, in handle order
    pub fn resources(&self) -> Vec<(Handle, ResourceKind)> {
        self.inner.table.borrow().resources()
    }

    pub fn stats(&self) -> RuntimeStats {
        RuntimeStats {
            resources: self.inner.table.borrow().len(),
            pending_ops: self.inner.table.borrow().pending_ops(),
            registrations: self.inner.reactor.borrow().len(),
            timers: self.inner.timers.borrow().len(),
            tasks: self.inner.executor.len(),
        }
    }

    pub(crate) fn table(&self) -> &RefCell<ResourceTable> {
        &self.inner.table
    }

    /// Error for a handle that exists but is the wrong kind for an op
    pub(crate) fn wrong_kind(handle: Handle, kind: ResourceKind, op: &str) -> OpError {
        OpError::bad_resource(format!("{} cannot be used on {} handle {}", op, kind, handle))
    }
}

struct MainWaker(AtomicBool);

impl Wake for MainWaker {
    fn wake(self: Arc<Self>) {
        self.0.store(true, Ordering::SeqCst);
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.0.store(true, Ordering::SeqCst);
    }
}

// =============================================================================
// Leaf futures
// =============================================================================

/// Future returned by [`Runtime::yield_now`]
pub struct YieldNow {
    yielded: bool,
}

impl Future for YieldNow {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.yielded {
            return Poll::Ready(());
        }
        self.yielded = true;
        cx.waker().wake_by_ref();
        Poll::Pending
    }
}

/// Future returned by [`Runtime::sleep`]
pub struct Sleep {
    rt: Runtime,
    token: Token,
    deadline: Instant,
}

impl Future for Sleep {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if Instant::now() >= self.deadline {
            return Poll::Ready(());
        }
        self.rt
            .inner
            .timers
            .borrow_mut()
            .insert(self.token, self.deadline, cx.waker());
        Poll::Pending
    }
}

impl Drop for Sleep {
    fn drop(&mut self) {
        if let Ok(mut timers) = self.rt.inner.timers.try_borrow_mut() {
            timers.remove(self.token);
        }
    }
}

/// Waits for one readiness edge on a registered descriptor.
///
/// Completes on the poll after the task was woken, whether the wake came from
/// the reactor or from a close; the caller retries its syscall either way.
pub(crate) struct Readiness {
    rt: Runtime,
    token: Token,
    interest: Interest,
    parked: bool,
}

impl Future for Readiness {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.parked {
            return Poll::Ready(());
        }
        let parked = self
            .rt
            .inner
            .reactor
            .borrow_mut()
            .park(self.token, self.interest, cx.waker());
        if parked {
            self.parked = true;
            Poll::Pending
        } else {
            // Deregistered: let the caller observe the closed handle
            Poll::Ready(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_on_ready_value() {
        let rt = Runtime::new().unwrap();
        assert_eq!(rt.block_on(async { 7 }), 7);
    }

    #[test]
    fn test_spawn_and_join() {
        let rt = Runtime::new().unwrap();
        let handle = rt.spawn(async { "done" });
        assert_eq!(rt.block_on(handle), "done");
        assert_eq!(rt.stats().tasks, 0);
    }

    #[test]
    fn test_sleep_elapses() {
        let rt = Runtime::new().unwrap();
        let start = Instant::now();
        rt.block_on(rt.sleep(Duration::from_millis(20)));
        assert!(start.elapsed() >= Duration::from_millis(20));
        assert_eq!(rt.stats().timers, 0);
    }

    #[test]
    fn test_yield_now_interleaves() {
        let rt = Runtime::new().unwrap();
        let log = Rc::new(RefCell::new(Vec::new()));

        let a_log = log.clone();
        let a_rt = rt.clone();
        let a = rt.spawn(async move {
            a_log.borrow_mut().push("a1");
            a_rt.yield_now().await;
            a_log.borrow_mut().push("a2");
        });
        let b_log = log.clone();
        let b = rt.spawn(async move {
            b_log.borrow_mut().push("b1");
        });

        rt.block_on(async move {
            a.await;
            b.await;
        });
        assert_eq!(*log.borrow(), vec!["a1", "b1", "a2"]);
    }

    #[test]
    fn test_close_unknown_handle() {
        let rt = Runtime::new().unwrap();
        let err = rt.close(Handle::from_raw(12)).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::BadResource);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = RuntimeConfig::default();
        config.watch.queue_capacity = 0;
        let err = Runtime::with_config(config).err().unwrap();
        assert_eq!(err.kind(), crate::error::ErrorKind::InvalidData);
    }

    #[test]
    fn test_shutdown_frees_runtime_with_pending_tasks() {
        use crate::dispatch::{Op, OpValue};

        let rt = Runtime::new().unwrap();
        let cancel = rt
            .dispatch_sync(Op::CancelHandle)
            .and_then(OpValue::into_handle)
            .unwrap();
        let _sleeper = rt.spawn(rt.dispatch_async(
            Op::Sleep {
                duration: Duration::from_secs(3600),
            },
            Some(cancel),
        ));
        rt.block_on(rt.yield_now());
        assert_eq!(rt.stats().tasks, 1);
        assert_eq!(rt.stats().pending_ops, 1);

        let weak = Rc::downgrade(&rt.inner);
        rt.shutdown();
        assert_eq!(
            rt.stats(),
            RuntimeStats {
                resources: 0,
                pending_ops: 0,
                registrations: 0,
                timers: 0,
                tasks: 0,
            }
        );
        drop(rt);
        assert!(weak.upgrade().is_none());
    }

    #[test]
    #[should_panic(expected = "block_on stalled")]
    fn test_block_on_detects_stall() {
        let rt = Runtime::new().unwrap();
        rt.block_on(std::future::pending::<()>());
    }
}
