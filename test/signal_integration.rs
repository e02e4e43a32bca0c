//! Integration tests for signal bindings and listener sets
//!
//! Signals are process-wide and tests run in parallel threads, so every test
//! uses its own signal.

use nix::sys::signal::Signal;
use resio::ops::signal::native_registration_count;
use resio::{ErrorKind, Op, OpValue, ResourceState, Runtime, SignalListeners};
use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

fn raise(rt: &Runtime, signal: &str) {
    rt.dispatch_sync(Op::Kill {
        pid: std::process::id() as i32,
        signal: signal.to_string(),
    })
    .unwrap();
}

/// Drive the runtime until `done` holds, giving up after about two seconds
fn wait_until(rt: &Runtime, done: impl Fn() -> bool) {
    rt.block_on(async {
        for _ in 0..400 {
            if done() {
                return;
            }
            rt.sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached in time");
    });
}

#[test]
fn test_listener_fires_once_per_delivery() {
    let rt = Runtime::new().unwrap();
    let listeners = SignalListeners::new(&rt);
    let seen = Rc::new(RefCell::new(Vec::new()));

    let log = seen.clone();
    let id = listeners
        .add("SIGUSR1", move |name| log.borrow_mut().push(name.to_string()))
        .unwrap();
    assert_eq!(native_registration_count(Signal::SIGUSR1), 1);
    rt.block_on(rt.yield_now());

    raise(&rt, "SIGUSR1");
    wait_until(&rt, || seen.borrow().len() == 1);
    raise(&rt, "SIGUSR1");
    wait_until(&rt, || seen.borrow().len() == 2);
    assert_eq!(*seen.borrow(), vec!["SIGUSR1", "SIGUSR1"]);

    assert!(listeners.remove(id));
    assert!(!listeners.remove(id));
    assert_eq!(native_registration_count(Signal::SIGUSR1), 0);
}

#[test]
fn test_listeners_run_in_registration_order() {
    let rt = Runtime::new().unwrap();
    let listeners = SignalListeners::new(&rt);
    let order = Rc::new(RefCell::new(Vec::new()));

    let first_log = order.clone();
    let first = listeners
        .add("SIGUSR2", move |_| first_log.borrow_mut().push("first"))
        .unwrap();
    let second_log = order.clone();
    let second = listeners
        .add("SIGUSR2", move |_| second_log.borrow_mut().push("second"))
        .unwrap();
    assert_eq!(listeners.listener_count("SIGUSR2"), 2);
    // One binding serves every listener of a signal
    assert_eq!(native_registration_count(Signal::SIGUSR2), 1);
    rt.block_on(rt.yield_now());

    raise(&rt, "SIGUSR2");
    wait_until(&rt, || order.borrow().len() == 2);
    assert_eq!(*order.borrow(), vec!["first", "second"]);

    let binding = listeners.binding("SIGUSR2").unwrap();
    listeners.remove(first);
    assert_eq!(listeners.binding("SIGUSR2"), Some(binding));
    listeners.remove(second);
    assert_eq!(listeners.binding("SIGUSR2"), None);
    assert_eq!(rt.state(binding), Some(ResourceState::Closed));
    assert_eq!(native_registration_count(Signal::SIGUSR2), 0);

    // The loop task sees the closed binding and exits
    rt.block_on(async {
        rt.yield_now().await;
        rt.yield_now().await;
    });
    assert_eq!(rt.stats().pending_ops, 0);
    assert_eq!(rt.stats().tasks, 0);
}

#[test]
fn test_resubscribe_gets_fresh_binding() {
    let rt = Runtime::new().unwrap();
    let listeners = SignalListeners::new(&rt);
    let count = Rc::new(RefCell::new(0));

    let c = count.clone();
    let id = listeners
        .add("SIGWINCH", move |_| *c.borrow_mut() += 1)
        .unwrap();
    let old_binding = listeners.binding("SIGWINCH").unwrap();
    listeners.remove(id);
    rt.block_on(rt.yield_now());

    let c = count.clone();
    let id = listeners
        .add("SIGWINCH", move |_| *c.borrow_mut() += 1)
        .unwrap();
    let new_binding = listeners.binding("SIGWINCH").unwrap();
    assert!(new_binding > old_binding);
    rt.block_on(rt.yield_now());

    raise(&rt, "SIGWINCH");
    wait_until(&rt, || *count.borrow() == 1);
    listeners.remove(id);
    assert_eq!(native_registration_count(Signal::SIGWINCH), 0);
}

#[test]
fn test_unbind_ends_pending_poll() {
    let rt = Runtime::new().unwrap();
    let rid = rt
        .dispatch_sync(Op::SignalBind {
            signal: "SIGURG".to_string(),
        })
        .and_then(OpValue::into_handle)
        .unwrap();

    let closer = rt.clone();
    let done = rt.block_on(async move {
        let poll = closer.spawn(closer.dispatch_async(Op::SignalPoll { rid }, None));
        closer.yield_now().await;
        closer.dispatch_sync(Op::SignalUnbind { rid }).unwrap();
        poll.await
    });
    assert!(done.and_then(OpValue::into_done).unwrap());
    assert_eq!(native_registration_count(Signal::SIGURG), 0);
}

#[test]
fn test_forbidden_and_unknown_signals() {
    let rt = Runtime::new().unwrap();
    let listeners = SignalListeners::new(&rt);

    let err = listeners.add("SIGKILL", |_| {}).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotSupported);
    let err = listeners.add("SIGNOTREAL", |_| {}).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidData);
    assert_eq!(listeners.listener_count("SIGKILL"), 0);
    assert_eq!(rt.stats().resources, 0);
}

#[test]
fn test_dropping_listener_set_unbinds() {
    let rt = Runtime::new().unwrap();
    let listeners = SignalListeners::new(&rt);
    listeners.add("SIGPROF", |_| {}).unwrap();
    listeners.add("SIGPROF", |_| {}).unwrap();
    let rid = listeners.binding("SIGPROF").unwrap();
    rt.block_on(rt.yield_now());
    assert_eq!(native_registration_count(Signal::SIGPROF), 1);

    drop(listeners);
    assert_eq!(native_registration_count(Signal::SIGPROF), 0);
    assert_eq!(rt.state(rid), Some(ResourceState::Closed));

    // The loop sees its binding end and finishes
    wait_until(&rt, || rt.stats().tasks == 0);
    assert_eq!(rt.stats().resources, 0);
    assert_eq!(rt.stats().pending_ops, 0);
}

#[test]
fn test_shutdown_releases_bindings_held_by_loops() {
    let rt = Runtime::new().unwrap();
    let listeners = SignalListeners::new(&rt);
    listeners.add("SIGVTALRM", |_| {}).unwrap();
    rt.block_on(rt.yield_now());
    assert_eq!(rt.stats().tasks, 1);

    // Forgotten listener set: only the runtime can still release the binding
    std::mem::forget(listeners);
    rt.shutdown();
    assert_eq!(native_registration_count(Signal::SIGVTALRM), 0);
    assert_eq!(rt.stats().tasks, 0);
    assert_eq!(rt.stats().resources, 0);
}
