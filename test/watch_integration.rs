//! Integration tests for filesystem watches (inotify, Linux only)

#![cfg(target_os = "linux")]

use resio::ops::fs::OpenOptions;
use resio::ops::watch::FsEventKind;
use resio::{ErrorKind, FsWatcher, Op, OpValue, ResourceState, Runtime};
use std::path::PathBuf;
use std::rc::Rc;
use std::time::Duration;

fn temp_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("resio_watch_it_{}_{}", name, std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

#[test]
fn test_create_new_reports_one_create() {
    let dir = temp_dir("create");
    let rt = Runtime::new().unwrap();
    let watcher = FsWatcher::open(&rt, &[dir.clone()], false).unwrap();

    let target = dir.join("fresh.txt");
    let rid = rt
        .dispatch_sync(Op::OpenSync {
            path: target.clone(),
            options: OpenOptions::new().write(true).create_new(true),
        })
        .and_then(OpValue::into_handle)
        .unwrap();
    rt.close(rid).unwrap();

    let event = rt.block_on(watcher.next()).unwrap().unwrap();
    assert_eq!(event.kind, FsEventKind::Create);
    assert_eq!(event.paths, vec![target]);

    watcher.close().unwrap();
    assert_eq!(rt.block_on(watcher.next()).unwrap(), None);
    std::fs::remove_dir_all(&dir).unwrap();
}

#[test]
fn test_close_mid_next_ends_iteration() {
    let dir = temp_dir("close");
    let rt = Runtime::new().unwrap();
    let watcher = Rc::new(FsWatcher::open(&rt, &[dir.clone()], false).unwrap());
    let rid = watcher.rid();

    let closer = watcher.clone();
    let timer_rt = rt.clone();
    let _close = rt.spawn(async move {
        timer_rt.sleep(Duration::from_millis(20)).await;
        closer.close().unwrap();
    });

    assert_eq!(rt.block_on(watcher.next()).unwrap(), None);
    assert_eq!(rt.state(rid), Some(ResourceState::Closed));
    assert_eq!(rt.stats().pending_ops, 0);
    std::fs::remove_dir_all(&dir).unwrap();
}

#[test]
fn test_overlapping_next_is_silent() {
    let dir = temp_dir("busy");
    let rt = Runtime::new().unwrap();
    let watcher = Rc::new(FsWatcher::open(&rt, &[dir.clone()], false).unwrap());

    let first = watcher.clone();
    let in_flight = rt.spawn(async move { first.next().await });
    let target = dir.join("late.txt");

    let overlapping = rt.block_on(async {
        rt.yield_now().await;
        let overlapping = watcher.next().await;
        std::fs::write(&target, b"x").unwrap();
        overlapping
    });
    assert_eq!(overlapping.unwrap(), None);

    // The first poll still delivers
    let event = rt.block_on(in_flight).unwrap().unwrap();
    assert_eq!(event.kind, FsEventKind::Create);
    assert_eq!(event.paths, vec![target]);

    // Iteration is over, so the handle goes with the last delivery
    assert_eq!(rt.state(watcher.rid()), Some(ResourceState::Closed));
    assert_eq!(rt.block_on(watcher.next()).unwrap(), None);
    assert_eq!(rt.stats().resources, 0);
    std::fs::remove_dir_all(&dir).unwrap();
}

#[test]
fn test_raw_overlapping_poll_is_busy() {
    let dir = temp_dir("raw_busy");
    let rt = Runtime::new().unwrap();
    let rid = rt
        .dispatch_sync(Op::FsWatchOpen {
            paths: vec![dir.clone()],
            recursive: false,
        })
        .and_then(OpValue::into_handle)
        .unwrap();

    let err = rt
        .block_on(async {
            let _first = rt.spawn(rt.dispatch_async(Op::FsWatchPoll { rid }, None));
            rt.yield_now().await;
            rt.dispatch_async(Op::FsWatchPoll { rid }, None).await
        })
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Busy);

    rt.close(rid).unwrap();
    std::fs::remove_dir_all(&dir).unwrap();
}

#[test]
fn test_recursive_watch_follows_new_directories() {
    let dir = temp_dir("recursive");
    let rt = Runtime::new().unwrap();
    let watcher = FsWatcher::open(&rt, &[dir.clone()], true).unwrap();

    let sub = dir.join("sub");
    std::fs::create_dir(&sub).unwrap();
    let event = rt.block_on(watcher.next()).unwrap().unwrap();
    assert_eq!(event.kind, FsEventKind::Create);
    assert_eq!(event.paths, vec![sub.clone()]);

    let nested = sub.join("nested.txt");
    std::fs::write(&nested, b"hi").unwrap();
    let event = rt.block_on(watcher.next()).unwrap().unwrap();
    assert_eq!(event.kind, FsEventKind::Create);
    assert_eq!(event.paths, vec![nested]);

    drop(watcher);
    assert_eq!(rt.stats().resources, 0);
    std::fs::remove_dir_all(&dir).unwrap();
}

#[test]
fn test_watch_missing_path() {
    let rt = Runtime::new().unwrap();
    let err = FsWatcher::open(&rt, &[PathBuf::from("/definitely/not/here")], false)
        .err()
        .unwrap();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}
