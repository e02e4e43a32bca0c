//! inotify-backed watch resource

use super::{FsEvent, FsEventKind};
use crate::error::{ErrorKind, OpError, OpResult};
use crate::ops::Step;
use crate::runtime::{Interest, Runtime};
use crate::table::{Handle, Payload};
use nix::errno::Errno;
use nix::sys::inotify::{AddWatchFlags, InitFlags, Inotify, InotifyEvent, WatchDescriptor};
use std::cell::Cell;
use std::collections::{HashMap, VecDeque};
use std::os::fd::{AsFd, AsRawFd, RawFd};
use std::path::{Path, PathBuf};
use std::rc::Rc;

fn watch_mask() -> AddWatchFlags {
    AddWatchFlags::IN_CREATE
        | AddWatchFlags::IN_MODIFY
        | AddWatchFlags::IN_ATTRIB
        | AddWatchFlags::IN_ACCESS
        | AddWatchFlags::IN_DELETE
        | AddWatchFlags::IN_DELETE_SELF
        | AddWatchFlags::IN_MOVED_FROM
        | AddWatchFlags::IN_MOVED_TO
        | AddWatchFlags::IN_MOVE_SELF
}

fn event_kind(mask: AddWatchFlags) -> FsEventKind {
    if mask.contains(AddWatchFlags::IN_Q_OVERFLOW) {
        FsEventKind::Any
    } else if mask.contains(AddWatchFlags::IN_CREATE) {
        FsEventKind::Create
    } else if mask.intersects(AddWatchFlags::IN_DELETE | AddWatchFlags::IN_DELETE_SELF) {
        FsEventKind::Remove
    } else if mask.intersects(
        AddWatchFlags::IN_MOVED_FROM | AddWatchFlags::IN_MOVED_TO | AddWatchFlags::IN_MOVE_SELF,
    ) {
        FsEventKind::Rename
    } else if mask.intersects(AddWatchFlags::IN_MODIFY | AddWatchFlags::IN_ATTRIB) {
        FsEventKind::Modify
    } else if mask.contains(AddWatchFlags::IN_ACCESS) {
        FsEventKind::Access
    } else {
        FsEventKind::Any
    }
}

/// An open inotify instance and the events it has queued
pub struct WatchResource {
    inotify: Inotify,
    watched: HashMap<WatchDescriptor, PathBuf>,
    recursive: bool,
    queue: VecDeque<FsEvent>,
    capacity: usize,
    dropped: u64,
    polling: Rc<Cell<bool>>,
}

impl WatchResource {
    pub fn open(paths: &[PathBuf], recursive: bool, capacity: usize) -> OpResult<Self> {
        if paths.is_empty() {
            return Err(OpError::invalid_data("no paths to watch"));
        }
        let inotify = Inotify::init(InitFlags::IN_NONBLOCK | InitFlags::IN_CLOEXEC)?;
        let mut watch = Self {
            inotify,
            watched: HashMap::new(),
            recursive,
            queue: VecDeque::new(),
            capacity,
            dropped: 0,
            polling: Rc::new(Cell::new(false)),
        };
        for path in paths {
            watch.add_path(path)?;
        }
        Ok(watch)
    }

    pub fn fd(&self) -> RawFd {
        self.inotify.as_fd().as_raw_fd()
    }

    /// Number of inotify watches held, one per watched directory or file
    pub fn watch_count(&self) -> usize {
        self.watched.len()
    }

    fn add_path(&mut self, path: &Path) -> OpResult<()> {
        let wd = self.inotify.add_watch(path, watch_mask()).map_err(|errno| {
            OpError::new(
                crate::error::classify_errno(errno as i32),
                format!("{}, watch '{}'", errno.desc(), path.display()),
            )
        })?;
        self.watched.insert(wd, path.to_path_buf());

        if self.recursive && path.is_dir() {
            for entry in std::fs::read_dir(path)? {
                let entry = entry?;
                if entry.file_type()?.is_dir() {
                    self.add_path(&entry.path())?;
                }
            }
        }
        Ok(())
    }

    fn begin_poll(&self) -> OpResult<PollGuard> {
        if self.polling.replace(true) {
            return Err(OpError::new(
                ErrorKind::Busy,
                "another poll is already in flight on this watch",
            ));
        }
        Ok(PollGuard(self.polling.clone()))
    }

    fn enqueue(&mut self, event: InotifyEvent) {
        if event.mask.contains(AddWatchFlags::IN_IGNORED) {
            self.watched.remove(&event.wd);
            return;
        }
        let base = self.watched.get(&event.wd).cloned();
        let path = match (base, event.name) {
            (Some(base), Some(name)) => base.join(name),
            (Some(base), None) => base,
            (None, Some(name)) => PathBuf::from(name),
            (None, None) => PathBuf::new(),
        };

        let created_dir = event
            .mask
            .contains(AddWatchFlags::IN_CREATE | AddWatchFlags::IN_ISDIR);
        if self.recursive && created_dir {
            if let Err(e) = self.add_path(&path) {
                log::warn!("watch: cannot follow new directory {}: {}", path.display(), e);
            }
        }

        if self.queue.len() >= self.capacity {
            self.dropped += 1;
            log::warn!("watch: event queue full, dropped {} event(s)", self.dropped);
            return;
        }
        self.queue.push_back(FsEvent {
            kind: event_kind(event.mask),
            paths: vec![path],
        });
    }

    pub(crate) fn next_event(&mut self) -> OpResult<Step<FsEvent>> {
        loop {
            if let Some(event) = self.queue.pop_front() {
                return Ok(Step::Done(event));
            }
            match self.inotify.read_events() {
                Ok(events) => events.into_iter().for_each(|e| self.enqueue(e)),
                Err(Errno::EAGAIN) => return Ok(Step::Wait(Interest::READABLE)),
                Err(Errno::EINTR) => continue,
                Err(errno) => return Err(errno.into()),
            }
        }
    }
}

/// Marks a watch as polled until dropped
struct PollGuard(Rc<Cell<bool>>);

impl Drop for PollGuard {
    fn drop(&mut self) {
        self.0.set(false);
    }
}

// =============================================================================
// Operations
// =============================================================================

pub(crate) fn open(rt: &Runtime, paths: &[PathBuf], recursive: bool) -> OpResult<Handle> {
    let watch = WatchResource::open(paths, recursive, rt.config().watch.queue_capacity)?;
    log::debug!(
        "watch: {} path(s), {} inotify watch(es)",
        paths.len(),
        watch.watch_count()
    );
    rt.register(Payload::FsWatch(watch))
}

pub(crate) async fn poll(rt: &Runtime, rid: Handle) -> OpResult<FsEvent> {
    let _polling = rt.with_payload(rid, |payload| match payload {
        Payload::FsWatch(w) => w.begin_poll(),
        other => Err(Runtime::wrong_kind(rid, other.kind(), "op_fs_watch_poll")),
    })?;
    loop {
        let step = rt.with_payload(rid, |payload| match payload {
            Payload::FsWatch(w) => w.next_event(),
            other => Err(Runtime::wrong_kind(rid, other.kind(), "op_fs_watch_poll")),
        })?;
        match step {
            Step::Done(event) => return Ok(event),
            Step::Wait(interest) => rt.readiness(rid, interest).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("resio_watch_{}_{}", name, std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn test_event_kind_mapping() {
        assert_eq!(event_kind(AddWatchFlags::IN_CREATE), FsEventKind::Create);
        assert_eq!(
            event_kind(AddWatchFlags::IN_CREATE | AddWatchFlags::IN_ISDIR),
            FsEventKind::Create
        );
        assert_eq!(event_kind(AddWatchFlags::IN_DELETE), FsEventKind::Remove);
        assert_eq!(event_kind(AddWatchFlags::IN_MOVED_TO), FsEventKind::Rename);
        assert_eq!(event_kind(AddWatchFlags::IN_ATTRIB), FsEventKind::Modify);
        assert_eq!(event_kind(AddWatchFlags::IN_ACCESS), FsEventKind::Access);
        assert_eq!(event_kind(AddWatchFlags::IN_Q_OVERFLOW), FsEventKind::Any);
    }

    #[test]
    fn test_queued_create_event() {
        let dir = temp_dir("queued");
        let mut watch = WatchResource::open(&[dir.clone()], false, 16).unwrap();
        assert!(matches!(watch.next_event(), Ok(Step::Wait(_))));

        std::fs::write(dir.join("a.txt"), b"").unwrap();
        match watch.next_event() {
            Ok(Step::Done(event)) => {
                assert_eq!(event.kind, FsEventKind::Create);
                assert_eq!(event.paths, vec![dir.join("a.txt")]);
            }
            _ => panic!("expected a queued create event"),
        }
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_recursive_watches_subdirectories() {
        let dir = temp_dir("recursive");
        std::fs::create_dir_all(dir.join("x").join("y")).unwrap();
        let watch = WatchResource::open(&[dir.clone()], true, 16).unwrap();
        assert_eq!(watch.watch_count(), 3);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_overlapping_poll_is_busy() {
        let dir = temp_dir("busy");
        let watch = WatchResource::open(&[dir.clone()], false, 16).unwrap();
        let guard = watch.begin_poll().unwrap();
        let err = watch.begin_poll().err().unwrap();
        assert_eq!(err.kind(), ErrorKind::Busy);
        drop(guard);
        assert!(watch.begin_poll().is_ok());
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_missing_path() {
        let err = WatchResource::open(&[PathBuf::from("/nonexistent/resio")], false, 16)
            .err()
            .unwrap();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }
}
