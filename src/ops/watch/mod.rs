//! Filesystem watches
//!
//! Notifications are read in batches and queued on the resource; each poll
//! hands out exactly one event. Only one poll may be in flight per watch: a
//! second, overlapping poll fails with `Busy`.
//!
//! Watching is implemented with inotify and therefore Linux only.

#[cfg(target_os = "linux")]
mod inotify;

#[cfg(target_os = "linux")]
pub use inotify::WatchResource;
#[cfg(target_os = "linux")]
pub(crate) use inotify::{open, poll};

use std::fmt;
use std::path::PathBuf;

/// What happened to the affected paths
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FsEventKind {
    Create,
    Modify,
    Remove,
    Rename,
    Access,
    /// Unclassified, e.g. the kernel queue overflowed
    Any,
}

impl fmt::Display for FsEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FsEventKind::Create => "create",
            FsEventKind::Modify => "modify",
            FsEventKind::Remove => "remove",
            FsEventKind::Rename => "rename",
            FsEventKind::Access => "access",
            FsEventKind::Any => "any",
        };
        f.write_str(name)
    }
}

/// A filesystem change notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FsEvent {
    pub kind: FsEventKind,
    pub paths: Vec<PathBuf>,
}

