//! Readiness notification over epoll (Linux) or kqueue (macOS, BSD)
//!
//! Registrations are edge-triggered: an event is reported once per change in
//! readiness, not for as long as the descriptor stays ready.

use std::io;
use std::ops::{BitOr, BitOrAssign};
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;

/// Identifies a registration in reported events. Resources use their handle
/// value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Token(pub u64);

/// Readiness directions, as a small bit set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Interest(u8);

impl Interest {
    pub const READABLE: Interest = Interest(1);
    pub const WRITABLE: Interest = Interest(1 << 1);
    /// Reported only: the descriptor has a pending error
    pub const ERROR: Interest = Interest(1 << 2);
    /// Reported only: the peer hung up
    pub const HUP: Interest = Interest(1 << 3);

    pub fn contains(self, other: Interest) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_readable(self) -> bool {
        self.contains(Interest::READABLE)
    }

    pub fn is_writable(self) -> bool {
        self.contains(Interest::WRITABLE)
    }

    pub fn is_error(self) -> bool {
        self.contains(Interest::ERROR)
    }

    pub fn is_hup(self) -> bool {
        self.contains(Interest::HUP)
    }
}

impl BitOr for Interest {
    type Output = Interest;

    fn bitor(self, rhs: Interest) -> Interest {
        Interest(self.0 | rhs.0)
    }
}

impl BitOrAssign for Interest {
    fn bitor_assign(&mut self, rhs: Interest) {
        self.0 |= rhs.0;
    }
}

/// One readiness report
#[derive(Debug, Clone, Copy)]
pub struct Event {
    pub token: Token,
    pub interest: Interest,
}

/// Map a `-1` syscall return to the thread's errno
fn cvt(ret: libc::c_int) -> io::Result<libc::c_int> {
    match ret {
        -1 => Err(io::Error::last_os_error()),
        n => Ok(n),
    }
}

/// An interrupted wait reports no events; the caller simply turns again
fn interrupted_is_empty(res: io::Result<libc::c_int>) -> io::Result<usize> {
    match res {
        Ok(n) => Ok(n as usize),
        Err(e) if e.kind() == io::ErrorKind::Interrupted => Ok(0),
        Err(e) => Err(e),
    }
}

/// The platform selector behind a uniform register/deregister/poll API
pub struct EventLoop {
    selector: OwnedFd,
    #[cfg(target_os = "linux")]
    buffer: Vec<libc::epoll_event>,
    #[cfg(not(target_os = "linux"))]
    buffer: Vec<libc::kevent>,
}

// =============================================================================
// epoll
// =============================================================================

#[cfg(target_os = "linux")]
impl EventLoop {
    /// Create a selector that reports at most `capacity` events per poll
    pub fn new(capacity: usize) -> io::Result<Self> {
        let fd = cvt(unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) })?;
        Ok(Self {
            selector: unsafe { OwnedFd::from_raw_fd(fd) },
            buffer: vec![libc::epoll_event { events: 0, u64: 0 }; capacity.max(1)],
        })
    }

    pub fn register(&mut self, fd: RawFd, token: Token, interest: Interest) -> io::Result<()> {
        let mut flags = libc::EPOLLET | libc::EPOLLERR | libc::EPOLLHUP;
        if interest.is_readable() {
            flags |= libc::EPOLLIN | libc::EPOLLRDHUP;
        }
        if interest.is_writable() {
            flags |= libc::EPOLLOUT;
        }
        let mut event = libc::epoll_event {
            events: flags as u32,
            u64: token.0,
        };
        cvt(unsafe {
            libc::epoll_ctl(self.selector.as_raw_fd(), libc::EPOLL_CTL_ADD, fd, &mut event)
        })?;
        Ok(())
    }

    pub fn deregister(&mut self, fd: RawFd) -> io::Result<()> {
        cvt(unsafe {
            libc::epoll_ctl(
                self.selector.as_raw_fd(),
                libc::EPOLL_CTL_DEL,
                fd,
                std::ptr::null_mut(),
            )
        })?;
        Ok(())
    }

    /// Wait up to `timeout` (forever if `None`) and append what became ready
    pub fn poll(&mut self, events: &mut Vec<Event>, timeout: Option<Duration>) -> io::Result<usize> {
        let ready = interrupted_is_empty(cvt(unsafe {
            libc::epoll_wait(
                self.selector.as_raw_fd(),
                self.buffer.as_mut_ptr(),
                self.buffer.len() as libc::c_int,
                timeout_millis(timeout),
            )
        }))?;

        events.extend(self.buffer[..ready].iter().map(|raw| {
            let flags = raw.events as libc::c_int;
            let mut interest = Interest::default();
            if flags & (libc::EPOLLIN | libc::EPOLLRDHUP) != 0 {
                interest |= Interest::READABLE;
            }
            if flags & libc::EPOLLOUT != 0 {
                interest |= Interest::WRITABLE;
            }
            if flags & libc::EPOLLERR != 0 {
                interest |= Interest::ERROR;
            }
            if flags & libc::EPOLLHUP != 0 {
                interest |= Interest::HUP;
            }
            Event {
                token: Token(raw.u64),
                interest,
            }
        }));
        Ok(ready)
    }
}

/// Whole milliseconds for epoll, rounded up so a due timer is never polled
/// with a zero timeout in a tight loop
#[cfg(target_os = "linux")]
fn timeout_millis(timeout: Option<Duration>) -> libc::c_int {
    timeout.map_or(-1, |d| {
        d.as_nanos()
            .div_ceil(1_000_000)
            .min(libc::c_int::MAX as u128) as libc::c_int
    })
}

// =============================================================================
// kqueue
// =============================================================================

#[cfg(not(target_os = "linux"))]
impl EventLoop {
    /// Create a selector that reports at most `capacity` events per poll
    pub fn new(capacity: usize) -> io::Result<Self> {
        let fd = cvt(unsafe { libc::kqueue() })?;
        Ok(Self {
            selector: unsafe { OwnedFd::from_raw_fd(fd) },
            buffer: vec![unsafe { std::mem::zeroed() }; capacity.max(1)],
        })
    }

    fn kevent(fd: RawFd, filter: i16, flags: u16, token: Token) -> libc::kevent {
        let mut change: libc::kevent = unsafe { std::mem::zeroed() };
        change.ident = fd as usize;
        change.filter = filter;
        change.flags = flags;
        change.udata = token.0 as *mut libc::c_void;
        change
    }

    fn apply(&self, changes: &[libc::kevent]) -> io::Result<()> {
        cvt(unsafe {
            libc::kevent(
                self.selector.as_raw_fd(),
                changes.as_ptr(),
                changes.len() as libc::c_int,
                std::ptr::null_mut(),
                0,
                std::ptr::null(),
            )
        })?;
        Ok(())
    }

    pub fn register(&mut self, fd: RawFd, token: Token, interest: Interest) -> io::Result<()> {
        let add = libc::EV_ADD | libc::EV_CLEAR;
        let mut changes = Vec::with_capacity(2);
        if interest.is_readable() {
            changes.push(Self::kevent(fd, libc::EVFILT_READ, add, token));
        }
        if interest.is_writable() {
            changes.push(Self::kevent(fd, libc::EVFILT_WRITE, add, token));
        }
        self.apply(&changes)
    }

    pub fn deregister(&mut self, fd: RawFd) -> io::Result<()> {
        // Each filter is removed on its own: one may never have been added
        for filter in [libc::EVFILT_READ, libc::EVFILT_WRITE] {
            let _ = self.apply(&[Self::kevent(fd, filter, libc::EV_DELETE, Token(0))]);
        }
        Ok(())
    }

    /// Wait up to `timeout` (forever if `None`) and append what became ready
    pub fn poll(&mut self, events: &mut Vec<Event>, timeout: Option<Duration>) -> io::Result<usize> {
        let spec = timeout.map(|d| libc::timespec {
            tv_sec: d.as_secs() as libc::time_t,
            tv_nsec: d.subsec_nanos() as libc::c_long,
        });
        let spec_ptr = spec
            .as_ref()
            .map_or(std::ptr::null(), |ts| ts as *const libc::timespec);

        let ready = interrupted_is_empty(cvt(unsafe {
            libc::kevent(
                self.selector.as_raw_fd(),
                std::ptr::null(),
                0,
                self.buffer.as_mut_ptr(),
                self.buffer.len() as libc::c_int,
                spec_ptr,
            )
        }))?;

        events.extend(self.buffer[..ready].iter().map(|raw| {
            let mut interest = match raw.filter {
                libc::EVFILT_READ => Interest::READABLE,
                libc::EVFILT_WRITE => Interest::WRITABLE,
                _ => Interest::default(),
            };
            if raw.flags & libc::EV_ERROR != 0 {
                interest |= Interest::ERROR;
            }
            if raw.flags & libc::EV_EOF != 0 {
                interest |= Interest::HUP;
            }
            Event {
                token: Token(raw.udata as u64),
                interest,
            }
        }));
        Ok(ready)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pipe() -> (OwnedFd, OwnedFd) {
        let mut fds = [0 as RawFd; 2];
        cvt(unsafe { libc::pipe(fds.as_mut_ptr()) }).unwrap();
        unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) }
    }

    #[test]
    fn test_interest_set() {
        let both = Interest::READABLE | Interest::WRITABLE;
        assert!(both.is_readable() && both.is_writable());
        assert!(!both.is_hup());
        assert!(both.contains(Interest::WRITABLE));
        assert!(!Interest::READABLE.contains(both));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_timeout_rounds_up() {
        assert_eq!(timeout_millis(None), -1);
        assert_eq!(timeout_millis(Some(Duration::ZERO)), 0);
        assert_eq!(timeout_millis(Some(Duration::from_micros(400))), 1);
        assert_eq!(timeout_millis(Some(Duration::from_millis(25))), 25);
    }

    #[test]
    fn test_edge_reported_once() {
        let mut selector = EventLoop::new(8).unwrap();
        let (rx, tx) = pipe();
        selector
            .register(rx.as_raw_fd(), Token(7), Interest::READABLE)
            .unwrap();

        let mut events = Vec::new();
        assert_eq!(selector.poll(&mut events, Some(Duration::ZERO)).unwrap(), 0);

        let byte = 9u8;
        let written = unsafe { libc::write(tx.as_raw_fd(), &byte as *const u8 as *const libc::c_void, 1) };
        assert_eq!(written, 1);
        selector
            .poll(&mut events, Some(Duration::from_millis(100)))
            .unwrap();
        assert!(events
            .iter()
            .any(|e| e.token == Token(7) && e.interest.is_readable()));

        // Nothing changed since, so no second report
        events.clear();
        assert_eq!(selector.poll(&mut events, Some(Duration::ZERO)).unwrap(), 0);

        selector.deregister(rx.as_raw_fd()).unwrap();
    }
}
