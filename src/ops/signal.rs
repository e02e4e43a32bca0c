//! OS signal bindings
//!
//! Each binding owns a non-blocking pipe. The process-wide handler writes one
//! byte into the pipe of every binding for the delivered signal, and a poll on
//! the binding completes when a byte can be read back. The native handler is
//! installed with the first binding of a signal and the previous disposition
//! is restored when the last one goes away.

use super::Step;
use crate::error::{ErrorKind, OpError, OpResult};
use crate::runtime::{Interest, Runtime};
use crate::table::{Handle, Payload};
use lazy_static::lazy_static;
use nix::errno::Errno;
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::str::FromStr;
use std::sync::atomic::{AtomicI32, Ordering};

const MAX_BINDINGS: usize = 64;

/// Signals that cannot be caught or whose handlers must not return
const FORBIDDEN: [Signal; 5] = [
    Signal::SIGKILL,
    Signal::SIGSTOP,
    Signal::SIGSEGV,
    Signal::SIGILL,
    Signal::SIGFPE,
];

// Slots read by the handler. Writers hold REGISTRY and publish the fd before
// the signal number, so the handler never sees a signal without its fd.
#[allow(clippy::declare_interior_mutable_const)]
const FREE_SIGNO: AtomicI32 = AtomicI32::new(0);
#[allow(clippy::declare_interior_mutable_const)]
const NO_FD: AtomicI32 = AtomicI32::new(-1);
static SLOT_SIGNO: [AtomicI32; MAX_BINDINGS] = [FREE_SIGNO; MAX_BINDINGS];
static SLOT_FD: [AtomicI32; MAX_BINDINGS] = [NO_FD; MAX_BINDINGS];

struct Installed {
    bindings: usize,
    previous: SigAction,
}

#[derive(Default)]
struct SignalRegistry {
    installed: HashMap<i32, Installed>,
}

lazy_static! {
    static ref REGISTRY: Mutex<SignalRegistry> = Mutex::new(SignalRegistry::default());
}

extern "C" fn on_signal(signo: libc::c_int) {
    // The interrupted code may be about to read errno; a failed write here
    // (EAGAIN on a full pipe) must not leak into it
    let saved_errno = Errno::last_raw();
    let byte = 1u8;
    for slot in 0..MAX_BINDINGS {
        if SLOT_SIGNO[slot].load(Ordering::Acquire) != signo {
            continue;
        }
        let fd = SLOT_FD[slot].load(Ordering::Acquire);
        if fd >= 0 {
            // A full pipe already holds an undelivered notification
            unsafe { libc::write(fd, &byte as *const u8 as *const libc::c_void, 1) };
        }
    }
    Errno::set_raw(saved_errno);
}

/// Parse a signal name such as `SIGUSR1`
pub fn parse_signal(name: &str) -> OpResult<Signal> {
    Signal::from_str(name)
        .map_err(|_| OpError::invalid_data(format!("unknown signal '{}'", name)))
}

/// Parse a signal name and reject signals that may not be listened for
pub fn listenable_signal(name: &str) -> OpResult<Signal> {
    let signal = parse_signal(name)?;
    if FORBIDDEN.contains(&signal) {
        return Err(OpError::not_supported(format!(
            "binding to {} is not allowed",
            signal
        )));
    }
    Ok(signal)
}

/// Number of live bindings holding the native handler for `signal`
pub fn native_registration_count(signal: Signal) -> usize {
    REGISTRY
        .lock()
        .installed
        .get(&(signal as i32))
        .map(|i| i.bindings)
        .unwrap_or(0)
}

fn nonblocking_pipe() -> io::Result<(OwnedFd, OwnedFd)> {
    let mut fds = [0 as RawFd; 2];
    if unsafe { libc::pipe(fds.as_mut_ptr()) } < 0 {
        return Err(io::Error::last_os_error());
    }
    // Owned from here so both ends close on any error below
    let (read, write) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };
    for fd in [fds[0], fds[1]] {
        unsafe {
            let flags = libc::fcntl(fd, libc::F_GETFL);
            if flags < 0 || libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
                return Err(io::Error::last_os_error());
            }
            if libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) < 0 {
                return Err(io::Error::last_os_error());
            }
        }
    }
    Ok((read, write))
}

/// A live binding to one OS signal
pub struct SignalResource {
    signal: Signal,
    slot: usize,
    read_fd: OwnedFd,
    // Kept open for the handler; closed after the slot is cleared
    _write_fd: OwnedFd,
}

impl SignalResource {
    pub fn bind(signal: Signal) -> OpResult<Self> {
        let (read_fd, write_fd) = nonblocking_pipe()?;
        let signo = signal as i32;

        let mut registry = REGISTRY.lock();
        let slot = (0..MAX_BINDINGS)
            .find(|&s| SLOT_SIGNO[s].load(Ordering::Acquire) == 0)
            .ok_or_else(|| OpError::new(ErrorKind::Busy, "too many signal bindings"))?;

        if !registry.installed.contains_key(&signo) {
            let action = SigAction::new(
                SigHandler::Handler(on_signal),
                SaFlags::SA_RESTART,
                SigSet::empty(),
            );
            let previous = unsafe { signal::sigaction(signal, &action) }?;
            registry.installed.insert(
                signo,
                Installed {
                    bindings: 0,
                    previous,
                },
            );
            log::debug!("signal: installed handler for {}", signal);
        }
        if let Some(installed) = registry.installed.get_mut(&signo) {
            installed.bindings += 1;
        }

        SLOT_FD[slot].store(write_fd.as_raw_fd(), Ordering::Release);
        SLOT_SIGNO[slot].store(signo, Ordering::Release);

        Ok(Self {
            signal,
            slot,
            read_fd,
            _write_fd: write_fd,
        })
    }

    pub fn signal(&self) -> Signal {
        self.signal
    }

    pub fn fd(&self) -> RawFd {
        self.read_fd.as_raw_fd()
    }

    /// Consume one pending delivery
    pub(crate) fn try_recv(&mut self) -> io::Result<()> {
        let mut byte = 0u8;
        let n = unsafe {
            libc::read(
                self.read_fd.as_raw_fd(),
                &mut byte as *mut u8 as *mut libc::c_void,
                1,
            )
        };
        match n {
            1 => Ok(()),
            0 => Err(io::Error::from(io::ErrorKind::UnexpectedEof)),
            _ => Err(io::Error::last_os_error()),
        }
    }
}

impl Drop for SignalResource {
    fn drop(&mut self) {
        let signo = self.signal as i32;
        let mut registry = REGISTRY.lock();
        SLOT_SIGNO[self.slot].store(0, Ordering::Release);
        SLOT_FD[self.slot].store(-1, Ordering::Release);

        let last = match registry.installed.get_mut(&signo) {
            Some(installed) => {
                installed.bindings -= 1;
                installed.bindings == 0
            }
            None => false,
        };
        if last {
            if let Some(installed) = registry.installed.remove(&signo) {
                if let Err(e) = unsafe { signal::sigaction(self.signal, &installed.previous) } {
                    log::warn!("signal: failed to restore {} disposition: {}", self.signal, e);
                } else {
                    log::debug!("signal: restored disposition for {}", self.signal);
                }
            }
        }
    }
}

// =============================================================================
// Operations
// =============================================================================

pub(crate) fn bind(rt: &Runtime, name: &str) -> OpResult<Handle> {
    let signal = listenable_signal(name)?;
    rt.register(Payload::SignalBinding(SignalResource::bind(signal)?))
}

/// Wait for the next delivery. `true` means the binding has ended.
pub(crate) async fn poll(rt: &Runtime, rid: Handle) -> OpResult<bool> {
    loop {
        let step = rt.with_payload(rid, |payload| match payload {
            Payload::SignalBinding(s) => super::nonblocking(s.try_recv(), Interest::READABLE),
            other => Err(Runtime::wrong_kind(rid, other.kind(), "op_signal_poll")),
        })?;
        match step {
            Step::Done(()) => return Ok(false),
            Step::Wait(interest) => rt.readiness(rid, interest).await,
        }
    }
}

pub(crate) fn unbind(rt: &Runtime, rid: Handle) -> OpResult<()> {
    let kind = rt.kind(rid)?;
    if kind != crate::table::ResourceKind::SignalBinding {
        return Err(Runtime::wrong_kind(rid, kind, "op_signal_unbind"));
    }
    rt.close(rid)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_signal_names() {
        assert_eq!(parse_signal("SIGUSR2").unwrap(), Signal::SIGUSR2);
        let err = parse_signal("SIGNOPE").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidData);
    }

    #[test]
    fn test_forbidden_signals() {
        for name in ["SIGKILL", "SIGSTOP", "SIGSEGV", "SIGILL", "SIGFPE"] {
            let err = listenable_signal(name).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::NotSupported, "{}", name);
        }
    }

    #[test]
    fn test_handler_preserves_errno() {
        // SIGCONT is harmless to a running process and only bound here
        let mut binding = SignalResource::bind(Signal::SIGCONT).unwrap();
        // Fill the pipe so the handler's own write fails with EAGAIN
        let fd = SLOT_FD[binding.slot].load(Ordering::Acquire);
        let byte = 0u8;
        while unsafe { libc::write(fd, &byte as *const u8 as *const libc::c_void, 1) } == 1 {}
        assert_eq!(Errno::last(), Errno::EAGAIN);

        Errno::set_raw(libc::ENOENT);
        on_signal(Signal::SIGCONT as libc::c_int);
        assert_eq!(Errno::last(), Errno::ENOENT);

        assert!(binding.try_recv().is_ok());
        drop(binding);
        assert_eq!(native_registration_count(Signal::SIGCONT), 0);
    }

    #[test]
    fn test_bind_receive_unbind() {
        // SIGWINCH is ignored by default, so a stray delivery is harmless
        let mut binding = SignalResource::bind(Signal::SIGWINCH).unwrap();
        assert_eq!(native_registration_count(Signal::SIGWINCH), 1);
        assert_eq!(
            binding.try_recv().unwrap_err().kind(),
            io::ErrorKind::WouldBlock
        );

        signal::raise(Signal::SIGWINCH).unwrap();
        assert!(binding.try_recv().is_ok());

        drop(binding);
        assert_eq!(native_registration_count(Signal::SIGWINCH), 0);
    }
}
