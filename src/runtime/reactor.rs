//! Reactor for managing I/O resource readiness
//!
//! The reactor tracks:
//! - Registered file descriptors and their tokens
//! - Wakers of tasks parked until a descriptor becomes readable or writable
//!
//! Readiness is edge-triggered, so callers always attempt the non-blocking
//! syscall first and only park after it reports `WouldBlock`.

use super::{Event, EventLoop, Interest, Token};
use std::collections::HashMap;
use std::io;
use std::task::Waker;
use std::time::Duration;

/// Registration entry in the reactor
#[derive(Debug)]
struct Registration {
    fd: i32,
    readers: Vec<Waker>,
    writers: Vec<Waker>,
}

impl Registration {
    fn park(list: &mut Vec<Waker>, waker: &Waker) {
        if !list.iter().any(|w| w.will_wake(waker)) {
            list.push(waker.clone());
        }
    }

    fn drain_all(&mut self, out: &mut Vec<Waker>) {
        out.append(&mut self.readers);
        out.append(&mut self.writers);
    }
}

/// Manages I/O registrations and the wakers parked on them
pub struct Reactor {
    event_loop: EventLoop,
    registrations: HashMap<Token, Registration>,
    events: Vec<Event>,
}

impl Reactor {
    /// Create a new reactor draining at most `max_events` events per turn
    pub fn new(max_events: usize) -> io::Result<Self> {
        Ok(Self {
            event_loop: EventLoop::new(max_events)?,
            registrations: HashMap::new(),
            events: Vec::with_capacity(max_events),
        })
    }

    /// Register a descriptor for both read and write readiness
    pub fn register(&mut self, token: Token, fd: i32) -> io::Result<()> {
        self.event_loop
            .register(fd, token, Interest::READABLE | Interest::WRITABLE)?;
        self.registrations.insert(
            token,
            Registration {
                fd,
                readers: Vec::new(),
                writers: Vec::new(),
            },
        );
        log::trace!("reactor: registered fd {} as {:?}", fd, token);
        Ok(())
    }

    /// Remove a registration, returning every waker parked on it
    pub fn deregister(&mut self, token: Token) -> Vec<Waker> {
        let mut wakers = Vec::new();
        if let Some(mut registration) = self.registrations.remove(&token) {
            if let Err(e) = self.event_loop.deregister(registration.fd) {
                log::warn!(
                    "reactor: failed to deregister fd {} ({:?}): {}",
                    registration.fd,
                    token,
                    e
                );
            }
            registration.drain_all(&mut wakers);
        }
        wakers
    }

    /// Park a waker until the token reports the given readiness.
    /// Returns false when the token is not registered.
    pub fn park(&mut self, token: Token, interest: Interest, waker: &Waker) -> bool {
        match self.registrations.get_mut(&token) {
            Some(registration) => {
                if interest.is_readable() {
                    Registration::park(&mut registration.readers, waker);
                }
                if interest.is_writable() {
                    Registration::park(&mut registration.writers, waker);
                }
                true
            }
            None => false,
        }
    }

    /// Wait for events and collect the wakers they release
    pub fn turn(&mut self, timeout: Option<Duration>) -> io::Result<Vec<Waker>> {
        self.events.clear();
        self.event_loop.poll(&mut self.events, timeout)?;

        let mut wakers = Vec::new();
        for event in &self.events {
            let Some(registration) = self.registrations.get_mut(&event.token) else {
                continue;
            };
            let failed = event.interest.is_error() || event.interest.is_hup();
            if event.interest.is_readable() || failed {
                wakers.append(&mut registration.readers);
            }
            if event.interest.is_writable() || failed {
                wakers.append(&mut registration.writers);
            }
        }
        if !wakers.is_empty() {
            log::trace!("reactor: {} event(s) woke {} task(s)", self.events.len(), wakers.len());
        }
        Ok(wakers)
    }

    /// Whether any task is parked on I/O
    pub fn has_waiters(&self) -> bool {
        self.registrations
            .values()
            .any(|r| !r.readers.is_empty() || !r.writers.is_empty())
    }

    /// Number of registered descriptors
    pub fn len(&self) -> usize {
        self.registrations.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::task::Wake;

    struct CountingWaker(AtomicUsize);

    impl Wake for CountingWaker {
        fn wake(self: Arc<Self>) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn pipe() -> (i32, i32) {
        let mut fds = [0i32; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        (fds[0], fds[1])
    }

    #[test]
    fn test_reactor_register_deregister() {
        let mut reactor = Reactor::new(8).unwrap();
        let (rd, wr) = pipe();
        let token = Token(1);

        reactor.register(token, rd).unwrap();
        assert_eq!(reactor.len(), 1);

        let counter = Arc::new(CountingWaker(AtomicUsize::new(0)));
        let waker = Waker::from(counter.clone());
        assert!(reactor.park(token, Interest::READABLE, &waker));
        assert!(reactor.has_waiters());

        // Deregistration hands back parked wakers so their tasks can settle
        let released = reactor.deregister(token);
        assert_eq!(released.len(), 1);
        assert!(reactor.is_empty());
        assert!(!reactor.park(token, Interest::READABLE, &waker));

        unsafe {
            libc::close(rd);
            libc::close(wr);
        }
    }

    #[test]
    fn test_reactor_wakes_reader() {
        let mut reactor = Reactor::new(8).unwrap();
        let (rd, wr) = pipe();
        let token = Token(7);
        reactor.register(token, rd).unwrap();

        let counter = Arc::new(CountingWaker(AtomicUsize::new(0)));
        let waker = Waker::from(counter.clone());
        reactor.park(token, Interest::READABLE, &waker);
        // Parking twice with the same waker does not duplicate it
        reactor.park(token, Interest::READABLE, &waker);

        let byte = 9u8;
        unsafe { libc::write(wr, &byte as *const u8 as *const libc::c_void, 1) };

        let wakers = reactor.turn(Some(Duration::from_millis(100))).unwrap();
        assert_eq!(wakers.len(), 1);
        wakers.into_iter().for_each(Waker::wake);
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);
        assert!(!reactor.has_waiters());

        reactor.deregister(token);
        unsafe {
            libc::close(rd);
            libc::close(wr);
        }
    }
}
