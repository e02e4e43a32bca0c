//! Deadline queue for sleeps and periodic re-checks
//!
//! Timers are ordered by `(deadline, token)` so the runtime can read the next
//! poll timeout from the front and fire everything due with one split.

use super::Token;
use std::collections::{BTreeMap, HashMap};
use std::task::Waker;
use std::time::{Duration, Instant};

#[derive(Default)]
pub struct TimerWheel {
    queue: BTreeMap<(Instant, Token), Waker>,
    /// Deadline of every armed timer, to find its queue key
    armed: HashMap<Token, Instant>,
}

impl TimerWheel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm `token` for `deadline`, replacing any earlier arming. Polling the
    /// same sleep again only refreshes the waker.
    pub fn insert(&mut self, token: Token, deadline: Instant, waker: &Waker) {
        if let Some(previous) = self.armed.insert(token, deadline) {
            if previous != deadline {
                self.queue.remove(&(previous, token));
            }
        }
        match self.queue.get_mut(&(deadline, token)) {
            Some(existing) if existing.will_wake(waker) => {}
            Some(existing) => *existing = waker.clone(),
            None => {
                self.queue.insert((deadline, token), waker.clone());
            }
        }
    }

    pub fn remove(&mut self, token: Token) -> bool {
        match self.armed.remove(&token) {
            Some(deadline) => self.queue.remove(&(deadline, token)).is_some(),
            None => false,
        }
    }

    /// Disarm every timer due at `now` and hand back their wakers
    pub fn advance(&mut self, now: Instant) -> Vec<Waker> {
        // Everything strictly after `now` stays; tokens never reach u64::MAX
        let later = self.queue.split_off(&(now, Token(u64::MAX)));
        let due = std::mem::replace(&mut self.queue, later);
        due.into_iter()
            .map(|((_, token), waker)| {
                self.armed.remove(&token);
                waker
            })
            .collect()
    }

    pub fn next_expiry(&self) -> Option<Instant> {
        self.queue.keys().next().map(|&(deadline, _)| deadline)
    }

    /// How long the reactor may block before the earliest timer is due
    pub fn timeout_until_next(&self) -> Option<Duration> {
        self.next_expiry()
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    pub fn len(&self) -> usize {
        self.armed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.armed.is_empty()
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

    fn counting_waker() -> (Arc<CountingWaker>, Waker) {
        let count = Arc::new(CountingWaker(AtomicUsize::new(0)));
        (count.clone(), Waker::from(count))
    }

    #[test]
    fn test_due_timers_fire_once() {
        let mut timers = TimerWheel::new();
        let (count, waker) = counting_waker();
        let start = Instant::now();

        timers.insert(Token(1), start + Duration::from_millis(10), &waker);
        timers.insert(Token(2), start + Duration::from_millis(30), &waker);
        assert!(timers.advance(start).is_empty());

        timers
            .advance(start + Duration::from_millis(10))
            .into_iter()
            .for_each(Waker::wake);
        assert_eq!(count.0.load(Ordering::SeqCst), 1);
        assert_eq!(timers.len(), 1);
        assert_eq!(timers.next_expiry(), Some(start + Duration::from_millis(30)));

        assert!(timers.advance(start + Duration::from_millis(10)).is_empty());
    }

    #[test]
    fn test_rearm_moves_deadline() {
        let mut timers = TimerWheel::new();
        let (_, waker) = counting_waker();
        let start = Instant::now();

        timers.insert(Token(4), start + Duration::from_millis(50), &waker);
        timers.insert(Token(4), start + Duration::from_millis(5), &waker);
        assert_eq!(timers.len(), 1);
        assert_eq!(timers.next_expiry(), Some(start + Duration::from_millis(5)));

        assert!(timers.remove(Token(4)));
        assert!(!timers.remove(Token(4)));
        assert!(timers.is_empty());
        assert!(timers.next_expiry().is_none());
    }
}
