//! Blocking primitives called latches.
//!
//! A latch starts "closed" and is "opened" exactly once by [`Latch::set`].
//! Consumers either test it with [`Probe::probe`] or, for the blocking kinds,
//! park the thread until it opens.
//!
//! Latches are used for three things in this crate: telling a worker to shut
//! down ([`AtomicLatch`]), announcing that a task has finished
//! ([`LockLatch`]), and waiting for every worker to come up ([`CountLatch`]).

use std::{
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
    time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex};

// -----------------------------------------------------------------------------
// Latches and probes

/// The write side of a latch.
pub trait Latch {
    /// Possibly opens the latch. Some latches (like [`CountLatch`]) need more
    /// than one call before they open.
    fn set(&self);
}

/// The read side of a latch.
pub trait Probe {
    /// Returns `true` if the latch is open.
    fn probe(&self) -> bool;
}

// -----------------------------------------------------------------------------
// Atomic latch

/// A latch backed by a single atomic bool. It cannot block a thread; it is
/// only ever probed.
pub struct AtomicLatch {
    state: AtomicBool,
}

impl AtomicLatch {
    /// Creates a new closed latch.
    #[inline]
    pub const fn new() -> Self {
        Self {
            state: AtomicBool::new(false),
        }
    }
}

impl Default for AtomicLatch {
    fn default() -> Self {
        Self::new()
    }
}

impl Latch for AtomicLatch {
    #[inline]
    fn set(&self) {
        self.state.store(true, Ordering::Release);
    }
}

impl Probe for AtomicLatch {
    #[inline]
    fn probe(&self) -> bool {
        self.state.load(Ordering::Acquire)
    }
}

// -----------------------------------------------------------------------------
// Mutex-lock latch

/// A latch that can block a thread, implemented with a mutex and condvar.
///
/// An atomic mirror of the flag keeps [`Probe::probe`] lock-free, which matters
/// because result handles probe every future in a polling loop.
pub struct LockLatch {
    open: AtomicBool,
    mutex: Mutex<bool>,
    cond: Condvar,
}

impl LockLatch {
    /// Creates a new closed latch.
    #[inline]
    pub const fn new() -> LockLatch {
        LockLatch {
            open: AtomicBool::new(false),
            mutex: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    /// Blocks the thread until the latch opens.
    pub fn wait(&self) {
        if self.probe() {
            return;
        }
        let mut guard = self.mutex.lock();
        while !*guard {
            self.cond.wait(&mut guard);
        }
    }

    /// Blocks the thread until the latch opens or `timeout` elapses. Returns
    /// whether the latch is open.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        if self.probe() {
            return true;
        }
        let deadline = Instant::now() + timeout;
        let mut guard = self.mutex.lock();
        while !*guard {
            if self.cond.wait_until(&mut guard, deadline).timed_out() {
                return *guard;
            }
        }
        true
    }
}

impl Default for LockLatch {
    fn default() -> Self {
        Self::new()
    }
}

impl Latch for LockLatch {
    fn set(&self) {
        let mut guard = self.mutex.lock();
        *guard = true;
        self.open.store(true, Ordering::Release);
        self.cond.notify_all();
    }
}

impl Probe for LockLatch {
    #[inline]
    fn probe(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }
}

// -----------------------------------------------------------------------------
// Counting latch

/// A counting latch opens only after `set` has been called `count` times.
pub struct CountLatch {
    counter: AtomicUsize,
    latch: LockLatch,
}

impl CountLatch {
    /// Creates a new latch that opens after `count` calls to `set`. A latch
    /// with a count of zero starts open.
    pub fn with_count(count: usize) -> Self {
        let latch = LockLatch::new();
        if count == 0 {
            latch.set();
        }
        Self {
            counter: AtomicUsize::new(count),
            latch,
        }
    }

    /// Blocks until the count reaches zero.
    pub fn wait(&self) {
        self.latch.wait();
    }
}

impl Latch for CountLatch {
    fn set(&self) {
        if self.counter.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.latch.set();
        }
    }
}

impl Probe for CountLatch {
    #[inline]
    fn probe(&self) -> bool {
        self.latch.probe()
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, thread};

    use super::*;

    #[test]
    fn atomic_latch_opens_once_set() {
        let latch = AtomicLatch::new();
        assert!(!latch.probe());
        latch.set();
        assert!(latch.probe());
    }

    #[test]
    fn lock_latch_releases_waiter() {
        let latch = Arc::new(LockLatch::new());
        let waiter = {
            let latch = Arc::clone(&latch);
            thread::spawn(move || latch.wait())
        };
        latch.set();
        waiter.join().unwrap();
        assert!(latch.probe());
    }

    #[test]
    fn lock_latch_times_out_while_closed() {
        let latch = LockLatch::new();
        assert!(!latch.wait_timeout(Duration::from_millis(10)));
        latch.set();
        assert!(latch.wait_timeout(Duration::from_millis(10)));
    }

    #[test]
    fn count_latch_needs_every_set() {
        let latch = Arc::new(CountLatch::with_count(3));
        let setters: Vec<_> = (0..3)
            .map(|_| {
                let latch = Arc::clone(&latch);
                thread::spawn(move || latch.set())
            })
            .collect();
        latch.wait();
        for setter in setters {
            setter.join().unwrap();
        }
        assert!(latch.probe());
    }

    #[test]
    fn empty_count_latch_starts_open() {
        assert!(CountLatch::with_count(0).probe());
    }
}
