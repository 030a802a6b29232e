//! Futures returned by the executor, and the batch handle built on them.
//!
//! A [`TaskFuture`] is the read side of one submitted task. The worker that
//! runs the task holds the matching [`Promise`] and fulfils it exactly once;
//! a promise dropped unfulfilled (because the pool shut down first) fails the
//! future with [`Error::TaskAbandoned`].
//!
//! An [`AsyncResult`] wraps the futures of one `map_async` call and answers
//! "is everything done yet?" without blocking.

use std::{
    fmt,
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use crossbeam_utils::Backoff;

use crate::{
    error::{Error, Result},
    latch::{Latch, LockLatch, Probe},
    util::Slot,
};

/// How a task stands, as seen from its future.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Pending,
    Done,
    Failed,
}

/// Shared between a future and its promise.
struct Shared<T> {
    outcome: Slot<Result<T>>,
    finished: LockLatch,
}

// -----------------------------------------------------------------------------
// Promise

/// The write side of a task, held by whichever worker runs it.
pub(crate) struct Promise<T> {
    shared: Option<Arc<Shared<T>>>,
}

impl<T> Promise<T> {
    /// Creates a connected promise and future.
    pub(crate) fn new() -> (Promise<T>, TaskFuture<T>) {
        let shared = Arc::new(Shared {
            outcome: Slot::empty(),
            finished: LockLatch::new(),
        });
        let future = TaskFuture {
            shared: Arc::clone(&shared),
            outcome: None,
        };
        (
            Promise {
                shared: Some(shared),
            },
            future,
        )
    }

    /// Publishes the outcome and wakes anything waiting on the future.
    pub(crate) fn fulfil(mut self, outcome: Result<T>) {
        self.publish(outcome);
    }

    fn publish(&mut self, outcome: Result<T>) {
        if let Some(shared) = self.shared.take() {
            // The promise is consumed on first publish, so the slot is empty.
            let _ = shared.outcome.put(outcome);
            shared.finished.set();
        }
    }
}

impl<T> Drop for Promise<T> {
    fn drop(&mut self) {
        self.publish(Err(Error::TaskAbandoned));
    }
}

// -----------------------------------------------------------------------------
// Task future

/// The outcome of one submitted task, available once the task has run.
pub struct TaskFuture<T> {
    shared: Arc<Shared<T>>,
    /// The outcome, once it has been moved out of the shared slot.
    outcome: Option<Result<T>>,
}

impl<T> TaskFuture<T> {
    /// Returns `true` once the task has finished, successfully or not. Never
    /// blocks.
    #[inline]
    pub fn is_done(&self) -> bool {
        self.shared.finished.probe()
    }

    /// Reports the task state without blocking.
    pub fn status(&mut self) -> TaskStatus {
        match self.settle() {
            None => TaskStatus::Pending,
            Some(Ok(_)) => TaskStatus::Done,
            Some(Err(_)) => TaskStatus::Failed,
        }
    }

    /// Blocks until the task finishes.
    pub fn wait(&self) {
        self.shared.finished.wait();
    }

    /// Blocks until the task finishes or `timeout` elapses. Returns whether
    /// the task finished.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        self.shared.finished.wait_timeout(timeout)
    }

    /// Returns a copy of the outcome if the task has finished. Never blocks.
    pub fn try_result(&mut self) -> Option<Result<T>>
    where
        T: Clone,
    {
        self.settle().cloned()
    }

    /// Blocks until the task finishes and returns its outcome.
    pub fn result(mut self) -> Result<T> {
        self.wait();
        self.settle();
        self.outcome.take().unwrap_or(Err(Error::TaskAbandoned))
    }

    /// Moves the outcome out of the shared slot once the task has finished.
    fn settle(&mut self) -> Option<&Result<T>> {
        if self.outcome.is_none() && self.is_done() {
            self.outcome = self.shared.outcome.take();
        }
        self.outcome.as_ref()
    }
}

impl<T> fmt::Debug for TaskFuture<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskFuture")
            .field("done", &self.is_done())
            .finish()
    }
}

// -----------------------------------------------------------------------------
// Async result

/// A non-blocking handle over a batch of futures, returned by
/// [`Controller::map_async`](crate::controller::Controller::map_async).
///
/// The handle moves from pending to ready exactly once. After that, `ready`
/// answers from a cached flag and never looks at the futures again. The
/// first `get` on a ready handle collects the outcomes and keeps them, so
/// results need not be `Clone` to be looked at.
pub struct AsyncResult<T> {
    futures: Vec<TaskFuture<T>>,
    len: usize,
    outcome: Option<Result<Vec<T>>>,
    ready: bool,
    poll_interval: Duration,
}

impl<T> AsyncResult<T> {
    pub(crate) fn new(futures: Vec<TaskFuture<T>>, poll_interval: Duration) -> Self {
        Self {
            len: futures.len(),
            futures,
            outcome: None,
            ready: false,
            poll_interval,
        }
    }

    /// Reports whether every task has finished.
    ///
    /// With `wait` of `None` this is a single non-blocking check. With
    /// `Some(duration)` it keeps polling until everything is done or the
    /// duration elapses.
    pub fn ready(&mut self, wait: Option<Duration>) -> bool {
        if self.ready {
            return true;
        }

        let start = Instant::now();
        let backoff = Backoff::new();
        loop {
            if self.futures.iter().all(TaskFuture::is_done) {
                self.ready = true;
                return true;
            }
            match wait {
                Some(wait) if start.elapsed() < wait => {
                    if backoff.is_completed() {
                        thread::sleep(self.poll_interval.min(wait.saturating_sub(start.elapsed())));
                    } else {
                        backoff.snooze();
                    }
                }
                _ => return false,
            }
        }
    }

    /// Returns `None` while any task is pending. Once ready, returns the
    /// results in submission order, or the first failure.
    pub fn get(&mut self) -> Option<Result<&[T]>> {
        if !self.ready(None) {
            return None;
        }
        let futures = &mut self.futures;
        let outcome = self
            .outcome
            .get_or_insert_with(|| futures.drain(..).map(TaskFuture::result).collect());
        Some(match outcome {
            Ok(values) => Ok(values.as_slice()),
            Err(err) => Err(err.clone()),
        })
    }

    /// Blocks until every task has finished and returns the results in
    /// submission order, or the first failure.
    pub fn wait(self) -> Result<Vec<T>> {
        match self.outcome {
            Some(outcome) => outcome,
            None => self.futures.into_iter().map(TaskFuture::result).collect(),
        }
    }

    /// The number of tasks in the batch.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl<T> fmt::Debug for AsyncResult<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncResult")
            .field("tasks", &self.len)
            .field("ready", &self.ready)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fulfilled_future_reports_done() {
        let (promise, mut future) = Promise::new();
        assert!(!future.is_done());
        assert_eq!(future.status(), TaskStatus::Pending);
        assert!(future.try_result().is_none());

        promise.fulfil(Ok(11));
        assert_eq!(future.status(), TaskStatus::Done);
        assert_eq!(future.try_result().unwrap().unwrap(), 11);
        assert_eq!(future.try_result().unwrap().unwrap(), 11);
        assert_eq!(future.result().unwrap(), 11);
    }

    #[test]
    fn dropped_promise_abandons() {
        let (promise, mut future) = Promise::<u8>::new();
        drop(promise);
        assert_eq!(future.status(), TaskStatus::Failed);
        assert!(matches!(future.result(), Err(Error::TaskAbandoned)));
    }

    #[test]
    fn result_blocks_until_fulfilled() {
        let (promise, future) = Promise::new();
        let worker = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            promise.fulfil(Ok("late"));
        });
        assert_eq!(future.result().unwrap(), "late");
        worker.join().unwrap();
    }

    #[test]
    fn wait_timeout_on_pending() {
        let (_promise, future) = Promise::<()>::new();
        assert!(!future.wait_timeout(Duration::from_millis(5)));
    }

    #[test]
    fn async_result_is_monotonic() {
        let (first, a) = Promise::new();
        let (second, b) = Promise::new();
        let mut handle = AsyncResult::new(vec![a, b], Duration::from_millis(1));

        assert_eq!(handle.len(), 2);
        assert!(!handle.ready(None));
        assert!(handle.get().is_none());

        second.fulfil(Ok(2));
        assert!(!handle.ready(Some(Duration::from_millis(5))));

        first.fulfil(Ok(1));
        assert!(handle.ready(None));
        assert_eq!(handle.get().unwrap().unwrap(), vec![1, 2]);
        assert!(handle.ready(None));
        assert_eq!(handle.wait().unwrap(), vec![1, 2]);
    }

    #[test]
    fn async_result_waits_for_stragglers() {
        let (promise, future) = Promise::new();
        let mut handle = AsyncResult::new(vec![future], Duration::from_millis(1));
        let worker = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            promise.fulfil(Ok(3));
        });
        assert!(handle.ready(Some(Duration::from_secs(5))));
        assert_eq!(handle.get().unwrap().unwrap(), vec![3]);
        worker.join().unwrap();
    }

    #[test]
    fn async_result_surfaces_failure() {
        let (ok, a) = Promise::new();
        let (failed, b) = Promise::<u8>::new();
        let mut handle = AsyncResult::new(vec![a, b], Duration::from_millis(1));
        ok.fulfil(Ok(1));
        failed.fulfil(Err(Error::TaskPanicked {
            rank: 2,
            message: "boom".into(),
        }));
        assert!(matches!(
            handle.get(),
            Some(Err(Error::TaskPanicked { rank: 2, .. }))
        ));
    }

    #[test]
    fn async_result_holds_results_that_cannot_be_cloned() {
        #[derive(Debug, PartialEq)]
        struct Shard(Vec<u8>);

        let (promise, future) = Promise::new();
        let mut handle = AsyncResult::new(vec![future], Duration::from_millis(1));
        promise.fulfil(Ok(Shard(vec![1, 2])));

        assert!(handle.ready(None));
        assert_eq!(handle.get().unwrap().unwrap(), &[Shard(vec![1, 2])]);
        assert_eq!(handle.get().unwrap().unwrap().len(), 1);
        assert_eq!(handle.len(), 1);
        assert_eq!(handle.wait().unwrap(), vec![Shard(vec![1, 2])]);
    }
}
