//! This module defines the executable unit of work, called a `Job`. Jobs are
//! what get queued on the worker pool. A job is created together with the
//! future that will carry its outcome, then moved to whichever worker picks it
//! up, which executes it exactly once against its own context.
//!
//! A job that is dropped without being executed (for instance because the pool
//! shut down first) fails its future with `Error::TaskAbandoned`.

use std::{
    fmt,
    panic::{catch_unwind, AssertUnwindSafe},
};

use tracing::warn;

use crate::{
    error::{Error, Result},
    future::{Promise, TaskFuture},
    util::panic_message,
    worker::WorkerContext,
};

type Work = Box<dyn FnOnce(&mut WorkerContext) + Send>;

// -----------------------------------------------------------------------------
// Job

/// A type-erased unit of work that may be executed by any worker.
pub struct Job {
    work: Work,
}

impl Job {
    /// Packages `f` as a job and returns it along with the future that will
    /// receive its outcome.
    pub fn new<F, T>(f: F) -> (Job, TaskFuture<T>)
    where
        F: FnOnce(&mut WorkerContext) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let (promise, future) = Promise::new();
        let work: Work = Box::new(move |ctx: &mut WorkerContext| {
            let rank = ctx.rank();
            let outcome = match catch_unwind(AssertUnwindSafe(|| f(ctx))) {
                Ok(outcome) => outcome,
                Err(payload) => {
                    let message = panic_message(&*payload);
                    warn!(rank, %message, "task panicked");
                    Err(Error::TaskPanicked { rank, message })
                }
            };
            promise.fulfil(outcome);
        });
        (Job { work }, future)
    }

    /// Runs the job on the calling worker. Panics raised by the job are caught
    /// and delivered through its future.
    #[inline]
    pub fn execute(self, ctx: &mut WorkerContext) {
        (self.work)(ctx)
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Job { .. }")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{comm::Communicator, future::TaskStatus, registry::Registry};

    fn context() -> WorkerContext {
        let mut world = Communicator::world(2);
        WorkerContext::new(world.remove(1), Registry::new(), false)
    }

    #[test]
    fn executes_against_context() {
        let mut ctx = context();
        let (job, future) = Job::new(|ctx: &mut WorkerContext| Ok(ctx.rank() * 10));
        job.execute(&mut ctx);
        assert_eq!(future.result().unwrap(), 10);
    }

    #[test]
    fn panic_fails_the_future() {
        let mut ctx = context();
        let (job, mut future) = Job::new(|_: &mut WorkerContext| -> Result<()> { panic!("bad input") });
        job.execute(&mut ctx);
        assert_eq!(future.status(), TaskStatus::Failed);
        assert!(matches!(
            future.result(),
            Err(Error::TaskPanicked { rank: 1, message }) if message == "bad input"
        ));
    }

    #[test]
    fn unexecuted_job_is_abandoned() {
        let (job, future) = Job::new(|_: &mut WorkerContext| Ok(()));
        drop(job);
        assert!(matches!(future.result(), Err(Error::TaskAbandoned)));
    }
}
