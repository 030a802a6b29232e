//! The executor: a fixed set of ranked worker threads.
//!
//! The pool knows nothing about collective calls. It accepts one job at a
//! time and hands it to some worker, returning a future for the outcome.
//! Everything the controller promises on top of that (every worker runs a
//! call exactly once, results come back in rank order) is built out of
//! `submit` plus the rendezvous.

use std::{
    sync::Arc,
    thread::{self, JoinHandle},
};

use crossbeam_queue::SegQueue;
use crossbeam_utils::CachePadded;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace};

use crate::{
    comm::{Communicator, Rank},
    error::{Error, Result},
    future::TaskFuture,
    job::Job,
    latch::{AtomicLatch, CountLatch, Latch, Probe},
    registry::Registry,
    util::CallOnDrop,
    worker::{self, WorkerContext},
};

// -----------------------------------------------------------------------------
// Worker pool types

/// The upper bound on the number of workers in a single pool.
pub const MAX_WORKERS: usize = 64;

/// A fixed-size pool of worker threads, ranked `1..=num_workers`.
///
/// Rank 0 belongs to the controller and is never handed work. Dropping the
/// pool halts every worker and waits for it to exit; jobs still waiting in
/// the backlog at that point are abandoned.
pub struct WorkerPool {
    shared: Arc<Shared>,
    handles: Vec<JoinHandle<()>>,
}

/// State shared by the pool handle and all of its workers.
struct Shared {
    /// Indexed by `rank - 1`.
    workers: Vec<CachePadded<ThreadControl>>,
    /// Jobs that arrived while no worker was idle. Any worker that runs out
    /// of work drains it.
    backlog: SegQueue<Job>,
}

/// The control block for one worker thread: its inbox, a way to wake it, and
/// a way to stop it.
struct ThreadControl {
    inbox: Mutex<Inbox>,
    /// Used to wake the worker once it has gone idle.
    awakened: Condvar,
    /// A latch that terminates the worker when set.
    should_terminate: AtomicLatch,
}

struct Inbox {
    /// A job handed directly to this worker.
    job: Option<Job>,
    /// Set while the worker has nothing to do. Workers start out idle, so a
    /// job may be dispatched to a worker whose thread has not started yet.
    idle: bool,
}

/// How worker threads are spawned.
pub(crate) struct SpawnOptions {
    pub thread_name: Box<dyn FnMut(Rank) -> String>,
    pub stack_size: Option<usize>,
    pub verbose: bool,
}

// -----------------------------------------------------------------------------
// Pool creation and shutdown

impl WorkerPool {
    /// Spawns one worker per endpoint. Each endpoint must belong to a world
    /// group and carry a rank `>= 1`; endpoints are expected in rank order.
    ///
    /// Returns once every worker has entered its main loop.
    pub(crate) fn spawn(endpoints: Vec<Communicator>, mut options: SpawnOptions) -> Result<WorkerPool> {
        let num_workers = endpoints.len();
        let shared = Arc::new(Shared {
            workers: (0..num_workers)
                .map(|_| CachePadded::new(ThreadControl::new()))
                .collect(),
            backlog: SegQueue::new(),
        });
        let ready = Arc::new(CountLatch::with_count(num_workers));

        let mut pool = WorkerPool {
            shared,
            handles: Vec::with_capacity(num_workers),
        };

        for endpoint in endpoints {
            let rank = endpoint.rank();
            debug_assert_eq!(rank, pool.handles.len() + 1);

            let ctx = WorkerContext::new(endpoint, Registry::new(), options.verbose);
            let mut builder = thread::Builder::new().name((options.thread_name)(rank));
            if let Some(stack_size) = options.stack_size {
                builder = builder.stack_size(stack_size);
            }

            let shared = Arc::clone(&pool.shared);
            let ready = Arc::clone(&ready);
            match builder.spawn(move || main_loop(shared, ctx, ready)) {
                Ok(handle) => pool.handles.push(handle),
                Err(err) => {
                    // Dropping `pool` halts the workers spawned so far.
                    return Err(Error::DependencyUnavailable {
                        what: "worker thread",
                        reason: err.to_string(),
                    });
                }
            }
        }

        ready.wait();
        debug!(num_workers, "worker pool started");
        Ok(pool)
    }

    /// The number of workers in the pool.
    #[inline]
    pub fn num_workers(&self) -> usize {
        self.shared.workers.len()
    }

    /// Halts every worker and waits for all of them to exit.
    ///
    /// A worker finishes the job it is running (and any job already in its
    /// inbox) before it exits. Jobs left in the backlog are abandoned.
    pub fn shutdown(mut self) {
        self.halt_and_join();
    }

    fn halt_and_join(&mut self) {
        if self.handles.is_empty() {
            return;
        }
        for worker in &self.shared.workers {
            worker.halt();
        }
        for handle in self.handles.drain(..) {
            // A worker thread only exits abnormally if the runtime itself
            // panicked. Job panics are caught inside the job.
            let _ = handle.join();
        }
        while let Some(job) = self.shared.backlog.pop() {
            drop(job);
        }
        debug!("worker pool stopped");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.halt_and_join();
    }
}

// -----------------------------------------------------------------------------
// Core API

impl WorkerPool {
    /// Submits `f` to run on some worker and returns a future for its
    /// outcome.
    ///
    /// The job goes to the lowest-ranked idle worker, or waits in the backlog
    /// when every worker is busy. Which worker runs it is not part of the
    /// contract, except that jobs submitted while every worker is idle and
    /// blocked afterwards land on ranks `1, 2, ...` in submission order.
    pub fn submit<F, T>(&self, f: F) -> TaskFuture<T>
    where
        F: FnOnce(&mut WorkerContext) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let (job, future) = Job::new(f);
        self.shared.dispatch(job);
        future
    }

    /// Submits `f` once per item and returns the futures in item order.
    pub fn submit_all<F, I, T>(&self, f: F, items: I) -> Vec<TaskFuture<T>>
    where
        F: Fn(&mut WorkerContext, I::Item) -> T + Send + Sync + 'static,
        I: IntoIterator,
        I::Item: Send + 'static,
        T: Send + 'static,
    {
        let f = Arc::new(f);
        items
            .into_iter()
            .map(|item| {
                let f = Arc::clone(&f);
                self.submit(move |ctx| Ok(f(ctx, item)))
            })
            .collect()
    }

    /// Runs `f` once per item across the pool. The returned iterator yields
    /// the outcomes in item order, blocking on each as needed.
    pub fn map<F, I, T>(&self, f: F, items: I) -> impl Iterator<Item = Result<T>>
    where
        F: Fn(&mut WorkerContext, I::Item) -> T + Send + Sync + 'static,
        I: IntoIterator,
        I::Item: Send + 'static,
        T: Send + 'static,
    {
        self.submit_all(f, items)
            .into_iter()
            .map(TaskFuture::result)
    }
}

impl Shared {
    fn dispatch(&self, job: Job) {
        for (index, worker) in self.workers.iter().enumerate() {
            let mut inbox = worker.inbox.lock();
            if inbox.idle {
                trace!(rank = index + 1, "job dispatched");
                inbox.job = Some(job);
                inbox.idle = false;
                worker.awakened.notify_one();
                return;
            }
        }

        self.backlog.push(job);

        // A worker may have gone idle after we passed it. Workers check the
        // backlog under their own lock before going idle, so a second pass is
        // enough to make sure the job is not stranded.
        for (index, worker) in self.workers.iter().enumerate() {
            let mut inbox = worker.inbox.lock();
            if inbox.idle {
                let Some(job) = self.backlog.pop() else { return };
                trace!(rank = index + 1, "backlogged job dispatched");
                inbox.job = Some(job);
                inbox.idle = false;
                worker.awakened.notify_one();
            }
        }
    }
}

// -----------------------------------------------------------------------------
// Thread control

impl ThreadControl {
    fn new() -> ThreadControl {
        ThreadControl {
            inbox: Mutex::new(Inbox {
                job: None,
                idle: true,
            }),
            awakened: Condvar::new(),
            should_terminate: AtomicLatch::new(),
        }
    }

    /// Blocks until there is a job for this worker, or returns `None` once
    /// the worker has been asked to terminate.
    fn next_job(&self, backlog: &SegQueue<Job>) -> Option<Job> {
        let mut inbox = self.inbox.lock();
        loop {
            if let Some(job) = inbox.job.take() {
                return Some(job);
            }
            if self.should_terminate.probe() {
                return None;
            }
            if let Some(job) = backlog.pop() {
                inbox.idle = false;
                return Some(job);
            }
            inbox.idle = true;
            self.awakened.wait(&mut inbox);
        }
    }

    /// Tells the worker to exit its main loop.
    fn halt(&self) {
        self.should_terminate.set();
        let _inbox = self.inbox.lock();
        self.awakened.notify_one();
    }
}

// -----------------------------------------------------------------------------
// Main worker loop

/// The main loop of a worker thread. Runs jobs until asked to terminate.
fn main_loop(shared: Arc<Shared>, mut ctx: WorkerContext, ready: Arc<CountLatch>) {
    let rank = ctx.rank();
    let control = &shared.workers[rank - 1];

    worker::set_current(rank);
    let _clear = CallOnDrop(worker::clear_current);

    // Inform the pool that we are entering the main loop.
    ready.set();
    trace!(rank, pid = ctx.pid(), "worker started");

    while let Some(job) = control.next_job(&shared.backlog) {
        job.execute(&mut ctx);
    }

    trace!(rank, "worker exiting");
}
