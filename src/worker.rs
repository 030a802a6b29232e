//! Per-worker state and the bootstrap that runs on each worker.
//!
//! Every worker thread owns one [`WorkerContext`], built by the pool and
//! handed to the thread's entry point. Every task that runs on the worker
//! borrows it mutably; since a worker runs one task at a time no locking is
//! needed.

use std::{cell::Cell, fmt, process};

use tracing::{debug, info};

use crate::{
    comm::{CallKey, Color, Communicator, Rank},
    config::RegistryInit,
    error::{Mismatch, Result},
    registry::Registry,
    rendezvous,
};

/// Sub-group color of the controller.
const CONTROLLER_COLOR: Color = 0;

/// Sub-group color shared by all workers.
const WORKER_COLOR: Color = 1;

/// The call key reserved for bootstrap.
pub const BOOTSTRAP_KEY: CallKey = 0;

thread_local! {
    static CURRENT_RANK: Cell<Option<Rank>> = const { Cell::new(None) };
}

/// Returns the rank of the pool worker running on this thread, or `None`
/// when called from any other thread (including the controller).
#[inline]
pub fn current_rank() -> Option<Rank> {
    CURRENT_RANK.with(Cell::get)
}

/// Marks this thread as the worker for `rank`. Called once, first thing on a
/// freshly spawned worker thread.
pub(crate) fn set_current(rank: Rank) {
    CURRENT_RANK.with(|current| {
        assert!(current.get().is_none(), "thread already hosts a worker");
        current.set(Some(rank));
    });
}

pub(crate) fn clear_current() {
    CURRENT_RANK.with(|current| current.set(None));
}

// -----------------------------------------------------------------------------
// Worker context

/// Everything a worker owns: its identity, its endpoints and its registry.
pub struct WorkerContext {
    rank: Rank,
    pid: u32,
    world: Communicator,
    group: Option<Communicator>,
    registry: Registry,
    verbose: bool,
}

impl WorkerContext {
    pub(crate) fn new(world: Communicator, registry: Registry, verbose: bool) -> WorkerContext {
        WorkerContext {
            rank: world.rank(),
            pid: process::id(),
            world,
            group: None,
            registry,
            verbose,
        }
    }

    /// This worker's rank in the world group, in `1..=num_workers`.
    #[inline]
    pub fn rank(&self) -> Rank {
        self.rank
    }

    /// The id of the OS process hosting the worker.
    #[inline]
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// The world group, spanning the controller and every worker.
    pub fn world(&self) -> &Communicator {
        &self.world
    }

    /// The worker-only sub-group, available once bootstrap has run.
    pub fn group(&self) -> Option<&Communicator> {
        self.group.as_ref()
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut Registry {
        &mut self.registry
    }
}

impl fmt::Debug for WorkerContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerContext")
            .field("rank", &self.rank)
            .field("pid", &self.pid)
            .field("size", &self.world.size())
            .field("registry", &self.registry)
            .finish()
    }
}

// -----------------------------------------------------------------------------
// Bootstrap

/// Brings one worker into the pool.
///
/// Checks that the init task really landed on the worker it was meant for,
/// waits for every other worker, splits off the worker sub-group and runs the
/// registry initializer. Returns the worker's rank.
pub(crate) fn init_worker(
    ctx: &mut WorkerContext,
    task_id: Rank,
    init: Option<&RegistryInit>,
) -> Result<Rank> {
    if task_id != ctx.rank {
        return Err(Mismatch::Task {
            rank: ctx.rank,
            task_id,
        }
        .into());
    }

    rendezvous::wait_for_all_workers(&ctx.world, BOOTSTRAP_KEY)?;
    ctx.group = Some(ctx.world.split(WORKER_COLOR)?);

    if let Some(init) = init {
        init(ctx.rank, &mut ctx.registry)?;
    }

    if ctx.verbose {
        info!(
            pid = ctx.pid,
            rank = ctx.rank,
            size = ctx.world.size(),
            paths = ?ctx.registry.paths(),
            "worker initialized"
        );
    } else {
        debug!(pid = ctx.pid, rank = ctx.rank, size = ctx.world.size(), "worker initialized");
    }
    Ok(ctx.rank)
}

/// The controller's half of bootstrap: join the split, in a sub-group of its
/// own.
pub(crate) fn init_controller(world: &Communicator) -> Result<Communicator> {
    world.split(CONTROLLER_COLOR)
}

/// Runs one worker's share of a collective call: wait at the barrier for
/// `key`, then run the payload. Returns the rank alongside the result so the
/// controller can order and count participants.
pub(crate) fn apply_wrapper<F, T>(ctx: &mut WorkerContext, key: CallKey, func: &F) -> Result<(Rank, T)>
where
    F: Fn(&mut WorkerContext) -> T + ?Sized,
{
    rendezvous::wait_for_all_workers(&ctx.world, key)?;
    Ok((ctx.rank, func(ctx)))
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, thread};

    use super::*;
    use crate::error::Error;

    fn contexts(size: usize) -> Vec<WorkerContext> {
        Communicator::world(size)
            .into_iter()
            .map(|comm| WorkerContext::new(comm, Registry::new(), false))
            .collect()
    }

    #[test]
    fn misassigned_init_task_is_rejected() {
        let mut ctxs = contexts(3);
        let err = init_worker(&mut ctxs[1], 2, None).unwrap_err();
        assert!(matches!(
            err,
            Error::ProtocolMismatch(Mismatch::Task { rank: 1, task_id: 2 })
        ));
    }

    #[test]
    fn bootstrap_splits_and_initializes() {
        let mut ctxs = contexts(3).into_iter();
        let controller = ctxs.next().unwrap();

        let init: Arc<RegistryInit> =
            Arc::new(|rank: Rank, registry: &mut Registry| registry.register("worker.rank", rank));
        let workers: Vec<_> = ctxs
            .map(|mut ctx| {
                let init = Arc::clone(&init);
                thread::spawn(move || {
                    let task_id = ctx.rank();
                    let rank = init_worker(&mut ctx, task_id, Some(&*init))?;
                    Ok::<_, Error>((rank, ctx))
                })
            })
            .collect();

        let group = init_controller(controller.world()).unwrap();
        assert_eq!(group.size(), 1);

        for (expected, handle) in (1..).zip(workers) {
            let (rank, ctx) = handle.join().unwrap().unwrap();
            assert_eq!(rank, expected);
            assert_eq!(ctx.registry().lookup::<Rank>("worker.rank"), Ok(expected));
            let group = ctx.group().unwrap();
            assert_eq!(group.size(), 2);
            assert_eq!(group.rank(), expected - 1);
        }
    }

    #[test]
    fn current_rank_is_thread_local() {
        assert_eq!(current_rank(), None);
        thread::spawn(|| {
            set_current(4);
            assert_eq!(current_rank(), Some(4));
            clear_current();
            assert_eq!(current_rank(), None);
        })
        .join()
        .unwrap();
        assert_eq!(current_rank(), None);
    }
}
