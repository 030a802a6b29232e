//! The controller: the one handle through which a program drives the pool.
//!
//! Collective calls (`apply`, `get`) run a function on every worker exactly
//! once and gather the results in rank order. The executor underneath only
//! knows how to run one task on some worker, so each collective call submits
//! one task per worker and lets the rendezvous pin them down: a worker
//! holding a task of the call cannot return until every worker holds one.
//!
//! Data-parallel calls (`map`, `map_async`) skip the rendezvous and spread
//! one task per argument tuple across whichever workers are free.

use std::{
    collections::BTreeSet,
    fmt, process,
    sync::Arc,
    time::{Duration, Instant},
};

use tracing::{debug, error, info};

use crate::{
    comm::{CallKey, Communicator, Rank},
    config::RegistryInit,
    error::{Error, Result},
    future::AsyncResult,
    pool::{SpawnOptions, WorkerPool},
    sequence::Sequences,
    worker::{self, WorkerContext, BOOTSTRAP_KEY},
};

/// Drives a pool of ranked workers from rank 0.
///
/// Collective calls take `&mut self`, so at most one is ever in flight.
/// `map` and `map_async` take `&self` and may overlap freely with each other;
/// a collective call issued while `map_async` work is pending simply queues
/// behind it.
pub struct Controller {
    pool: WorkerPool,
    world: Communicator,
    group: Communicator,
    /// The key of the most recent collective call.
    call_key: CallKey,
    poll_interval: Duration,
    /// Set once a collective call fails in a way that corrupts the channels.
    poisoned: Option<Error>,
}

impl Controller {
    /// Spawns the workers and bootstraps them. Called by
    /// [`Builder::build`](crate::config::Builder::build).
    pub(crate) fn start(
        world: Communicator,
        endpoints: Vec<Communicator>,
        options: SpawnOptions,
        registry: Option<Arc<RegistryInit>>,
        poll_interval: Duration,
    ) -> Result<Controller> {
        let start = Instant::now();
        let expected = endpoints.len();
        let pool = WorkerPool::spawn(endpoints, options)?;

        // Every worker is idle, so init task `i` lands on rank `i`.
        let futures: Vec<_> = (1..=expected)
            .map(|task_id| {
                let registry = registry.clone();
                pool.submit(move |ctx| worker::init_worker(ctx, task_id, registry.as_deref()))
            })
            .collect();

        let group = worker::init_controller(&world)?;

        let mut ranks = Vec::with_capacity(expected);
        for future in futures {
            ranks.push(future.result()?);
        }
        verify_ranks(&ranks, expected)?;

        info!(
            pid = process::id(),
            num_workers = expected,
            elapsed = ?start.elapsed(),
            "worker pool initialized"
        );
        Ok(Controller {
            pool,
            world,
            group,
            call_key: BOOTSTRAP_KEY,
            poll_interval,
            poisoned: None,
        })
    }

    /// The number of workers in the pool.
    #[inline]
    pub fn num_workers(&self) -> usize {
        self.pool.num_workers()
    }

    /// The controller's rank in the world group. Always 0.
    #[inline]
    pub fn rank(&self) -> Rank {
        self.world.rank()
    }

    /// Runs `func` once on every worker and returns the results ordered by
    /// rank.
    ///
    /// Blocks until every worker has finished. If any worker fails (its
    /// payload panicked, or the rendezvous broke down) the failure observed
    /// by the lowest rank is returned once all tasks have settled.
    ///
    /// A failure of the rendezvous itself (a timeout, a protocol mismatch, a
    /// lost peer, or a call that did not reach every worker) leaves stray
    /// messages between ranks. The controller is poisoned from then on: every
    /// later `apply` or `get` fails with the same error without dispatching
    /// anything.
    pub fn apply<F, T>(&mut self, func: F) -> Result<Vec<T>>
    where
        F: Fn(&mut WorkerContext) -> T + Send + Sync + 'static,
        T: Send + 'static,
    {
        if let Some(err) = &self.poisoned {
            return Err(err.clone());
        }

        let start = Instant::now();
        self.call_key += 1;
        let key = self.call_key;
        let expected = self.num_workers();

        let func = Arc::new(func);
        let futures: Vec<_> = (0..expected)
            .map(|_| {
                let func = Arc::clone(&func);
                self.pool
                    .submit(move |ctx| worker::apply_wrapper(ctx, key, &*func))
            })
            .collect();

        // Every task of the call settles before any failure is reported.
        let mut results = Vec::with_capacity(expected);
        let mut failures = Vec::new();
        for future in futures {
            match future.result() {
                Ok(result) => results.push(result),
                Err(err) => failures.push(err),
            }
        }

        let lowest_rank = |err: &&Error| err.rank().unwrap_or(Rank::MAX);
        if let Some(fatal) = failures
            .iter()
            .filter(|err| err.is_fatal())
            .min_by_key(lowest_rank)
        {
            return Err(self.poison(key, fatal.clone()));
        }
        if let Some(first) = failures.iter().min_by_key(lowest_rank) {
            return Err(first.clone());
        }

        results.sort_by_key(|(rank, _)| *rank);
        let returned = results
            .iter()
            .map(|(rank, _)| *rank)
            .collect::<BTreeSet<_>>()
            .len();
        if returned != expected {
            let err = Error::ParticipationMismatch { returned, expected };
            return Err(self.poison(key, err));
        }

        debug!(call_key = key, elapsed = ?start.elapsed(), "apply complete");
        Ok(results.into_iter().map(|(_, value)| value).collect())
    }

    /// The error that poisoned the controller, if any.
    pub fn poisoned(&self) -> Option<&Error> {
        self.poisoned.as_ref()
    }

    fn poison(&mut self, key: CallKey, err: Error) -> Error {
        error!(call_key = key, error = %err, "collective call failed, controller poisoned");
        self.poisoned = Some(err.clone());
        err
    }

    /// Looks `name` up in every worker's registry and returns the values
    /// ordered by rank.
    ///
    /// Fails with [`Error::Lookup`] if any worker cannot resolve the name or
    /// holds a value of a different type.
    pub fn get<T>(&mut self, name: &str) -> Result<Vec<T>>
    where
        T: Send + 'static,
    {
        let name = name.to_owned();
        self.apply(move |ctx| {
            ctx.registry()
                .lookup::<T>(&name)
                .map_err(|source| Error::Lookup {
                    rank: ctx.rank(),
                    source,
                })
        })?
        .into_iter()
        .collect()
    }

    /// Runs `func` once per argument tuple across the pool and returns the
    /// results in input order.
    ///
    /// `sequences` is zipped positionally and the shortest sequence wins (see
    /// [`Sequences`]). Returns `Ok(None)` when no sequence is given.
    pub fn map<F, S, T>(&self, func: F, sequences: S) -> Result<Option<Vec<T>>>
    where
        F: Fn(&mut WorkerContext, S::Item) -> T + Send + Sync + 'static,
        S: Sequences,
        T: Send + 'static,
    {
        let Some(args) = sequences.into_tuples() else {
            return Ok(None);
        };
        self.pool.map(func, args).collect::<Result<Vec<_>>>().map(Some)
    }

    /// Like [`map`](Controller::map), but returns at once with a handle that
    /// can be polled for the results.
    pub fn map_async<F, S, T>(&self, func: F, sequences: S) -> Option<AsyncResult<T>>
    where
        F: Fn(&mut WorkerContext, S::Item) -> T + Send + Sync + 'static,
        S: Sequences,
        T: Send + 'static,
    {
        let args = sequences.into_tuples()?;
        let futures = self.pool.submit_all(func, args);
        Some(AsyncResult::new(futures, self.poll_interval))
    }

    /// See the free function [`ensure_controller`].
    pub fn ensure_controller(&self) {
        ensure_controller();
    }

    /// Emits a diagnostic record describing the controller.
    pub fn print_info(&self) {
        info!(
            pid = process::id(),
            rank = self.rank(),
            size = self.world.size(),
            group_size = self.group.size(),
            num_workers = self.num_workers(),
            call_key = self.call_key,
            "controller"
        );
    }

    /// Halts every worker and waits for them to exit. Dropping the controller
    /// does the same.
    pub fn shutdown(self) {
        self.pool.shutdown();
    }
}

impl fmt::Debug for Controller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Controller")
            .field("num_workers", &self.num_workers())
            .field("call_key", &self.call_key)
            .field("poisoned", &self.poisoned.is_some())
            .finish()
    }
}

/// Terminates the process if called from a pool worker. On any other thread
/// this does nothing.
///
/// Guards code that must only ever run on the controller. Termination is
/// immediate: no destructors run and no unwinding takes place.
pub fn ensure_controller() {
    if let Some(rank) = worker::current_rank() {
        error!(
            rank,
            pid = process::id(),
            "controller-only code reached on a worker, terminating"
        );
        process::exit(1);
    }
}

/// Checks that bootstrap heard back from every worker.
fn verify_ranks(ranks: &[Rank], expected: usize) -> Result<()> {
    let returned = ranks.iter().collect::<BTreeSet<_>>().len();
    if returned < expected {
        return Err(Error::InitializationCountMismatch { returned, expected });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_bootstrap_is_reported() {
        assert!(matches!(
            verify_ranks(&[1, 2, 3], 4),
            Err(Error::InitializationCountMismatch {
                returned: 3,
                expected: 4
            })
        ));
        assert!(matches!(
            verify_ranks(&[1, 1, 2, 3], 4),
            Err(Error::InitializationCountMismatch { returned: 3, .. })
        ));
        assert!(verify_ranks(&[4, 2, 3, 1], 4).is_ok());
    }

    #[test]
    fn ensure_controller_is_a_no_op_off_the_pool() {
        ensure_controller();
    }
}
