//! Pool construction.
//!
//! A [`Builder`] collects the knobs, then [`Builder::build`] spawns the
//! workers, bootstraps them and hands back a ready [`Controller`].
//!
//! ```no_run
//! use std::time::Duration;
//!
//! let mut controller = cohort::Builder::new()
//!     .num_workers(4)
//!     .rendezvous_timeout(Duration::from_secs(30))
//!     .registry(|rank, registry| registry.register("shard", rank))
//!     .build()?;
//!
//! let shards: Vec<usize> = controller.get("shard")?;
//! assert_eq!(shards, vec![1, 2, 3, 4]);
//! # Ok::<(), cohort::Error>(())
//! ```

use std::{env, fmt, sync::Arc, thread, time::Duration};

use tracing::warn;

use crate::{
    comm::{Communicator, Rank},
    controller::Controller,
    error::{Error, Result},
    pool::{SpawnOptions, MAX_WORKERS},
    registry::{Registry, RegistryError},
};

/// The environment variable consulted when `num_workers` is not set.
pub const NUM_WORKERS_ENV: &str = "COHORT_NUM_WORKERS";

/// Fills a worker's registry during bootstrap. Called once on every worker,
/// with that worker's rank.
pub type RegistryInit = dyn Fn(Rank, &mut Registry) -> std::result::Result<(), RegistryError> + Send + Sync;

/// Configures and builds a [`Controller`].
pub struct Builder {
    num_workers: Option<usize>,
    procs_per_worker: usize,
    thread_name: Option<Box<dyn FnMut(Rank) -> String>>,
    stack_size: Option<usize>,
    rendezvous_timeout: Option<Duration>,
    poll_interval: Duration,
    verbose: bool,
    registry: Option<Arc<RegistryInit>>,
}

impl Default for Builder {
    fn default() -> Self {
        Builder {
            num_workers: None,
            procs_per_worker: 1,
            thread_name: None,
            stack_size: None,
            rendezvous_timeout: None,
            poll_interval: Duration::from_millis(1),
            verbose: false,
            registry: None,
        }
    }
}

impl Builder {
    pub fn new() -> Builder {
        Builder::default()
    }

    /// Sets the number of workers.
    ///
    /// When unset, the `COHORT_NUM_WORKERS` environment variable is used if
    /// present, otherwise one worker per available core minus one for the
    /// controller (at least one).
    pub fn num_workers(mut self, num_workers: usize) -> Self {
        self.num_workers = Some(num_workers);
        self
    }

    /// Requests `procs` processing units per worker. Only one is supported;
    /// larger values are reduced to one with a warning.
    pub fn procs_per_worker(mut self, procs: usize) -> Self {
        self.procs_per_worker = procs;
        self
    }

    /// Names worker threads. Defaults to `cohort-worker-{rank}`.
    pub fn thread_name<F>(mut self, name: F) -> Self
    where
        F: FnMut(Rank) -> String + 'static,
    {
        self.thread_name = Some(Box::new(name));
        self
    }

    /// Sets the stack size of worker threads.
    pub fn stack_size(mut self, stack_size: usize) -> Self {
        self.stack_size = Some(stack_size);
        self
    }

    /// Bounds how long any rank waits on a peer during a rendezvous or split.
    ///
    /// Without a timeout a worker that never reaches the barrier blocks the
    /// whole call forever.
    pub fn rendezvous_timeout(mut self, timeout: Duration) -> Self {
        self.rendezvous_timeout = Some(timeout);
        self
    }

    /// How often [`AsyncResult::ready`](crate::future::AsyncResult::ready)
    /// re-checks its tasks while waiting.
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Logs worker bootstrap at `info` instead of `debug`.
    pub fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    /// Sets the registry initializer run on every worker during bootstrap.
    pub fn registry<F>(mut self, init: F) -> Self
    where
        F: Fn(Rank, &mut Registry) -> std::result::Result<(), RegistryError> + Send + Sync + 'static,
    {
        self.registry = Some(Arc::new(init));
        self
    }

    /// Spawns and bootstraps the pool.
    pub fn build(self) -> Result<Controller> {
        let num_workers = self.resolve_num_workers()?;
        if self.procs_per_worker > 1 {
            warn!(
                requested = self.procs_per_worker,
                "multiple processing units per worker are not supported, using 1"
            );
        }

        let timeout = self.rendezvous_timeout;
        let mut world = Communicator::world(num_workers + 1)
            .into_iter()
            .map(move |endpoint| endpoint.with_timeout(timeout));
        let root = world.next().ok_or(Error::InvalidPoolSize {
            requested: num_workers,
            max: MAX_WORKERS,
        })?;

        let options = SpawnOptions {
            thread_name: self
                .thread_name
                .unwrap_or_else(|| Box::new(|rank: Rank| format!("cohort-worker-{rank}"))),
            stack_size: self.stack_size,
            verbose: self.verbose,
        };

        Controller::start(
            root,
            world.collect(),
            options,
            self.registry,
            self.poll_interval,
        )
    }

    fn resolve_num_workers(&self) -> Result<usize> {
        let requested = match self.num_workers {
            Some(n) => n,
            None => match env::var(NUM_WORKERS_ENV).ok().and_then(|v| v.trim().parse().ok()) {
                Some(n) => n,
                None => default_num_workers(),
            },
        };
        if requested == 0 || requested > MAX_WORKERS {
            return Err(Error::InvalidPoolSize {
                requested,
                max: MAX_WORKERS,
            });
        }
        Ok(requested)
    }
}

fn default_num_workers() -> usize {
    thread::available_parallelism()
        .map(|n| n.get().saturating_sub(1))
        .unwrap_or(1)
        .clamp(1, MAX_WORKERS)
}

impl fmt::Debug for Builder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Builder")
            .field("num_workers", &self.num_workers)
            .field("procs_per_worker", &self.procs_per_worker)
            .field("stack_size", &self.stack_size)
            .field("rendezvous_timeout", &self.rendezvous_timeout)
            .field("poll_interval", &self.poll_interval)
            .field("verbose", &self.verbose)
            .field("registry", &self.registry.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_and_oversized_pools() {
        assert!(matches!(
            Builder::new().num_workers(0).resolve_num_workers(),
            Err(Error::InvalidPoolSize { requested: 0, .. })
        ));
        assert!(matches!(
            Builder::new().num_workers(MAX_WORKERS + 1).resolve_num_workers(),
            Err(Error::InvalidPoolSize { max: MAX_WORKERS, .. })
        ));
        assert_eq!(Builder::new().num_workers(3).resolve_num_workers().unwrap(), 3);
    }

    #[test]
    fn default_size_is_in_range() {
        let n = default_num_workers();
        assert!((1..=MAX_WORKERS).contains(&n));
    }
}
