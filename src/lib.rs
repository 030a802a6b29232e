//! Collective execution over a pool of ranked workers.
//!
//! Cohort turns a plain task executor (submit one task, get back one future)
//! into a collective-execution layer: every worker runs a given function
//! exactly once per call, and the caller blocks until all of them are done.
//! Workers are share-nothing threads ranked `1..=N`; the controller that
//! drives them is rank 0. The only coordination between ranks is explicit
//! message passing over a [`Communicator`](comm::Communicator).
//!
//! Exactly-once delivery is not something the executor offers. It is built
//! on top with a small rendezvous protocol: each task of a collective call
//! reports to a coordinating worker and waits for a release tagged with the
//! call's key before running its payload, so no worker can take a second task
//! of the same call.
//!
//! Each worker owns a [`Registry`] of named values, filled once during
//! bootstrap and readable by every payload that later runs on that worker.
//!
//! ```no_run
//! let mut controller = cohort::Builder::new().num_workers(3).build()?;
//!
//! let ranks = controller.apply(|ctx| ctx.rank())?;
//! assert_eq!(ranks, vec![1, 2, 3]);
//!
//! let sums = controller.map(|_, (a, b): (i32, i32)| a + b, (vec![1, 2], vec![10, 20]))?;
//! assert_eq!(sums, Some(vec![11, 22]));
//! # Ok::<(), cohort::Error>(())
//! ```

pub mod comm;
pub mod config;
pub mod controller;
pub mod error;
pub mod future;
pub mod job;
pub mod latch;
pub mod pool;
pub mod registry;
pub mod rendezvous;
pub mod sequence;
pub mod worker;

mod util;

pub use crate::{
    config::Builder,
    controller::{ensure_controller, Controller},
    error::{Error, Mismatch, Result},
    registry::{Registry, RegistryError},
};

pub mod prelude {
    pub use crate::{
        config::Builder,
        controller::{ensure_controller, Controller},
        error::{Error, Result},
        future::{AsyncResult, TaskFuture, TaskStatus},
        registry::Registry,
        worker::WorkerContext,
    };
}
