//! The error taxonomy shared by every part of the crate.
//!
//! All errors are `Clone` so that a failed [`TaskFuture`](crate::future::TaskFuture)
//! can hand out its failure more than once. Nothing here is ever retried:
//! once a protocol violation is observed the state of the pool is presumed
//! corrupt and the error is raised to the controller.

use std::time::Duration;

use thiserror::Error;

use crate::{
    comm::{CallKey, Message, Rank},
    registry::RegistryError,
};

/// Convenience alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Clone, Error)]
pub enum Error {
    #[error("protocol mismatch: {0}")]
    ProtocolMismatch(#[from] Mismatch),

    #[error("{returned} / {expected} workers returned from bootstrap")]
    InitializationCountMismatch { returned: usize, expected: usize },

    #[error("{returned} / {expected} workers participated in apply")]
    ParticipationMismatch { returned: usize, expected: usize },

    #[error("{what} is unavailable: {reason}")]
    DependencyUnavailable { what: &'static str, reason: String },

    #[error("lookup failed on rank {rank}: {source}")]
    Lookup {
        rank: Rank,
        #[source]
        source: RegistryError,
    },

    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("rank {rank} lost its connection to rank {peer}")]
    Disconnected { rank: Rank, peer: Rank },

    #[error("rank {rank} gave up waiting on {} after {waited:?}", peer_name(.peer))]
    Timeout {
        rank: Rank,
        peer: Option<Rank>,
        waited: Duration,
    },

    #[error("task panicked on rank {rank}: {message}")]
    TaskPanicked { rank: Rank, message: String },

    #[error("task was dropped before it could run")]
    TaskAbandoned,

    #[error("a pool of {requested} workers is not supported (expected 1..={max})")]
    InvalidPoolSize { requested: usize, max: usize },
}

impl Error {
    /// The rank that observed the failure, when there is one.
    pub fn rank(&self) -> Option<Rank> {
        match self {
            Error::ProtocolMismatch(mismatch) => Some(mismatch.rank()),
            Error::Lookup { rank, .. }
            | Error::Disconnected { rank, .. }
            | Error::Timeout { rank, .. }
            | Error::TaskPanicked { rank, .. } => Some(*rank),
            _ => None,
        }
    }

    /// Returns `true` for failures that leave the message channels between
    /// ranks in an unknown state. After one of these no further collective
    /// call can be trusted.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::ProtocolMismatch(_)
                | Error::ParticipationMismatch { .. }
                | Error::Disconnected { .. }
                | Error::Timeout { .. }
        )
    }
}

/// The ways the rendezvous and bootstrap protocols can observe a peer doing
/// the wrong thing.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Mismatch {
    #[error("coordinator {coordinator} expected identity from rank {expected}, received {received:?}")]
    Identity {
        coordinator: Rank,
        expected: Rank,
        received: Message,
    },

    #[error("rank {rank} expected release for call {expected}, received {received:?}")]
    Key {
        rank: Rank,
        expected: CallKey,
        received: Message,
    },

    #[error("rank {rank} was handed init task {task_id}")]
    Task { rank: Rank, task_id: Rank },

    #[error("rank {rank} is not a worker and cannot join a rendezvous")]
    NotAWorker { rank: Rank },
}

impl Mismatch {
    /// The rank that detected the mismatch.
    pub fn rank(&self) -> Rank {
        match self {
            Mismatch::Identity { coordinator, .. } => *coordinator,
            Mismatch::Key { rank, .. } | Mismatch::Task { rank, .. } | Mismatch::NotAWorker { rank } => {
                *rank
            }
        }
    }
}

fn peer_name(peer: &Option<Rank>) -> String {
    match peer {
        Some(peer) => format!("rank {peer}"),
        None => "the group split".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failures_carry_the_observing_rank() {
        let mismatch = Error::from(Mismatch::Identity {
            coordinator: 1,
            expected: 3,
            received: Message::Arrive(2),
        });
        assert_eq!(mismatch.rank(), Some(1));
        assert_eq!(
            Error::TaskPanicked {
                rank: 4,
                message: String::new()
            }
            .rank(),
            Some(4)
        );
        assert_eq!(Error::TaskAbandoned.rank(), None);
    }

    #[test]
    fn channel_failures_are_fatal() {
        assert!(Error::Timeout {
            rank: 2,
            peer: Some(1),
            waited: Duration::from_millis(5)
        }
        .is_fatal());
        assert!(Error::from(Mismatch::NotAWorker { rank: 0 }).is_fatal());
        assert!(Error::ParticipationMismatch {
            returned: 1,
            expected: 2
        }
        .is_fatal());
        assert!(!Error::TaskPanicked {
            rank: 1,
            message: "boom".into()
        }
        .is_fatal());
        assert!(!Error::Lookup {
            rank: 1,
            source: RegistryError::InvalidPath { path: ".".into() }
        }
        .is_fatal());
    }
}
