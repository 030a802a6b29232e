//! A one-shot, key-tagged barrier across the workers of a world group.
//!
//! The executor offers no way to make every worker run a task exactly once:
//! it hands tasks to whichever worker is free. The barrier closes that gap.
//! A worker holding a collective task does not return until every other worker
//! holds one too, so no worker can pick up a second task of the same call.
//!
//! The protocol only uses point-to-point messages:
//!
//! 1. The coordinator (the lowest worker rank) receives one
//!    [`Message::Arrive`] from each other worker, in rank order, and checks
//!    that each carries the sender's own rank.
//! 2. Every other worker sends its arrival and then blocks until it receives a
//!    [`Message::Release`] carrying the key of the current call.
//! 3. Once every arrival is in, the coordinator releases everyone.
//!
//! The coordinator arrives implicitly. A worker that never reaches the barrier
//! blocks the coordinator until the communicator's timeout (if any) expires.

use std::time::Instant;

use tracing::{debug, trace};

use crate::{
    comm::{CallKey, Communicator, Message, Rank},
    error::{Mismatch, Result},
};

/// The worker rank that collects arrivals and sends releases.
pub const COORDINATOR: Rank = 1;

/// Blocks until every worker of `comm` has reached the barrier for `key`.
///
/// Must be called by every worker (ranks `1..comm.size()`) with the same key,
/// and never by the controller.
pub fn wait_for_all_workers(comm: &Communicator, key: CallKey) -> Result<()> {
    let rank = comm.rank();
    if rank < COORDINATOR {
        return Err(Mismatch::NotAWorker { rank }.into());
    }

    trace!(rank, call_key = key, "entered rendezvous");
    if rank == COORDINATOR {
        coordinate(comm, key)
    } else {
        comm.send(COORDINATOR, Message::Arrive(rank))?;
        match comm.recv(COORDINATOR)? {
            Message::Release(received) if received == key => Ok(()),
            received => Err(Mismatch::Key {
                rank,
                expected: key,
                received,
            }
            .into()),
        }
    }
}

fn coordinate(comm: &Communicator, key: CallKey) -> Result<()> {
    let start = Instant::now();
    let peers = COORDINATOR + 1..comm.size();

    for peer in peers.clone() {
        match comm.recv(peer)? {
            Message::Arrive(identity) if identity == peer => {}
            received => {
                return Err(Mismatch::Identity {
                    coordinator: COORDINATOR,
                    expected: peer,
                    received,
                }
                .into())
            }
        }
    }

    for peer in peers {
        comm.send(peer, Message::Release(key))?;
    }

    debug!(
        rank = COORDINATOR,
        call_key = key,
        elapsed = ?start.elapsed(),
        "rendezvous complete"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::{thread, time::Duration};

    use super::*;
    use crate::error::Error;

    #[test]
    fn all_workers_pass() {
        let mut world = Communicator::world(5);
        world.remove(0);
        let handles: Vec<_> = world
            .into_iter()
            .map(|comm| thread::spawn(move || wait_for_all_workers(&comm, 7)))
            .collect();
        for handle in handles {
            handle.join().unwrap().unwrap();
        }
    }

    #[test]
    fn single_worker_passes_alone() {
        let world = Communicator::world(2);
        wait_for_all_workers(&world[1], 3).unwrap();
    }

    #[test]
    fn consecutive_keys() {
        let mut world = Communicator::world(4);
        world.remove(0);
        let handles: Vec<_> = world
            .into_iter()
            .map(|comm| {
                thread::spawn(move || {
                    for key in 1..=10 {
                        wait_for_all_workers(&comm, key)?;
                    }
                    Ok::<_, Error>(())
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap().unwrap();
        }
    }

    #[test]
    fn wrong_identity_is_fatal() {
        let world = Communicator::world(4);
        world[2].send(COORDINATOR, Message::Arrive(2)).unwrap();
        world[3].send(COORDINATOR, Message::Arrive(2)).unwrap();

        let err = wait_for_all_workers(&world[1], 1).unwrap_err();
        assert!(matches!(
            err,
            Error::ProtocolMismatch(Mismatch::Identity {
                coordinator: 1,
                expected: 3,
                received: Message::Arrive(2),
            })
        ));
    }

    #[test]
    fn stale_release_is_fatal() {
        let world = Communicator::world(3);
        world[1].send(2, Message::Release(4)).unwrap();

        let err = wait_for_all_workers(&world[2], 5).unwrap_err();
        assert!(matches!(
            err,
            Error::ProtocolMismatch(Mismatch::Key {
                rank: 2,
                expected: 5,
                received: Message::Release(4),
            })
        ));
    }

    #[test]
    fn controller_cannot_join() {
        let world = Communicator::world(2);
        assert!(matches!(
            wait_for_all_workers(&world[0], 1),
            Err(Error::ProtocolMismatch(Mismatch::NotAWorker { rank: 0 }))
        ));
    }

    #[test]
    fn missing_worker_times_out() {
        let mut world = Communicator::world(3).into_iter();
        let _controller = world.next();
        let coordinator = world
            .next()
            .unwrap()
            .with_timeout(Some(Duration::from_millis(20)));
        let _absent = world.next();

        assert!(matches!(
            wait_for_all_workers(&coordinator, 1),
            Err(Error::Timeout {
                rank: 1,
                peer: Some(2),
                ..
            })
        ));
    }
}
