//! Point-to-point messaging between ranks.
//!
//! A group of `size` ranks is wired together as a full mesh of unbounded
//! channels: for every ordered pair `(source, dest)` there is one channel, so
//! messages from one sender to one receiver arrive in the order they were sent
//! and a receive can name exactly which peer it is waiting on.
//!
//! Rank 0 of the world group is the controller; ranks `1..size` are workers.
//! Nothing else is shared between ranks. The one collective operation offered
//! here, [`Communicator::split`], carves a group into sub-groups by color.

use std::{
    fmt,
    sync::Arc,
    time::{Duration, Instant},
};

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::{Condvar, Mutex};
use tracing::trace;

use crate::error::{Error, Result};

/// A position within a group. The controller is rank 0 of the world group.
pub type Rank = usize;

/// Identifies one collective call. Bootstrap uses key 0.
pub type CallKey = u64;

/// Sub-group selector passed to [`Communicator::split`].
pub type Color = u32;

/// The messages exchanged by the rendezvous protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Message {
    /// A worker announcing that it has reached the barrier.
    Arrive(Rank),
    /// The coordinator releasing the barrier for one call.
    Release(CallKey),
}

// -----------------------------------------------------------------------------
// Communicator

/// One rank's endpoint into a group.
pub struct Communicator {
    rank: Rank,
    size: usize,
    /// `outbox[dest]` carries messages from this rank to `dest`.
    outbox: Vec<Sender<Message>>,
    /// `inbox[source]` carries messages from `source` to this rank.
    inbox: Vec<Receiver<Message>>,
    /// State shared by the group for collective splits.
    group: Arc<Group>,
    /// Upper bound on any single wait. `None` waits forever.
    timeout: Option<Duration>,
}

impl Communicator {
    /// Wires up a new group of `size` ranks and returns one endpoint per rank,
    /// ordered by rank.
    pub fn world(size: usize) -> Vec<Communicator> {
        mesh(size, None)
    }

    /// Bounds every receive and split on this endpoint by `timeout`.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Communicator {
        self.timeout = timeout;
        self
    }

    #[inline]
    pub fn rank(&self) -> Rank {
        self.rank
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    #[inline]
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Sends `message` to `dest`. Never blocks.
    ///
    /// # Panics
    ///
    /// Panics if `dest` is not a rank of this group.
    pub fn send(&self, dest: Rank, message: Message) -> Result<()> {
        trace!(rank = self.rank, dest, ?message, "send");
        self.outbox[dest]
            .send(message)
            .map_err(|_| Error::Disconnected {
                rank: self.rank,
                peer: dest,
            })
    }

    /// Blocks until a message from `source` arrives.
    ///
    /// # Panics
    ///
    /// Panics if `source` is not a rank of this group.
    pub fn recv(&self, source: Rank) -> Result<Message> {
        let inbox = &self.inbox[source];
        let message = match self.timeout {
            None => inbox.recv().map_err(|_| Error::Disconnected {
                rank: self.rank,
                peer: source,
            })?,
            Some(timeout) => inbox.recv_timeout(timeout).map_err(|err| match err {
                RecvTimeoutError::Timeout => Error::Timeout {
                    rank: self.rank,
                    peer: Some(source),
                    waited: timeout,
                },
                RecvTimeoutError::Disconnected => Error::Disconnected {
                    rank: self.rank,
                    peer: source,
                },
            })?,
        };
        trace!(rank = self.rank, source, ?message, "recv");
        Ok(message)
    }

    /// Splits the group into sub-groups. Every rank of the group must call
    /// this; ranks passing the same `color` end up in the same sub-group,
    /// ranked by their order in this group.
    ///
    /// This blocks until all ranks have called it. The returned communicator
    /// inherits this endpoint's timeout.
    pub fn split(&self, color: Color) -> Result<Communicator> {
        let deadline = self.timeout.map(|timeout| Instant::now() + timeout);
        let mut round = self.group.round.lock();

        let epoch = round.epoch;
        round.colors[self.rank] = Some(color);
        round.arrived += 1;

        if round.arrived == self.size {
            round.deal(self.timeout);
            self.group.settled.notify_all();
        } else {
            while round.epoch == epoch {
                match deadline {
                    None => self.group.settled.wait(&mut round),
                    Some(deadline) => {
                        if self.group.settled.wait_until(&mut round, deadline).timed_out()
                            && round.epoch == epoch
                        {
                            // Withdraw so a later attempt does not count us twice.
                            round.colors[self.rank] = None;
                            round.arrived -= 1;
                            return Err(Error::Timeout {
                                rank: self.rank,
                                peer: None,
                                waited: self.timeout.unwrap_or_default(),
                            });
                        }
                    }
                }
            }
        }

        round.dealt[self.rank]
            .take()
            .ok_or(Error::Disconnected {
                rank: self.rank,
                peer: self.rank,
            })
    }
}

impl fmt::Debug for Communicator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Communicator")
            .field("rank", &self.rank)
            .field("size", &self.size)
            .field("timeout", &self.timeout)
            .finish()
    }
}

// -----------------------------------------------------------------------------
// Group split state

/// Collective state for one group. Only `split` touches it.
struct Group {
    round: Mutex<SplitRound>,
    settled: Condvar,
}

/// Bookkeeping for the split currently in progress.
struct SplitRound {
    /// Incremented each time a split completes.
    epoch: u64,
    /// The color each rank asked for in this round.
    colors: Vec<Option<Color>>,
    /// How many ranks have joined this round.
    arrived: usize,
    /// The endpoint dealt to each rank, waiting to be picked up.
    dealt: Vec<Option<Communicator>>,
}

impl SplitRound {
    /// Builds one sub-group per color and deals the endpoints out, then opens
    /// the next round.
    fn deal(&mut self, timeout: Option<Duration>) {
        let mut members: Vec<(Color, Vec<Rank>)> = Vec::new();
        for (rank, color) in self.colors.iter_mut().enumerate() {
            let Some(color) = color.take() else { continue };
            match members.iter_mut().find(|(c, _)| *c == color) {
                Some((_, ranks)) => ranks.push(rank),
                None => members.push((color, vec![rank])),
            }
        }

        for (_, ranks) in members {
            let endpoints = mesh(ranks.len(), timeout);
            for (rank, endpoint) in ranks.into_iter().zip(endpoints) {
                self.dealt[rank] = Some(endpoint);
            }
        }

        self.arrived = 0;
        self.epoch += 1;
    }
}

/// Wires a full mesh of `size` endpoints.
fn mesh(size: usize, timeout: Option<Duration>) -> Vec<Communicator> {
    let group = Arc::new(Group {
        round: Mutex::new(SplitRound {
            epoch: 0,
            colors: vec![None; size],
            arrived: 0,
            dealt: (0..size).map(|_| None).collect(),
        }),
        settled: Condvar::new(),
    });

    let mut outboxes: Vec<Vec<Sender<Message>>> = (0..size).map(|_| Vec::with_capacity(size)).collect();
    let mut inboxes: Vec<Vec<Receiver<Message>>> = (0..size).map(|_| Vec::with_capacity(size)).collect();
    for outbox in outboxes.iter_mut() {
        for inbox in inboxes.iter_mut() {
            let (tx, rx) = unbounded();
            outbox.push(tx);
            inbox.push(rx);
        }
    }

    outboxes
        .into_iter()
        .zip(inboxes)
        .enumerate()
        .map(|(rank, (outbox, inbox))| Communicator {
            rank,
            size,
            outbox,
            inbox,
            group: Arc::clone(&group),
            timeout,
        })
        .collect()
}
