//! Collective communication between mesh ranks.
//!
//! [`ProcessGroup`] is the seam the driver talks to. [`LocalFabric`] backs it
//! with worker threads in one process: every rank owns a mailbox, a
//! collective sends this rank's contribution to each other member and waits
//! on its own mailbox for theirs. Any failure is broadcast as an abort
//! message so that no rank is left waiting.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use tracing::{debug, error};

use crate::error::{MoxeError, MoxeResult};

/// Collective operations available to one rank.
pub trait ProcessGroup {
    fn rank(&self) -> usize;

    /// Replace `buf` with the element-wise mean over `members`.
    ///
    /// Blocks until every member has called it with the same member set.
    fn all_reduce_mean(&self, members: &[usize], buf: &mut [f32]) -> MoxeResult<()>;

    /// Block until every member arrives.
    fn barrier(&self, members: &[usize]) -> MoxeResult<()>;

    /// Abort every rank. Idempotent; the first reason wins.
    fn abort(&self, step: Option<usize>, reason: &str);

    /// `Aborted` once any rank has aborted.
    fn check_abort(&self) -> MoxeResult<()>;
}

#[derive(Debug)]
enum Envelope {
    Contribution {
        members: Vec<usize>,
        generation: u64,
        from: usize,
        data: Vec<f32>,
    },
    Abort,
}

/// Per-rank bookkeeping, touched only by that rank's thread.
#[derive(Debug, Default)]
struct RankState {
    /// Next generation per member set.
    generations: HashMap<Vec<usize>, u64>,
    /// Contributions that arrived before this rank entered their collective.
    early: HashMap<(Vec<usize>, u64), BTreeMap<usize, Vec<f32>>>,
}

#[derive(Debug, Clone)]
struct AbortRecord {
    origin_rank: usize,
    step: Option<usize>,
    reason: String,
}

impl AbortRecord {
    fn to_error(&self) -> MoxeError {
        MoxeError::Aborted {
            origin_rank: self.origin_rank,
            step: self.step,
            reason: self.reason.clone(),
        }
    }
}

/// In-process collective fabric shared by all worker threads.
#[derive(Debug)]
pub struct LocalFabric {
    world_size: usize,
    timeout: Duration,
    senders: Vec<Sender<Envelope>>,
    receivers: Vec<Receiver<Envelope>>,
    ranks: Vec<Mutex<RankState>>,
    aborted: Mutex<Option<AbortRecord>>,
}

impl LocalFabric {
    pub fn new(world_size: usize, timeout: Duration) -> Arc<Self> {
        let (senders, receivers): (Vec<_>, Vec<_>) = (0..world_size).map(|_| unbounded()).unzip();
        Arc::new(Self {
            world_size,
            timeout,
            senders,
            receivers,
            ranks: (0..world_size).map(|_| Mutex::default()).collect(),
            aborted: Mutex::new(None),
        })
    }

    pub fn world_size(&self) -> usize {
        self.world_size
    }

    /// Handle for one rank.
    pub fn group(self: &Arc<Self>, rank: usize) -> LocalProcessGroup {
        LocalProcessGroup {
            fabric: Arc::clone(self),
            rank,
        }
    }

    /// Origin rank and reason of the abort, if any.
    pub fn abort_status(&self) -> Option<(usize, String)> {
        self.abort_record().map(|record| (record.origin_rank, record.reason))
    }

    fn abort_record(&self) -> Option<AbortRecord> {
        match self.aborted.lock() {
            Ok(record) => record.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn check_abort(&self) -> MoxeResult<()> {
        match self.abort_record() {
            Some(record) => Err(record.to_error()),
            None => Ok(()),
        }
    }

    /// Record the abort if it is the first, then wake every mailbox.
    /// Returns the abort that won.
    fn abort(&self, rank: usize, step: Option<usize>, reason: &str) -> AbortRecord {
        let mut slot = match self.aborted.lock() {
            Ok(slot) => slot,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(existing) = slot.as_ref() {
            return existing.clone();
        }
        error!(rank = rank, step = ?step, reason = reason, "Collective fabric aborted");
        let record = AbortRecord {
            origin_rank: rank,
            step,
            reason: reason.to_string(),
        };
        *slot = Some(record.clone());
        drop(slot);

        for sender in &self.senders {
            // The fabric holds every receiver, so sends cannot fail.
            let _ = sender.send(Envelope::Abort);
        }
        record
    }

    /// Abort on behalf of `rank`. A rank that loses the race to an earlier
    /// abort reports that abort instead of its own failure.
    fn fail(&self, rank: usize, message: String) -> MoxeError {
        let record = self.abort(rank, None, &message);
        if record.origin_rank == rank && record.reason == message {
            MoxeError::Collective {
                rank,
                step: None,
                message,
            }
        } else {
            record.to_error()
        }
    }

    fn rank_state(&self, rank: usize) -> MoxeResult<MutexGuard<'_, RankState>> {
        self.ranks[rank].lock().map_err(|_| MoxeError::Collective {
            rank,
            step: None,
            message: "rank state poisoned".to_string(),
        })
    }

    fn all_reduce_mean(&self, rank: usize, members: &[usize], buf: &mut [f32]) -> MoxeResult<()> {
        self.check_abort()?;
        if rank >= self.world_size {
            let message = format!("rank {} outside world size {}", rank, self.world_size);
            return Err(self.fail(rank, message));
        }

        let mut key = members.to_vec();
        key.sort_unstable();
        key.dedup();
        if key.len() != members.len() || key.binary_search(&rank).is_err() {
            let message = format!(
                "rank {} called a collective over invalid members {:?}",
                rank, members
            );
            return Err(self.fail(rank, message));
        }
        if let Some(&outside) = key.iter().find(|&&r| r >= self.world_size) {
            let message = format!("member rank {} outside world size {}", outside, self.world_size);
            return Err(self.fail(rank, message));
        }

        let mut state = self.rank_state(rank)?;
        let generation = {
            let next = state.generations.entry(key.clone()).or_insert(0);
            *next += 1;
            *next - 1
        };

        for &peer in key.iter().filter(|&&peer| peer != rank) {
            let envelope = Envelope::Contribution {
                members: key.clone(),
                generation,
                from: rank,
                data: buf.to_vec(),
            };
            if self.senders[peer].send(envelope).is_err() {
                return Err(self.fail(rank, format!("mailbox of rank {} is closed", peer)));
            }
        }

        let mut received = state
            .early
            .remove(&(key.clone(), generation))
            .unwrap_or_default();
        received.insert(rank, buf.to_vec());

        let deadline = Instant::now() + self.timeout;
        while received.len() < key.len() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.receivers[rank].recv_timeout(remaining) {
                Ok(Envelope::Abort) => self.check_abort()?,
                Ok(Envelope::Contribution {
                    members,
                    generation: g,
                    from,
                    data,
                }) => {
                    if members == key && g == generation {
                        received.insert(from, data);
                    } else {
                        state.early.entry((members, g)).or_default().insert(from, data);
                    }
                }
                Err(RecvTimeoutError::Timeout) => {
                    let missing: Vec<usize> = key
                        .iter()
                        .copied()
                        .filter(|r| !received.contains_key(r))
                        .collect();
                    let message = format!(
                        "timed out after {:?} waiting for members {:?} (missing {:?})",
                        self.timeout, key, missing
                    );
                    return Err(self.fail(rank, message));
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(self.fail(rank, "mailbox disconnected".to_string()));
                }
            }
        }

        if let Some((peer, data)) = received.iter().find(|(_, data)| data.len() != buf.len()) {
            let message = format!(
                "buffer length {} does not match rank {}'s {}",
                buf.len(),
                peer,
                data.len()
            );
            return Err(self.fail(rank, message));
        }

        // Sum in ascending rank order so every member gets identical bits.
        let mut sum = vec![0f32; buf.len()];
        for contribution in received.values() {
            for (acc, v) in sum.iter_mut().zip(contribution) {
                *acc += v;
            }
        }
        let n = key.len() as f32;
        for (out, v) in buf.iter_mut().zip(sum) {
            *out = v / n;
        }
        debug!(rank = rank, members = ?key, generation, "Collective complete");
        Ok(())
    }
}

/// One rank's handle on a [`LocalFabric`].
#[derive(Debug, Clone)]
pub struct LocalProcessGroup {
    fabric: Arc<LocalFabric>,
    rank: usize,
}

impl LocalProcessGroup {
    pub fn fabric(&self) -> &Arc<LocalFabric> {
        &self.fabric
    }
}

impl ProcessGroup for LocalProcessGroup {
    fn rank(&self) -> usize {
        self.rank
    }

    fn all_reduce_mean(&self, members: &[usize], buf: &mut [f32]) -> MoxeResult<()> {
        self.fabric.all_reduce_mean(self.rank, members, buf)
    }

    fn barrier(&self, members: &[usize]) -> MoxeResult<()> {
        self.fabric.all_reduce_mean(self.rank, members, &mut [])
    }

    fn abort(&self, step: Option<usize>, reason: &str) {
        self.fabric.abort(self.rank, step, reason);
    }

    fn check_abort(&self) -> MoxeResult<()> {
        self.fabric.check_abort()
    }
}
