//! Ready queue.
//!
//! One FIFO per priority tier behind a single mutex, with a `Notify` to wake
//! blocked workers. Dequeue scans tiers from urgent to low and picks the
//! ready entry with the highest effective tier, oldest first within a tier.
//! Effective tier is the enqueued tier promoted one level for every
//! `aging_threshold` the entry has waited since it became ready.

use std::collections::{HashSet, VecDeque};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::trace;

use crate::model::{JobId, Priority};

/// A job handed to a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dispatch {
    pub job_id: JobId,
    /// Tier the job was enqueued at.
    pub tier: Priority,
    /// Tier after aging.
    pub effective: Priority,
}

#[derive(Debug)]
struct Entry {
    job_id: JobId,
    tier: Priority,
    seq: u64,
    ready_at: Instant,
}

/// A queue entry removed by [`PriorityScheduler::take`].
#[derive(Debug)]
pub(crate) struct Taken(Entry);

impl Entry {
    fn effective(&self, now: Instant, aging_threshold: Duration) -> Priority {
        if aging_threshold.is_zero() {
            return self.tier;
        }
        let waited = now.saturating_duration_since(self.ready_at);
        let levels = waited.as_nanos() / aging_threshold.as_nanos();
        self.tier.promoted(u32::try_from(levels).unwrap_or(u32::MAX))
    }
}

#[derive(Debug, Default)]
struct Queues {
    /// Indexed by `Priority::rank()`.
    tiers: [VecDeque<Entry>; 3],
    queued: HashSet<JobId>,
    next_seq: u64,
    closed: bool,
}

enum Pop {
    Ready(Dispatch),
    NotBefore(Instant),
    Empty,
}

impl Queues {
    fn pop(&mut self, now: Instant, aging_threshold: Duration) -> Pop {
        let mut best: Option<(usize, usize, Priority, u64)> = None;
        let mut earliest: Option<Instant> = None;

        for (t, tier) in self.tiers.iter().enumerate() {
            for (i, entry) in tier.iter().enumerate() {
                if entry.ready_at > now {
                    earliest = Some(earliest.map_or(entry.ready_at, |e| e.min(entry.ready_at)));
                    continue;
                }
                let effective = entry.effective(now, aging_threshold);
                let better = match best {
                    None => true,
                    Some((_, _, best_tier, best_seq)) => {
                        effective > best_tier || (effective == best_tier && entry.seq < best_seq)
                    }
                };
                if better {
                    best = Some((t, i, effective, entry.seq));
                }
            }
        }

        match best {
            Some((t, i, effective, _)) => match self.tiers[t].remove(i) {
                Some(entry) => {
                    self.queued.remove(&entry.job_id);
                    Pop::Ready(Dispatch {
                        job_id: entry.job_id,
                        tier: entry.tier,
                        effective,
                    })
                }
                None => Pop::Empty,
            },
            None => earliest.map_or(Pop::Empty, Pop::NotBefore),
        }
    }

    fn len(&self) -> usize {
        self.tiers.iter().map(VecDeque::len).sum()
    }
}

pub struct PriorityScheduler {
    queues: Mutex<Queues>,
    notify: Notify,
    aging_threshold: Duration,
}

impl PriorityScheduler {
    pub fn new(aging_threshold: Duration) -> Self {
        Self {
            queues: Mutex::new(Queues::default()),
            notify: Notify::new(),
            aging_threshold,
        }
    }

    /// Add a job, ready now. Returns false if it is already queued or the
    /// scheduler is closed.
    pub fn enqueue(&self, job_id: JobId, tier: Priority) -> bool {
        self.enqueue_at(job_id, tier, Instant::now())
    }

    /// Add a job that may not be dispatched before `ready_at`.
    pub fn enqueue_at(&self, job_id: JobId, tier: Priority, ready_at: Instant) -> bool {
        {
            let mut queues = self.queues.lock();
            if queues.closed || !queues.queued.insert(job_id) {
                return false;
            }
            let seq = queues.next_seq;
            queues.next_seq += 1;
            queues.tiers[tier.rank() as usize].push_back(Entry {
                job_id,
                tier,
                seq,
                ready_at,
            });
        }
        trace!(%job_id, %tier, "enqueued");
        self.notify.notify_one();
        true
    }

    /// Block until a job is ready. `None` once the scheduler is closed.
    pub async fn dequeue(&self) -> Option<Dispatch> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let wake_at = {
                let mut queues = self.queues.lock();
                if queues.closed {
                    return None;
                }
                match queues.pop(Instant::now(), self.aging_threshold) {
                    Pop::Ready(dispatch) => {
                        if queues.len() > 0 {
                            // Pass the wakeup on to the next idle worker.
                            self.notify.notify_one();
                        }
                        return Some(dispatch);
                    }
                    Pop::NotBefore(at) => Some(at),
                    Pop::Empty => None,
                }
            };

            match wake_at {
                Some(at) => {
                    tokio::select! {
                        _ = &mut notified => {}
                        _ = tokio::time::sleep_until(at) => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Non-blocking dequeue as of `now`.
    pub fn try_dequeue_at(&self, now: Instant) -> Option<Dispatch> {
        match self.queues.lock().pop(now, self.aging_threshold) {
            Pop::Ready(dispatch) => Some(dispatch),
            Pop::NotBefore(_) | Pop::Empty => None,
        }
    }

    /// Take a job out of the queue. False if it was not queued.
    pub fn remove(&self, job_id: JobId) -> bool {
        self.take(job_id).is_some()
    }

    /// Take a job out of the queue, keeping its place so that
    /// [`restore`](Self::restore) can put it back where it was.
    pub(crate) fn take(&self, job_id: JobId) -> Option<Taken> {
        let mut queues = self.queues.lock();
        if !queues.queued.remove(&job_id) {
            return None;
        }
        queues.tiers.iter_mut().find_map(|tier| {
            let pos = tier.iter().position(|e| e.job_id == job_id)?;
            tier.remove(pos).map(Taken)
        })
    }

    /// Undo a [`take`](Self::take). The entry keeps its sequence number and
    /// ready time, so FIFO order and aging are unaffected.
    pub(crate) fn restore(&self, taken: Taken) {
        let Taken(entry) = taken;
        {
            let mut queues = self.queues.lock();
            if queues.closed || !queues.queued.insert(entry.job_id) {
                return;
            }
            let tier = &mut queues.tiers[entry.tier.rank() as usize];
            let pos = tier.partition_point(|e| e.seq < entry.seq);
            tier.insert(pos, entry);
        }
        self.notify.notify_one();
    }

    pub fn contains(&self, job_id: JobId) -> bool {
        self.queues.lock().queued.contains(&job_id)
    }

    pub fn len(&self) -> usize {
        self.queues.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop dispatching. Blocked and future `dequeue` calls return `None`;
    /// queued entries stay where they are.
    pub fn close(&self) {
        self.queues.lock().closed = true;
        self.notify.notify_waiters();
    }
}
