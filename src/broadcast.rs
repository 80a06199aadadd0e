//! Fan-out of job updates to subscribers.
//!
//! Each live job owns a bounded `tokio::sync::broadcast` channel; a second
//! firehose channel carries every update. Publishing never fails: a send
//! with no receivers, or a lagging receiver, is logged and dropped. When a
//! job reaches a terminal state its channel is closed after the final
//! update, which ends every subscriber's stream.

use std::collections::HashMap;

use parking_lot::RwLock;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::event::JobUpdate;
use crate::model::JobId;

pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

pub struct ProgressBroadcaster {
    channels: RwLock<HashMap<JobId, broadcast::Sender<JobUpdate>>>,
    firehose: broadcast::Sender<JobUpdate>,
    capacity: usize,
}

impl Default for ProgressBroadcaster {
    fn default() -> Self {
        Self::new(DEFAULT_CHANNEL_CAPACITY)
    }
}

impl ProgressBroadcaster {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (firehose, _) = broadcast::channel(capacity);
        Self {
            channels: RwLock::new(HashMap::new()),
            firehose,
            capacity,
        }
    }

    /// Open the channel for a job. Idempotent.
    pub fn open(&self, job_id: JobId) {
        self.channels
            .write()
            .entry(job_id)
            .or_insert_with(|| broadcast::channel(self.capacity).0);
    }

    /// Subscribe to one job. Returns `None` if the job has no open channel
    /// (unknown, or already terminal).
    pub fn subscribe(&self, job_id: JobId) -> Option<JobSubscription> {
        self.channels
            .read()
            .get(&job_id)
            .map(|tx| JobSubscription::new(tx.subscribe()))
    }

    /// Subscribe to every job's updates.
    pub fn subscribe_all(&self) -> JobSubscription {
        JobSubscription::new(self.firehose.subscribe())
    }

    /// Deliver an update. Closes the job's channel after a terminal update.
    pub fn publish(&self, update: JobUpdate) {
        let job_id = update.job_id();
        let terminal = update.is_terminal();

        if let Some(tx) = self.channels.read().get(&job_id) {
            if tx.send(update.clone()).is_err() {
                debug!(%job_id, "no job subscribers, update dropped");
            }
        }
        // The firehose usually has nobody listening.
        let _ = self.firehose.send(update);

        if terminal {
            self.close(job_id);
        }
    }

    /// Drop the job's sender. Receivers drain buffered updates, then end.
    pub fn close(&self, job_id: JobId) {
        self.channels.write().remove(&job_id);
    }

    pub fn subscriber_count(&self, job_id: JobId) -> usize {
        self.channels
            .read()
            .get(&job_id)
            .map_or(0, broadcast::Sender::receiver_count)
    }
}

/// A stream of updates. `recv` yields `None` once the stream has closed.
pub struct JobSubscription {
    rx: broadcast::Receiver<JobUpdate>,
}

impl JobSubscription {
    fn new(rx: broadcast::Receiver<JobUpdate>) -> Self {
        Self { rx }
    }

    /// A subscription that is already closed, for jobs past their end.
    pub(crate) fn closed() -> Self {
        let (tx, rx) = broadcast::channel(1);
        drop(tx);
        Self { rx }
    }

    /// Next update in emission order. Updates missed by a slow subscriber
    /// are skipped with a warning rather than ending the stream.
    pub async fn recv(&mut self) -> Option<JobUpdate> {
        loop {
            match self.rx.recv().await {
                Ok(update) => return Some(update),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "subscriber lagged, skipping updates");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking variant of [`recv`](Self::recv). `None` when nothing is
    /// buffered or the stream has closed.
    pub fn try_recv(&mut self) -> Option<JobUpdate> {
        loop {
            match self.rx.try_recv() {
                Ok(update) => return Some(update),
                Err(broadcast::error::TryRecvError::Lagged(missed)) => {
                    warn!(missed, "subscriber lagged, skipping updates");
                }
                Err(_) => return None,
            }
        }
    }
}
