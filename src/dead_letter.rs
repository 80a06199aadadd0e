//! Dead-letter store: durable holding area for work items that could not
//! be completed.
//!
//! An entry snapshots the job header and the failed item with its full
//! attempt history and classified failure. Entries stay until an operator
//! retries or removes them, or until they age past the retention period.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use opentelemetry::KeyValue;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::db::Db;
use crate::error::{Error, Result};
use crate::model::failure::{AttemptRecord, ClassifiedError, FailureClass};
use crate::model::{JobContext, JobId, NewJob, WorkItem};
use crate::telemetry::metrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeadLetterId(pub Uuid);

impl DeadLetterId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for DeadLetterId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for DeadLetterId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for DeadLetterId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| Error::Other(format!("invalid dead-letter id {s}: {e}")))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub id: DeadLetterId,
    /// Job header at the time of failure.
    pub job: JobContext,
    /// The failed item, including its attempt history.
    pub item: WorkItem,
    pub class: FailureClass,
    /// The failure that ended the item.
    pub error: ClassifiedError,
    pub enqueued_at: DateTime<Utc>,
}

impl DeadLetterEntry {
    pub fn new(job: JobContext, item: WorkItem, error: ClassifiedError) -> Self {
        Self {
            id: DeadLetterId::new(),
            job,
            class: error.class,
            item,
            error,
            enqueued_at: Utc::now(),
        }
    }

    /// Calls made to the work function before giving up.
    pub fn attempts(&self) -> u32 {
        self.item.attempts
    }

    pub fn history(&self) -> &[AttemptRecord] {
        &self.item.history
    }

    /// A fresh job that re-runs the failed item with reset counters.
    ///
    /// The idempotency key is derived from the entry id, so retrying the
    /// same entry twice yields one job.
    pub fn to_new_job(&self) -> NewJob {
        NewJob::new(&self.job.kind, &self.job.tenant_id, &self.job.actor_id)
            .priority(self.job.priority)
            .payload(self.job.payload.clone())
            .item(self.item.payload.clone())
            .idempotency_key(format!("dead-letter:{}", self.id))
            .origin(self.id)
    }
}

/// Selection criteria for listing entries. Empty matches everything.
#[derive(Debug, Clone, Default)]
pub struct DeadLetterFilter {
    pub job_id: Option<JobId>,
    pub tenant_id: Option<String>,
    pub class: Option<FailureClass>,
    pub limit: Option<u32>,
}

pub struct DeadLetterStore {
    db: Arc<Db>,
    retention: Duration,
}

impl DeadLetterStore {
    pub fn new(db: Arc<Db>, retention: Duration) -> Self {
        Self { db, retention }
    }

    pub fn retention(&self) -> Duration {
        self.retention
    }

    pub async fn add(&self, entry: &DeadLetterEntry) -> Result<()> {
        self.db.insert_dead_letter(entry).await?;
        warn!(
            entry_id = %entry.id,
            job_id = %entry.job.id,
            item = entry.item.index,
            class = %entry.class,
            attempts = entry.attempts(),
            error = %entry.error.message,
            "work item dead-lettered"
        );
        metrics::dead_letters().add(1, &[KeyValue::new("class", entry.class.to_string())]);
        Ok(())
    }

    pub async fn list(&self, filter: &DeadLetterFilter) -> Result<Vec<DeadLetterEntry>> {
        self.db.list_dead_letters(filter).await
    }

    pub async fn get(&self, id: DeadLetterId) -> Result<DeadLetterEntry> {
        self.db
            .get_dead_letter(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("dead letter {id}")))
    }

    pub async fn remove(&self, id: DeadLetterId) -> Result<()> {
        if self.db.delete_dead_letter(id).await? {
            Ok(())
        } else {
            Err(Error::NotFound(format!("dead letter {id}")))
        }
    }

    /// Re-submit the entry as a fresh job via `submit`, then drop the
    /// entry. The entry is kept if submission fails.
    pub async fn retry<F, Fut>(&self, id: DeadLetterId, submit: F) -> Result<JobId>
    where
        F: FnOnce(NewJob) -> Fut,
        Fut: Future<Output = Result<JobId>>,
    {
        let entry = self.get(id).await?;
        let job_id = submit(entry.to_new_job()).await?;
        self.db.delete_dead_letter(id).await?;
        info!(entry_id = %id, %job_id, "dead letter resubmitted");
        Ok(job_id)
    }

    /// Delete entries older than the retention period.
    pub async fn purge_expired(&self) -> Result<u64> {
        self.purge_expired_at(Utc::now()).await
    }

    pub async fn purge_expired_at(&self, now: DateTime<Utc>) -> Result<u64> {
        let retention = chrono::Duration::from_std(self.retention)
            .map_err(|e| Error::Config(format!("dead-letter retention out of range: {e}")))?;
        let Some(cutoff) = now.checked_sub_signed(retention) else {
            return Ok(0);
        };
        let purged = self.db.purge_dead_letters_before(cutoff).await?;
        if purged > 0 {
            info!(purged, "expired dead letters purged");
        }
        Ok(purged)
    }
}
