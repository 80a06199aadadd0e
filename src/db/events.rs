//! The append-only job event log.

use chrono::{DateTime, Utc};
use sqlx::{Sqlite, Transaction};
use tracing::warn;

use super::{Db, from_millis, to_millis};
use crate::error::Result;
use crate::event::{EventKind, JobEvent};
use crate::model::JobId;

impl Db {
    /// Append one event outside of a job write.
    pub async fn append_event(
        &self,
        job_id: JobId,
        timestamp: DateTime<Utc>,
        kind: &EventKind,
        detail: &str,
    ) -> Result<JobEvent> {
        let mut tx = self.pool.begin().await?;
        let seq = Self::insert_event(&mut tx, job_id, timestamp, kind, detail).await?;
        tx.commit().await?;
        Ok(JobEvent {
            seq,
            job_id,
            timestamp,
            kind: kind.clone(),
            detail: detail.to_string(),
        })
    }

    pub(super) async fn insert_event(
        tx: &mut Transaction<'_, Sqlite>,
        job_id: JobId,
        timestamp: DateTime<Utc>,
        kind: &EventKind,
        detail: &str,
    ) -> Result<u64> {
        let body = serde_json::to_string(kind)?;
        let seq = sqlx::query(
            "INSERT INTO job_events (job_id, timestamp_ms, kind, body, detail)
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(job_id.to_string())
        .bind(to_millis(timestamp))
        .bind(kind.name())
        .bind(&body)
        .bind(detail)
        .execute(&mut **tx)
        .await?
        .last_insert_rowid();
        Ok(seq as u64)
    }

    /// A job's events in the order they were written.
    pub async fn events_for_job(&self, job_id: JobId) -> Result<Vec<JobEvent>> {
        let rows: Vec<EventRow> = sqlx::query_as(
            "SELECT seq, job_id, timestamp_ms, body, detail FROM job_events
             WHERE job_id = ?1 ORDER BY seq",
        )
        .bind(job_id.to_string())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(EventRow::try_into_event).collect()
    }

    /// Events across all jobs with `seq > after`, oldest first.
    pub async fn events_since(&self, after: u64, limit: u32) -> Result<Vec<JobEvent>> {
        let rows: Vec<EventRow> = sqlx::query_as(
            "SELECT seq, job_id, timestamp_ms, body, detail FROM job_events
             WHERE seq > ?1 ORDER BY seq LIMIT ?2",
        )
        .bind(after as i64)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(EventRow::try_into_event).collect()
    }
}

#[derive(sqlx::FromRow)]
struct EventRow {
    seq: i64,
    job_id: String,
    timestamp_ms: i64,
    body: String,
    detail: String,
}

impl EventRow {
    fn try_into_event(self) -> Result<JobEvent> {
        let kind = serde_json::from_str(&self.body).unwrap_or_else(|e| {
            warn!(seq = self.seq, error = %e, "unparseable job event");
            EventKind::Unknown {
                raw: self.body.clone(),
            }
        });
        Ok(JobEvent {
            seq: self.seq as u64,
            job_id: self.job_id.parse()?,
            timestamp: from_millis(self.timestamp_ms),
            kind,
            detail: self.detail,
        })
    }
}
