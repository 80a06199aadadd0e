//! Job snapshots. Each write replaces the whole job record and appends its
//! events in the same transaction.

use chrono::{DateTime, Utc};

use super::{Db, to_millis};
use crate::error::{Error, Result};
use crate::event::{EventKind, JobEvent};
use crate::model::{Job, JobId, JobState};

impl Db {
    /// Upsert `job` and append `events`, atomically. Returns the stored
    /// events with their sequence numbers.
    pub async fn save_job(&self, job: &Job, events: &[(EventKind, String)]) -> Result<Vec<JobEvent>> {
        let body = serde_json::to_string(job)?;
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO jobs (id, idempotency_key, kind, state, priority, effective_priority, tenant_id, actor_id, body, submitted_at_ms, updated_at_ms, finished_at_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
             ON CONFLICT (id) DO UPDATE SET
                state = excluded.state,
                effective_priority = excluded.effective_priority,
                body = excluded.body,
                updated_at_ms = excluded.updated_at_ms,
                finished_at_ms = excluded.finished_at_ms",
        )
        .bind(job.id.to_string())
        .bind(job.idempotency_key.as_deref())
        .bind(&job.kind)
        .bind(job.state.to_string())
        .bind(job.priority.to_string())
        .bind(job.effective_priority.to_string())
        .bind(&job.tenant_id)
        .bind(&job.actor_id)
        .bind(&body)
        .bind(to_millis(job.submitted_at))
        .bind(to_millis(job.updated_at))
        .bind(job.finished_at.map(to_millis))
        .execute(&mut *tx)
        .await?;

        let mut stored = Vec::with_capacity(events.len());
        for (kind, detail) in events {
            let seq = Self::insert_event(&mut tx, job.id, job.updated_at, kind, detail).await?;
            stored.push(JobEvent {
                seq,
                job_id: job.id,
                timestamp: job.updated_at,
                kind: kind.clone(),
                detail: detail.clone(),
            });
        }

        tx.commit().await?;
        Ok(stored)
    }

    /// Get a job by id.
    pub async fn get_job(&self, id: JobId) -> Result<Job> {
        let body: Option<(String,)> = sqlx::query_as("SELECT body FROM jobs WHERE id = ?1")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        let (body,) = body.ok_or_else(|| Error::NotFound(format!("job {id}")))?;
        Ok(serde_json::from_str(&body)?)
    }

    /// The job holding an idempotency key, if any.
    pub async fn find_job_by_idempotency_key(&self, key: &str) -> Result<Option<JobId>> {
        let row: Option<(String,)> = sqlx::query_as("SELECT id FROM jobs WHERE idempotency_key = ?1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|(id,)| id.parse()).transpose()
    }

    /// Jobs in submission order, optionally filtered by state.
    pub async fn list_jobs(&self, state: Option<JobState>) -> Result<Vec<Job>> {
        let rows: Vec<(String,)> = match state {
            Some(state) => {
                sqlx::query_as(
                    "SELECT body FROM jobs WHERE state = ?1 ORDER BY submitted_at_ms, rowid",
                )
                .bind(state.to_string())
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as("SELECT body FROM jobs ORDER BY submitted_at_ms, rowid")
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        rows.into_iter()
            .map(|(body,)| serde_json::from_str(&body).map_err(Error::from))
            .collect()
    }

    /// Jobs not yet in a terminal state, in submission order.
    pub async fn list_unfinished_jobs(&self) -> Result<Vec<Job>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT body FROM jobs
             WHERE state NOT IN ('completed', 'canceled', 'failed')
             ORDER BY submitted_at_ms, rowid",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|(body,)| serde_json::from_str(&body).map_err(Error::from))
            .collect()
    }

    /// Terminal jobs that finished before `cutoff`.
    pub async fn finished_jobs_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<JobId>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT id FROM jobs WHERE finished_at_ms IS NOT NULL AND finished_at_ms < ?1",
        )
        .bind(to_millis(cutoff))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(|(id,)| id.parse()).collect()
    }

    /// Delete a job and its event log. Returns false if it did not exist.
    pub async fn delete_job(&self, id: JobId) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM job_events WHERE job_id = ?1")
            .bind(id.to_string())
            .execute(&mut *tx)
            .await?;
        let deleted = sqlx::query("DELETE FROM jobs WHERE id = ?1")
            .bind(id.to_string())
            .execute(&mut *tx)
            .await?
            .rows_affected();
        tx.commit().await?;
        Ok(deleted > 0)
    }
}
