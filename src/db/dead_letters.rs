//! Dead-letter entry persistence.

use chrono::{DateTime, Utc};
use sqlx::{QueryBuilder, Sqlite};

use super::{Db, to_millis};
use crate::dead_letter::{DeadLetterEntry, DeadLetterFilter, DeadLetterId};
use crate::error::{Error, Result};

impl Db {
    pub async fn insert_dead_letter(&self, entry: &DeadLetterEntry) -> Result<()> {
        sqlx::query(
            "INSERT INTO dead_letters (id, job_id, tenant_id, class, body, enqueued_at_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )
        .bind(entry.id.to_string())
        .bind(entry.job.id.to_string())
        .bind(&entry.job.tenant_id)
        .bind(entry.class.to_string())
        .bind(serde_json::to_string(entry)?)
        .bind(to_millis(entry.enqueued_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_dead_letter(&self, id: DeadLetterId) -> Result<Option<DeadLetterEntry>> {
        let row: Option<(String,)> = sqlx::query_as("SELECT body FROM dead_letters WHERE id = ?1")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.map(|(body,)| serde_json::from_str(&body).map_err(Error::from))
            .transpose()
    }

    /// Entries matching `filter`, oldest first.
    pub async fn list_dead_letters(&self, filter: &DeadLetterFilter) -> Result<Vec<DeadLetterEntry>> {
        let mut query: QueryBuilder<Sqlite> =
            QueryBuilder::new("SELECT body FROM dead_letters WHERE 1 = 1");
        if let Some(job_id) = filter.job_id {
            query.push(" AND job_id = ").push_bind(job_id.to_string());
        }
        if let Some(tenant_id) = &filter.tenant_id {
            query.push(" AND tenant_id = ").push_bind(tenant_id.clone());
        }
        if let Some(class) = filter.class {
            query.push(" AND class = ").push_bind(class.to_string());
        }
        query.push(" ORDER BY enqueued_at_ms, rowid");
        if let Some(limit) = filter.limit {
            query.push(" LIMIT ").push_bind(i64::from(limit));
        }

        let rows: Vec<(String,)> = query.build_query_as().fetch_all(&self.pool).await?;
        rows.into_iter()
            .map(|(body,)| serde_json::from_str(&body).map_err(Error::from))
            .collect()
    }

    /// Returns false if the entry did not exist.
    pub async fn delete_dead_letter(&self, id: DeadLetterId) -> Result<bool> {
        let deleted = sqlx::query("DELETE FROM dead_letters WHERE id = ?1")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(deleted > 0)
    }

    pub async fn purge_dead_letters_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let purged = sqlx::query("DELETE FROM dead_letters WHERE enqueued_at_ms < ?1")
            .bind(to_millis(cutoff))
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(purged)
    }
}
