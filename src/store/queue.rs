//! Priority-ordered pending queue.
//!
//! Entries are ordered by `priority DESC, added_at ASC`, with the insertion
//! sequence as a final tie-break for entries added in the same millisecond.

use crate::error::DatabaseError;
use crate::types::{Job, JobId, QueueEntry, Status};
use crate::{Error, Result};
use chrono::Utc;
use sqlx::{FromRow, SqliteConnection};

use super::jobs::fetch_job;
use super::{JobStore, from_millis, query_failed, to_millis};

#[derive(Debug, FromRow)]
struct QueueEntryRow {
    job_id: i64,
    priority: i32,
    added_at: i64,
    batch_id: Option<String>,
}

impl TryFrom<QueueEntryRow> for QueueEntry {
    type Error = Error;

    fn try_from(row: QueueEntryRow) -> Result<Self> {
        Ok(QueueEntry {
            job_id: JobId(row.job_id),
            priority: row.priority,
            added_at: from_millis(row.added_at)?,
            batch_id: row.batch_id,
        })
    }
}

impl QueueEntry {
    /// Fresh entry for `job`, stamped now
    pub fn for_job(job: &Job) -> Self {
        Self {
            job_id: job.id,
            priority: job.priority,
            added_at: super::truncate_millis(Utc::now()),
            batch_id: job.batch_id.clone(),
        }
    }
}

/// Insert `entry` unless the job already has one; returns whether a row was added
pub(super) async fn insert_entry(conn: &mut SqliteConnection, entry: &QueueEntry) -> Result<bool> {
    let result = sqlx::query(
        r#"
        INSERT INTO queue_entries (job_id, priority, added_at, batch_id)
        VALUES (?, ?, ?, ?)
        ON CONFLICT(job_id) DO NOTHING
        "#,
    )
    .bind(entry.job_id)
    .bind(entry.priority)
    .bind(to_millis(entry.added_at))
    .bind(&entry.batch_id)
    .execute(&mut *conn)
    .await
    .map_err(|e| query_failed("Failed to enqueue job", e))?;

    Ok(result.rows_affected() > 0)
}

const ORDER: &str = "ORDER BY priority DESC, added_at ASC, seq ASC";

impl JobStore {
    /// Insert a queue entry for a pending or downloading job
    ///
    /// Returns `false` if the job already has an entry (the existing one, and
    /// its `added_at`, is kept). Fails with a constraint violation for jobs in
    /// any other state.
    pub async fn enqueue(&self, entry: &QueueEntry) -> Result<bool> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| query_failed("Failed to begin transaction", e))?;

        let job = fetch_job(&mut tx, entry.job_id)
            .await?
            .ok_or(Error::JobNotFound(entry.job_id))?;
        if !matches!(job.status, Status::Pending | Status::Downloading) {
            return Err(Error::Database(DatabaseError::ConstraintViolation(format!(
                "job {} is {:?} and cannot be queued",
                job.id, job.status
            ))));
        }

        let inserted = insert_entry(&mut tx, entry).await?;

        tx.commit()
            .await
            .map_err(|e| query_failed("Failed to commit enqueue", e))?;

        Ok(inserted)
    }

    /// Pop the highest-priority, oldest entry
    pub async fn dequeue_next(&self) -> Result<Option<QueueEntry>> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| query_failed("Failed to begin transaction", e))?;

        let sql = format!(
            "SELECT job_id, priority, added_at, batch_id FROM queue_entries {} LIMIT 1",
            ORDER
        );
        let row = sqlx::query_as::<_, QueueEntryRow>(&sql)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| query_failed("Failed to read queue head", e))?;

        let Some(row) = row else {
            return Ok(None);
        };

        sqlx::query("DELETE FROM queue_entries WHERE job_id = ?")
            .bind(row.job_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| query_failed("Failed to pop queue entry", e))?;

        tx.commit()
            .await
            .map_err(|e| query_failed("Failed to commit dequeue", e))?;

        QueueEntry::try_from(row).map(Some)
    }

    /// Remove a job's entry; returns whether one existed
    pub async fn remove_from_queue(&self, id: JobId) -> Result<bool> {
        let result = sqlx::query("DELETE FROM queue_entries WHERE job_id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| query_failed("Failed to remove queue entry", e))?;

        Ok(result.rows_affected() > 0)
    }

    /// All entries in service order
    pub async fn queue_entries(&self) -> Result<Vec<QueueEntry>> {
        let sql = format!(
            "SELECT job_id, priority, added_at, batch_id FROM queue_entries {}",
            ORDER
        );
        let rows = sqlx::query_as::<_, QueueEntryRow>(&sql)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| query_failed("Failed to list queue entries", e))?;

        rows.into_iter().map(QueueEntry::try_from).collect()
    }

    /// Whether `id` currently has a queue entry
    pub async fn is_queued(&self, id: JobId) -> Result<bool> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM queue_entries WHERE job_id = ?")
            .bind(id)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| query_failed("Failed to check queue entry", e))?;

        Ok(count > 0)
    }

    /// Number of entries in the queue
    pub async fn queue_len(&self) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM queue_entries")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| query_failed("Failed to count queue entries", e))?;

        Ok(count.max(0) as u64)
    }

    /// Change a job's priority and re-key its queue entry, keeping `added_at`
    pub async fn set_priority(&self, id: JobId, priority: i32) -> Result<Job> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| query_failed("Failed to begin transaction", e))?;

        let result = sqlx::query("UPDATE jobs SET priority = ? WHERE id = ?")
            .bind(priority)
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(|e| query_failed("Failed to update priority", e))?;
        if result.rows_affected() == 0 {
            return Err(Error::JobNotFound(id));
        }

        sqlx::query("UPDATE queue_entries SET priority = ? WHERE job_id = ?")
            .bind(priority)
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(|e| query_failed("Failed to re-key queue entry", e))?;

        let job = fetch_job(&mut tx, id).await?.ok_or(Error::JobNotFound(id))?;

        tx.commit()
            .await
            .map_err(|e| query_failed("Failed to commit priority change", e))?;

        Ok(job)
    }
}
