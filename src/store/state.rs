//! Runtime state tracking and restart recovery.

use crate::Result;
use crate::types::{Job, Status};

use super::jobs::select_jobs;
use super::{JobRow, JobStore, query_failed};

/// What [`JobStore::recover_interrupted`] repaired
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Jobs found `downloading` and put back to `pending`
    pub reset_downloading: u64,
    /// Queue entries dropped because their job was gone or no longer runnable
    pub orphans_removed: u64,
    /// Pending jobs that had lost their queue entry and got a new one
    pub requeued: u64,
}

impl JobStore {
    /// Jobs a fresh process should pick up again: everything pending or
    /// downloading, in service order
    pub async fn get_jobs_to_resume(&self) -> Result<Vec<Job>> {
        let sql = select_jobs(
            "WHERE status IN (?, ?) ORDER BY priority DESC, created_at ASC, id ASC",
        );
        let rows = sqlx::query_as::<_, JobRow>(&sql)
            .bind(Status::Pending.to_i32())
            .bind(Status::Downloading.to_i32())
            .fetch_all(&self.pool)
            .await
            .map_err(|e| query_failed("Failed to list resumable jobs", e))?;

        rows.into_iter().map(Job::try_from).collect()
    }

    /// Check if the last shutdown was unclean
    ///
    /// Returns true if the previous session did not call set_clean_shutdown(),
    /// indicating a crash or forced termination.
    pub async fn was_unclean_shutdown(&self) -> Result<bool> {
        let value: Option<String> = sqlx::query_scalar(
            r#"
            SELECT value FROM runtime_state WHERE key = 'clean_shutdown'
            "#,
        )
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| query_failed("Failed to check shutdown state", e))?;

        // A store that has never been started counts as clean
        Ok(value.is_some_and(|v| v != "true"))
    }

    /// Mark that a queue has started on this store
    ///
    /// If set_clean_shutdown() is not called before the next startup,
    /// was_unclean_shutdown() will return true.
    pub async fn set_clean_start(&self) -> Result<()> {
        self.set_shutdown_flag("false").await
    }

    /// Mark that the queue is shutting down cleanly
    pub async fn set_clean_shutdown(&self) -> Result<()> {
        self.set_shutdown_flag("true").await
    }

    async fn set_shutdown_flag(&self, value: &str) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        sqlx::query(
            r#"
            INSERT INTO runtime_state (key, value, updated_at)
            VALUES ('clean_shutdown', ?, ?)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at
            "#,
        )
        .bind(value)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| query_failed("Failed to record shutdown state", e))?;

        Ok(())
    }

    /// Repair state left behind by a previous process
    ///
    /// A job stuck in `downloading` had its transfer killed with the process;
    /// it goes back to `pending` with its partial bytes kept. Queue entries
    /// are then made to match exactly the pending and downloading jobs:
    /// entries for anything else are dropped, and pending jobs without an
    /// entry get one keyed by their creation time so the original order is
    /// preserved.
    pub async fn recover_interrupted(&self) -> Result<RecoveryReport> {
        let pending = Status::Pending.to_i32();
        let downloading = Status::Downloading.to_i32();

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| query_failed("Failed to begin transaction", e))?;

        let reset_downloading = sqlx::query("UPDATE jobs SET status = ? WHERE status = ?")
            .bind(pending)
            .bind(downloading)
            .execute(&mut *tx)
            .await
            .map_err(|e| query_failed("Failed to reset interrupted jobs", e))?
            .rows_affected();

        let orphans_removed = sqlx::query(
            "DELETE FROM queue_entries WHERE job_id NOT IN (SELECT id FROM jobs WHERE status = ?)",
        )
        .bind(pending)
        .execute(&mut *tx)
        .await
        .map_err(|e| query_failed("Failed to drop orphan queue entries", e))?
        .rows_affected();

        let requeued = sqlx::query(
            r#"
            INSERT INTO queue_entries (job_id, priority, added_at, batch_id)
            SELECT id, priority, created_at, batch_id FROM jobs
            WHERE status = ? AND id NOT IN (SELECT job_id FROM queue_entries)
            ORDER BY created_at ASC, id ASC
            "#,
        )
        .bind(pending)
        .execute(&mut *tx)
        .await
        .map_err(|e| query_failed("Failed to re-queue pending jobs", e))?
        .rows_affected();

        tx.commit()
            .await
            .map_err(|e| query_failed("Failed to commit recovery", e))?;

        let report = RecoveryReport {
            reset_downloading,
            orphans_removed,
            requeued,
        };

        if report != RecoveryReport::default() {
            tracing::info!(
                reset_downloading,
                orphans_removed,
                requeued,
                "Recovered queue state from previous session"
            );
        }

        Ok(report)
    }
}
