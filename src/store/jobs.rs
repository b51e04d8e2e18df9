//! Job CRUD and guarded status transitions.

use crate::types::{Job, JobId, QueueEntry, Status};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use sqlx::SqliteConnection;

use super::queue::insert_entry;
use super::{
    JOB_COLUMNS, JobRow, JobStore, JobUpdate, NewJob, ProgressUpdate, query_failed, to_millis,
    truncate_millis,
};

/// Outcome of recording one failed transfer attempt
#[derive(Debug, Clone)]
pub struct FailedAttempt {
    /// The job after the attempt was recorded
    pub job: Job,
    /// True when the attempt used up the last retry and the job is now failed
    pub exhausted: bool,
}

pub(super) fn select_jobs(filter: &str) -> String {
    format!("SELECT {} FROM jobs {}", JOB_COLUMNS, filter)
}

pub(super) async fn fetch_job(conn: &mut SqliteConnection, id: JobId) -> Result<Option<Job>> {
    let sql = select_jobs("WHERE id = ?");
    let row = sqlx::query_as::<_, JobRow>(&sql)
        .bind(id)
        .fetch_optional(&mut *conn)
        .await
        .map_err(|e| query_failed("Failed to get job", e))?;

    row.map(Job::try_from).transpose()
}

async fn write_job(conn: &mut SqliteConnection, job: &Job) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE jobs SET
            status = ?, progress = ?, bytes_written = ?, file_size = ?,
            signed_url = ?, url_expires_at = ?, retry_count = ?,
            last_attempt_at = ?, next_retry_at = ?, priority = ?,
            catalog_entry_id = ?, started_at = ?, completed_at = ?, error = ?
        WHERE id = ?
        "#,
    )
    .bind(job.status.to_i32())
    .bind(job.progress)
    .bind(job.bytes_written as i64)
    .bind(job.file_size.map(|s| s as i64))
    .bind(&job.signed_url)
    .bind(job.url_expires_at.map(to_millis))
    .bind(job.retry_count as i64)
    .bind(job.last_attempt_at.map(to_millis))
    .bind(job.next_retry_at.map(to_millis))
    .bind(job.priority)
    .bind(&job.catalog_entry_id)
    .bind(job.started_at.map(to_millis))
    .bind(job.completed_at.map(to_millis))
    .bind(&job.error)
    .bind(job.id)
    .execute(&mut *conn)
    .await
    .map_err(|e| query_failed("Failed to update job", e))?;

    Ok(())
}

/// Apply the stats deltas and queue-entry cleanup implied by a status change
async fn record_transition(conn: &mut SqliteConnection, before: &Job, after: &Job) -> Result<()> {
    if before.status == after.status {
        return Ok(());
    }

    let counter = match after.status {
        Status::Completed => Some("completed"),
        Status::Failed => Some("failed"),
        Status::Cancelled => Some("cancelled"),
        _ => None,
    };
    if let Some(counter) = counter {
        let sql = format!("UPDATE stats SET {0} = {0} + 1 WHERE id = 1", counter);
        sqlx::query(&sql)
            .execute(&mut *conn)
            .await
            .map_err(|e| query_failed("Failed to update stats", e))?;
    }

    if after.status == Status::Completed {
        sqlx::query("UPDATE stats SET bytes_downloaded = bytes_downloaded + ? WHERE id = 1")
            .bind(after.bytes_written as i64)
            .execute(&mut *conn)
            .await
            .map_err(|e| query_failed("Failed to update stats", e))?;
    }

    // Queue entries only exist for jobs awaiting or undergoing processing
    if after.status.is_terminal() || after.status == Status::Paused {
        sqlx::query("DELETE FROM queue_entries WHERE job_id = ?")
            .bind(after.id)
            .execute(&mut *conn)
            .await
            .map_err(|e| query_failed("Failed to remove queue entry", e))?;
    }

    Ok(())
}

/// Outcome of [`JobStore::add_queued_job`]
#[derive(Debug, Clone)]
pub struct AddedJob {
    /// The new job, or the existing one that already owns the file
    pub job: Job,
    /// False when an existing job was returned
    pub created: bool,
}

async fn insert_job(conn: &mut SqliteConnection, new_job: &NewJob) -> Result<Job> {
    let now = to_millis(Utc::now());
    let metadata = serde_json::to_string(&new_job.metadata)?;

    let result = sqlx::query(
        r#"
        INSERT INTO jobs (
            remote_ref, file_name, local_path, status, progress,
            bytes_written, file_size, retry_count, priority, batch_id,
            catalog, metadata, created_at
        ) VALUES (?, ?, ?, ?, 0.0, 0, ?, 0, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&new_job.remote_ref)
    .bind(&new_job.file_name)
    .bind(new_job.local_path.to_string_lossy().into_owned())
    .bind(Status::Pending.to_i32())
    .bind(new_job.file_size.map(|s| s as i64))
    .bind(new_job.priority)
    .bind(&new_job.batch_id)
    .bind(new_job.catalog)
    .bind(&metadata)
    .bind(now)
    .execute(&mut *conn)
    .await
    .map_err(|e| query_failed("Failed to insert job", e))?;

    let id = JobId(result.last_insert_rowid());

    sqlx::query("UPDATE stats SET total_jobs = total_jobs + 1 WHERE id = 1")
        .execute(&mut *conn)
        .await
        .map_err(|e| query_failed("Failed to update stats", e))?;

    fetch_job(conn, id).await?.ok_or(Error::JobNotFound(id))
}

/// Newest job that owns `file_name`: any unfinished one, or a completed one if asked
async fn find_owner(
    conn: &mut SqliteConnection,
    file_name: &str,
    include_completed: bool,
) -> Result<Option<Job>> {
    let mut owners = vec![Status::Pending, Status::Downloading, Status::Paused];
    if include_completed {
        owners.push(Status::Completed);
    }
    let placeholders = vec!["?"; owners.len()].join(", ");
    let sql = select_jobs(&format!(
        "WHERE file_name = ? AND status IN ({placeholders}) ORDER BY id DESC LIMIT 1"
    ));

    let mut query = sqlx::query_as::<_, JobRow>(&sql).bind(file_name);
    for status in &owners {
        query = query.bind(status.to_i32());
    }
    let row = query
        .fetch_optional(&mut *conn)
        .await
        .map_err(|e| query_failed("Failed to look up job by file name", e))?;

    row.map(Job::try_from).transpose()
}

impl JobStore {
    /// Insert a new pending job and return it as stored
    ///
    /// Persisted before returning; increments the lifetime job counter in the
    /// same transaction.
    pub async fn add_job(&self, new_job: &NewJob) -> Result<Job> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| query_failed("Failed to begin transaction", e))?;

        let job = insert_job(&mut tx, new_job).await?;

        tx.commit()
            .await
            .map_err(|e| query_failed("Failed to commit job insert", e))?;

        Ok(job)
    }

    /// Insert a pending job with its queue entry, unless another job owns the file
    ///
    /// An unfinished job (pending, downloading or paused) with the same
    /// `file_name` always owns it; a completed one only with
    /// `include_completed`. Lookup and insert share one transaction on the
    /// store's single connection, so concurrent callers for one file name
    /// end up with one job.
    pub async fn add_queued_job(
        &self,
        new_job: &NewJob,
        include_completed: bool,
    ) -> Result<AddedJob> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| query_failed("Failed to begin transaction", e))?;

        if let Some(job) = find_owner(&mut tx, &new_job.file_name, include_completed).await? {
            return Ok(AddedJob {
                job,
                created: false,
            });
        }

        let job = insert_job(&mut tx, new_job).await?;
        insert_entry(&mut tx, &QueueEntry::for_job(&job)).await?;

        tx.commit()
            .await
            .map_err(|e| query_failed("Failed to commit job insert", e))?;

        Ok(AddedJob { job, created: true })
    }

    /// Get a job by ID
    pub async fn get_job(&self, id: JobId) -> Result<Option<Job>> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| query_failed("Failed to acquire connection", e))?;
        fetch_job(&mut conn, id).await
    }

    /// Snapshot of every job, oldest first
    pub async fn get_all_jobs(&self) -> Result<Vec<Job>> {
        let sql = select_jobs("ORDER BY created_at ASC, id ASC");
        let rows = sqlx::query_as::<_, JobRow>(&sql)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| query_failed("Failed to list jobs", e))?;

        rows.into_iter().map(Job::try_from).collect()
    }

    /// Jobs with a specific status, oldest first
    pub async fn get_jobs_by_status(&self, status: Status) -> Result<Vec<Job>> {
        let sql = select_jobs("WHERE status = ? ORDER BY created_at ASC, id ASC");
        let rows = sqlx::query_as::<_, JobRow>(&sql)
            .bind(status.to_i32())
            .fetch_all(&self.pool)
            .await
            .map_err(|e| query_failed("Failed to list jobs by status", e))?;

        rows.into_iter().map(Job::try_from).collect()
    }

    /// Jobs belonging to a batch, oldest first
    pub async fn get_jobs_by_batch(&self, batch_id: &str) -> Result<Vec<Job>> {
        let sql = select_jobs("WHERE batch_id = ? ORDER BY created_at ASC, id ASC");
        let rows = sqlx::query_as::<_, JobRow>(&sql)
            .bind(batch_id)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| query_failed("Failed to list jobs by batch", e))?;

        rows.into_iter().map(Job::try_from).collect()
    }

    /// Merge `update` into the stored job
    ///
    /// Status changes into completed, failed or cancelled bump the matching
    /// lifetime counter, and a job leaving the runnable states loses its queue
    /// entry, all within the same transaction.
    pub async fn update_job(&self, id: JobId, update: &JobUpdate) -> Result<Job> {
        self.apply_update(id, None, update)
            .await?
            .ok_or(Error::JobNotFound(id))
    }

    /// Merge `update` only if the job is currently in one of `allowed`
    ///
    /// Returns `Ok(None)` when the job exists but is in another state, so a
    /// stale writer never overwrites a transition made concurrently by a
    /// pause or cancel.
    pub async fn update_job_if(
        &self,
        id: JobId,
        allowed: &[Status],
        update: &JobUpdate,
    ) -> Result<Option<Job>> {
        self.apply_update(id, Some(allowed), update).await
    }

    async fn apply_update(
        &self,
        id: JobId,
        allowed: Option<&[Status]>,
        update: &JobUpdate,
    ) -> Result<Option<Job>> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| query_failed("Failed to begin transaction", e))?;

        let before = fetch_job(&mut tx, id).await?.ok_or(Error::JobNotFound(id))?;
        if let Some(allowed) = allowed
            && !allowed.contains(&before.status)
        {
            return Ok(None);
        }

        let mut after = before.clone();
        update.apply(&mut after);

        write_job(&mut tx, &after).await?;
        record_transition(&mut tx, &before, &after).await?;

        tx.commit()
            .await
            .map_err(|e| query_failed("Failed to commit job update", e))?;

        Ok(Some(after))
    }

    /// Lightweight progress write from a running transfer
    ///
    /// Only applies while the job is `downloading`, so a late tick can never
    /// overwrite a pause or cancel. Progress always tracks `bytes_written`:
    /// when a server refuses to resume and the transfer restarts from zero,
    /// both fall back together. Returns whether the row was updated.
    pub async fn update_progress(&self, id: JobId, update: &ProgressUpdate) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE jobs SET
                bytes_written = ?,
                file_size = COALESCE(?, file_size),
                progress = COALESCE(?, progress)
            WHERE id = ? AND status = ?
            "#,
        )
        .bind(update.bytes_written as i64)
        .bind(update.content_length.map(|s| s as i64))
        .bind(update.fraction())
        .bind(id)
        .bind(Status::Downloading.to_i32())
        .execute(&self.pool)
        .await
        .map_err(|e| query_failed("Failed to update progress", e))?;

        Ok(result.rows_affected() > 0)
    }

    /// Count one failed attempt and stamp the attempt time
    ///
    /// Returns the new retry count.
    pub async fn increment_retry(&self, id: JobId) -> Result<u32> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| query_failed("Failed to begin transaction", e))?;

        let result = sqlx::query(
            "UPDATE jobs SET retry_count = retry_count + 1, last_attempt_at = ? WHERE id = ?",
        )
        .bind(to_millis(Utc::now()))
        .bind(id)
        .execute(&mut *tx)
        .await
        .map_err(|e| query_failed("Failed to increment retry count", e))?;

        if result.rows_affected() == 0 {
            return Err(Error::JobNotFound(id));
        }

        sqlx::query("UPDATE stats SET total_retries = total_retries + 1 WHERE id = 1")
            .execute(&mut *tx)
            .await
            .map_err(|e| query_failed("Failed to update stats", e))?;

        let count: i64 = sqlx::query_scalar("SELECT retry_count FROM jobs WHERE id = ?")
            .bind(id)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| query_failed("Failed to read retry count", e))?;

        tx.commit()
            .await
            .map_err(|e| query_failed("Failed to commit retry increment", e))?;

        Ok(count.max(0) as u32)
    }

    /// Reset the retry count after an explicit user retry
    pub async fn reset_retry(&self, id: JobId) -> Result<()> {
        let result = sqlx::query(
            "UPDATE jobs SET retry_count = 0, next_retry_at = NULL, last_attempt_at = ? WHERE id = ?",
        )
        .bind(to_millis(Utc::now()))
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| query_failed("Failed to reset retry count", e))?;

        if result.rows_affected() == 0 {
            return Err(Error::JobNotFound(id));
        }

        Ok(())
    }

    /// Record a failed transfer attempt for a `downloading` job in one transaction
    ///
    /// Increments the retry count and the global retry counter. If the new
    /// count reaches `max_retries` the job becomes `failed` and leaves the
    /// queue; otherwise it goes back to `pending` with `next_retry_at` set and
    /// a fresh queue entry.
    /// Returns `Ok(None)` if the job was no longer downloading (paused or
    /// cancelled while the attempt ran).
    pub async fn record_failed_attempt(
        &self,
        id: JobId,
        error: &str,
        max_retries: u32,
        next_retry_at: Option<DateTime<Utc>>,
    ) -> Result<Option<FailedAttempt>> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| query_failed("Failed to begin transaction", e))?;

        let before = fetch_job(&mut tx, id).await?.ok_or(Error::JobNotFound(id))?;
        if before.status != Status::Downloading {
            return Ok(None);
        }

        let mut after = before.clone();
        after.retry_count = before.retry_count.saturating_add(1);
        after.last_attempt_at = Some(truncate_millis(Utc::now()));
        after.error = Some(error.to_string());

        let exhausted = after.retry_count >= max_retries;
        if exhausted {
            after.status = Status::Failed;
            after.next_retry_at = None;
        } else {
            after.status = Status::Pending;
            after.next_retry_at = next_retry_at.map(truncate_millis);
        }

        write_job(&mut tx, &after).await?;

        sqlx::query("UPDATE stats SET total_retries = total_retries + 1 WHERE id = 1")
            .execute(&mut *tx)
            .await
            .map_err(|e| query_failed("Failed to update stats", e))?;

        record_transition(&mut tx, &before, &after).await?;

        if !exhausted {
            insert_entry(&mut tx, &QueueEntry::for_job(&after)).await?;
        }

        tx.commit()
            .await
            .map_err(|e| query_failed("Failed to commit failed attempt", e))?;

        Ok(Some(FailedAttempt {
            job: after,
            exhausted,
        }))
    }

    /// Move a job from one of `from` back to `pending` and queue it, in one transaction
    ///
    /// Clears the retry delay and last error. With `reset_retry` the retry
    /// count starts over. Returns `Ok(None)` when the job is in another state.
    pub async fn reopen(
        &self,
        id: JobId,
        from: &[Status],
        reset_retry: bool,
    ) -> Result<Option<Job>> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| query_failed("Failed to begin transaction", e))?;

        let before = fetch_job(&mut tx, id).await?.ok_or(Error::JobNotFound(id))?;
        if !from.contains(&before.status) {
            return Ok(None);
        }

        let mut after = before.clone();
        after.status = Status::Pending;
        after.next_retry_at = None;
        after.error = None;
        if reset_retry {
            after.retry_count = 0;
        }

        write_job(&mut tx, &after).await?;
        record_transition(&mut tx, &before, &after).await?;
        insert_entry(&mut tx, &QueueEntry::for_job(&after)).await?;

        tx.commit()
            .await
            .map_err(|e| query_failed("Failed to commit reopen", e))?;

        Ok(Some(after))
    }

    /// Remove every completed job, returning the removed ids
    pub async fn clear_completed(&self) -> Result<Vec<JobId>> {
        self.clear_status(Status::Completed).await
    }

    /// Remove every failed job, returning the removed ids
    pub async fn clear_failed(&self) -> Result<Vec<JobId>> {
        self.clear_status(Status::Failed).await
    }

    async fn clear_status(&self, status: Status) -> Result<Vec<JobId>> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| query_failed("Failed to begin transaction", e))?;

        let ids: Vec<JobId> = sqlx::query_scalar("SELECT id FROM jobs WHERE status = ? ORDER BY id")
            .bind(status.to_i32())
            .fetch_all(&mut *tx)
            .await
            .map_err(|e| query_failed("Failed to list jobs to clear", e))?;

        if ids.is_empty() {
            return Ok(ids);
        }

        let stray = sqlx::query(
            "DELETE FROM queue_entries WHERE job_id IN (SELECT id FROM jobs WHERE status = ?)",
        )
        .bind(status.to_i32())
        .execute(&mut *tx)
        .await
        .map_err(|e| query_failed("Failed to remove queue entries", e))?
        .rows_affected();

        if stray > 0 {
            tracing::warn!(
                status = ?status,
                count = stray,
                "Removed queue entries that pointed at finished jobs"
            );
        }

        sqlx::query("DELETE FROM jobs WHERE status = ?")
            .bind(status.to_i32())
            .execute(&mut *tx)
            .await
            .map_err(|e| query_failed("Failed to clear jobs", e))?;

        tx.commit()
            .await
            .map_err(|e| query_failed("Failed to commit clear", e))?;

        tracing::debug!(status = ?status, count = ids.len(), "Cleared jobs");
        Ok(ids)
    }
}
