//! Durable job storage for scripture-dl
//!
//! SQLite holds the three logical structures the queue needs to survive a
//! restart: the `jobs` table, the `queue_entries` ordering and the single-row
//! `stats` record. Every mutation runs in one transaction so a crash leaves
//! either the old or the new state, never a mix.
//!
//! ## Submodules
//!
//! Methods on [`JobStore`] are organized by domain:
//! - [`migrations`] - store lifecycle, schema migrations
//! - [`jobs`] - job CRUD and guarded status transitions
//! - [`queue`] - priority-ordered pending queue
//! - [`stats`] - aggregate counters and batch summaries
//! - [`state`] - runtime state (shutdown tracking) and restart recovery

use crate::error::DatabaseError;
use crate::types::{Job, JobId, JobMetadata, Status};
use crate::{Error, Result};
use chrono::{DateTime, TimeZone, Utc};
use sqlx::{FromRow, sqlite::SqlitePool};
use std::path::PathBuf;

mod jobs;
mod migrations;
mod queue;
mod state;
mod stats;

pub use jobs::{AddedJob, FailedAttempt};
pub use state::RecoveryReport;

/// New job to be inserted into the store
#[derive(Debug, Clone)]
pub struct NewJob {
    /// Opaque remote reference
    pub remote_ref: String,
    /// Destination file name
    pub file_name: String,
    /// Absolute destination path
    pub local_path: PathBuf,
    /// Higher values are serviced first
    pub priority: i32,
    /// Optional batch grouping key
    pub batch_id: Option<String>,
    /// Size hint supplied at enqueue
    pub file_size: Option<u64>,
    /// Whether the completed file goes to the media catalogue
    pub catalog: bool,
    /// Opaque metadata for the catalogue
    pub metadata: JobMetadata,
}

/// Partial update merged into a stored job
///
/// `None` leaves a field untouched. Fields that are themselves optional use
/// `Some(None)` to clear the stored value.
#[derive(Debug, Clone, Default)]
pub struct JobUpdate {
    /// New status
    pub status: Option<Status>,
    /// New progress, clamped to `[0, 1]`
    pub progress: Option<f64>,
    /// Bytes durably written
    pub bytes_written: Option<u64>,
    /// Total size
    pub file_size: Option<Option<u64>>,
    /// Cached signed URL
    pub signed_url: Option<Option<String>>,
    /// Signed URL expiry
    pub url_expires_at: Option<Option<DateTime<Utc>>>,
    /// Retry delay deadline
    pub next_retry_at: Option<Option<DateTime<Utc>>>,
    /// Queue priority
    pub priority: Option<i32>,
    /// Catalogue entry id
    pub catalog_entry_id: Option<Option<String>>,
    /// First transfer start
    pub started_at: Option<Option<DateTime<Utc>>>,
    /// Completion time
    pub completed_at: Option<Option<DateTime<Utc>>>,
    /// Last error message
    pub error: Option<Option<String>>,
}

impl JobUpdate {
    /// Update that only changes the status
    pub fn status(status: Status) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    /// Also set or clear the error message
    pub fn with_error(mut self, error: Option<String>) -> Self {
        self.error = Some(error);
        self
    }

    fn apply(&self, job: &mut Job) {
        if let Some(status) = self.status {
            job.status = status;
        }
        if let Some(progress) = self.progress {
            job.progress = clamp_progress(progress);
        }
        if let Some(bytes) = self.bytes_written {
            job.bytes_written = bytes;
        }
        if let Some(size) = self.file_size {
            job.file_size = size;
        }
        if let Some(url) = &self.signed_url {
            job.signed_url = url.clone();
        }
        if let Some(expires) = self.url_expires_at {
            job.url_expires_at = expires.map(truncate_millis);
        }
        if let Some(at) = self.next_retry_at {
            job.next_retry_at = at.map(truncate_millis);
        }
        if let Some(priority) = self.priority {
            job.priority = priority;
        }
        if let Some(entry) = &self.catalog_entry_id {
            job.catalog_entry_id = entry.clone();
        }
        if let Some(at) = self.started_at {
            job.started_at = at.map(truncate_millis);
        }
        if let Some(at) = self.completed_at {
            job.completed_at = at.map(truncate_millis);
        }
        if let Some(error) = &self.error {
            job.error = error.clone();
        }
    }
}

/// Byte-level progress reported by a running transfer
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ProgressUpdate {
    /// Bytes written to the local file so far
    pub bytes_written: u64,
    /// Total length, if the server reported it
    pub content_length: Option<u64>,
    /// Fraction complete; derived from the byte counts when absent
    pub progress: Option<f64>,
}

impl ProgressUpdate {
    fn fraction(&self) -> Option<f64> {
        match (self.progress, self.content_length) {
            (Some(p), _) => Some(clamp_progress(p)),
            (None, Some(total)) if total > 0 => {
                Some(clamp_progress(self.bytes_written as f64 / total as f64))
            }
            _ => None,
        }
    }
}

/// Job record as stored in SQLite
#[derive(Debug, Clone, FromRow)]
pub(crate) struct JobRow {
    pub id: i64,
    pub remote_ref: String,
    pub file_name: String,
    pub local_path: String,
    pub status: i32,
    pub progress: f64,
    pub bytes_written: i64,
    pub file_size: Option<i64>,
    pub signed_url: Option<String>,
    pub url_expires_at: Option<i64>,
    pub retry_count: i64,
    pub last_attempt_at: Option<i64>,
    pub next_retry_at: Option<i64>,
    pub priority: i32,
    pub batch_id: Option<String>,
    pub catalog: bool,
    pub catalog_entry_id: Option<String>,
    pub metadata: String,
    pub created_at: i64,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
    pub error: Option<String>,
}

pub(crate) const JOB_COLUMNS: &str = r#"
    id, remote_ref, file_name, local_path, status, progress, bytes_written,
    file_size, signed_url, url_expires_at, retry_count, last_attempt_at,
    next_retry_at, priority, batch_id, catalog, catalog_entry_id, metadata,
    created_at, started_at, completed_at, error
"#;

impl TryFrom<JobRow> for Job {
    type Error = Error;

    fn try_from(row: JobRow) -> Result<Self> {
        let status = Status::from_i32(row.status).ok_or_else(|| {
            Error::Database(DatabaseError::CorruptRecord(format!(
                "job {} has unknown status code {}",
                row.id, row.status
            )))
        })?;
        let metadata: JobMetadata = serde_json::from_str(&row.metadata).map_err(|e| {
            Error::Database(DatabaseError::CorruptRecord(format!(
                "job {} has unreadable metadata: {}",
                row.id, e
            )))
        })?;

        Ok(Job {
            id: JobId(row.id),
            remote_ref: row.remote_ref,
            file_name: row.file_name,
            local_path: PathBuf::from(row.local_path),
            status,
            progress: clamp_progress(row.progress),
            bytes_written: row.bytes_written.max(0) as u64,
            file_size: row.file_size.map(|s| s.max(0) as u64),
            signed_url: row.signed_url,
            url_expires_at: row.url_expires_at.map(from_millis).transpose()?,
            retry_count: row.retry_count.clamp(0, u32::MAX as i64) as u32,
            last_attempt_at: row.last_attempt_at.map(from_millis).transpose()?,
            next_retry_at: row.next_retry_at.map(from_millis).transpose()?,
            priority: row.priority,
            batch_id: row.batch_id,
            catalog: row.catalog,
            catalog_entry_id: row.catalog_entry_id,
            metadata,
            created_at: from_millis(row.created_at)?,
            started_at: row.started_at.map(from_millis).transpose()?,
            completed_at: row.completed_at.map(from_millis).transpose()?,
            error: row.error,
        })
    }
}

/// Persistent job store handle
///
/// Owns the SQLite pool. The pool holds a single connection: SQLite admits one
/// writer at a time, and funnelling every statement through one connection
/// keeps read-modify-write transactions from failing with `SQLITE_BUSY`.
pub struct JobStore {
    pool: SqlitePool,
}

pub(crate) fn clamp_progress(progress: f64) -> f64 {
    if progress.is_nan() {
        0.0
    } else {
        progress.clamp(0.0, 1.0)
    }
}

pub(crate) fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

pub(crate) fn from_millis(millis: i64) -> Result<DateTime<Utc>> {
    Utc.timestamp_millis_opt(millis).single().ok_or_else(|| {
        Error::Database(DatabaseError::CorruptRecord(format!(
            "timestamp {} out of range",
            millis
        )))
    })
}

/// Drop sub-millisecond precision so values read back compare equal to what was written
pub(crate) fn truncate_millis(at: DateTime<Utc>) -> DateTime<Utc> {
    from_millis(to_millis(at)).unwrap_or(at)
}

fn query_failed(context: &str, e: impl std::fmt::Display) -> Error {
    Error::Database(DatabaseError::QueryFailed(format!("{}: {}", context, e)))
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests;
