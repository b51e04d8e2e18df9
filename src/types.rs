//! Core types for scripture-dl

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Opaque key-value bag carried from enqueue through to the media catalogue.
///
/// The queue stores and returns it verbatim and never looks inside.
pub type JobMetadata = BTreeMap<String, serde_json::Value>;

/// Unique identifier for a download job
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub i64);

impl From<i64> for JobId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

impl From<JobId> for i64 {
    fn from(id: JobId) -> Self {
        id.0
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for JobId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.parse()?))
    }
}

// Implement sqlx Type, Encode, and Decode for database operations
impl sqlx::Type<sqlx::Sqlite> for JobId {
    fn type_info() -> sqlx::sqlite::SqliteTypeInfo {
        <i64 as sqlx::Type<sqlx::Sqlite>>::type_info()
    }

    fn compatible(ty: &sqlx::sqlite::SqliteTypeInfo) -> bool {
        <i64 as sqlx::Type<sqlx::Sqlite>>::compatible(ty)
    }
}

impl<'q> sqlx::Encode<'q, sqlx::Sqlite> for JobId {
    fn encode_by_ref(
        &self,
        buf: &mut Vec<sqlx::sqlite::SqliteArgumentValue<'q>>,
    ) -> Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync>> {
        sqlx::Encode::<sqlx::Sqlite>::encode_by_ref(&self.0, buf)
    }
}

impl<'r> sqlx::Decode<'r, sqlx::Sqlite> for JobId {
    fn decode(value: sqlx::sqlite::SqliteValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let id = <i64 as sqlx::Decode<sqlx::Sqlite>>::decode(value)?;
        Ok(Self(id))
    }
}

/// Job status
///
/// ```text
/// pending -> downloading -> completed
///                        -> pending   (failed attempt, retries left)
///                        -> failed    (retries exhausted)
///                        -> paused    -> pending (resume)
/// pending/downloading/paused -> cancelled
/// failed -> pending (explicit retry)
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    /// Waiting for a processing pass
    Pending,
    /// A transfer is in flight
    Downloading,
    /// Stopped by the user, partial file kept
    Paused,
    /// File fully downloaded
    Completed,
    /// Retries exhausted
    Failed,
    /// Stopped by the user, partial file deleted
    Cancelled,
}

impl Status {
    /// All statuses, in storage-code order
    pub const ALL: [Status; 6] = [
        Status::Pending,
        Status::Downloading,
        Status::Paused,
        Status::Completed,
        Status::Failed,
        Status::Cancelled,
    ];

    /// Convert integer status code to Status enum
    pub fn from_i32(status: i32) -> Option<Self> {
        match status {
            0 => Some(Status::Pending),
            1 => Some(Status::Downloading),
            2 => Some(Status::Paused),
            3 => Some(Status::Completed),
            4 => Some(Status::Failed),
            5 => Some(Status::Cancelled),
            _ => None,
        }
    }

    /// Convert Status enum to integer status code
    pub fn to_i32(&self) -> i32 {
        match self {
            Status::Pending => 0,
            Status::Downloading => 1,
            Status::Paused => 2,
            Status::Completed => 3,
            Status::Failed => 4,
            Status::Cancelled => 5,
        }
    }

    /// Lowercase name, as used in serialized form
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Pending => "pending",
            Status::Downloading => "downloading",
            Status::Paused => "paused",
            Status::Completed => "completed",
            Status::Failed => "failed",
            Status::Cancelled => "cancelled",
        }
    }

    /// Completed, failed and cancelled jobs are never picked up automatically
    pub fn is_terminal(&self) -> bool {
        matches!(self, Status::Completed | Status::Failed | Status::Cancelled)
    }

    /// Jobs that still hold (or may hold) a local partial file
    pub fn is_unfinished(&self) -> bool {
        matches!(self, Status::Pending | Status::Downloading | Status::Paused)
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One requested download and its lifecycle state
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Unique id, assigned at enqueue time
    pub id: JobId,
    /// Opaque reference to the remote resource (URL or internal path)
    pub remote_ref: String,
    /// Destination file name inside the downloads directory
    pub file_name: String,
    /// Absolute destination path derived from the downloads directory
    pub local_path: PathBuf,
    /// Current status
    pub status: Status,
    /// Fraction complete in `[0, 1]`
    pub progress: f64,
    /// Bytes durably written to the local file
    pub bytes_written: u64,
    /// Total size, once known
    pub file_size: Option<u64>,
    /// Cached fetch URL
    pub signed_url: Option<String>,
    /// When `signed_url` stops working
    pub url_expires_at: Option<DateTime<Utc>>,
    /// Failed attempts so far
    pub retry_count: u32,
    /// When the last attempt failed
    pub last_attempt_at: Option<DateTime<Utc>>,
    /// Earliest time the scheduler will try again
    pub next_retry_at: Option<DateTime<Utc>>,
    /// Higher values are serviced first
    pub priority: i32,
    /// Grouping key for jobs enqueued together
    pub batch_id: Option<String>,
    /// Hand the finished file to the media catalogue
    pub catalog: bool,
    /// Entry id returned by the catalogue after a successful add
    pub catalog_entry_id: Option<String>,
    /// Caller-supplied metadata passed through to the catalogue
    pub metadata: JobMetadata,
    /// When the job was created
    pub created_at: DateTime<Utc>,
    /// When the first transfer started
    pub started_at: Option<DateTime<Utc>>,
    /// When the download completed
    pub completed_at: Option<DateTime<Utc>>,
    /// Last error message
    pub error: Option<String>,
}

impl Job {
    /// Whether the cached signed URL can still be used at `now`.
    ///
    /// A URL that expires within `margin` counts as expired so a transfer does
    /// not start on a link that dies mid-stream.
    pub fn has_valid_url(&self, now: DateTime<Utc>, margin: chrono::Duration) -> bool {
        match (&self.signed_url, self.url_expires_at) {
            (Some(_), Some(expires_at)) => expires_at - margin > now,
            (Some(_), None) => true,
            _ => false,
        }
    }

    /// Whether the job is still waiting out a retry delay at `now`
    pub fn is_backing_off(&self, now: DateTime<Utc>) -> bool {
        self.next_retry_at.is_some_and(|at| at > now)
    }
}

/// Pointer into the pending-work ordering
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueEntry {
    /// Job this entry points at
    pub job_id: JobId,
    /// Copied from the job; higher first
    pub priority: i32,
    /// Tie-break, older first
    pub added_at: DateTime<Utc>,
    /// Copied from the job
    pub batch_id: Option<String>,
}

/// Options accepted by enqueue
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct EnqueueOptions {
    /// Higher values are serviced first (default: 0)
    #[serde(default)]
    pub priority: i32,
    /// Explicit batch id; batch enqueue generates one when absent
    #[serde(default)]
    pub batch_id: Option<String>,
    /// Size hint, if the caller already knows it
    #[serde(default)]
    pub file_size: Option<u64>,
    /// Hand the finished file to the media catalogue
    #[serde(default)]
    pub catalog: bool,
    /// Opaque metadata passed through to the catalogue
    #[serde(default)]
    pub metadata: JobMetadata,
}

/// One file in a batch enqueue
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BatchFile {
    /// Remote reference
    pub remote_ref: String,
    /// Destination file name
    pub file_name: String,
    /// Size hint
    #[serde(default)]
    pub file_size: Option<u64>,
}

impl BatchFile {
    /// Create a batch entry without a size hint
    pub fn new(remote_ref: impl Into<String>, file_name: impl Into<String>) -> Self {
        Self {
            remote_ref: remote_ref.into(),
            file_name: file_name.into(),
            file_size: None,
        }
    }
}

/// Filter for listing jobs
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct JobFilter {
    /// Only jobs in this status
    pub status: Option<Status>,
    /// Only jobs in this batch
    pub batch_id: Option<String>,
}

impl JobFilter {
    /// Filter by status
    pub fn status(status: Status) -> Self {
        Self {
            status: Some(status),
            batch_id: None,
        }
    }

    /// Filter by batch
    pub fn batch(batch_id: impl Into<String>) -> Self {
        Self {
            status: None,
            batch_id: Some(batch_id.into()),
        }
    }

    /// Whether `job` passes this filter
    pub fn matches(&self, job: &Job) -> bool {
        self.status.is_none_or(|s| job.status == s)
            && self
                .batch_id
                .as_deref()
                .is_none_or(|b| job.batch_id.as_deref() == Some(b))
    }
}

/// Aggregate statistics
///
/// `total_jobs`, `completed`, `failed`, `cancelled`, `total_retries` and
/// `bytes_downloaded` are lifetime counters maintained in the same transaction
/// as the transition that changes them; clearing jobs does not lower them.
/// The remaining fields are live counts.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    /// Jobs ever added
    pub total_jobs: u64,
    /// Transitions into `completed`
    pub completed: u64,
    /// Transitions into `failed`
    pub failed: u64,
    /// Transitions into `cancelled`
    pub cancelled: u64,
    /// Failed attempts recorded across all jobs
    pub total_retries: u64,
    /// Bytes of completed downloads
    pub bytes_downloaded: u64,
    /// Jobs currently pending
    pub pending: u64,
    /// Jobs currently downloading
    pub downloading: u64,
    /// Jobs currently paused
    pub paused: u64,
    /// Entries currently in the pending queue
    pub queue_length: u64,
}

/// Aggregated view of one batch for grouped UI reporting
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchSummary {
    /// Batch id
    pub batch_id: String,
    /// Number of jobs in the batch
    pub total: usize,
    /// Jobs per status
    pub by_status: BTreeMap<String, usize>,
    /// Bytes written across the batch
    pub bytes_written: u64,
    /// Sum of known file sizes
    pub known_size: u64,
    /// Mean progress of all jobs in the batch
    pub progress: f64,
}

impl BatchSummary {
    /// Whether every job in the batch reached `completed`
    pub fn is_complete(&self) -> bool {
        self.total > 0 && self.by_status.get("completed").copied() == Some(self.total)
    }
}

/// What one processing pass did
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessSummary {
    /// Jobs for which a transfer was started
    pub started: usize,
    /// Jobs that reached `completed`
    pub completed: usize,
    /// Jobs that failed an attempt and went back to `pending`
    pub retrying: usize,
    /// Jobs that reached `failed`
    pub failed: usize,
    /// Jobs paused or cancelled while their transfer ran
    pub interrupted: usize,
    /// Entries dropped because their job was gone or no longer runnable
    pub skipped: usize,
    /// Entries put back because their job was still backing off
    pub deferred: usize,
    /// True when another pass was already running and this one did nothing
    pub busy: bool,
}

impl ProcessSummary {
    pub(crate) fn busy() -> Self {
        Self {
            busy: true,
            ..Default::default()
        }
    }

    pub(crate) fn merge(&mut self, other: &ProcessSummary) {
        self.started += other.started;
        self.completed += other.completed;
        self.retrying += other.retrying;
        self.failed += other.failed;
        self.interrupted += other.interrupted;
        self.skipped += other.skipped;
        self.deferred += other.deferred;
    }
}

/// Result of the "continue all downloads" action
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContinueSummary {
    /// Failed jobs re-opened
    pub retried: usize,
    /// Outcome of processing everything pending afterwards
    pub processed: ProcessSummary,
}

/// Event emitted during the job lifecycle
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// Job added to the queue
    Queued {
        /// Job id
        id: JobId,
        /// Destination file name
        file_name: String,
    },

    /// Transfer started
    Started {
        /// Job id
        id: JobId,
    },

    /// Progress persisted
    Progress {
        /// Job id
        id: JobId,
        /// Fraction complete
        progress: f64,
        /// Bytes written so far
        bytes_written: u64,
    },

    /// Download finished
    Completed {
        /// Job id
        id: JobId,
        /// Final file path
        path: PathBuf,
    },

    /// Attempt failed, job will be retried
    Retrying {
        /// Job id
        id: JobId,
        /// Failed attempts so far
        retry_count: u32,
        /// Error message
        error: String,
    },

    /// Retries exhausted
    Failed {
        /// Job id
        id: JobId,
        /// Error message
        error: String,
    },

    /// Job paused by the user
    Paused {
        /// Job id
        id: JobId,
    },

    /// Job resumed by the user
    Resumed {
        /// Job id
        id: JobId,
    },

    /// Job cancelled by the user
    Cancelled {
        /// Job id
        id: JobId,
    },

    /// Catalogue accepted the completed download
    Catalogued {
        /// Job id
        id: JobId,
        /// Catalogue entry id, if the catalogue returned one
        entry_id: Option<String>,
    },

    /// Catalogue rejected the completed download (job stays completed)
    CatalogFailed {
        /// Job id
        id: JobId,
        /// Error message
        error: String,
    },

    /// Job removed from the store by a cleanup call
    Removed {
        /// Job id
        id: JobId,
    },

    /// Queue shut down
    Shutdown,
}
