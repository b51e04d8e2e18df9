//! Error types for scripture-dl
//!
//! Errors are split by failure domain:
//! - [`Error`] is what facade callers see (validation, unknown ids, invalid
//!   state transitions, storage failures)
//! - [`SigningError`] and [`TransferError`] are produced by the external
//!   collaborators and are translated into job state by the processor
//! - [`DatabaseError`] wraps persistence failures with the failing operation

use thiserror::Error;

use crate::types::JobId;

/// Result type alias for scripture-dl operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for scripture-dl
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error with context about which setting is invalid
    #[error("configuration error: {message}")]
    Config {
        /// Human-readable error message describing the configuration issue
        message: String,
        /// The configuration key that caused the error (e.g., "max_retries")
        key: Option<String>,
    },

    /// Database operation failed
    #[error("database error: {0}")]
    Database(#[from] DatabaseError),

    /// Bad input to an enqueue or control call
    #[error("validation error: {0}")]
    Validation(String),

    /// No job with this id exists in the store
    #[error("job {0} not found")]
    JobNotFound(JobId),

    /// Cannot perform operation in current state
    #[error("cannot {operation} job {id} in state {current_state}")]
    InvalidState {
        /// The job that is in an invalid state for the operation
        id: JobId,
        /// The operation that was attempted (e.g., "pause", "resume", "cancel")
        operation: String,
        /// The current state that prevents the operation
        current_state: String,
    },

    /// URL signing failed
    #[error("signing error: {0}")]
    Signing(#[from] SigningError),

    /// Byte transfer failed
    #[error("transfer error: {0}")]
    Transfer(#[from] TransferError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Shutdown in progress - not accepting new downloads
    #[error("shutdown in progress: not accepting new downloads")]
    ShuttingDown,
}

impl Error {
    /// Machine-readable error code, stable across releases.
    ///
    /// UI layers use this to pick a localized message without parsing the
    /// human-readable text.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Config { .. } => "config_error",
            Error::Database(_) => "store_error",
            Error::Validation(_) => "validation_error",
            Error::JobNotFound(_) => "not_found",
            Error::InvalidState { .. } => "invalid_state",
            Error::Signing(_) => "signing_error",
            Error::Transfer(_) => "transfer_error",
            Error::Io(_) => "io_error",
            Error::Serialization(_) => "serialization_error",
            Error::ShuttingDown => "shutting_down",
        }
    }

    /// Whether this error came from durable storage
    pub fn is_store_error(&self) -> bool {
        matches!(self, Error::Database(_))
    }
}

/// Database-related errors
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Failed to connect to database
    #[error("failed to connect to database: {0}")]
    ConnectionFailed(String),

    /// Failed to run migrations
    #[error("failed to run migrations: {0}")]
    MigrationFailed(String),

    /// Query failed
    #[error("query failed: {0}")]
    QueryFailed(String),

    /// Stored value could not be decoded into its domain type
    #[error("corrupt record: {0}")]
    CorruptRecord(String),

    /// Invariant between jobs and queue entries would be broken
    #[error("constraint violation: {0}")]
    ConstraintViolation(String),
}

/// Failures of the URL signing collaborator
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SigningError {
    /// The signing service could not be reached or rejected the request
    #[error("signing request failed: {0}")]
    RequestFailed(String),

    /// The service answered but returned no URL for this reference
    #[error("no signed URL returned for {remote_ref}")]
    Unsigned {
        /// The remote reference that came back without a URL
        remote_ref: String,
    },
}

/// Failures of the resumable fetcher
#[derive(Debug, Error)]
pub enum TransferError {
    /// Transfer was stopped through its cancellation token
    #[error("transfer cancelled")]
    Cancelled,

    /// URL could not be parsed or uses an unsupported scheme
    #[error("invalid URL {url}: {reason}")]
    InvalidUrl {
        /// The offending URL
        url: String,
        /// Why it was rejected
        reason: String,
    },

    /// Server answered with a non-success status
    #[error("server responded with status {status}")]
    HttpStatus {
        /// HTTP status code
        status: u16,
    },

    /// Connection-level failure
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// Local disk failure while writing the partial file
    #[error("disk error: {0}")]
    Disk(#[from] std::io::Error),

    /// Any other fetcher-specific failure
    #[error("{0}")]
    Other(String),
}

impl TransferError {
    /// Whether this outcome was a cooperative stop rather than a failure
    pub fn is_cancelled(&self) -> bool {
        matches!(self, TransferError::Cancelled)
    }
}
