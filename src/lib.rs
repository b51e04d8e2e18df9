//! # scripture-dl
//!
//! Persistent, resumable, priority-ordered download queue for offline
//! scripture audio and text media.
//!
//! ## Design Philosophy
//!
//! scripture-dl is designed to be:
//! - **Durable** - every job and queue entry lives in SQLite, so nothing is
//!   lost when the host app is killed mid-transfer
//! - **Resumable** - partial files are continued with HTTP range requests
//! - **Pluggable** - URL signing, transfers and cataloguing are traits
//! - **Event-driven** - consumers subscribe to events, no polling required
//!
//! ## Quick Start
//!
//! ```no_run
//! use scripture_dl::{BatchFile, Config, DownloadQueue, EnqueueOptions};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let queue = DownloadQueue::with_defaults(Config::with_data_dir("./offline")).await?;
//!
//!     // Subscribe to events
//!     let mut events = queue.subscribe();
//!     tokio::spawn(async move {
//!         while let Ok(event) = events.recv().await {
//!             println!("Event: {:?}", event);
//!         }
//!     });
//!
//!     queue
//!         .enqueue_batch(
//!             vec![
//!                 BatchFile::new("https://cdn.example.org/ENGESV/JHN/1.mp3", "ENGESV_JHN_1.mp3"),
//!                 BatchFile::new("https://cdn.example.org/ENGESV/JHN/2.mp3", "ENGESV_JHN_2.mp3"),
//!             ],
//!             EnqueueOptions::default(),
//!         )
//!         .await?;
//!
//!     scripture_dl::run_with_shutdown(queue).await?;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

/// Media catalogue collaborator
pub mod catalog;
/// Configuration types
pub mod config;
/// Error types
pub mod error;
/// Resumable byte transfers
pub mod fetcher;
/// Queue processing, job control and scheduling
pub mod processor;
/// Public download queue facade
pub mod queue;
/// Retry logic with exponential backoff
pub mod retry;
/// URL signing collaborator
pub mod signer;
/// SQLite persistence layer
pub mod store;
/// Core types and events
pub mod types;

// Re-export commonly used types
pub use catalog::{CatalogResult, MediaCatalog, NoOpCatalog};
pub use config::{Config, DownloadConfig, PersistenceConfig, RetryConfig, SigningConfig};
pub use error::{DatabaseError, Error, Result, SigningError, TransferError};
pub use fetcher::{FetchOutcome, FetchRequest, HttpFetcher, ResumableFetcher, TransferProgress};
pub use processor::QueueProcessor;
pub use queue::DownloadQueue;
pub use signer::{PassthroughSigner, SignedUrls, UrlSigner};
pub use store::{JobStore, RecoveryReport};
pub use types::{
    BatchFile, BatchSummary, ContinueSummary, EnqueueOptions, Event, Job, JobFilter, JobId,
    JobMetadata, ProcessSummary, QueueEntry, QueueStats, Status,
};

/// Helper function to run the queue with graceful signal handling.
///
/// Waits for a termination signal and then calls the queue's `shutdown()` method,
/// so interrupted transfers are persisted for the next start.
///
/// - **Unix:** listens for SIGTERM and SIGINT, with fallbacks if signal registration fails.
/// - **Windows/other:** listens for Ctrl+C via `tokio::signal::ctrl_c()`.
pub async fn run_with_shutdown(queue: DownloadQueue) -> Result<()> {
    wait_for_signal().await;
    queue.shutdown().await
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    // Registration may fail in restricted environments (containers, tests)
    let sigterm_result = signal(SignalKind::terminate());
    let sigint_result = signal(SignalKind::interrupt());

    match (sigterm_result, sigint_result) {
        (Ok(mut sigterm), Ok(mut sigint)) => {
            tokio::select! {
                _ = sigterm.recv() => tracing::info!("Received SIGTERM signal"),
                _ = sigint.recv() => tracing::info!("Received SIGINT signal (Ctrl+C)"),
            }
        }
        (Err(e), _) | (_, Err(e)) => {
            tracing::warn!(error = %e, "Could not register signal handlers, using ctrl_c fallback");
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for Ctrl+C signal");
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!("Received Ctrl+C signal"),
        Err(e) => tracing::error!(error = %e, "Failed to listen for Ctrl+C signal"),
    }
}
