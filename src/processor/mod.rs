//! Queue processing split into focused submodules.
//!
//! The `QueueProcessor` struct and its methods are organized by concern:
//! - [`pass`] - Processing passes over the persistent queue
//! - [`job_task`] - One transfer attempt for one job
//! - [`control`] - Pause, resume, cancel and re-prioritisation
//! - [`scheduler`] - Background loop that keeps passes running
//! - [`lifecycle`] - Startup recovery and graceful shutdown

mod control;
mod job_task;
mod lifecycle;
mod pass;
mod scheduler;

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
pub(crate) mod test_helpers;
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{Mutex, Notify, broadcast};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::catalog::MediaCatalog;
use crate::config::Config;
use crate::fetcher::ResumableFetcher;
use crate::signer::UrlSigner;
use crate::store::JobStore;
use crate::types::{Event, JobId};

/// Shared runtime state of the processor
#[derive(Clone)]
pub(crate) struct ProcessorState {
    /// Cancellation tokens of in-flight transfers, one per job
    pub(crate) active: Arc<Mutex<HashMap<JobId, CancellationToken>>>,
    /// Held for the duration of a processing pass
    pub(crate) pass_lock: Arc<Mutex<()>>,
    /// Signals the scheduler that new work may be runnable
    pub(crate) wake: Arc<Notify>,
    /// Cleared once shutdown starts
    pub(crate) accepting_new: Arc<AtomicBool>,
    /// Parent of every transfer token; cancelled on shutdown
    pub(crate) shutdown: CancellationToken,
    /// Background scheduler task, if started
    pub(crate) scheduler: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl ProcessorState {
    fn new() -> Self {
        Self {
            active: Arc::new(Mutex::new(HashMap::new())),
            pass_lock: Arc::new(Mutex::new(())),
            wake: Arc::new(Notify::new()),
            accepting_new: Arc::new(AtomicBool::new(true)),
            shutdown: CancellationToken::new(),
            scheduler: Arc::new(Mutex::new(None)),
        }
    }
}

/// Drives queued jobs through signing, transfer and cataloguing
/// (cloneable - all fields are Arc-wrapped)
#[derive(Clone)]
pub struct QueueProcessor {
    /// Durable job and queue state
    pub(crate) store: Arc<JobStore>,
    /// Moves bytes from a signed URL to disk
    pub(crate) fetcher: Arc<dyn ResumableFetcher>,
    /// Exchanges remote references for time-limited URLs
    pub(crate) signer: Arc<dyn UrlSigner>,
    /// Receives completed downloads that asked to be catalogued
    pub(crate) catalog: Arc<dyn MediaCatalog>,
    pub(crate) config: Arc<Config>,
    /// Event broadcast channel sender (multiple subscribers supported)
    pub(crate) event_tx: broadcast::Sender<Event>,
    pub(crate) state: ProcessorState,
}

impl QueueProcessor {
    /// Wire a processor to its store and collaborators
    ///
    /// Nothing runs until a pass is requested or [`start_scheduler`](Self::start_scheduler)
    /// is called.
    pub fn new(
        store: Arc<JobStore>,
        config: Arc<Config>,
        fetcher: Arc<dyn ResumableFetcher>,
        signer: Arc<dyn UrlSigner>,
        catalog: Arc<dyn MediaCatalog>,
        event_tx: broadcast::Sender<Event>,
    ) -> Self {
        tracing::debug!(
            fetcher = fetcher.name(),
            signer = signer.name(),
            catalog = catalog.name(),
            max_concurrent = config.download.max_concurrent_downloads,
            "Creating queue processor"
        );

        Self {
            store,
            fetcher,
            signer,
            catalog,
            config,
            event_tx,
            state: ProcessorState::new(),
        }
    }

    /// Subscribe to lifecycle events
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.event_tx.subscribe()
    }

    /// Whether a processing pass is currently running
    pub fn is_busy(&self) -> bool {
        self.state.pass_lock.try_lock().is_err()
    }

    /// Whether new work is still accepted (false once shutdown began)
    pub fn is_accepting(&self) -> bool {
        self.state.accepting_new.load(Ordering::SeqCst)
    }

    /// Number of transfers currently in flight
    pub async fn active_count(&self) -> usize {
        self.state.active.lock().await.len()
    }

    /// Nudge the scheduler to run a pass soon
    pub fn wake(&self) {
        self.state.wake.notify_one();
    }

    pub(crate) fn emit(&self, event: Event) {
        // No subscribers is fine
        let _ = self.event_tx.send(event);
    }
}
