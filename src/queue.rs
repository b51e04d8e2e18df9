//! Public entry point: enqueue work, control jobs, observe progress.

use std::sync::Arc;

use tokio::sync::broadcast;

use crate::catalog::{MediaCatalog, NoOpCatalog};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::fetcher::{HttpFetcher, ResumableFetcher};
use crate::processor::QueueProcessor;
use crate::signer::{PassthroughSigner, UrlSigner};
use crate::store::{JobStore, NewJob};
use crate::types::{
    BatchFile, BatchSummary, ContinueSummary, EnqueueOptions, Event, Job, JobFilter, JobId,
    ProcessSummary, QueueStats, Status,
};

/// Capacity of the event broadcast channel
const EVENT_CHANNEL_CAPACITY: usize = 1000;

/// Download queue facade (cloneable - all fields are Arc-wrapped)
///
/// Owns the persistent store and the processor. Every job it hands out is
/// durable before the call returns, so a restart picks up exactly where the
/// previous session stopped.
///
/// ```no_run
/// use scripture_dl::{Config, DownloadQueue, EnqueueOptions};
///
/// # async fn example() -> scripture_dl::Result<()> {
/// let queue = DownloadQueue::with_defaults(Config::with_data_dir("./offline")).await?;
///
/// let id = queue
///     .enqueue(
///         "https://cdn.example.org/ENGESV/GEN/1.mp3",
///         "ENGESV_GEN_1.mp3",
///         EnqueueOptions::default(),
///     )
///     .await?;
///
/// let mut events = queue.subscribe();
/// while let Ok(event) = events.recv().await {
///     println!("{event:?}");
/// }
/// # let _ = id;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct DownloadQueue {
    store: Arc<JobStore>,
    processor: QueueProcessor,
    config: Arc<Config>,
}

impl DownloadQueue {
    /// Open (or create) the queue and restore interrupted work
    ///
    /// This initializes all core components:
    /// - Validates the configuration
    /// - Creates the download directory
    /// - Opens the SQLite store and runs migrations
    /// - Resets jobs interrupted by a previous crash back to `pending`
    /// - Starts the background scheduler when `auto_process` is set
    pub async fn new(
        config: Config,
        fetcher: Arc<dyn ResumableFetcher>,
        signer: Arc<dyn UrlSigner>,
        catalog: Arc<dyn MediaCatalog>,
    ) -> Result<Self> {
        config.validate()?;

        tokio::fs::create_dir_all(config.download_dir())
            .await
            .map_err(|e| {
                Error::Io(std::io::Error::new(
                    e.kind(),
                    format!(
                        "Failed to create download directory '{}': {}",
                        config.download_dir().display(),
                        e
                    ),
                ))
            })?;

        let store = Arc::new(JobStore::open(config.database_path()).await?);
        let config = Arc::new(config);

        let (event_tx, _rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let processor = QueueProcessor::new(
            store.clone(),
            config.clone(),
            fetcher,
            signer,
            catalog,
            event_tx,
        );

        processor.restore().await?;
        store.set_clean_start().await?;

        if config.download.auto_process {
            processor.start_scheduler().await;
        }

        tracing::info!(
            database = %config.database_path().display(),
            download_dir = %config.download_dir().display(),
            "Download queue ready"
        );

        Ok(Self {
            store,
            processor,
            config,
        })
    }

    /// Open the queue with plain HTTP transfers, no signing and no catalogue
    pub async fn with_defaults(config: Config) -> Result<Self> {
        let fetcher = Arc::new(HttpFetcher::new(config.retry.clone()));
        Self::new(
            config,
            fetcher,
            Arc::new(PassthroughSigner),
            Arc::new(NoOpCatalog),
        )
        .await
    }

    /// Add one download
    ///
    /// If an unfinished job already writes to `file_name`, or a completed
    /// job's file is still on disk, that job's id is returned and nothing new
    /// is queued.
    ///
    /// # Errors
    ///
    /// [`Error::Validation`] for an empty reference or an unsafe file name,
    /// [`Error::ShuttingDown`] once shutdown has begun.
    pub async fn enqueue(
        &self,
        remote_ref: &str,
        file_name: &str,
        options: EnqueueOptions,
    ) -> Result<JobId> {
        let (remote_ref, file_name) = validate_file(remote_ref, file_name)?;
        self.ensure_accepting()?;
        self.insert(remote_ref, file_name, &options).await
    }

    /// Add several downloads under one batch id
    ///
    /// Every file is validated before anything is written. A fresh batch id
    /// is generated unless `options.batch_id` is set. Returns one id per
    /// file, in input order.
    pub async fn enqueue_batch(
        &self,
        files: Vec<BatchFile>,
        options: EnqueueOptions,
    ) -> Result<Vec<JobId>> {
        let validated = files
            .iter()
            .map(|f| validate_file(&f.remote_ref, &f.file_name).map(|(r, n)| (r, n, f.file_size)))
            .collect::<Result<Vec<_>>>()?;
        self.ensure_accepting()?;

        let batch_id = options
            .batch_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let mut ids = Vec::with_capacity(validated.len());
        for (remote_ref, file_name, file_size) in validated {
            let file_options = EnqueueOptions {
                batch_id: Some(batch_id.clone()),
                file_size: file_size.or(options.file_size),
                ..options.clone()
            };
            ids.push(self.insert(remote_ref, file_name, &file_options).await?);
        }

        tracing::info!(batch_id = %batch_id, count = ids.len(), "Batch enqueued");
        Ok(ids)
    }

    async fn insert(&self, remote_ref: &str, file_name: &str, options: &EnqueueOptions) -> Result<JobId> {
        let local_path = self.config.download_dir().join(file_name);
        // A finished download only counts while its file is still on disk
        let include_completed = tokio::fs::try_exists(&local_path).await.unwrap_or(false);

        let added = self
            .store
            .add_queued_job(
                &NewJob {
                    remote_ref: remote_ref.to_string(),
                    file_name: file_name.to_string(),
                    local_path,
                    priority: options.priority,
                    batch_id: options.batch_id.clone(),
                    file_size: options.file_size,
                    catalog: options.catalog,
                    metadata: options.metadata.clone(),
                },
                include_completed,
            )
            .await?;
        let job = added.job;

        if !added.created {
            tracing::debug!(job_id = job.id.0, file_name, status = %job.status, "Download already known");
            return Ok(job.id);
        }

        tracing::info!(job_id = job.id.0, file_name, priority = job.priority, "Download queued");
        self.processor.emit(Event::Queued {
            id: job.id,
            file_name: job.file_name.clone(),
        });
        self.processor.wake();
        Ok(job.id)
    }

    fn ensure_accepting(&self) -> Result<()> {
        if self.processor.is_accepting() {
            Ok(())
        } else {
            Err(Error::ShuttingDown)
        }
    }

    /// Pause a job; see [`QueueProcessor::pause`]
    pub async fn pause(&self, id: JobId) -> Result<()> {
        self.processor.pause(id).await.map(|_| ())
    }

    /// Resume a paused job; see [`QueueProcessor::resume`]
    pub async fn resume(&self, id: JobId) -> Result<()> {
        self.processor.resume(id).await.map(|_| ())
    }

    /// Cancel a job and delete its partial file; see [`QueueProcessor::cancel`]
    pub async fn cancel(&self, id: JobId) -> Result<()> {
        self.processor.cancel(id).await.map(|_| ())
    }

    /// Change a job's priority
    pub async fn set_priority(&self, id: JobId, priority: i32) -> Result<()> {
        self.processor.set_priority(id, priority).await.map(|_| ())
    }

    /// Current state of a job, `None` if unknown
    pub async fn status(&self, id: JobId) -> Result<Option<Job>> {
        self.store.get_job(id).await
    }

    /// Jobs matching `filter`, oldest first
    pub async fn list(&self, filter: JobFilter) -> Result<Vec<Job>> {
        match (&filter.status, &filter.batch_id) {
            (_, Some(batch_id)) => {
                let jobs = self.store.get_jobs_by_batch(batch_id).await?;
                Ok(jobs.into_iter().filter(|j| filter.matches(j)).collect())
            }
            (Some(status), None) => self.store.get_jobs_by_status(*status).await,
            (None, None) => self.store.get_all_jobs().await,
        }
    }

    /// Lifetime counters plus current per-status counts
    pub async fn stats(&self) -> Result<QueueStats> {
        self.store.get_stats().await
    }

    /// Progress of every file in a batch, `None` for an unknown batch
    pub async fn batch_summary(&self, batch_id: &str) -> Result<Option<BatchSummary>> {
        self.store.batch_summary(batch_id).await
    }

    /// Forget completed jobs; files on disk are kept. Returns how many were removed.
    pub async fn clear_completed(&self) -> Result<usize> {
        let removed = self.store.clear_completed().await?;
        self.announce_removed(&removed, Status::Completed);
        Ok(removed.len())
    }

    /// Forget failed jobs. Returns how many were removed.
    pub async fn clear_failed(&self) -> Result<usize> {
        let removed = self.store.clear_failed().await?;
        self.announce_removed(&removed, Status::Failed);
        Ok(removed.len())
    }

    fn announce_removed(&self, removed: &[JobId], status: Status) {
        if !removed.is_empty() {
            tracing::info!(count = removed.len(), %status, "Cleared jobs");
        }
        for id in removed {
            self.processor.emit(Event::Removed { id: *id });
        }
    }

    /// Re-open failed jobs; returns how many were re-queued
    pub async fn retry_failed(&self) -> Result<usize> {
        self.processor.retry_failed().await
    }

    /// Retry failed jobs, then process everything pending
    pub async fn continue_downloads(&self) -> Result<ContinueSummary> {
        self.processor.continue_downloads().await
    }

    /// Run one processing pass now
    pub async fn process_queue(&self) -> Result<ProcessSummary> {
        self.processor.process_queue().await
    }

    /// Process every pending and paused job until none is runnable
    pub async fn process_all_pending(&self) -> Result<ProcessSummary> {
        self.processor.process_all_pending().await
    }

    /// Subscribe to lifecycle events
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.processor.subscribe()
    }

    /// Whether a processing pass is running right now
    pub fn is_busy(&self) -> bool {
        self.processor.is_busy()
    }

    /// Stop transfers, persist state and refuse new work
    pub async fn shutdown(&self) -> Result<()> {
        self.processor.shutdown().await
    }

    /// The processor driving this queue
    pub fn processor(&self) -> &QueueProcessor {
        &self.processor
    }

    /// Direct access to the underlying store
    pub fn store(&self) -> &JobStore {
        &self.store
    }

    /// Active configuration
    pub fn config(&self) -> &Config {
        &self.config
    }
}

/// Trim and check one enqueue request, returning the trimmed values
fn validate_file<'a>(remote_ref: &'a str, file_name: &'a str) -> Result<(&'a str, &'a str)> {
    let remote_ref = remote_ref.trim();
    let file_name = file_name.trim();

    if remote_ref.is_empty() {
        return Err(Error::Validation("remote reference must not be empty".to_string()));
    }
    if file_name.is_empty() {
        return Err(Error::Validation("file name must not be empty".to_string()));
    }
    if file_name == "."
        || file_name.contains("..")
        || file_name.contains('/')
        || file_name.contains('\\')
    {
        return Err(Error::Validation(format!(
            "file name '{file_name}' must be a plain name inside the download directory"
        )));
    }
    Ok((remote_ref, file_name))
}
