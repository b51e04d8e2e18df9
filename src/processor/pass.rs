//! Processing passes over the persistent queue.

use chrono::{DateTime, Utc};
use tokio::task::JoinSet;

use crate::error::{DatabaseError, Error, Result};
use crate::store::JobUpdate;
use crate::types::{ContinueSummary, Event, Job, ProcessSummary, QueueEntry, Status};

use super::QueueProcessor;

/// What a pass decided to do with a popped entry
enum Admission {
    Start(Job),
    /// Still waiting out its retry delay; goes back into the queue
    Defer,
    /// Retry limit already reached; marked failed without a transfer
    Exhausted,
    Skip,
}

impl QueueProcessor {
    /// Run one pass: start up to `max_concurrent_downloads` runnable jobs
    /// in queue order and wait for them to finish
    ///
    /// Returns immediately with [`ProcessSummary::busy`] set if another pass
    /// is already running. Jobs still inside their retry delay are left in the
    /// queue and do not count against the cap.
    ///
    /// Slots freed while the pass runs are not refilled; entries added in the
    /// meantime wait for the next pass. The background scheduler starts that
    /// pass right away when the cap was used, so with `auto_process` off the
    /// caller drives it (or uses [`process_all_pending`](Self::process_all_pending)).
    pub async fn process_queue(&self) -> Result<ProcessSummary> {
        let Ok(_guard) = self.state.pass_lock.try_lock() else {
            tracing::debug!("Processing pass already running");
            return Ok(ProcessSummary::busy());
        };

        self.run_pass(true).await
    }

    /// Process every pending and paused job, in batches of
    /// `max_concurrent_downloads`, until nothing runnable is left
    ///
    /// Paused jobs are resumed first. Retry delays are ignored, so a job
    /// that keeps failing is attempted until its retries are exhausted.
    /// Failed jobs are left alone; see [`retry_failed`](Self::retry_failed).
    pub async fn process_all_pending(&self) -> Result<ProcessSummary> {
        let _guard = self.state.pass_lock.lock().await;

        for job in self.store.get_jobs_by_status(Status::Paused).await? {
            if self
                .store
                .reopen(job.id, &[Status::Paused], false)
                .await?
                .is_some()
            {
                tracing::debug!(job_id = job.id.0, "Resuming paused job");
                self.emit(Event::Resumed { id: job.id });
            }
        }

        let mut total = ProcessSummary::default();
        while self.is_accepting() {
            let batch = self.run_pass(false).await?;
            total.merge(&batch);
            if batch.started == 0 {
                break;
            }
        }

        tracing::info!(
            started = total.started,
            completed = total.completed,
            failed = total.failed,
            "Processed all pending jobs"
        );
        Ok(total)
    }

    /// Re-open every failed job
    ///
    /// Jobs that failed because they hit the retry limit start over with a
    /// zero retry count. Returns the number of jobs re-queued.
    pub async fn retry_failed(&self) -> Result<usize> {
        let max_retries = self.config.download.max_retries;
        let mut reopened = 0;

        for job in self.store.get_jobs_by_status(Status::Failed).await? {
            let reset = job.retry_count >= max_retries;
            if self
                .store
                .reopen(job.id, &[Status::Failed], reset)
                .await?
                .is_some()
            {
                reopened += 1;
            }
        }

        if reopened > 0 {
            tracing::info!(count = reopened, "Re-queued failed jobs");
            self.wake();
        }
        Ok(reopened)
    }

    /// Retry failed jobs, then process everything pending
    pub async fn continue_downloads(&self) -> Result<ContinueSummary> {
        let retried = self.retry_failed().await?;
        let processed = self.process_all_pending().await?;
        Ok(ContinueSummary { retried, processed })
    }

    /// Pop and start up to the concurrency cap, then join every started task
    ///
    /// Caller must hold the pass lock. Tasks are always joined before
    /// returning so no transfer outlives the pass, even on a store error.
    async fn run_pass(&self, respect_backoff: bool) -> Result<ProcessSummary> {
        let cap = self.config.download.max_concurrent_downloads;
        let now = Utc::now();
        let mut summary = ProcessSummary::default();
        let mut deferred: Vec<QueueEntry> = Vec::new();
        let mut tasks = JoinSet::new();
        let mut first_error: Option<Error> = None;

        while summary.started < cap && self.is_accepting() {
            let entry = match self.store.dequeue_next().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    first_error = Some(e);
                    break;
                }
            };

            match self.admit(&entry, respect_backoff, now).await {
                Ok(Admission::Start(job)) => {
                    summary.started += 1;
                    let this = self.clone();
                    tasks.spawn(async move { this.run_job(job).await });
                }
                Ok(Admission::Defer) => deferred.push(entry),
                Ok(Admission::Exhausted) => summary.failed += 1,
                Ok(Admission::Skip) => summary.skipped += 1,
                Err(e) => {
                    first_error = Some(e);
                    break;
                }
            }
        }

        for entry in &deferred {
            match self.restore_entry(entry).await {
                Ok(true) => summary.deferred += 1,
                Ok(false) => {}
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(outcome)) => outcome.tally(&mut summary),
                Ok(Err(e)) => {
                    first_error.get_or_insert(e);
                }
                Err(e) => tracing::error!(error = %e, "Job task panicked"),
            }
        }

        if let Some(e) = first_error {
            return Err(e);
        }

        if summary.started > 0 || summary.deferred > 0 {
            tracing::debug!(
                started = summary.started,
                completed = summary.completed,
                retrying = summary.retrying,
                deferred = summary.deferred,
                "Processing pass finished"
            );
        }
        Ok(summary)
    }

    async fn admit(
        &self,
        entry: &QueueEntry,
        respect_backoff: bool,
        now: DateTime<Utc>,
    ) -> Result<Admission> {
        let id = entry.job_id;
        let Some(job) = self.store.get_job(id).await? else {
            tracing::debug!(job_id = id.0, "Dropping queue entry for missing job");
            return Ok(Admission::Skip);
        };

        if job.status != Status::Pending {
            tracing::debug!(job_id = id.0, status = %job.status, "Skipping non-pending job");
            return Ok(Admission::Skip);
        }

        if respect_backoff && job.is_backing_off(now) {
            return Ok(Admission::Defer);
        }

        if job.retry_count >= self.config.download.max_retries {
            let update = JobUpdate::status(Status::Failed)
                .with_error(Some(job.error.clone().unwrap_or_else(|| {
                    format!("retry limit of {} reached", self.config.download.max_retries)
                })));
            return match self
                .store
                .update_job_if(id, &[Status::Pending], &update)
                .await?
            {
                Some(failed) => {
                    tracing::warn!(
                        job_id = id.0,
                        retry_count = failed.retry_count,
                        "Retry limit reached before transfer, marking failed"
                    );
                    self.emit(Event::Failed {
                        id,
                        error: failed.error.unwrap_or_default(),
                    });
                    Ok(Admission::Exhausted)
                }
                None => Ok(Admission::Skip),
            };
        }

        Ok(Admission::Start(job))
    }

    /// Put a deferred entry back; a job that stopped being runnable meanwhile is dropped
    async fn restore_entry(&self, entry: &QueueEntry) -> Result<bool> {
        match self.store.enqueue(entry).await {
            Ok(inserted) => Ok(inserted),
            Err(Error::JobNotFound(_)) | Err(Error::Database(DatabaseError::ConstraintViolation(_))) => {
                tracing::debug!(job_id = entry.job_id.0, "Deferred job no longer runnable");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }
}
