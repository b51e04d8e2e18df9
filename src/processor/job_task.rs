//! One transfer attempt for one job: sign, fetch, persist, catalogue.

use chrono::Utc;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result, SigningError};
use crate::fetcher::{FetchOutcome, FetchRequest, TransferProgress};
use crate::retry;
use crate::store::{JobUpdate, ProgressUpdate};
use crate::types::{Event, Job, JobId, ProcessSummary, Status};

use super::QueueProcessor;

/// How a single attempt ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum JobOutcome {
    Completed,
    Retrying,
    Failed,
    /// Stopped by pause, cancel or shutdown
    Interrupted,
    /// Job was no longer runnable when the attempt began
    Skipped,
}

impl JobOutcome {
    pub(crate) fn tally(self, summary: &mut ProcessSummary) {
        match self {
            JobOutcome::Completed => summary.completed += 1,
            JobOutcome::Retrying => summary.retrying += 1,
            JobOutcome::Failed => summary.failed += 1,
            JobOutcome::Interrupted => summary.interrupted += 1,
            JobOutcome::Skipped => summary.skipped += 1,
        }
    }
}

impl QueueProcessor {
    /// Run one attempt for a job that was popped from the queue
    ///
    /// The job's cancellation token is registered for the whole attempt so
    /// pause, cancel and shutdown can reach it, and always released after.
    pub(crate) async fn run_job(&self, job: Job) -> Result<JobOutcome> {
        let id = job.id;
        let token = self.state.shutdown.child_token();

        {
            let mut active = self.state.active.lock().await;
            if active.contains_key(&id) {
                tracing::warn!(job_id = id.0, "Transfer already in flight, skipping");
                return Ok(JobOutcome::Skipped);
            }
            active.insert(id, token.clone());
        }

        let outcome = self.attempt(job, &token).await;

        self.state.active.lock().await.remove(&id);

        if let Err(e) = &outcome {
            tracing::error!(job_id = id.0, error = %e, "Job attempt aborted by store error");
        }
        outcome
    }

    async fn attempt(&self, job: Job, token: &CancellationToken) -> Result<JobOutcome> {
        let id = job.id;
        let now = Utc::now();

        let start = JobUpdate {
            status: Some(Status::Downloading),
            started_at: Some(Some(job.started_at.unwrap_or(now))),
            next_retry_at: Some(None),
            ..Default::default()
        };
        let Some(job) = self
            .store
            .update_job_if(id, &[Status::Pending], &start)
            .await?
        else {
            tracing::debug!(job_id = id.0, "Job left pending before its attempt began");
            return Ok(JobOutcome::Skipped);
        };

        tracing::info!(
            job_id = id.0,
            file_name = %job.file_name,
            retry_count = job.retry_count,
            "Starting download"
        );
        self.emit(Event::Started { id });

        let url = match self.signed_url(&job).await {
            Ok(url) => url,
            Err(SignedUrlError::Store(e)) => return Err(e),
            Err(SignedUrlError::Signing(e)) => {
                tracing::warn!(job_id = id.0, error = %e, "URL signing failed");
                return self.record_failure(&job, &Error::Signing(e).to_string()).await;
            }
        };

        let request = FetchRequest {
            job_id: id,
            url,
            local_path: job.local_path.clone(),
            expected_size: job.file_size,
        };

        let (progress_tx, progress_rx) = watch::channel(TransferProgress {
            bytes_written: job.bytes_written,
            content_length: job.file_size,
        });
        let fetch = async {
            let result = self.fetcher.fetch(&request, &progress_tx, token).await;
            drop(progress_tx);
            result
        };
        let (result, ()) = tokio::join!(fetch, self.persist_progress(id, progress_rx));

        match result {
            Ok(outcome) => self.complete(job, outcome).await,
            Err(e) if e.is_cancelled() => {
                tracing::info!(job_id = id.0, "Download interrupted");
                Ok(JobOutcome::Interrupted)
            }
            Err(e) => {
                tracing::warn!(job_id = id.0, error = %e, "Download attempt failed");
                self.record_failure(&job, &Error::Transfer(e).to_string())
                    .await
            }
        }
    }

    /// Reuse the cached URL while it is comfortably valid, otherwise sign anew
    async fn signed_url(&self, job: &Job) -> std::result::Result<String, SignedUrlError> {
        let now = Utc::now();
        let margin = chrono::Duration::from_std(self.config.signing.refresh_margin)
            .unwrap_or_else(|_| chrono::Duration::zero());

        if job.has_valid_url(now, margin)
            && let Some(url) = &job.signed_url
        {
            return Ok(url.clone());
        }

        let refs = [job.remote_ref.clone()];
        let ttl_hours = self.config.signing.url_ttl_hours;
        let signed =
            retry::download_with_retry(&self.config.retry, || self.signer.sign(&refs, ttl_hours))
                .await?;
        let url = signed
            .url_for(&job.remote_ref)
            .ok_or_else(|| SigningError::Unsigned {
                remote_ref: job.remote_ref.clone(),
            })?
            .to_string();
        let expires_at = signed.expires_at(now);

        let update = JobUpdate {
            signed_url: Some(Some(url.clone())),
            url_expires_at: Some(Some(expires_at)),
            ..Default::default()
        };
        self.store
            .update_job_if(job.id, &[Status::Downloading], &update)
            .await
            .map_err(SignedUrlError::Store)?;

        tracing::debug!(job_id = job.id.0, %expires_at, "Signed fresh download URL");
        Ok(url)
    }

    /// Persist progress ticks from the fetcher, at most once per interval
    ///
    /// Runs until the fetcher drops its sender, then writes the final value.
    async fn persist_progress(&self, id: JobId, mut rx: watch::Receiver<TransferProgress>) {
        let interval = self.config.download.progress_persist_interval;
        let mut last_write: Option<Instant> = None;
        let mut pending = false;

        while rx.changed().await.is_ok() {
            pending = true;
            if last_write.is_some_and(|at| at.elapsed() < interval) {
                continue;
            }
            let snapshot = *rx.borrow_and_update();
            self.write_progress(id, snapshot).await;
            last_write = Some(Instant::now());
            pending = false;
        }

        if pending {
            let snapshot = *rx.borrow();
            self.write_progress(id, snapshot).await;
        }
    }

    async fn write_progress(&self, id: JobId, snapshot: TransferProgress) {
        let update = ProgressUpdate {
            bytes_written: snapshot.bytes_written,
            content_length: snapshot.content_length,
            progress: snapshot.fraction(),
        };
        match self.store.update_progress(id, &update).await {
            Ok(true) => self.emit(Event::Progress {
                id,
                progress: update.progress.unwrap_or(0.0),
                bytes_written: snapshot.bytes_written,
            }),
            Ok(false) => {}
            Err(e) => tracing::warn!(job_id = id.0, error = %e, "Failed to persist progress"),
        }
    }

    async fn complete(&self, job: Job, outcome: FetchOutcome) -> Result<JobOutcome> {
        let id = job.id;
        let update = JobUpdate {
            status: Some(Status::Completed),
            progress: Some(1.0),
            bytes_written: Some(outcome.bytes_written),
            file_size: Some(Some(outcome.content_length.unwrap_or(outcome.bytes_written))),
            completed_at: Some(Some(Utc::now())),
            next_retry_at: Some(None),
            error: Some(None),
            ..Default::default()
        };

        let Some(done) = self
            .store
            .update_job_if(id, &[Status::Downloading], &update)
            .await?
        else {
            tracing::debug!(job_id = id.0, "Transfer finished after job left downloading");
            return Ok(JobOutcome::Interrupted);
        };

        tracing::info!(
            job_id = id.0,
            bytes = outcome.bytes_written,
            resumed_from = outcome.resumed_from,
            "Download complete"
        );
        self.emit(Event::Completed {
            id,
            path: done.local_path.clone(),
        });

        if done.catalog {
            self.catalogue(&done).await;
        }

        Ok(JobOutcome::Completed)
    }

    /// Hand a completed download to the catalogue; failures never undo completion
    async fn catalogue(&self, job: &Job) {
        let result = self.catalog.add(job, &job.metadata).await;

        if !result.success {
            let error = result
                .error
                .unwrap_or_else(|| "catalog rejected the file".to_string());
            tracing::warn!(
                job_id = job.id.0,
                catalog = self.catalog.name(),
                error = %error,
                "Cataloguing failed, download stays completed"
            );
            self.emit(Event::CatalogFailed { id: job.id, error });
            return;
        }

        if let Some(entry_id) = &result.catalog_entry_id {
            let update = JobUpdate {
                catalog_entry_id: Some(Some(entry_id.clone())),
                ..Default::default()
            };
            if let Err(e) = self.store.update_job(job.id, &update).await {
                tracing::warn!(job_id = job.id.0, error = %e, "Failed to store catalog entry id");
            }
        }

        tracing::info!(job_id = job.id.0, entry_id = ?result.catalog_entry_id, "Catalogued download");
        self.emit(Event::Catalogued {
            id: job.id,
            entry_id: result.catalog_entry_id,
        });
    }

    async fn record_failure(&self, job: &Job, error: &str) -> Result<JobOutcome> {
        let next_retry_at =
            retry::next_retry_at(&self.config.retry, job.retry_count + 1, Utc::now());

        let attempt = self
            .store
            .record_failed_attempt(
                job.id,
                error,
                self.config.download.max_retries,
                Some(next_retry_at),
            )
            .await?;

        let Some(attempt) = attempt else {
            return Ok(JobOutcome::Interrupted);
        };

        if attempt.exhausted {
            tracing::error!(
                job_id = job.id.0,
                retry_count = attempt.job.retry_count,
                error,
                "Retries exhausted, job failed"
            );
            self.emit(Event::Failed {
                id: job.id,
                error: error.to_string(),
            });
            Ok(JobOutcome::Failed)
        } else {
            tracing::info!(
                job_id = job.id.0,
                retry_count = attempt.job.retry_count,
                next_retry_at = %next_retry_at,
                "Job will be retried"
            );
            self.emit(Event::Retrying {
                id: job.id,
                retry_count: attempt.job.retry_count,
                error: error.to_string(),
            });
            Ok(JobOutcome::Retrying)
        }
    }
}

enum SignedUrlError {
    Signing(SigningError),
    Store(Error),
}

impl From<SigningError> for SignedUrlError {
    fn from(e: SigningError) -> Self {
        SignedUrlError::Signing(e)
    }
}
