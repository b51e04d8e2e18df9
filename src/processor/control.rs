//! Job control: pause, resume, cancel, priority.

use std::time::Duration;

use crate::error::{Error, Result};
use crate::store::JobUpdate;
use crate::types::{Event, Job, JobId, Status};

use super::QueueProcessor;

/// How long cancel waits for an interrupted transfer to let go of its file
const CANCEL_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

impl QueueProcessor {
    /// Pause a job
    ///
    /// A pending job simply leaves the queue. A downloading job is stopped
    /// through its cancellation token; the partial file stays on disk so a
    /// later resume continues from where it stopped. Pausing a paused job is
    /// a no-op.
    ///
    /// # Errors
    ///
    /// [`Error::JobNotFound`] for unknown ids, [`Error::InvalidState`] for
    /// completed, failed or cancelled jobs.
    pub async fn pause(&self, id: JobId) -> Result<Job> {
        let job = self.load(id).await?;

        match job.status {
            Status::Paused => return Ok(job),
            Status::Pending | Status::Downloading => {}
            Status::Completed | Status::Failed | Status::Cancelled => {
                return Err(invalid_state(&job, "pause"));
            }
        }

        let Some(paused) = self
            .store
            .update_job_if(
                id,
                &[Status::Pending, Status::Downloading],
                &JobUpdate::status(Status::Paused),
            )
            .await?
        else {
            return Err(invalid_state(&self.load(id).await?, "pause"));
        };

        if let Some(token) = self.state.active.lock().await.get(&id) {
            token.cancel();
        }

        tracing::info!(job_id = id.0, "Job paused");
        self.emit(Event::Paused { id });
        Ok(paused)
    }

    /// Resume a paused job
    ///
    /// The job goes back to `pending` with a fresh queue entry and any retry
    /// delay cleared. Resuming a job that is already pending or downloading
    /// is a no-op.
    ///
    /// # Errors
    ///
    /// [`Error::JobNotFound`] for unknown ids, [`Error::InvalidState`] for
    /// completed, failed or cancelled jobs.
    pub async fn resume(&self, id: JobId) -> Result<Job> {
        let job = self.load(id).await?;

        match job.status {
            Status::Pending | Status::Downloading => return Ok(job),
            Status::Paused => {}
            Status::Completed | Status::Failed | Status::Cancelled => {
                return Err(invalid_state(&job, "resume"));
            }
        }

        let Some(resumed) = self.store.reopen(id, &[Status::Paused], false).await? else {
            return Err(invalid_state(&self.load(id).await?, "resume"));
        };

        tracing::info!(job_id = id.0, "Job resumed");
        self.emit(Event::Resumed { id });
        self.wake();
        Ok(resumed)
    }

    /// Cancel a job
    ///
    /// Stops any running transfer, waits briefly for it to release the file,
    /// then deletes the partial download. A job that never started leaves the
    /// file at its path alone. Cancelling a cancelled job is a no-op.
    ///
    /// # Errors
    ///
    /// [`Error::JobNotFound`] for unknown ids, [`Error::InvalidState`] for
    /// completed or failed jobs.
    pub async fn cancel(&self, id: JobId) -> Result<Job> {
        let job = self.load(id).await?;

        match job.status {
            Status::Cancelled => return Ok(job),
            Status::Pending | Status::Downloading | Status::Paused => {}
            Status::Completed | Status::Failed => {
                return Err(invalid_state(&job, "cancel"));
            }
        }

        let Some(cancelled) = self
            .store
            .update_job_if(
                id,
                &[Status::Pending, Status::Downloading, Status::Paused],
                &JobUpdate::status(Status::Cancelled),
            )
            .await?
        else {
            return Err(invalid_state(&self.load(id).await?, "cancel"));
        };

        if let Some(token) = self.state.active.lock().await.get(&id) {
            token.cancel();
        }

        if !self.wait_for_release(id, CANCEL_DRAIN_TIMEOUT).await {
            tracing::warn!(job_id = id.0, "Transfer did not stop in time, removing file anyway");
        }

        // A job that never started has no partial file of its own
        if cancelled.started_at.is_some() {
            match tokio::fs::remove_file(&cancelled.local_path).await {
                Ok(()) => {
                    tracing::debug!(job_id = id.0, path = %cancelled.local_path.display(), "Removed partial download")
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    tracing::warn!(job_id = id.0, error = %e, "Failed to remove partial download")
                }
            }
        }

        tracing::info!(job_id = id.0, "Job cancelled");
        self.emit(Event::Cancelled { id });
        Ok(cancelled)
    }

    /// Change a job's priority; a queued job moves to its new position
    ///
    /// # Errors
    ///
    /// [`Error::InvalidState`] for completed, failed or cancelled jobs.
    pub async fn set_priority(&self, id: JobId, priority: i32) -> Result<Job> {
        let job = self.load(id).await?;
        if job.status.is_terminal() {
            return Err(invalid_state(&job, "reprioritize"));
        }

        let job = self.store.set_priority(id, priority).await?;
        tracing::debug!(job_id = id.0, priority, "Job priority changed");
        Ok(job)
    }

    async fn load(&self, id: JobId) -> Result<Job> {
        self.store.get_job(id).await?.ok_or(Error::JobNotFound(id))
    }

    /// Poll until the job's transfer has deregistered, or `timeout` passes
    pub(crate) async fn wait_for_release(&self, id: JobId, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if !self.state.active.lock().await.contains_key(&id) {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}

fn invalid_state(job: &Job, operation: &str) -> Error {
    Error::InvalidState {
        id: job.id,
        operation: operation.to_string(),
        current_state: format!("{:?}", job.status),
    }
}
