//! Startup recovery and graceful shutdown.

use std::sync::atomic::Ordering;

use crate::error::Result;
use crate::store::RecoveryReport;
use crate::types::Event;

use super::QueueProcessor;

impl QueueProcessor {
    /// Bring persisted state back to a runnable shape after a restart
    ///
    /// Jobs left `downloading` by a crash or kill go back to `pending`, stale
    /// queue entries are dropped and every pending job gets an entry again.
    pub async fn restore(&self) -> Result<RecoveryReport> {
        if self.store.was_unclean_shutdown().await? {
            tracing::warn!("Previous session did not shut down cleanly, recovering interrupted jobs");
        }

        let report = self.store.recover_interrupted().await?;
        if report.reset_downloading > 0 || report.orphans_removed > 0 || report.requeued > 0 {
            tracing::info!(
                reset_downloading = report.reset_downloading,
                orphans_removed = report.orphans_removed,
                requeued = report.requeued,
                "Restored queue state"
            );
        }
        Ok(report)
    }

    /// Gracefully shut down processing
    ///
    /// This method performs a graceful shutdown sequence:
    /// 1. Stops accepting new work and stops the scheduler
    /// 2. Cancels all in-flight transfers
    /// 3. Waits up to `shutdown_grace_period` for them to stop
    /// 4. Returns interrupted jobs to `pending` so the next start resumes them
    /// 5. Marks the shutdown as clean and emits [`Event::Shutdown`]
    ///
    /// # Errors
    ///
    /// Returns an error if the final state cannot be persisted.
    pub async fn shutdown(&self) -> Result<()> {
        tracing::info!("Initiating graceful shutdown");

        self.state.accepting_new.store(false, Ordering::SeqCst);
        self.state.shutdown.cancel();

        let active_count = self.active_count().await;
        tracing::debug!(active_count, "Signaled cancellation to all active transfers");

        let grace = self.config.download.shutdown_grace_period;
        if tokio::time::timeout(grace, self.wait_for_idle()).await.is_err() {
            tracing::warn!("Timeout waiting for transfers to stop, proceeding with shutdown");
        }

        let scheduler = self.state.scheduler.lock().await.take();
        if let Some(handle) = scheduler
            && tokio::time::timeout(grace, handle).await.is_err()
        {
            tracing::warn!("Scheduler did not stop within the grace period");
        }

        let report = self.store.recover_interrupted().await?;
        tracing::debug!(
            reset_downloading = report.reset_downloading,
            "Persisted interrupted jobs for resume"
        );

        self.store.set_clean_shutdown().await?;
        self.emit(Event::Shutdown);

        tracing::info!("Graceful shutdown complete");
        Ok(())
    }

    async fn wait_for_idle(&self) {
        loop {
            let active_count = self.active_count().await;
            if active_count == 0 {
                return;
            }

            tracing::debug!(active_count, "Waiting for active transfers to stop");
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        }
    }
}
