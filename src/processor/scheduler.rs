//! Background loop that keeps processing passes running.

use super::QueueProcessor;

impl QueueProcessor {
    /// Spawn the background scheduler
    ///
    /// The scheduler runs a pass whenever it is woken (new work, resume,
    /// retry) or the poll interval elapses, and immediately again while a
    /// pass fills every slot and the queue is still non-empty. It stops when
    /// shutdown begins. Returns `false` if it was already running.
    pub async fn start_scheduler(&self) -> bool {
        let mut slot = self.state.scheduler.lock().await;
        if slot.is_some() {
            return false;
        }

        let this = self.clone();
        *slot = Some(tokio::spawn(async move { this.scheduler_loop().await }));
        tracing::info!(
            poll_interval_ms = self.config.download.poll_interval.as_millis() as u64,
            "Queue scheduler started"
        );
        true
    }

    async fn scheduler_loop(&self) {
        let cap = self.config.download.max_concurrent_downloads;
        let poll_interval = self.config.download.poll_interval;

        loop {
            if self.state.shutdown.is_cancelled() {
                break;
            }

            match self.process_queue().await {
                Ok(summary) if !summary.busy && summary.started >= cap => {
                    match self.store.queue_len().await {
                        Ok(0) => {}
                        Ok(_) => continue,
                        Err(e) => tracing::error!(error = %e, "Failed to read queue length"),
                    }
                }
                Ok(_) => {}
                Err(e) => tracing::error!(error = %e, "Processing pass failed"),
            }

            tokio::select! {
                _ = self.state.shutdown.cancelled() => break,
                _ = self.state.wake.notified() => {}
                _ = tokio::time::sleep(poll_interval) => {}
            }
        }

        tracing::debug!("Queue scheduler stopped");
    }
}
