//! Common test utilities for scripture-dl integration tests

use std::time::Duration;

use scripture_dl::{Config, DownloadQueue, Event, JobId, RetryConfig};
use tempfile::TempDir;

/// Result of waiting for a job to settle
#[derive(Debug, PartialEq)]
#[allow(dead_code)]
pub enum WaitResult {
    /// Job completed
    Completed,
    /// Job failed with this error
    Failed(String),
    /// Timeout waiting for a terminal event
    Timeout,
}

/// Config rooted in a fresh temp dir: no scheduler, no retry delays
#[allow(dead_code)]
pub fn test_config() -> (Config, TempDir) {
    let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
    let mut config = Config::with_data_dir(temp_dir.path());
    config.download.auto_process = false;
    config.download.max_retries = 3;
    config.retry = RetryConfig::immediate();
    (config, temp_dir)
}

/// Queue with the default HTTP fetcher and no signing
#[allow(dead_code)]
pub async fn create_test_queue() -> (DownloadQueue, TempDir) {
    let (config, temp_dir) = test_config();
    let queue = DownloadQueue::with_defaults(config)
        .await
        .expect("Failed to open queue");
    (queue, temp_dir)
}

/// Wait for `id` to complete or fail, driven by the background scheduler
#[allow(dead_code)]
pub async fn wait_for_terminal(queue: &DownloadQueue, id: JobId, timeout: Duration) -> WaitResult {
    let mut events = queue.subscribe();

    // The job may have settled before we subscribed
    if let Ok(Some(job)) = queue.status(id).await {
        match job.status {
            scripture_dl::Status::Completed => return WaitResult::Completed,
            scripture_dl::Status::Failed => {
                return WaitResult::Failed(job.error.unwrap_or_default());
            }
            _ => {}
        }
    }

    let result = tokio::time::timeout(timeout, async {
        loop {
            match events.recv().await {
                Ok(Event::Completed { id: event_id, .. }) if event_id == id => {
                    return WaitResult::Completed;
                }
                Ok(Event::Failed { id: event_id, error }) if event_id == id => {
                    return WaitResult::Failed(error);
                }
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                    return WaitResult::Timeout;
                }
            }
        }
    })
    .await;

    result.unwrap_or(WaitResult::Timeout)
}
