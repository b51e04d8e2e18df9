
pub(super) use super::test_helpers::{FetchMode, MockFetcher, Mocks, create_test_queue, open_queue, test_config};
pub(super) use crate::error::Error;
pub(super) use crate::store::JobUpdate;
pub(super) use crate::types::{EnqueueOptions, Event, JobId, Status};
pub(super) use crate::DownloadQueue;
pub(super) use std::sync::atomic::Ordering;
pub(super) use std::time::Duration;

const BODY: &[u8] = b"In the beginning God created the heaven and the earth.";

/// Enqueue a plain job for `file_name` with `priority`
async fn enqueue(queue: &DownloadQueue, file_name: &str, priority: i32) -> JobId {
    queue
        .enqueue(
            &format!("ENGESVN2DA/{file_name}"),
            file_name,
            EnqueueOptions {
                priority,
                ..Default::default()
            },
        )
        .await
        .unwrap()
}

async fn status_of(queue: &DownloadQueue, id: JobId) -> Status {
    queue.status(id).await.unwrap().unwrap().status
}

/// Everything broadcast so far, without waiting
fn drain(rx: &mut tokio::sync::broadcast::Receiver<Event>) -> Vec<Event> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

/// Start a pass in the background and wait until the blocking fetcher is mid-transfer
async fn start_blocked_pass(
    queue: &DownloadQueue,
    fetcher: &MockFetcher,
) -> tokio::task::JoinHandle<crate::Result<crate::ProcessSummary>> {
    let runner = queue.clone();
    let handle = tokio::spawn(async move { runner.process_queue().await });
    tokio::time::timeout(Duration::from_secs(5), fetcher.started.notified())
        .await
        .expect("transfer never started");
    handle
}
