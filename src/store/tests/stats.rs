use super::{new_job, open_store};
use crate::store::JobUpdate;
use crate::types::{QueueEntry, Status};

#[tokio::test]
async fn test_stats_track_transitions_incrementally() {
    let (store, _temp) = open_store().await;

    let a = store.add_job(&new_job("a.mp3", 0)).await.unwrap();
    let b = store.add_job(&new_job("b.mp3", 0)).await.unwrap();
    let c = store.add_job(&new_job("c.mp3", 0)).await.unwrap();
    store.enqueue(&QueueEntry::for_job(&c)).await.unwrap();

    store
        .update_job(
            a.id,
            &JobUpdate {
                status: Some(Status::Completed),
                bytes_written: Some(2048),
                progress: Some(1.0),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    // Re-writing the same status must not count twice
    store
        .update_job(a.id, &JobUpdate::status(Status::Completed))
        .await
        .unwrap();
    store
        .update_job(b.id, &JobUpdate::status(Status::Paused))
        .await
        .unwrap();

    let stats = store.get_stats().await.unwrap();
    assert_eq!(stats.total_jobs, 3);
    assert_eq!(stats.completed, 1);
    assert_eq!(stats.bytes_downloaded, 2048);
    assert_eq!(stats.failed, 0);
    assert_eq!(stats.pending, 1);
    assert_eq!(stats.paused, 1);
    assert_eq!(stats.downloading, 0);
    assert_eq!(stats.queue_length, 1);

    store.close().await;
}

#[tokio::test]
async fn test_batch_summary_aggregates_jobs() {
    let (store, _temp) = open_store().await;

    let mut ids = Vec::new();
    for (name, size) in [("jhn1.mp3", 1000), ("jhn2.mp3", 3000)] {
        let mut job = new_job(name, 0);
        job.batch_id = Some("john".to_string());
        job.file_size = Some(size);
        ids.push(store.add_job(&job).await.unwrap().id);
    }

    store
        .update_job(
            ids[0],
            &JobUpdate {
                status: Some(Status::Completed),
                bytes_written: Some(1000),
                progress: Some(1.0),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let summary = store.batch_summary("john").await.unwrap().unwrap();
    assert_eq!(summary.total, 2);
    assert_eq!(summary.by_status.get("completed"), Some(&1));
    assert_eq!(summary.by_status.get("pending"), Some(&1));
    assert_eq!(summary.bytes_written, 1000);
    assert_eq!(summary.known_size, 4000);
    assert_eq!(summary.progress, 0.5);
    assert!(!summary.is_complete());

    assert!(store.batch_summary("missing").await.unwrap().is_none());

    store.close().await;
}
