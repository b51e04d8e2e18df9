use super::{new_job, open_store};
use crate::store::{JobStore, JobUpdate, RecoveryReport};
use crate::types::{QueueEntry, Status};
use tempfile::NamedTempFile;

#[tokio::test]
async fn test_fresh_store_is_not_unclean() {
    let (store, _temp) = open_store().await;
    assert!(!store.was_unclean_shutdown().await.unwrap());
    store.close().await;
}

#[tokio::test]
async fn test_clean_shutdown_tracking() {
    let temp_file = NamedTempFile::new().unwrap();

    let store = JobStore::open(temp_file.path()).await.unwrap();
    store.set_clean_start().await.unwrap();
    store.close().await;

    // Started but never shut down: unclean
    let store = JobStore::open(temp_file.path()).await.unwrap();
    assert!(store.was_unclean_shutdown().await.unwrap());

    store.set_clean_start().await.unwrap();
    store.set_clean_shutdown().await.unwrap();
    store.close().await;

    let store = JobStore::open(temp_file.path()).await.unwrap();
    assert!(!store.was_unclean_shutdown().await.unwrap());
    store.close().await;
}

#[tokio::test]
async fn test_recover_resets_downloading_and_rebuilds_queue() {
    let (store, _temp) = open_store().await;

    let interrupted = store.add_job(&new_job("interrupted.mp3", 0)).await.unwrap();
    let lost_entry = store.add_job(&new_job("lost.mp3", 0)).await.unwrap();
    let paused = store.add_job(&new_job("paused.mp3", 0)).await.unwrap();

    store.enqueue(&QueueEntry::for_job(&interrupted)).await.unwrap();
    store.enqueue(&QueueEntry::for_job(&paused)).await.unwrap();

    // Simulate a crash mid-transfer with some bytes already on disk
    store
        .update_job(
            interrupted.id,
            &JobUpdate {
                status: Some(Status::Downloading),
                bytes_written: Some(4096),
                progress: Some(0.25),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    // A paused job whose entry survived by accident
    sqlx::query("UPDATE jobs SET status = ? WHERE id = ?")
        .bind(Status::Paused.to_i32())
        .bind(paused.id)
        .execute(store.pool())
        .await
        .unwrap();

    let report = store.recover_interrupted().await.unwrap();
    assert_eq!(
        report,
        RecoveryReport {
            reset_downloading: 1,
            orphans_removed: 1,
            requeued: 1,
        }
    );

    let job = store.get_job(interrupted.id).await.unwrap().unwrap();
    assert_eq!(job.status, Status::Pending);
    assert_eq!(job.bytes_written, 4096, "partial bytes are kept");
    assert_eq!(job.progress, 0.25);

    let mut queued: Vec<_> = store
        .queue_entries()
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.job_id)
        .collect();
    queued.sort();
    assert_eq!(queued, vec![interrupted.id, lost_entry.id]);

    // Second run finds nothing to do
    assert_eq!(
        store.recover_interrupted().await.unwrap(),
        RecoveryReport::default()
    );

    store.close().await;
}

#[tokio::test]
async fn test_jobs_to_resume_includes_pending_and_downloading() {
    let (store, _temp) = open_store().await;

    let pending = store.add_job(&new_job("pending.mp3", 0)).await.unwrap();
    let downloading = store.add_job(&new_job("downloading.mp3", 9)).await.unwrap();
    let paused = store.add_job(&new_job("paused.mp3", 0)).await.unwrap();
    store
        .update_job(downloading.id, &JobUpdate::status(Status::Downloading))
        .await
        .unwrap();
    store
        .update_job(paused.id, &JobUpdate::status(Status::Paused))
        .await
        .unwrap();

    let resumable = store.get_jobs_to_resume().await.unwrap();
    assert_eq!(
        resumable.iter().map(|j| j.id).collect::<Vec<_>>(),
        vec![downloading.id, pending.id]
    );

    store.close().await;
}
