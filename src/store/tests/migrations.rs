use super::open_store;
use crate::store::JobStore;
use crate::store::migrations::SCHEMA_VERSION;
use tempfile::{NamedTempFile, tempdir};

#[tokio::test]
async fn test_open_applies_all_migrations() {
    let (store, _temp) = open_store().await;

    assert_eq!(store.schema_version().await.unwrap(), SCHEMA_VERSION);

    let tables: Vec<String> = sqlx::query_scalar(
        "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
    )
    .fetch_all(store.pool())
    .await
    .unwrap();

    for expected in ["jobs", "queue_entries", "runtime_state", "schema_version", "stats"] {
        assert!(tables.iter().any(|t| t == expected), "missing table {expected}");
    }

    store.close().await;
}

#[tokio::test]
async fn test_reopen_does_not_reapply_migrations() {
    let temp_file = NamedTempFile::new().unwrap();

    let store = JobStore::open(temp_file.path()).await.unwrap();
    store.close().await;

    let store = JobStore::open(temp_file.path()).await.unwrap();
    let applied: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM schema_version")
        .fetch_one(store.pool())
        .await
        .unwrap();
    assert_eq!(applied, SCHEMA_VERSION);

    store.close().await;
}

#[tokio::test]
async fn test_open_creates_missing_parent_directory() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("nested").join("deeper").join("queue.db");

    let store = JobStore::open(&path).await.unwrap();
    assert!(path.exists());

    store.close().await;
}

#[tokio::test]
async fn test_newer_schema_is_rejected() {
    let temp_file = NamedTempFile::new().unwrap();

    let store = JobStore::open(temp_file.path()).await.unwrap();
    sqlx::query("INSERT INTO schema_version (version, applied_at) VALUES (99, 0)")
        .execute(store.pool())
        .await
        .unwrap();
    store.close().await;

    let result = JobStore::open(temp_file.path()).await;
    assert!(result.is_err(), "opening a newer schema should fail");
}

#[tokio::test]
async fn test_query_after_close_returns_error() {
    let (store, _temp) = open_store().await;
    store.close().await;

    let result = store.get_all_jobs().await;
    assert!(result.is_err(), "closed store should return an error, not hang");
}
