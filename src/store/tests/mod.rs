mod migrations;
mod state;
mod stats;

use crate::store::{JobStore, NewJob};
use crate::types::JobMetadata;
use std::path::PathBuf;
use tempfile::NamedTempFile;

async fn open_store() -> (JobStore, NamedTempFile) {
    let temp_file = NamedTempFile::new().unwrap();
    let store = JobStore::open(temp_file.path()).await.unwrap();
    (store, temp_file)
}

fn new_job(file_name: &str, priority: i32) -> NewJob {
    NewJob {
        remote_ref: format!("ENGESVN2DA/{}", file_name),
        file_name: file_name.to_string(),
        local_path: PathBuf::from("/downloads").join(file_name),
        priority,
        batch_id: None,
        file_size: None,
        catalog: false,
        metadata: JobMetadata::new(),
    }
}
