//! Shared test helpers: scripted collaborators and a queue wired to them.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tempfile::{TempDir, tempdir};
use tokio::io::AsyncWriteExt;
use tokio::sync::{Notify, watch};
use tokio_util::sync::CancellationToken;

use crate::catalog::{CatalogResult, MediaCatalog};
use crate::config::{Config, RetryConfig};
use crate::error::{SigningError, TransferError};
use crate::fetcher::{FetchOutcome, FetchRequest, ResumableFetcher, TransferProgress};
use crate::queue::DownloadQueue;
use crate::signer::{SignedUrls, UrlSigner};
use crate::types::{Job, JobMetadata};

/// What the scripted fetcher does on its next calls
#[derive(Clone, Debug)]
pub(crate) enum FetchMode {
    /// Write the body (continuing any partial file) and succeed
    Succeed(Vec<u8>),
    /// Fail with this HTTP status without touching the file
    Fail(u16),
    /// Write these bytes, then hang until cancelled
    Block(Vec<u8>),
}

pub(crate) struct MockFetcher {
    mode: Mutex<FetchMode>,
    calls: AtomicUsize,
    urls: Mutex<Vec<String>>,
    /// Notified once a blocking transfer has written its partial bytes
    pub(crate) started: Notify,
}

impl MockFetcher {
    pub(crate) fn new(mode: FetchMode) -> Arc<Self> {
        Arc::new(Self {
            mode: Mutex::new(mode),
            calls: AtomicUsize::new(0),
            urls: Mutex::new(Vec::new()),
            started: Notify::new(),
        })
    }

    pub(crate) fn succeeding(body: &[u8]) -> Arc<Self> {
        Self::new(FetchMode::Succeed(body.to_vec()))
    }

    pub(crate) fn set_mode(&self, mode: FetchMode) {
        *self.mode.lock().unwrap() = mode;
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub(crate) fn urls(&self) -> Vec<String> {
        self.urls.lock().unwrap().clone()
    }
}

async fn append(path: &Path, bytes: &[u8]) {
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .unwrap();
    file.write_all(bytes).await.unwrap();
    file.flush().await.unwrap();
}

#[async_trait]
impl ResumableFetcher for MockFetcher {
    async fn fetch(
        &self,
        request: &FetchRequest,
        progress: &watch::Sender<TransferProgress>,
        cancel: &CancellationToken,
    ) -> Result<FetchOutcome, TransferError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.urls.lock().unwrap().push(request.url.clone());

        if cancel.is_cancelled() {
            return Err(TransferError::Cancelled);
        }

        let existing = tokio::fs::metadata(&request.local_path)
            .await
            .map(|m| m.len())
            .unwrap_or(0);
        let mode = self.mode.lock().unwrap().clone();

        match mode {
            FetchMode::Succeed(body) => {
                let start = (existing as usize).min(body.len());
                append(&request.local_path, &body[start..]).await;
                let total = body.len() as u64;
                let _ = progress.send(TransferProgress {
                    bytes_written: total,
                    content_length: Some(total),
                });
                Ok(FetchOutcome {
                    bytes_written: total,
                    content_length: Some(total),
                    resumed_from: start as u64,
                })
            }
            FetchMode::Fail(status) => Err(TransferError::HttpStatus { status }),
            FetchMode::Block(partial) => {
                append(&request.local_path, &partial).await;
                let _ = progress.send(TransferProgress {
                    bytes_written: existing + partial.len() as u64,
                    content_length: None,
                });
                self.started.notify_one();
                cancel.cancelled().await;
                Err(TransferError::Cancelled)
            }
        }
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}

/// Signs every reference as `https://signed.test/<ref>` unless told to fail
#[derive(Default)]
pub(crate) struct MockSigner {
    pub(crate) fail: AtomicBool,
    /// Answer successfully but leave every reference out
    pub(crate) omit: AtomicBool,
    /// Fail this many requests with a transient error, then recover
    pub(crate) flaky: AtomicUsize,
    calls: AtomicUsize,
}

impl MockSigner {
    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl UrlSigner for MockSigner {
    async fn sign(
        &self,
        remote_refs: &[String],
        _ttl_hours: u32,
    ) -> Result<SignedUrls, SigningError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let flaky = self
            .flaky
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if flaky || self.fail.load(Ordering::SeqCst) {
            return Err(SigningError::RequestFailed("signing service unavailable".to_string()));
        }

        let urls: HashMap<String, String> = if self.omit.load(Ordering::SeqCst) {
            Default::default()
        } else {
            remote_refs
                .iter()
                .map(|r| (r.clone(), format!("https://signed.test/{r}")))
                .collect()
        };
        Ok(SignedUrls {
            urls,
            expires_in_seconds: 3600,
        })
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}

/// Remembers every file it was handed; optionally rejects them all
#[derive(Default)]
pub(crate) struct RecordingCatalog {
    pub(crate) reject: AtomicBool,
    pub(crate) added: Mutex<Vec<(String, JobMetadata)>>,
}

#[async_trait]
impl MediaCatalog for RecordingCatalog {
    async fn add(&self, job: &Job, metadata: &JobMetadata) -> CatalogResult {
        if self.reject.load(Ordering::SeqCst) {
            return CatalogResult::rejected("unsupported media type");
        }
        self.added
            .lock()
            .unwrap()
            .push((job.file_name.clone(), metadata.clone()));
        CatalogResult::added(Some(format!("asset-{}", job.id)))
    }

    fn name(&self) -> &'static str {
        "recording"
    }
}

/// Collaborators handed to a test queue
pub(crate) struct Mocks {
    pub(crate) fetcher: Arc<MockFetcher>,
    pub(crate) signer: Arc<MockSigner>,
    pub(crate) catalog: Arc<RecordingCatalog>,
}

impl Mocks {
    pub(crate) fn new(fetcher: Arc<MockFetcher>) -> Self {
        Self {
            fetcher,
            signer: Arc::new(MockSigner::default()),
            catalog: Arc::new(RecordingCatalog::default()),
        }
    }
}

/// Config for tests: everything under `dir`, no scheduler, retries without delay
pub(crate) fn test_config(dir: &Path) -> Config {
    let mut config = Config::with_data_dir(dir);
    config.download.auto_process = false;
    config.download.max_concurrent_downloads = 2;
    config.download.max_retries = 3;
    config.retry = RetryConfig::immediate();
    config
}

/// Open a queue on `config` wired to `mocks`
pub(crate) async fn open_queue(config: Config, mocks: &Mocks) -> DownloadQueue {
    DownloadQueue::new(
        config,
        mocks.fetcher.clone(),
        mocks.signer.clone(),
        mocks.catalog.clone(),
    )
    .await
    .unwrap()
}

/// Helper to create a test queue in a fresh temp dir.
/// Returns the queue and the tempdir (which must be kept alive).
pub(crate) async fn create_test_queue(
    mocks: &Mocks,
    configure: impl FnOnce(&mut Config),
) -> (DownloadQueue, TempDir) {
    let temp_dir = tempdir().unwrap();
    let mut config = test_config(temp_dir.path());
    configure(&mut config);
    let queue = open_queue(config, mocks).await;
    (queue, temp_dir)
}
