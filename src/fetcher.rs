//! Resumable byte transfer collaborator
//!
//! A [`ResumableFetcher`] moves the bytes of one job from a URL into its local
//! file. The processor maps the user-level controls onto it like this:
//!
//! - start: [`ResumableFetcher::fetch`]
//! - pause and cancel: trigger the [`CancellationToken`]; the fetcher stops at
//!   the next chunk boundary, flushes, and returns [`TransferError::Cancelled`]
//!   leaving the partial file on disk (cancel deletes it afterwards)
//! - resume: call `fetch` again; implementations continue from the length of
//!   the partial file when the server allows it
//!
//! Progress is published through a [`watch`] channel so the processor can
//! persist it at its own pace without the fetcher ever blocking on storage.

use crate::config::RetryConfig;
use crate::error::TransferError;
use crate::retry::download_with_retry;
use crate::types::JobId;
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::StatusCode;
use reqwest::header::RANGE;
use std::path::PathBuf;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// One transfer to perform
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    /// Job the transfer belongs to (for logging)
    pub job_id: JobId,
    /// Directly fetchable URL
    pub url: String,
    /// Destination file; may already hold a partial download
    pub local_path: PathBuf,
    /// Total size, if known ahead of time
    pub expected_size: Option<u64>,
}

/// Snapshot of a running transfer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferProgress {
    /// Bytes in the local file so far, including any resumed prefix
    pub bytes_written: u64,
    /// Full length of the resource, once known
    pub content_length: Option<u64>,
}

impl TransferProgress {
    /// Fraction complete, when the total is known
    pub fn fraction(&self) -> Option<f64> {
        match self.content_length {
            Some(total) if total > 0 => Some((self.bytes_written as f64 / total as f64).min(1.0)),
            _ => None,
        }
    }
}

/// Result of a finished transfer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FetchOutcome {
    /// Final size of the local file
    pub bytes_written: u64,
    /// Length reported by the server, if any
    pub content_length: Option<u64>,
    /// Offset the transfer resumed from (0 for a fresh download)
    pub resumed_from: u64,
}

/// Performs one resumable download to a local path
#[async_trait]
pub trait ResumableFetcher: Send + Sync {
    /// Download `request.url` into `request.local_path`
    ///
    /// Must return [`TransferError::Cancelled`] (and nothing else) when
    /// `cancel` fires, and must leave whatever was written on disk.
    async fn fetch(
        &self,
        request: &FetchRequest,
        progress: &watch::Sender<TransferProgress>,
        cancel: &CancellationToken,
    ) -> Result<FetchOutcome, TransferError>;

    /// Short name used in logs
    fn name(&self) -> &'static str {
        "custom"
    }
}

/// HTTP fetcher built on reqwest
///
/// Resumes with `Range: bytes=N-` from the size of the existing partial file.
/// A server that ignores the range and answers `200` gets the file rewritten
/// from scratch. Connection-level failures while setting up the request are
/// retried in place according to [`RetryConfig::request_attempts`]; anything
/// else is returned to the processor, which counts it as a failed attempt.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    retry: RetryConfig,
}

impl HttpFetcher {
    /// Fetcher with a default client
    pub fn new(retry: RetryConfig) -> Self {
        Self::with_client(reqwest::Client::new(), retry)
    }

    /// Fetcher using a preconfigured client (timeouts, proxies, headers)
    pub fn with_client(client: reqwest::Client, retry: RetryConfig) -> Self {
        Self { client, retry }
    }

    async fn send(&self, url: &str, offset: u64) -> Result<reqwest::Response, TransferError> {
        let mut request = self.client.get(url);
        if offset > 0 {
            request = request.header(RANGE, format!("bytes={}-", offset));
        }

        let response = request.send().await?;
        let status = response.status();

        if status.is_success() || (offset > 0 && status == StatusCode::RANGE_NOT_SATISFIABLE) {
            Ok(response)
        } else {
            Err(TransferError::HttpStatus {
                status: status.as_u16(),
            })
        }
    }
}

impl Default for HttpFetcher {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}

fn validate_url(url: &str) -> Result<(), TransferError> {
    let parsed = url::Url::parse(url).map_err(|e| TransferError::InvalidUrl {
        url: url.to_string(),
        reason: e.to_string(),
    })?;

    match parsed.scheme() {
        "http" | "https" => Ok(()),
        other => Err(TransferError::InvalidUrl {
            url: url.to_string(),
            reason: format!("unsupported scheme {}", other),
        }),
    }
}

async fn existing_len(path: &std::path::Path) -> Result<u64, TransferError> {
    match tokio::fs::metadata(path).await {
        Ok(meta) => Ok(meta.len()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
        Err(e) => Err(TransferError::Disk(e)),
    }
}

#[async_trait]
impl ResumableFetcher for HttpFetcher {
    async fn fetch(
        &self,
        request: &FetchRequest,
        progress: &watch::Sender<TransferProgress>,
        cancel: &CancellationToken,
    ) -> Result<FetchOutcome, TransferError> {
        validate_url(&request.url)?;

        if cancel.is_cancelled() {
            return Err(TransferError::Cancelled);
        }

        let offset = existing_len(&request.local_path).await?;

        if let Some(size) = request.expected_size
            && size > 0
            && offset >= size
        {
            tracing::debug!(job_id = request.job_id.0, bytes = offset, "Local file already complete");
            progress.send_replace(TransferProgress {
                bytes_written: offset,
                content_length: Some(size),
            });
            return Ok(FetchOutcome {
                bytes_written: offset,
                content_length: Some(size),
                resumed_from: offset,
            });
        }

        if let Some(parent) = request.local_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let response = tokio::select! {
            response = download_with_retry(&self.retry, || self.send(&request.url, offset)) => response?,
            _ = cancel.cancelled() => return Err(TransferError::Cancelled),
        };

        // The server says there is nothing past our offset: the partial file is the whole file
        if response.status() == StatusCode::RANGE_NOT_SATISFIABLE {
            tracing::debug!(job_id = request.job_id.0, bytes = offset, "Range not satisfiable, treating file as complete");
            progress.send_replace(TransferProgress {
                bytes_written: offset,
                content_length: Some(offset),
            });
            return Ok(FetchOutcome {
                bytes_written: offset,
                content_length: Some(offset),
                resumed_from: offset,
            });
        }

        let resumed = response.status() == StatusCode::PARTIAL_CONTENT;
        let start = if resumed { offset } else { 0 };
        if offset > 0 && !resumed {
            tracing::info!(
                job_id = request.job_id.0,
                discarded = offset,
                "Server ignored range request, restarting download from zero"
            );
        }

        let content_length = response
            .content_length()
            .map(|len| start + len)
            .or(request.expected_size);

        let file = if resumed {
            tokio::fs::OpenOptions::new()
                .append(true)
                .open(&request.local_path)
                .await?
        } else {
            tokio::fs::File::create(&request.local_path).await?
        };
        let mut writer = BufWriter::new(file);

        let mut written = start;
        progress.send_replace(TransferProgress {
            bytes_written: written,
            content_length,
        });

        let mut stream = response.bytes_stream();
        loop {
            let chunk = tokio::select! {
                chunk = stream.next() => chunk,
                _ = cancel.cancelled() => {
                    writer.flush().await?;
                    tracing::debug!(job_id = request.job_id.0, bytes = written, "Transfer cancelled");
                    return Err(TransferError::Cancelled);
                }
            };

            let Some(chunk) = chunk else {
                break;
            };
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => {
                    writer.flush().await?;
                    return Err(TransferError::Network(e));
                }
            };

            writer.write_all(&chunk).await?;
            written += chunk.len() as u64;
            progress.send_replace(TransferProgress {
                bytes_written: written,
                content_length,
            });
        }

        writer.flush().await?;

        if let Some(total) = content_length
            && written < total
        {
            return Err(TransferError::Other(format!(
                "connection closed after {} of {} bytes",
                written, total
            )));
        }

        Ok(FetchOutcome {
            bytes_written: written,
            content_length,
            resumed_from: start,
        })
    }

    fn name(&self) -> &'static str {
        "http"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_http_urls_are_accepted() {
        assert!(validate_url("https://cdn.example/a.mp3").is_ok());
        assert!(validate_url("http://cdn.example/a.mp3").is_ok());
        assert!(matches!(
            validate_url("ftp://cdn.example/a.mp3"),
            Err(TransferError::InvalidUrl { .. })
        ));
        assert!(matches!(
            validate_url("ENGESVN2DA/B01___01_Matthew.mp3"),
            Err(TransferError::InvalidUrl { .. })
        ));
    }

    #[test]
    fn fraction_needs_a_known_length() {
        let unknown = TransferProgress {
            bytes_written: 10,
            content_length: None,
        };
        assert_eq!(unknown.fraction(), None);

        let half = TransferProgress {
            bytes_written: 50,
            content_length: Some(100),
        };
        assert_eq!(half.fraction(), Some(0.5));

        let over = TransferProgress {
            bytes_written: 150,
            content_length: Some(100),
        };
        assert_eq!(over.fraction(), Some(1.0));
    }
}
