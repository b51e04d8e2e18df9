//! Retry logic with exponential backoff
//!
//! Two layers use the same [`RetryConfig`]:
//! - [`backoff_delay`] / [`next_retry_at`] compute how long a job waits after a
//!   failed attempt before the scheduler picks it up again
//! - [`download_with_retry`] retries a single operation in place when it fails
//!   with a transient error, which the HTTP fetcher uses for connection setup
//!
//! # Example
//!
//! ```no_run
//! use scripture_dl::retry::{IsRetryable, download_with_retry};
//! use scripture_dl::config::RetryConfig;
//!
//! #[derive(Debug)]
//! enum MyError {
//!     Transient,
//!     Permanent,
//! }
//!
//! impl std::fmt::Display for MyError {
//!     fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
//!         write!(f, "{self:?}")
//!     }
//! }
//!
//! impl IsRetryable for MyError {
//!     fn is_retryable(&self) -> bool {
//!         matches!(self, MyError::Transient)
//!     }
//! }
//!
//! # async fn example() -> Result<(), MyError> {
//! let config = RetryConfig::default();
//! download_with_retry(&config, || async {
//!     Ok::<_, MyError>(())
//! }).await?;
//! # Ok(())
//! # }
//! ```

use crate::config::RetryConfig;
use crate::error::{SigningError, TransferError};
use chrono::{DateTime, Utc};
use rand::Rng;
use std::future::Future;
use std::time::Duration;

/// Trait for errors that can be classified as retryable or not
///
/// Transient failures (timeouts, refused connections, server busy) return `true`.
/// Permanent failures (bad URL, missing resource, disk errors) return `false`.
pub trait IsRetryable {
    /// Returns true if the error is transient and the operation should be retried
    fn is_retryable(&self) -> bool;
}

impl IsRetryable for TransferError {
    fn is_retryable(&self) -> bool {
        match self {
            TransferError::Network(e) => e.is_timeout() || e.is_connect(),
            // 408 Request Timeout, 429 Too Many Requests, and 5xx are worth another try
            TransferError::HttpStatus { status } => {
                *status == 408 || *status == 429 || (500..600).contains(status)
            }
            TransferError::Disk(e) => matches!(
                e.kind(),
                std::io::ErrorKind::TimedOut | std::io::ErrorKind::Interrupted
            ),
            TransferError::Cancelled => false,
            TransferError::InvalidUrl { .. } => false,
            TransferError::Other(_) => false,
        }
    }
}

impl IsRetryable for SigningError {
    fn is_retryable(&self) -> bool {
        matches!(self, SigningError::RequestFailed(_))
    }
}

/// Execute an async operation with exponential backoff retry logic
///
/// Makes at most `config.request_attempts + 1` calls. Non-retryable errors are
/// returned immediately.
pub async fn download_with_retry<F, Fut, T, E>(
    config: &RetryConfig,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: IsRetryable + std::fmt::Display,
{
    let mut attempt = 0;
    let mut delay = config.initial_delay;

    loop {
        match operation().await {
            Ok(result) => {
                if attempt > 0 {
                    tracing::info!(attempts = attempt + 1, "Operation succeeded after retry");
                }
                return Ok(result);
            }
            Err(e) if e.is_retryable() && attempt < config.request_attempts => {
                attempt += 1;

                tracing::warn!(
                    error = %e,
                    attempt = attempt,
                    max_attempts = config.request_attempts,
                    delay_ms = delay.as_millis(),
                    "Operation failed, retrying"
                );

                let jittered_delay = if config.jitter {
                    add_jitter(delay)
                } else {
                    delay
                };

                tokio::time::sleep(jittered_delay).await;

                delay = scale(delay, config.backoff_multiplier, config.max_delay);
            }
            Err(e) => {
                if e.is_retryable() {
                    tracing::debug!(
                        error = %e,
                        attempts = attempt + 1,
                        "Operation failed after all retry attempts exhausted"
                    );
                } else {
                    tracing::debug!(error = %e, "Operation failed with non-retryable error");
                }
                return Err(e);
            }
        }
    }
}

/// Wait before the next attempt of a job that has failed `retry_count` times
///
/// `initial_delay * backoff_multiplier^(retry_count - 1)`, capped at
/// `max_delay`. With jitter the result lies in `[delay, 2 * delay]`.
pub fn backoff_delay(config: &RetryConfig, retry_count: u32) -> Duration {
    let exponent = retry_count.saturating_sub(1).min(i32::MAX as u32) as i32;
    let max_secs = config.max_delay.as_secs_f64();
    let raw = config.initial_delay.as_secs_f64() * config.backoff_multiplier.powi(exponent);
    let secs = if raw.is_finite() { raw.min(max_secs) } else { max_secs };
    let delay = Duration::from_secs_f64(secs.max(0.0));

    if config.jitter {
        add_jitter(delay)
    } else {
        delay
    }
}

/// Absolute time before which a job that has failed `retry_count` times is not retried
pub fn next_retry_at(config: &RetryConfig, retry_count: u32, now: DateTime<Utc>) -> DateTime<Utc> {
    let delay = backoff_delay(config, retry_count);
    match chrono::Duration::from_std(delay) {
        Ok(delay) => now + delay,
        Err(_) => now,
    }
}

fn scale(delay: Duration, multiplier: f64, max: Duration) -> Duration {
    let secs = delay.as_secs_f64() * multiplier;
    if secs.is_finite() {
        Duration::from_secs_f64(secs.max(0.0)).min(max)
    } else {
        max
    }
}

/// Add random jitter to a delay to prevent thundering herd
///
/// Jitter is uniformly distributed between 0% and 100% of the delay.
/// This means the actual delay will be between `delay` and `2 * delay`.
fn add_jitter(delay: Duration) -> Duration {
    let mut rng = rand::thread_rng();
    let jitter_factor: f64 = rng.gen_range(0.0..=1.0);
    let jittered_secs = delay.as_secs_f64() * (1.0 + jitter_factor);
    Duration::from_secs_f64(jittered_secs)
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug)]
    enum TestError {
        Transient,
        Permanent,
    }

    impl std::fmt::Display for TestError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            match self {
                TestError::Transient => write!(f, "transient error"),
                TestError::Permanent => write!(f, "permanent error"),
            }
        }
    }

    impl IsRetryable for TestError {
        fn is_retryable(&self) -> bool {
            matches!(self, TestError::Transient)
        }
    }

    fn fast_config(request_attempts: u32) -> RetryConfig {
        RetryConfig {
            request_attempts,
            initial_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(50),
            backoff_multiplier: 2.0,
            jitter: false,
        }
    }

    #[tokio::test]
    async fn test_success_no_retry() {
        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = counter.clone();

        let result = download_with_retry(&fast_config(3), || {
            let counter = counter_clone.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<_, TestError>(42)
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(counter.load(Ordering::SeqCst), 1, "should only call once");
    }

    #[tokio::test]
    async fn test_retry_transient_then_succeed() {
        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = counter.clone();

        let result = download_with_retry(&fast_config(3), || {
            let counter = counter_clone.clone();
            async move {
                let count = counter.fetch_add(1, Ordering::SeqCst);
                if count < 2 {
                    Err(TestError::Transient)
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_exhausted() {
        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = counter.clone();

        let result = download_with_retry(&fast_config(2), || {
            let counter = counter_clone.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err::<i32, _>(TestError::Transient)
            }
        })
        .await;

        assert!(matches!(result, Err(TestError::Transient)));
        assert_eq!(counter.load(Ordering::SeqCst), 3, "initial call plus two retries");
    }

    #[tokio::test]
    async fn test_permanent_error_no_retry() {
        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = counter.clone();

        let result = download_with_retry(&fast_config(5), || {
            let counter = counter_clone.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err::<i32, _>(TestError::Permanent)
            }
        })
        .await;

        assert!(matches!(result, Err(TestError::Permanent)));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn backoff_grows_exponentially_without_jitter() {
        let config = RetryConfig {
            request_attempts: 0,
            initial_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(300),
            backoff_multiplier: 2.0,
            jitter: false,
        };

        assert_eq!(backoff_delay(&config, 1), Duration::from_secs(2));
        assert_eq!(backoff_delay(&config, 2), Duration::from_secs(4));
        assert_eq!(backoff_delay(&config, 3), Duration::from_secs(8));
    }

    #[test]
    fn backoff_is_capped_at_max_delay() {
        let config = RetryConfig {
            request_attempts: 0,
            initial_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(300),
            backoff_multiplier: 2.0,
            jitter: false,
        };

        assert_eq!(backoff_delay(&config, 20), Duration::from_secs(300));
        assert_eq!(backoff_delay(&config, u32::MAX), Duration::from_secs(300));
    }

    #[test]
    fn backoff_with_jitter_stays_within_bounds() {
        let config = RetryConfig {
            request_attempts: 0,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            backoff_multiplier: 2.0,
            jitter: true,
        };

        for _ in 0..200 {
            let delay = backoff_delay(&config, 3);
            assert!(delay >= Duration::from_secs(4), "{delay:?} below base");
            assert!(delay <= Duration::from_secs(8), "{delay:?} above 2x base");
        }
    }

    #[test]
    fn immediate_config_never_waits() {
        let config = RetryConfig::immediate();
        let now = Utc::now();
        assert_eq!(backoff_delay(&config, 1), Duration::ZERO);
        assert_eq!(next_retry_at(&config, 7, now), now);
    }

    #[test]
    fn next_retry_at_is_in_the_future() {
        let config = RetryConfig {
            jitter: false,
            ..RetryConfig::default()
        };
        let now = Utc::now();
        assert_eq!(
            next_retry_at(&config, 1, now),
            now + chrono::Duration::seconds(2)
        );
    }

    #[test]
    fn add_jitter_on_zero_delay_returns_zero() {
        assert_eq!(add_jitter(Duration::ZERO), Duration::ZERO);
    }

    #[test]
    fn server_errors_are_retryable_client_errors_are_not() {
        assert!(TransferError::HttpStatus { status: 503 }.is_retryable());
        assert!(TransferError::HttpStatus { status: 429 }.is_retryable());
        assert!(!TransferError::HttpStatus { status: 404 }.is_retryable());
        assert!(!TransferError::HttpStatus { status: 403 }.is_retryable());
    }

    #[test]
    fn cancellation_and_bad_urls_are_not_retryable() {
        assert!(!TransferError::Cancelled.is_retryable());
        assert!(
            !TransferError::InvalidUrl {
                url: "nope".to_string(),
                reason: "relative URL without a base".to_string(),
            }
            .is_retryable()
        );
    }

    #[test]
    fn disk_permission_errors_are_not_retryable() {
        let err = TransferError::Disk(std::io::Error::new(
            std::io::ErrorKind::PermissionDenied,
            "read-only",
        ));
        assert!(!err.is_retryable());
    }

    #[test]
    fn signing_request_failures_are_retryable() {
        assert!(SigningError::RequestFailed("503".to_string()).is_retryable());
        assert!(
            !SigningError::Unsigned {
                remote_ref: "x".to_string()
            }
            .is_retryable()
        );
    }
}
