//! Configuration types for scripture-dl

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Queue processing behaviour (directories, concurrency, retries)
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DownloadConfig {
    /// Directory finished and partial files are written to (default: "downloads")
    #[serde(default = "default_download_dir")]
    pub download_dir: PathBuf,

    /// Maximum transfers started by one processing pass (default: 3)
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_downloads: usize,

    /// Failed attempts allowed before a job is marked failed (default: 3)
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Run a background scheduler that processes the queue without explicit calls (default: true)
    #[serde(default = "default_true")]
    pub auto_process: bool,

    /// How often the background scheduler looks at the queue when nothing wakes it (default: 5 seconds)
    #[serde(default = "default_poll_interval", with = "duration_serde")]
    pub poll_interval: Duration,

    /// Minimum time between persisted progress updates for one job (default: 500 ms)
    #[serde(default = "default_progress_interval", with = "duration_millis_serde")]
    pub progress_persist_interval: Duration,

    /// How long shutdown waits for in-flight transfers to stop (default: 10 seconds)
    #[serde(default = "default_shutdown_grace", with = "duration_serde")]
    pub shutdown_grace_period: Duration,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            download_dir: default_download_dir(),
            max_concurrent_downloads: default_max_concurrent(),
            max_retries: default_max_retries(),
            auto_process: true,
            poll_interval: default_poll_interval(),
            progress_persist_interval: default_progress_interval(),
            shutdown_grace_period: default_shutdown_grace(),
        }
    }
}

/// Retry configuration for failed attempts
///
/// `initial_delay`, `max_delay`, `backoff_multiplier` and `jitter` shape the
/// per-job wait between failed attempts. `request_attempts` bounds the
/// immediate in-attempt retries the HTTP fetcher makes on connection errors.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Immediate retries of a single request on transient connection errors (default: 2)
    #[serde(default = "default_request_attempts")]
    pub request_attempts: u32,

    /// Delay before the first retry (default: 2 seconds)
    #[serde(default = "default_initial_delay", with = "duration_serde")]
    pub initial_delay: Duration,

    /// Maximum delay between retries (default: 5 minutes)
    #[serde(default = "default_max_delay", with = "duration_serde")]
    pub max_delay: Duration,

    /// Multiplier for exponential backoff (default: 2.0)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Add random jitter to delays (default: true)
    #[serde(default = "default_true")]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            request_attempts: default_request_attempts(),
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// No delays at all, for callers that drive the queue by hand
    pub fn immediate() -> Self {
        Self {
            request_attempts: 0,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
            jitter: false,
        }
    }
}

/// URL signing settings
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SigningConfig {
    /// Lifetime requested for signed URLs, in hours (default: 24)
    #[serde(default = "default_url_ttl_hours")]
    pub url_ttl_hours: u32,

    /// A cached URL expiring within this window is re-signed before use (default: 60 seconds)
    #[serde(default = "default_refresh_margin", with = "duration_serde")]
    pub refresh_margin: Duration,
}

impl Default for SigningConfig {
    fn default() -> Self {
        Self {
            url_ttl_hours: default_url_ttl_hours(),
            refresh_margin: default_refresh_margin(),
        }
    }
}

/// Durable storage settings
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PersistenceConfig {
    /// Database path (default: "./scripture-dl.db")
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
        }
    }
}

/// Main configuration for [`DownloadQueue`](crate::DownloadQueue)
///
/// Download settings are flattened so the serialized form keeps
/// `download_dir`, `max_retries` etc. at the top level.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Config {
    /// Directories, concurrency and retry limits
    #[serde(flatten)]
    pub download: DownloadConfig,

    /// Backoff between failed attempts
    #[serde(default)]
    pub retry: RetryConfig,

    /// Signed URL lifetime
    #[serde(default)]
    pub signing: SigningConfig,

    /// Database location
    #[serde(default)]
    pub persistence: PersistenceConfig,
}

impl Config {
    /// Configuration rooted at `dir`: downloads in `dir/downloads`, database at `dir/scripture-dl.db`
    pub fn with_data_dir(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        let mut config = Self::default();
        config.download.download_dir = dir.join("downloads");
        config.persistence.database_path = dir.join("scripture-dl.db");
        config
    }

    /// Download directory
    pub fn download_dir(&self) -> &PathBuf {
        &self.download.download_dir
    }

    /// Database path
    pub fn database_path(&self) -> &PathBuf {
        &self.persistence.database_path
    }

    /// Reject settings the processor cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.download.max_concurrent_downloads == 0 {
            return Err(config_error(
                "max_concurrent_downloads must be at least 1",
                "max_concurrent_downloads",
            ));
        }
        if self.download.max_retries == 0 {
            return Err(config_error(
                "max_retries must be at least 1",
                "max_retries",
            ));
        }
        if self.signing.url_ttl_hours == 0 {
            return Err(config_error(
                "url_ttl_hours must be at least 1",
                "url_ttl_hours",
            ));
        }
        let multiplier = self.retry.backoff_multiplier;
        if !multiplier.is_finite() || multiplier < 1.0 {
            return Err(config_error(
                format!("backoff_multiplier must be a finite number >= 1.0, got {multiplier}"),
                "backoff_multiplier",
            ));
        }
        if self.retry.initial_delay > self.retry.max_delay {
            return Err(config_error(
                "initial_delay must not exceed max_delay",
                "initial_delay",
            ));
        }
        Ok(())
    }
}

fn config_error(message: impl Into<String>, key: &str) -> Error {
    Error::Config {
        message: message.into(),
        key: Some(key.to_string()),
    }
}

fn default_download_dir() -> PathBuf {
    PathBuf::from("downloads")
}

fn default_database_path() -> PathBuf {
    PathBuf::from("./scripture-dl.db")
}

fn default_max_concurrent() -> usize {
    3
}

fn default_max_retries() -> u32 {
    3
}

fn default_true() -> bool {
    true
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_progress_interval() -> Duration {
    Duration::from_millis(500)
}

fn default_shutdown_grace() -> Duration {
    Duration::from_secs(10)
}

fn default_request_attempts() -> u32 {
    2
}

fn default_initial_delay() -> Duration {
    Duration::from_secs(2)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(300)
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_url_ttl_hours() -> u32 {
    24
}

fn default_refresh_margin() -> Duration {
    Duration::from_secs(60)
}

// Duration serialization helper
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

// Millisecond Duration serialization helper
mod duration_millis_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.download.max_concurrent_downloads, 3);
        assert_eq!(config.download.max_retries, 3);
        assert!(config.download.auto_process);
        assert_eq!(config.signing.url_ttl_hours, 24);
        assert_eq!(config.retry.initial_delay, Duration::from_secs(2));
        assert_eq!(config.retry.max_delay, Duration::from_secs(300));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn empty_json_deserializes_to_defaults() {
        let config: Config = serde_json::from_str("{}").expect("deserialize failed");
        assert_eq!(config.download.download_dir, PathBuf::from("downloads"));
        assert_eq!(
            config.download.progress_persist_interval,
            Duration::from_millis(500)
        );
        assert_eq!(config.signing.refresh_margin, Duration::from_secs(60));
    }

    #[test]
    fn download_settings_are_flattened() {
        let json = r#"{"download_dir":"/data/bible","max_retries":5,"poll_interval":30,"retry":{"initial_delay":1}}"#;
        let config: Config = serde_json::from_str(json).expect("deserialize failed");
        assert_eq!(config.download_dir(), &PathBuf::from("/data/bible"));
        assert_eq!(config.download.max_retries, 5);
        assert_eq!(config.download.poll_interval, Duration::from_secs(30));
        assert_eq!(config.retry.initial_delay, Duration::from_secs(1));
        assert_eq!(config.retry.backoff_multiplier, 2.0);

        let value = serde_json::to_value(&config).expect("serialize failed");
        assert_eq!(value["max_retries"], 5);
        assert_eq!(value["progress_persist_interval"], 500);
    }

    #[test]
    fn validate_rejects_zero_concurrency() {
        let mut config = Config::default();
        config.download.max_concurrent_downloads = 0;

        match config.validate() {
            Err(Error::Config { key, .. }) => {
                assert_eq!(key.as_deref(), Some("max_concurrent_downloads"))
            }
            other => panic!("expected config error, got {other:?}"),
        }
    }

    #[test]
    fn validate_rejects_zero_retries_and_bad_multiplier() {
        let mut config = Config::default();
        config.download.max_retries = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.retry.backoff_multiplier = 0.5;
        assert!(config.validate().is_err());

        config.retry.backoff_multiplier = f64::NAN;
        assert!(config.validate().is_err());
    }

    #[test]
    fn with_data_dir_places_database_and_downloads_under_dir() {
        let config = Config::with_data_dir("/var/app");
        assert_eq!(config.download_dir(), &PathBuf::from("/var/app/downloads"));
        assert_eq!(
            config.database_path(),
            &PathBuf::from("/var/app/scripture-dl.db")
        );
    }

    #[test]
    fn immediate_retry_config_validates() {
        let mut config = Config::default();
        config.retry = RetryConfig::immediate();
        assert!(config.validate().is_ok());
    }
}
