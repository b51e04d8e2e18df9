//! URL signing collaborator
//!
//! Remote files are addressed by opaque references. Before a transfer starts
//! the processor asks a [`UrlSigner`] to turn the reference into a
//! time-limited URL the fetcher can request directly, and caches the result on
//! the job until it is about to expire.

use crate::error::SigningError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;

/// URLs returned by one signing request
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SignedUrls {
    /// Signed URL per remote reference; references the service could not sign are absent
    pub urls: HashMap<String, String>,
    /// Lifetime of every URL in this response
    pub expires_in_seconds: u64,
}

impl SignedUrls {
    /// URL for `remote_ref`, if it was signed
    pub fn url_for(&self, remote_ref: &str) -> Option<&str> {
        self.urls.get(remote_ref).map(String::as_str)
    }

    /// Absolute expiry of the URLs in this response, counted from `issued_at`
    pub fn expires_at(&self, issued_at: DateTime<Utc>) -> DateTime<Utc> {
        let secs = i64::try_from(self.expires_in_seconds).unwrap_or(i64::MAX);
        chrono::Duration::try_seconds(secs)
            .and_then(|ttl| issued_at.checked_add_signed(ttl))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

/// Exchanges remote references for time-limited fetch URLs
///
/// Implementations must tolerate partial failure: references that could not
/// be signed are simply left out of [`SignedUrls::urls`]. An `Err` means the
/// whole request failed.
#[async_trait]
pub trait UrlSigner: Send + Sync {
    /// Sign `remote_refs`, asking for URLs valid for `ttl_hours`
    async fn sign(&self, remote_refs: &[String], ttl_hours: u32)
    -> Result<SignedUrls, SigningError>;

    /// Short name used in logs
    fn name(&self) -> &'static str {
        "custom"
    }
}

/// Fallback signer for references that are already fetchable URLs
///
/// Returns every input unchanged with the requested lifetime.
///
/// # Examples
///
/// ```
/// use scripture_dl::signer::{PassthroughSigner, UrlSigner};
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let refs = vec!["https://cdn.example/GEN_01.mp3".to_string()];
/// let signed = PassthroughSigner.sign(&refs, 24).await?;
/// assert_eq!(signed.url_for(&refs[0]), Some("https://cdn.example/GEN_01.mp3"));
/// assert_eq!(signed.expires_in_seconds, 24 * 3600);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct PassthroughSigner;

#[async_trait]
impl UrlSigner for PassthroughSigner {
    async fn sign(
        &self,
        remote_refs: &[String],
        ttl_hours: u32,
    ) -> Result<SignedUrls, SigningError> {
        Ok(SignedUrls {
            urls: remote_refs
                .iter()
                .map(|r| (r.clone(), r.clone()))
                .collect(),
            expires_in_seconds: u64::from(ttl_hours) * 3600,
        })
    }

    fn name(&self) -> &'static str {
        "passthrough"
    }
}
