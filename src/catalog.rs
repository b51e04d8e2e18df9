//! Media catalogue collaborator
//!
//! Completed downloads that asked for it are handed to a [`MediaCatalog`],
//! which records them as playable assets. Cataloguing is best-effort: a
//! rejection is logged and reported as an event, but the job stays
//! `completed`.

use crate::types::{Job, JobMetadata};
use async_trait::async_trait;

/// Answer from the catalogue for one completed download
#[must_use]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CatalogResult {
    /// Whether the catalogue accepted the file
    pub success: bool,
    /// Id of the created or updated catalogue entry
    pub catalog_entry_id: Option<String>,
    /// Why the catalogue rejected the file
    pub error: Option<String>,
}

impl CatalogResult {
    /// Accepted, optionally with the entry id the catalogue assigned
    pub fn added(catalog_entry_id: Option<String>) -> Self {
        Self {
            success: true,
            catalog_entry_id,
            error: None,
        }
    }

    /// Rejected with a reason
    pub fn rejected(error: impl Into<String>) -> Self {
        Self {
            success: false,
            catalog_entry_id: None,
            error: Some(error.into()),
        }
    }
}

/// Durable catalogue of playable assets
///
/// `metadata` is the opaque bag supplied at enqueue; only the catalogue
/// interprets its keys.
#[async_trait]
pub trait MediaCatalog: Send + Sync {
    /// Upsert an entry for a completed download
    async fn add(&self, job: &Job, metadata: &JobMetadata) -> CatalogResult;

    /// Short name used in logs
    fn name(&self) -> &'static str {
        "custom"
    }
}

/// Catalogue that accepts everything and records nothing
///
/// Used when the host application has no catalogue wired up.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpCatalog;

#[async_trait]
impl MediaCatalog for NoOpCatalog {
    async fn add(&self, _job: &Job, _metadata: &JobMetadata) -> CatalogResult {
        CatalogResult::added(None)
    }

    fn name(&self) -> &'static str {
        "noop"
    }
}
