//! Document store
//!
//! The uploader only needs one operation: write a batch of documents keyed by
//! id, overwriting any existing document with the same id.

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

pub mod elasticsearch;

pub use elasticsearch::ElasticsearchStore;

/// One document ready to be written
#[derive(Debug, Clone, PartialEq)]
pub struct IndexedDocument {
    pub index: String,
    pub id: String,
    pub source: Value,
}

/// Per-document result of an accepted batch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BulkOutcome {
    pub written: usize,
    pub failed: usize,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Worth retrying: timeouts, throttling, unavailable nodes
    #[error("Transient store error: {0}")]
    Transient(String),

    #[error("Store rejected request: {0}")]
    Permanent(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient(_))
    }
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Index every document by its id. Re-sending a batch is harmless.
    async fn bulk_upsert(&self, docs: &[IndexedDocument]) -> Result<BulkOutcome, StoreError>;
}
