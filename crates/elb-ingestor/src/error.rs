//! Ingestor error types

use thiserror::Error;

use crate::source::FileState;

/// Result type alias for pipeline operations
pub type IngestResult<T> = std::result::Result<T, IngestError>;

/// Pipeline-level errors.
///
/// Only [`IngestError::Config`] is fatal; every other variant is counted and
/// the pipeline keeps running.
#[derive(Error, Debug)]
pub enum IngestError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("File {location} was claimed by another worker")]
    ClaimConflict { location: String },

    #[error("Invalid file transition for {location}: {from} -> {to}")]
    InvalidTransition {
        location: String,
        from: FileState,
        to: FileState,
    },

    #[error("Location {location} is not under prefix {prefix}")]
    InvalidLocation { location: String, prefix: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Storage error: {0}")]
    Storage(#[from] crate::storage::StorageError),

    #[error("Work queue closed")]
    QueueClosed(#[from] crate::pipeline::queue::QueueClosed),
}

impl IngestError {
    pub fn is_claim_conflict(&self) -> bool {
        matches!(self, IngestError::ClaimConflict { .. })
    }
}
