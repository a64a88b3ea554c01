//! Error types for the chainfeed pipeline.

use thiserror::Error;

/// Errors that can occur while fetching, indexing or checkpointing.
#[derive(Debug, Error)]
pub enum IndexerError {
    #[error("Block source error: {0}")]
    Source(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Document {id} does not exist")]
    NotFound { id: String },

    #[error("Checkpoint with id {id} does not exist")]
    CheckpointNotFound { id: String },

    #[error("Attachment '{name}' already queued for document {id}")]
    DuplicateAttachment { id: String, name: String },

    #[error("No common ancestor between the checkpoint locator and the header chain")]
    ForkNotFound,

    #[error("Invalid block locator: {0}")]
    InvalidLocator(String),

    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("Index job panicked: {0}")]
    JobPanicked(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Not implemented: {0}")]
    NotImplemented(String),

    #[error("{0}")]
    Other(String),
}

impl IndexerError {
    /// Returns `true` if the error must never be retried.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::ResourceExhausted(_))
    }

    /// Returns `true` for the duplicate transaction hash anomaly on attach.
    pub fn is_duplicate_attachment(&self) -> bool {
        matches!(self, Self::DuplicateAttachment { .. })
    }
}

impl From<serde_json::Error> for IndexerError {
    fn from(e: serde_json::Error) -> Self {
        Self::Storage(e.to_string())
    }
}
