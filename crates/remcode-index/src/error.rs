//! Run-level errors.
//!
//! Anything here means a run could not start or had to abort without
//! committing. Per-chunk failures never surface as a `PipelineError`; they
//! are counted in [`crate::ProcessingStats`].

use thiserror::Error;

use crate::embeddings::EmbeddingError;
use crate::lock::LockError;
use crate::state::StateError;
use crate::store::StoreError;

/// Errors that abort a pipeline run.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// Misconfiguration detected before any network call
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("State store error: {0}")]
    StateStore(#[from] StateError),

    #[error("Already running: {0}")]
    AlreadyRunning(String),

    /// The vector store could not prepare the namespace
    #[error("Vector store error: {0}")]
    Store(StoreError),

    #[error("Run cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<LockError> for PipelineError {
    fn from(err: LockError) -> Self {
        match err {
            LockError::AlreadyRunning { holder } => Self::AlreadyRunning(holder),
            LockError::Io { source, .. } => Self::Io(source),
        }
    }
}

impl From<StoreError> for PipelineError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::DimensionMismatch { .. } => Self::Config(err.to_string()),
            other => Self::Store(other),
        }
    }
}

impl From<EmbeddingError> for PipelineError {
    fn from(err: EmbeddingError) -> Self {
        Self::Config(err.to_string())
    }
}

impl PipelineError {
    /// Another run holds the lock.
    pub fn is_already_running(&self) -> bool {
        matches!(self, Self::AlreadyRunning(_))
    }
}
