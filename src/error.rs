//! Typed errors for every stage of the pipeline.
//!
//! Each component returns its own error enum so callers can branch on the
//! failure kind. Per-file ingestion problems share [`IngestError`] with the
//! fatal ones; [`IngestError::is_per_file`] tells them apart.

use std::path::PathBuf;

use thiserror::Error;

use crate::models::SessionState;

/// Errors raised by the session store.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("invalid session id: '{0}'")]
    InvalidId(String),

    #[error("session not found: {0}")]
    NotFound(String),

    #[error("invalid upload file name: '{0}'")]
    InvalidFileName(String),

    /// Persisted state could not be removed. Stale data may still be on disk.
    #[error("failed to remove {path} after {attempts} attempts: {source}")]
    Cleanup {
        path: PathBuf,
        attempts: u32,
        #[source]
        source: std::io::Error,
    },

    #[error("session state file {path} is unreadable: {reason}")]
    State { path: PathBuf, reason: String },

    #[error("session I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised while computing embeddings.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum EmbedError {
    #[error("embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("embedding provider unavailable: {0}")]
    ProviderUnavailable(String),
}

/// Errors raised by the SQLite vector collection.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("vector store error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("collection holds {expected}-dimensional vectors, batch has {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("vector store I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised by an ingestion run.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("no usable documents: every input was unsupported, unreadable or empty")]
    NoUsableDocuments,

    #[error("unsupported format '{extension}': {path}")]
    UnsupportedFormat { path: PathBuf, extension: String },

    #[error("failed to read {path}: {reason}")]
    ReadFailure { path: PathBuf, reason: String },

    #[error("no text found in {path}")]
    EmptyDocument { path: PathBuf },

    #[error("failed to persist index: {0}")]
    IndexPersistFailure(String),

    #[error(transparent)]
    Embedding(#[from] EmbedError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("ingestion cancelled by a newer request for the same session")]
    Cancelled,
}

impl IngestError {
    /// True for problems confined to a single input file.
    pub fn is_per_file(&self) -> bool {
        matches!(
            self,
            IngestError::UnsupportedFormat { .. }
                | IngestError::ReadFailure { .. }
                | IngestError::EmptyDocument { .. }
        )
    }
}

impl From<StoreError> for IngestError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::DimensionMismatch { expected, actual } => {
                IngestError::Embedding(EmbedError::DimensionMismatch { expected, actual })
            }
            other => IngestError::IndexPersistFailure(other.to_string()),
        }
    }
}

/// Errors raised while retrieving chunks for a query.
#[derive(Debug, Error)]
pub enum RetrievalError {
    #[error("session index is empty")]
    EmptyIndex,

    #[error("session is not ready for queries (state: {state})")]
    SessionNotReady { state: SessionState },

    #[error("vector store error: {0}")]
    Store(String),

    #[error(transparent)]
    Embedding(#[from] EmbedError),
}

impl From<StoreError> for RetrievalError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::DimensionMismatch { expected, actual } => {
                RetrievalError::Embedding(EmbedError::DimensionMismatch { expected, actual })
            }
            other => RetrievalError::Store(other.to_string()),
        }
    }
}

/// Failures reported by a generation provider.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GenerationError {
    #[error("generation provider rate limited the request: {0}")]
    RateLimited(String),

    #[error("generation provider rejected the credentials: {0}")]
    AuthFailure(String),

    #[error("generation request timed out")]
    Timeout,

    #[error("unknown model: '{0}'")]
    UnknownModel(String),

    #[error("network error talking to the generation provider: {0}")]
    NetworkError(String),

    #[error("invalid response from the generation provider: {0}")]
    InvalidResponse(String),
}

/// Errors returned by the query operations.
#[derive(Debug, Error)]
pub enum QueryError {
    #[error("query text must not be empty")]
    EmptyQuery,

    #[error(transparent)]
    Retrieval(#[from] RetrievalError),

    #[error(transparent)]
    Generation(#[from] GenerationError),

    #[error(transparent)]
    Session(#[from] SessionError),
}

impl QueryError {
    /// True when the session has no queryable index yet.
    pub fn is_not_ready(&self) -> bool {
        matches!(
            self,
            QueryError::Retrieval(RetrievalError::SessionNotReady { .. })
                | QueryError::Retrieval(RetrievalError::EmptyIndex)
        )
    }
}
