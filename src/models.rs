//! Core data models used throughout session-rag.
//!
//! These types represent the sessions, documents, chunks, and query results
//! that flow through the ingestion and retrieval pipeline.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{IngestError, SessionError};

/// Opaque session identifier (UUIDv4, 122 bits of entropy).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

impl FromStr for SessionId {
    type Err = SessionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim())
            .map(SessionId)
            .map_err(|_| SessionError::InvalidId(s.to_string()))
    }
}

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Empty,
    Indexing,
    Ready,
    Error,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Empty => "empty",
            SessionState::Indexing => "indexing",
            SessionState::Ready => "ready",
            SessionState::Error => "error",
        };
        f.write_str(s)
    }
}

/// On-disk layout of one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionPaths {
    pub root: PathBuf,
    pub files_dir: PathBuf,
    pub index_dir: PathBuf,
}

impl SessionPaths {
    pub fn under(base: &Path, id: &SessionId) -> Self {
        let root = base.join(id.to_string());
        Self {
            files_dir: root.join("files"),
            index_dir: root.join("index"),
            root,
        }
    }
}

/// Explicit per-call session handle. Every pipeline stage receives one of
/// these instead of reading paths from shared state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionContext {
    pub id: SessionId,
    pub paths: SessionPaths,
}

impl SessionContext {
    /// Collection name in the vector store; always the session id.
    pub fn collection_name(&self) -> String {
        self.id.to_string()
    }

    pub fn collection_path(&self) -> PathBuf {
        self.paths
            .index_dir
            .join(format!("{}.sqlite", self.collection_name()))
    }
}

/// Snapshot of a session's persisted status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionStatus {
    pub id: SessionId,
    pub state: SessionState,
    #[serde(default)]
    pub last_error: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// One uploaded file after text extraction.
#[derive(Debug, Clone)]
pub struct Document {
    pub id: String,
    pub path: PathBuf,
    /// Path relative to the session file area, used as the source label.
    pub source: String,
    pub extension: String,
    pub text: String,
}

/// A contiguous span of a document's text.
///
/// `start` and `end` are character offsets into the extracted text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub id: String,
    pub document_id: String,
    pub source: String,
    pub chunk_index: i64,
    pub start: usize,
    pub end: usize,
    pub text: String,
    pub hash: String,
}

/// A chunk with its embedding vector, ready to persist.
#[derive(Debug, Clone)]
pub struct EmbeddedChunk {
    pub chunk: Chunk,
    pub vector: Vec<f32>,
}

/// Output of the embedding stage for one ingestion run.
#[derive(Debug, Clone)]
pub struct EmbeddedBatch {
    pub model: String,
    pub dims: usize,
    pub items: Vec<EmbeddedChunk>,
}

impl EmbeddedBatch {
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Result of a successful ingestion run.
#[derive(Debug)]
pub struct IngestSummary {
    pub session_id: SessionId,
    pub documents: usize,
    pub chunks: usize,
    /// Chunks that were not already in the collection.
    pub new_chunks: usize,
    pub collection_size: usize,
    /// Per-file problems that did not abort the run.
    pub warnings: Vec<IngestError>,
}

/// A chunk returned by the retriever with its similarity score.
#[derive(Debug, Clone, PartialEq)]
pub struct RankedChunk {
    pub chunk_id: String,
    pub score: f32,
    pub text: String,
    pub source: String,
    /// Insertion sequence in the collection; breaks score ties.
    pub seq: i64,
}

/// One cited source in a query result.
#[derive(Debug, Clone, Serialize)]
pub struct SourceMatch {
    pub chunk_id: String,
    pub score: f32,
    pub snippet: String,
    pub source: String,
}

/// Plain answer to a query.
#[derive(Debug, Clone, Serialize)]
pub struct Answer {
    pub answer: String,
    pub model: String,
    /// Chunks that made it into the prompt, in prompt order.
    pub context_chunk_ids: Vec<String>,
}

/// Answer annotated with per-source similarity scores.
#[derive(Debug, Clone, Serialize)]
pub struct SourcedAnswer {
    pub answer: String,
    pub model: String,
    pub top_similarity_score: f32,
    pub sources: Vec<SourceMatch>,
}
