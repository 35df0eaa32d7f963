//! Ingestion pipeline: raw files → extracted documents → chunks.
//!
//! Coordinates the first half of an ingestion run for one session:
//! staging uploads into the session file area, text extraction, chunking and
//! in-run deduplication. Embedding and persistence happen afterwards in
//! [`crate::indexer`].
//!
//! Problems confined to a single file (unsupported extension, unreadable or
//! corrupt content, no text) are collected as warnings and the run goes on.
//! The run fails only when no file yields any text.

use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use walkdir::WalkDir;

use crate::chunk::chunk_document;
use crate::config::ChunkingConfig;
use crate::error::IngestError;
use crate::extract::{extension_of, extract_file, ExtractError};
use crate::models::{Chunk, Document, SessionContext};
use crate::session::claim_file_name;

/// Documents and chunks produced by [`IngestionPipeline::process`].
#[derive(Debug)]
pub struct PreparedBatch {
    pub documents: Vec<Document>,
    pub chunks: Vec<Chunk>,
    pub warnings: Vec<IngestError>,
}

pub struct IngestionPipeline {
    chunking: ChunkingConfig,
}

impl IngestionPipeline {
    pub fn new(chunking: ChunkingConfig) -> Self {
        Self { chunking }
    }

    /// Stage, extract and chunk `document_paths` for the session in `ctx`.
    ///
    /// An empty `document_paths` processes every file already in the
    /// session file area.
    pub async fn process(
        &self,
        ctx: &SessionContext,
        document_paths: &[PathBuf],
        cancel: &CancellationToken,
    ) -> Result<PreparedBatch, IngestError> {
        let files_dir = &ctx.paths.files_dir;
        tokio::fs::create_dir_all(files_dir)
            .await
            .map_err(|e| IngestError::Session(e.into()))?;

        let mut warnings = Vec::new();
        let mut staged = if document_paths.is_empty() {
            scan_files(files_dir)
        } else {
            stage_files(files_dir, document_paths, &mut warnings).await
        };
        staged.sort();
        staged.dedup();

        let mut documents = Vec::new();
        for path in staged {
            if cancel.is_cancelled() {
                return Err(IngestError::Cancelled);
            }

            let task_path = path.clone();
            let task_dir = files_dir.clone();
            let loaded =
                match tokio::task::spawn_blocking(move || load_document(&task_path, &task_dir)).await {
                    Ok(loaded) => loaded,
                    // A panicking parser only loses this file.
                    Err(e) => {
                        warnings.push(IngestError::ReadFailure {
                            path,
                            reason: format!("extraction aborted: {}", e),
                        });
                        continue;
                    }
                };

            match loaded {
                Ok(doc) if doc.text.trim().is_empty() => {
                    warnings.push(IngestError::EmptyDocument { path });
                }
                Ok(doc) => documents.push(doc),
                Err(ExtractError::UnsupportedFormat(extension)) => {
                    warnings.push(IngestError::UnsupportedFormat { path, extension });
                }
                Err(e) => warnings.push(IngestError::ReadFailure {
                    path,
                    reason: e.to_string(),
                }),
            }
        }

        for w in &warnings {
            tracing::warn!(session_id = %ctx.id, warning = %w, "skipping file");
        }

        if documents.is_empty() {
            return Err(IngestError::NoUsableDocuments);
        }

        let mut seen = HashSet::new();
        let mut chunks = Vec::new();
        for doc in &documents {
            for chunk in chunk_document(&ctx.id, doc, &self.chunking) {
                if seen.insert(chunk.id.clone()) {
                    chunks.push(chunk);
                }
            }
        }

        tracing::info!(
            session_id = %ctx.id,
            documents = documents.len(),
            chunks = chunks.len(),
            warnings = warnings.len(),
            "documents prepared"
        );

        Ok(PreparedBatch {
            documents,
            chunks,
            warnings,
        })
    }
}

/// Copy inputs into `files_dir`. Files already inside it are used in place.
///
/// Inputs of one run that share a file name are staged as `stem-N.ext`.
async fn stage_files(
    files_dir: &Path,
    paths: &[PathBuf],
    warnings: &mut Vec<IngestError>,
) -> Vec<PathBuf> {
    let mut staged = Vec::with_capacity(paths.len());
    let mut taken = HashSet::new();
    for src in paths.iter().filter(|p| p.starts_with(files_dir)) {
        if let Ok(rel) = src.strip_prefix(files_dir) {
            taken.insert(rel.to_string_lossy().to_string());
        }
        staged.push(src.clone());
    }

    let mut seen = HashSet::new();
    for src in paths.iter().filter(|p| !p.starts_with(files_dir)) {
        if !seen.insert(src) {
            continue;
        }
        let Some(name) = src.file_name().map(|n| n.to_string_lossy().to_string()) else {
            warnings.push(IngestError::ReadFailure {
                path: src.clone(),
                reason: "path has no file name".to_string(),
            });
            continue;
        };
        let name = claim_file_name(&name, &mut taken);
        let dest = files_dir.join(&name);
        match tokio::fs::copy(src, &dest).await {
            Ok(_) => staged.push(dest),
            Err(e) => warnings.push(IngestError::ReadFailure {
                path: src.clone(),
                reason: e.to_string(),
            }),
        }
    }
    staged
}

/// Every regular file below `files_dir`.
fn scan_files(files_dir: &Path) -> Vec<PathBuf> {
    WalkDir::new(files_dir)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.into_path())
        .collect()
}

/// Load one file from the session file area as a [`Document`].
///
/// The source label is the path relative to `files_dir`; the document id is
/// its SHA-256. `Ok` with empty text means the file holds no text.
pub fn load_document(path: &Path, files_dir: &Path) -> Result<Document, ExtractError> {
    let text = extract_file(path)?;
    let source = path
        .strip_prefix(files_dir)
        .unwrap_or(path)
        .to_string_lossy()
        .replace('\\', "/");

    let mut hasher = Sha256::new();
    hasher.update(source.as_bytes());

    Ok(Document {
        id: format!("{:x}", hasher.finalize()),
        path: path.to_path_buf(),
        extension: extension_of(path),
        source,
        text,
    })
}
