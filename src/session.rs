//! Session lifecycle and on-disk layout.
//!
//! Every session lives under `<storage.root>/<session_id>/`:
//!
//! ```text
//! <root>/<id>/session.json        persisted SessionStatus
//! <root>/<id>/files/              uploaded raw documents
//! <root>/<id>/index/<id>.sqlite   vector collection
//! ```
//!
//! The store also owns the in-memory [`SessionSlot`] registry. A slot holds
//! the per-session gate that serialises ingestion and queries, plus the
//! cancellation token of the ingestion currently running. Slots of different
//! sessions are independent; the registry mutex is only held while looking a
//! slot up.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::config::StorageConfig;
use crate::error::SessionError;
use crate::models::{SessionContext, SessionId, SessionPaths, SessionState, SessionStatus};

const STATUS_FILE: &str = "session.json";

/// Message stored for a session whose ingestion never finished.
pub const INTERRUPTED: &str = "ingestion was interrupted before it completed";

// ============ Session Slot ============

/// In-memory coordination state for one session.
#[derive(Default)]
pub struct SessionSlot {
    gate: tokio::sync::Mutex<()>,
    ingest: Mutex<Option<(u64, CancellationToken)>>,
    generation: Mutex<u64>,
}

impl SessionSlot {
    /// Wait for exclusive access to the session's collection.
    pub async fn lock(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.gate.lock().await
    }

    /// Cancel any running ingestion and register a new one.
    ///
    /// Returns the ticket to pass to [`SessionSlot::finish_ingest`].
    pub fn begin_ingest(&self) -> IngestTicket {
        let mut generation = self.generation.lock().unwrap_or_else(|e| e.into_inner());
        *generation += 1;
        let token = CancellationToken::new();

        let mut current = self.ingest.lock().unwrap_or_else(|e| e.into_inner());
        if let Some((_, previous)) = current.replace((*generation, token.clone())) {
            previous.cancel();
        }
        IngestTicket {
            id: *generation,
            token,
        }
    }

    /// Deregister `ticket` unless a newer ingestion replaced it.
    pub fn finish_ingest(&self, ticket: &IngestTicket) {
        let mut current = self.ingest.lock().unwrap_or_else(|e| e.into_inner());
        if matches!(current.as_ref(), Some((id, _)) if *id == ticket.id) {
            *current = None;
        }
    }

    /// Cancel the running ingestion, if any.
    pub fn cancel_ingest(&self) {
        let mut current = self.ingest.lock().unwrap_or_else(|e| e.into_inner());
        if let Some((_, token)) = current.take() {
            token.cancel();
        }
    }

    /// True while an ingestion registered in this process is running.
    pub fn is_ingesting(&self) -> bool {
        self.ingest
            .lock()
            .map(|g| g.is_some())
            .unwrap_or(false)
    }
}

/// Handle for one registered ingestion run.
pub struct IngestTicket {
    id: u64,
    pub token: CancellationToken,
}

// ============ Directory Removal ============

/// Deletes a session directory tree. One call is one attempt.
#[async_trait]
pub trait DirRemover: Send + Sync {
    async fn remove_all(&self, path: &Path) -> std::io::Result<()>;
}

/// Removes directories from the local filesystem.
pub struct FsRemover;

#[async_trait]
impl DirRemover for FsRemover {
    async fn remove_all(&self, path: &Path) -> std::io::Result<()> {
        tokio::fs::remove_dir_all(path).await
    }
}

// ============ Session Store ============

pub struct SessionStore {
    root: PathBuf,
    cleanup_attempts: u32,
    cleanup_backoff: Duration,
    remover: Arc<dyn DirRemover>,
    slots: Mutex<HashMap<SessionId, Arc<SessionSlot>>>,
}

impl SessionStore {
    pub fn new(config: &StorageConfig) -> Self {
        Self::with_remover(config, Arc::new(FsRemover))
    }

    pub fn with_remover(config: &StorageConfig, remover: Arc<dyn DirRemover>) -> Self {
        Self {
            root: config.root.clone(),
            cleanup_attempts: config.cleanup_attempts.max(1),
            cleanup_backoff: Duration::from_millis(config.cleanup_backoff_ms),
            remover,
            slots: Mutex::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn paths_for(&self, id: &SessionId) -> SessionPaths {
        SessionPaths::under(&self.root, id)
    }

    fn context(&self, id: &SessionId) -> SessionContext {
        SessionContext {
            id: *id,
            paths: self.paths_for(id),
        }
    }

    /// Coordination slot for `id`, created on first use.
    ///
    /// Slots that no caller holds any more are dropped from the registry
    /// here. Handing out a slot only happens under the registry lock, so an
    /// entry held by the registry alone cannot be in use.
    pub fn slot(&self, id: &SessionId) -> Arc<SessionSlot> {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots.retain(|key, slot| key == id || Arc::strong_count(slot) > 1);
        slots.entry(*id).or_default().clone()
    }

    /// Create a new session with a fresh id in state `Empty`.
    pub fn create(&self) -> Result<SessionContext, SessionError> {
        let ctx = self.context(&SessionId::new());
        self.init_dirs(&ctx.paths)?;
        self.write_status(&ctx.paths, &new_status(ctx.id))?;
        tracing::info!(session_id = %ctx.id, "session created");
        Ok(ctx)
    }

    /// Open `id`, creating its directories and status on first access.
    pub fn open(&self, id: &SessionId) -> Result<SessionContext, SessionError> {
        let ctx = self.context(id);
        self.init_dirs(&ctx.paths)?;
        if !ctx.paths.root.join(STATUS_FILE).exists() {
            self.write_status(&ctx.paths, &new_status(*id))?;
            tracing::debug!(session_id = %id, "session initialised on first access");
        }
        Ok(ctx)
    }

    /// Open a session that must already exist.
    pub fn open_existing(&self, id: &SessionId) -> Result<SessionContext, SessionError> {
        let ctx = self.context(id);
        if !ctx.paths.root.is_dir() {
            return Err(SessionError::NotFound(id.to_string()));
        }
        self.open(id)
    }

    fn init_dirs(&self, paths: &SessionPaths) -> Result<(), SessionError> {
        std::fs::create_dir_all(&paths.files_dir)?;
        std::fs::create_dir_all(&paths.index_dir)?;
        Ok(())
    }

    /// Current status of `id`.
    ///
    /// A session persisted as `Indexing` with no ingestion running in this
    /// process is reported as `Error`.
    pub fn status(&self, id: &SessionId) -> Result<SessionStatus, SessionError> {
        let paths = self.paths_for(id);
        if !paths.root.is_dir() {
            return Err(SessionError::NotFound(id.to_string()));
        }
        let mut status = self.read_status(&paths, id)?;
        if status.state == SessionState::Indexing && !self.slot(id).is_ingesting() {
            status.state = SessionState::Error;
            status.last_error = Some(INTERRUPTED.to_string());
        }
        Ok(status)
    }

    pub fn state(&self, id: &SessionId) -> Result<SessionState, SessionError> {
        Ok(self.status(id)?.state)
    }

    /// Persist a state transition. `last_error` is cleared unless given.
    pub fn set_state(
        &self,
        id: &SessionId,
        state: SessionState,
        last_error: Option<String>,
    ) -> Result<SessionStatus, SessionError> {
        let paths = self.paths_for(id);
        let mut status = if paths.root.join(STATUS_FILE).exists() {
            self.read_status(&paths, id)?
        } else {
            new_status(*id)
        };
        status.state = state;
        status.last_error = last_error;
        status.updated_at = chrono::Utc::now().timestamp();
        self.write_status(&paths, &status)?;
        tracing::debug!(session_id = %id, state = %state, "session state changed");
        Ok(status)
    }

    fn read_status(&self, paths: &SessionPaths, id: &SessionId) -> Result<SessionStatus, SessionError> {
        let path = paths.root.join(STATUS_FILE);
        match std::fs::read_to_string(&path) {
            Ok(content) => serde_json::from_str(&content).map_err(|e| SessionError::State {
                path,
                reason: e.to_string(),
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(new_status(*id)),
            Err(e) => Err(e.into()),
        }
    }

    fn write_status(&self, paths: &SessionPaths, status: &SessionStatus) -> Result<(), SessionError> {
        let path = paths.root.join(STATUS_FILE);
        let tmp = paths.root.join(format!("{}.tmp", STATUS_FILE));
        let json = serde_json::to_vec_pretty(status).map_err(|e| SessionError::State {
            path: path.clone(),
            reason: e.to_string(),
        })?;
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    /// Write an uploaded file into the session file area.
    ///
    /// Only the final path component of `file_name` is kept.
    pub fn store_upload(
        &self,
        id: &SessionId,
        file_name: &str,
        bytes: &[u8],
    ) -> Result<PathBuf, SessionError> {
        let ctx = self.open(id)?;
        let name = sanitize_file_name(file_name)
            .ok_or_else(|| SessionError::InvalidFileName(file_name.to_string()))?;
        let dest = ctx.paths.files_dir.join(name);
        std::fs::write(&dest, bytes)?;
        tracing::debug!(session_id = %id, file = %dest.display(), bytes = bytes.len(), "upload stored");
        Ok(dest)
    }

    /// Write a batch of uploads into the session file area.
    ///
    /// Uploads sharing a name within the batch are stored as `stem-1.ext`,
    /// `stem-2.ext`, ... so none overwrites another.
    pub fn store_uploads(
        &self,
        id: &SessionId,
        files: Vec<(String, Vec<u8>)>,
    ) -> Result<Vec<PathBuf>, SessionError> {
        let mut taken = HashSet::new();
        let mut paths = Vec::with_capacity(files.len());
        for (file_name, bytes) in files {
            let name = sanitize_file_name(&file_name)
                .ok_or_else(|| SessionError::InvalidFileName(file_name.clone()))?;
            let name = claim_file_name(&name, &mut taken);
            if name != file_name {
                tracing::debug!(session_id = %id, upload = %file_name, stored_as = %name, "upload renamed");
            }
            paths.push(self.store_upload(id, &name, &bytes)?);
        }
        Ok(paths)
    }

    /// Drop every file and vector of `id` and return it to `Empty`.
    ///
    /// Cancels a running ingestion first, then waits for the session gate.
    pub async fn reset(&self, id: &SessionId) -> Result<SessionContext, SessionError> {
        let ctx = self.context(id);
        if !ctx.paths.root.is_dir() {
            return Err(SessionError::NotFound(id.to_string()));
        }
        let slot = self.slot(id);
        slot.cancel_ingest();
        let _guard = slot.lock().await;

        if let Err(e) = self.remove_all(&ctx.paths.root).await {
            // The status file may already be gone; recording the failure is best effort.
            if self.init_dirs(&ctx.paths).is_ok() {
                let _ = self.set_state(id, SessionState::Error, Some(e.to_string()));
            }
            return Err(e);
        }

        self.init_dirs(&ctx.paths)?;
        self.write_status(&ctx.paths, &new_status(*id))?;
        tracing::info!(session_id = %id, "session reset");
        Ok(ctx)
    }

    /// Delete `id` entirely.
    pub async fn destroy(&self, id: &SessionId) -> Result<(), SessionError> {
        let paths = self.paths_for(id);
        if !paths.root.is_dir() {
            return Err(SessionError::NotFound(id.to_string()));
        }
        // The slot stays registered while any task still holds it, so a
        // session recreated under the same id keeps the same gate.
        let slot = self.slot(id);
        slot.cancel_ingest();
        let _guard = slot.lock().await;
        self.remove_all(&paths.root).await?;
        tracing::info!(session_id = %id, "session destroyed");
        Ok(())
    }

    /// Remove `path` recursively, retrying with exponential backoff.
    async fn remove_all(&self, path: &Path) -> Result<(), SessionError> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.remover.remove_all(path).await {
                Ok(()) => return Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
                Err(e) if attempt >= self.cleanup_attempts => {
                    tracing::error!(path = %path.display(), attempts = attempt, error = %e, "cleanup failed");
                    return Err(SessionError::Cleanup {
                        path: path.to_path_buf(),
                        attempts: attempt,
                        source: e,
                    });
                }
                Err(e) => {
                    let delay = self.cleanup_backoff * (1 << (attempt - 1).min(10));
                    tracing::warn!(path = %path.display(), attempt, error = %e, "cleanup failed, retrying");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

fn new_status(id: SessionId) -> SessionStatus {
    let now = chrono::Utc::now().timestamp();
    SessionStatus {
        id,
        state: SessionState::Empty,
        last_error: None,
        created_at: now,
        updated_at: now,
    }
}

/// `name`, or `stem-N.ext` with the smallest `N` not in `taken`.
///
/// The chosen name is added to `taken`.
pub fn claim_file_name(name: &str, taken: &mut HashSet<String>) -> String {
    if taken.insert(name.to_string()) {
        return name.to_string();
    }
    let (stem, ext) = match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => (stem, Some(ext)),
        _ => (name, None),
    };
    let mut n = 1u32;
    loop {
        let candidate = match ext {
            Some(ext) => format!("{}-{}.{}", stem, n, ext),
            None => format!("{}-{}", stem, n),
        };
        if taken.insert(candidate.clone()) {
            return candidate;
        }
        n += 1;
    }
}

/// Final path component of `name`, rejecting empty and dot names.
pub fn sanitize_file_name(name: &str) -> Option<String> {
    let last = name.rsplit(['/', '\\']).next()?.trim();
    if last.is_empty() || last == "." || last == ".." {
        return None;
    }
    Some(last.to_string())
}
