//! Session-scoped RAG orchestration.
//!
//! [`QueryOrchestrator`] is the single entry point used by the CLI, the HTTP
//! server and the benchmark runner. It owns the session store and the shared
//! providers, drives the session state machine and wires the stages together:
//!
//! ```text
//! ingest: files → IngestionPipeline → EmbeddingIndexer::embed → persist
//! query:  text  → Retriever → PromptAssembler → GenerationProvider
//! ```
//!
//! # State Machine
//!
//! ```text
//! Empty  --ingest ok-->      Ready
//! any    --ingest failure--> Error   (collection untouched)
//! Error  --ingest ok-->      Ready
//! any    --reset-->          Empty
//! ```
//!
//! Only `Ready` sessions accept queries. A run superseded by a newer ingestion
//! of the same session restores the state it found.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::embedding::{create_provider, EmbeddingProvider};
use crate::error::{IngestError, QueryError, RetrievalError, SessionError};
use crate::generation::{
    generate_with_retry, ChatCompletionsClient, GenerationProvider, GenerationRequest, ModelId,
    RetryPolicy,
};
use crate::indexer::EmbeddingIndexer;
use crate::ingest::IngestionPipeline;
use crate::models::{
    Answer, IngestSummary, RankedChunk, SessionContext, SessionId, SessionState, SessionStatus,
    SourceMatch, SourcedAnswer,
};
use crate::prompt;
use crate::retrieve::Retriever;
use crate::session::SessionStore;

pub struct QueryOrchestrator {
    config: Config,
    sessions: SessionStore,
    pipeline: IngestionPipeline,
    indexer: EmbeddingIndexer,
    retriever: Retriever,
    generator: Arc<dyn GenerationProvider>,
    retry: RetryPolicy,
}

/// Ranked chunks for one query and the model that answers it.
struct Retrieved {
    model: ModelId,
    ranked: Vec<RankedChunk>,
}

impl QueryOrchestrator {
    pub fn new(
        config: Config,
        embedder: Arc<dyn EmbeddingProvider>,
        generator: Arc<dyn GenerationProvider>,
    ) -> Self {
        Self {
            sessions: SessionStore::new(&config.storage),
            pipeline: IngestionPipeline::new(config.chunking.clone()),
            indexer: EmbeddingIndexer::new(embedder.clone(), config.embedding.batch_size),
            retriever: Retriever::new(embedder),
            retry: RetryPolicy::from_config(&config.generation),
            generator,
            config,
        }
    }

    /// Build the configured embedding provider and chat completions client.
    pub fn from_config(config: Config) -> anyhow::Result<Self> {
        let embedder = create_provider(&config.embedding)?;
        let generator = Arc::new(ChatCompletionsClient::new(&config.generation)?);
        Ok(Self::new(config, embedder, generator))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    fn default_model(&self) -> ModelId {
        self.config
            .generation
            .default_model
            .parse()
            .unwrap_or_default()
    }

    // ============ Session Lifecycle ============

    pub fn create_session(&self) -> Result<SessionStatus, SessionError> {
        let ctx = self.sessions.create()?;
        self.sessions.status(&ctx.id)
    }

    pub fn session_status(&self, id: &SessionId) -> Result<SessionStatus, SessionError> {
        self.sessions.status(id)
    }

    pub fn session_state(&self, id: &SessionId) -> Result<SessionState, SessionError> {
        self.sessions.state(id)
    }

    pub async fn reset(&self, id: &SessionId) -> Result<SessionStatus, SessionError> {
        self.sessions.reset(id).await?;
        self.sessions.status(id)
    }

    pub async fn destroy(&self, id: &SessionId) -> Result<(), SessionError> {
        self.sessions.destroy(id).await
    }

    // ============ Ingestion ============

    /// Ingest `paths` into session `id`, creating the session on first access.
    ///
    /// An empty `paths` re-ingests every file already in the session file
    /// area. A running ingestion of the same session is cancelled first.
    pub async fn ingest(
        &self,
        id: &SessionId,
        paths: &[PathBuf],
    ) -> Result<IngestSummary, IngestError> {
        let ctx = self.sessions.open(id)?;
        let slot = self.sessions.slot(id);
        let ticket = slot.begin_ingest();

        let result: Result<IngestSummary, IngestError> = async {
            let _guard = tokio::select! {
                biased;
                _ = ticket.token.cancelled() => return Err(IngestError::Cancelled),
                guard = slot.lock() => guard,
            };

            let previous = self.sessions.status(id)?;
            self.sessions.set_state(id, SessionState::Indexing, None)?;
            tracing::info!(session_id = %id, files = paths.len(), "ingestion started");
            let started = Instant::now();

            let outcome = self.run_ingest(&ctx, paths, &ticket.token).await;
            match &outcome {
                Ok(summary) => {
                    self.sessions.set_state(id, SessionState::Ready, None)?;
                    tracing::info!(
                        session_id = %id,
                        documents = summary.documents,
                        chunks = summary.chunks,
                        new_chunks = summary.new_chunks,
                        collection_size = summary.collection_size,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "ingestion finished"
                    );
                }
                Err(IngestError::Cancelled) => {
                    tracing::info!(session_id = %id, "ingestion superseded");
                    self.sessions
                        .set_state(id, previous.state, previous.last_error)?;
                }
                Err(e) => {
                    tracing::error!(session_id = %id, error = %e, "ingestion failed");
                    self.sessions
                        .set_state(id, SessionState::Error, Some(e.to_string()))?;
                }
            }
            outcome
        }
        .await;

        slot.finish_ingest(&ticket);
        result
    }

    /// Store uploaded files in the session file area, then ingest them.
    pub async fn ingest_uploads(
        &self,
        id: &SessionId,
        files: Vec<(String, Vec<u8>)>,
    ) -> Result<IngestSummary, IngestError> {
        let paths = self.sessions.store_uploads(id, files)?;
        if paths.is_empty() {
            return Err(IngestError::NoUsableDocuments);
        }
        self.ingest(id, &paths).await
    }

    async fn run_ingest(
        &self,
        ctx: &SessionContext,
        paths: &[PathBuf],
        cancel: &CancellationToken,
    ) -> Result<IngestSummary, IngestError> {
        let prepared = self.pipeline.process(ctx, paths, cancel).await?;
        let documents = prepared.documents.len();
        let chunks = prepared.chunks.len();

        let batch = self.indexer.embed(prepared.chunks, cancel).await?;
        if cancel.is_cancelled() {
            return Err(IngestError::Cancelled);
        }
        let persisted = self.indexer.persist(ctx, &batch).await?;

        Ok(IngestSummary {
            session_id: ctx.id,
            documents,
            chunks,
            new_chunks: persisted.new_chunks,
            collection_size: persisted.collection_size,
            warnings: prepared.warnings,
        })
    }

    // ============ Query ============

    /// Answer `query_text` from the documents of session `id`.
    pub async fn query(
        &self,
        id: &SessionId,
        query_text: &str,
        model: Option<ModelId>,
    ) -> Result<Answer, QueryError> {
        let query_text = validate_query(query_text)?;
        let slot = self.sessions.slot(id);
        let _guard = slot.lock().await;

        let retrieved = self
            .retrieve(id, query_text, model, self.config.retrieval.top_k)
            .await?;
        let (answer, context_chunk_ids) = self
            .answer(id, query_text, retrieved.model, &retrieved.ranked)
            .await?;
        Ok(Answer {
            answer,
            model: retrieved.model.as_str().to_string(),
            context_chunk_ids,
        })
    }

    /// Like [`QueryOrchestrator::query`], with the first `top_k` ranked
    /// chunks reported as sources.
    pub async fn query_with_sources(
        &self,
        id: &SessionId,
        query_text: &str,
        model: Option<ModelId>,
        top_k: Option<usize>,
    ) -> Result<SourcedAnswer, QueryError> {
        let source_k = top_k
            .unwrap_or(self.config.retrieval.source_top_k)
            .max(1);
        let k = source_k.max(self.config.retrieval.top_k);
        let query_text = validate_query(query_text)?;
        let slot = self.sessions.slot(id);
        let _guard = slot.lock().await;

        let retrieved = self.retrieve(id, query_text, model, k).await?;
        let (answer, _) = self
            .answer(id, query_text, retrieved.model, &retrieved.ranked)
            .await?;

        let snippet_chars = self.config.retrieval.snippet_chars;
        let sources: Vec<SourceMatch> = retrieved
            .ranked
            .iter()
            .take(source_k)
            .map(|r| SourceMatch {
                chunk_id: r.chunk_id.clone(),
                score: r.score,
                snippet: snippet(&r.text, snippet_chars),
                source: r.source.clone(),
            })
            .collect();

        Ok(SourcedAnswer {
            answer,
            model: retrieved.model.as_str().to_string(),
            top_similarity_score: retrieved.ranked.first().map(|r| r.score).unwrap_or(0.0),
            sources,
        })
    }

    /// Rank `k` chunks of a `Ready` session. The caller holds the session gate.
    async fn retrieve(
        &self,
        id: &SessionId,
        query_text: &str,
        model: Option<ModelId>,
        k: usize,
    ) -> Result<Retrieved, QueryError> {
        let model = model.unwrap_or_else(|| self.default_model());

        let status = self.sessions.status(id)?;
        if status.state != SessionState::Ready {
            return Err(RetrievalError::SessionNotReady {
                state: status.state,
            }
            .into());
        }
        let ctx = self.sessions.open_existing(id)?;
        let ranked = self.retriever.search(&ctx, query_text, k).await?;
        Ok(Retrieved { model, ranked })
    }

    /// Assemble the prompt from the best `retrieval.top_k` chunks and generate.
    ///
    /// Runs under the session gate, so a reset or ingest of the same session
    /// waits for the answer.
    async fn answer(
        &self,
        id: &SessionId,
        query_text: &str,
        model: ModelId,
        ranked: &[RankedChunk],
    ) -> Result<(String, Vec<String>), QueryError> {
        let context = &ranked[..ranked.len().min(self.config.retrieval.top_k)];
        let prompt = prompt::build(query_text, context, self.config.retrieval.max_context_chars);

        let request = GenerationRequest {
            model,
            system_prompt: prompt.system,
            user_prompt: prompt.user,
            temperature: self.config.generation.temperature,
        };

        let started = Instant::now();
        let answer = generate_with_retry(self.generator.as_ref(), &request, self.retry).await;
        match &answer {
            Ok(_) => tracing::info!(
                session_id = %id,
                model = %model,
                context_chunks = prompt.included.len(),
                latency_ms = started.elapsed().as_millis() as u64,
                "query answered"
            ),
            Err(e) => tracing::warn!(session_id = %id, model = %model, error = %e, "generation failed"),
        }
        Ok((answer?, prompt.included))
    }
}

fn validate_query(query_text: &str) -> Result<&str, QueryError> {
    let query_text = query_text.trim();
    if query_text.is_empty() {
        return Err(QueryError::EmptyQuery);
    }
    Ok(query_text)
}

/// First `max_chars` characters of `text` with whitespace collapsed.
fn snippet(text: &str, max_chars: usize) -> String {
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.chars().count() <= max_chars {
        return collapsed;
    }
    let mut out: String = collapsed.chars().take(max_chars).collect();
    out.push('…');
    out
}
