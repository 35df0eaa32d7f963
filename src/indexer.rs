//! Embedding and persistence of prepared chunks.
//!
//! [`EmbeddingIndexer::embed`] runs the shared provider over chunk texts in
//! batches of `embedding.batch_size`, checking every vector's dimension.
//! [`EmbeddingIndexer::persist`] upserts the result into the session's
//! collection in a single transaction.

use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::embedding::{check_dims, EmbeddingProvider};
use crate::error::{EmbedError, IngestError};
use crate::models::{Chunk, EmbeddedBatch, EmbeddedChunk, SessionContext};
use crate::store::VectorCollection;

/// Counts reported after a successful persist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PersistSummary {
    pub new_chunks: usize,
    pub collection_size: usize,
}

pub struct EmbeddingIndexer {
    provider: Arc<dyn EmbeddingProvider>,
    batch_size: usize,
}

impl EmbeddingIndexer {
    pub fn new(provider: Arc<dyn EmbeddingProvider>, batch_size: usize) -> Self {
        Self {
            provider,
            batch_size: batch_size.max(1),
        }
    }

    /// Embed `chunks`, stopping early with [`IngestError::Cancelled`] when
    /// `cancel` fires.
    pub async fn embed(
        &self,
        chunks: Vec<Chunk>,
        cancel: &CancellationToken,
    ) -> Result<EmbeddedBatch, IngestError> {
        let dims = self.provider.dims();
        let mut items = Vec::with_capacity(chunks.len());
        let mut pending = chunks.into_iter().peekable();

        while pending.peek().is_some() {
            let group: Vec<Chunk> = pending.by_ref().take(self.batch_size).collect();
            let texts: Vec<String> = group.iter().map(|c| c.text.clone()).collect();

            let vectors = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(IngestError::Cancelled),
                res = self.provider.embed(&texts) => res?,
            };

            if vectors.len() != group.len() {
                return Err(EmbedError::ProviderUnavailable(format!(
                    "provider returned {} vectors for {} texts",
                    vectors.len(),
                    group.len()
                ))
                .into());
            }

            for (chunk, vector) in group.into_iter().zip(vectors) {
                check_dims(dims, &vector)?;
                items.push(EmbeddedChunk { chunk, vector });
            }
            tracing::debug!(embedded = items.len(), "embedding batch done");
        }

        Ok(EmbeddedBatch {
            model: self.provider.model_name().to_string(),
            dims,
            items,
        })
    }

    /// Upsert `batch` into the collection of `ctx` atomically.
    pub async fn persist(
        &self,
        ctx: &SessionContext,
        batch: &EmbeddedBatch,
    ) -> Result<PersistSummary, IngestError> {
        let collection = VectorCollection::open(&ctx.collection_path()).await?;
        let result = async {
            let counts = collection.upsert_batch(batch).await?;
            let size = collection.count().await?;
            Ok::<_, crate::error::StoreError>((counts, size))
        }
        .await;
        collection.close().await;

        let (counts, collection_size) = result?;
        tracing::info!(
            session_id = %ctx.id,
            new_chunks = counts.inserted,
            updated = counts.updated,
            collection_size,
            "collection updated"
        );
        Ok(PersistSummary {
            new_chunks: counts.inserted,
            collection_size,
        })
    }
}
