//! Semantic retrieval over one session's collection.
//!
//! Embeds the query with the shared provider, scores every stored vector by
//! cosine similarity and returns the best `k`. Ties are broken by insertion
//! sequence so identical inputs always rank identically.

use std::cmp::Ordering;
use std::sync::Arc;

use crate::embedding::{cosine_similarity, embed_query, EmbeddingProvider};
use crate::error::{EmbedError, RetrievalError};
use crate::models::{RankedChunk, SessionContext};
use crate::store::{StoredVector, VectorCollection};

pub struct Retriever {
    provider: Arc<dyn EmbeddingProvider>,
}

impl Retriever {
    pub fn new(provider: Arc<dyn EmbeddingProvider>) -> Self {
        Self { provider }
    }

    /// Top `k` chunks of the session in `ctx` for `query_text`.
    ///
    /// `k` is clamped to the collection size. A missing or empty collection
    /// yields [`RetrievalError::EmptyIndex`].
    pub async fn search(
        &self,
        ctx: &SessionContext,
        query_text: &str,
        k: usize,
    ) -> Result<Vec<RankedChunk>, RetrievalError> {
        let Some(collection) = VectorCollection::open_existing(&ctx.collection_path()).await?
        else {
            return Err(RetrievalError::EmptyIndex);
        };
        let loaded = async {
            let dims = collection.dims().await?;
            let stored = collection.all_vectors().await?;
            Ok::<_, crate::error::StoreError>((dims, stored))
        }
        .await;
        collection.close().await;
        let (dims, stored) = loaded?;

        if stored.is_empty() {
            return Err(RetrievalError::EmptyIndex);
        }

        let query = embed_query(self.provider.as_ref(), query_text).await?;
        if let Some(dims) = dims {
            if dims != query.len() {
                return Err(EmbedError::DimensionMismatch {
                    expected: dims,
                    actual: query.len(),
                }
                .into());
            }
        }

        let ranked = rank(&query, stored, k);
        tracing::debug!(
            session_id = %ctx.id,
            k,
            returned = ranked.len(),
            top_score = ranked.first().map(|r| r.score).unwrap_or(0.0),
            "retrieval done"
        );
        Ok(ranked)
    }
}

/// Score `stored` against `query`: similarity descending, then insertion
/// sequence ascending. Returns at most `k` entries (at least one when
/// `stored` is non-empty).
pub fn rank(query: &[f32], stored: Vec<StoredVector>, k: usize) -> Vec<RankedChunk> {
    let mut scored: Vec<RankedChunk> = stored
        .into_iter()
        .map(|s| RankedChunk {
            score: cosine_similarity(query, &s.vector),
            chunk_id: s.chunk_id,
            text: s.text,
            source: s.source,
            seq: s.seq,
        })
        .collect();

    scored.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(Ordering::Equal)
            .then(a.seq.cmp(&b.seq))
    });
    scored.truncate(k.max(1));
    scored
}
