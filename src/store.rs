//! Per-session SQLite vector collection.
//!
//! Each session owns one database file at `<index_dir>/<session_id>.sqlite`
//! in WAL mode. Nothing is shared between sessions: separate files, separate
//! pools. Pools are opened per operation and closed afterwards so a reset can
//! delete the session directory without fighting open handles.
//!
//! # Schema
//!
//! ```sql
//! meta(key TEXT PRIMARY KEY, value TEXT NOT NULL)
//! chunks(seq INTEGER PRIMARY KEY AUTOINCREMENT, id TEXT NOT NULL UNIQUE,
//!        document_id, source_path, chunk_index, start_offset, end_offset,
//!        text, hash, embedding BLOB)
//! ```
//!
//! `meta` records the embedding `dims` and `model` on first write. `seq`
//! preserves insertion order and is kept when a chunk is upserted again.

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::path::{Path, PathBuf};

use crate::embedding::{blob_to_vec, vec_to_blob};
use crate::error::StoreError;
use crate::models::EmbeddedBatch;

/// A stored chunk vector, as read back for scoring.
#[derive(Debug, Clone)]
pub struct StoredVector {
    pub seq: i64,
    pub chunk_id: String,
    pub source: String,
    pub text: String,
    pub vector: Vec<f32>,
}

/// Outcome of [`VectorCollection::upsert_batch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpsertCounts {
    pub inserted: usize,
    pub updated: usize,
}

pub struct VectorCollection {
    pool: SqlitePool,
    path: PathBuf,
}

impl VectorCollection {
    /// Open (creating if needed) the collection at `path` and apply the schema.
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(2)
            .connect_with(options)
            .await?;

        let collection = Self {
            pool,
            path: path.to_path_buf(),
        };
        collection.migrate().await?;
        Ok(collection)
    }

    /// Open the collection only if its database file already exists.
    pub async fn open_existing(path: &Path) -> Result<Option<Self>, StoreError> {
        if !path.exists() {
            return Ok(None);
        }
        Self::open(path).await.map(Some)
    }

    async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS meta (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS chunks (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                document_id TEXT NOT NULL,
                source_path TEXT NOT NULL,
                chunk_index INTEGER NOT NULL,
                start_offset INTEGER NOT NULL,
                end_offset INTEGER NOT NULL,
                text TEXT NOT NULL,
                hash TEXT NOT NULL,
                embedding BLOB NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_chunks_document_id ON chunks(document_id)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Vector dimension recorded on first write, if any.
    pub async fn dims(&self) -> Result<Option<usize>, StoreError> {
        let value: Option<String> =
            sqlx::query_scalar("SELECT value FROM meta WHERE key = 'dims'")
                .fetch_optional(&self.pool)
                .await?;
        Ok(value.and_then(|v| v.parse().ok()))
    }

    pub async fn model(&self) -> Result<Option<String>, StoreError> {
        let value: Option<String> =
            sqlx::query_scalar("SELECT value FROM meta WHERE key = 'model'")
                .fetch_optional(&self.pool)
                .await?;
        Ok(value)
    }

    pub async fn count(&self) -> Result<usize, StoreError> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks")
            .fetch_one(&self.pool)
            .await?;
        Ok(n as usize)
    }

    /// Upsert every item of `batch` in one transaction.
    ///
    /// Fails with [`StoreError::DimensionMismatch`] before writing anything
    /// when the batch dimension differs from the collection's. On any error
    /// the transaction is rolled back.
    pub async fn upsert_batch(&self, batch: &EmbeddedBatch) -> Result<UpsertCounts, StoreError> {
        let mut tx = self.pool.begin().await?;

        let stored: Option<String> =
            sqlx::query_scalar("SELECT value FROM meta WHERE key = 'dims'")
                .fetch_optional(&mut *tx)
                .await?;
        match stored.and_then(|v| v.parse::<usize>().ok()) {
            Some(dims) if dims != batch.dims => {
                return Err(StoreError::DimensionMismatch {
                    expected: dims,
                    actual: batch.dims,
                });
            }
            Some(_) => {}
            None => {
                sqlx::query("INSERT INTO meta (key, value) VALUES ('dims', ?), ('model', ?)")
                    .bind(batch.dims.to_string())
                    .bind(&batch.model)
                    .execute(&mut *tx)
                    .await?;
            }
        }

        let mut counts = UpsertCounts {
            inserted: 0,
            updated: 0,
        };
        for item in &batch.items {
            if item.vector.len() != batch.dims {
                return Err(StoreError::DimensionMismatch {
                    expected: batch.dims,
                    actual: item.vector.len(),
                });
            }

            let exists: Option<i64> = sqlx::query_scalar("SELECT seq FROM chunks WHERE id = ?")
                .bind(&item.chunk.id)
                .fetch_optional(&mut *tx)
                .await?;

            let c = &item.chunk;
            sqlx::query(
                r#"
                INSERT INTO chunks (id, document_id, source_path, chunk_index,
                                    start_offset, end_offset, text, hash, embedding)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(id) DO UPDATE SET
                    document_id = excluded.document_id,
                    source_path = excluded.source_path,
                    chunk_index = excluded.chunk_index,
                    start_offset = excluded.start_offset,
                    end_offset = excluded.end_offset,
                    text = excluded.text,
                    hash = excluded.hash,
                    embedding = excluded.embedding
                "#,
            )
            .bind(&c.id)
            .bind(&c.document_id)
            .bind(&c.source)
            .bind(c.chunk_index)
            .bind(c.start as i64)
            .bind(c.end as i64)
            .bind(&c.text)
            .bind(&c.hash)
            .bind(vec_to_blob(&item.vector))
            .execute(&mut *tx)
            .await?;

            if exists.is_some() {
                counts.updated += 1;
            } else {
                counts.inserted += 1;
            }
        }

        tx.commit().await?;
        Ok(counts)
    }

    /// Every stored vector in insertion order.
    pub async fn all_vectors(&self) -> Result<Vec<StoredVector>, StoreError> {
        let rows = sqlx::query(
            "SELECT seq, id, source_path, text, embedding FROM chunks ORDER BY seq ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| {
                let blob: Vec<u8> = row.get("embedding");
                StoredVector {
                    seq: row.get("seq"),
                    chunk_id: row.get("id"),
                    source: row.get("source_path"),
                    text: row.get("text"),
                    vector: blob_to_vec(&blob),
                }
            })
            .collect())
    }

    /// Close the pool and release the database files.
    pub async fn close(self) {
        self.pool.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Chunk, EmbeddedChunk};
    use tempfile::TempDir;

    fn item(id: &str, text: &str, vector: Vec<f32>) -> EmbeddedChunk {
        EmbeddedChunk {
            chunk: Chunk {
                id: id.to_string(),
                document_id: "doc".to_string(),
                source: "a.txt".to_string(),
                chunk_index: 0,
                start: 0,
                end: text.chars().count(),
                text: text.to_string(),
                hash: format!("h-{}", id),
            },
            vector,
        }
    }

    fn batch(dims: usize, items: Vec<EmbeddedChunk>) -> EmbeddedBatch {
        EmbeddedBatch {
            model: "test".to_string(),
            dims,
            items,
        }
    }

    #[tokio::test]
    async fn upsert_keeps_insertion_order_and_counts() {
        let tmp = TempDir::new().unwrap();
        let col = VectorCollection::open(&tmp.path().join("c.sqlite")).await.unwrap();

        let first = batch(2, vec![item("a", "alpha", vec![1.0, 0.0]), item("b", "beta", vec![0.0, 1.0])]);
        let counts = col.upsert_batch(&first).await.unwrap();
        assert_eq!(counts, UpsertCounts { inserted: 2, updated: 0 });

        let again = batch(2, vec![item("a", "alpha", vec![1.0, 0.0]), item("c", "gamma", vec![0.5, 0.5])]);
        let counts = col.upsert_batch(&again).await.unwrap();
        assert_eq!(counts, UpsertCounts { inserted: 1, updated: 1 });

        let ids: Vec<String> = col
            .all_vectors()
            .await
            .unwrap()
            .into_iter()
            .map(|v| v.chunk_id)
            .collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
        assert_eq!(col.count().await.unwrap(), 3);
        assert_eq!(col.dims().await.unwrap(), Some(2));
        assert_eq!(col.model().await.unwrap().as_deref(), Some("test"));
        col.close().await;
    }

    #[tokio::test]
    async fn dimension_mismatch_leaves_collection_unchanged() {
        let tmp = TempDir::new().unwrap();
        let col = VectorCollection::open(&tmp.path().join("c.sqlite")).await.unwrap();
        col.upsert_batch(&batch(2, vec![item("a", "alpha", vec![1.0, 0.0])]))
            .await
            .unwrap();

        let err = col
            .upsert_batch(&batch(3, vec![item("b", "beta", vec![0.0, 1.0, 0.0])]))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::DimensionMismatch { expected: 2, actual: 3 }
        ));
        assert_eq!(col.count().await.unwrap(), 1);
        col.close().await;
    }

    #[tokio::test]
    async fn ragged_batch_rolls_back() {
        let tmp = TempDir::new().unwrap();
        let col = VectorCollection::open(&tmp.path().join("c.sqlite")).await.unwrap();
        let bad = batch(2, vec![item("a", "alpha", vec![1.0, 0.0]), item("b", "beta", vec![1.0])]);
        assert!(col.upsert_batch(&bad).await.is_err());
        assert_eq!(col.count().await.unwrap(), 0);
        assert_eq!(col.dims().await.unwrap(), None);
        col.close().await;
    }

    #[tokio::test]
    async fn open_existing_missing_file_is_none() {
        let tmp = TempDir::new().unwrap();
        let col = VectorCollection::open_existing(&tmp.path().join("missing.sqlite"))
            .await
            .unwrap();
        assert!(col.is_none());
    }

    #[tokio::test]
    async fn vectors_survive_reopen() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("idx").join("c.sqlite");
        let col = VectorCollection::open(&path).await.unwrap();
        col.upsert_batch(&batch(3, vec![item("a", "alpha", vec![0.25, -0.5, 1.0])]))
            .await
            .unwrap();
        col.close().await;

        let col = VectorCollection::open_existing(&path).await.unwrap().unwrap();
        let stored = col.all_vectors().await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].vector, vec![0.25, -0.5, 1.0]);
        assert_eq!(stored[0].text, "alpha");
        assert_eq!(stored[0].source, "a.txt");
        col.close().await;
    }
}
