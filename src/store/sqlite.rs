//! SQLite-backed [`VectorIndex`].
//!
//! All notes share one database file; each note's collection is the set of
//! `passages` rows carrying its `note_id`. Appends run in a single
//! transaction, and WAL mode lets searches proceed while another request
//! appends.

use async_trait::async_trait;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::embedding::{blob_to_vec, cosine_similarity, vec_to_blob};
use crate::error::Result;
use crate::models::{EmbeddedChunk, NoteId, Passage, ScoredPassage, SourceRecord};

use super::{rank_top_k, SourceMeta, VectorIndex};

/// SQLite implementation of the [`VectorIndex`] trait.
pub struct SqliteIndex {
    pool: SqlitePool,
}

impl SqliteIndex {
    /// Wrap a pool whose schema has already been migrated.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl VectorIndex for SqliteIndex {
    async fn add(
        &self,
        note: &NoteId,
        source: &SourceMeta,
        chunks: &[EmbeddedChunk],
    ) -> Result<usize> {
        let now = chrono::Utc::now().timestamp();
        let source_id = Uuid::new_v4().to_string();
        let mut tx = self.pool.begin().await?;

        sqlx::query("INSERT OR IGNORE INTO collections (note_id, name, created_at) VALUES (?, ?, ?)")
            .bind(note.as_str())
            .bind(note.collection_name())
            .bind(now)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            r#"
            INSERT INTO sources (id, note_id, label, preview, passage_count, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&source_id)
        .bind(note.as_str())
        .bind(&source.label)
        .bind(&source.preview)
        .bind(chunks.len() as i64)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        for ec in chunks {
            sqlx::query(
                r#"
                INSERT INTO passages (id, note_id, source_id, source_label, chunk_index,
                                      text, hash, model, dims, embedding, created_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(Uuid::new_v4().to_string())
            .bind(note.as_str())
            .bind(&source_id)
            .bind(&source.label)
            .bind(ec.chunk.index)
            .bind(&ec.chunk.text)
            .bind(&ec.chunk.hash)
            .bind(&source.model)
            .bind(ec.embedding.len() as i64)
            .bind(vec_to_blob(&ec.embedding))
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(chunks.len())
    }

    async fn search(
        &self,
        note: &NoteId,
        query_vec: &[f32],
        k: usize,
    ) -> Result<Vec<ScoredPassage>> {
        if k == 0 {
            return Ok(Vec::new());
        }

        // Fetch the note's vectors and compute cosine similarity in Rust
        let rows = sqlx::query(
            r#"
            SELECT seq, id, source_label, chunk_index, text, hash, embedding
            FROM passages
            WHERE note_id = ?
            "#,
        )
        .bind(note.as_str())
        .fetch_all(&self.pool)
        .await?;

        let candidates: Vec<ScoredPassage> = rows
            .iter()
            .map(|row| {
                let blob: Vec<u8> = row.get("embedding");
                let score = cosine_similarity(query_vec, &blob_to_vec(&blob));
                ScoredPassage {
                    passage: Passage {
                        id: row.get("id"),
                        note_id: note.clone(),
                        source_label: row.get("source_label"),
                        chunk_index: row.get("chunk_index"),
                        seq: row.get("seq"),
                        text: row.get("text"),
                        hash: row.get("hash"),
                    },
                    score,
                }
            })
            .collect();

        Ok(rank_top_k(candidates, k))
    }

    async fn count(&self, note: &NoteId) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM passages WHERE note_id = ?")
            .bind(note.as_str())
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    async fn sources(&self, note: &NoteId) -> Result<Vec<SourceRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT id, label, preview, passage_count, created_at
            FROM sources
            WHERE note_id = ?
            ORDER BY created_at, rowid
            "#,
        )
        .bind(note.as_str())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| SourceRecord {
                id: row.get("id"),
                note_id: note.clone(),
                label: row.get("label"),
                preview: row.get("preview"),
                passage_count: row.get("passage_count"),
                created_at: row.get("created_at"),
            })
            .collect())
    }

    async fn drop_note(&self, note: &NoteId) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM passages WHERE note_id = ?")
            .bind(note.as_str())
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM sources WHERE note_id = ?")
            .bind(note.as_str())
            .execute(&mut *tx)
            .await?;
        let removed = sqlx::query("DELETE FROM collections WHERE note_id = ?")
            .bind(note.as_str())
            .execute(&mut *tx)
            .await?
            .rows_affected();

        tx.commit().await?;
        Ok(removed > 0)
    }
}
