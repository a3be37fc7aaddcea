//! Per-note vector index abstraction.
//!
//! The [`VectorIndex`] trait is the only storage seam the pipelines see.
//! Every operation is scoped by [`NoteId`]; no passage is ever visible from
//! another note's collection.
//!
//! Implementations must be `Send + Sync` and safe for concurrent readers and
//! appenders on the same note: appends are atomic per call, and a search that
//! started before an append need not observe it.

pub mod memory;
pub mod sqlite;

use async_trait::async_trait;

use crate::error::Result;
use crate::models::{EmbeddedChunk, NoteId, ScoredPassage, SourceRecord};

pub use memory::InMemoryIndex;
pub use sqlite::SqliteIndex;

/// Metadata recorded alongside one ingestion call.
#[derive(Debug, Clone)]
pub struct SourceMeta {
    /// Citation label (file name, URL, transcript title).
    pub label: String,
    /// Short content preview.
    pub preview: String,
    /// Embedding model that produced the vectors.
    pub model: String,
}

/// Abstract per-note vector collection.
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`add`](VectorIndex::add) | Append embedded chunks for one source |
/// | [`search`](VectorIndex::search) | Top-k cosine similarity within a note |
/// | [`count`](VectorIndex::count) | Number of stored passages |
/// | [`sources`](VectorIndex::sources) | Ingestion records for a note |
/// | [`drop_note`](VectorIndex::drop_note) | Delete a note's whole collection |
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Append passages for one source, creating the collection on first use.
    ///
    /// All-or-nothing: either every chunk becomes a passage or none does.
    /// Returns the number of passages written.
    async fn add(&self, note: &NoteId, source: &SourceMeta, chunks: &[EmbeddedChunk])
        -> Result<usize>;

    /// Return the `k` passages most similar to `query_vec`, by descending
    /// similarity, ties broken by earliest sequence position.
    ///
    /// A note with no collection yields an empty result, not an error.
    async fn search(&self, note: &NoteId, query_vec: &[f32], k: usize)
        -> Result<Vec<ScoredPassage>>;

    async fn count(&self, note: &NoteId) -> Result<i64>;

    async fn sources(&self, note: &NoteId) -> Result<Vec<SourceRecord>>;

    /// Delete the note's collection. Returns `false` if it did not exist.
    async fn drop_note(&self, note: &NoteId) -> Result<bool>;
}

/// Order candidates by score desc, then seq asc, and keep the first `k`.
pub(crate) fn rank_top_k(mut candidates: Vec<ScoredPassage>, k: usize) -> Vec<ScoredPassage> {
    candidates.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.passage.seq.cmp(&b.passage.seq))
    });
    candidates.truncate(k);
    candidates
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Passage;

    fn scored(seq: i64, score: f32) -> ScoredPassage {
        ScoredPassage {
            passage: Passage {
                id: format!("p{}", seq),
                note_id: NoteId::from(1),
                source_label: "doc".to_string(),
                chunk_index: seq,
                seq,
                text: String::new(),
                hash: String::new(),
            },
            score,
        }
    }

    #[test]
    fn test_rank_orders_by_score_then_seq() {
        let ranked = rank_top_k(
            vec![scored(3, 0.5), scored(1, 0.9), scored(2, 0.5), scored(0, 0.1)],
            3,
        );
        let seqs: Vec<i64> = ranked.iter().map(|s| s.passage.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
    }

    #[test]
    fn test_rank_k_zero_is_empty() {
        assert!(rank_top_k(vec![scored(0, 1.0)], 0).is_empty());
    }
}
