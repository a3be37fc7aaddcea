//! In-memory [`VectorIndex`] for tests and embedding in other hosts.
//!
//! Collections live in a `HashMap` behind `std::sync::RwLock`. Sequence
//! positions come from one counter shared by all notes, so they increase in
//! insertion order within every note. Search is brute-force cosine
//! similarity.

use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use uuid::Uuid;

use crate::embedding::cosine_similarity;
use crate::error::{RagError, Result};
use crate::models::{EmbeddedChunk, NoteId, Passage, ScoredPassage, SourceRecord};

use super::{rank_top_k, SourceMeta, VectorIndex};

struct StoredPassage {
    passage: Passage,
    vector: Vec<f32>,
}

#[derive(Default)]
struct Collection {
    sources: Vec<SourceRecord>,
    passages: Vec<StoredPassage>,
}

#[derive(Default)]
struct Inner {
    collections: HashMap<NoteId, Collection>,
    next_seq: i64,
}

/// In-memory vector index.
#[derive(Default)]
pub struct InMemoryIndex {
    inner: RwLock<Inner>,
}

impl InMemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Inner>> {
        self.inner
            .read()
            .map_err(|_| RagError::Storage("in-memory index lock poisoned".into()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Inner>> {
        self.inner
            .write()
            .map_err(|_| RagError::Storage("in-memory index lock poisoned".into()))
    }
}

#[async_trait]
impl VectorIndex for InMemoryIndex {
    async fn add(
        &self,
        note: &NoteId,
        source: &SourceMeta,
        chunks: &[EmbeddedChunk],
    ) -> Result<usize> {
        let mut inner = self.write()?;
        let mut seq = inner.next_seq;
        let source_id = Uuid::new_v4().to_string();

        let passages: Vec<StoredPassage> = chunks
            .iter()
            .map(|ec| {
                let stored = StoredPassage {
                    passage: Passage {
                        id: Uuid::new_v4().to_string(),
                        note_id: note.clone(),
                        source_label: source.label.clone(),
                        chunk_index: ec.chunk.index,
                        seq,
                        text: ec.chunk.text.clone(),
                        hash: ec.chunk.hash.clone(),
                    },
                    vector: ec.embedding.clone(),
                };
                seq += 1;
                stored
            })
            .collect();

        inner.next_seq = seq;
        let collection = inner.collections.entry(note.clone()).or_default();
        collection.sources.push(SourceRecord {
            id: source_id,
            note_id: note.clone(),
            label: source.label.clone(),
            preview: source.preview.clone(),
            passage_count: passages.len() as i64,
            created_at: chrono::Utc::now().timestamp(),
        });
        let written = passages.len();
        collection.passages.extend(passages);
        Ok(written)
    }

    async fn search(
        &self,
        note: &NoteId,
        query_vec: &[f32],
        k: usize,
    ) -> Result<Vec<ScoredPassage>> {
        let inner = self.read()?;
        let Some(collection) = inner.collections.get(note) else {
            return Ok(Vec::new());
        };

        let candidates = collection
            .passages
            .iter()
            .map(|sp| ScoredPassage {
                passage: sp.passage.clone(),
                score: cosine_similarity(query_vec, &sp.vector),
            })
            .collect();
        Ok(rank_top_k(candidates, k))
    }

    async fn count(&self, note: &NoteId) -> Result<i64> {
        let inner = self.read()?;
        Ok(inner
            .collections
            .get(note)
            .map(|c| c.passages.len() as i64)
            .unwrap_or(0))
    }

    async fn sources(&self, note: &NoteId) -> Result<Vec<SourceRecord>> {
        let inner = self.read()?;
        Ok(inner
            .collections
            .get(note)
            .map(|c| c.sources.clone())
            .unwrap_or_default())
    }

    async fn drop_note(&self, note: &NoteId) -> Result<bool> {
        let mut inner = self.write()?;
        Ok(inner.collections.remove(note).is_some())
    }
}
