//! Core data models shared by ingestion, the vector index, and answering.
//!
//! A [`NoteId`] scopes exactly one vector collection. Passages are immutable
//! once stored; re-ingesting a source appends new ones.

use serde::{Deserialize, Serialize};

/// Opaque note identity. Integer and string keys from the relational store
/// are both accepted and kept in their textual form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NoteId(String);

impl NoteId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Name of the note's vector collection.
    pub fn collection_name(&self) -> String {
        format!("note_{}", self.0)
    }
}

impl std::fmt::Display for NoteId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<i64> for NoteId {
    fn from(id: i64) -> Self {
        Self(id.to_string())
    }
}

impl From<&str> for NoteId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for NoteId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// A contiguous slice of source text produced by the chunker.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    /// Position within the source, contiguous from 0.
    pub index: i64,
    /// Character offset of the first character in the source text.
    pub start: usize,
    pub text: String,
    /// SHA-256 of `text`, hex encoded.
    pub hash: String,
}

/// A chunk paired with its embedding, ready to be appended to an index.
#[derive(Debug, Clone)]
pub struct EmbeddedChunk {
    pub chunk: Chunk,
    pub embedding: Vec<f32>,
}

/// A stored passage.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Passage {
    pub id: String,
    pub note_id: NoteId,
    /// Citation label of the originating source (file name, URL, ...).
    pub source_label: String,
    pub chunk_index: i64,
    /// Sequence position within the note's collection; increases with
    /// insertion order.
    pub seq: i64,
    pub text: String,
    pub hash: String,
}

/// A passage returned by similarity search.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoredPassage {
    #[serde(flatten)]
    pub passage: Passage,
    pub score: f32,
}

/// One ingestion of an origin (file, URL, transcript) into a note.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceRecord {
    pub id: String,
    pub note_id: NoteId,
    pub label: String,
    pub preview: String,
    pub passage_count: i64,
    pub created_at: i64,
}

const PREVIEW_CHARS: usize = 200;

/// Short whitespace-collapsed preview of a source's content.
pub fn make_preview(text: &str) -> String {
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.chars().count() <= PREVIEW_CHARS {
        collapsed
    } else {
        let mut preview: String = collapsed.chars().take(PREVIEW_CHARS).collect();
        preview.push_str("...");
        preview
    }
}
