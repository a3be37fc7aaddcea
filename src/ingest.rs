//! Ingestion pipeline orchestration.
//!
//! Coordinates the write path for one source: chunking → embedding →
//! index append. The whole chunk set is embedded before anything is
//! written, so a failing provider never leaves a partially indexed source
//! behind.

use std::sync::Arc;
use std::time::Duration;

use crate::chunk::chunk_text;
use crate::config::Config;
use crate::embedding::{embed_all, Embedder};
use crate::error::{Phase, RagError, Result};
use crate::models::{make_preview, EmbeddedChunk, NoteId};
use crate::store::{SourceMeta, VectorIndex};

/// Result of one ingestion call that did not fail outright.
#[derive(Debug, Clone, PartialEq)]
pub enum IngestOutcome {
    /// Every chunk was embedded and appended.
    Ingested { passages: usize },
    /// The text had no content; nothing was written.
    Empty,
    /// Embedding is unavailable; nothing was written and the note keeps
    /// working without the new source.
    Degraded { reason: String },
}

impl IngestOutcome {
    pub fn status(&self) -> &'static str {
        match self {
            IngestOutcome::Ingested { .. } => "ingested",
            IngestOutcome::Empty => "empty",
            IngestOutcome::Degraded { .. } => "degraded",
        }
    }

    pub fn passages(&self) -> usize {
        match self {
            IngestOutcome::Ingested { passages } => *passages,
            _ => 0,
        }
    }
}

pub struct IngestPipeline {
    embedder: Arc<dyn Embedder>,
    index: Arc<dyn VectorIndex>,
    chunk_size: usize,
    overlap: usize,
    batch_size: usize,
    timeout: Duration,
}

impl IngestPipeline {
    pub fn new(config: &Config, embedder: Arc<dyn Embedder>, index: Arc<dyn VectorIndex>) -> Self {
        Self {
            embedder,
            index,
            chunk_size: config.chunking.chunk_size,
            overlap: config.chunking.overlap,
            batch_size: config.embedding.batch_size,
            timeout: Duration::from_secs(config.embedding.timeout_secs),
        }
    }

    /// Chunk, embed, and append `text` to the note's index under `label`.
    ///
    /// # Errors
    ///
    /// Storage failures. Empty text and embedding problems are reported
    /// through [`IngestOutcome`].
    pub async fn ingest(&self, note: &NoteId, label: &str, text: &str) -> Result<IngestOutcome> {
        let chunks = chunk_text(text, self.chunk_size, self.overlap);
        if chunks.is_empty() {
            tracing::debug!(note = %note, source = label, "nothing to ingest");
            return Ok(IngestOutcome::Empty);
        }

        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        let embedded = match tokio::time::timeout(
            self.timeout,
            embed_all(self.embedder.as_ref(), &texts, self.batch_size),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(RagError::Timeout {
                phase: Phase::Embedding,
                secs: self.timeout.as_secs(),
            }),
        };

        let vectors = match embedded {
            Ok(v) => v,
            Err(e) => {
                let e = e.into_embedding();
                tracing::warn!(note = %note, source = label, error = %e, "ingestion degraded");
                return Ok(IngestOutcome::Degraded {
                    reason: e.to_string(),
                });
            }
        };

        let embedded_chunks: Vec<EmbeddedChunk> = chunks
            .into_iter()
            .zip(vectors)
            .map(|(chunk, embedding)| EmbeddedChunk { chunk, embedding })
            .collect();

        let meta = SourceMeta {
            label: label.to_string(),
            preview: make_preview(text),
            model: self.embedder.model_name().to_string(),
        };
        let passages = self.index.add(note, &meta, &embedded_chunks).await?;

        tracing::info!(note = %note, source = label, passages, "ingested source");
        Ok(IngestOutcome::Ingested { passages })
    }
}
