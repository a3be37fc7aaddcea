//! Question → ranked passages for one note.
//!
//! The retriever embeds the question and returns the index's similarity
//! order unchanged; there is no query rewriting or re-ranking. An
//! unavailable embedder is reported as [`Retrieval::Unavailable`] rather
//! than an error so the query path can degrade to a user-facing message.

use std::sync::Arc;
use std::time::Duration;

use crate::embedding::{embed_query, Embedder};
use crate::error::{Phase, RagError, Result};
use crate::models::{NoteId, ScoredPassage};
use crate::store::VectorIndex;

/// Outcome of a retrieval that did not hit a storage failure.
#[derive(Debug)]
pub enum Retrieval {
    /// Ranked passages, best first. Empty when the note has nothing indexed.
    Passages(Vec<ScoredPassage>),
    /// Retrieval is disabled for this request; carries the degraded cause.
    Unavailable(RagError),
}

pub struct Retriever {
    embedder: Arc<dyn Embedder>,
    index: Arc<dyn VectorIndex>,
    timeout: Duration,
}

impl Retriever {
    pub fn new(embedder: Arc<dyn Embedder>, index: Arc<dyn VectorIndex>, timeout: Duration) -> Self {
        Self {
            embedder,
            index,
            timeout,
        }
    }

    /// Embed `question` and search the note's index for the top `k` passages.
    ///
    /// # Errors
    ///
    /// Only storage failures; embedding problems become
    /// [`Retrieval::Unavailable`].
    pub async fn retrieve(&self, note: &NoteId, question: &str, k: usize) -> Result<Retrieval> {
        if question.trim().is_empty() || k == 0 {
            return Ok(Retrieval::Passages(Vec::new()));
        }

        let embedded = match tokio::time::timeout(
            self.timeout,
            embed_query(self.embedder.as_ref(), question),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(RagError::Timeout {
                phase: Phase::Embedding,
                secs: self.timeout.as_secs(),
            }),
        };

        let query_vec = match embedded {
            Ok(v) => v,
            Err(e) => {
                let e = e.into_embedding();
                tracing::warn!(note = %note, error = %e, "retrieval unavailable");
                return Ok(Retrieval::Unavailable(e));
            }
        };

        let passages = self.index.search(note, &query_vec, k).await?;
        tracing::debug!(note = %note, k, hits = passages.len(), "retrieved passages");
        Ok(Retrieval::Passages(passages))
    }
}
