//! Read path: question → retrieved passages → streamed answer.
//!
//! [`QueryPipeline::ask`] never fails. Every outcome, including storage
//! errors and a note with nothing indexed, is delivered as events on the
//! returned [`AnswerStream`].

use std::sync::Arc;

use crate::answer::{AnswerStream, StreamEvent, Synthesizer};
use crate::error::RagError;
use crate::models::NoteId;
use crate::retrieve::{Retrieval, Retriever};

/// Shown when a note has no indexed passages yet.
pub const NO_SOURCES_MESSAGE: &str =
    "This note has no analyzed sources yet. Add a document, web page, or transcript and ask again.";

pub struct QueryPipeline {
    retriever: Arc<Retriever>,
    synthesizer: Synthesizer,
    top_k: usize,
}

impl QueryPipeline {
    pub fn new(retriever: Arc<Retriever>, synthesizer: Synthesizer, top_k: usize) -> Self {
        Self {
            retriever,
            synthesizer,
            top_k,
        }
    }

    /// Answer `question` from the note's own sources.
    pub async fn ask(&self, note: &NoteId, question: &str) -> AnswerStream {
        if question.trim().is_empty() {
            return AnswerStream::single(StreamEvent::error(&RagError::EmptyInput));
        }

        let passages = match self.retriever.retrieve(note, question, self.top_k).await {
            Ok(Retrieval::Passages(p)) => p,
            Ok(Retrieval::Unavailable(e)) => return AnswerStream::single(StreamEvent::error(&e)),
            Err(e) => {
                tracing::error!(note = %note, error = %e, "retrieval failed");
                return AnswerStream::single(StreamEvent::error(&e));
            }
        };

        if passages.is_empty() {
            tracing::info!(note = %note, "{}", RagError::RetrievalEmpty(note.to_string()));
            return AnswerStream::single(StreamEvent::token(NO_SOURCES_MESSAGE));
        }

        tracing::debug!(note = %note, passages = passages.len(), "synthesizing answer");
        self.synthesizer.synthesize(question, passages)
    }
}
