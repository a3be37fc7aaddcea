//! Error taxonomy for the retrieval-augmented answering core.
//!
//! Nothing here is fatal to the process: every variant degrades a single
//! ingestion call or a single question. [`RagError::code`] gives the stable
//! machine-readable code used in stream `error` events and HTTP bodies.

use thiserror::Error;

/// Pipeline phase a timeout occurred in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Embedding,
    Generation,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Phase::Embedding => write!(f, "embedding"),
            Phase::Generation => write!(f, "generation"),
        }
    }
}

/// Errors produced by ingestion, retrieval, and answer generation.
#[derive(Debug, Error)]
pub enum RagError {
    /// No credentials or provider configured for embeddings or generation.
    #[error("configuration missing: {0}")]
    ConfigurationMissing(String),

    /// Nothing to chunk or ingest.
    #[error("input is empty")]
    EmptyInput,

    /// The text extraction collaborator could not produce plain text.
    #[error("text extraction failed: {0}")]
    ExtractionFailed(String),

    /// The note has no indexed passages yet.
    #[error("no analyzed sources for note {0}")]
    RetrievalEmpty(String),

    /// The embedding provider could not produce vectors.
    #[error("embedding unavailable: {0}")]
    EmbeddingUnavailable(String),

    /// The generation provider call failed.
    #[error("generation failed: {0}")]
    GenerationFailed(String),

    /// A bounded wait was exceeded.
    #[error("{phase} timed out after {secs}s")]
    Timeout { phase: Phase, secs: u64 },

    /// The consumer stopped reading the answer stream.
    #[error("stream cancelled by consumer")]
    Cancelled,

    /// The index storage layer failed.
    #[error("storage error: {0}")]
    Storage(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl RagError {
    /// Stable snake_case code for wire events and HTTP error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            RagError::ConfigurationMissing(_) => "configuration_missing",
            RagError::EmptyInput => "empty_input",
            RagError::ExtractionFailed(_) => "extraction_failed",
            RagError::RetrievalEmpty(_) => "retrieval_empty",
            RagError::EmbeddingUnavailable(_) => "embedding_unavailable",
            RagError::GenerationFailed(_) => "generation_failed",
            RagError::Timeout { .. } => "timeout",
            RagError::Cancelled => "cancelled",
            RagError::Storage(_) => "storage",
        }
    }

    /// Whether this error means "RAG disabled for this request" rather than
    /// a broken request.
    pub fn is_degraded(&self) -> bool {
        matches!(
            self,
            RagError::ConfigurationMissing(_)
                | RagError::EmbeddingUnavailable(_)
                | RagError::Timeout { .. }
        )
    }

    /// Reclassify a failure as an embedding-phase failure.
    ///
    /// Missing configuration and timeouts keep their own variant; anything
    /// else becomes [`RagError::EmbeddingUnavailable`].
    pub(crate) fn into_embedding(self) -> Self {
        match self {
            e @ (RagError::ConfigurationMissing(_)
            | RagError::EmbeddingUnavailable(_)
            | RagError::Timeout { .. }) => e,
            other => RagError::EmbeddingUnavailable(other.to_string()),
        }
    }
}

impl From<sqlx::Error> for RagError {
    fn from(e: sqlx::Error) -> Self {
        RagError::Storage(Box::new(e))
    }
}

pub type Result<T> = std::result::Result<T, RagError>;
