//! The assembled question-answering core.
//!
//! [`Rag`] owns one instance of each collaborator (embedder, generator, and
//! index) and builds request-scoped pipelines on top of them. Construct it
//! with [`Rag::from_config`] for the configured providers, or inject fakes
//! through [`Rag::new`].
//!
//! ```rust,no_run
//! use notebook_rag::config::load_config;
//! use notebook_rag::models::NoteId;
//! use notebook_rag::rag::Rag;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let config = load_config(std::path::Path::new("config/nbrag.toml"))?;
//! let rag = Rag::from_config(&config).await?;
//! let note = NoteId::from(1);
//! rag.ingest(&note, "doc1", "Paris is the capital of France.").await?;
//! let answer = rag.ask(&note, "What is the capital of France?").await;
//! println!("{}", answer.collect_answer().await.text);
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use std::time::Duration;

use crate::answer::{AnswerStream, Synthesizer};
use crate::config::Config;
use crate::db;
use crate::embedding::{create_embedder, DisabledEmbedder, Embedder};
use crate::error::{RagError, Result};
use crate::extract::extract_text;
use crate::generation::{create_generator, DisabledGenerator, Generator};
use crate::ingest::{IngestOutcome, IngestPipeline};
use crate::materials::{MaterialsGenerator, StudyMaterial};
use crate::migrate::migrate_pool;
use crate::models::{NoteId, SourceRecord};
use crate::query::QueryPipeline;
use crate::retrieve::{Retrieval, Retriever};
use crate::store::{SqliteIndex, VectorIndex};

pub struct Rag {
    config: Config,
    embedder: Arc<dyn Embedder>,
    generator: Arc<dyn Generator>,
    index: Arc<dyn VectorIndex>,
}

impl Rag {
    pub fn new(
        config: Config,
        embedder: Arc<dyn Embedder>,
        generator: Arc<dyn Generator>,
        index: Arc<dyn VectorIndex>,
    ) -> Self {
        Self {
            config,
            embedder,
            generator,
            index,
        }
    }

    /// Open the SQLite index and build the configured providers.
    ///
    /// A provider that cannot be built for lack of configuration or
    /// credentials is replaced by its disabled counterpart, so the note
    /// keeps working in degraded mode.
    pub async fn from_config(config: &Config) -> anyhow::Result<Self> {
        let pool = db::connect(config).await?;
        migrate_pool(&pool).await?;
        let index: Arc<dyn VectorIndex> = Arc::new(SqliteIndex::new(pool));

        let embedder: Arc<dyn Embedder> = if config.embedding.is_enabled() {
            create_embedder(&config.embedding).or_else(|e| match e {
                RagError::ConfigurationMissing(reason) => {
                    tracing::warn!(%reason, "embeddings disabled");
                    Ok(Arc::new(DisabledEmbedder::new(reason)) as Arc<dyn Embedder>)
                }
                other => Err(other),
            })?
        } else {
            tracing::info!("no embedding provider configured; ingestion runs degraded");
            Arc::new(DisabledEmbedder::default())
        };
        let generator: Arc<dyn Generator> = if config.generation.is_enabled() {
            create_generator(&config.generation).or_else(|e| match e {
                RagError::ConfigurationMissing(reason) => {
                    tracing::warn!(%reason, "answer generation disabled");
                    Ok(Arc::new(DisabledGenerator::new(reason)) as Arc<dyn Generator>)
                }
                other => Err(other),
            })?
        } else {
            tracing::info!("no generation provider configured; answers are unavailable");
            Arc::new(DisabledGenerator::default())
        };

        Ok(Self::new(config.clone(), embedder, generator, index))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn embedder(&self) -> &Arc<dyn Embedder> {
        &self.embedder
    }

    pub fn generator(&self) -> &Arc<dyn Generator> {
        &self.generator
    }

    fn retriever(&self) -> Retriever {
        Retriever::new(
            self.embedder.clone(),
            self.index.clone(),
            Duration::from_secs(self.config.embedding.timeout_secs),
        )
    }

    /// Chunk, embed, and index one source's text.
    pub async fn ingest(&self, note: &NoteId, label: &str, text: &str) -> Result<IngestOutcome> {
        IngestPipeline::new(&self.config, self.embedder.clone(), self.index.clone())
            .ingest(note, label, text)
            .await
    }

    /// Extract text from an uploaded document, then [`ingest`](Rag::ingest) it.
    pub async fn ingest_document(
        &self,
        note: &NoteId,
        label: &str,
        bytes: Vec<u8>,
        format: &str,
    ) -> Result<IngestOutcome> {
        let format = format.to_string();
        let text = tokio::task::spawn_blocking(move || extract_text(&bytes, &format))
            .await
            .map_err(|e| RagError::ExtractionFailed(format!("extraction task failed: {}", e)))??;
        self.ingest(note, label, &text).await
    }

    pub async fn retrieve(&self, note: &NoteId, question: &str, k: usize) -> Result<Retrieval> {
        self.retriever().retrieve(note, question, k).await
    }

    /// Stream an answer grounded in the note's sources.
    pub async fn ask(&self, note: &NoteId, question: &str) -> AnswerStream {
        let synthesizer = Synthesizer::new(
            self.generator.clone(),
            Duration::from_secs(self.config.generation.timeout_secs),
        );
        QueryPipeline::new(
            Arc::new(self.retriever()),
            synthesizer,
            self.config.retrieval.top_k,
        )
        .ask(note, question)
        .await
    }

    /// Generate summary, key topics, quiz, and flashcards for one source's text.
    pub async fn generate_materials(&self, note: &NoteId, text: &str) -> Result<StudyMaterial> {
        let materials = MaterialsGenerator::new(
            self.generator.clone(),
            Duration::from_secs(self.config.generation.timeout_secs),
        );
        materials.generate(text).await.inspect_err(|e| {
            if e.is_degraded() {
                tracing::warn!(note = %note, error = %e, "study material unavailable");
            } else {
                tracing::error!(note = %note, error = %e, "study material generation failed");
            }
        })
    }

    pub async fn sources(&self, note: &NoteId) -> Result<Vec<SourceRecord>> {
        self.index.sources(note).await
    }

    pub async fn passage_count(&self, note: &NoteId) -> Result<i64> {
        self.index.count(note).await
    }

    /// Drop the note's whole index. Returns `false` if nothing was stored.
    pub async fn delete_note(&self, note: &NoteId) -> Result<bool> {
        let removed = self.index.drop_note(note).await?;
        tracing::info!(note = %note, removed, "dropped note index");
        Ok(removed)
    }
}
