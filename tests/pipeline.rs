//! End-to-end tests of the ingestion and query pipelines through the
//! [`Rag`] facade, with fake providers injected through the constructor.

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use notebook_rag::answer::StreamEvent;
use notebook_rag::config::Config;
use notebook_rag::embedding::{Embedder, HashEmbedder};
use notebook_rag::error::{RagError, Result};
use notebook_rag::generation::{Generator, TokenSink};
use notebook_rag::ingest::IngestOutcome;
use notebook_rag::models::NoteId;
use notebook_rag::query::NO_SOURCES_MESSAGE;
use notebook_rag::rag::Rag;
use notebook_rag::retrieve::Retrieval;
use notebook_rag::store::{InMemoryIndex, SqliteIndex, VectorIndex};
use notebook_rag::{db, migrate};

fn test_config(extra: &str) -> Config {
    toml::from_str(&format!(
        "[db]\npath = \"/tmp/unused.sqlite\"\n[chunking]\nchunk_size = 200\noverlap = 40\n\
         [generation]\ntimeout_secs = 2\n{}",
        extra
    ))
    .unwrap()
}

/// Answers by echoing the context lines of the prompt, word by word.
struct EchoContext {
    calls: AtomicUsize,
}

impl EchoContext {
    fn new() -> Self {
        Self {
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl Generator for EchoContext {
    fn model_name(&self) -> &str {
        "echo"
    }

    async fn stream(&self, prompt: &str, sink: &TokenSink) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let context = prompt
            .split("Context:\n")
            .nth(1)
            .and_then(|rest| rest.split("\n\nQuestion:").next())
            .unwrap_or_default();
        for line in context.lines().filter(|l| !l.starts_with("[source:")) {
            for word in line.split_inclusive(' ') {
                sink.send(word).await?;
            }
        }
        Ok(())
    }
}

/// Emits two tokens, then fails.
struct FailsMidStream;

#[async_trait]
impl Generator for FailsMidStream {
    fn model_name(&self) -> &str {
        "flaky"
    }

    async fn stream(&self, _prompt: &str, sink: &TokenSink) -> Result<()> {
        sink.send("Partial ").await?;
        sink.send("answer").await?;
        Err(RagError::GenerationFailed("upstream connection reset".into()))
    }
}

/// Streams tokens until cancelled. `alive` is held for as long as a
/// generation is in flight; `sent` counts delivered tokens.
struct Endless {
    alive: Arc<()>,
    sent: Arc<AtomicUsize>,
}

#[async_trait]
impl Generator for Endless {
    fn model_name(&self) -> &str {
        "endless"
    }

    async fn stream(&self, _prompt: &str, sink: &TokenSink) -> Result<()> {
        let _alive = self.alive.clone();
        loop {
            sink.send("tick ").await?;
            self.sent.fetch_add(1, Ordering::SeqCst);
            tokio::task::yield_now().await;
        }
    }
}

/// Counts calls and fails every embedding request.
struct CountingFailingEmbedder {
    calls: AtomicUsize,
}

#[async_trait]
impl Embedder for CountingFailingEmbedder {
    fn model_name(&self) -> &str {
        "failing"
    }
    fn dims(&self) -> usize {
        8
    }
    async fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(RagError::EmbeddingUnavailable("provider returned 503".into()))
    }
}

fn rag_with(generator: Arc<dyn Generator>) -> (Rag, Arc<InMemoryIndex>) {
    let index = Arc::new(InMemoryIndex::new());
    let rag = Rag::new(
        test_config(""),
        Arc::new(HashEmbedder::new(256)),
        generator,
        index.clone(),
    );
    (rag, index)
}

#[tokio::test]
async fn test_paris_answer_mentions_eiffel_and_cites_doc1() {
    let (rag, _) = rag_with(Arc::new(EchoContext::new()));
    let n1 = NoteId::from("N1");

    let outcome = rag
        .ingest(
            &n1,
            "doc1",
            "Paris is the capital of France. It is known for the Eiffel Tower.",
        )
        .await
        .unwrap();
    assert_eq!(outcome, IngestOutcome::Ingested { passages: 1 });

    let answer = rag
        .ask(&n1, "What is Paris known for?")
        .await
        .collect_answer()
        .await;
    assert!(answer.error.is_none(), "{:?}", answer.error);
    assert!(answer.text.contains("Eiffel Tower"), "{}", answer.text);
    assert!(answer.cited_labels().contains(&"doc1"));
}

#[tokio::test]
async fn test_ask_empty_note_is_single_event_without_synthesis() {
    let generator = Arc::new(EchoContext::new());
    let (rag, _) = rag_with(generator.clone());

    let mut stream = rag.ask(&NoteId::from(99), "Anything?").await;
    assert_eq!(
        stream.next_event().await,
        Some(StreamEvent::token(NO_SOURCES_MESSAGE))
    );
    assert_eq!(stream.next_event().await, None);
    assert_eq!(generator.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_retrieve_round_trip_returns_overlapping_passage() {
    let (rag, _) = rag_with(Arc::new(EchoContext::new()));
    let note = NoteId::from(1);
    let text = "Mitochondria produce ATP through cellular respiration. \
                Ribosomes synthesize proteins from messenger RNA.";
    rag.ingest(&note, "cells", text).await.unwrap();

    match rag.retrieve(&note, "ribosomes synthesize proteins", 1).await.unwrap() {
        Retrieval::Passages(p) => {
            assert_eq!(p.len(), 1);
            assert!(text.contains(p[0].passage.text.trim()));
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[tokio::test]
async fn test_concurrent_ingest_into_different_notes_never_leaks() {
    let (rag, _) = rag_with(Arc::new(EchoContext::new()));
    let rag = Arc::new(rag);
    let a = NoteId::from("A");
    let b = NoteId::from("B");

    let tasks: Vec<_> = (0..8)
        .map(|i| {
            let rag = rag.clone();
            let b = b.clone();
            tokio::spawn(async move {
                rag.ingest(&b, &format!("b{}", i), "Only note B knows about volcanoes.")
                    .await
                    .unwrap()
            })
        })
        .collect();
    for t in tasks {
        t.await.unwrap();
    }

    match rag.retrieve(&a, "volcanoes", 5).await.unwrap() {
        Retrieval::Passages(p) => assert!(p.is_empty()),
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(rag.passage_count(&b).await.unwrap(), 8);
    assert_eq!(rag.sources(&b).await.unwrap().len(), 8);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_ingest_into_one_sqlite_note_keeps_every_passage() {
    let tmp = tempfile::TempDir::new().unwrap();
    let mut config = test_config("");
    config.db.path = tmp.path().join("nb.sqlite");
    let pool = db::connect(&config).await.unwrap();
    migrate::migrate_pool(&pool).await.unwrap();
    let rag = Arc::new(Rag::new(
        config,
        Arc::new(HashEmbedder::new(64)),
        Arc::new(EchoContext::new()),
        Arc::new(SqliteIndex::new(pool)),
    ));
    let note = NoteId::from("shared");
    let text = "Magma rises through the crust before a volcano erupts. ".repeat(12);

    let tasks: Vec<_> = (0..16)
        .map(|i| {
            let rag = rag.clone();
            let note = note.clone();
            let text = text.clone();
            tokio::spawn(async move { rag.ingest(&note, &format!("src{}", i), &text).await })
        })
        .collect();

    let mut written = 0;
    for t in tasks {
        match t.await.unwrap().unwrap() {
            IngestOutcome::Ingested { passages } => written += passages,
            other => panic!("unexpected {:?}", other),
        }
    }

    assert!(written >= 16 * 2, "expected several passages per source");
    assert_eq!(rag.passage_count(&note).await.unwrap(), written as i64);
    let sources = rag.sources(&note).await.unwrap();
    assert_eq!(sources.len(), 16);
    assert_eq!(
        sources.iter().map(|s| s.passage_count).sum::<i64>(),
        written as i64
    );

    match rag.retrieve(&note, "volcano erupts", written).await.unwrap() {
        Retrieval::Passages(p) => {
            let mut seqs: Vec<i64> = p.iter().map(|sp| sp.passage.seq).collect();
            seqs.sort_unstable();
            seqs.dedup();
            assert_eq!(seqs.len(), written);
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[tokio::test]
async fn test_failure_mid_stream_yields_one_terminal_error() {
    let (rag, _) = rag_with(Arc::new(FailsMidStream));
    let note = NoteId::from(1);
    rag.ingest(&note, "doc", "Some grounding text.").await.unwrap();

    let mut stream = rag.ask(&note, "grounding?").await;
    let mut events = Vec::new();
    while let Some(event) = stream.next_event().await {
        events.push(event);
    }

    assert_eq!(events.len(), 3, "{:?}", events);
    assert_eq!(events[0], StreamEvent::token("Partial "));
    assert_eq!(events[1], StreamEvent::token("answer"));
    match &events[2] {
        StreamEvent::Error { code, message } => {
            assert_eq!(code, "generation_failed");
            assert!(message.contains("connection reset"));
        }
        other => panic!("expected error, got {:?}", other),
    }
}

/// Sends one token, then panics.
struct PanicsMidStream;

#[async_trait]
impl Generator for PanicsMidStream {
    fn model_name(&self) -> &str {
        "panicky"
    }

    async fn stream(&self, _prompt: &str, sink: &TokenSink) -> Result<()> {
        sink.send("partial").await?;
        panic!("provider client bug");
    }
}

#[tokio::test]
async fn test_generator_panic_yields_terminal_error() {
    let (rag, _) = rag_with(Arc::new(PanicsMidStream));
    let note = NoteId::from(1);
    rag.ingest(&note, "doc", "Some grounding text.").await.unwrap();

    let mut stream = rag.ask(&note, "grounding?").await;
    let mut events = Vec::new();
    while let Some(event) = stream.next_event().await {
        events.push(event);
    }

    assert_eq!(events.first(), Some(&StreamEvent::token("partial")));
    match events.last() {
        Some(StreamEvent::Error { code, .. }) => assert_eq!(code, "generation_failed"),
        other => panic!("expected terminal error, got {:?}", other),
    }
    assert_eq!(events.len(), 2);
}

#[tokio::test]
async fn test_dropping_stream_cancels_generation() {
    let alive = Arc::new(());
    let sent = Arc::new(AtomicUsize::new(0));
    let (rag, _) = rag_with(Arc::new(Endless {
        alive: alive.clone(),
        sent: sent.clone(),
    }));
    let note = NoteId::from(1);
    rag.ingest(&note, "doc", "Endless tokens.").await.unwrap();

    let mut stream = rag.ask(&note, "tokens?").await;
    for _ in 0..3 {
        assert_eq!(stream.next_event().await, Some(StreamEvent::token("tick ")));
    }
    assert_eq!(Arc::strong_count(&alive), 2);
    drop(stream);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(Arc::strong_count(&alive), 1, "generation still running");
    let after_drop = sent.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(sent.load(Ordering::SeqCst), after_drop);
}

#[tokio::test]
async fn test_slow_generation_times_out() {
    let index = Arc::new(InMemoryIndex::new());
    let rag = Rag::new(
        test_config(""),
        Arc::new(HashEmbedder::new(64)),
        Arc::new(Slow),
        index,
    );
    let note = NoteId::from(1);
    rag.ingest(&note, "doc", "Slow answers.").await.unwrap();

    let answer = rag.ask(&note, "answers?").await.collect_answer().await;
    let (code, message) = answer.error.expect("timeout error");
    assert_eq!(code, "timeout");
    assert!(message.contains("generation timed out"), "{}", message);
    assert!(answer.sources.is_empty());
}

struct Slow;

#[async_trait]
impl Generator for Slow {
    fn model_name(&self) -> &str {
        "slow"
    }

    async fn stream(&self, _prompt: &str, sink: &TokenSink) -> Result<()> {
        sink.send("thinking").await?;
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok(())
    }
}

/// A healthy provider that produces a long answer immediately.
struct Chatty;

#[async_trait]
impl Generator for Chatty {
    fn model_name(&self) -> &str {
        "chatty"
    }

    async fn stream(&self, _prompt: &str, sink: &TokenSink) -> Result<()> {
        for i in 0..100 {
            sink.send(format!("w{} ", i)).await?;
        }
        Ok(())
    }
}

#[tokio::test]
async fn test_slow_reader_does_not_trip_generation_timeout() {
    let mut config = test_config("");
    config.generation.timeout_secs = 1;
    let rag = Rag::new(
        config,
        Arc::new(HashEmbedder::new(64)),
        Arc::new(Chatty),
        Arc::new(InMemoryIndex::new()),
    );
    let note = NoteId::from(1);
    rag.ingest(&note, "doc", "Long answers need patient readers.").await.unwrap();

    let mut stream = rag.ask(&note, "answers?").await;
    let mut events = Vec::new();
    while let Some(event) = stream.next_event().await {
        tokio::time::sleep(Duration::from_millis(20)).await;
        events.push(event);
    }

    assert_eq!(events.len(), 101);
    match events.last() {
        Some(StreamEvent::Source { sources }) => assert_eq!(sources[0].label, "doc"),
        other => panic!("expected sources last, got {:?}", other),
    }
}

#[tokio::test]
async fn test_failing_embedder_degrades_ingest_and_ask() {
    let embedder = Arc::new(CountingFailingEmbedder {
        calls: AtomicUsize::new(0),
    });
    let index = Arc::new(InMemoryIndex::new());
    let rag = Rag::new(
        test_config(""),
        embedder.clone(),
        Arc::new(EchoContext::new()),
        index.clone(),
    );
    let note = NoteId::from(1);

    let long_text = "A sentence that fills passages. ".repeat(40);
    let outcome = rag.ingest(&note, "doc", &long_text).await.unwrap();
    assert!(matches!(outcome, IngestOutcome::Degraded { .. }));
    assert_eq!(index.count(&note).await.unwrap(), 0);
    assert!(index.sources(&note).await.unwrap().is_empty());

    let answer = rag.ask(&note, "anything?").await.collect_answer().await;
    assert_eq!(answer.error.unwrap().0, "embedding_unavailable");
    assert!(answer.text.is_empty());
    assert!(embedder.calls.load(Ordering::SeqCst) >= 2);
}

#[tokio::test]
async fn test_blank_question_is_empty_input() {
    let (rag, _) = rag_with(Arc::new(EchoContext::new()));
    let answer = rag.ask(&NoteId::from(1), "   ").await.collect_answer().await;
    assert_eq!(answer.error.unwrap().0, "empty_input");
}

#[tokio::test]
async fn test_ingest_document_extracts_text() {
    let (rag, index) = rag_with(Arc::new(EchoContext::new()));
    let note = NoteId::from(1);

    let outcome = rag
        .ingest_document(&note, "notes.md", b"# Heading\n\nMarkdown body.".to_vec(), "md")
        .await
        .unwrap();
    assert_eq!(outcome.passages(), 1);
    assert_eq!(index.sources(&note).await.unwrap()[0].label, "notes.md");

    let err = rag
        .ingest_document(&note, "slides.pptx", b"PK".to_vec(), "pptx")
        .await
        .unwrap_err();
    assert_eq!(err.code(), "extraction_failed");
}

#[tokio::test]
async fn test_sqlite_index_survives_new_facade() {
    let tmp = tempfile::TempDir::new().unwrap();
    let mut config = test_config("");
    config.db.path = tmp.path().join("nb.sqlite");

    let pool = db::connect(&config).await.unwrap();
    migrate::migrate_pool(&pool).await.unwrap();
    let first = Rag::new(
        config.clone(),
        Arc::new(HashEmbedder::new(128)),
        Arc::new(EchoContext::new()),
        Arc::new(SqliteIndex::new(pool.clone())),
    );
    first
        .ingest(&NoteId::from(3), "doc1", "Paris is known for the Eiffel Tower.")
        .await
        .unwrap();
    pool.close().await;

    let second = Rag::from_config(&config).await.unwrap();
    assert_eq!(second.passage_count(&NoteId::from(3)).await.unwrap(), 1);
    assert!(second.delete_note(&NoteId::from(3)).await.unwrap());
    assert_eq!(second.passage_count(&NoteId::from(3)).await.unwrap(), 0);
}
