//! Grounded answer synthesis and the answer event stream.
//!
//! [`Synthesizer::synthesize`] builds a prompt from retrieved passages,
//! starts the [`Generator`] on a tokio task and hands back an
//! [`AnswerStream`] immediately. The stream yields zero or more
//! [`StreamEvent::Token`]s followed by exactly one terminal event:
//! [`StreamEvent::Source`] on success or [`StreamEvent::Error`] on failure.
//!
//! # Wire format
//!
//! Events serialize as one JSON object per line, tagged by `kind`:
//!
//! ```text
//! {"kind":"token","text":"Paris is known "}
//! {"kind":"token","text":"for the Eiffel Tower [doc1]."}
//! {"kind":"source","sources":[{"label":"doc1","chunk_index":0,"seq":1,"score":0.82,"content":"..."}]}
//! ```
//!
//! # Cancellation
//!
//! The stream is single-pass. Dropping an [`AnswerStream`] aborts its
//! producer task, which drops the in-flight provider response.

use futures::{FutureExt, Stream};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::{Phase, RagError, Result};
use crate::generation::{Generator, TokenSink};
use crate::models::ScoredPassage;

/// Events buffered between the generator task and a slow consumer.
pub(crate) const STREAM_BUFFER: usize = 32;

/// One event of a streamed answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StreamEvent {
    /// A fragment of answer text.
    Token { text: String },
    /// The passages that grounded the answer. Always the last event of a
    /// successful answer.
    Source { sources: Vec<Citation> },
    /// Terminal failure. Nothing follows it.
    Error { code: String, message: String },
}

impl StreamEvent {
    pub fn token(text: impl Into<String>) -> Self {
        StreamEvent::Token { text: text.into() }
    }

    pub fn error(err: &RagError) -> Self {
        StreamEvent::Error {
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }

    /// Serialize as a single `\n`-terminated JSON line.
    pub fn to_ndjson_line(&self) -> serde_json::Result<String> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }
}

/// A grounding passage as shown to the user under "sources used".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Citation {
    pub label: String,
    pub chunk_index: i64,
    pub seq: i64,
    pub score: f32,
    pub content: String,
}

impl From<&ScoredPassage> for Citation {
    fn from(p: &ScoredPassage) -> Self {
        Self {
            label: p.passage.source_label.clone(),
            chunk_index: p.passage.chunk_index,
            seq: p.passage.seq,
            score: p.score,
            content: p.passage.text.clone(),
        }
    }
}

/// Join passages into the grounding context, each under its citation label.
pub fn build_context(passages: &[ScoredPassage]) -> String {
    passages
        .iter()
        .map(|p| format!("[source: {}]\n{}", p.passage.source_label, p.passage.text.trim()))
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Fill the fixed answering template.
pub fn build_prompt(question: &str, passages: &[ScoredPassage]) -> String {
    format!(
        "You are a study assistant answering questions about the user's own notes.\n\
         Rules:\n\
         1. Answer ONLY from the context below. If the context does not contain \
         the answer, say that you cannot answer from the provided sources.\n\
         2. Cite the sources you used by their label in square brackets, e.g. [doc1].\n\
         3. Answer in the same language as the question.\n\
         \n\
         Context:\n\
         {}\n\
         \n\
         Question: {}\n\
         Answer:",
        build_context(passages),
        question.trim()
    )
}

/// Streams grounded answers from a [`Generator`].
pub struct Synthesizer {
    generator: Arc<dyn Generator>,
    timeout: Duration,
}

impl Synthesizer {
    pub fn new(generator: Arc<dyn Generator>, timeout: Duration) -> Self {
        Self { generator, timeout }
    }

    /// Start answering `question` from `passages`.
    ///
    /// Must be called from within a tokio runtime. Callers guarantee that
    /// `passages` is non-empty.
    pub fn synthesize(&self, question: &str, passages: Vec<ScoredPassage>) -> AnswerStream {
        let prompt = build_prompt(question, &passages);
        let citations: Vec<Citation> = passages.iter().map(Citation::from).collect();
        let generator = self.generator.clone();
        let timeout = self.timeout;
        let (sink, rx) = TokenSink::channel(STREAM_BUFFER);

        let task = tokio::spawn(async move {
            let outcome = run_generation(generator.as_ref(), &prompt, &sink, timeout).await;

            let terminal = match outcome {
                Ok(()) => StreamEvent::Source { sources: citations },
                Err(RagError::Cancelled) => {
                    tracing::debug!(model = generator.model_name(), "answer stream cancelled");
                    return;
                }
                Err(e) => {
                    tracing::warn!(model = generator.model_name(), error = %e, "generation failed");
                    StreamEvent::error(&e)
                }
            };
            // The consumer may already be gone; nothing left to clean up.
            let _ = sink.emit(terminal).await;
        });

        AnswerStream::new(rx, Some(task))
    }
}

/// Run `generator` on `prompt` until it finishes, fails, or uses up `limit`.
///
/// Only provider time counts against `limit`: while the sink is blocked on a
/// full channel the deadline is paused. A panicking generator is reported as
/// [`RagError::GenerationFailed`].
pub(crate) async fn run_generation(
    generator: &dyn Generator,
    prompt: &str,
    sink: &TokenSink,
    limit: Duration,
) -> Result<()> {
    let started = Instant::now();
    let generation = AssertUnwindSafe(generator.stream(prompt, sink)).catch_unwind();
    tokio::pin!(generation);

    loop {
        let busy = started.elapsed().saturating_sub(sink.blocked());
        let remaining = limit.saturating_sub(busy);
        if remaining.is_zero() {
            return Err(RagError::Timeout {
                phase: Phase::Generation,
                secs: limit.as_secs(),
            });
        }

        tokio::select! {
            outcome = &mut generation => {
                return outcome.unwrap_or_else(|panic| {
                    Err(RagError::GenerationFailed(format!(
                        "generator panicked: {}",
                        panic_message(panic.as_ref())
                    )))
                });
            }
            // Wake up to recheck; blocked time may have moved the deadline.
            _ = tokio::time::sleep(remaining) => {}
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}

/// Pull-based answer stream.
///
/// Implements [`futures::Stream`]; [`AnswerStream::next_event`] is the
/// inherent equivalent of `StreamExt::next`.
pub struct AnswerStream {
    rx: mpsc::Receiver<StreamEvent>,
    task: Option<JoinHandle<()>>,
}

impl AnswerStream {
    pub(crate) fn new(rx: mpsc::Receiver<StreamEvent>, task: Option<JoinHandle<()>>) -> Self {
        Self { rx, task }
    }

    /// A stream that yields `event` and ends.
    pub fn single(event: StreamEvent) -> Self {
        let (tx, rx) = mpsc::channel(1);
        // Capacity 1 on a fresh channel: cannot be full.
        let _ = tx.try_send(event);
        Self::new(rx, None)
    }

    pub async fn next_event(&mut self) -> Option<StreamEvent> {
        self.rx.recv().await
    }

    /// Drain the stream into a complete [`Answer`].
    pub async fn collect_answer(mut self) -> Answer {
        let mut answer = Answer::default();
        while let Some(event) = self.next_event().await {
            match event {
                StreamEvent::Token { text } => answer.text.push_str(&text),
                StreamEvent::Source { sources } => answer.sources = sources,
                StreamEvent::Error { code, message } => answer.error = Some((code, message)),
            }
        }
        answer
    }
}

impl Stream for AnswerStream {
    type Item = StreamEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<StreamEvent>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for AnswerStream {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// A fully drained answer.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Answer {
    pub text: String,
    pub sources: Vec<Citation>,
    /// `(code, message)` of the terminal error event, if any.
    pub error: Option<(String, String)>,
}

impl Answer {
    pub fn cited_labels(&self) -> Vec<&str> {
        let mut labels: Vec<&str> = Vec::new();
        for c in &self.sources {
            if !labels.contains(&c.label.as_str()) {
                labels.push(&c.label);
            }
        }
        labels
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use crate::models::{NoteId, Passage};
    use async_trait::async_trait;
    use futures::StreamExt;

    fn passage(label: &str, seq: i64, text: &str) -> ScoredPassage {
        ScoredPassage {
            passage: Passage {
                id: format!("p{}", seq),
                note_id: NoteId::from(1),
                source_label: label.to_string(),
                chunk_index: 0,
                seq,
                text: text.to_string(),
                hash: String::new(),
            },
            score: 0.5,
        }
    }

    struct Scripted(Vec<&'static str>);

    #[async_trait]
    impl Generator for Scripted {
        fn model_name(&self) -> &str {
            "scripted"
        }
        async fn stream(&self, _prompt: &str, sink: &TokenSink) -> Result<()> {
            for t in &self.0 {
                sink.send(*t).await?;
            }
            Ok(())
        }
    }

    struct Hanging;

    #[async_trait]
    impl Generator for Hanging {
        fn model_name(&self) -> &str {
            "hanging"
        }
        async fn stream(&self, _prompt: &str, sink: &TokenSink) -> Result<()> {
            sink.send("partial").await?;
            std::future::pending::<()>().await;
            Ok(())
        }
    }

    struct Panicking;

    #[async_trait]
    impl Generator for Panicking {
        fn model_name(&self) -> &str {
            "panicking"
        }
        async fn stream(&self, _prompt: &str, sink: &TokenSink) -> Result<()> {
            sink.send("partial").await?;
            panic!("tokenizer state corrupted");
        }
    }

    #[test]
    fn test_event_wire_format() {
        let line = StreamEvent::token("hi").to_ndjson_line().unwrap();
        assert_eq!(line, "{\"kind\":\"token\",\"text\":\"hi\"}\n");

        let err = StreamEvent::error(&RagError::GenerationFailed("boom".into()));
        let json: serde_json::Value =
            serde_json::from_str(err.to_ndjson_line().unwrap().trim_end()).unwrap();
        assert_eq!(json["kind"], "error");
        assert_eq!(json["code"], "generation_failed");
    }

    #[test]
    fn test_context_labels_every_passage() {
        let ctx = build_context(&[passage("doc1", 1, "Paris."), passage("doc2", 2, "Rome.")]);
        assert_eq!(ctx, "[source: doc1]\nParis.\n\n[source: doc2]\nRome.");
    }

    #[test]
    fn test_prompt_contains_rules_context_and_question() {
        let prompt = build_prompt("Where?", &[passage("doc1", 1, "Paris.")]);
        assert!(prompt.contains("ONLY from the context"));
        assert!(prompt.contains("cannot answer"));
        assert!(prompt.contains("[source: doc1]"));
        assert!(prompt.ends_with("Question: Where?\nAnswer:"));
    }

    #[tokio::test]
    async fn test_tokens_then_sources() {
        let synth = Synthesizer::new(
            Arc::new(Scripted(vec!["Eiffel ", "Tower"])),
            Duration::from_secs(5),
        );
        let events: Vec<StreamEvent> = synth
            .synthesize("q", vec![passage("doc1", 1, "Paris")])
            .collect()
            .await;
        assert_eq!(events.len(), 3);
        assert_eq!(events[0], StreamEvent::token("Eiffel "));
        match &events[2] {
            StreamEvent::Source { sources } => assert_eq!(sources[0].label, "doc1"),
            other => panic!("expected sources, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_timeout_ends_with_single_error() {
        let synth = Synthesizer::new(Arc::new(Hanging), Duration::from_millis(50));
        let answer = synth
            .synthesize("q", vec![passage("doc1", 1, "x")])
            .collect_answer()
            .await;
        assert_eq!(answer.text, "partial");
        assert!(answer.sources.is_empty());
        assert_eq!(answer.error.unwrap().0, "timeout");
    }

    #[tokio::test]
    async fn test_generator_panic_ends_with_error_event() {
        let synth = Synthesizer::new(Arc::new(Panicking), Duration::from_secs(5));
        let events: Vec<StreamEvent> = synth
            .synthesize("q", vec![passage("doc1", 1, "x")])
            .collect()
            .await;
        assert_eq!(events.len(), 2, "{:?}", events);
        assert_eq!(events[0], StreamEvent::token("partial"));
        match &events[1] {
            StreamEvent::Error { code, message } => {
                assert_eq!(code, "generation_failed");
                assert!(message.contains("tokenizer state corrupted"), "{}", message);
            }
            other => panic!("expected error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_single_yields_once() {
        let mut stream = AnswerStream::single(StreamEvent::token("only"));
        assert_eq!(stream.next_event().await, Some(StreamEvent::token("only")));
        assert_eq!(stream.next_event().await, None);
    }
}
