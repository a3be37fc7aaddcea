//! Streaming text generation providers.
//!
//! A [`Generator`] turns a fully built prompt into answer tokens, pushing each
//! one into a [`TokenSink`] as soon as the upstream provider produces it. The
//! sink is backed by the bounded channel of an
//! [`AnswerStream`](crate::answer::AnswerStream); once the consumer drops the
//! stream, [`TokenSink::send`] fails with [`RagError::Cancelled`] and the
//! provider stops reading its response, which closes the HTTP connection.
//!
//! | Config value | Provider |
//! |--------------|----------|
//! | `"disabled"` | [`DisabledGenerator`] |
//! | `"openai"`   | [`OpenAIGenerator`] (`POST /v1/chat/completions`, SSE) |
//! | `"ollama"`   | [`OllamaGenerator`] (`POST /api/generate`, NDJSON) |

use async_trait::async_trait;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{self, error::TrySendError};

use crate::answer::StreamEvent;
use crate::config::GenerationConfig;
use crate::embedding::send_with_retry;
use crate::error::{RagError, Result};

/// Produces answer tokens for a prompt.
#[async_trait]
pub trait Generator: Send + Sync {
    /// Returns the model identifier (e.g. `"gpt-4o-mini"`).
    fn model_name(&self) -> &str;

    /// Generate a completion for `prompt`, sending tokens to `sink` in order.
    ///
    /// Returns once the provider signals the end of the completion. A
    /// [`RagError::Cancelled`] from the sink must be propagated unchanged.
    async fn stream(&self, prompt: &str, sink: &TokenSink) -> Result<()>;
}

/// Write half of an answer stream, handed to a [`Generator`].
///
/// The sink keeps a clock of how long it has been blocked on a full
/// channel, so a generation deadline can exclude time spent waiting on a
/// slow reader.
#[derive(Clone)]
pub struct TokenSink {
    tx: mpsc::Sender<StreamEvent>,
    clock: Arc<Mutex<WaitClock>>,
}

#[derive(Default)]
struct WaitClock {
    total: Duration,
    since: Option<Instant>,
    waiters: usize,
}

impl WaitClock {
    fn elapsed(&self) -> Duration {
        self.total + self.since.map(|s| s.elapsed()).unwrap_or_default()
    }
}

/// Stops the wait clock when a blocked send finishes or is dropped.
struct Waiting<'a> {
    sink: &'a TokenSink,
}

impl Drop for Waiting<'_> {
    fn drop(&mut self) {
        let mut clock = self.sink.clock();
        clock.waiters = clock.waiters.saturating_sub(1);
        if clock.waiters == 0 {
            if let Some(since) = clock.since.take() {
                clock.total += since.elapsed();
            }
        }
    }
}

impl TokenSink {
    pub(crate) fn new(tx: mpsc::Sender<StreamEvent>) -> Self {
        Self {
            tx,
            clock: Arc::default(),
        }
    }

    /// A sink paired with the receiver it feeds.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<StreamEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self::new(tx), rx)
    }

    /// Forward one token. Empty tokens are skipped.
    ///
    /// Waits while the channel is full, so a slow consumer throttles the
    /// provider instead of buffering the whole answer.
    pub async fn send(&self, text: impl Into<String>) -> Result<()> {
        let text = text.into();
        if text.is_empty() {
            return Ok(());
        }
        self.emit(StreamEvent::Token { text }).await
    }

    /// Whether the consumer has gone away.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Total time sends have spent waiting for the consumer to make room.
    pub fn blocked(&self) -> Duration {
        self.clock().elapsed()
    }

    pub(crate) async fn emit(&self, event: StreamEvent) -> Result<()> {
        let event = match self.tx.try_send(event) {
            Ok(()) => return Ok(()),
            Err(TrySendError::Closed(_)) => return Err(RagError::Cancelled),
            Err(TrySendError::Full(event)) => event,
        };

        let _waiting = self.start_waiting();
        self.tx.send(event).await.map_err(|_| RagError::Cancelled)
    }

    fn start_waiting(&self) -> Waiting<'_> {
        let mut clock = self.clock();
        if clock.waiters == 0 {
            clock.since = Some(Instant::now());
        }
        clock.waiters += 1;
        Waiting { sink: self }
    }

    fn clock(&self) -> MutexGuard<'_, WaitClock> {
        self.clock.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// ============ Disabled Generator ============

/// A generator that always fails with [`RagError::ConfigurationMissing`].
pub struct DisabledGenerator {
    reason: String,
}

impl DisabledGenerator {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

impl Default for DisabledGenerator {
    fn default() -> Self {
        Self::new("generation provider is disabled")
    }
}

#[async_trait]
impl Generator for DisabledGenerator {
    fn model_name(&self) -> &str {
        "disabled"
    }

    async fn stream(&self, _prompt: &str, _sink: &TokenSink) -> Result<()> {
        Err(RagError::ConfigurationMissing(self.reason.clone()))
    }
}

// ============ OpenAI Generator ============

/// Chat completions with `stream: true`. Requires `OPENAI_API_KEY`.
pub struct OpenAIGenerator {
    model: String,
    base_url: String,
    api_key: String,
    temperature: f32,
    max_retries: u32,
    client: reqwest::Client,
}

impl OpenAIGenerator {
    pub fn new(config: &GenerationConfig) -> Result<Self> {
        let model = config.model.clone().ok_or_else(|| {
            RagError::ConfigurationMissing("generation.model required for OpenAI provider".into())
        })?;
        let api_key = std::env::var("OPENAI_API_KEY").map_err(|_| {
            RagError::ConfigurationMissing("OPENAI_API_KEY environment variable not set".into())
        })?;
        let base_url = config
            .url
            .clone()
            .unwrap_or_else(|| "https://api.openai.com/v1".to_string());

        Ok(Self {
            model,
            base_url,
            api_key,
            temperature: config.temperature,
            max_retries: config.max_retries,
            client: build_streaming_client()?,
        })
    }
}

#[async_trait]
impl Generator for OpenAIGenerator {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn stream(&self, prompt: &str, sink: &TokenSink) -> Result<()> {
        let body = serde_json::json!({
            "model": self.model,
            "stream": true,
            "temperature": self.temperature,
            "messages": [{ "role": "user", "content": prompt }],
        });
        let request = self
            .client
            .post(format!(
                "{}/chat/completions",
                self.base_url.trim_end_matches('/')
            ))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body);

        let mut response = send_with_retry(request, self.max_retries, "OpenAI")
            .await
            .map_err(|e| RagError::GenerationFailed(e.to_string()))?;

        let mut lines = LineBuffer::default();
        while let Some(bytes) = next_chunk(&mut response, sink).await? {
            lines.push(bytes.as_ref());
            while let Some(line) = lines.next_line() {
                match parse_sse_line(&line)? {
                    SseLine::Token(text) => sink.send(text).await?,
                    SseLine::Done => return Ok(()),
                    SseLine::Skip => {}
                }
            }
        }

        // Some proxies close the stream without the `[DONE]` sentinel.
        if let Some(line) = lines.finish() {
            if let SseLine::Token(text) = parse_sse_line(&line)? {
                sink.send(text).await?;
            }
        }
        Ok(())
    }
}

#[derive(Debug, PartialEq)]
enum SseLine {
    Token(String),
    Done,
    Skip,
}

/// Interpret one line of an OpenAI server-sent event stream.
fn parse_sse_line(line: &str) -> Result<SseLine> {
    let Some(data) = line.strip_prefix("data:") else {
        // Comments, `event:` fields, and keep-alive blank lines.
        return Ok(SseLine::Skip);
    };
    let data = data.trim();
    if data == "[DONE]" {
        return Ok(SseLine::Done);
    }
    if data.is_empty() {
        return Ok(SseLine::Skip);
    }

    let json: serde_json::Value = serde_json::from_str(data)
        .map_err(|e| RagError::GenerationFailed(format!("malformed stream chunk: {}", e)))?;
    if let Some(err) = json.get("error") {
        let message = err
            .get("message")
            .and_then(|m| m.as_str())
            .unwrap_or("provider reported an error");
        return Err(RagError::GenerationFailed(message.to_string()));
    }

    let token = json
        .pointer("/choices/0/delta/content")
        .and_then(|c| c.as_str())
        .unwrap_or_default();
    if token.is_empty() {
        Ok(SseLine::Skip)
    } else {
        Ok(SseLine::Token(token.to_string()))
    }
}

// ============ Ollama Generator ============

/// Local Ollama `/api/generate` in streaming mode.
pub struct OllamaGenerator {
    model: String,
    url: String,
    temperature: f32,
    max_retries: u32,
    client: reqwest::Client,
}

impl OllamaGenerator {
    pub fn new(config: &GenerationConfig) -> Result<Self> {
        let model = config.model.clone().ok_or_else(|| {
            RagError::ConfigurationMissing("generation.model required for Ollama provider".into())
        })?;
        let url = config
            .url
            .clone()
            .unwrap_or_else(|| "http://localhost:11434".to_string());

        Ok(Self {
            model,
            url,
            temperature: config.temperature,
            max_retries: config.max_retries,
            client: build_streaming_client()?,
        })
    }
}

#[async_trait]
impl Generator for OllamaGenerator {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn stream(&self, prompt: &str, sink: &TokenSink) -> Result<()> {
        let body = serde_json::json!({
            "model": self.model,
            "prompt": prompt,
            "stream": true,
            "options": { "temperature": self.temperature },
        });
        let request = self
            .client
            .post(format!("{}/api/generate", self.url.trim_end_matches('/')))
            .json(&body);

        let mut response = send_with_retry(request, self.max_retries, "Ollama")
            .await
            .map_err(|e| RagError::GenerationFailed(e.to_string()))?;

        let mut lines = LineBuffer::default();
        while let Some(bytes) = next_chunk(&mut response, sink).await? {
            lines.push(bytes.as_ref());
            while let Some(line) = lines.next_line() {
                let (token, done) = parse_ollama_line(&line)?;
                if let Some(text) = token {
                    sink.send(text).await?;
                }
                if done {
                    return Ok(());
                }
            }
        }

        Err(RagError::GenerationFailed(
            "Ollama stream ended before completion".to_string(),
        ))
    }
}

/// Parse one NDJSON line from Ollama into `(token, done)`.
fn parse_ollama_line(line: &str) -> Result<(Option<String>, bool)> {
    if line.trim().is_empty() {
        return Ok((None, false));
    }
    let json: serde_json::Value = serde_json::from_str(line)
        .map_err(|e| RagError::GenerationFailed(format!("malformed stream chunk: {}", e)))?;
    if let Some(err) = json.get("error").and_then(|e| e.as_str()) {
        return Err(RagError::GenerationFailed(err.to_string()));
    }

    let token = json
        .get("response")
        .and_then(|r| r.as_str())
        .filter(|t| !t.is_empty())
        .map(str::to_string);
    let done = json.get("done").and_then(|d| d.as_bool()).unwrap_or(false);
    Ok((token, done))
}

// ============ Shared plumbing ============

/// Splits an incrementally received body into `\n`-terminated lines.
///
/// Bytes are buffered until a full line arrives, so multibyte characters
/// split across network chunks decode correctly.
#[derive(Default)]
struct LineBuffer {
    buf: Vec<u8>,
}

impl LineBuffer {
    fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    fn next_line(&mut self) -> Option<String> {
        let pos = self.buf.iter().position(|b| *b == b'\n')?;
        let line: Vec<u8> = self.buf.drain(..=pos).collect();
        let line = String::from_utf8_lossy(&line);
        Some(line.trim_end_matches(['\r', '\n']).to_string())
    }

    /// Remaining bytes once the body has ended.
    fn finish(&mut self) -> Option<String> {
        if self.buf.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.buf);
        Some(String::from_utf8_lossy(&rest).trim_end().to_string())
    }
}

/// Read the next body chunk, stopping early once nobody is listening.
async fn next_chunk(
    response: &mut reqwest::Response,
    sink: &TokenSink,
) -> Result<Option<impl AsRef<[u8]>>> {
    if sink.is_closed() {
        return Err(RagError::Cancelled);
    }
    response
        .chunk()
        .await
        .map_err(|e| RagError::GenerationFailed(e.to_string()))
}

/// Streaming responses are bounded by the synthesizer's own timeout, so the
/// client only limits connection setup.
fn build_streaming_client() -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .build()
        .map_err(|e| RagError::ConfigurationMissing(format!("cannot build HTTP client: {}", e)))
}

/// Create the configured [`Generator`].
///
/// # Errors
///
/// [`RagError::ConfigurationMissing`] for unknown providers or providers
/// that cannot be initialized (missing model or API key).
pub fn create_generator(config: &GenerationConfig) -> Result<Arc<dyn Generator>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledGenerator::default())),
        "openai" => Ok(Arc::new(OpenAIGenerator::new(config)?)),
        "ollama" => Ok(Arc::new(OllamaGenerator::new(config)?)),
        other => Err(RagError::ConfigurationMissing(format!(
            "unknown generation provider: {}",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sse_token_and_done() {
        let line = r#"data: {"choices":[{"delta":{"content":"Eiffel"}}]}"#;
        assert_eq!(
            parse_sse_line(line).unwrap(),
            SseLine::Token("Eiffel".to_string())
        );
        assert_eq!(parse_sse_line("data: [DONE]").unwrap(), SseLine::Done);
    }

    #[test]
    fn test_sse_skips_role_chunks_and_comments() {
        let line = r#"data: {"choices":[{"delta":{"role":"assistant"}}]}"#;
        assert_eq!(parse_sse_line(line).unwrap(), SseLine::Skip);
        assert_eq!(parse_sse_line(": keep-alive").unwrap(), SseLine::Skip);
        assert_eq!(parse_sse_line("").unwrap(), SseLine::Skip);
    }

    #[test]
    fn test_sse_error_payload_fails() {
        let line = r#"data: {"error":{"message":"overloaded"}}"#;
        let err = parse_sse_line(line).unwrap_err();
        assert!(matches!(err, RagError::GenerationFailed(m) if m == "overloaded"));
    }

    #[test]
    fn test_ollama_lines() {
        let (token, done) = parse_ollama_line(r#"{"response":"Paris","done":false}"#).unwrap();
        assert_eq!(token.as_deref(), Some("Paris"));
        assert!(!done);

        let (token, done) = parse_ollama_line(r#"{"response":"","done":true}"#).unwrap();
        assert!(token.is_none());
        assert!(done);

        assert!(parse_ollama_line(r#"{"error":"model not found"}"#).is_err());
    }

    #[test]
    fn test_line_buffer_handles_split_chunks() {
        let mut lines = LineBuffer::default();
        let text = "data: é\r\ndata: two\n";
        let bytes = text.as_bytes();
        // Split inside the two-byte 'é'.
        lines.push(&bytes[..7]);
        assert!(lines.next_line().is_none());
        lines.push(&bytes[7..]);
        assert_eq!(lines.next_line().as_deref(), Some("data: é"));
        assert_eq!(lines.next_line().as_deref(), Some("data: two"));
        assert!(lines.next_line().is_none());
        assert!(lines.finish().is_none());
    }

    #[tokio::test]
    async fn test_sink_reports_cancelled_after_receiver_drop() {
        let (sink, rx) = TokenSink::channel(4);
        sink.send("first").await.unwrap();
        drop(rx);
        assert!(sink.is_closed());
        assert!(matches!(
            sink.send("second").await.unwrap_err(),
            RagError::Cancelled
        ));
    }

    #[tokio::test]
    async fn test_sink_skips_empty_tokens() {
        let (sink, mut rx) = TokenSink::channel(4);
        sink.send("").await.unwrap();
        sink.send("a").await.unwrap();
        drop(sink);
        assert_eq!(
            rx.recv().await,
            Some(StreamEvent::Token {
                text: "a".to_string()
            })
        );
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn test_sink_clock_counts_only_blocked_sends() {
        let (sink, mut rx) = TokenSink::channel(1);
        sink.send("fits").await.unwrap();
        assert_eq!(sink.blocked(), Duration::ZERO);

        let reader = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            let mut seen = 0;
            while rx.recv().await.is_some() {
                seen += 1;
            }
            seen
        });
        sink.send("waits").await.unwrap();
        assert!(sink.blocked() >= Duration::from_millis(150), "{:?}", sink.blocked());
        drop(sink);
        assert_eq!(reader.await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_disabled_generator_is_configuration_missing() {
        let (sink, _rx) = TokenSink::channel(1);
        let err = DisabledGenerator::default()
            .stream("prompt", &sink)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "configuration_missing");
    }

    #[test]
    fn test_create_generator_unknown_provider() {
        let config = GenerationConfig {
            provider: "gemini".to_string(),
            ..Default::default()
        };
        assert!(create_generator(&config).is_err());
    }
}
