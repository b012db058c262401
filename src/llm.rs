//! Language model abstraction and chat-completion backends.
//!
//! [`LanguageModel`] has two entry points:
//! - [`complete`](LanguageModel::complete) streams an answer as a lazy
//!   sequence of text fragments;
//! - [`summarize`](LanguageModel::summarize) is a one-shot, non-streamed call
//!   used to summarise commit diffs.
//!
//! [`ChatModel`] implements both against either an OpenAI-compatible
//! `/v1/chat/completions` endpoint (SSE) or Ollama's `/api/chat` (NDJSON).

use async_trait::async_trait;
use futures::stream::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use crate::config::LlmConfig;
use crate::error::UpstreamError;

const SERVICE: &str = "language model";

/// Ordered text fragments; the stream ends when the model signals completion.
pub type TokenStream = Pin<Box<dyn Stream<Item = Result<String, UpstreamError>> + Send>>;

/// Instructions for the one-shot commit summary.
const COMMIT_SUMMARY_PROMPT: &str = "\
You are an expert programmer summarising a git diff for a changelog.
Lines starting with `+` were added, lines starting with `-` were removed, and
lines starting with neither are context. Lines starting with `diff --git`
name the files touched.

Write a short bullet list (at most five bullets) describing what changed and
why it matters. Mention file names in backticks when a change is specific to
one or two files. Do not repeat the diff and do not invent changes that are
not in it.";

#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Streams a completion for `prompt`.
    async fn complete(&self, prompt: &str) -> Result<TokenStream, UpstreamError>;

    /// Summarises `text` in a single, non-streamed call.
    async fn summarize(&self, text: &str) -> Result<String, UpstreamError>;
}

/// A model that refuses every call; used when `llm.provider = "disabled"`.
pub struct DisabledModel;

#[async_trait]
impl LanguageModel for DisabledModel {
    async fn complete(&self, _prompt: &str) -> Result<TokenStream, UpstreamError> {
        Err(UpstreamError::Disabled { service: SERVICE })
    }

    async fn summarize(&self, _text: &str) -> Result<String, UpstreamError> {
        Err(UpstreamError::Disabled { service: SERVICE })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flavor {
    OpenAi,
    Ollama,
}

/// Chat-completion client for OpenAI-compatible servers and Ollama.
pub struct ChatModel {
    client: reqwest::Client,
    flavor: Flavor,
    base_url: String,
    model: String,
    api_key: Option<String>,
    summary_timeout: Duration,
    idle_timeout: Duration,
}

impl ChatModel {
    pub fn new(config: &LlmConfig) -> anyhow::Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("llm.model required"))?;

        let (flavor, default_base) = match config.provider.as_str() {
            "openai" => (Flavor::OpenAi, "https://api.openai.com"),
            "ollama" => (Flavor::Ollama, "http://127.0.0.1:11434"),
            other => anyhow::bail!("Unsupported llm provider: {}", other),
        };

        let api_key = std::env::var(&config.api_key_env).ok();
        if flavor == Flavor::OpenAi && api_key.is_none() {
            anyhow::bail!("{} environment variable not set", config.api_key_env);
        }

        // No client-wide timeout: streamed answers may legitimately run long.
        // Summaries get a per-request timeout, streams an idle timeout.
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;

        Ok(Self {
            client,
            flavor,
            base_url: config
                .base_url
                .clone()
                .unwrap_or_else(|| default_base.to_string())
                .trim_end_matches('/')
                .to_string(),
            model,
            api_key,
            summary_timeout: Duration::from_secs(config.timeout_secs),
            idle_timeout: Duration::from_secs(config.stream_idle_secs),
        })
    }

    fn endpoint(&self) -> String {
        match self.flavor {
            Flavor::OpenAi => format!("{}/v1/chat/completions", self.base_url),
            Flavor::Ollama => format!("{}/api/chat", self.base_url),
        }
    }

    async fn send(
        &self,
        messages: Vec<ChatMessage>,
        stream: bool,
        timeout: Option<Duration>,
    ) -> Result<reqwest::Response, UpstreamError> {
        let mut request = self.client.post(self.endpoint()).json(&ChatRequest {
            model: self.model.clone(),
            messages,
            stream,
        });
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        if let Some(timeout) = timeout {
            request = request.timeout(timeout);
        }

        let response = request
            .send()
            .await
            .map_err(|e| UpstreamError::transport(SERVICE, e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(UpstreamError::from_status(SERVICE, status.as_u16(), body));
        }
        Ok(response)
    }
}

#[async_trait]
impl LanguageModel for ChatModel {
    async fn complete(&self, prompt: &str) -> Result<TokenStream, UpstreamError> {
        let messages = vec![ChatMessage::user(prompt)];
        let response = self.send(messages, true, None).await?;

        let lines = with_idle_timeout(stream_lines(response.bytes_stream()), self.idle_timeout);
        let tokens = completion_tokens(lines, self.flavor);

        Ok(Box::pin(tokens))
    }

    async fn summarize(&self, text: &str) -> Result<String, UpstreamError> {
        let messages = vec![
            ChatMessage::system(COMMIT_SUMMARY_PROMPT),
            ChatMessage::user(text),
        ];
        let response = self
            .send(messages, false, Some(self.summary_timeout))
            .await?;
        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| UpstreamError::malformed(SERVICE, e.to_string()))?;

        let content = match self.flavor {
            Flavor::OpenAi => json
                .pointer("/choices/0/message/content")
                .and_then(|c| c.as_str()),
            Flavor::Ollama => json.pointer("/message/content").and_then(|c| c.as_str()),
        };
        content
            .map(|c| c.trim().to_string())
            .ok_or_else(|| UpstreamError::malformed(SERVICE, "completion has no message content"))
    }
}

/// Create the [`LanguageModel`] named by `llm.provider`.
pub fn create_model(config: &LlmConfig) -> anyhow::Result<Arc<dyn LanguageModel>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledModel)),
        "openai" | "ollama" => Ok(Arc::new(ChatModel::new(config)?)),
        other => anyhow::bail!("Unknown llm provider: {}", other),
    }
}

// ─── Wire types ─────────────────────────────────────────

#[derive(Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    stream: bool,
}

#[derive(Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
}

impl ChatMessage {
    fn system(content: &str) -> Self {
        Self {
            role: "system".to_string(),
            content: content.to_string(),
        }
    }

    fn user(content: &str) -> Self {
        Self {
            role: "user".to_string(),
            content: content.to_string(),
        }
    }
}

#[derive(Deserialize)]
struct OllamaStreamChunk {
    message: Option<ChatMessage>,
    #[serde(default)]
    done: bool,
}

#[derive(Deserialize)]
struct OpenAiStreamChunk {
    choices: Vec<OpenAiStreamChoice>,
}

#[derive(Deserialize)]
struct OpenAiStreamChoice {
    delta: OpenAiStreamDelta,
}

#[derive(Deserialize)]
struct OpenAiStreamDelta {
    content: Option<String>,
}

// ─── Line parsing ───────────────────────────────────────

/// What one line of a streamed completion means.
#[derive(Debug)]
enum LineEvent {
    Token(String),
    /// The last fragment, carried on the line that signals completion.
    Final(String),
    Skip,
    Done,
    Failed(UpstreamError),
}

/// Parses one SSE line from an OpenAI-compatible stream.
fn parse_openai_line(line: &str) -> LineEvent {
    let line = line.trim();
    let Some(data) = line.strip_prefix("data:") else {
        return LineEvent::Skip;
    };
    let data = data.trim();

    if data == "[DONE]" {
        return LineEvent::Done;
    }

    match serde_json::from_str::<OpenAiStreamChunk>(data) {
        Ok(chunk) => match chunk.choices.into_iter().next().and_then(|c| c.delta.content) {
            Some(content) if !content.is_empty() => LineEvent::Token(content),
            _ => LineEvent::Skip,
        },
        Err(e) => LineEvent::Failed(UpstreamError::malformed(SERVICE, e.to_string())),
    }
}

/// Parses one NDJSON line from an Ollama stream.
fn parse_ollama_line(line: &str) -> LineEvent {
    let line = line.trim();
    if line.is_empty() {
        return LineEvent::Skip;
    }

    match serde_json::from_str::<OllamaStreamChunk>(line) {
        Ok(chunk) => {
            let content = chunk.message.map(|m| m.content).unwrap_or_default();
            match (content.is_empty(), chunk.done) {
                (false, false) => LineEvent::Token(content),
                (false, true) => LineEvent::Final(content),
                (true, true) => LineEvent::Done,
                (true, false) => LineEvent::Skip,
            }
        }
        Err(e) => LineEvent::Failed(UpstreamError::malformed(SERVICE, e.to_string())),
    }
}

/// Turns response lines into text fragments.
///
/// The stream ends cleanly only when the model signals completion. A body
/// that closes before that yields a final error, as does any transport or
/// parse failure; nothing is yielded after an error.
fn completion_tokens<S>(
    lines: S,
    flavor: Flavor,
) -> impl Stream<Item = Result<String, UpstreamError>> + Send
where
    S: Stream<Item = Result<String, UpstreamError>> + Send + 'static,
{
    futures::stream::unfold(Some(Box::pin(lines)), move |state| async move {
        let mut lines = state?;
        loop {
            let event = match lines.next().await {
                Some(Ok(line)) => match flavor {
                    Flavor::OpenAi => parse_openai_line(&line),
                    Flavor::Ollama => parse_ollama_line(&line),
                },
                Some(Err(e)) => LineEvent::Failed(e),
                None => LineEvent::Failed(UpstreamError::malformed(
                    SERVICE,
                    "stream ended before completion",
                )),
            };
            match event {
                LineEvent::Token(text) => return Some((Ok(text), Some(lines))),
                LineEvent::Final(text) => return Some((Ok(text), None)),
                LineEvent::Skip => continue,
                LineEvent::Done => return None,
                LineEvent::Failed(e) => return Some((Err(e), None)),
            }
        }
    })
}

// ─── Line buffering ─────────────────────────────────────

/// Converts a byte stream into a stream of complete, non-blank lines.
///
/// Bytes are buffered until a newline so that a multibyte character split
/// across chunks is decoded whole. A line that is not valid UTF-8 fails the
/// stream.
fn stream_lines<S>(byte_stream: S) -> impl Stream<Item = Result<String, UpstreamError>> + Send
where
    S: Stream<Item = reqwest::Result<bytes::Bytes>> + Send + 'static,
{
    futures::stream::unfold(
        (Box::pin(byte_stream), Vec::<u8>::new(), false),
        |(mut stream, mut buffer, finished)| async move {
            if finished {
                return None;
            }
            loop {
                if let Some(newline_pos) = buffer.iter().position(|b| *b == b'\n') {
                    let line: Vec<u8> = buffer.drain(..=newline_pos).collect();
                    if line.iter().all(u8::is_ascii_whitespace) {
                        continue;
                    }
                    return match decode_line(line) {
                        Ok(line) => Some((Ok(line), (stream, buffer, false))),
                        Err(e) => Some((Err(e), (stream, buffer, true))),
                    };
                }

                match stream.next().await {
                    Some(Ok(bytes)) => buffer.extend_from_slice(&bytes),
                    Some(Err(e)) => {
                        return Some((
                            Err(UpstreamError::transport(SERVICE, e)),
                            (stream, buffer, true),
                        ));
                    }
                    None => {
                        if buffer.iter().all(u8::is_ascii_whitespace) {
                            return None;
                        }
                        let remaining = decode_line(std::mem::take(&mut buffer));
                        return Some((remaining, (stream, buffer, true)));
                    }
                }
            }
        },
    )
}

fn decode_line(line: Vec<u8>) -> Result<String, UpstreamError> {
    String::from_utf8(line).map_err(|e| UpstreamError::malformed(SERVICE, e.to_string()))
}

/// Fails the stream if no item arrives within `idle`; ends after any error.
fn with_idle_timeout<S>(
    lines: S,
    idle: Duration,
) -> impl Stream<Item = Result<String, UpstreamError>> + Send
where
    S: Stream<Item = Result<String, UpstreamError>> + Send + 'static,
{
    futures::stream::unfold((Box::pin(lines), false), move |(mut lines, failed)| async move {
        if failed {
            return None;
        }
        match tokio::time::timeout(idle, lines.next()).await {
            Ok(Some(Ok(line))) => Some((Ok(line), (lines, false))),
            Ok(Some(Err(e))) => Some((Err(e), (lines, true))),
            Ok(None) => None,
            Err(_) => Some((
                Err(UpstreamError::malformed(
                    SERVICE,
                    format!("no output for {}s", idle.as_secs()),
                )),
                (lines, true),
            )),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token(event: LineEvent) -> String {
        match event {
            LineEvent::Token(t) => t,
            other => panic!("expected token, got {:?}", other),
        }
    }

    // ─── OpenAI parsing ─────────────────────────────────

    #[test]
    fn test_parse_openai_data_line() {
        let line = r#"data: {"choices":[{"delta":{"content":"Hello"}}]}"#;
        assert_eq!(token(parse_openai_line(line)), "Hello");
    }

    #[test]
    fn test_parse_openai_done() {
        assert!(matches!(parse_openai_line("data: [DONE]"), LineEvent::Done));
    }

    #[test]
    fn test_parse_openai_role_only_chunk() {
        let line = r#"data: {"choices":[{"delta":{"role":"assistant"}}]}"#;
        assert!(matches!(parse_openai_line(line), LineEvent::Skip));
    }

    #[test]
    fn test_parse_openai_non_data_line() {
        assert!(matches!(parse_openai_line("event: message"), LineEvent::Skip));
        assert!(matches!(parse_openai_line(": keep-alive"), LineEvent::Skip));
    }

    #[test]
    fn test_parse_openai_malformed() {
        assert!(matches!(
            parse_openai_line("data: {broken json"),
            LineEvent::Failed(_)
        ));
    }

    // ─── Ollama parsing ─────────────────────────────────

    #[test]
    fn test_parse_ollama_chunk() {
        let line = r#"{"message":{"role":"assistant","content":"The main"},"done":false}"#;
        assert_eq!(token(parse_ollama_line(line)), "The main");
    }

    #[test]
    fn test_parse_ollama_done() {
        let line = r#"{"message":{"role":"assistant","content":""},"done":true}"#;
        assert!(matches!(parse_ollama_line(line), LineEvent::Done));
    }

    #[test]
    fn test_parse_ollama_done_with_content() {
        let line = r#"{"message":{"role":"assistant","content":"."},"done":true}"#;
        assert!(matches!(parse_ollama_line(line), LineEvent::Final(t) if t == "."));
    }

    #[test]
    fn test_parse_ollama_malformed() {
        assert!(matches!(parse_ollama_line("not json{{"), LineEvent::Failed(_)));
    }

    // ─── Line buffering ─────────────────────────────────

    #[tokio::test]
    async fn test_stream_lines_reassembles_split_chunks() {
        let chunks: Vec<reqwest::Result<bytes::Bytes>> = vec![
            Ok(bytes::Bytes::from_static(b"data: one\n\nda")),
            Ok(bytes::Bytes::from_static(b"ta: two\n")),
            Ok(bytes::Bytes::from_static(b"data: three")),
        ];
        let lines: Vec<String> = stream_lines(futures::stream::iter(chunks))
            .map(|l| l.unwrap().trim().to_string())
            .collect()
            .await;
        assert_eq!(lines, vec!["data: one", "data: two", "data: three"]);
    }

    #[tokio::test]
    async fn test_stream_lines_keeps_multibyte_char_split_across_chunks() {
        let chunks: Vec<reqwest::Result<bytes::Bytes>> = vec![
            Ok(bytes::Bytes::from_static(b"{\"message\":{\"content\":\"caf\xC3")),
            Ok(bytes::Bytes::from_static(b"\xA9\"},\"done\":false}\n")),
        ];
        let lines: Vec<String> = stream_lines(futures::stream::iter(chunks))
            .map(|l| l.unwrap())
            .collect()
            .await;
        assert_eq!(lines.len(), 1);
        assert_eq!(token(parse_ollama_line(&lines[0])), "café");
    }

    #[tokio::test]
    async fn test_stream_lines_rejects_invalid_utf8() {
        let chunks: Vec<reqwest::Result<bytes::Bytes>> =
            vec![Ok(bytes::Bytes::from_static(b"data: \xFF\xFE\n"))];
        let items: Vec<_> = stream_lines(futures::stream::iter(chunks)).collect().await;
        assert_eq!(items.len(), 1);
        assert!(matches!(items[0], Err(UpstreamError::Malformed { .. })));
    }

    // ─── Completion termination ─────────────────────────

    async fn tokens_of(
        flavor: Flavor,
        lines: &[&str],
    ) -> Vec<Result<String, UpstreamError>> {
        let lines: Vec<Result<String, UpstreamError>> =
            lines.iter().map(|l| Ok(l.to_string())).collect();
        completion_tokens(futures::stream::iter(lines), flavor)
            .collect()
            .await
    }

    #[tokio::test]
    async fn test_openai_stream_ends_cleanly_on_done_marker() {
        let items = tokens_of(
            Flavor::OpenAi,
            &[
                r#"data: {"choices":[{"delta":{"content":"The answer"}}]}"#,
                r#"data: {"choices":[{"delta":{"content":" is 42"}}]}"#,
                "data: [DONE]",
                r#"data: {"choices":[{"delta":{"content":"ignored"}}]}"#,
            ],
        )
        .await;
        let text: Vec<String> = items.into_iter().map(|i| i.unwrap()).collect();
        assert_eq!(text, vec!["The answer", " is 42"]);
    }

    #[tokio::test]
    async fn test_openai_stream_cut_before_done_is_an_error() {
        let items = tokens_of(
            Flavor::OpenAi,
            &[r#"data: {"choices":[{"delta":{"content":"The answer is"}}]}"#],
        )
        .await;
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].as_ref().unwrap(), "The answer is");
        let err = items[1].as_ref().unwrap_err();
        assert!(err.to_string().contains("stream ended before completion"));
    }

    #[tokio::test]
    async fn test_ollama_stream_ends_cleanly_on_done_flag() {
        let items = tokens_of(
            Flavor::Ollama,
            &[
                r#"{"message":{"role":"assistant","content":"The answer"},"done":false}"#,
                r#"{"message":{"role":"assistant","content":" is 42"},"done":true}"#,
            ],
        )
        .await;
        let text: Vec<String> = items.into_iter().map(|i| i.unwrap()).collect();
        assert_eq!(text, vec!["The answer", " is 42"]);
    }

    #[tokio::test]
    async fn test_ollama_stream_cut_before_done_is_an_error() {
        let items = tokens_of(
            Flavor::Ollama,
            &[r#"{"message":{"role":"assistant","content":"The answer is"},"done":false}"#],
        )
        .await;
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].as_ref().unwrap(), "The answer is");
        assert!(matches!(items[1], Err(UpstreamError::Malformed { .. })));
    }

    #[tokio::test]
    async fn test_stream_stops_after_parse_failure() {
        let items = tokens_of(
            Flavor::Ollama,
            &[
                "not json{{",
                r#"{"message":{"role":"assistant","content":"late"},"done":true}"#,
            ],
        )
        .await;
        assert_eq!(items.len(), 1);
        assert!(items[0].is_err());
    }

    #[tokio::test]
    async fn test_idle_timeout_fails_stalled_stream() {
        let stalled = futures::stream::pending::<Result<String, UpstreamError>>();
        let items: Vec<_> = with_idle_timeout(stalled, Duration::from_millis(20))
            .collect()
            .await;
        assert_eq!(items.len(), 1);
        assert!(items[0].as_ref().unwrap_err().to_string().contains("no output"));
    }

    #[tokio::test]
    async fn test_disabled_model_errors() {
        assert!(matches!(
            DisabledModel.summarize("diff").await,
            Err(UpstreamError::Disabled { .. })
        ));
    }
}
