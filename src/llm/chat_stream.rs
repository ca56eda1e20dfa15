//! Streaming chat completions. Ollama answers with NDJSON lines and
//! OpenAI-compatible servers with SSE `data:` lines; both go through
//! [`stream_lines`] and end on the first error.

use futures_util::stream::{Stream, StreamExt};
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;

use crate::config::LlmConfig;
use crate::error::{Error, Result};
use crate::llm::completion::{
    first_choice_text, OllamaChatRequest, OllamaChatResponse, OpenAiChatRequest,
    OpenAiChatResponse,
};
use crate::llm::{check_status, classify_status, stop_after_error, TextStream};
use crate::models::ChatMessage;

/// Stream chat completions from Ollama or OpenAI as content fragments.
pub async fn stream_chat(
    client: &reqwest::Client,
    config: &LlmConfig,
    messages: Vec<ChatMessage>,
) -> Result<TextStream> {
    match config.provider.as_str() {
        "ollama" => stream_ollama(client, config, messages).await,
        "openai" => stream_openai(client, config, messages).await,
        other => Err(Error::Config(format!(
            "Unsupported LLM provider for chat: {other}"
        ))),
    }
}

async fn stream_ollama(
    client: &reqwest::Client,
    config: &LlmConfig,
    messages: Vec<ChatMessage>,
) -> Result<TextStream> {
    let url = format!("{}/api/chat", config.base_url);
    let req = OllamaChatRequest {
        model: config.chat_model.clone(),
        messages,
        stream: true,
    };

    let resp = client
        .post(&url)
        .timeout(Duration::from_secs(300))
        .json(&req)
        .send()
        .await?;
    let resp = check_status("ollama chat", resp).await?;

    Ok(text_stream(resp, |line| parse_ollama_line("ollama chat", line)))
}

async fn stream_openai(
    client: &reqwest::Client,
    config: &LlmConfig,
    messages: Vec<ChatMessage>,
) -> Result<TextStream> {
    let url = format!("{}/v1/chat/completions", config.base_url);
    let req = OpenAiChatRequest::new(config, messages, true);

    let resp = client
        .post(&url)
        .timeout(Duration::from_secs(300))
        .header(
            "Authorization",
            format!("Bearer {}", config.api_key.as_deref().unwrap_or("")),
        )
        .json(&req)
        .send()
        .await?;
    let resp = check_status("openai chat", resp).await?;

    Ok(openai_deltas("openai chat", resp))
}

/// Content deltas of an OpenAI-compatible `stream: true` response.
pub(crate) fn openai_deltas(service: &'static str, resp: reqwest::Response) -> TextStream {
    text_stream(resp, move |line| parse_openai_line(service, line))
}

fn text_stream(
    resp: reqwest::Response,
    parse: impl Fn(&str) -> Option<Result<String>> + Send + Sync + 'static,
) -> TextStream {
    let stream = stream_lines(resp.bytes_stream()).filter_map(move |line| {
        let item = match line {
            Ok(line) => parse(&line),
            Err(e) => Some(Err(e)),
        };
        futures_util::future::ready(item)
    });
    stop_after_error(Box::pin(stream))
}

/// Parse one Ollama NDJSON line. `None` skips empty fragments and the
/// closing `done` line.
fn parse_ollama_line(service: &str, line: &str) -> Option<Result<String>> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    if let Some(failure) = stream_failure(service, line) {
        return Some(Err(failure));
    }

    match serde_json::from_str::<OllamaChatResponse>(line) {
        Ok(chunk) if chunk.done || chunk.message.content.is_empty() => None,
        Ok(chunk) => Some(Ok(chunk.message.content)),
        Err(e) => Some(Err(Error::Stream(format!("Failed to parse Ollama chunk: {e}")))),
    }
}

/// Parse one SSE line. `None` skips comments, other fields, `[DONE]` and
/// role-only chunks.
fn parse_openai_line(service: &str, line: &str) -> Option<Result<String>> {
    let data = line.trim().strip_prefix("data:")?.trim();
    if data.is_empty() || data == "[DONE]" {
        return None;
    }
    if let Some(failure) = stream_failure(service, data) {
        return Some(Err(failure));
    }

    match serde_json::from_str::<OpenAiChatResponse>(data) {
        Ok(chunk) => Some(first_choice_text(chunk))
            .filter(|content| !content.is_empty())
            .map(Ok),
        Err(e) => Some(Err(Error::Stream(format!("Failed to parse OpenAI chunk: {e}")))),
    }
}

// ─── In-stream failures ──────────────────────────────────

/// An error a server writes into a response that already answered 200.
#[derive(Deserialize)]
struct StreamFailure {
    error: FailureBody,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum FailureBody {
    /// Ollama: `{"error": "..."}`
    Message(String),
    /// OpenAI-compatible: `{"error": {"message", "type", "code"}}`
    Detailed {
        #[serde(default)]
        message: String,
        #[serde(rename = "type", default)]
        kind: Option<String>,
        #[serde(default)]
        code: Option<Value>,
    },
}

/// Classify an in-stream error object the same way an HTTP error status
/// would be. There are no headers at this point, so no `Retry-After` hint.
fn stream_failure(service: &str, payload: &str) -> Option<Error> {
    let failure: StreamFailure = serde_json::from_str(payload).ok()?;
    let (status, message) = match failure.error {
        FailureBody::Message(message) => (status_from_labels(&[&message]), message),
        FailureBody::Detailed {
            message,
            kind,
            code,
        } => {
            let numeric = code
                .as_ref()
                .and_then(Value::as_u64)
                .and_then(|c| u16::try_from(c).ok())
                .and_then(|c| StatusCode::from_u16(c).ok());
            let status = numeric.unwrap_or_else(|| {
                let code = code.as_ref().and_then(Value::as_str).unwrap_or_default();
                status_from_labels(&[kind.as_deref().unwrap_or_default(), code])
            });
            (status, message)
        }
    };
    Some(classify_status(service, status, None, &message))
}

fn status_from_labels(labels: &[&str]) -> StatusCode {
    let labels = labels.join(" ").to_lowercase();
    if labels.contains("rate_limit") || labels.contains("rate limit") {
        StatusCode::TOO_MANY_REQUESTS
    } else if labels.contains("invalid_api_key") || labels.contains("authentication") {
        StatusCode::UNAUTHORIZED
    } else {
        StatusCode::BAD_GATEWAY
    }
}

// ─── Line buffering ──────────────────────────────────────

/// Convert a byte stream into a stream of complete, non-blank lines.
pub(crate) fn stream_lines(
    byte_stream: impl Stream<Item = reqwest::Result<bytes::Bytes>> + Send + 'static,
) -> impl Stream<Item = Result<String>> + Send {
    futures_util::stream::unfold(
        (Box::pin(byte_stream), Vec::<u8>::new()),
        |(mut stream, mut buffer)| async move {
            loop {
                if let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
                    let line: Vec<u8> = buffer.drain(..=pos).collect();
                    let line = String::from_utf8_lossy(&line).trim_end().to_string();
                    if !line.trim().is_empty() {
                        return Some((Ok(line), (stream, buffer)));
                    }
                    continue;
                }

                match stream.next().await {
                    Some(Ok(bytes)) => buffer.extend_from_slice(&bytes),
                    Some(Err(e)) => {
                        return Some((
                            Err(Error::Stream(format!("Stream read error: {e}"))),
                            (stream, buffer),
                        ));
                    }
                    None => {
                        // Unterminated last line
                        let rest = String::from_utf8_lossy(&buffer).trim().to_string();
                        buffer.clear();
                        return (!rest.is_empty()).then(|| (Ok(rest), (stream, buffer)));
                    }
                }
            }
        },
    )
}
