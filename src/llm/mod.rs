//! Provider adapters for text generation, embeddings and tool calling.
//!
//! Nothing in here knows about rate limits; every call site goes through
//! [`crate::gateway`], which wraps these adapters.

pub mod chat_stream;
pub mod completion;
pub mod embeddings;
pub mod tools;

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{self, Stream, StreamExt};

use crate::config::LlmConfig;
use crate::error::{Error, Result};
use crate::models::ChatMessage;

/// Incremental answer text. Ends after the last fragment, or right after the
/// first `Err` item.
pub type TextStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

/// Generation and embedding provider used by ingestion and answering.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Single-shot completion of a user prompt.
    async fn generate(&self, prompt: &str) -> Result<String>;

    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Open a streaming chat completion.
    async fn stream(&self, messages: Vec<ChatMessage>) -> Result<TextStream>;
}

/// HTTP-backed model speaking either the Ollama or the OpenAI-compatible API.
pub struct HttpLanguageModel {
    client: reqwest::Client,
    config: LlmConfig,
}

impl HttpLanguageModel {
    pub fn new(client: reqwest::Client, config: LlmConfig) -> Self {
        Self { client, config }
    }
}

#[async_trait]
impl LanguageModel for HttpLanguageModel {
    async fn generate(&self, prompt: &str) -> Result<String> {
        completion::complete(&self.client, &self.config, prompt).await
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        embeddings::embed_single(&self.client, &self.config, text).await
    }

    async fn stream(&self, messages: Vec<ChatMessage>) -> Result<TextStream> {
        chat_stream::stream_chat(&self.client, &self.config, messages).await
    }
}

/// Map a non-success provider response to the error taxonomy.
pub async fn check_status(service: &str, resp: reqwest::Response) -> Result<reqwest::Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }

    let retry_after = resp
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_retry_after);
    let body = resp.text().await.unwrap_or_default();
    Err(classify_status(service, status, retry_after, &body))
}

pub(crate) fn classify_status(
    service: &str,
    status: reqwest::StatusCode,
    retry_after: Option<Duration>,
    body: &str,
) -> Error {
    match status.as_u16() {
        401 | 403 => Error::ProviderAuth {
            service: service.to_string(),
            message: format!("{status}: {body}"),
        },
        429 => Error::RateLimited {
            service: service.to_string(),
            retry_after,
        },
        _ => Error::provider(service, format!("{status}: {body}")),
    }
}

/// `Retry-After` in its delta-seconds form. HTTP dates are ignored.
fn parse_retry_after(value: &str) -> Option<Duration> {
    value.trim().parse::<u64>().ok().map(Duration::from_secs)
}

/// Terminate a text stream right after its first error item.
pub fn stop_after_error(inner: TextStream) -> TextStream {
    Box::pin(stream::unfold(Some(inner), |state| async move {
        let mut inner = state?;
        match inner.next().await {
            Some(Ok(text)) => Some((Ok(text), Some(inner))),
            Some(Err(e)) => Some((Err(e), None)),
            None => None,
        }
    }))
}

/// A stream that yields `text` once and completes.
pub fn once_text(text: impl Into<String>) -> TextStream {
    let text = text.into();
    Box::pin(stream::once(async move { Ok(text) }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::StatusCode;

    #[test]
    fn test_classify_auth_failures() {
        let err = classify_status("gemini", StatusCode::UNAUTHORIZED, None, "bad key");
        assert!(matches!(err, Error::ProviderAuth { .. }));
        assert!(err.is_fatal());

        let err = classify_status("gemini", StatusCode::FORBIDDEN, None, "");
        assert!(matches!(err, Error::ProviderAuth { .. }));
    }

    #[test]
    fn test_classify_rate_limit_keeps_hint() {
        let err = classify_status(
            "groq",
            StatusCode::TOO_MANY_REQUESTS,
            Some(Duration::from_secs(7)),
            "slow down",
        );
        assert!(err.is_rate_limited());
        assert_eq!(err.retry_after(), Some(Duration::from_secs(7)));
    }

    #[test]
    fn test_classify_server_error_is_plain_provider_error() {
        let err = classify_status("groq", StatusCode::BAD_GATEWAY, None, "upstream");
        assert!(matches!(err, Error::Provider { .. }));
        assert!(!err.is_rate_limited());
    }

    #[test]
    fn test_parse_retry_after() {
        assert_eq!(parse_retry_after("12"), Some(Duration::from_secs(12)));
        assert_eq!(parse_retry_after(" 3 "), Some(Duration::from_secs(3)));
        assert_eq!(parse_retry_after("Wed, 21 Oct 2015 07:28:00 GMT"), None);
    }

    #[tokio::test]
    async fn test_stop_after_error_drops_the_tail() {
        let inner: TextStream = Box::pin(stream::iter(vec![
            Ok("a".to_string()),
            Err(Error::Stream("boom".into())),
            Ok("never".to_string()),
        ]));
        let items: Vec<_> = stop_after_error(inner).collect().await;
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].as_ref().unwrap(), "a");
        assert!(items[1].is_err());
    }

    #[tokio::test]
    async fn test_once_text() {
        let items: Vec<_> = once_text("hello").collect().await;
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].as_ref().unwrap(), "hello");
    }
}
