//! Rate-limited access to model providers.
//!
//! Every provider call goes through a [`Gate`]: admission by a shared
//! [`RateLimiter`], then the call, then the [`RetryPolicy`] if the provider
//! answered with a rate-limit error. Each retry is admitted again, so retries
//! are paced like any other call.

pub mod limiter;
pub mod retry;

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::llm::tools::{AgentMessage, AgentTurn, ToolCallingModel, ToolSpec};
use crate::llm::{LanguageModel, TextStream};
use crate::models::ChatMessage;

pub use limiter::{Admission, RateLimit, RateLimiter};
pub use retry::RetryPolicy;

/// Limiter plus retry policy for one provider.
pub struct Gate {
    limiter: RateLimiter,
    retry: RetryPolicy,
}

impl Gate {
    pub fn new(limit: RateLimit, retry: RetryPolicy) -> Self {
        Self {
            limiter: RateLimiter::new(limit),
            retry,
        }
    }

    /// Run `op` behind the limiter, retrying on rate-limit errors.
    pub async fn call<T, F, Fut>(&self, operation: &str, op: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.call_until(operation, &CancellationToken::new(), op).await
    }

    /// Like [`Gate::call`], but gives up with [`Error::Cancelled`] once
    /// `cancel` fires. The token is checked while waiting for admission and
    /// again right before the provider is called, so queued callers never
    /// reach the provider after a cancellation.
    pub async fn call_until<T, F, Fut>(
        &self,
        operation: &str,
        cancel: &CancellationToken,
        op: F,
    ) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let limiter = &self.limiter;
        self.retry
            .run(operation, Error::is_rate_limited, || {
                let call = op();
                async move {
                    let _admission = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(Error::Cancelled),
                        admission = limiter.admit() => admission,
                    };
                    if cancel.is_cancelled() {
                        return Err(Error::Cancelled);
                    }
                    call.await
                }
            })
            .await
    }
}

/// The single admission point for generation and embedding calls.
///
/// Constructed once per process and shared by ingestion, commit sync and
/// answering.
pub struct ModelGateway {
    model: Arc<dyn LanguageModel>,
    gate: Gate,
}

impl ModelGateway {
    pub fn new(model: Arc<dyn LanguageModel>, gate: Gate) -> Self {
        Self { model, gate }
    }

    /// Embed `text`. An empty vector from the provider is an [`Error::Embedding`].
    pub async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self.embed_until(text, &CancellationToken::new()).await
    }

    /// [`ModelGateway::embed`] that is abandoned once `cancel` fires.
    pub async fn embed_until(&self, text: &str, cancel: &CancellationToken) -> Result<Vec<f32>> {
        let vector = self
            .gate
            .call_until("embed", cancel, || self.model.embed(text))
            .await?;
        if vector.is_empty() {
            return Err(Error::Embedding("provider returned an empty vector".into()));
        }
        Ok(vector)
    }

    /// Summarize or otherwise generate text for `prompt`.
    pub async fn generate(&self, prompt: &str) -> Result<String> {
        self.gate.call("generate", || self.model.generate(prompt)).await
    }

    pub async fn generate_until(&self, prompt: &str, cancel: &CancellationToken) -> Result<String> {
        self.gate
            .call_until("generate", cancel, || self.model.generate(prompt))
            .await
    }

    /// Open a streaming completion. Only opening the stream is admitted;
    /// fragments are not paced.
    pub async fn stream(&self, messages: Vec<ChatMessage>) -> Result<TextStream> {
        self.gate
            .call("stream", || self.model.stream(messages.clone()))
            .await
    }
}

/// A [`ToolCallingModel`] behind its own gate.
pub struct GatedToolModel {
    inner: Arc<dyn ToolCallingModel>,
    gate: Gate,
}

impl GatedToolModel {
    pub fn new(inner: Arc<dyn ToolCallingModel>, gate: Gate) -> Self {
        Self { inner, gate }
    }
}

#[async_trait]
impl ToolCallingModel for GatedToolModel {
    async fn complete(&self, messages: &[AgentMessage], tools: &[ToolSpec]) -> Result<AgentTurn> {
        self.gate
            .call("agent", || self.inner.complete(messages, tools))
            .await
    }

    async fn stream_text(&self, messages: &[AgentMessage]) -> Result<TextStream> {
        self.gate
            .call("agent", || self.inner.stream_text(messages))
            .await
    }
}
