//! Test doubles for the model traits.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream;
use parking_lot::Mutex;
use tokio::time::Instant;

use crate::error::{Error, Result};
use crate::gateway::{Gate, ModelGateway, RateLimit, RetryPolicy};
use crate::llm::tools::{AgentMessage, AgentTurn, ToolCall, ToolCallingModel, ToolSpec};
use crate::llm::{LanguageModel, TextStream};
use crate::models::ChatMessage;

/// Scriptable [`LanguageModel`] with call counters.
pub struct MockModel {
    default_embedding: Vec<f32>,
    embedding_rules: Vec<(String, Vec<f32>)>,
    fail_summaries_containing: Vec<String>,
    rate_limited_remaining: AtomicUsize,
    auth_failure: bool,
    reply: Vec<String>,
    generate_calls: AtomicUsize,
    embed_calls: AtomicUsize,
    stream_calls: AtomicUsize,
    starts: Mutex<Vec<Instant>>,
    last_messages: Mutex<Vec<ChatMessage>>,
}

impl MockModel {
    pub fn new() -> Self {
        Self {
            default_embedding: vec![1.0, 0.0, 0.0],
            embedding_rules: Vec::new(),
            fail_summaries_containing: Vec::new(),
            rate_limited_remaining: AtomicUsize::new(0),
            auth_failure: false,
            reply: vec!["The ".into(), "answer.".into()],
            generate_calls: AtomicUsize::new(0),
            embed_calls: AtomicUsize::new(0),
            stream_calls: AtomicUsize::new(0),
            starts: Mutex::new(Vec::new()),
            last_messages: Mutex::new(Vec::new()),
        }
    }

    /// Vector returned when no rule matches.
    pub fn with_embedding(mut self, vector: Vec<f32>) -> Self {
        self.default_embedding = vector;
        self
    }

    /// Texts containing `needle` embed to `vector`.
    pub fn embed_rule(mut self, needle: &str, vector: Vec<f32>) -> Self {
        self.embedding_rules.push((needle.to_string(), vector));
        self
    }

    /// `generate` fails for prompts containing `needle`.
    pub fn fail_summary_for(mut self, needle: &str) -> Self {
        self.fail_summaries_containing.push(needle.to_string());
        self
    }

    pub fn rate_limited_times(self, times: usize) -> Self {
        self.rate_limited_remaining.store(times, Ordering::SeqCst);
        self
    }

    pub fn failing_auth(mut self) -> Self {
        self.auth_failure = true;
        self
    }

    pub fn with_reply(mut self, fragments: &[&str]) -> Self {
        self.reply = fragments.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn generate_calls(&self) -> usize {
        self.generate_calls.load(Ordering::SeqCst)
    }

    pub fn embed_calls(&self) -> usize {
        self.embed_calls.load(Ordering::SeqCst)
    }

    pub fn stream_calls(&self) -> usize {
        self.stream_calls.load(Ordering::SeqCst)
    }

    pub fn call_starts(&self) -> Vec<Instant> {
        self.starts.lock().clone()
    }

    pub fn last_messages(&self) -> Vec<ChatMessage> {
        self.last_messages.lock().clone()
    }

    fn record_start(&self) -> Result<()> {
        self.starts.lock().push(Instant::now());
        if self.auth_failure {
            return Err(Error::ProviderAuth {
                service: "mock".into(),
                message: "invalid key".into(),
            });
        }
        let limited = self
            .rate_limited_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if limited {
            return Err(Error::RateLimited {
                service: "mock".into(),
                retry_after: None,
            });
        }
        Ok(())
    }
}

impl Default for MockModel {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LanguageModel for MockModel {
    async fn generate(&self, prompt: &str) -> Result<String> {
        self.generate_calls.fetch_add(1, Ordering::SeqCst);
        self.record_start()?;
        if self
            .fail_summaries_containing
            .iter()
            .any(|needle| prompt.contains(needle.as_str()))
        {
            return Err(Error::provider("mock", "summary failed"));
        }
        Ok(format!("Summary of a {} byte prompt.", prompt.len()))
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self.embed_calls.fetch_add(1, Ordering::SeqCst);
        self.record_start()?;
        let vector = self
            .embedding_rules
            .iter()
            .find(|(needle, _)| text.contains(needle.as_str()))
            .map(|(_, v)| v.clone())
            .unwrap_or_else(|| self.default_embedding.clone());
        Ok(vector)
    }

    async fn stream(&self, messages: Vec<ChatMessage>) -> Result<TextStream> {
        self.stream_calls.fetch_add(1, Ordering::SeqCst);
        self.record_start()?;
        *self.last_messages.lock() = messages;
        let items: Vec<Result<String>> = self.reply.iter().cloned().map(Ok).collect();
        Ok(Box::pin(stream::iter(items)))
    }
}

/// A gateway without pacing, for tests that do not care about time.
pub fn unpaced_gateway(model: Arc<dyn LanguageModel>) -> ModelGateway {
    ModelGateway::new(model, Gate::new(RateLimit::unlimited(), RetryPolicy::none()))
}

/// Scripted [`ToolCallingModel`]. Turns are replayed in order; once the
/// script runs out, `fallback` is used for every further call.
pub struct ScriptedToolModel {
    script: Mutex<VecDeque<AgentTurn>>,
    fallback: Fallback,
    calls: AtomicUsize,
    tool_offers: Mutex<Vec<usize>>,
}

enum Fallback {
    Text(String),
    /// Request `read_file` again, even when no tools are offered.
    AlwaysReadFile,
    Silent,
}

impl ScriptedToolModel {
    pub fn new(script: Vec<AgentTurn>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            fallback: Fallback::Text("Done.".into()),
            calls: AtomicUsize::new(0),
            tool_offers: Mutex::new(Vec::new()),
        }
    }

    /// A model that never stops asking for another tool call.
    pub fn always_calls_tools() -> Self {
        Self {
            fallback: Fallback::AlwaysReadFile,
            ..Self::new(Vec::new())
        }
    }

    /// A model that never produces text or tool calls once the script ends.
    pub fn silent(script: Vec<AgentTurn>) -> Self {
        Self {
            fallback: Fallback::Silent,
            ..Self::new(script)
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Number of tools offered on each call, in call order.
    pub fn tool_offers(&self) -> Vec<usize> {
        self.tool_offers.lock().clone()
    }
}

pub fn tool_call(id: &str, name: &str, arguments: serde_json::Value) -> ToolCall {
    ToolCall {
        id: id.to_string(),
        name: name.to_string(),
        arguments,
    }
}

#[async_trait]
impl ToolCallingModel for ScriptedToolModel {
    async fn complete(&self, _messages: &[AgentMessage], tools: &[ToolSpec]) -> Result<AgentTurn> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        self.tool_offers.lock().push(tools.len());
        if let Some(turn) = self.script.lock().pop_front() {
            return Ok(turn);
        }
        Ok(match &self.fallback {
            Fallback::Text(text) => AgentTurn::text(text.clone()),
            Fallback::AlwaysReadFile => AgentTurn {
                content: None,
                tool_calls: vec![tool_call(
                    &format!("call_{n}"),
                    "read_file",
                    serde_json::json!({ "fileName": "src/main.rs" }),
                )],
            },
            Fallback::Silent => AgentTurn::default(),
        })
    }
}
