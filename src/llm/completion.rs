//! Chat request and response bodies for both providers, and the
//! non-streaming completion built on them. [`super::chat_stream`] reuses the
//! same bodies with `stream` set.

use serde::{Deserialize, Serialize};

use crate::config::LlmConfig;
use crate::error::{Error, Result};
use crate::llm::check_status;
use crate::models::ChatMessage;

/// Non-streaming chat completion of a single user prompt.
pub async fn complete(client: &reqwest::Client, config: &LlmConfig, prompt: &str) -> Result<String> {
    let messages = vec![ChatMessage::user(prompt)];
    match config.provider.as_str() {
        "ollama" => call_ollama(client, config, messages).await,
        "openai" => call_openai(client, config, messages).await,
        other => Err(Error::Config(format!("Unknown LLM provider: {other}"))),
    }
}

// ─── Ollama ──────────────────────────────────────────────

#[derive(Serialize)]
pub(super) struct OllamaChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub stream: bool,
}

/// A whole response, or one NDJSON line of a streamed one.
#[derive(Deserialize)]
pub(super) struct OllamaChatResponse {
    pub message: ChatMessage,
    #[serde(default)]
    pub done: bool,
}

async fn call_ollama(
    client: &reqwest::Client,
    config: &LlmConfig,
    messages: Vec<ChatMessage>,
) -> Result<String> {
    let url = format!("{}/api/chat", config.base_url);

    let req = OllamaChatRequest {
        model: config.chat_model.clone(),
        messages,
        stream: false,
    };

    let resp = client.post(&url).json(&req).send().await?;
    let resp = check_status("ollama chat", resp).await?;

    let body: OllamaChatResponse = resp.json().await?;
    Ok(body.message.content)
}

// ─── OpenAI-compatible ───────────────────────────────────

#[derive(Serialize)]
pub(super) struct OpenAiChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub temperature: f32,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub stream: bool,
}

impl OpenAiChatRequest {
    pub fn new(config: &LlmConfig, messages: Vec<ChatMessage>, stream: bool) -> Self {
        Self {
            model: config.chat_model.clone(),
            messages,
            temperature: 0.3,
            stream,
        }
    }
}

/// A whole response, or one `data:` chunk of a streamed one.
#[derive(Deserialize)]
pub(super) struct OpenAiChatResponse {
    #[serde(default)]
    choices: Vec<OpenAiChoice>,
}

#[derive(Deserialize)]
struct OpenAiChoice {
    #[serde(alias = "delta")]
    message: OpenAiResponseMessage,
}

#[derive(Deserialize)]
struct OpenAiResponseMessage {
    content: Option<String>,
}

async fn call_openai(
    client: &reqwest::Client,
    config: &LlmConfig,
    messages: Vec<ChatMessage>,
) -> Result<String> {
    let url = format!("{}/v1/chat/completions", config.base_url);
    let api_key = config.api_key.as_deref().unwrap_or_default();

    let req = OpenAiChatRequest::new(config, messages, false);

    let resp = client
        .post(&url)
        .header("Authorization", format!("Bearer {api_key}"))
        .json(&req)
        .send()
        .await?;
    let resp = check_status("openai chat", resp).await?;

    let body: OpenAiChatResponse = resp.json().await?;
    Ok(first_choice_text(body))
}

/// Empty responses are a soft failure; the caller decides what an empty
/// completion means.
pub(super) fn first_choice_text(body: OpenAiChatResponse) -> String {
    body.choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
        .unwrap_or_default()
}
