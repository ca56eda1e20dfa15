use serde::{Deserialize, Serialize};

use crate::config::LlmConfig;
use crate::error::{Error, Result};
use crate::llm::check_status;

/// Maximum characters sent to the embedding API.
/// Summaries are short, but a runaway model response can still exceed the
/// embedding model's context; 3 000 chars stays under 8 192 tokens even for
/// dense text.
const MAX_EMBED_CHARS: usize = 3_000;

/// Truncate `text` to at most `MAX_EMBED_CHARS`, splitting on a UTF-8 char boundary.
fn truncate_for_embedding(text: &str) -> &str {
    if text.len() <= MAX_EMBED_CHARS {
        return text;
    }
    let mut end = MAX_EMBED_CHARS;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

/// Generate the embedding for a single text.
///
/// Fails with [`Error::Embedding`] when the provider answers without a vector.
pub async fn embed_single(
    client: &reqwest::Client,
    config: &LlmConfig,
    text: &str,
) -> Result<Vec<f32>> {
    let input = truncate_for_embedding(text).to_string();

    let embedding = match config.provider.as_str() {
        "ollama" => embed_ollama(client, config, input).await?,
        "openai" => embed_openai(client, config, input).await?,
        other => return Err(Error::Config(format!("Unknown LLM provider: {other}"))),
    };

    match embedding {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(Error::Embedding(format!(
            "{} returned no embedding",
            config.provider
        ))),
    }
}

// ─── Ollama ──────────────────────────────────────────────

#[derive(Serialize)]
struct OllamaEmbedRequest {
    model: String,
    input: Vec<String>,
    /// Ask Ollama to silently truncate inputs that exceed the model's context
    /// length instead of returning a 400 error.
    truncate: bool,
}

#[derive(Deserialize)]
struct OllamaEmbedResponse {
    #[serde(default)]
    embeddings: Vec<Vec<f32>>,
}

async fn embed_ollama(
    client: &reqwest::Client,
    config: &LlmConfig,
    input: String,
) -> Result<Option<Vec<f32>>> {
    let url = format!("{}/api/embed", config.base_url);

    let req = OllamaEmbedRequest {
        model: config.embedding_model.clone(),
        input: vec![input],
        truncate: true,
    };

    let resp = client.post(&url).json(&req).send().await?;
    let resp = check_status("ollama embed", resp).await?;
    let body: OllamaEmbedResponse = resp.json().await?;

    Ok(body.embeddings.into_iter().next())
}

// ─── OpenAI-compatible ───────────────────────────────────

#[derive(Serialize)]
struct OpenAiEmbedRequest {
    model: String,
    input: Vec<String>,
}

#[derive(Deserialize)]
struct OpenAiEmbedResponse {
    #[serde(default)]
    data: Vec<OpenAiEmbedData>,
}

#[derive(Deserialize)]
struct OpenAiEmbedData {
    embedding: Vec<f32>,
}

async fn embed_openai(
    client: &reqwest::Client,
    config: &LlmConfig,
    input: String,
) -> Result<Option<Vec<f32>>> {
    let url = format!("{}/v1/embeddings", config.base_url);
    let api_key = config.api_key.as_deref().unwrap_or_default();

    let req = OpenAiEmbedRequest {
        model: config.embedding_model.clone(),
        input: vec![input],
    };

    let resp = client
        .post(&url)
        .header("Authorization", format!("Bearer {api_key}"))
        .json(&req)
        .send()
        .await?;
    let resp = check_status("openai embed", resp).await?;
    let body: OpenAiEmbedResponse = resp.json().await?;

    Ok(body.data.into_iter().next().map(|d| d.embedding))
}
