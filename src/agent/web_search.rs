//! External web search used by the agent's `web_search` tool.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::config::WebSearchConfig;
use crate::error::{Error, Result};
use crate::llm::check_status;

const MAX_RESULTS: usize = 5;
const MAX_SNIPPET_CHARS: usize = 300;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchDepth {
    #[default]
    Basic,
    Advanced,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WebResult {
    pub title: String,
    pub url: String,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WebAnswer {
    pub answer: Option<String>,
    pub results: Vec<WebResult>,
}

#[async_trait]
pub trait WebSearch: Send + Sync {
    async fn search(&self, query: &str, depth: SearchDepth) -> Result<WebAnswer>;
}

/// Tavily search API client.
pub struct TavilyClient {
    client: reqwest::Client,
    config: WebSearchConfig,
}

impl TavilyClient {
    pub fn new(client: reqwest::Client, config: WebSearchConfig) -> Self {
        Self { client, config }
    }
}

#[derive(Serialize)]
struct SearchRequest<'a> {
    api_key: &'a str,
    query: &'a str,
    search_depth: SearchDepth,
    include_answer: bool,
    max_results: usize,
}

#[derive(Deserialize)]
struct SearchResponse {
    #[serde(default)]
    answer: Option<String>,
    #[serde(default)]
    results: Vec<RawResult>,
}

#[derive(Deserialize)]
struct RawResult {
    #[serde(default)]
    title: String,
    #[serde(default)]
    url: String,
    #[serde(default)]
    content: String,
}

#[async_trait]
impl WebSearch for TavilyClient {
    async fn search(&self, query: &str, depth: SearchDepth) -> Result<WebAnswer> {
        let Some(api_key) = self.config.api_key.as_deref().filter(|k| !k.is_empty()) else {
            return Err(Error::ProviderAuth {
                service: "web_search".to_string(),
                message: "TAVILY_API_KEY is not set".to_string(),
            });
        };

        let url = format!("{}/search", self.config.base_url);
        let resp = self
            .client
            .post(&url)
            .timeout(Duration::from_secs(30))
            .json(&SearchRequest {
                api_key,
                query,
                search_depth: depth,
                include_answer: true,
                max_results: MAX_RESULTS,
            })
            .send()
            .await?;
        let resp = check_status("web_search", resp).await?;
        let body: SearchResponse = resp.json().await?;

        Ok(WebAnswer {
            answer: body.answer.filter(|a| !a.trim().is_empty()),
            results: body
                .results
                .into_iter()
                .take(MAX_RESULTS)
                .map(|r| WebResult {
                    title: r.title,
                    url: r.url,
                    content: crate::ingest::truncate_chars(&r.content, MAX_SNIPPET_CHARS)
                        .0
                        .to_string(),
                })
                .collect(),
        })
    }
}
