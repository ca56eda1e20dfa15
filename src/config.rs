use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::gateway::{RateLimit, RetryPolicy};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Where projects, commits, answers and the JSON vector store live
    pub data_dir: PathBuf,
    /// Server bind address
    pub bind_addr: String,
    /// Summarization, embedding and answer streaming provider
    pub llm: LlmConfig,
    /// Admission policy for the `llm` provider
    pub llm_gate: GateConfig,
    /// Tool-calling provider used by the agent
    pub agent: AgentConfig,
    pub web_search: WebSearchConfig,
    pub github: GithubConfig,
    pub retrieval: RetrievalConfig,
    /// Postgres connection string; selects the pgvector store when set
    pub database_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// "ollama" or "openai"
    pub provider: String,
    /// Base URL for the LLM API
    pub base_url: String,
    /// Model name for summaries and answers
    pub chat_model: String,
    /// Model name for embeddings
    pub embedding_model: String,
    /// API key (only needed for cloud providers)
    pub api_key: Option<String>,
    /// Embedding vector dimension
    pub embedding_dim: usize,
}

/// Concurrency, cooldown and retry settings for one provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateConfig {
    pub max_concurrent: usize,
    pub cooldown_ms: u64,
    pub requests_per_minute: Option<u32>,
    pub max_retries: u32,
    pub retry_base_ms: u64,
}

impl GateConfig {
    pub fn rate_limit(&self) -> RateLimit {
        let mut limit = match self.requests_per_minute {
            Some(rpm) => RateLimit::per_minute(rpm, self.max_concurrent),
            None => RateLimit::serial(Duration::ZERO),
        };
        limit.max_concurrent = self.max_concurrent.max(1);
        limit.cooldown = Duration::from_millis(self.cooldown_ms);
        limit
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_retries + 1,
            base_delay: Duration::from_millis(self.retry_base_ms),
            ..RetryPolicy::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// OpenAI-compatible endpoint with tool calling
    pub base_url: String,
    pub model: String,
    pub api_key: Option<String>,
    pub max_tokens: u32,
    /// Hard cap on tool-executing steps per run
    pub max_steps: usize,
    pub gate: GateConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebSearchConfig {
    pub base_url: String,
    /// Without a key every web search fails softly
    pub api_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GithubConfig {
    pub api_url: String,
    /// Fallback credential when a project does not carry its own
    pub token: Option<String>,
    pub fetch_concurrency: usize,
}

/// Similarity thresholds and context budgets for the answering flows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    pub ask_threshold: f32,
    pub bug_scan_threshold: f32,
    pub feature_threshold: f32,
    pub agent_search_threshold: f32,
    pub top_k: usize,
    pub context_max_chars: usize,
    pub summary_max_source_chars: usize,
    pub bug_keywords: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            bind_addr: "127.0.0.1:9000".to_string(),
            llm: LlmConfig::default(),
            llm_gate: GateConfig {
                max_concurrent: 1,
                cooldown_ms: 4_000,
                requests_per_minute: None,
                max_retries: 3,
                retry_base_ms: 2_000,
            },
            agent: AgentConfig::default(),
            web_search: WebSearchConfig {
                base_url: "https://api.tavily.com".to_string(),
                api_key: None,
            },
            github: GithubConfig {
                api_url: "https://api.github.com".to_string(),
                token: None,
                fetch_concurrency: 5,
            },
            retrieval: RetrievalConfig::default(),
            database_url: None,
        }
    }
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: "ollama".to_string(),
            base_url: "http://localhost:11434".to_string(),
            chat_model: "llama3.2".to_string(),
            embedding_model: "nomic-embed-text".to_string(),
            api_key: None,
            embedding_dim: 768,
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.groq.com/openai".to_string(),
            model: "llama-3.3-70b-versatile".to_string(),
            api_key: None,
            max_tokens: 12_000,
            max_steps: 6,
            gate: GateConfig {
                max_concurrent: 1,
                cooldown_ms: 0,
                requests_per_minute: Some(30),
                max_retries: 5,
                retry_base_ms: 2_000,
            },
        }
    }
}

pub const DEFAULT_BUG_KEYWORDS: &[&str] = &[
    "bug",
    "error",
    "vulnerability",
    "issue",
    "defect",
    "fix bug",
    "scan",
    "debug",
    "add",
];

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            ask_threshold: 0.5,
            bug_scan_threshold: 0.5,
            feature_threshold: 0.1,
            agent_search_threshold: 0.3,
            top_k: 10,
            context_max_chars: 60_000,
            summary_max_source_chars: 30_000,
            bug_keywords: DEFAULT_BUG_KEYWORDS.iter().map(|k| k.to_string()).collect(),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

impl Config {
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(dir) = std::env::var("REPO_QA_DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }
        if let Ok(addr) = std::env::var("REPO_QA_BIND_ADDR") {
            config.bind_addr = addr;
        }

        // Primary provider
        if let Ok(provider) = std::env::var("LLM_PROVIDER") {
            config.llm.provider = provider;
        }
        if let Ok(url) = std::env::var("LLM_BASE_URL") {
            config.llm.base_url = url;
        }
        if let Ok(model) = std::env::var("LLM_CHAT_MODEL") {
            config.llm.chat_model = model;
        }
        if let Ok(model) = std::env::var("LLM_EMBEDDING_MODEL") {
            config.llm.embedding_model = model;
        }
        if let Ok(key) = std::env::var("LLM_API_KEY") {
            config.llm.api_key = Some(key);
        }
        if let Some(dim) = env_parse("LLM_EMBEDDING_DIM") {
            config.llm.embedding_dim = dim;
        }
        if let Some(v) = env_parse("LLM_MAX_CONCURRENT") {
            config.llm_gate.max_concurrent = v;
        }
        if let Some(v) = env_parse("LLM_COOLDOWN_MS") {
            config.llm_gate.cooldown_ms = v;
        }
        if let Some(v) = env_parse("LLM_MAX_RETRIES") {
            config.llm_gate.max_retries = v;
        }
        if let Some(v) = env_parse("LLM_RETRY_BASE_MS") {
            config.llm_gate.retry_base_ms = v;
        }

        // Agent provider
        if let Ok(url) = std::env::var("AGENT_BASE_URL") {
            config.agent.base_url = url;
        }
        if let Ok(model) = std::env::var("AGENT_MODEL") {
            config.agent.model = model;
        }
        if let Ok(key) = std::env::var("AGENT_API_KEY") {
            config.agent.api_key = Some(key);
        }
        if let Some(v) = env_parse("AGENT_MAX_TOKENS") {
            config.agent.max_tokens = v;
        }
        if let Some(v) = env_parse::<u32>("AGENT_REQUESTS_PER_MINUTE") {
            config.agent.gate.requests_per_minute = Some(v);
        }
        if let Some(v) = env_parse("AGENT_MAX_RETRIES") {
            config.agent.gate.max_retries = v;
        }
        if let Some(v) = env_parse("AGENT_MAX_STEPS") {
            config.agent.max_steps = v;
        }

        // Web search
        if let Ok(key) = std::env::var("TAVILY_API_KEY") {
            config.web_search.api_key = Some(key);
        }
        if let Ok(url) = std::env::var("TAVILY_BASE_URL") {
            config.web_search.base_url = url;
        }

        // Repository access
        if let Ok(url) = std::env::var("GITHUB_API_URL") {
            config.github.api_url = url;
        }
        if let Ok(token) = std::env::var("GITHUB_TOKEN") {
            config.github.token = Some(token);
        }
        if let Some(v) = env_parse::<usize>("REPO_QA_FETCH_CONCURRENCY") {
            config.github.fetch_concurrency = v.max(1);
        }

        if let Ok(url) = std::env::var("DATABASE_URL") {
            if !url.trim().is_empty() {
                config.database_url = Some(url);
            }
        }

        // Retrieval policy
        let r = &mut config.retrieval;
        if let Some(v) = env_parse("ASK_THRESHOLD") {
            r.ask_threshold = v;
        }
        if let Some(v) = env_parse("BUG_SCAN_THRESHOLD") {
            r.bug_scan_threshold = v;
        }
        if let Some(v) = env_parse("FEATURE_THRESHOLD") {
            r.feature_threshold = v;
        }
        if let Some(v) = env_parse("AGENT_SEARCH_THRESHOLD") {
            r.agent_search_threshold = v;
        }
        if let Some(v) = env_parse("RETRIEVAL_TOP_K") {
            r.top_k = v;
        }
        if let Some(v) = env_parse("CONTEXT_MAX_CHARS") {
            r.context_max_chars = v;
        }
        if let Some(v) = env_parse("SUMMARY_MAX_SOURCE_CHARS") {
            r.summary_max_source_chars = v;
        }
        if let Ok(list) = std::env::var("BUG_KEYWORDS") {
            r.bug_keywords = parse_keywords(&list);
        }

        config
    }

    pub fn vector_dir(&self) -> PathBuf {
        self.data_dir.join("vectors")
    }

    pub fn projects_path(&self) -> PathBuf {
        self.data_dir.join("projects.json")
    }

    pub fn commits_path(&self) -> PathBuf {
        self.data_dir.join("commits.json")
    }

    pub fn answers_path(&self) -> PathBuf {
        self.data_dir.join("answers.json")
    }
}

/// Comma-separated, trimmed, lowercased, empties dropped.
fn parse_keywords(list: &str) -> Vec<String> {
    list.split(',')
        .map(|k| k.trim().to_lowercase())
        .filter(|k| !k.is_empty())
        .collect()
}
