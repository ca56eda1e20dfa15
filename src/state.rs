use anyhow::Context;
use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::agent::web_search::{TavilyClient, WebSearch};
use crate::agent::Agent;
use crate::answer::Answerer;
use crate::config::Config;
use crate::gateway::{Gate, GatedToolModel, ModelGateway};
use crate::ingest::Summarizer;
use crate::llm::tools::{OpenAiToolModel, ToolCallingModel};
use crate::llm::{HttpLanguageModel, LanguageModel};
use crate::models::{Commit, Project, SavedAnswer};
use crate::repo::RepositoryLoader;
use crate::store::{EmbeddingStore, JsonEmbeddingStore, PgEmbeddingStore};

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub projects: Arc<RwLock<Vec<Project>>>,
    pub commits: Arc<RwLock<Vec<Commit>>>,
    pub answers: Arc<RwLock<Vec<SavedAnswer>>>,
    pub store: Arc<dyn EmbeddingStore>,
    pub gateway: Arc<ModelGateway>,
    pub loader: Arc<RepositoryLoader>,
    pub summarizer: Arc<Summarizer>,
    pub answerer: Arc<Answerer>,
    pub agent: Agent,
    /// Cancellation handles of running ingestions, by project
    pub ingestions: Arc<Mutex<HashMap<Uuid, CancellationToken>>>,
    pub ingest_semaphore: Arc<tokio::sync::Semaphore>,
    pub answer_semaphore: Arc<tokio::sync::Semaphore>,
}

/// Provider-facing components, swappable for tests.
pub struct Providers {
    pub store: Arc<dyn EmbeddingStore>,
    pub model: Arc<dyn LanguageModel>,
    pub tool_model: Arc<dyn ToolCallingModel>,
    pub web: Arc<dyn WebSearch>,
    pub http_client: reqwest::Client,
}

impl AppState {
    /// Build state from configuration: HTTP providers, and pgvector when
    /// `DATABASE_URL` is set, the JSON store otherwise.
    pub async fn new(config: Config) -> anyhow::Result<Self> {
        let http_client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(120))
            .build()?;

        let store: Arc<dyn EmbeddingStore> = match &config.database_url {
            Some(url) => Arc::new(
                PgEmbeddingStore::connect(url, config.llm.embedding_dim)
                    .await
                    .context("connecting to the vector database")?,
            ),
            None => Arc::new(
                JsonEmbeddingStore::open_or_create(&config.vector_dir())
                    .context("opening the vector store")?,
            ),
        };

        let providers = Providers {
            store,
            model: Arc::new(HttpLanguageModel::new(http_client.clone(), config.llm.clone())),
            tool_model: Arc::new(OpenAiToolModel::new(http_client.clone(), config.agent.clone())),
            web: Arc::new(TavilyClient::new(http_client.clone(), config.web_search.clone())),
            http_client,
        };
        Self::with_providers(config, providers)
    }

    /// Wire the pipeline around already-built providers. Each provider gets
    /// exactly one gate, shared by every component that calls it.
    pub fn with_providers(config: Config, providers: Providers) -> anyhow::Result<Self> {
        std::fs::create_dir_all(&config.data_dir)
            .with_context(|| format!("creating {}", config.data_dir.display()))?;

        let projects = load_json(&config.projects_path())?;
        let commits = load_json(&config.commits_path())?;
        let answers = load_json(&config.answers_path())?;

        let gateway = Arc::new(ModelGateway::new(
            providers.model,
            Gate::new(config.llm_gate.rate_limit(), config.llm_gate.retry_policy()),
        ));
        let tool_model: Arc<dyn ToolCallingModel> = Arc::new(GatedToolModel::new(
            providers.tool_model,
            Gate::new(config.agent.gate.rate_limit(), config.agent.gate.retry_policy()),
        ));

        let loader = Arc::new(RepositoryLoader::new(providers.http_client, &config.github));
        let summarizer = Arc::new(Summarizer::new(
            gateway.clone(),
            config.retrieval.summary_max_source_chars,
        ));
        let answerer = Arc::new(Answerer::new(
            gateway.clone(),
            providers.store.clone(),
            config.retrieval.clone(),
        ));
        let agent = Agent::new(
            tool_model,
            gateway.clone(),
            providers.store.clone(),
            providers.web,
            config.agent.max_steps,
            config.retrieval.agent_search_threshold,
        );

        Ok(Self {
            config,
            projects: Arc::new(RwLock::new(projects)),
            commits: Arc::new(RwLock::new(commits)),
            answers: Arc::new(RwLock::new(answers)),
            store: providers.store,
            gateway,
            loader,
            summarizer,
            answerer,
            agent,
            ingestions: Arc::new(Mutex::new(HashMap::new())),
            ingest_semaphore: Arc::new(tokio::sync::Semaphore::new(2)),
            answer_semaphore: Arc::new(tokio::sync::Semaphore::new(3)),
        })
    }

    pub fn persist_projects(&self) {
        persist_json(&self.config.projects_path(), &*self.projects.read());
    }

    pub fn persist_commits(&self) {
        persist_json(&self.config.commits_path(), &*self.commits.read());
    }

    pub fn persist_answers(&self) {
        persist_json(&self.config.answers_path(), &*self.answers.read());
    }
}

fn load_json<T: DeserializeOwned>(path: &Path) -> anyhow::Result<Vec<T>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let data =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    Ok(serde_json::from_str(&data).unwrap_or_else(|e| {
        tracing::warn!("Ignoring unreadable {}: {e}", path.display());
        Vec::new()
    }))
}

/// Atomic write via temp file + rename. Failures are logged, not returned.
fn persist_json<T: Serialize>(path: &Path, items: &[T]) {
    let data = match serde_json::to_string_pretty(items) {
        Ok(data) => data,
        Err(e) => {
            tracing::error!("Failed to serialize {}: {e}", path.display());
            return;
        }
    };
    let tmp_path = path.with_extension("json.tmp");
    if let Err(e) = std::fs::write(&tmp_path, &data).and_then(|_| std::fs::rename(&tmp_path, path)) {
        tracing::error!("Failed to persist {}: {e}", path.display());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ProjectStatus;
    use chrono::Utc;
    use uuid::Uuid;

    #[test]
    fn test_persist_and_reload_projects() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("projects.json");
        let project = Project {
            id: Uuid::new_v4(),
            name: "shop".into(),
            repository_url: "https://github.com/acme/shop".into(),
            status: ProjectStatus::Ready,
            created_at: Utc::now(),
            ingested_at: None,
            file_count: 3,
            deleted_at: None,
        };

        persist_json(&path, std::slice::from_ref(&project));
        let loaded: Vec<Project> = load_json(&path).unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id, project.id);
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn test_missing_or_corrupt_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let missing: Vec<Commit> = load_json(&dir.path().join("nope.json")).unwrap();
        assert!(missing.is_empty());

        let corrupt = dir.path().join("commits.json");
        std::fs::write(&corrupt, "{not json").unwrap();
        let loaded: Vec<Commit> = load_json(&corrupt).unwrap();
        assert!(loaded.is_empty());
    }
}
