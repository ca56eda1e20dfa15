//! Summarize-and-embed stage and repository ingestion.
//!
//! Every file is submitted at once; the shared gateway does the pacing. A
//! failure while summarizing, embedding or storing one file is recorded on
//! that file and never touches its siblings. Only a repository that cannot be
//! resolved, or credentials the provider rejects, abort the whole run.

use std::sync::Arc;

use futures_util::future::join_all;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::gateway::ModelGateway;
use crate::models::{Candidate, SourceFile};
use crate::repo::RepositoryLoader;
use crate::store::{store_candidate, EmbeddingStore};

const TRUNCATION_MARKER: &str = "\n[... truncated: file continues beyond this point]";
const SKIPPED: &str = "skipped: ingestion stopped before this file was processed";

/// Turns source files into summarized, embedded candidates.
pub struct Summarizer {
    gateway: Arc<ModelGateway>,
    max_source_chars: usize,
}

/// Outcome of one ingestion run.
#[derive(Debug, Clone, Default)]
pub struct IngestReport {
    pub files_loaded: usize,
    /// Rows written, with or without an embedding.
    pub records_stored: usize,
    pub embedded: usize,
    /// `(file name, reason)` for files stored without an embedding or not stored at all.
    pub failures: Vec<(String, String)>,
}

impl Summarizer {
    pub fn new(gateway: Arc<ModelGateway>, max_source_chars: usize) -> Self {
        Self {
            gateway,
            max_source_chars,
        }
    }

    /// Summarize then embed every file. Output order matches input order.
    pub async fn process(&self, files: Vec<SourceFile>) -> Vec<Candidate> {
        self.process_batch(files, &CancellationToken::new()).await.0
    }

    /// Like [`Summarizer::process`], but also returns the first fatal provider
    /// error. After that error, or once `cancel` fires, files still waiting at
    /// the gateway are skipped without a provider call.
    async fn process_batch(
        &self,
        files: Vec<SourceFile>,
        cancel: &CancellationToken,
    ) -> (Vec<Candidate>, Option<Error>) {
        let batch = cancel.child_token();
        let fatal: Mutex<Option<Error>> = Mutex::new(None);
        let candidates = join_all(
            files
                .into_iter()
                .map(|f| self.process_file(f, &batch, &fatal)),
        )
        .await;
        (candidates, fatal.into_inner())
    }

    async fn process_file(
        &self,
        file: SourceFile,
        batch: &CancellationToken,
        fatal: &Mutex<Option<Error>>,
    ) -> Candidate {
        let mut candidate = Candidate {
            file_name: file.path,
            source_code: file.content,
            summary: String::new(),
            embedding: None,
            error: None,
        };

        let prompt = summary_prompt(&candidate.file_name, &candidate.source_code, self.max_source_chars);
        let summary = match self.gateway.generate_until(&prompt, batch).await {
            Ok(summary) => summary.trim().to_string(),
            Err(Error::Cancelled) => {
                candidate.error = Some(SKIPPED.into());
                return candidate;
            }
            Err(e) => {
                tracing::warn!(file = %candidate.file_name, "Summary failed: {e}");
                candidate.error = Some(e.to_string());
                record_fatal(fatal, batch, e);
                return candidate;
            }
        };

        if summary.is_empty() {
            tracing::warn!(file = %candidate.file_name, "Summary was empty, skipping embedding");
            candidate.error = Some("summary was empty".into());
            return candidate;
        }
        candidate.summary = summary;

        match self.gateway.embed_until(&candidate.summary, batch).await {
            Ok(vector) => {
                tracing::debug!(file = %candidate.file_name, "Summarized and embedded");
                candidate.embedding = Some(vector);
            }
            Err(Error::Cancelled) => candidate.error = Some(SKIPPED.into()),
            Err(e) => {
                tracing::warn!(file = %candidate.file_name, "Embedding failed: {e}");
                candidate.error = Some(e.to_string());
                record_fatal(fatal, batch, e);
            }
        }
        candidate
    }
}

/// Keep the first fatal error and stop the rest of the batch.
fn record_fatal(slot: &Mutex<Option<Error>>, batch: &CancellationToken, err: Error) {
    if err.is_fatal() {
        let mut slot = slot.lock();
        if slot.is_none() {
            *slot = Some(err);
        }
        batch.cancel();
    }
}

/// The summarize prompt for one file. Content over `max_chars` is cut on a
/// char boundary and marked as truncated.
pub fn summary_prompt(path: &str, content: &str, max_chars: usize) -> String {
    let (code, truncated) = truncate_chars(content, max_chars);
    let marker = if truncated { TRUNCATION_MARKER } else { "" };
    format!(
        "You are onboarding a junior software engineer and explaining to them the purpose of the {path} file.\n\
         Here is the code:\n\
         ---\n\
         {code}{marker}\n\
         ---\n\
         Give a very deep summary of the code in the file, explaining each part. \
         Start directly with the summary, without filler such as \"Okay\" or \"Alright\".\n\
         Very important: if there is any bug, describe the bug in detail after the summary."
    )
}

/// First `max_chars` characters of `s`, and whether anything was cut.
pub(crate) fn truncate_chars(s: &str, max_chars: usize) -> (&str, bool) {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => (&s[..idx], true),
        None => (s, false),
    }
}

/// Load, summarize, embed and store a whole repository for `project_id`.
///
/// Rows are written one by one, so a failed write only loses that file. When
/// `cancel` fires the run stops with [`Error::Cancelled`] and any rows it
/// already wrote for the project are removed again.
pub async fn ingest_repository(
    loader: &RepositoryLoader,
    summarizer: &Summarizer,
    store: &dyn EmbeddingStore,
    project_id: Uuid,
    url: &str,
    token: Option<&str>,
    cancel: &CancellationToken,
) -> Result<IngestReport> {
    let files = tokio::select! {
        _ = cancel.cancelled() => return Err(Error::Cancelled),
        files = loader.load(url, token) => files?,
    };
    let files_loaded = files.len();
    tracing::info!(%project_id, "Loaded {files_loaded} files from {url}");

    let (candidates, fatal) = summarizer.process_batch(files, cancel).await;
    if let Some(err) = fatal {
        return Err(err);
    }
    if cancel.is_cancelled() {
        return Err(Error::Cancelled);
    }

    let mut report = store_all(store, project_id, &candidates, cancel).await;
    report.files_loaded = files_loaded;
    store.flush().await?;

    if cancel.is_cancelled() {
        let removed = store.delete_project(project_id).await?;
        tracing::info!(%project_id, "Ingestion cancelled; removed {removed} records");
        return Err(Error::Cancelled);
    }

    tracing::info!(
        %project_id,
        stored = report.records_stored,
        embedded = report.embedded,
        failed = report.failures.len(),
        "Ingestion finished"
    );
    Ok(report)
}

/// Write candidates until done or cancelled. Row and vector writes are
/// counted separately.
async fn store_all(
    store: &dyn EmbeddingStore,
    project_id: Uuid,
    candidates: &[Candidate],
    cancel: &CancellationToken,
) -> IngestReport {
    let mut report = IngestReport::default();
    for candidate in candidates {
        if cancel.is_cancelled() {
            break;
        }
        let file_name = candidate.file_name.clone();
        match store_candidate(store, project_id, candidate).await {
            Ok(stored) => {
                report.records_stored += 1;
                if let Some(reason) = &candidate.error {
                    report.failures.push((file_name, reason.clone()));
                } else if let Some(e) = stored.vector_error {
                    tracing::warn!(file = %file_name, "Failed to store embedding: {e}");
                    report.failures.push((file_name, e.to_string()));
                } else {
                    report.embedded += 1;
                }
            }
            Err(e) => {
                tracing::warn!(file = %file_name, "Failed to store record: {e}");
                report.failures.push((file_name, e.to_string()));
            }
        }
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::{Gate, RateLimit, RetryPolicy};
    use crate::store::JsonEmbeddingStore;
    use crate::testing::{unpaced_gateway, MockModel};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn files(n: usize) -> Vec<SourceFile> {
        (0..n)
            .map(|i| SourceFile {
                path: format!("src/file_{i}.rs"),
                content: format!("pub fn f{i}() {{}}"),
            })
            .collect()
    }

    #[test]
    fn test_summary_prompt_includes_path_and_code() {
        let prompt = summary_prompt("src/cart.rs", "struct Cart;", 100);
        assert!(prompt.contains("src/cart.rs"));
        assert!(prompt.contains("struct Cart;"));
        assert!(!prompt.contains("truncated"));
    }

    #[test]
    fn test_summary_prompt_marks_truncation() {
        let content = "é".repeat(50);
        let prompt = summary_prompt("big.rs", &content, 10);
        assert!(prompt.contains(&"é".repeat(10)));
        assert!(!prompt.contains(&"é".repeat(11)));
        assert!(prompt.contains("[... truncated: file continues beyond this point]"));
    }

    #[test]
    fn test_truncate_chars() {
        assert_eq!(truncate_chars("hello", 10), ("hello", false));
        assert_eq!(truncate_chars("hello", 5), ("hello", false));
        assert_eq!(truncate_chars("hello", 2), ("he", true));
    }

    #[tokio::test]
    async fn test_one_failing_file_does_not_affect_siblings() {
        let model = Arc::new(MockModel::new().fail_summary_for("src/file_2.rs"));
        let summarizer = Summarizer::new(Arc::new(unpaced_gateway(model)), 1_000);

        let candidates = summarizer.process(files(5)).await;

        assert_eq!(candidates.len(), 5);
        let embedded = candidates.iter().filter(|c| c.embedding.is_some()).count();
        assert_eq!(embedded, 4);
        let failed: Vec<&Candidate> = candidates.iter().filter(|c| c.embedding.is_none()).collect();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].file_name, "src/file_2.rs");
        assert!(failed[0].error.is_some());
    }

    #[tokio::test]
    async fn test_empty_summary_skips_embedding() {
        struct Blank;
        #[async_trait::async_trait]
        impl crate::llm::LanguageModel for Blank {
            async fn generate(&self, _: &str) -> Result<String> {
                Ok("   ".into())
            }
            async fn embed(&self, _: &str) -> Result<Vec<f32>> {
                panic!("embedding must not run for an empty summary")
            }
            async fn stream(
                &self,
                _: Vec<crate::models::ChatMessage>,
            ) -> Result<crate::llm::TextStream> {
                unreachable!()
            }
        }

        let summarizer = Summarizer::new(Arc::new(unpaced_gateway(Arc::new(Blank))), 1_000);
        let candidates = summarizer.process(files(1)).await;
        assert!(candidates[0].embedding.is_none());
        assert_eq!(candidates[0].error.as_deref(), Some("summary was empty"));
    }

    #[tokio::test]
    async fn test_embeds_the_summary_not_the_code() {
        let model = Arc::new(MockModel::new().embed_rule("Summary of", vec![0.0, 1.0]));
        let summarizer = Summarizer::new(Arc::new(unpaced_gateway(model.clone())), 1_000);

        let candidates = summarizer.process(files(2)).await;
        assert!(candidates
            .iter()
            .all(|c| c.embedding.as_deref() == Some(&[0.0, 1.0][..])));
        assert_eq!(model.generate_calls(), 2);
        assert_eq!(model.embed_calls(), 2);
    }

    #[tokio::test]
    async fn test_auth_failure_aborts_the_batch() {
        let model = Arc::new(MockModel::new().failing_auth());
        let summarizer = Summarizer::new(Arc::new(unpaced_gateway(model)), 1_000);

        let (candidates, fatal) = summarizer
            .process_batch(files(3), &CancellationToken::new())
            .await;
        assert_eq!(candidates.len(), 3);
        assert!(candidates.iter().all(|c| c.embedding.is_none()));
        assert!(matches!(fatal, Some(Error::ProviderAuth { .. })));
    }

    /// Rejects the key only after a network round trip, like a real provider.
    struct SlowlyRejecting {
        calls: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl crate::llm::LanguageModel for SlowlyRejecting {
        async fn generate(&self, _: &str) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(5)).await;
            Err(Error::ProviderAuth {
                service: "mock".into(),
                message: "invalid key".into(),
            })
        }
        async fn embed(&self, _: &str) -> Result<Vec<f32>> {
            unreachable!("no summary ever succeeds")
        }
        async fn stream(&self, _: Vec<crate::models::ChatMessage>) -> Result<crate::llm::TextStream> {
            unreachable!()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_credentials_stop_queued_files() {
        let model = Arc::new(SlowlyRejecting {
            calls: AtomicUsize::new(0),
        });
        let gateway = ModelGateway::new(
            model.clone(),
            Gate::new(RateLimit::serial(Duration::ZERO), RetryPolicy::none()),
        );
        let summarizer = Summarizer::new(Arc::new(gateway), 1_000);

        let (candidates, fatal) = summarizer
            .process_batch(files(50), &CancellationToken::new())
            .await;

        assert_eq!(model.calls.load(Ordering::SeqCst), 1);
        assert!(matches!(fatal, Some(Error::ProviderAuth { .. })));
        assert_eq!(candidates.len(), 50);
        let skipped = candidates
            .iter()
            .filter(|c| c.error.as_deref() == Some(SKIPPED))
            .count();
        assert_eq!(skipped, 49);
    }

    #[tokio::test]
    async fn test_cancelled_batch_makes_no_provider_calls() {
        let model = Arc::new(MockModel::new());
        let summarizer = Summarizer::new(Arc::new(unpaced_gateway(model.clone())), 1_000);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let (candidates, fatal) = summarizer.process_batch(files(4), &cancel).await;
        assert!(fatal.is_none());
        assert!(candidates.iter().all(|c| c.embedding.is_none()));
        assert_eq!(model.generate_calls(), 0);
        assert_eq!(model.embed_calls(), 0);
    }

    /// Accepts rows but refuses every vector.
    struct NoVectors(JsonEmbeddingStore);

    #[async_trait::async_trait]
    impl EmbeddingStore for NoVectors {
        async fn upsert(&self, project_id: Uuid, file_name: &str, code: &str, summary: &str) -> Result<Uuid> {
            self.0.upsert(project_id, file_name, code, summary).await
        }
        async fn set_embedding(&self, _: Uuid, _: &[f32]) -> Result<()> {
            Err(Error::store("set embedding: disk full"))
        }
        async fn similarity_search(
            &self,
            project_id: Uuid,
            query: &[f32],
            threshold: f32,
            limit: usize,
        ) -> Result<Vec<crate::models::ScoredRecord>> {
            self.0.similarity_search(project_id, query, threshold, limit).await
        }
        async fn find_file(
            &self,
            project_id: Uuid,
            name: &str,
        ) -> Result<Option<crate::models::FileEmbeddingRecord>> {
            self.0.find_file(project_id, name).await
        }
        async fn list_file_names(&self, project_id: Uuid, prefix: Option<&str>) -> Result<Vec<String>> {
            self.0.list_file_names(project_id, prefix).await
        }
        async fn stats(&self, project_id: Uuid) -> Result<crate::store::ProjectStats> {
            self.0.stats(project_id).await
        }
        async fn delete_project(&self, project_id: Uuid) -> Result<usize> {
            self.0.delete_project(project_id).await
        }
    }

    #[tokio::test]
    async fn test_row_without_vector_still_counts_as_stored() {
        let dir = tempfile::tempdir().unwrap();
        let store = NoVectors(JsonEmbeddingStore::open_or_create(dir.path()).unwrap());
        let summarizer = Summarizer::new(Arc::new(unpaced_gateway(Arc::new(MockModel::new()))), 1_000);
        let project = Uuid::new_v4();
        let candidates = summarizer.process(files(3)).await;

        let report = store_all(&store, project, &candidates, &CancellationToken::new()).await;
        assert_eq!(report.records_stored, 3);
        assert_eq!(report.embedded, 0);
        assert_eq!(report.failures.len(), 3);
        assert_eq!(store.stats(project).await.unwrap().records, 3);
    }

    #[tokio::test]
    async fn test_store_all_stops_when_cancelled() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonEmbeddingStore::open_or_create(dir.path()).unwrap();
        let summarizer = Summarizer::new(Arc::new(unpaced_gateway(Arc::new(MockModel::new()))), 1_000);
        let candidates = summarizer.process(files(3)).await;
        let cancel = CancellationToken::new();
        cancel.cancel();

        let project = Uuid::new_v4();
        let report = store_all(&store, project, &candidates, &cancel).await;
        assert_eq!(report.records_stored, 0);
        assert_eq!(store.stats(project).await.unwrap().records, 0);
    }

    #[tokio::test]
    async fn test_storing_twice_does_not_duplicate() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonEmbeddingStore::open_or_create(dir.path()).unwrap();
        let model = Arc::new(MockModel::new());
        let summarizer = Summarizer::new(Arc::new(unpaced_gateway(model)), 1_000);
        let project = Uuid::new_v4();

        for _ in 0..2 {
            for candidate in summarizer.process(files(4)).await {
                store_candidate(&store, project, &candidate).await.unwrap();
            }
        }

        let stats = store.stats(project).await.unwrap();
        assert_eq!(stats.records, 4);
        assert_eq!(stats.embedded, 4);
    }
}
