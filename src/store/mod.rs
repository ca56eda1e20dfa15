//! Project-scoped storage of per-file code, summary and embedding.

pub mod json;
pub mod postgres;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::models::{Candidate, FileEmbeddingRecord, ScoredRecord};

pub use json::JsonEmbeddingStore;
pub use postgres::PgEmbeddingStore;

/// Row counts for one project.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProjectStats {
    pub records: usize,
    pub embedded: usize,
}

#[async_trait]
pub trait EmbeddingStore: Send + Sync {
    /// Insert the row for `(project_id, file_name)`, or overwrite the existing
    /// one in place. The embedding is cleared either way. Returns the row id.
    async fn upsert(
        &self,
        project_id: Uuid,
        file_name: &str,
        source_code: &str,
        summary: &str,
    ) -> Result<Uuid>;

    async fn set_embedding(&self, id: Uuid, embedding: &[f32]) -> Result<()>;

    /// Rows of `project_id` whose similarity (`1 - cosine distance`) to
    /// `query` is above `threshold`, best first, at most `limit`. Rows without
    /// an embedding never match. Ties keep insertion order.
    async fn similarity_search(
        &self,
        project_id: Uuid,
        query: &[f32],
        threshold: f32,
        limit: usize,
    ) -> Result<Vec<ScoredRecord>>;

    /// Exact file name first, otherwise the shortest name containing `name`
    /// case-insensitively.
    async fn find_file(&self, project_id: Uuid, name: &str) -> Result<Option<FileEmbeddingRecord>>;

    /// Sorted file names, optionally limited to a case-insensitive prefix.
    async fn list_file_names(&self, project_id: Uuid, prefix: Option<&str>) -> Result<Vec<String>>;

    async fn stats(&self, project_id: Uuid) -> Result<ProjectStats>;

    /// Remove every row of the project. Returns the number removed.
    async fn delete_project(&self, project_id: Uuid) -> Result<usize>;

    /// Make buffered writes durable. Backends that write through do nothing.
    async fn flush(&self) -> Result<()> {
        Ok(())
    }
}

/// A candidate whose row was written.
#[derive(Debug)]
pub struct StoredCandidate {
    pub id: Uuid,
    /// Set when the vector write failed; the row stays without an embedding.
    pub vector_error: Option<Error>,
}

/// Persist one candidate: the row first, then the vector as a separate write.
///
/// Only a failed row write is an `Err`. A failed vector write leaves the row
/// (code and summary) in place and is reported on the [`StoredCandidate`].
pub async fn store_candidate(
    store: &dyn EmbeddingStore,
    project_id: Uuid,
    candidate: &Candidate,
) -> Result<StoredCandidate> {
    let id = store
        .upsert(
            project_id,
            &candidate.file_name,
            &candidate.source_code,
            &candidate.summary,
        )
        .await?;

    let vector_error = match &candidate.embedding {
        Some(embedding) => store.set_embedding(id, embedding).await.err(),
        None => None,
    };
    Ok(StoredCandidate { id, vector_error })
}

/// Cosine similarity; 0.0 for mismatched or zero-length vectors.
pub(crate) fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom == 0.0 {
        0.0
    } else {
        dot / denom
    }
}
