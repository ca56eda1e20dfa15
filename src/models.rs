use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A linked repository
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: Uuid,
    pub name: String,
    pub repository_url: String,
    pub status: ProjectStatus,
    pub created_at: DateTime<Utc>,
    pub ingested_at: Option<DateTime<Utc>>,
    /// Records written by the last ingestion
    #[serde(default)]
    pub file_count: usize,
    #[serde(default)]
    pub deleted_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ProjectStatus {
    Ingesting,
    Ready,
    Failed(String),
}

/// A file produced by the repository loader. Never persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceFile {
    pub path: String,
    pub content: String,
}

/// Output of the summarize-and-embed stage for one file.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub file_name: String,
    pub source_code: String,
    pub summary: String,
    pub embedding: Option<Vec<f32>>,
    pub error: Option<String>,
}

/// Per-file row of the vector index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileEmbeddingRecord {
    pub id: Uuid,
    pub project_id: Uuid,
    pub file_name: String,
    pub source_code: String,
    pub summary: String,
    /// `None` when summarizing or embedding failed; such rows never match a search.
    pub embedding: Option<Vec<f32>>,
}

impl FileEmbeddingRecord {
    pub fn reference(&self) -> FileReference {
        FileReference {
            file_name: self.file_name.clone(),
            source_code: self.source_code.clone(),
            summary: self.summary.clone(),
        }
    }
}

/// A record with its cosine similarity to a query.
#[derive(Debug, Clone)]
pub struct ScoredRecord {
    pub record: FileEmbeddingRecord,
    pub similarity: f32,
}

/// The code an answer was grounded in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct FileReference {
    pub file_name: String,
    pub source_code: String,
    pub summary: String,
}

/// A summarized commit of a project's default branch
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Commit {
    pub id: Uuid,
    pub project_id: Uuid,
    pub sha: String,
    pub message: String,
    pub author_name: String,
    pub author_avatar: String,
    pub committed_at: DateTime<Utc>,
    pub summary: String,
}

/// A question and answer the user chose to keep
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SavedAnswer {
    pub id: Uuid,
    pub project_id: Uuid,
    pub question: String,
    pub answer: String,
    pub files_references: Vec<FileReference>,
    pub created_at: DateTime<Utc>,
}

/// Create-project request
#[derive(Debug, Clone, Deserialize)]
pub struct CreateProjectRequest {
    pub name: String,
    #[serde(alias = "github_url")]
    pub repository_url: String,
    /// Used for this ingestion only; never persisted
    pub github_token: Option<String>,
}

/// Ask, bug-scan and feature requests
#[derive(Debug, Clone, Deserialize)]
pub struct QuestionRequest {
    pub question: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SaveAnswerRequest {
    pub question: String,
    pub answer: String,
    #[serde(default)]
    pub files_references: Vec<FileReference>,
}

/// A single chat turn (system, user or assistant)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}
