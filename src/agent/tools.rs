//! The four tools the agent may call, and the reference list they feed.
//!
//! Tool failures are results, not errors: every call produces a JSON object
//! with `success` set, so the model can react and carry on.

use std::sync::Arc;

use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::agent::web_search::{SearchDepth, WebSearch};
use crate::error::Result;
use crate::gateway::ModelGateway;
use crate::llm::tools::{ToolCall, ToolSpec};
use crate::models::FileReference;
use crate::store::EmbeddingStore;

pub const READ_FILE: &str = "read_file";
pub const SEARCH_CODEBASE: &str = "search_codebase";
pub const GET_FILE_TREE: &str = "get_file_tree";
pub const WEB_SEARCH: &str = "web_search";

/// File content handed to the model is cut at this many characters.
pub const MAX_FILE_CONTENT_LENGTH: usize = 1500;
const TRUNCATED_MARKER: &str = "\n// ... truncated";
const SEARCH_LIMIT: usize = 5;
const SEARCH_SUMMARY_CHARS: usize = 150;
pub const FILE_TREE_LIMIT: usize = 30;

/// Paths containing any of these are left out of file listings.
pub const SKIP_FILES: &[&str] = &[
    "package-lock.json",
    "package.json",
    "yarn.lock",
    "pnpm-lock.yaml",
    "node_modules",
    ".git",
    ".next",
    "dist",
    "build",
    ".env",
    ".env.local",
];

pub fn is_skipped(path: &str) -> bool {
    SKIP_FILES.iter().any(|skip| path.contains(skip))
}

pub fn tool_specs() -> Vec<ToolSpec> {
    vec![
        ToolSpec {
            name: READ_FILE.into(),
            description: "Read the full content and summary of a file in the repository. \
                          Partial names are matched case-insensitively."
                .into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "fileName": { "type": "string", "description": "Path or part of the path of the file" }
                },
                "required": ["fileName"]
            }),
        },
        ToolSpec {
            name: SEARCH_CODEBASE.into(),
            description: "Semantic search over the repository's file summaries.".into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "query": { "type": "string", "description": "What to look for" }
                },
                "required": ["query"]
            }),
        },
        ToolSpec {
            name: GET_FILE_TREE.into(),
            description: "List files in the repository, optionally under one directory.".into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "directory": { "type": "string", "description": "Directory prefix, e.g. src/components" }
                }
            }),
        },
        ToolSpec {
            name: WEB_SEARCH.into(),
            description: "Search the web for documentation and best practices.".into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "query": { "type": "string" },
                    "searchDepth": { "type": "string", "enum": ["basic", "advanced"] }
                },
                "required": ["query"]
            }),
        },
    ]
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReadFileArgs {
    file_name: String,
}

#[derive(Deserialize)]
struct QueryArgs {
    query: String,
}

#[derive(Deserialize, Default)]
struct FileTreeArgs {
    #[serde(default)]
    directory: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WebSearchArgs {
    query: String,
    #[serde(default)]
    search_depth: SearchDepth,
}

/// Result of one tool call.
pub struct ToolOutcome {
    /// JSON handed back to the model.
    pub content: Value,
    /// Whether a new reference snapshot should be published.
    pub publish_references: bool,
}

impl ToolOutcome {
    fn quiet(content: Value) -> Self {
        Self {
            content,
            publish_references: false,
        }
    }
}

/// Executes tool calls for one agent run and keeps its reference list.
pub struct Toolbox {
    project_id: Uuid,
    gateway: Arc<ModelGateway>,
    store: Arc<dyn EmbeddingStore>,
    web: Arc<dyn WebSearch>,
    search_threshold: f32,
    references: Vec<FileReference>,
}

impl Toolbox {
    pub fn new(
        project_id: Uuid,
        gateway: Arc<ModelGateway>,
        store: Arc<dyn EmbeddingStore>,
        web: Arc<dyn WebSearch>,
        search_threshold: f32,
    ) -> Self {
        Self {
            project_id,
            gateway,
            store,
            web,
            search_threshold,
            references: Vec::new(),
        }
    }

    pub fn references(&self) -> &[FileReference] {
        &self.references
    }

    pub async fn execute(&mut self, call: &ToolCall) -> ToolOutcome {
        match call.name.as_str() {
            READ_FILE => match serde_json::from_value::<ReadFileArgs>(call.arguments.clone()) {
                Ok(args) => self.read_file(&args.file_name).await,
                Err(e) => ToolOutcome::quiet(invalid_arguments(&call.name, e)),
            },
            SEARCH_CODEBASE => match serde_json::from_value::<QueryArgs>(call.arguments.clone()) {
                Ok(args) => self.search_codebase(&args.query).await,
                Err(e) => ToolOutcome::quiet(invalid_arguments(&call.name, e)),
            },
            GET_FILE_TREE => {
                let args: FileTreeArgs =
                    serde_json::from_value(call.arguments.clone()).unwrap_or_default();
                ToolOutcome::quiet(self.file_tree(args.directory.as_deref()).await)
            }
            WEB_SEARCH => match serde_json::from_value::<WebSearchArgs>(call.arguments.clone()) {
                Ok(args) => ToolOutcome::quiet(self.web_search(&args.query, args.search_depth).await),
                Err(e) => ToolOutcome::quiet(invalid_arguments(&call.name, e)),
            },
            other => {
                tracing::warn!(tool = other, "Model requested an unknown tool");
                ToolOutcome::quiet(json!({ "success": false, "error": format!("Unknown tool \"{other}\".") }))
            }
        }
    }

    async fn read_file(&mut self, file_name: &str) -> ToolOutcome {
        match self.store.find_file(self.project_id, file_name).await {
            Ok(Some(record)) => {
                let content = truncate_content(&record.source_code);
                let payload = json!({
                    "success": true,
                    "fileName": record.file_name,
                    "summary": record.summary,
                    "content": content,
                });
                self.add_reference(record.reference());
                ToolOutcome {
                    content: payload,
                    publish_references: true,
                }
            }
            Ok(None) => ToolOutcome::quiet(json!({
                "success": false,
                "error": format!("File \"{file_name}\" not found."),
            })),
            Err(e) => {
                tracing::warn!(file = file_name, "read_file failed: {e}");
                ToolOutcome::quiet(json!({ "success": false, "error": "Failed to read file." }))
            }
        }
    }

    async fn search_codebase(&mut self, query: &str) -> ToolOutcome {
        let hits = match self.search(query).await {
            Ok(hits) => hits,
            Err(e) => {
                tracing::warn!(query, "search_codebase failed: {e}");
                return ToolOutcome::quiet(json!({ "success": false, "error": "Search failed." }));
            }
        };

        let results: Vec<Value> = hits
            .iter()
            .map(|hit| {
                json!({
                    "fileName": hit.record.file_name,
                    "summary": crate::ingest::truncate_chars(&hit.record.summary, SEARCH_SUMMARY_CHARS).0,
                    "relevance": format!("{:.0}%", hit.similarity * 100.0),
                })
            })
            .collect();
        for hit in &hits {
            self.add_reference(hit.record.reference());
        }

        ToolOutcome {
            content: json!({ "success": true, "results": results }),
            publish_references: true,
        }
    }

    async fn search(&self, query: &str) -> Result<Vec<crate::models::ScoredRecord>> {
        let vector = self.gateway.embed(query).await?;
        self.store
            .similarity_search(self.project_id, &vector, self.search_threshold, SEARCH_LIMIT)
            .await
    }

    async fn file_tree(&self, directory: Option<&str>) -> Value {
        let directory = directory.map(str::trim).filter(|d| !d.is_empty());
        match self.store.list_file_names(self.project_id, directory).await {
            Ok(names) => {
                let files: Vec<String> = names.into_iter().filter(|n| !is_skipped(n)).collect();
                json!({
                    "success": true,
                    "totalFiles": files.len(),
                    "files": &files[..files.len().min(FILE_TREE_LIMIT)],
                })
            }
            Err(e) => {
                tracing::warn!("get_file_tree failed: {e}");
                json!({ "success": false, "error": "Failed to get file tree." })
            }
        }
    }

    async fn web_search(&self, query: &str, depth: SearchDepth) -> Value {
        match self.web.search(query, depth).await {
            Ok(found) => json!({
                "success": true,
                "answer": found.answer.unwrap_or_else(|| "No direct answer available".to_string()),
                "results": found.results,
            }),
            Err(e) => {
                tracing::warn!(query, "web_search failed: {e}");
                json!({ "success": false, "error": "Web search failed." })
            }
        }
    }

    /// Deduplicated by file name; the first sighting wins.
    fn add_reference(&mut self, reference: FileReference) {
        if !self
            .references
            .iter()
            .any(|r| r.file_name == reference.file_name)
        {
            self.references.push(reference);
        }
    }
}

fn truncate_content(content: &str) -> String {
    match crate::ingest::truncate_chars(content, MAX_FILE_CONTENT_LENGTH) {
        (head, true) => format!("{head}{TRUNCATED_MARKER}"),
        (all, false) => all.to_string(),
    }
}

fn invalid_arguments(tool: &str, err: serde_json::Error) -> Value {
    json!({ "success": false, "error": format!("Invalid arguments for {tool}: {err}") })
}
