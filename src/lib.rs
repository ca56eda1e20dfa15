//! # repo-qa
//!
//! Link a GitHub repository, have every file summarized and embedded, then
//! ask questions answered from the retrieved code.
//!
//! ## Architecture
//!
//! ```text
//!  ┌──────────────┐   files    ┌──────────────┐  candidates  ┌────────────────┐
//!  │ GitHub walk  │ ─────────► │ Summarize +  │ ───────────► │ Embedding store│
//!  │ (repo)       │            │ embed        │              │ (per project)  │
//!  └──────────────┘            │ (ingest)     │              └───────┬────────┘
//!                              └──────┬───────┘                      │ similarity
//!                                     │                              ▼
//!                              ┌──────▼───────┐              ┌────────────────┐
//!                              │ ModelGateway │ ◄─────────── │ Answerer/Agent │
//!                              │ limit, retry │              │ (answer, agent)│
//!                              └──────────────┘              └───────┬────────┘
//!                                                                    │ SSE
//!                                                                    ▼
//!                                                              axum handlers
//! ```
//!
//! ## Module Overview
//!
//! - [`config`] - Environment-based configuration: providers, gates, thresholds
//! - [`error`] - Error taxonomy shared by the pipeline
//! - [`models`] - Projects, records, references, commits, request types
//! - [`gateway`] - Rate limiter, retry policy and the gated model facades
//! - [`llm`] - Provider adapters: completion, streaming chat, embeddings, tool calling
//! - [`repo`] - GitHub tree walk, ignore policy, commits and diffs
//! - [`ingest`] - Summarize-and-embed stage and repository ingestion
//! - [`store`] - Project-scoped vector store (JSON file or pgvector)
//! - [`answer`] - Retrieval-augmented answering with keyword refusal
//! - [`agent`] - Tool-using agent for feature planning
//! - [`commits`] - Commit summaries
//! - [`api`] - Axum handlers
//! - [`state`] - Shared application state and persistence

pub mod agent;
pub mod answer;
pub mod api;
pub mod commits;
pub mod config;
pub mod error;
pub mod gateway;
pub mod ingest;
pub mod llm;
pub mod models;
pub mod repo;
pub mod state;
pub mod store;

#[cfg(test)]
pub(crate) mod testing;

pub use error::{Error, Result};
