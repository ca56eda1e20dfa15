use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::models::{FileEmbeddingRecord, ScoredRecord};
use crate::store::{cosine_similarity, EmbeddingStore, ProjectStats};

#[derive(Debug, Default, Serialize, Deserialize)]
struct Snapshot {
    next_seq: u64,
    entries: Vec<Entry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Entry {
    /// Insertion order; kept when a row is overwritten.
    seq: u64,
    record: FileEmbeddingRecord,
}

/// In-memory embedding store with disk persistence and cosine similarity search.
///
/// Row and vector writes stay in memory until [`EmbeddingStore::flush`], which
/// rewrites `vectors.json` once through a temp file and rename. Deleting a
/// project flushes right away.
pub struct JsonEmbeddingStore {
    state: RwLock<Snapshot>,
    persist_path: PathBuf,
    dirty: AtomicBool,
    flush_lock: tokio::sync::Mutex<()>,
}

impl JsonEmbeddingStore {
    pub fn open_or_create(vector_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(vector_dir)?;
        let persist_path = vector_dir.join("vectors.json");

        let state = if persist_path.exists() {
            let data = std::fs::read_to_string(&persist_path)?;
            serde_json::from_str(&data).unwrap_or_else(|e| {
                tracing::warn!("Ignoring unreadable vector store {}: {e}", persist_path.display());
                Snapshot::default()
            })
        } else {
            Snapshot::default()
        };

        Ok(Self {
            state: RwLock::new(state),
            persist_path,
            dirty: AtomicBool::new(false),
            flush_lock: tokio::sync::Mutex::new(()),
        })
    }

    fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl EmbeddingStore for JsonEmbeddingStore {
    async fn upsert(
        &self,
        project_id: Uuid,
        file_name: &str,
        source_code: &str,
        summary: &str,
    ) -> Result<Uuid> {
        let mut state = self.state.write();

        let existing = state
            .entries
            .iter_mut()
            .find(|e| e.record.project_id == project_id && e.record.file_name == file_name);

        let id = match existing {
            Some(entry) => {
                entry.record.source_code = source_code.to_string();
                entry.record.summary = summary.to_string();
                entry.record.embedding = None;
                entry.record.id
            }
            None => {
                let id = Uuid::new_v4();
                let seq = state.next_seq;
                state.next_seq += 1;
                state.entries.push(Entry {
                    seq,
                    record: FileEmbeddingRecord {
                        id,
                        project_id,
                        file_name: file_name.to_string(),
                        source_code: source_code.to_string(),
                        summary: summary.to_string(),
                        embedding: None,
                    },
                });
                id
            }
        };

        self.mark_dirty();
        Ok(id)
    }

    async fn set_embedding(&self, id: Uuid, embedding: &[f32]) -> Result<()> {
        let mut state = self.state.write();
        let entry = state
            .entries
            .iter_mut()
            .find(|e| e.record.id == id)
            .ok_or_else(|| Error::store(format!("set embedding: no record {id}")))?;
        entry.record.embedding = Some(embedding.to_vec());
        self.mark_dirty();
        Ok(())
    }

    async fn similarity_search(
        &self,
        project_id: Uuid,
        query: &[f32],
        threshold: f32,
        limit: usize,
    ) -> Result<Vec<ScoredRecord>> {
        let state = self.state.read();

        // Entries are kept in seq order, so the stable sort breaks ties by insertion.
        let mut scored: Vec<(f32, &FileEmbeddingRecord)> = state
            .entries
            .iter()
            .filter(|e| e.record.project_id == project_id)
            .filter_map(|e| {
                let embedding = e.record.embedding.as_deref()?;
                Some((cosine_similarity(query, embedding), &e.record))
            })
            .filter(|(score, _)| *score > threshold)
            .collect();

        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(limit);

        Ok(scored
            .into_iter()
            .map(|(similarity, record)| ScoredRecord {
                record: record.clone(),
                similarity,
            })
            .collect())
    }

    async fn find_file(&self, project_id: Uuid, name: &str) -> Result<Option<FileEmbeddingRecord>> {
        let state = self.state.read();
        let in_project: Vec<&Entry> = state
            .entries
            .iter()
            .filter(|e| e.record.project_id == project_id)
            .collect();

        if let Some(exact) = in_project.iter().find(|e| e.record.file_name == name) {
            return Ok(Some(exact.record.clone()));
        }

        let needle = name.to_lowercase();
        let best = in_project
            .iter()
            .filter(|e| e.record.file_name.to_lowercase().contains(&needle))
            .min_by_key(|e| (e.record.file_name.len(), e.seq));
        Ok(best.map(|e| e.record.clone()))
    }

    async fn list_file_names(&self, project_id: Uuid, prefix: Option<&str>) -> Result<Vec<String>> {
        let state = self.state.read();
        let prefix = prefix.map(str::to_lowercase);

        let mut names: Vec<String> = state
            .entries
            .iter()
            .filter(|e| e.record.project_id == project_id)
            .filter(|e| match &prefix {
                Some(p) => e.record.file_name.to_lowercase().starts_with(p.as_str()),
                None => true,
            })
            .map(|e| e.record.file_name.clone())
            .collect();
        names.sort();
        Ok(names)
    }

    async fn stats(&self, project_id: Uuid) -> Result<ProjectStats> {
        let state = self.state.read();
        let mut stats = ProjectStats::default();
        for e in state.entries.iter().filter(|e| e.record.project_id == project_id) {
            stats.records += 1;
            if e.record.embedding.is_some() {
                stats.embedded += 1;
            }
        }
        Ok(stats)
    }

    async fn delete_project(&self, project_id: Uuid) -> Result<usize> {
        let removed = {
            let mut state = self.state.write();
            let before = state.entries.len();
            state.entries.retain(|e| e.record.project_id != project_id);
            before - state.entries.len()
        };
        self.mark_dirty();
        self.flush().await?;
        Ok(removed)
    }

    async fn flush(&self) -> Result<()> {
        let _flushing = self.flush_lock.lock().await;
        if !self.dirty.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        let data = {
            let state = self.state.read();
            serde_json::to_string(&*state)?
        };
        let path = self.persist_path.clone();
        let tmp_path = path.with_extension("json.tmp");
        let written = tokio::task::spawn_blocking(move || -> std::io::Result<()> {
            std::fs::write(&tmp_path, data)?;
            std::fs::rename(&tmp_path, &path)
        })
        .await
        .map_err(|e| Error::store_with_source("flush vector store", e))?;

        if let Err(e) = written {
            self.mark_dirty();
            return Err(Error::store_with_source("write vector store", e));
        }
        tracing::debug!("Flushed vector store to {}", self.persist_path.display());
        Ok(())
    }
}
