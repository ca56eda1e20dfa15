use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::api::{active_project, api_error, ApiError};
use crate::error::Error;
use crate::ingest::ingest_repository;
use crate::models::{CreateProjectRequest, Project, ProjectStatus};
use crate::repo::parse_repo_url;
use crate::state::AppState;

/// GET /api/projects - Active projects, newest first
pub async fn list_projects(State(state): State<AppState>) -> Json<Vec<Project>> {
    let mut projects: Vec<Project> = state
        .projects
        .read()
        .iter()
        .filter(|p| p.deleted_at.is_none())
        .cloned()
        .collect();
    projects.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    Json(projects)
}

/// POST /api/projects - Link a repository (ingest + commit sync in background)
pub async fn create_project(
    State(state): State<AppState>,
    Json(req): Json<CreateProjectRequest>,
) -> Result<(StatusCode, Json<Project>), ApiError> {
    let name = req.name.trim().to_string();
    if name.is_empty() {
        return Err((StatusCode::BAD_REQUEST, "Name is required".to_string()));
    }
    let url = req.repository_url.trim().to_string();
    parse_repo_url(&url).map_err(api_error)?;

    {
        let projects = state.projects.read();
        if projects
            .iter()
            .any(|p| p.deleted_at.is_none() && p.repository_url == url)
        {
            return Err((
                StatusCode::CONFLICT,
                "This repository is already linked".to_string(),
            ));
        }
    }

    let project = Project {
        id: Uuid::new_v4(),
        name,
        repository_url: url.clone(),
        status: ProjectStatus::Ingesting,
        created_at: Utc::now(),
        ingested_at: None,
        file_count: 0,
        deleted_at: None,
    };

    {
        let mut projects = state.projects.write();
        projects.push(project.clone());
        drop(projects);
        state.persist_projects();
    }

    let token = req.github_token.filter(|t| !t.trim().is_empty());
    spawn_ingestion(state, project.id, url, token);

    Ok((StatusCode::CREATED, Json(project)))
}

/// Ingest then sync commits in the background. Deleting the project cancels
/// the run through the token registered in [`AppState::ingestions`].
pub(crate) fn spawn_ingestion(
    state: AppState,
    project_id: Uuid,
    url: String,
    token: Option<String>,
) -> JoinHandle<()> {
    let cancel = CancellationToken::new();
    state.ingestions.lock().insert(project_id, cancel.clone());

    tokio::spawn(async move {
        let result = ingest_and_sync(&state, project_id, &url, token.as_deref(), &cancel).await;
        state.ingestions.lock().remove(&project_id);
        match result {
            Ok(()) => {}
            Err(_) if cancel.is_cancelled() => {
                tracing::info!(%project_id, "Ingestion of {url} stopped: project deleted");
            }
            Err(e) => {
                tracing::error!(%project_id, "Failed to ingest {url}: {e:#}");
                update_project_status(&state, project_id, ProjectStatus::Failed(format!("{e:#}")));
            }
        }
    })
}

async fn ingest_and_sync(
    state: &AppState,
    project_id: Uuid,
    url: &str,
    token: Option<&str>,
    cancel: &CancellationToken,
) -> anyhow::Result<()> {
    let _permit = tokio::select! {
        _ = cancel.cancelled() => return Err(Error::Cancelled.into()),
        permit = state.ingest_semaphore.clone().acquire_owned() => permit?,
    };

    let report = ingest_repository(
        &state.loader,
        &state.summarizer,
        state.store.as_ref(),
        project_id,
        url,
        token,
        cancel,
    )
    .await?;

    {
        let mut projects = state.projects.write();
        let Some(project) = projects
            .iter_mut()
            .find(|p| p.id == project_id && p.deleted_at.is_none())
        else {
            return Ok(());
        };
        project.status = ProjectStatus::Ready;
        project.ingested_at = Some(Utc::now());
        project.file_count = report.records_stored;
        drop(projects);
        state.persist_projects();
    }

    if cancel.is_cancelled() {
        return Ok(());
    }
    // Commit history is best-effort; the project is usable without it
    if let Err(e) = crate::api::commits::sync_project_commits(state, project_id, url, token).await {
        tracing::warn!(%project_id, "Commit sync failed: {e}");
    }
    Ok(())
}

/// DELETE /api/projects/{id} - Soft delete; a running ingestion is cancelled
/// and embedding records are removed
pub async fn delete_project(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    active_project(&state, id)?;

    {
        let mut projects = state.projects.write();
        if let Some(project) = projects.iter_mut().find(|p| p.id == id) {
            project.deleted_at = Some(Utc::now());
        }
        drop(projects);
        state.persist_projects();
    }

    let running = state.ingestions.lock().remove(&id);
    if let Some(cancel) = running {
        cancel.cancel();
    }

    match state.store.delete_project(id).await {
        Ok(removed) => tracing::info!(project_id = %id, "Removed {removed} embedding records"),
        Err(e) => tracing::warn!(project_id = %id, "Failed to delete embeddings: {e}"),
    }

    Ok(StatusCode::NO_CONTENT)
}

/// GET /api/projects/{id}/files - Stored file names
pub async fn list_files(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<String>>, ApiError> {
    active_project(&state, id)?;
    let names = state
        .store
        .list_file_names(id, None)
        .await
        .map_err(api_error)?;
    Ok(Json(names))
}

/// Deleted projects keep the status they had when they were deleted.
pub(crate) fn update_project_status(state: &AppState, id: Uuid, status: ProjectStatus) {
    let mut projects = state.projects.write();
    let Some(project) = projects
        .iter_mut()
        .find(|p| p.id == id && p.deleted_at.is_none())
    else {
        return;
    };
    project.status = status;
    drop(projects);
    state.persist_projects();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use async_trait::async_trait;
    use mockito::Matcher;
    use tokio::sync::{Notify, Semaphore};

    use crate::agent::tools::tests::StubWeb;
    use crate::config::Config;
    use crate::error::Result;
    use crate::llm::{LanguageModel, TextStream};
    use crate::models::ChatMessage;
    use crate::store::EmbeddingStore;
    use crate::state::Providers;
    use crate::store::JsonEmbeddingStore;
    use crate::testing::ScriptedToolModel;

    /// Summaries block until the test releases them.
    struct HeldModel {
        entered: Notify,
        release: Semaphore,
        generate_calls: AtomicUsize,
    }

    #[async_trait]
    impl LanguageModel for HeldModel {
        async fn generate(&self, _: &str) -> Result<String> {
            self.generate_calls.fetch_add(1, Ordering::SeqCst);
            self.entered.notify_one();
            let _released = self.release.acquire().await;
            Ok("A summary.".into())
        }
        async fn embed(&self, _: &str) -> Result<Vec<f32>> {
            Ok(vec![1.0, 0.0])
        }
        async fn stream(&self, _: Vec<ChatMessage>) -> Result<TextStream> {
            unreachable!()
        }
    }

    async fn github_with_two_files() -> mockito::ServerGuard {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/repos/acme/shop")
            .with_body(r#"{"default_branch":"main"}"#)
            .create_async()
            .await;
        server
            .mock("GET", "/repos/acme/shop/git/trees/main")
            .match_query(Matcher::Any)
            .with_body(r#"{"tree":[{"path":"a.rs","type":"blob"},{"path":"b.rs","type":"blob"}]}"#)
            .create_async()
            .await;
        for name in ["a.rs", "b.rs"] {
            server
                .mock("GET", format!("/repos/acme/shop/contents/{name}").as_str())
                .match_query(Matcher::Any)
                .with_body("pub fn f() {}")
                .create_async()
                .await;
        }
        server
    }

    #[tokio::test]
    async fn test_delete_during_ingestion_leaves_no_records() {
        let server = github_with_two_files().await;
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config {
            data_dir: dir.path().to_path_buf(),
            ..Config::default()
        };
        config.github.api_url = server.url();
        config.llm_gate.cooldown_ms = 0;

        let model = Arc::new(HeldModel {
            entered: Notify::new(),
            release: Semaphore::new(0),
            generate_calls: AtomicUsize::new(0),
        });
        let store = Arc::new(JsonEmbeddingStore::open_or_create(&config.vector_dir()).unwrap());
        let providers = Providers {
            store: store.clone(),
            model: model.clone(),
            tool_model: Arc::new(ScriptedToolModel::new(Vec::new())),
            web: Arc::new(StubWeb { fail: true }),
            http_client: reqwest::Client::new(),
        };
        let state = AppState::with_providers(config, providers).unwrap();

        let project = Project {
            id: Uuid::new_v4(),
            name: "shop".into(),
            repository_url: "https://github.com/acme/shop".into(),
            status: ProjectStatus::Ingesting,
            created_at: Utc::now(),
            ingested_at: None,
            file_count: 0,
            deleted_at: None,
        };
        let id = project.id;
        state.projects.write().push(project.clone());

        let task = spawn_ingestion(state.clone(), id, project.repository_url, None);
        model.entered.notified().await;

        let status = delete_project(State(state.clone()), Path(id)).await.unwrap();
        assert_eq!(status, StatusCode::NO_CONTENT);
        model.release.add_permits(10);
        task.await.unwrap();

        // The second file was still queued at the gateway and never summarized
        assert_eq!(model.generate_calls.load(Ordering::SeqCst), 1);
        assert_eq!(store.stats(id).await.unwrap().records, 0);
        let projects = state.projects.read();
        let deleted = projects.iter().find(|p| p.id == id).unwrap();
        assert!(deleted.deleted_at.is_some());
        assert_eq!(deleted.status, ProjectStatus::Ingesting);
        assert!(state.ingestions.lock().is_empty());
    }

    #[test]
    fn test_status_of_deleted_project_is_frozen() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            data_dir: dir.path().to_path_buf(),
            ..Config::default()
        };
        let providers = Providers {
            store: Arc::new(JsonEmbeddingStore::open_or_create(&config.vector_dir()).unwrap()),
            model: Arc::new(crate::testing::MockModel::new()),
            tool_model: Arc::new(ScriptedToolModel::new(Vec::new())),
            web: Arc::new(StubWeb { fail: true }),
            http_client: reqwest::Client::new(),
        };
        let state = AppState::with_providers(config, providers).unwrap();
        let id = Uuid::new_v4();
        state.projects.write().push(Project {
            id,
            name: "gone".into(),
            repository_url: "https://github.com/acme/gone".into(),
            status: ProjectStatus::Ingesting,
            created_at: Utc::now(),
            ingested_at: None,
            file_count: 0,
            deleted_at: Some(Utc::now()),
        });

        update_project_status(&state, id, ProjectStatus::Ready);
        assert_eq!(state.projects.read()[0].status, ProjectStatus::Ingesting);
    }
}
