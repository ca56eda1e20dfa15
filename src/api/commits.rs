use axum::extract::{Path, State};
use axum::Json;
use uuid::Uuid;

use crate::api::{active_project, api_error, ApiError};
use crate::models::Commit;
use crate::state::AppState;

/// GET /api/projects/{id}/commits - Stored commits, newest first
pub async fn list_commits(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<Commit>>, ApiError> {
    active_project(&state, id)?;
    let mut commits: Vec<Commit> = state
        .commits
        .read()
        .iter()
        .filter(|c| c.project_id == id)
        .cloned()
        .collect();
    commits.sort_by(|a, b| b.committed_at.cmp(&a.committed_at));
    Ok(Json(commits))
}

/// POST /api/projects/{id}/commits/sync - Summarize commits not seen yet
pub async fn sync_commits(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<Commit>>, ApiError> {
    let project = active_project(&state, id)?;
    let added = sync_project_commits(&state, id, &project.repository_url, None)
        .await
        .map_err(api_error)?;
    Ok(Json(added))
}

/// Fetch, summarize and store the project's new commits. Returns the ones added.
pub(crate) async fn sync_project_commits(
    state: &AppState,
    project_id: Uuid,
    repository_url: &str,
    token: Option<&str>,
) -> crate::error::Result<Vec<Commit>> {
    let known: Vec<String> = state
        .commits
        .read()
        .iter()
        .filter(|c| c.project_id == project_id)
        .map(|c| c.sha.clone())
        .collect();

    let added = crate::commits::sync_commits(
        &state.loader,
        &state.gateway,
        project_id,
        repository_url,
        token,
        &known,
    )
    .await?;

    if !added.is_empty() {
        let mut commits = state.commits.write();
        // A concurrent sync may have stored some of these already
        for commit in &added {
            if !commits
                .iter()
                .any(|c| c.project_id == project_id && c.sha == commit.sha)
            {
                commits.push(commit.clone());
            }
        }
        drop(commits);
        state.persist_commits();
    }
    Ok(added)
}
