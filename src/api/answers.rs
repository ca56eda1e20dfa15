use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::Utc;
use uuid::Uuid;

use crate::api::{active_project, ApiError};
use crate::models::{SaveAnswerRequest, SavedAnswer};
use crate::state::AppState;

/// GET /api/projects/{id}/answers - Saved answers, newest first
pub async fn list_answers(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<SavedAnswer>>, ApiError> {
    active_project(&state, id)?;
    let mut answers: Vec<SavedAnswer> = state
        .answers
        .read()
        .iter()
        .filter(|a| a.project_id == id)
        .cloned()
        .collect();
    answers.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    Ok(Json(answers))
}

/// POST /api/projects/{id}/answers - Keep a question, its answer and references
///
/// References that do not have the `{fileName, sourceCode, summary}` shape are
/// rejected by the JSON extractor.
pub async fn save_answer(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<SaveAnswerRequest>,
) -> Result<(StatusCode, Json<SavedAnswer>), ApiError> {
    active_project(&state, id)?;
    if req.question.trim().is_empty() || req.answer.trim().is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            "Question and answer are required".to_string(),
        ));
    }

    let saved = SavedAnswer {
        id: Uuid::new_v4(),
        project_id: id,
        question: req.question,
        answer: req.answer,
        files_references: req.files_references,
        created_at: Utc::now(),
    };

    {
        let mut answers = state.answers.write();
        answers.push(saved.clone());
        drop(answers);
        state.persist_answers();
    }

    Ok((StatusCode::CREATED, Json(saved)))
}
