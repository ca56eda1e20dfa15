use std::convert::Infallible;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, Sse};
use axum::Json;
use futures_util::stream::{self, Stream, StreamExt};
use uuid::Uuid;

use crate::answer::Answer;
use crate::api::{active_project, api_error, clean_prompt_input, sse_response, ApiError, Frame};
use crate::models::QuestionRequest;
use crate::state::AppState;

const MAX_QUESTION_LEN: usize = 4000;
const IDLE_TIMEOUT_SECS: u64 = 30;

#[derive(Clone, Copy)]
enum Flow {
    Ask,
    BugScan,
    Feature,
}

/// POST /api/projects/{id}/ask
pub async fn ask(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<QuestionRequest>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    respond(state, id, req, Flow::Ask).await
}

/// POST /api/projects/{id}/bug-scan
pub async fn bug_scan(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<QuestionRequest>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    respond(state, id, req, Flow::BugScan).await
}

/// POST /api/projects/{id}/feature
pub async fn feature(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<QuestionRequest>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    respond(state, id, req, Flow::Feature).await
}

async fn respond(
    state: AppState,
    id: Uuid,
    req: QuestionRequest,
    flow: Flow,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let question = clean_prompt_input(&req.question, MAX_QUESTION_LEN)?;
    active_project(&state, id)?;

    let permit = state
        .answer_semaphore
        .clone()
        .acquire_owned()
        .await
        .map_err(|_| {
            (
                StatusCode::SERVICE_UNAVAILABLE,
                "Answer service at capacity".to_string(),
            )
        })?;

    let answerer = &state.answerer;
    let answer = match flow {
        Flow::Ask => answerer.answer(id, &question).await,
        Flow::BugScan => answerer.scan_bugs(id, &question).await,
        Flow::Feature => answerer.feature_guidance(id, &question).await,
    }
    .map_err(api_error)?;

    let Answer { files_used, text } = answer;
    let frames = stream::once(async move { Ok(Frame::Files(files_used)) })
        .chain(text.map(|fragment| fragment.map(Frame::Delta)));

    Ok(sse_response(
        Box::pin(frames),
        Duration::from_secs(IDLE_TIMEOUT_SECS),
        permit,
    ))
}
