use std::convert::Infallible;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, Sse};
use axum::Json;
use futures_util::stream::{self, Stream, StreamExt};
use uuid::Uuid;

use crate::api::{active_project, clean_prompt_input, sse_response, ApiError, Frame};
use crate::models::QuestionRequest;
use crate::state::AppState;

const MAX_REQUEST_LEN: usize = 4000;
/// Agent steps wait on rate-limited providers, so gaps are long.
const IDLE_TIMEOUT_SECS: u64 = 180;

/// POST /api/projects/{id}/agent - Multi-tool feature planning over SSE
///
/// `files` events carry the growing reference list and interleave with
/// `delta` events.
pub async fn agent(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<QuestionRequest>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let request = clean_prompt_input(&req.question, MAX_REQUEST_LEN)?;
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

    let run = state.agent.run(id, request);
    let frames = stream::select(
        run.references.map(|snapshot| snapshot.map(Frame::Files)),
        run.text.map(|fragment| fragment.map(Frame::Delta)),
    );

    Ok(sse_response(
        Box::pin(frames),
        Duration::from_secs(IDLE_TIMEOUT_SECS),
        permit,
    ))
}
