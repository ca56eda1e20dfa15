//! HTTP surface. Answers stream as Server-Sent Events: one or more `files`
//! events, `delta` events with text, then exactly one `done` or `error`.

pub mod agent;
pub mod answers;
pub mod ask;
pub mod commits;
pub mod projects;

use std::convert::Infallible;
use std::pin::Pin;
use std::time::Duration;

use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::routing::{delete, get, post};
use axum::Router;
use futures_util::stream::{self, Stream, StreamExt};
use tokio::sync::OwnedSemaphorePermit;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::models::{FileReference, Project};
use crate::state::AppState;

pub type ApiError = (StatusCode, String);

/// One unit of streamed answer output.
#[derive(Debug)]
pub enum Frame {
    Files(Vec<FileReference>),
    Delta(String),
}

pub type FrameStream = Pin<Box<dyn Stream<Item = Result<Frame>> + Send>>;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/projects", get(projects::list_projects).post(projects::create_project))
        .route("/api/projects/{id}", delete(projects::delete_project))
        .route("/api/projects/{id}/files", get(projects::list_files))
        .route("/api/projects/{id}/commits", get(commits::list_commits))
        .route("/api/projects/{id}/commits/sync", post(commits::sync_commits))
        .route("/api/projects/{id}/ask", post(ask::ask))
        .route("/api/projects/{id}/bug-scan", post(ask::bug_scan))
        .route("/api/projects/{id}/feature", post(ask::feature))
        .route("/api/projects/{id}/agent", post(agent::agent))
        .route(
            "/api/projects/{id}/answers",
            get(answers::list_answers).post(answers::save_answer),
        )
        .with_state(state)
}

/// Turn answer frames into SSE events.
///
/// The stream ends after the first error, or with an error once `idle`
/// passes without a frame. The permit is held until the stream is dropped.
pub fn sse_response(
    frames: FrameStream,
    idle: Duration,
    permit: OwnedSemaphorePermit,
) -> Sse<impl Stream<Item = std::result::Result<Event, Infallible>>> {
    let events = stream::unfold(Some(frames), move |state| async move {
        let mut frames = state?;
        let event = match tokio::time::timeout(idle, frames.next()).await {
            Ok(Some(Ok(frame))) => return Some((frame_event(frame), Some(frames))),
            Ok(Some(Err(e))) => error_event(&e.to_string()),
            Ok(None) => Event::default().event("done").data("{}"),
            Err(_) => error_event("response timed out (idle)"),
        };
        Some((event, None))
    });

    let events = events.map(move |event| {
        let _permit = &permit;
        Ok::<_, Infallible>(event)
    });

    Sse::new(events).keep_alive(KeepAlive::default())
}

fn frame_event(frame: Frame) -> Event {
    match frame {
        Frame::Files(files) => Event::default()
            .event("files")
            .data(serde_json::json!({ "files": files }).to_string()),
        Frame::Delta(content) => Event::default()
            .event("delta")
            .data(serde_json::json!({ "content": content }).to_string()),
    }
}

fn error_event(message: &str) -> Event {
    Event::default()
        .event("error")
        .data(serde_json::json!({ "message": message }).to_string())
}

/// Status code for a pipeline error surfaced before streaming starts.
pub fn api_error(err: Error) -> ApiError {
    let status = match &err {
        Error::RepositoryAccess { .. } | Error::Config(_) => StatusCode::BAD_REQUEST,
        Error::RateLimited { .. } => StatusCode::SERVICE_UNAVAILABLE,
        Error::ProviderAuth { .. } | Error::Provider { .. } | Error::Embedding(_) | Error::Http(_) => {
            StatusCode::BAD_GATEWAY
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    tracing::warn!(%status, "Request failed: {err}");
    (status, err.to_string())
}

/// The project, unless it does not exist or was deleted.
pub fn active_project(state: &AppState, id: Uuid) -> std::result::Result<Project, ApiError> {
    state
        .projects
        .read()
        .iter()
        .find(|p| p.id == id && p.deleted_at.is_none())
        .cloned()
        .ok_or_else(|| (StatusCode::NOT_FOUND, "Project not found".to_string()))
}

/// Trim and bound user text destined for a prompt.
pub fn clean_prompt_input(text: &str, max_chars: usize) -> std::result::Result<String, ApiError> {
    let text = text.trim();
    if text.is_empty() {
        return Err((StatusCode::BAD_REQUEST, "Question is required".to_string()));
    }
    let (text, _) = crate::ingest::truncate_chars(text, max_chars);
    Ok(crate::answer::sanitize_for_prompt(text))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    async fn permit() -> OwnedSemaphorePermit {
        Arc::new(tokio::sync::Semaphore::new(1))
            .acquire_owned()
            .await
            .unwrap()
    }

    async fn event_count(frames: Vec<Result<Frame>>, idle: Duration) -> usize {
        let sse = sse_response(Box::pin(stream::iter(frames)), idle, permit().await);
        // Sse is opaque; drive the inner stream through the response body
        let body = axum::response::IntoResponse::into_response(sse).into_body();
        let bytes = axum::body::to_bytes(body, usize::MAX).await.unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        text.matches("event: ").count()
    }

    #[tokio::test]
    async fn test_stream_ends_with_single_done() {
        let frames = vec![
            Ok(Frame::Files(Vec::new())),
            Ok(Frame::Delta("a".into())),
            Ok(Frame::Delta("b".into())),
        ];
        assert_eq!(event_count(frames, Duration::from_secs(5)).await, 4);
    }

    #[tokio::test]
    async fn test_error_terminates_stream_without_done() {
        let sse = sse_response(
            Box::pin(stream::iter(vec![
                Ok(Frame::Delta("partial".into())),
                Err(Error::Stream("connection reset".into())),
                Ok(Frame::Delta("never".into())),
            ])),
            Duration::from_secs(5),
            permit().await,
        );
        let body = axum::response::IntoResponse::into_response(sse).into_body();
        let bytes = axum::body::to_bytes(body, usize::MAX).await.unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();

        assert!(text.contains("event: delta"));
        assert!(text.contains("event: error"));
        assert!(text.contains("connection reset"));
        assert!(!text.contains("never"));
        assert!(!text.contains("event: done"));
    }

    #[test]
    fn test_api_error_status_mapping() {
        let (status, _) = api_error(Error::repository("https://github.com/a/b", "not found"));
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let (status, _) = api_error(Error::RateLimited {
            service: "llm".into(),
            retry_after: None,
        });
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        let (status, _) = api_error(Error::store("disk full"));
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_clean_prompt_input() {
        assert!(clean_prompt_input("   ", 10).is_err());
        assert_eq!(clean_prompt_input("  hello world ", 5).unwrap(), "hello");
        assert_eq!(clean_prompt_input("<|im_start|>hi", 100).unwrap(), "hi");
    }
}
