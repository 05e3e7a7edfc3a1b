//! REST + SSE endpoints for quiz generation tasks.

use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{
        IntoResponse,
        sse::{Event, Sse},
    },
    routing::{get, post},
};
use serde::Deserialize;
use tokio_stream::{Stream, StreamExt};
use tracing::{info, warn};

use super::error::ApiError;
use super::stream::{StreamSettings, progress_stream};
use crate::config::ServiceConfig;
use crate::generation::model::{Difficulty, GenerationSettings};
use crate::tasks::model::ProgressEvent;
use crate::tasks::runner::{ControlOutcome, TaskRunner};

const DEFAULT_LIST_LIMIT: usize = 50;
const MAX_LIST_LIMIT: usize = 500;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub runner: Arc<TaskRunner>,
    pub config: Arc<ServiceConfig>,
}

/// Build the Axum router with task REST and progress stream routes.
pub fn task_routes(runner: Arc<TaskRunner>, config: ServiceConfig) -> Router {
    let state = AppState {
        runner,
        config: Arc::new(config),
    };

    Router::new()
        .route("/health", get(health))
        .route("/api/tasks", get(list_tasks).post(create_task))
        .route("/api/tasks/running", get(list_running))
        .route("/api/tasks/{id}", get(get_task))
        .route("/api/tasks/{id}/status", get(task_status))
        .route("/api/tasks/{id}/stream", get(stream_task))
        .route("/api/tasks/{id}/questions", get(list_questions))
        .route("/api/tasks/{id}/pause", post(pause_task))
        .route("/api/tasks/{id}/resume", post(resume_task))
        .route("/api/tasks/{id}/cancel", post(cancel_task))
        .with_state(state)
}

// ── Health ──────────────────────────────────────────────────────────────

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "quiz-forge",
        "running": state.runner.list_running().await.len(),
    }))
}

// ── Tasks ───────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct CreateTaskRequest {
    title: String,
    document: String,
    questions_per_chapter: Option<usize>,
    difficulty: Option<Difficulty>,
    max_chapter_chars: Option<usize>,
}

async fn create_task(
    State(state): State<AppState>,
    Json(body): Json<CreateTaskRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let title = body.title.trim();
    if title.is_empty() {
        return Err(ApiError::BadRequest("title must not be empty".to_string()));
    }

    let mut settings = GenerationSettings::new(body.document);
    if let Some(count) = body.questions_per_chapter {
        settings.questions_per_chapter = count;
    }
    if let Some(difficulty) = body.difficulty {
        settings.difficulty = difficulty;
    }
    if let Some(max_chars) = body.max_chapter_chars {
        settings.max_chapter_chars = max_chars;
    }
    settings
        .validate()
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;

    let task = state
        .runner
        .create_task(title, settings.to_value(), 0)
        .await?;
    state.runner.launch(&task.id).await?;
    info!(task_id = %task.id, "Task submitted via API");

    Ok((StatusCode::CREATED, Json(task)))
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    limit: Option<usize>,
}

async fn list_tasks(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let limit = query.limit.unwrap_or(DEFAULT_LIST_LIMIT).clamp(1, MAX_LIST_LIMIT);
    let tasks = state.runner.store().list_tasks(limit).await?;
    Ok(Json(tasks))
}

async fn list_running(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.runner.list_running().await)
}

async fn get_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    match state.runner.store().get_task(&id).await? {
        Some(task) => Ok(Json(task)),
        None => Err(ApiError::TaskNotFound(id)),
    }
}

async fn task_status(State(state): State<AppState>, Path(id): Path<String>) -> impl IntoResponse {
    Json(
        state
            .runner
            .hub()
            .get_last_state(&id)
            .unwrap_or_else(ProgressEvent::not_started),
    )
}

async fn list_questions(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    if state.runner.store().get_task(&id).await?.is_none() {
        return Err(ApiError::TaskNotFound(id));
    }
    let questions = state.runner.store().list_questions(&id).await?;
    Ok(Json(questions))
}

// ── Progress stream ─────────────────────────────────────────────────────

async fn stream_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let task = state
        .runner
        .store()
        .get_task(&id)
        .await?
        .ok_or_else(|| ApiError::TaskNotFound(id.clone()))?;

    // Finished before this process started: nothing will ever be published.
    let fallback = task.status.is_terminal().then(|| {
        ProgressEvent::new(
            task.status,
            task.progress,
            task.current_unit.clone(),
            task.error_message
                .clone()
                .unwrap_or_else(|| format!("Task {}", task.status.as_str().to_lowercase())),
        )
    });

    let settings = StreamSettings {
        heartbeat_interval: state.config.heartbeat_interval,
        max_duration: state.config.stream_max_duration,
    };
    info!(task_id = %id, "Progress stream opened");

    let events = progress_stream(Arc::clone(state.runner.hub()), id, settings, fallback).filter_map(
        |event| match serde_json::to_string(&event) {
            Ok(json) => Some(Ok::<_, Infallible>(Event::default().data(json))),
            Err(e) => {
                warn!(error = %e, "Failed to serialize progress event");
                None
            }
        },
    );

    Ok(Sse::new(events))
}

// ── Control ─────────────────────────────────────────────────────────────

fn control_response(id: String, outcome: ControlOutcome) -> impl IntoResponse {
    match outcome {
        ControlOutcome::Applied { status } => (
            StatusCode::OK,
            Json(serde_json::json!({ "task_id": id, "status": status })),
        ),
        ControlOutcome::NotFound => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": format!("Task not found or not controllable: {id}") })),
        ),
    }
}

async fn pause_task(State(state): State<AppState>, Path(id): Path<String>) -> impl IntoResponse {
    let outcome = state.runner.pause(&id).await;
    control_response(id, outcome)
}

async fn resume_task(State(state): State<AppState>, Path(id): Path<String>) -> impl IntoResponse {
    let outcome = state.runner.resume(&id).await;
    control_response(id, outcome)
}

async fn cancel_task(State(state): State<AppState>, Path(id): Path<String>) -> impl IntoResponse {
    let outcome = state.runner.cancel(&id).await;
    control_response(id, outcome)
}
