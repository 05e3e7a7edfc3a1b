//! HTTP error mapping for the REST + SSE surface.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;

use crate::error::{DatabaseError, TaskError};

/// Errors a handler can return; rendered as `{"error": "..."}`.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("{0}")]
    Task(#[from] TaskError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::TaskNotFound(_) => StatusCode::NOT_FOUND,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Database(e) => {
                tracing::error!(error = %e, "Database error in request handler");
                StatusCode::INTERNAL_SERVER_ERROR
            }
            ApiError::Task(TaskError::NotFound { .. }) => StatusCode::NOT_FOUND,
            ApiError::Task(TaskError::Terminal { .. } | TaskError::AlreadyRegistered { .. }) => {
                StatusCode::CONFLICT
            }
            ApiError::Task(TaskError::LaunchFailed { .. }) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Task(TaskError::Database(e)) => {
                tracing::error!(error = %e, "Database error in request handler");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        (status, Json(serde_json::json!({ "error": self.to_string() }))).into_response()
    }
}
