//! HTTP surface: task REST endpoints and SSE progress streams.

pub mod error;
pub mod routes;
pub mod stream;

use std::sync::Arc;

use axum::Router;
use tower_http::cors::{Any, CorsLayer};

use crate::config::ServiceConfig;
use crate::tasks::TaskRunner;

pub use error::ApiError;
pub use routes::{AppState, task_routes};
pub use stream::{StreamSettings, progress_stream};

/// The full application router, with permissive CORS for browser clients.
pub fn build_router(runner: Arc<TaskRunner>, config: ServiceConfig) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    task_routes(runner, config).layer(cors)
}
