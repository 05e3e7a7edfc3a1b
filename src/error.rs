//! Error types for Quiz Forge.

use std::time::Duration;

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// LLM provider errors.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Provider {provider} rate limited, retry after {retry_after:?}")]
    RateLimited {
        provider: String,
        retry_after: Option<Duration>,
    },

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },

    #[error("Authentication failed for provider {provider}")]
    AuthFailed { provider: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Task orchestration errors.
///
/// Control calls on unknown tasks are not errors (they return `false`);
/// these variants cover the few operations that can genuinely fail.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("Task {id} not found")]
    NotFound { id: String },

    #[error("Task {id} is already registered with the supervisor")]
    AlreadyRegistered { id: String },

    #[error("Task {id} is in terminal state {status}")]
    Terminal { id: String, status: String },

    #[error("Task {id} could not start: {reason}")]
    LaunchFailed { id: String, reason: String },

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

/// Errors raised by a job body while generating questions.
#[derive(Debug, thiserror::Error)]
pub enum GenerationError {
    #[error("Invalid task settings: {0}")]
    InvalidSettings(String),

    #[error("Document contains no usable content")]
    EmptyDocument,

    #[error("Question generation failed for chapter '{chapter}': {source}")]
    Chapter {
        chapter: String,
        #[source]
        source: LlmError,
    },

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}
