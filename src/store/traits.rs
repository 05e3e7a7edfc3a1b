//! `TaskStore` trait — single async interface for task and question persistence.

use async_trait::async_trait;

use crate::error::DatabaseError;
use crate::generation::model::Question;
use crate::tasks::model::{TaskRecord, TaskStatus};

/// Backend-agnostic persistence for generation tasks and their output.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;

    // ── Tasks ───────────────────────────────────────────────────────

    /// Insert a new task row.
    async fn create_task(&self, task: &TaskRecord) -> Result<(), DatabaseError>;

    /// Get a task by ID.
    async fn get_task(&self, id: &str) -> Result<Option<TaskRecord>, DatabaseError>;

    /// Move a task to `status`.
    ///
    /// Terminal rows are never rewritten. Returns `false` when the task does
    /// not exist or is already terminal. `error` is stored only for `FAILED`.
    async fn update_task_status(
        &self,
        id: &str,
        status: TaskStatus,
        error: Option<&str>,
    ) -> Result<bool, DatabaseError>;

    /// Record progress (already clamped into `[0, 1]`) and the current unit.
    async fn update_task_progress(
        &self,
        id: &str,
        progress: f64,
        current_unit: Option<&str>,
    ) -> Result<(), DatabaseError>;

    /// Store the unit plan and its length as `total_units`.
    async fn update_task_plan(&self, id: &str, units: &[String]) -> Result<(), DatabaseError>;

    /// All tasks with the given status, oldest first.
    async fn get_all_tasks(&self, status: TaskStatus) -> Result<Vec<TaskRecord>, DatabaseError>;

    /// Most recently created tasks first, up to `limit`.
    async fn list_tasks(&self, limit: usize) -> Result<Vec<TaskRecord>, DatabaseError>;

    // ── Questions ───────────────────────────────────────────────────

    /// Replace every question of one task chapter with `questions`.
    ///
    /// Re-running a chapter after a restart therefore never duplicates rows.
    async fn replace_questions(
        &self,
        task_id: &str,
        chapter: &str,
        questions: &[Question],
    ) -> Result<(), DatabaseError>;

    /// All questions of a task in chapter and position order.
    async fn list_questions(&self, task_id: &str) -> Result<Vec<Question>, DatabaseError>;
}
