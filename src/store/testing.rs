//! Fault-injecting `TaskStore` wrapper for tests.

use std::time::Duration;

use async_trait::async_trait;

use super::{LibSqlBackend, TaskStore};
use crate::error::DatabaseError;
use crate::generation::model::Question;
use crate::tasks::model::{TaskRecord, TaskStatus};

/// In-memory libSQL store that can stall one kind of status write or fail
/// one status listing.
pub(crate) struct FaultyStore {
    inner: LibSqlBackend,
    slow_status: Option<(TaskStatus, Duration)>,
    failing_listing: Option<TaskStatus>,
}

impl FaultyStore {
    pub(crate) async fn new() -> Self {
        Self {
            inner: LibSqlBackend::new_memory().await.unwrap(),
            slow_status: None,
            failing_listing: None,
        }
    }

    /// Sleep `delay` before every write that moves a task to `status`.
    pub(crate) fn delay_status_write(mut self, status: TaskStatus, delay: Duration) -> Self {
        self.slow_status = Some((status, delay));
        self
    }

    /// Make `get_all_tasks(status)` fail.
    pub(crate) fn fail_listing(mut self, status: TaskStatus) -> Self {
        self.failing_listing = Some(status);
        self
    }
}

#[async_trait]
impl TaskStore for FaultyStore {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        self.inner.run_migrations().await
    }

    async fn create_task(&self, task: &TaskRecord) -> Result<(), DatabaseError> {
        self.inner.create_task(task).await
    }

    async fn get_task(&self, id: &str) -> Result<Option<TaskRecord>, DatabaseError> {
        self.inner.get_task(id).await
    }

    async fn update_task_status(
        &self,
        id: &str,
        status: TaskStatus,
        error: Option<&str>,
    ) -> Result<bool, DatabaseError> {
        if let Some((slow, delay)) = self.slow_status {
            if slow == status {
                tokio::time::sleep(delay).await;
            }
        }
        self.inner.update_task_status(id, status, error).await
    }

    async fn update_task_progress(
        &self,
        id: &str,
        progress: f64,
        current_unit: Option<&str>,
    ) -> Result<(), DatabaseError> {
        self.inner.update_task_progress(id, progress, current_unit).await
    }

    async fn update_task_plan(&self, id: &str, units: &[String]) -> Result<(), DatabaseError> {
        self.inner.update_task_plan(id, units).await
    }

    async fn get_all_tasks(&self, status: TaskStatus) -> Result<Vec<TaskRecord>, DatabaseError> {
        if self.failing_listing == Some(status) {
            return Err(DatabaseError::Query(format!(
                "get_all_tasks: disk I/O error listing {status}"
            )));
        }
        self.inner.get_all_tasks(status).await
    }

    async fn list_tasks(&self, limit: usize) -> Result<Vec<TaskRecord>, DatabaseError> {
        self.inner.list_tasks(limit).await
    }

    async fn replace_questions(
        &self,
        task_id: &str,
        chapter: &str,
        questions: &[Question],
    ) -> Result<(), DatabaseError> {
        self.inner.replace_questions(task_id, chapter, questions).await
    }

    async fn list_questions(&self, task_id: &str) -> Result<Vec<Question>, DatabaseError> {
        self.inner.list_questions(task_id).await
    }
}
