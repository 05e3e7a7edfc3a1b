//! Job bodies and the context they run with.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{DatabaseError, GenerationError};
use crate::store::TaskStore;
use crate::tasks::model::{TaskRecord, TaskStatus, clamp_progress};
use crate::tasks::progress::ProgressHub;
use crate::tasks::supervisor::TaskSupervisor;

/// How a job body finished when it did not fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    /// All work done; `message` becomes the final progress message.
    Completed { message: String },
    /// A checkpoint returned `false` and the body stopped early.
    Cancelled,
}

impl JobOutcome {
    pub fn completed(message: impl Into<String>) -> Self {
        Self::Completed {
            message: message.into(),
        }
    }
}

/// The work performed for a task.
///
/// Bodies must call [`JobContext::checkpoint`] between units of work;
/// that is where pause and cancel requests take effect.
#[async_trait]
pub trait JobBody: Send + Sync {
    async fn run(&self, ctx: &JobContext) -> Result<JobOutcome, GenerationError>;
}

/// Everything a running body may touch.
pub struct JobContext {
    task: TaskRecord,
    store: Arc<dyn TaskStore>,
    supervisor: Arc<TaskSupervisor>,
    hub: Arc<ProgressHub>,
}

impl JobContext {
    pub(crate) fn new(
        task: TaskRecord,
        store: Arc<dyn TaskStore>,
        supervisor: Arc<TaskSupervisor>,
        hub: Arc<ProgressHub>,
    ) -> Self {
        Self {
            task,
            store,
            supervisor,
            hub,
        }
    }

    pub fn task_id(&self) -> &str {
        &self.task.id
    }

    /// Input payload the task was created with.
    pub fn settings(&self) -> &serde_json::Value {
        &self.task.settings
    }

    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.store
    }

    /// Wait while paused; `false` means stop now.
    pub async fn checkpoint(&self) -> bool {
        self.supervisor.checkpoint(&self.task.id).await
    }

    /// Persist progress and broadcast a `PROCESSING` event.
    pub async fn report(
        &self,
        progress: f64,
        current_unit: Option<&str>,
        message: impl Into<String>,
    ) -> Result<(), DatabaseError> {
        let progress = clamp_progress(progress);
        self.store
            .update_task_progress(&self.task.id, progress, current_unit)
            .await?;
        self.hub.publish(
            &self.task.id,
            progress,
            current_unit.map(str::to_string),
            message,
            TaskStatus::Processing,
        );
        Ok(())
    }

    /// Persist the unit plan (and `total_units`).
    pub async fn set_plan(&self, units: &[String]) -> Result<(), DatabaseError> {
        self.store.update_task_plan(&self.task.id, units).await
    }
}
