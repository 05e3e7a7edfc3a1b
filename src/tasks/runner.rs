//! Task runner — creates tasks, launches supervised executions, and applies
//! operator control requests to both the live registry and the store.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{GenerationError, TaskError};
use crate::store::TaskStore;
use crate::tasks::job::{JobBody, JobContext, JobOutcome};
use crate::tasks::model::{TaskRecord, TaskStatus};
use crate::tasks::progress::ProgressHub;
use crate::tasks::supervisor::TaskSupervisor;

/// Result of an operator control request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlOutcome {
    /// The request took effect; `status` is what the task now reports.
    Applied { status: TaskStatus },
    /// No live or resumable task with that id.
    NotFound,
}

/// Owns the collaborators every execution needs.
pub struct TaskRunner {
    store: Arc<dyn TaskStore>,
    supervisor: Arc<TaskSupervisor>,
    hub: Arc<ProgressHub>,
    body: Arc<dyn JobBody>,
}

impl TaskRunner {
    pub fn new(
        store: Arc<dyn TaskStore>,
        supervisor: Arc<TaskSupervisor>,
        hub: Arc<ProgressHub>,
        body: Arc<dyn JobBody>,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            supervisor,
            hub,
            body,
        })
    }

    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.store
    }

    pub fn supervisor(&self) -> &Arc<TaskSupervisor> {
        &self.supervisor
    }

    pub fn hub(&self) -> &Arc<ProgressHub> {
        &self.hub
    }

    /// Persist a new `PENDING` task.
    pub async fn create_task(
        &self,
        title: impl Into<String>,
        settings: serde_json::Value,
        total_units: i64,
    ) -> Result<TaskRecord, TaskError> {
        let task = TaskRecord::new(title, settings, total_units);
        self.store.create_task(&task).await?;
        info!(task_id = %task.id, title = %task.title, "Task created");
        Ok(task)
    }

    /// Spawn a supervised execution for a stored, non-terminal task.
    ///
    /// The body does not start until the supervisor has accepted the
    /// registration, so control requests can never miss a live execution.
    pub async fn launch(self: &Arc<Self>, task_id: &str) -> Result<(), TaskError> {
        let task = self
            .store
            .get_task(task_id)
            .await?
            .ok_or_else(|| TaskError::NotFound {
                id: task_id.to_string(),
            })?;
        if task.status.is_terminal() {
            return Err(TaskError::Terminal {
                id: task.id,
                status: task.status.to_string(),
            });
        }

        let (start_tx, start_rx) = oneshot::channel::<CancellationToken>();
        let runner = Arc::clone(self);
        let handle = tokio::spawn(async move {
            // Dropped sender = registration refused.
            let Ok(cancel) = start_rx.await else {
                return;
            };
            runner.execute(task, cancel).await;
        });

        let cancel = self.supervisor.register(task_id, handle).await?;
        if start_tx.send(cancel).is_err() {
            self.supervisor.unregister(task_id).await;
            return Err(TaskError::LaunchFailed {
                id: task_id.to_string(),
                reason: "execution exited before start".to_string(),
            });
        }

        info!(task_id = %task_id, "Task launched");
        Ok(())
    }

    async fn execute(self: Arc<Self>, task: TaskRecord, cancel: CancellationToken) {
        let task_id = task.id.clone();

        match self
            .store
            .update_task_status(&task_id, TaskStatus::Processing, None)
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                warn!(task_id = %task_id, "Task became terminal before it started");
                self.supervisor.unregister(&task_id).await;
                return;
            }
            Err(e) => {
                error!(task_id = %task_id, error = %e, "Failed to mark task processing");
                self.supervisor.unregister(&task_id).await;
                return;
            }
        }
        // A pause that landed before the row flipped to PROCESSING still holds.
        let started_paused = self.supervisor.is_paused(&task_id).await == Some(true);
        if started_paused && !self.persist_status(&task_id, TaskStatus::Paused).await {
            warn!(task_id = %task_id, "Early pause was not persisted");
        }
        self.hub.publish(
            &task_id,
            task.progress,
            task.current_unit.clone(),
            "Task started",
            if started_paused {
                TaskStatus::Paused
            } else {
                TaskStatus::Processing
            },
        );

        let ctx = JobContext::new(
            task,
            Arc::clone(&self.store),
            Arc::clone(&self.supervisor),
            Arc::clone(&self.hub),
        );

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            result = self.body.run(&ctx) => Some(result),
        };
        drop(ctx);

        self.finish(&task_id, result).await;
    }

    /// Terminal bookkeeping: persist, publish, unregister, release subscribers.
    async fn finish(&self, task_id: &str, result: Option<Result<JobOutcome, GenerationError>>) {
        let last_progress = self
            .hub
            .get_last_state(task_id)
            .map(|event| event.progress)
            .unwrap_or(0.0);

        let (status, progress, message, error_message) = match result {
            Some(Ok(JobOutcome::Completed { message })) => {
                (TaskStatus::Completed, 1.0, message, None)
            }
            Some(Ok(JobOutcome::Cancelled)) | None if self.supervisor.is_shutting_down() => {
                info!(task_id = %task_id, "Task interrupted by shutdown, left for recovery");
                self.supervisor.unregister(task_id).await;
                return;
            }
            Some(Ok(JobOutcome::Cancelled)) | None => (
                TaskStatus::Cancelled,
                last_progress,
                "Task cancelled".to_string(),
                None,
            ),
            Some(Err(e)) => {
                let message = e.to_string();
                (TaskStatus::Failed, last_progress, message.clone(), Some(message))
            }
        };

        if status == TaskStatus::Completed {
            if let Err(e) = self.store.update_task_progress(task_id, 1.0, None).await {
                warn!(task_id = %task_id, error = %e, "Failed to persist final progress");
            }
        }
        match self
            .store
            .update_task_status(task_id, status, error_message.as_deref())
            .await
        {
            Ok(true) => {}
            Ok(false) => debug!(task_id = %task_id, "Task was already terminal"),
            Err(e) => error!(task_id = %task_id, error = %e, "Failed to persist terminal status"),
        }

        self.hub.publish(task_id, progress, None, message, status);
        self.supervisor.unregister(task_id).await;
        self.hub.cleanup(task_id);

        match status {
            TaskStatus::Failed => warn!(task_id = %task_id, error = ?error_message, "Task failed"),
            _ => info!(task_id = %task_id, status = %status, "Task finished"),
        }
    }

    /// `true` only when the row was actually rewritten; terminal rows refuse.
    async fn persist_status(&self, task_id: &str, status: TaskStatus) -> bool {
        match self.store.update_task_status(task_id, status, None).await {
            Ok(true) => true,
            Ok(false) => {
                debug!(task_id = %task_id, status = %status, "Task already terminal, status not written");
                false
            }
            Err(e) => {
                error!(task_id = %task_id, status = %status, error = %e, "Failed to persist task status");
                false
            }
        }
    }

    /// A live entry whose token already fired is winding down.
    async fn is_winding_down(&self, task_id: &str) -> bool {
        self.supervisor.is_cancelled(task_id).await == Some(true)
    }

    fn publish_status(&self, task_id: &str, status: TaskStatus, message: &str) {
        let (progress, unit) = self
            .hub
            .get_last_state(task_id)
            .map(|event| (event.progress, event.current_unit))
            .unwrap_or((0.0, None));
        self.hub.publish(task_id, progress, unit, message, status);
    }

    // ── Operator control ────────────────────────────────────────────

    /// Pause a live task. Takes effect at its next checkpoint.
    pub async fn pause(&self, task_id: &str) -> ControlOutcome {
        if self.is_winding_down(task_id).await || !self.supervisor.pause(task_id).await {
            return ControlOutcome::NotFound;
        }
        if !self.persist_status(task_id, TaskStatus::Paused).await {
            // The execution finished while the write was in flight.
            self.supervisor.resume(task_id).await;
            return ControlOutcome::NotFound;
        }
        self.publish_status(task_id, TaskStatus::Paused, "Task paused");
        info!(task_id = %task_id, "Task paused");
        ControlOutcome::Applied {
            status: TaskStatus::Paused,
        }
    }

    /// Resume a live task, or relaunch one that was paused before a restart.
    pub async fn resume(self: &Arc<Self>, task_id: &str) -> ControlOutcome {
        if self.is_winding_down(task_id).await {
            return ControlOutcome::NotFound;
        }
        if self.supervisor.resume(task_id).await {
            if !self.persist_status(task_id, TaskStatus::Processing).await {
                return ControlOutcome::NotFound;
            }
            self.publish_status(task_id, TaskStatus::Processing, "Task resumed");
            info!(task_id = %task_id, "Task resumed");
            return ControlOutcome::Applied {
                status: TaskStatus::Processing,
            };
        }

        let task = match self.store.get_task(task_id).await {
            Ok(Some(task)) if task.status == TaskStatus::Paused => task,
            Ok(_) => return ControlOutcome::NotFound,
            Err(e) => {
                error!(task_id = %task_id, error = %e, "Failed to load task for resume");
                return ControlOutcome::NotFound;
            }
        };

        match self
            .store
            .update_task_status(&task.id, TaskStatus::Pending, None)
            .await
        {
            Ok(true) => {}
            Ok(false) => return ControlOutcome::NotFound,
            Err(e) => {
                error!(task_id = %task_id, error = %e, "Failed to requeue paused task");
                return ControlOutcome::NotFound;
            }
        }
        if let Err(e) = self.launch(task_id).await {
            error!(task_id = %task_id, error = %e, "Failed to relaunch paused task");
        }
        info!(task_id = %task_id, "Paused task requeued");
        ControlOutcome::Applied {
            status: TaskStatus::Pending,
        }
    }

    /// Cancel a live task, or mark a stored non-terminal one as cancelled.
    pub async fn cancel(&self, task_id: &str) -> ControlOutcome {
        if self.supervisor.cancel(task_id).await {
            // The execution does the terminal bookkeeping.
            info!(task_id = %task_id, "Task cancellation requested");
            return ControlOutcome::Applied {
                status: TaskStatus::Cancelled,
            };
        }

        match self
            .store
            .update_task_status(task_id, TaskStatus::Cancelled, None)
            .await
        {
            Ok(true) => {
                self.publish_status(task_id, TaskStatus::Cancelled, "Task cancelled");
                self.hub.cleanup(task_id);
                info!(task_id = %task_id, "Idle task cancelled");
                ControlOutcome::Applied {
                    status: TaskStatus::Cancelled,
                }
            }
            Ok(false) => ControlOutcome::NotFound,
            Err(e) => {
                error!(task_id = %task_id, error = %e, "Failed to cancel idle task");
                ControlOutcome::NotFound
            }
        }
    }

    /// Ids of every task with a live execution.
    pub async fn list_running(&self) -> BTreeSet<String> {
        self.supervisor.list_running().await
    }

    /// Stop all executions (leaving them resumable) and close every stream.
    pub async fn shutdown(&self, grace: Duration) {
        self.supervisor.shutdown(grace).await;
        self.hub.shutdown();
        info!("Task runner stopped");
    }
}
