//! Startup recovery — relaunch work orphaned by the previous process.
//!
//! No execution survives a restart. `PROCESSING` rows are demoted to
//! `PENDING` and relaunched together with the `PENDING` ones. `PAUSED`
//! rows stay paused until an operator resumes them.

use std::sync::Arc;

use serde::Serialize;
use tracing::{error, info, warn};

use crate::store::TaskStore;
use crate::tasks::model::{TaskRecord, TaskStatus};
use crate::tasks::runner::TaskRunner;

/// What a recovery pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    /// Ids launched again, in launch order.
    pub relaunched: Vec<String>,
    /// Ids that were `PROCESSING` and got demoted to `PENDING`.
    pub demoted: Vec<String>,
    /// Tasks left `PAUSED`.
    pub left_paused: usize,
    /// Lookups, demotions or launches that failed (logged individually).
    pub failures: usize,
}

/// Run one recovery pass. Never fails; problems are logged and counted.
pub async fn recover_tasks(store: &dyn TaskStore, runner: &Arc<TaskRunner>) -> RecoveryReport {
    let mut report = RecoveryReport::default();

    let mut runnable = list_or_log(store, TaskStatus::Pending, &mut report).await;

    for task in list_or_log(store, TaskStatus::Processing, &mut report).await {
        match store
            .update_task_status(&task.id, TaskStatus::Pending, None)
            .await
        {
            Ok(true) => {
                report.demoted.push(task.id.clone());
                runnable.push(task);
            }
            Ok(false) => warn!(task_id = %task.id, "Orphaned task became terminal, skipping"),
            Err(e) => {
                error!(task_id = %task.id, error = %e, "Failed to demote orphaned task");
                report.failures += 1;
            }
        }
    }

    report.left_paused = list_or_log(store, TaskStatus::Paused, &mut report).await.len();

    for task in runnable {
        match runner.launch(&task.id).await {
            Ok(()) => report.relaunched.push(task.id),
            Err(e) => {
                error!(task_id = %task.id, error = %e, "Failed to relaunch task");
                report.failures += 1;
            }
        }
    }

    info!(
        relaunched = report.relaunched.len(),
        demoted = report.demoted.len(),
        left_paused = report.left_paused,
        failures = report.failures,
        "Task recovery complete"
    );
    report
}

async fn list_or_log(
    store: &dyn TaskStore,
    status: TaskStatus,
    report: &mut RecoveryReport,
) -> Vec<TaskRecord> {
    match store.get_all_tasks(status).await {
        Ok(tasks) => tasks,
        Err(e) => {
            error!(status = %status, error = %e, "Failed to list tasks for recovery");
            report.failures += 1;
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GenerationError;
    use crate::store::LibSqlBackend;
    use crate::store::testing::FaultyStore;
    use crate::tasks::job::{JobBody, JobContext, JobOutcome};
    use crate::tasks::progress::ProgressHub;
    use crate::tasks::supervisor::TaskSupervisor;
    use async_trait::async_trait;
    use serde_json::json;
    use std::time::Duration;

    struct QuickBody;

    #[async_trait]
    impl JobBody for QuickBody {
        async fn run(&self, ctx: &JobContext) -> Result<JobOutcome, GenerationError> {
            if !ctx.checkpoint().await {
                return Ok(JobOutcome::Cancelled);
            }
            ctx.report(0.5, Some("half"), "halfway").await?;
            Ok(JobOutcome::completed("done"))
        }
    }

    async fn setup() -> (Arc<dyn TaskStore>, Arc<TaskRunner>) {
        let store: Arc<dyn TaskStore> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let runner = TaskRunner::new(
            Arc::clone(&store),
            Arc::new(TaskSupervisor::new()),
            ProgressHub::new(),
            Arc::new(QuickBody),
        );
        (store, runner)
    }

    async fn seed(store: &dyn TaskStore, title: &str, status: TaskStatus) -> String {
        let task = TaskRecord::new(title, json!({}), 1).with_status(status);
        store.create_task(&task).await.unwrap();
        task.id
    }

    async fn wait_for_status(store: &dyn TaskStore, id: &str, status: TaskStatus) {
        for _ in 0..400 {
            if store.get_task(id).await.unwrap().unwrap().status == status {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("task {id} never reached {status}");
    }

    #[tokio::test]
    async fn empty_store_recovers_nothing() {
        let (store, runner) = setup().await;
        let report = recover_tasks(store.as_ref(), &runner).await;
        assert_eq!(report, RecoveryReport::default());
    }

    #[tokio::test]
    async fn restart_relaunches_orphans_and_keeps_paused() {
        let (store, runner) = setup().await;
        let pending = seed(store.as_ref(), "p", TaskStatus::Pending).await;
        let orphan = seed(store.as_ref(), "x", TaskStatus::Processing).await;
        let paused = seed(store.as_ref(), "z", TaskStatus::Paused).await;
        let done = seed(store.as_ref(), "d", TaskStatus::Completed).await;

        let report = recover_tasks(store.as_ref(), &runner).await;

        assert_eq!(report.demoted, vec![orphan.clone()]);
        assert_eq!(report.relaunched.len(), 2);
        assert!(report.relaunched.contains(&pending));
        assert!(report.relaunched.contains(&orphan));
        assert_eq!(report.left_paused, 1);
        assert_eq!(report.failures, 0);

        wait_for_status(store.as_ref(), &pending, TaskStatus::Completed).await;
        wait_for_status(store.as_ref(), &orphan, TaskStatus::Completed).await;

        let paused_row = store.get_task(&paused).await.unwrap().unwrap();
        assert_eq!(paused_row.status, TaskStatus::Paused);
        assert!(!runner.list_running().await.contains(&paused));
        assert_eq!(
            store.get_task(&done).await.unwrap().unwrap().status,
            TaskStatus::Completed
        );
    }

    #[tokio::test]
    async fn listing_failure_is_counted_and_startup_continues() {
        let store: Arc<dyn TaskStore> =
            Arc::new(FaultyStore::new().await.fail_listing(TaskStatus::Processing));
        let runner = TaskRunner::new(
            Arc::clone(&store),
            Arc::new(TaskSupervisor::new()),
            ProgressHub::new(),
            Arc::new(QuickBody),
        );
        let pending = seed(store.as_ref(), "p", TaskStatus::Pending).await;
        let orphan = seed(store.as_ref(), "x", TaskStatus::Processing).await;

        let report = recover_tasks(store.as_ref(), &runner).await;

        assert_eq!(report.failures, 1);
        assert_eq!(report.relaunched, vec![pending.clone()]);
        assert!(report.demoted.is_empty());
        wait_for_status(store.as_ref(), &pending, TaskStatus::Completed).await;

        // The unreadable orphan is left for the next restart.
        assert_eq!(
            store.get_task(&orphan).await.unwrap().unwrap().status,
            TaskStatus::Processing
        );
    }

    #[tokio::test]
    async fn launch_failures_are_counted_not_raised() {
        let (store, runner) = setup().await;
        let id = seed(store.as_ref(), "p", TaskStatus::Pending).await;

        runner.shutdown(Duration::from_millis(10)).await;
        let report = recover_tasks(store.as_ref(), &runner).await;

        assert!(report.relaunched.is_empty());
        assert_eq!(report.failures, 1);
        assert_eq!(
            store.get_task(&id).await.unwrap().unwrap().status,
            TaskStatus::Pending
        );
    }
}
