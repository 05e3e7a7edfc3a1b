//! Task supervisor — live pause/resume/cancel control for running jobs.
//!
//! Each running task owns one entry holding its execution handle, a
//! cancellation token and a pause gate. The gate is a `watch` channel whose
//! value *is* the pause flag, so "paused" and "gate closed" cannot disagree.
//!
//! Job bodies never get preempted by a pause: they call
//! [`TaskSupervisor::checkpoint`] at safe points and stop when it returns
//! `false`.

use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::TaskError;

/// In-memory control state for one running task.
struct SupervisorEntry {
    /// The only strong handle to the execution; taken on shutdown.
    handle: Option<JoinHandle<()>>,
    cancel: CancellationToken,
    /// `true` = paused (gate closed).
    gate: watch::Sender<bool>,
}

/// Tracks running jobs and mediates pause/resume/cancel requests.
pub struct TaskSupervisor {
    entries: Mutex<HashMap<String, SupervisorEntry>>,
    /// Parent of every entry token; cancelled only by `shutdown`.
    root: CancellationToken,
}

impl TaskSupervisor {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            root: CancellationToken::new(),
        }
    }

    /// Record a new running task and return its cancellation token.
    ///
    /// Duplicate ids and registrations after `shutdown` are refused and the
    /// supplied handle is aborted.
    pub async fn register(
        &self,
        task_id: &str,
        handle: JoinHandle<()>,
    ) -> Result<CancellationToken, TaskError> {
        let mut entries = self.entries.lock().await;

        if self.root.is_cancelled() {
            handle.abort();
            return Err(TaskError::LaunchFailed {
                id: task_id.to_string(),
                reason: "supervisor is shutting down".to_string(),
            });
        }
        if entries.contains_key(task_id) {
            handle.abort();
            warn!(task_id = %task_id, "Refusing duplicate task registration");
            return Err(TaskError::AlreadyRegistered {
                id: task_id.to_string(),
            });
        }

        let cancel = self.root.child_token();
        let (gate, _) = watch::channel(false);
        entries.insert(
            task_id.to_string(),
            SupervisorEntry {
                handle: Some(handle),
                cancel: cancel.clone(),
                gate,
            },
        );

        debug!(task_id = %task_id, running = entries.len(), "Task registered");
        Ok(cancel)
    }

    /// Forget a task. Unknown ids are ignored.
    pub async fn unregister(&self, task_id: &str) {
        if self.entries.lock().await.remove(task_id).is_some() {
            debug!(task_id = %task_id, "Task unregistered");
        }
    }

    /// Close the pause gate. Observed at the job's next checkpoint.
    ///
    /// A cancelled task keeps its gate open so it can wind down.
    pub async fn pause(&self, task_id: &str) -> bool {
        let entries = self.entries.lock().await;
        let Some(entry) = entries.get(task_id) else {
            return false;
        };

        if !entry.cancel.is_cancelled() {
            entry.gate.send_replace(true);
            info!(task_id = %task_id, "Task paused");
        }
        true
    }

    /// Open the pause gate.
    pub async fn resume(&self, task_id: &str) -> bool {
        let entries = self.entries.lock().await;
        let Some(entry) = entries.get(task_id) else {
            return false;
        };

        entry.gate.send_replace(false);
        info!(task_id = %task_id, "Task resumed");
        true
    }

    /// Cancel a task: fire its token and open the gate so a paused job
    /// wakes up to observe the cancellation.
    pub async fn cancel(&self, task_id: &str) -> bool {
        let entries = self.entries.lock().await;
        let Some(entry) = entries.get(task_id) else {
            return false;
        };

        entry.cancel.cancel();
        entry.gate.send_replace(false);
        info!(task_id = %task_id, "Task cancelled");
        true
    }

    /// Cooperative safe point for job bodies.
    ///
    /// Returns `false` if the task is unknown or cancelled. Otherwise waits
    /// out any pause (no timeout), re-checks cancellation, and returns
    /// whether the job should continue.
    pub async fn checkpoint(&self, task_id: &str) -> bool {
        // Copy the signals out; never wait while holding the registry lock.
        let (cancel, mut gate) = {
            let entries = self.entries.lock().await;
            match entries.get(task_id) {
                Some(entry) => (entry.cancel.clone(), entry.gate.subscribe()),
                None => return false,
            }
        };

        if cancel.is_cancelled() {
            return false;
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return false,
            opened = gate.wait_for(|paused| !*paused) => {
                // Sender dropped: the entry was unregistered while parked.
                if opened.is_err() {
                    return false;
                }
            }
        }

        !cancel.is_cancelled()
    }

    /// Snapshot of currently registered task ids.
    pub async fn list_running(&self) -> BTreeSet<String> {
        self.entries.lock().await.keys().cloned().collect()
    }

    /// Current pause flag, or `None` for unknown tasks.
    pub async fn is_paused(&self, task_id: &str) -> Option<bool> {
        self.entries
            .lock()
            .await
            .get(task_id)
            .map(|entry| *entry.gate.borrow())
    }

    /// Whether the task's cancellation has fired, or `None` for unknown tasks.
    pub async fn is_cancelled(&self, task_id: &str) -> Option<bool> {
        self.entries
            .lock()
            .await
            .get(task_id)
            .map(|entry| entry.cancel.is_cancelled())
    }

    /// Whether `shutdown` has started.
    pub fn is_shutting_down(&self) -> bool {
        self.root.is_cancelled()
    }

    /// Cancel every running task, wait up to `grace` for executions to
    /// finish, then abort whatever is left and clear the registry.
    pub async fn shutdown(&self, grace: Duration) {
        let handles: Vec<JoinHandle<()>> = {
            let mut entries = self.entries.lock().await;
            self.root.cancel();
            entries
                .values_mut()
                .filter_map(|entry| {
                    entry.gate.send_replace(false);
                    entry.handle.take()
                })
                .collect()
        };

        if handles.is_empty() {
            return;
        }

        info!(count = handles.len(), grace_secs = grace.as_secs(), "Draining running tasks");
        let aborts: Vec<_> = handles.iter().map(|h| h.abort_handle()).collect();

        if tokio::time::timeout(grace, futures::future::join_all(handles))
            .await
            .is_err()
        {
            let stragglers = aborts.iter().filter(|a| !a.is_finished()).count();
            warn!(count = stragglers, "Aborting tasks that ignored shutdown");
            for abort in aborts {
                abort.abort();
            }
        }

        self.entries.lock().await.clear();
    }
}

impl Default for TaskSupervisor {
    fn default() -> Self {
        Self::new()
    }
}
