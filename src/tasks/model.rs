//! Task data model — persisted records, statuses, and progress events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Persisted lifecycle status of a generation task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    /// Plan is being drafted; not yet runnable.
    Planning,
    /// Waiting for a job body to pick it up.
    Pending,
    /// A job body is running.
    Processing,
    /// Halted by an operator; survives restarts.
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    /// Check if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Planning => "PLANNING",
            Self::Pending => "PENDING",
            Self::Processing => "PROCESSING",
            Self::Paused => "PAUSED",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PLANNING" => Ok(Self::Planning),
            "PENDING" => Ok(Self::Pending),
            "PROCESSING" => Ok(Self::Processing),
            "PAUSED" => Ok(Self::Paused),
            "COMPLETED" => Ok(Self::Completed),
            "FAILED" => Ok(Self::Failed),
            "CANCELLED" => Ok(Self::Cancelled),
            _ => Err(format!("Unknown task status: {}", s)),
        }
    }
}

/// A persisted generation task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: String,
    pub title: String,
    pub status: TaskStatus,
    /// Fraction complete, `0.0..=1.0`.
    pub progress: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_unit: Option<String>,
    pub total_units: i64,
    /// Only set when `status == FAILED`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Free-form input payload (document + generation parameters).
    pub settings: serde_json::Value,
    /// Unit titles computed by the job body once the document is split.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TaskRecord {
    /// Create a new `PENDING` task with a fresh id.
    pub fn new(title: impl Into<String>, settings: serde_json::Value, total_units: i64) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            title: title.into(),
            status: TaskStatus::Pending,
            progress: 0.0,
            current_unit: None,
            total_units,
            error_message: None,
            settings,
            plan: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Builder: set the initial status.
    pub fn with_status(mut self, status: TaskStatus) -> Self {
        self.status = status;
        self
    }
}

/// Status carried on the progress wire.
///
/// Reuses every persisted [`TaskStatus`] and adds the stream-only values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StreamStatus {
    Task(TaskStatus),
    Stream(StreamSignal),
}

/// Stream-only status values that never reach the task table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamSignal {
    Connected,
    Heartbeat,
    Error,
    NotStarted,
}

impl StreamStatus {
    /// A stream closes after forwarding a terminal status.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Task(status) if status.is_terminal())
    }
}

impl From<TaskStatus> for StreamStatus {
    fn from(status: TaskStatus) -> Self {
        Self::Task(status)
    }
}

impl From<StreamSignal> for StreamStatus {
    fn from(signal: StreamSignal) -> Self {
        Self::Stream(signal)
    }
}

/// One broadcastable unit of progress information for a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub status: StreamStatus,
    pub progress: f64,
    pub percentage: f64,
    pub current_unit: Option<String>,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl ProgressEvent {
    /// Build an event, clamping `progress` into `[0, 1]`.
    pub fn new(
        status: impl Into<StreamStatus>,
        progress: f64,
        current_unit: Option<String>,
        message: impl Into<String>,
    ) -> Self {
        let progress = clamp_progress(progress);
        Self {
            status: status.into(),
            progress,
            percentage: (progress * 10_000.0).round() / 100.0,
            current_unit,
            message: message.into(),
            timestamp: Utc::now(),
        }
    }

    /// A keep-alive record for an idle stream.
    pub fn heartbeat() -> Self {
        Self::new(StreamSignal::Heartbeat, 0.0, None, "heartbeat")
    }

    /// Synthetic status for a task that has never published anything.
    pub fn not_started() -> Self {
        Self::new(StreamSignal::NotStarted, 0.0, None, "Task has not started")
    }
}

/// Clamp into `[0, 1]`; NaN counts as no progress.
pub fn clamp_progress(progress: f64) -> f64 {
    if progress.is_nan() {
        0.0
    } else {
        progress.clamp(0.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states() {
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Cancelled.is_terminal());
        assert!(!TaskStatus::Paused.is_terminal());
        assert!(!TaskStatus::Processing.is_terminal());
        assert!(!TaskStatus::Pending.is_terminal());
        assert!(!TaskStatus::Planning.is_terminal());
    }

    #[test]
    fn status_string_forms_agree() {
        for status in [
            TaskStatus::Planning,
            TaskStatus::Pending,
            TaskStatus::Processing,
            TaskStatus::Paused,
            TaskStatus::Completed,
            TaskStatus::Failed,
            TaskStatus::Cancelled,
        ] {
            let json = serde_json::to_string(&status).unwrap();
            assert_eq!(json, format!("\"{}\"", status.as_str()));
            assert_eq!(status.as_str().parse::<TaskStatus>().unwrap(), status);
        }
        assert!("RUNNING".parse::<TaskStatus>().is_err());
    }

    #[test]
    fn percentage_is_rounded_to_two_places() {
        let event = ProgressEvent::new(TaskStatus::Processing, 1.0 / 3.0, None, "");
        assert_eq!(event.percentage, 33.33);
    }

    #[test]
    fn progress_is_clamped() {
        assert_eq!(ProgressEvent::new(TaskStatus::Processing, 1.4, None, "").progress, 1.0);
        assert_eq!(ProgressEvent::new(TaskStatus::Processing, -0.2, None, "").progress, 0.0);
        assert_eq!(clamp_progress(f64::NAN), 0.0);
    }

    #[test]
    fn wire_format() {
        let event = ProgressEvent::new(
            TaskStatus::Processing,
            0.5,
            Some("Chapter 2".to_string()),
            "Generating questions",
        );
        let json: serde_json::Value = serde_json::to_value(&event).unwrap();
        assert_eq!(json["status"], "PROCESSING");
        assert_eq!(json["progress"], 0.5);
        assert_eq!(json["percentage"], 50.0);
        assert_eq!(json["current_unit"], "Chapter 2");
        assert_eq!(json["message"], "Generating questions");
        assert!(json["timestamp"].is_string());

        let heartbeat = serde_json::to_value(ProgressEvent::heartbeat()).unwrap();
        assert_eq!(heartbeat["status"], "heartbeat");
        let not_started = serde_json::to_value(ProgressEvent::not_started()).unwrap();
        assert_eq!(not_started["status"], "not_started");
        assert_eq!(not_started["progress"], 0.0);
    }

    #[test]
    fn stream_status_terminal() {
        assert!(StreamStatus::from(TaskStatus::Completed).is_terminal());
        assert!(!StreamStatus::from(StreamSignal::Heartbeat).is_terminal());
        assert!(!StreamStatus::from(TaskStatus::Paused).is_terminal());
    }
}
