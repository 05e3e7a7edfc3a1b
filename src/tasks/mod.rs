//! Task orchestration — supervision, progress fan-out, execution, recovery.

pub mod job;
pub mod model;
pub mod progress;
pub mod recovery;
pub mod runner;
pub mod supervisor;

pub use job::{JobBody, JobContext, JobOutcome};
pub use model::{ProgressEvent, StreamSignal, StreamStatus, TaskRecord, TaskStatus};
pub use progress::{ProgressHub, Subscription};
pub use recovery::{RecoveryReport, recover_tasks};
pub use runner::{ControlOutcome, TaskRunner};
pub use supervisor::TaskSupervisor;
