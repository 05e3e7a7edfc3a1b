//! Per-client progress streams.
//!
//! A stream opens with the cached last state (or a `connected` record),
//! forwards every published event, and sends a `heartbeat` after each idle
//! interval. It ends after a terminal event, when the hub drops the
//! subscription, or when the maximum stream lifetime elapses.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_stream::Stream;
use tracing::debug;

use crate::tasks::model::{ProgressEvent, StreamSignal};
use crate::tasks::progress::ProgressHub;

/// Timing knobs for a progress stream.
#[derive(Debug, Clone, Copy)]
pub struct StreamSettings {
    pub heartbeat_interval: Duration,
    pub max_duration: Duration,
}

enum Wake {
    Event(Option<ProgressEvent>),
    Idle,
    Expired,
}

/// Build the event sequence for one subscriber of `task_id`.
///
/// `fallback` replaces the `connected` greeting when the hub has no cached
/// state, e.g. for a task that finished before the last restart.
pub fn progress_stream(
    hub: Arc<ProgressHub>,
    task_id: String,
    settings: StreamSettings,
    fallback: Option<ProgressEvent>,
) -> impl Stream<Item = ProgressEvent> {
    async_stream::stream! {
        // Subscribe first so nothing published after the snapshot is lost.
        let mut subscription = hub.subscribe(&task_id);
        let first = hub
            .get_last_state(&task_id)
            .or(fallback)
            .unwrap_or_else(|| ProgressEvent::new(StreamSignal::Connected, 0.0, None, "Connected"));
        let done = first.status.is_terminal();
        yield first;
        if done {
            return;
        }

        let deadline = Instant::now() + settings.max_duration;
        loop {
            let wake = tokio::select! {
                _ = tokio::time::sleep_until(deadline) => Wake::Expired,
                received = tokio::time::timeout(settings.heartbeat_interval, subscription.recv()) => {
                    match received {
                        Ok(event) => Wake::Event(event),
                        Err(_) => Wake::Idle,
                    }
                }
            };

            match wake {
                Wake::Event(Some(event)) => {
                    let done = event.status.is_terminal();
                    yield event;
                    if done {
                        break;
                    }
                }
                Wake::Event(None) => {
                    debug!(task_id = %task_id, "Progress channel closed");
                    // The terminal event may have been dropped before cleanup.
                    if let Some(last) = hub.get_last_state(&task_id) {
                        if last.status.is_terminal() {
                            yield last;
                        }
                    }
                    break;
                }
                Wake::Idle => {
                    yield ProgressEvent::heartbeat();
                    // A terminal event may have been dropped on a full channel.
                    if let Some(last) = hub.get_last_state(&task_id) {
                        if last.status.is_terminal() {
                            yield last;
                            break;
                        }
                    }
                }
                Wake::Expired => {
                    yield ProgressEvent::new(StreamSignal::Error, 0.0, None, "stream timed out");
                    break;
                }
            }
        }
    }
}
