//! Progress hub — per-task fan-out of progress events to live observers.
//!
//! Delivery is best-effort and at-most-once: an event is offered to every
//! channel subscribed at publish time with a non-blocking send, and a full
//! or abandoned channel simply misses it. Correctness-sensitive readers use
//! [`ProgressHub::get_last_state`], which caches the latest event per task
//! independently of delivery and survives [`ProgressHub::cleanup`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};

use super::model::{ProgressEvent, StreamStatus};

/// Default per-subscriber buffer.
pub const DEFAULT_SUBSCRIBER_CAPACITY: usize = 256;

#[derive(Default)]
struct HubInner {
    channels: HashMap<String, Vec<(u64, mpsc::Sender<ProgressEvent>)>>,
    last_state: HashMap<String, ProgressEvent>,
}

/// Registry of subscriber channels and last-known progress per task.
pub struct ProgressHub {
    inner: Mutex<HubInner>,
    next_id: AtomicU64,
    capacity: usize,
}

impl ProgressHub {
    pub fn new() -> Arc<Self> {
        Self::with_capacity(DEFAULT_SUBSCRIBER_CAPACITY)
    }

    /// Create a hub whose subscriber channels buffer `capacity` events.
    pub fn with_capacity(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(HubInner::default()),
            next_id: AtomicU64::new(1),
            capacity: capacity.max(1),
        })
    }

    // Critical sections never panic, but a poisoned lock must not take the
    // whole hub down with it.
    fn inner(&self) -> MutexGuard<'_, HubInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a new delivery channel for `task_id`.
    ///
    /// The returned subscription unsubscribes itself when dropped.
    pub fn subscribe(self: &Arc<Self>, task_id: &str) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.capacity);

        let mut inner = self.inner();
        let channels = inner.channels.entry(task_id.to_string()).or_default();
        channels.push((id, tx));
        debug!(task_id = %task_id, subscription = id, subscribers = channels.len(), "Progress subscriber added");

        Subscription {
            id,
            task_id: task_id.to_string(),
            rx,
            hub: Arc::downgrade(self),
        }
    }

    /// Remove exactly one channel. Already-removed channels are ignored.
    pub fn unsubscribe(&self, task_id: &str, subscription_id: u64) {
        let mut inner = self.inner();
        let Some(channels) = inner.channels.get_mut(task_id) else {
            return;
        };

        let before = channels.len();
        channels.retain(|(id, _)| *id != subscription_id);
        if channels.len() != before {
            debug!(task_id = %task_id, subscription = subscription_id, "Progress subscriber removed");
        }
        if channels.is_empty() {
            inner.channels.remove(task_id);
        }
    }

    /// Record and broadcast a progress event.
    ///
    /// `progress` is clamped into `[0, 1]`. The event replaces the cached
    /// last state even when nobody is subscribed, unless that state is
    /// terminal and the new event is not; such late events are discarded.
    pub fn publish(
        &self,
        task_id: &str,
        progress: f64,
        current_unit: Option<String>,
        message: impl Into<String>,
        status: impl Into<StreamStatus>,
    ) -> ProgressEvent {
        let event = ProgressEvent::new(status, progress, current_unit, message);

        let mut inner = self.inner();
        if !event.status.is_terminal()
            && inner
                .last_state
                .get(task_id)
                .is_some_and(|cached| cached.status.is_terminal())
        {
            debug!(task_id = %task_id, status = ?event.status, "Ignoring progress event after terminal state");
            return event;
        }
        inner
            .last_state
            .insert(task_id.to_string(), event.clone());

        let Some(channels) = inner.channels.get_mut(task_id) else {
            return event;
        };

        // Sending under the lock keeps per-channel order equal to publish order.
        channels.retain(|(id, tx)| match tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(task_id = %task_id, subscription = *id, "Subscriber channel full, dropping progress event");
                true
            }
            Err(TrySendError::Closed(_)) => {
                debug!(task_id = %task_id, subscription = *id, "Pruning abandoned subscriber channel");
                false
            }
        });
        if channels.is_empty() {
            inner.channels.remove(task_id);
        }

        event
    }

    /// Latest event published for `task_id`, if any.
    pub fn get_last_state(&self, task_id: &str) -> Option<ProgressEvent> {
        self.inner().last_state.get(task_id).cloned()
    }

    /// Drop every channel for a finished task. The cached last state stays.
    pub fn cleanup(&self, task_id: &str) {
        if let Some(channels) = self.inner().channels.remove(task_id) {
            debug!(task_id = %task_id, closed = channels.len(), "Progress channels cleaned up");
        }
    }

    /// Number of live channels for `task_id`.
    pub fn subscriber_count(&self, task_id: &str) -> usize {
        self.inner()
            .channels
            .get(task_id)
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// Close every channel (process shutdown). Cached state is kept.
    pub fn shutdown(&self) {
        let mut inner = self.inner();
        let closed: usize = inner.channels.values().map(Vec::len).sum();
        inner.channels.clear();
        if closed > 0 {
            debug!(closed, "Closed all progress channels");
        }
    }
}

/// A per-connection delivery queue for one task's progress events.
pub struct Subscription {
    id: u64,
    task_id: String,
    rx: mpsc::Receiver<ProgressEvent>,
    hub: Weak<ProgressHub>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    /// Next event, or `None` once the task's channels were cleaned up and
    /// the buffer is drained.
    pub async fn recv(&mut self) -> Option<ProgressEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<ProgressEvent> {
        self.rx.try_recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(hub) = self.hub.upgrade() {
            hub.unsubscribe(&self.task_id, self.id);
        }
    }
}
