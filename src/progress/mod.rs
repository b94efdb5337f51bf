//! Live progress fan-out.
//!
//! The [`ProgressBus`] is created once per process and cloned into workers
//! and HTTP handlers. Each project id maps to a set of bounded channels, one
//! per live viewer. Delivery is at-most-once: a full channel drops the event
//! for that viewer, a closed one is pruned, and nothing is replayed to late
//! subscribers.

pub mod reporter;
pub mod stream;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use chrono::{DateTime, Utc};
use opentelemetry::KeyValue;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::model::JobId;
use crate::telemetry::metrics;

pub use reporter::ProgressReporter;
pub use stream::StreamMessage;

/// Buffered events per subscriber before new ones are dropped.
pub const SUBSCRIBER_BUFFER: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Progress,
    Complete,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub project_id: String,
    pub job_id: Option<JobId>,
    pub kind: EventKind,
    pub stage: String,
    /// 0 to 100.
    pub percent: u8,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl ProgressEvent {
    pub fn new(
        project_id: impl Into<String>,
        kind: EventKind,
        stage: impl Into<String>,
        percent: u8,
        message: impl Into<String>,
    ) -> Self {
        Self {
            project_id: project_id.into(),
            job_id: None,
            kind,
            stage: stage.into(),
            percent: percent.min(100),
            message: message.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn for_job(mut self, job_id: JobId) -> Self {
        self.job_id = Some(job_id);
        self
    }
}

type Subscribers = HashMap<String, HashMap<u64, mpsc::Sender<ProgressEvent>>>;

struct BusInner {
    subscribers: Mutex<Subscribers>,
    next_id: AtomicU64,
    buffer: usize,
}

impl BusInner {
    fn lock(&self) -> MutexGuard<'_, Subscribers> {
        self.subscribers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn remove(&self, project_id: &str, id: u64) {
        let mut subscribers = self.lock();
        if let Some(set) = subscribers.get_mut(project_id) {
            set.remove(&id);
            if set.is_empty() {
                subscribers.remove(project_id);
            }
        }
    }
}

/// Process-wide publish/subscribe keyed by project id.
#[derive(Clone)]
pub struct ProgressBus {
    inner: Arc<BusInner>,
}

impl Default for ProgressBus {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressBus {
    pub fn new() -> Self {
        Self::with_buffer(SUBSCRIBER_BUFFER)
    }

    pub fn with_buffer(buffer: usize) -> Self {
        Self {
            inner: Arc::new(BusInner {
                subscribers: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                buffer: buffer.max(1),
            }),
        }
    }

    /// Register a viewer. It receives every event published after this call.
    pub fn subscribe(&self, project_id: &str) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.inner.buffer);
        self.inner
            .lock()
            .entry(project_id.to_string())
            .or_default()
            .insert(id, tx);
        debug!(project_id, subscriber = id, "progress subscriber added");
        Subscription {
            project_id: project_id.to_string(),
            id,
            rx,
            bus: Arc::downgrade(&self.inner),
            active: true,
        }
    }

    /// Deliver to every current subscriber of the event's project. Returns
    /// how many received it. No subscribers is not an error.
    pub fn publish(&self, event: ProgressEvent) -> usize {
        let mut subscribers = self.inner.lock();
        let Some(set) = subscribers.get_mut(&event.project_id) else {
            trace!(project_id = %event.project_id, "no progress subscribers");
            return 0;
        };

        let mut delivered = 0;
        set.retain(|id, tx| match tx.try_send(event.clone()) {
            Ok(()) => {
                delivered += 1;
                true
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!(project_id = %event.project_id, subscriber = id, "subscriber lagging, event dropped");
                metrics::progress_events().add(1, &[KeyValue::new("result", "dropped")]);
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
        if set.is_empty() {
            subscribers.remove(&event.project_id);
        }
        drop(subscribers);

        if delivered > 0 {
            metrics::progress_events().add(delivered as u64, &[KeyValue::new("result", "delivered")]);
        }
        delivered
    }

    pub fn subscriber_count(&self, project_id: &str) -> usize {
        self.inner.lock().get(project_id).map_or(0, HashMap::len)
    }
}

/// A live viewer's handle. Dropping it unsubscribes.
pub struct Subscription {
    project_id: String,
    id: u64,
    rx: mpsc::Receiver<ProgressEvent>,
    bus: Weak<BusInner>,
    active: bool,
}

impl Subscription {
    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    /// Next event, or `None` once unsubscribed or the bus is gone.
    pub async fn recv(&mut self) -> Option<ProgressEvent> {
        if !self.active {
            return None;
        }
        self.rx.recv().await
    }

    /// Non-blocking variant of [`Subscription::recv`].
    pub fn try_recv(&mut self) -> Option<ProgressEvent> {
        if !self.active {
            return None;
        }
        self.rx.try_recv().ok()
    }

    /// Stop receiving. Safe to call more than once and after the bus has
    /// shut down.
    pub fn unsubscribe(&mut self) {
        if !self.active {
            return;
        }
        self.active = false;
        self.rx.close();
        if let Some(bus) = self.bus.upgrade() {
            bus.remove(&self.project_id, self.id);
            debug!(project_id = %self.project_id, subscriber = self.id, "progress subscriber removed");
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}
