//! In-process queue backend.
//!
//! Jobs live in a mutex-guarded map; scheduling uses tokio's clock so tests
//! can drive backoff and lease expiry with a paused runtime.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use opentelemetry::KeyValue;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{EnqueueOptions, QueueOptions, QueueStats, WorkQueue};
use crate::error::{Error, Result};
use crate::model::{FailOutcome, Job, JobId, JobState, QueueName};
use crate::telemetry::metrics;

struct Slot {
    job: Job,
    /// Enqueue order, for FIFO among equal priorities.
    seq: u64,
    ready_at: Instant,
    lease_until: Option<Instant>,
    /// Order in which the job reached a terminal state, for retention.
    finished_seq: u64,
}

#[derive(Default)]
struct Inner {
    slots: HashMap<JobId, Slot>,
    next_seq: u64,
}

impl Inner {
    fn next_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    fn slot_mut(&mut self, id: JobId) -> Result<&mut Slot> {
        self.slots
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("job {id}")))
    }

    fn insert(&mut self, job: Job, ready_at: Instant) {
        let seq = self.next_seq();
        self.slots.insert(
            job.id,
            Slot {
                job,
                seq,
                ready_at,
                lease_until: None,
                finished_seq: 0,
            },
        );
    }

    /// Keep only the newest `cap` jobs in terminal `state`.
    fn prune(&mut self, state: JobState, cap: usize) {
        let mut finished: Vec<(u64, JobId)> = self
            .slots
            .values()
            .filter(|s| s.job.state == state)
            .map(|s| (s.finished_seq, s.job.id))
            .collect();
        if finished.len() <= cap {
            return;
        }
        finished.sort_unstable_by(|a, b| b.0.cmp(&a.0));
        for (_, id) in finished.into_iter().skip(cap) {
            self.slots.remove(&id);
        }
    }
}

/// Process-local [`WorkQueue`].
pub struct MemoryQueue {
    name: QueueName,
    options: QueueOptions,
    inner: Mutex<Inner>,
    notify: Notify,
    closed: AtomicBool,
}

impl MemoryQueue {
    pub fn new(name: QueueName, options: QueueOptions) -> Self {
        Self {
            name,
            options,
            inner: Mutex::new(Inner::default()),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Queue with the default policy for `name`.
    pub fn with_defaults(name: QueueName) -> Self {
        Self::new(name, QueueOptions::for_queue(name))
    }

    /// Stop accepting work; subsequent calls fail with `QueueUnavailable`.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    /// Accept work again after [`MemoryQueue::close`].
    pub fn reopen(&self) {
        self.closed.store(false, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(Error::QueueUnavailable(format!("{} queue is closed", self.name)))
        } else {
            Ok(())
        }
    }

    fn record(&self, operation: &'static str) {
        metrics::queue_operations().add(
            1,
            &[
                KeyValue::new("queue", self.name.as_str()),
                KeyValue::new("operation", operation),
            ],
        );
    }

    fn record_transition(&self, from: JobState, to: JobState) {
        metrics::job_state_transitions().add(
            1,
            &[
                KeyValue::new("queue", self.name.as_str()),
                KeyValue::new("from", from.as_str()),
                KeyValue::new("to", to.as_str()),
            ],
        );
    }

    /// Requeue or fail active jobs whose lease lapsed.
    fn recover_stalled(&self, inner: &mut Inner, now: Instant) {
        let expired: Vec<JobId> = inner
            .slots
            .values()
            .filter(|s| {
                s.job.state == JobState::Active && s.lease_until.is_some_and(|until| until <= now)
            })
            .map(|s| s.job.id)
            .collect();

        for id in expired {
            let finished_seq = inner.next_seq();
            let Some(slot) = inner.slots.get_mut(&id) else {
                continue;
            };
            slot.lease_until = None;
            match slot.job.stall(self.options.stall_limit, Utc::now()) {
                Ok(FailOutcome::Retrying { .. }) => {
                    slot.ready_at = now;
                    warn!(queue = %self.name, job_id = %id, stalls = slot.job.stalls, "stalled job requeued");
                    self.record_transition(JobState::Active, JobState::Delayed);
                }
                Ok(FailOutcome::Dead { attempts }) => {
                    slot.finished_seq = finished_seq;
                    warn!(queue = %self.name, job_id = %id, attempts, "stalled job failed terminally");
                    self.record_transition(JobState::Active, JobState::Failed);
                }
                Err(e) => warn!(queue = %self.name, job_id = %id, "stall recovery error: {e}"),
            }
        }
        inner.prune(JobState::Failed, self.options.remove_on_fail);
    }
}

#[async_trait]
impl WorkQueue for MemoryQueue {
    fn name(&self) -> QueueName {
        self.name
    }

    fn options(&self) -> &QueueOptions {
        &self.options
    }

    async fn enqueue(&self, payload: serde_json::Value, options: EnqueueOptions) -> Result<JobId> {
        self.ensure_open()?;
        let delay = options.delay.unwrap_or(Duration::ZERO);
        let job = options.into_job(self.name, payload, &self.options);
        let id = job.id;

        {
            let mut inner = self.lock();
            if let Some(key) = job.dedup_key.as_deref() {
                let existing = inner.slots.values().find(|s| {
                    s.job.dedup_key.as_deref() == Some(key) && !s.job.state.is_terminal()
                });
                if let Some(existing) = existing {
                    metrics::jobs_enqueued().add(
                        1,
                        &[
                            KeyValue::new("queue", self.name.as_str()),
                            KeyValue::new("result", "rejected"),
                        ],
                    );
                    return Err(Error::AdmissionRejected {
                        key: key.to_string(),
                        existing: existing.job.id,
                    });
                }
            }
            inner.insert(job, Instant::now() + delay);
        }

        self.record("enqueue");
        metrics::jobs_enqueued().add(
            1,
            &[
                KeyValue::new("queue", self.name.as_str()),
                KeyValue::new("result", "ok"),
            ],
        );
        info!(queue = %self.name, job_id = %id, "job enqueued");
        self.notify.notify_one();
        Ok(id)
    }

    async fn dequeue(&self, worker_id: &str) -> Result<Option<Job>> {
        self.ensure_open()?;
        let now = Instant::now();
        let mut inner = self.lock();
        self.recover_stalled(&mut inner, now);

        let candidate = inner
            .slots
            .values()
            .filter(|s| matches!(s.job.state, JobState::Waiting | JobState::Delayed))
            .filter(|s| s.ready_at <= now)
            .max_by(|a, b| {
                a.job
                    .priority
                    .cmp(&b.job.priority)
                    .then_with(|| b.seq.cmp(&a.seq))
            })
            .map(|s| s.job.id);

        let Some(id) = candidate else {
            self.record("dequeue_empty");
            return Ok(None);
        };

        let slot = inner.slot_mut(id)?;
        let from = slot.job.state;
        slot.job.begin_attempt(Utc::now())?;
        slot.lease_until = Some(now + self.options.visibility_timeout);
        let job = slot.job.clone();
        drop(inner);

        self.record("dequeue");
        self.record_transition(from, JobState::Active);
        debug!(queue = %self.name, job_id = %id, worker_id, attempt = job.attempts, "job claimed");
        Ok(Some(job))
    }

    async fn heartbeat(&self, job: &Job) -> Result<()> {
        let mut inner = self.lock();
        let slot = inner.slot_mut(job.id)?;
        slot.job.check_lease(job.lease)?;
        slot.lease_until = Some(Instant::now() + self.options.visibility_timeout);
        Ok(())
    }

    async fn checkpoint(&self, job: &Job, progress: serde_json::Value) -> Result<()> {
        let mut inner = self.lock();
        let slot = inner.slot_mut(job.id)?;
        slot.job.checkpoint(job.lease, progress)?;
        drop(inner);
        self.record("checkpoint");
        Ok(())
    }

    async fn complete(&self, job: &Job, result: serde_json::Value) -> Result<()> {
        let now = Instant::now();
        let mut inner = self.lock();
        let finished_seq = inner.next_seq();
        let slot = inner.slot_mut(job.id)?;
        slot.job.check_lease(job.lease)?;
        slot.job.complete(result, Utc::now())?;
        slot.lease_until = None;
        slot.finished_seq = finished_seq;

        let successor = slot.job.repeat_every_ms.map(|ms| {
            let interval = Duration::from_millis(ms);
            let mut next = Job::new(self.name, slot.job.payload.clone(), slot.job.max_attempts);
            next.priority = slot.job.priority;
            next.dedup_key = slot.job.dedup_key.clone();
            next.repeat_every_ms = Some(ms);
            next.run_at += chrono::Duration::from_std(interval).unwrap_or_default();
            (next, now + interval)
        });
        if let Some((next, ready_at)) = successor {
            debug!(queue = %self.name, job_id = %next.id, "repeat scheduled");
            inner.insert(next, ready_at);
        }
        inner.prune(JobState::Completed, self.options.remove_on_complete);
        drop(inner);

        self.record("complete");
        self.record_transition(JobState::Active, JobState::Completed);
        Ok(())
    }

    async fn fail(&self, job: &Job, error: &str, retryable: bool) -> Result<FailOutcome> {
        let now = Instant::now();
        let mut inner = self.lock();
        let finished_seq = inner.next_seq();
        let slot = inner.slot_mut(job.id)?;
        slot.job.check_lease(job.lease)?;
        let outcome = slot
            .job
            .fail(error, retryable, &self.options.backoff, Utc::now())?;
        slot.lease_until = None;
        let to = match outcome {
            FailOutcome::Retrying { delay, .. } => {
                slot.ready_at = now + delay;
                JobState::Delayed
            }
            FailOutcome::Dead { .. } => {
                slot.finished_seq = finished_seq;
                JobState::Failed
            }
        };
        inner.prune(JobState::Failed, self.options.remove_on_fail);
        drop(inner);

        self.record("fail");
        self.record_transition(JobState::Active, to);
        Ok(outcome)
    }

    async fn get(&self, id: JobId) -> Result<Job> {
        let inner = self.lock();
        inner
            .slots
            .get(&id)
            .map(|s| s.job.clone())
            .ok_or_else(|| Error::NotFound(format!("job {id}")))
    }

    async fn list(&self, state: JobState) -> Result<Vec<Job>> {
        let inner = self.lock();
        let mut slots: Vec<&Slot> = inner
            .slots
            .values()
            .filter(|s| s.job.state == state)
            .collect();
        slots.sort_by_key(|s| s.seq);
        Ok(slots.into_iter().map(|s| s.job.clone()).collect())
    }

    async fn stats(&self) -> Result<QueueStats> {
        let inner = self.lock();
        let mut stats = QueueStats::default();
        for slot in inner.slots.values() {
            stats.record(slot.job.state, 1);
        }
        Ok(stats)
    }

    async fn wait_for_work(&self, max: Duration) {
        let _ = tokio::time::timeout(max, self.notify.notified()).await;
    }
}
