//! Work queues: durable jobs with retries, backoff, leases and retention.
//!
//! A [`WorkQueue`] is constructed explicitly and handed to enqueuers and
//! workers. Two backends share the same semantics: [`MemoryQueue`] for a
//! single process and tests, and [`crate::db::PgQueue`] for Postgres + pgmq.
//! The atomic claim in `dequeue` is the mutual-exclusion boundary; workers
//! never lock anything themselves.

pub mod backoff;
pub mod memory;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::model::{FailOutcome, Job, JobId, JobState, QueueName};

pub use backoff::BackoffPolicy;
pub use memory::MemoryQueue;

/// Per-queue policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueOptions {
    pub backoff: BackoffPolicy,
    /// Hard limit on one attempt. Expiry counts as a failed attempt.
    pub job_timeout: Duration,
    /// Lease length. A claimed job not heartbeated within this window is
    /// reclaimable.
    pub visibility_timeout: Duration,
    /// Automatic stall recoveries before a job fails terminally.
    pub stall_limit: u32,
    /// Completed jobs retained for inspection.
    pub remove_on_complete: usize,
    /// Failed jobs retained for inspection.
    pub remove_on_fail: usize,
}

impl QueueOptions {
    /// Build queue: 3 attempts, 2 s base backoff, 10 minute job timeout.
    pub fn build() -> Self {
        Self {
            backoff: BackoffPolicy::new(Duration::from_secs(2), 2, Duration::from_secs(60), 3),
            job_timeout: Duration::from_secs(600),
            visibility_timeout: Duration::from_secs(60),
            stall_limit: 1,
            remove_on_complete: 100,
            remove_on_fail: 500,
        }
    }

    /// Deploy queue: 2 attempts, 5 s base backoff, 5 minute job timeout.
    pub fn deploy() -> Self {
        Self {
            backoff: BackoffPolicy::new(Duration::from_secs(5), 2, Duration::from_secs(60), 2),
            job_timeout: Duration::from_secs(300),
            visibility_timeout: Duration::from_secs(60),
            stall_limit: 1,
            remove_on_complete: 100,
            remove_on_fail: 500,
        }
    }

    pub fn for_queue(queue: QueueName) -> Self {
        match queue {
            QueueName::Build => Self::build(),
            QueueName::Deploy => Self::deploy(),
        }
    }
}

/// Options for a single enqueue.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnqueueOptions {
    pub max_attempts: Option<u32>,
    pub priority: i32,
    pub delay: Option<Duration>,
    /// Fixed-interval repeat: completing the job schedules a successor.
    pub repeat_every: Option<Duration>,
    /// Reject the enqueue while another unfinished job holds this key.
    pub dedup_key: Option<String>,
}

impl EnqueueOptions {
    pub fn max_attempts(mut self, n: u32) -> Self {
        self.max_attempts = Some(n);
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn repeat_every(mut self, interval: Duration) -> Self {
        self.repeat_every = Some(interval);
        self
    }

    pub fn dedup_key(mut self, key: impl Into<String>) -> Self {
        self.dedup_key = Some(key.into());
        self
    }

    /// Materialize a job for `queue` under these options.
    pub(crate) fn into_job(
        self,
        queue: QueueName,
        payload: serde_json::Value,
        defaults: &QueueOptions,
    ) -> Job {
        let mut job = Job::new(
            queue,
            payload,
            self.max_attempts.unwrap_or(defaults.backoff.max_attempts),
        );
        job.priority = self.priority;
        job.dedup_key = self.dedup_key;
        job.repeat_every_ms = self.repeat_every.map(|d| d.as_millis() as u64);
        if let Some(delay) = self.delay {
            job.run_at += chrono::Duration::from_std(delay).unwrap_or_default();
        }
        job
    }
}

/// Counts by state. Read-only.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub waiting: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
    pub delayed: u64,
}

impl QueueStats {
    pub(crate) fn record(&mut self, state: JobState, n: u64) {
        match state {
            JobState::Waiting => self.waiting += n,
            JobState::Active => self.active += n,
            JobState::Completed => self.completed += n,
            JobState::Failed => self.failed += n,
            JobState::Delayed => self.delayed += n,
        }
    }
}

/// A queue of jobs of one kind.
#[async_trait]
pub trait WorkQueue: Send + Sync {
    fn name(&self) -> QueueName;

    fn options(&self) -> &QueueOptions;

    /// Add a job. Fails with `QueueUnavailable` when the backing store cannot
    /// accept writes and `AdmissionRejected` on a dedup-key collision.
    async fn enqueue(&self, payload: serde_json::Value, options: EnqueueOptions) -> Result<JobId>;

    /// Atomically claim the next ready job, recovering stalled jobs first.
    async fn dequeue(&self, worker_id: &str) -> Result<Option<Job>>;

    /// Extend the lease of a claimed job.
    async fn heartbeat(&self, job: &Job) -> Result<()>;

    /// Save progress of a claimed job; later attempts read it from
    /// [`Job::result`].
    async fn checkpoint(&self, job: &Job, progress: serde_json::Value) -> Result<()>;

    async fn complete(&self, job: &Job, result: serde_json::Value) -> Result<()>;

    async fn fail(&self, job: &Job, error: &str, retryable: bool) -> Result<FailOutcome>;

    async fn get(&self, id: JobId) -> Result<Job>;

    async fn list(&self, state: JobState) -> Result<Vec<Job>>;

    async fn stats(&self) -> Result<QueueStats>;

    /// Wait until work may be available or `max` elapses.
    async fn wait_for_work(&self, max: Duration) {
        tokio::time::sleep(max).await;
    }
}
