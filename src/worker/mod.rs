//! Worker runtime: pulls jobs from one queue and runs them through a
//! [`Processor`].
//!
//! The pool claims a job only when it has a free concurrency permit, keeps
//! the lease alive with a heartbeat while the processor runs, enforces the
//! queue's hard job timeout and turns the processor's result into
//! `complete` or `fail(retryable)` on the queue.

pub mod build;
pub mod cancel;
pub mod deploy;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use opentelemetry::KeyValue;
use tokio::sync::{Notify, Semaphore};
use tracing::{Instrument, error, info, warn};

use crate::error::{Error, Result};
use crate::model::{FailOutcome, Job, JobId};
use crate::queue::WorkQueue;
use crate::telemetry::job::{record_state_transition, start_job_span};
use crate::telemetry::metrics;

pub use build::{BuildProcessor, submit_build};
pub use cancel::{CancelRegistry, Registration, cancel_build};
pub use deploy::{
    DeployProcessor, DeployProvider, DeployStatus, DeploymentHandle, NullDeployProvider,
};

/// Work done for one claimed job.
#[async_trait]
pub trait Processor: Send + Sync {
    /// Run one attempt. The returned value is stored as the job result.
    /// `queue` is the job's own queue, for checkpoints.
    async fn process(&self, job: &Job, queue: &dyn WorkQueue) -> Result<serde_json::Value>;

    /// Called after a failed attempt was scheduled for retry.
    async fn on_retry(&self, _job: &Job, _error: &Error, _delay: Duration) {}

    /// Called once the job has failed terminally.
    async fn on_dead(&self, _job: &Job, _error: &Error) {}
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Jobs run in parallel by this pool.
    pub concurrency: usize,
    /// Fallback poll interval when no wake-up arrives.
    pub poll_interval: Duration,
    pub worker_id: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 2,
            poll_interval: Duration::from_secs(2),
            worker_id: format!("worker-{}", std::process::id()),
        }
    }
}

/// How one claimed job ended, from the pool's point of view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobRun {
    Completed(JobId),
    Retrying(JobId),
    Dead(JobId),
    /// The lease lapsed and another worker owns the job now.
    LeaseLost(JobId),
    /// The outcome could not be written; the job is reclaimed when its
    /// lease lapses.
    Unrecorded(JobId),
}

/// Runs a processor against one queue.
pub struct WorkerPool {
    queue: Arc<dyn WorkQueue>,
    processor: Arc<dyn Processor>,
    config: WorkerConfig,
    shutdown: Arc<Notify>,
    permits: Arc<Semaphore>,
    active: Arc<AtomicUsize>,
}

impl Clone for WorkerPool {
    fn clone(&self) -> Self {
        Self {
            queue: Arc::clone(&self.queue),
            processor: Arc::clone(&self.processor),
            config: self.config.clone(),
            shutdown: Arc::clone(&self.shutdown),
            permits: Arc::clone(&self.permits),
            active: Arc::clone(&self.active),
        }
    }
}

impl WorkerPool {
    pub fn new(queue: Arc<dyn WorkQueue>, processor: Arc<dyn Processor>, config: WorkerConfig) -> Self {
        let concurrency = config.concurrency.max(1);
        Self {
            queue,
            processor,
            config,
            shutdown: Arc::new(Notify::new()),
            permits: Arc::new(Semaphore::new(concurrency)),
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Signal the pool to stop claiming jobs.
    pub fn shutdown(&self) {
        self.shutdown.notify_one();
    }

    /// Jobs currently executing.
    pub fn active(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    /// Claim and run jobs until shutdown, then wait for in-flight jobs.
    pub async fn run(&self) -> Result<()> {
        let queue_name = self.queue.name();
        info!(queue = %queue_name, concurrency = self.config.concurrency, "worker pool started");

        loop {
            let permit = tokio::select! {
                _ = self.shutdown.notified() => break,
                permit = Arc::clone(&self.permits).acquire_owned() => permit
                    .map_err(|_| Error::Other("worker semaphore closed".to_string()))?,
            };

            match self.queue.dequeue(&self.config.worker_id).await {
                Ok(Some(job)) => {
                    let pool = self.clone();
                    tokio::spawn(async move {
                        let _permit = permit;
                        pool.execute(job).await;
                    });
                }
                Ok(None) => {
                    drop(permit);
                    tokio::select! {
                        _ = self.shutdown.notified() => break,
                        _ = self.queue.wait_for_work(self.config.poll_interval) => {}
                    }
                }
                Err(e) => {
                    drop(permit);
                    error!(queue = %queue_name, "dequeue error: {e}");
                    tokio::select! {
                        _ = self.shutdown.notified() => break,
                        _ = tokio::time::sleep(self.config.poll_interval) => {}
                    }
                }
            }
        }

        info!(queue = %queue_name, active = self.active(), "worker pool draining");
        let all = self.config.concurrency.max(1) as u32;
        let _drained = self.permits.acquire_many(all).await;
        info!(queue = %queue_name, "worker pool stopped");
        Ok(())
    }

    /// Claim one job and run it to its outcome on the current task.
    pub async fn process_next(&self) -> Result<Option<JobRun>> {
        match self.queue.dequeue(&self.config.worker_id).await? {
            Some(job) => Ok(Some(self.execute(job).await)),
            None => Ok(None),
        }
    }

    async fn execute(&self, job: Job) -> JobRun {
        let queue_name = self.queue.name();
        let span = start_job_span(queue_name.as_str(), &job.id, job.attempts);
        self.active.fetch_add(1, Ordering::Relaxed);

        let run = async {
            record_state_transition(&span, "waiting", "active");
            let heartbeat = self.spawn_heartbeat(&job);
            let started = Instant::now();
            let timeout = self.queue.options().job_timeout;

            let result = match tokio::time::timeout(timeout, self.processor.process(&job, self.queue.as_ref())).await {
                Ok(result) => result,
                Err(_) => Err(Error::JobTimeout(timeout)),
            };
            heartbeat.abort();
            let duration_ms = started.elapsed().as_secs_f64() * 1000.0;
            metrics::operation_duration_ms().record(
                duration_ms,
                &[KeyValue::new("operation", format!("{queue_name}.process"))],
            );

            match result {
                Ok(value) => match self.queue.complete(&job, value).await {
                    Ok(()) => {
                        record_state_transition(&span, "active", "completed");
                        info!(job_id = %job.id, duration_ms, "job completed");
                        JobRun::Completed(job.id)
                    }
                    Err(e) => self.settle_error(&job, e),
                },
                Err(err) => {
                    let retryable = err.is_retryable();
                    match self.queue.fail(&job, &err.to_string(), retryable).await {
                        Ok(FailOutcome::Retrying { delay, attempt }) => {
                            record_state_transition(&span, "active", "delayed");
                            warn!(job_id = %job.id, attempt, ?delay, kind = err.kind(), "attempt failed, retrying: {err}");
                            self.processor.on_retry(&job, &err, delay).await;
                            JobRun::Retrying(job.id)
                        }
                        Ok(FailOutcome::Dead { attempts }) => {
                            record_state_transition(&span, "active", "failed");
                            error!(job_id = %job.id, attempts, kind = err.kind(), "job failed: {err}");
                            self.processor.on_dead(&job, &err).await;
                            JobRun::Dead(job.id)
                        }
                        Err(e) => self.settle_error(&job, e),
                    }
                }
            }
        };
        let outcome = run.instrument(span.clone()).await;
        self.active.fetch_sub(1, Ordering::Relaxed);
        outcome
    }

    /// A complete/fail that could not be recorded. Losing the lease means
    /// another worker now owns the job; anything else leaves the job to be
    /// reclaimed once its lease lapses.
    fn settle_error(&self, job: &Job, e: Error) -> JobRun {
        match e {
            Error::LeaseLost(_) => {
                warn!(job_id = %job.id, "lease lost before the outcome was recorded");
                JobRun::LeaseLost(job.id)
            }
            other => {
                error!(job_id = %job.id, "failed to record job outcome: {other}");
                JobRun::Unrecorded(job.id)
            }
        }
    }

    fn spawn_heartbeat(&self, job: &Job) -> tokio::task::JoinHandle<()> {
        let queue = Arc::clone(&self.queue);
        let job = job.clone();
        let every = (queue.options().visibility_timeout / 2).max(Duration::from_millis(10));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match queue.heartbeat(&job).await {
                    Ok(()) => {}
                    Err(Error::LeaseLost(_)) => {
                        warn!(job_id = %job.id, "heartbeat rejected, lease lost");
                        break;
                    }
                    Err(e) => warn!(job_id = %job.id, "heartbeat failed: {e}"),
                }
            }
        })
    }
}
