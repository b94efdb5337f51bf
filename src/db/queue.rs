//! Postgres-backed [`WorkQueue`].
//!
//! Job records live in the `jobs` table; pgmq carries delivery. A pgmq
//! message holds only the job id. Reading it hides it for the visibility
//! timeout, which is the job's lease: heartbeats push the message's
//! visibility out, a retry pushes it out by the backoff delay, and a
//! finished job archives it. A message that reappears while its job row is
//! still `active` means the worker stopped heartbeating, so the job is
//! recovered as stalled.
//!
//! pgmq delivers in message order, so `priority` is recorded but does not
//! reorder delivery on this backend.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use opentelemetry::KeyValue;
use sqlx::{PgConnection, Postgres, Transaction};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{Db, pgmq};
use crate::error::{Error, Result};
use crate::model::{FailOutcome, Job, JobId, JobState, QueueName};
use crate::queue::{EnqueueOptions, QueueOptions, QueueStats, WorkQueue};
use crate::telemetry::metrics;

/// Reads per `dequeue` call before reporting an empty queue. Bounds the
/// work spent skipping messages of finished jobs.
const MAX_READS_PER_DEQUEUE: usize = 8;

fn unavailable(e: Error) -> Error {
    match e {
        Error::Database(db) => Error::QueueUnavailable(db.to_string()),
        other => other,
    }
}

fn secs(d: Duration) -> i32 {
    d.as_secs().min(i32::MAX as u64) as i32
}

pub struct PgQueue {
    db: Arc<Db>,
    name: QueueName,
    options: QueueOptions,
    pgmq_name: String,
}

impl PgQueue {
    pub fn new(db: Arc<Db>, name: QueueName, options: QueueOptions) -> Self {
        Self {
            db,
            name,
            options,
            pgmq_name: format!("shipwright_{}", name.as_str()),
        }
    }

    /// Create the pgmq queue if it does not exist yet.
    pub async fn ensure(&self) -> Result<()> {
        pgmq::create_queue(self.db.pool(), &self.pgmq_name).await
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

    async fn begin(&self) -> Result<Transaction<'static, Postgres>> {
        Ok(self.db.pool().begin().await?)
    }

    async fn insert_job(&self, conn: &mut PgConnection, job: &Job) -> Result<bool> {
        let inserted: Option<(Uuid,)> = sqlx::query_as(
            "INSERT INTO jobs (id, queue, payload, attempts, max_attempts, priority, state, dedup_key,
                               repeat_every_ms, stalls, enqueued_at, run_at)
             VALUES ($1, $2, $3, 0, $4, $5, $6, $7, $8, 0, $9, $10)
             ON CONFLICT (queue, dedup_key) WHERE dedup_key IS NOT NULL AND state NOT IN ('completed', 'failed')
             DO NOTHING
             RETURNING id",
        )
        .bind(job.id.0)
        .bind(self.name.as_str())
        .bind(&job.payload)
        .bind(job.max_attempts as i32)
        .bind(job.priority)
        .bind(job.state.as_str())
        .bind(&job.dedup_key)
        .bind(job.repeat_every_ms.map(|ms| ms as i64))
        .bind(job.enqueued_at)
        .bind(job.run_at)
        .fetch_optional(&mut *conn)
        .await?;
        if inserted.is_none() {
            return Ok(false);
        }

        let delay = (job.run_at - Utc::now()).num_seconds().max(0) as i32;
        let msg_id = pgmq::send(
            &mut *conn,
            &self.pgmq_name,
            &serde_json::json!({ "job_id": job.id }),
            delay,
        )
        .await?;
        sqlx::query("UPDATE jobs SET msg_id = $1 WHERE id = $2")
            .bind(msg_id)
            .bind(job.id.0)
            .execute(&mut *conn)
            .await?;
        Ok(true)
    }

    async fn load_for_update(&self, conn: &mut PgConnection, id: JobId) -> Result<Option<(Job, Option<i64>)>> {
        let row: Option<JobRow> = sqlx::query_as(
            "SELECT id, queue, payload, attempts, max_attempts, priority, state, dedup_key,
                    repeat_every_ms, stalls, lease, msg_id, enqueued_at, started_at, finished_at,
                    run_at, last_error, result
             FROM jobs WHERE id = $1 AND queue = $2 FOR UPDATE",
        )
        .bind(id.0)
        .bind(self.name.as_str())
        .fetch_optional(&mut *conn)
        .await?;
        row.map(JobRow::try_into_job).transpose()
    }

    async fn save(&self, conn: &mut PgConnection, job: &Job) -> Result<()> {
        sqlx::query(
            "UPDATE jobs SET attempts = $1, state = $2, stalls = $3, lease = $4, started_at = $5,
                             finished_at = $6, run_at = $7, last_error = $8, result = $9
             WHERE id = $10",
        )
        .bind(job.attempts as i32)
        .bind(job.state.as_str())
        .bind(job.stalls as i32)
        .bind(job.lease)
        .bind(job.started_at)
        .bind(job.finished_at)
        .bind(job.run_at)
        .bind(&job.last_error)
        .bind(&job.result)
        .bind(job.id.0)
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    /// Keep the newest `cap` jobs in terminal `state`.
    async fn prune(&self, conn: &mut PgConnection, state: JobState, cap: usize) -> Result<()> {
        let removed = sqlx::query(
            "DELETE FROM jobs WHERE queue = $1 AND state = $2 AND id NOT IN (
                 SELECT id FROM jobs WHERE queue = $1 AND state = $2
                 ORDER BY finished_at DESC NULLS LAST LIMIT $3)",
        )
        .bind(self.name.as_str())
        .bind(state.as_str())
        .bind(cap as i64)
        .execute(&mut *conn)
        .await?
        .rows_affected();
        if removed > 0 {
            debug!(queue = %self.name, state = state.as_str(), removed, "pruned finished jobs");
        }
        Ok(())
    }

    /// Claim the job behind one pgmq message, or settle a message whose job
    /// cannot run.
    async fn claim(&self, msg: &pgmq::PgmqMessage) -> Result<Option<Job>> {
        let Some(job_id) = msg
            .message
            .get("job_id")
            .and_then(|v| v.as_str())
            .and_then(|s| Uuid::parse_str(s).ok())
            .map(JobId)
        else {
            warn!(queue = %self.name, msg_id = msg.msg_id, "bad pgmq payload, archiving");
            pgmq::archive(self.db.pool(), &self.pgmq_name, msg.msg_id).await?;
            return Ok(None);
        };

        let mut tx = self.begin().await?;
        let Some((mut job, _)) = self.load_for_update(&mut tx, job_id).await? else {
            pgmq::archive(&mut *tx, &self.pgmq_name, msg.msg_id).await?;
            tx.commit().await?;
            return Ok(None);
        };
        let now = Utc::now();

        if job.state.is_terminal() {
            pgmq::archive(&mut *tx, &self.pgmq_name, msg.msg_id).await?;
            tx.commit().await?;
            return Ok(None);
        }

        if job.state == JobState::Active {
            // The message came back while the job was still claimed.
            match job.stall(self.options.stall_limit, now)? {
                FailOutcome::Retrying { .. } => {
                    warn!(queue = %self.name, job_id = %job.id, stalls = job.stalls, "stalled job requeued");
                    self.record_transition(JobState::Active, JobState::Delayed);
                }
                FailOutcome::Dead { attempts } => {
                    warn!(queue = %self.name, job_id = %job.id, attempts, "stalled job failed terminally");
                    self.save(&mut tx, &job).await?;
                    pgmq::archive(&mut *tx, &self.pgmq_name, msg.msg_id).await?;
                    self.prune(&mut tx, JobState::Failed, self.options.remove_on_fail).await?;
                    tx.commit().await?;
                    self.record_transition(JobState::Active, JobState::Failed);
                    return Ok(None);
                }
            }
        }

        let from = job.state;
        if let Err(e) = job.begin_attempt(now) {
            warn!(queue = %self.name, job_id = %job.id, "job cannot be claimed: {e}");
            job.state = JobState::Failed;
            job.finished_at = Some(now);
            self.save(&mut tx, &job).await?;
            pgmq::archive(&mut *tx, &self.pgmq_name, msg.msg_id).await?;
            tx.commit().await?;
            return Ok(None);
        }
        self.save(&mut tx, &job).await?;
        sqlx::query("UPDATE jobs SET msg_id = $1 WHERE id = $2")
            .bind(msg.msg_id)
            .bind(job.id.0)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        self.record_transition(from, JobState::Active);
        Ok(Some(job))
    }
}

#[async_trait]
impl WorkQueue for PgQueue {
    fn name(&self) -> QueueName {
        self.name
    }

    fn options(&self) -> &QueueOptions {
        &self.options
    }

    async fn enqueue(&self, payload: serde_json::Value, options: EnqueueOptions) -> Result<JobId> {
        let job = options.into_job(self.name, payload, &self.options);
        let mut tx = self.begin().await.map_err(unavailable)?;

        if !self.insert_job(&mut tx, &job).await.map_err(unavailable)? {
            let key = job.dedup_key.clone().unwrap_or_default();
            let existing: (Uuid,) = sqlx::query_as(
                "SELECT id FROM jobs WHERE queue = $1 AND dedup_key = $2
                 AND state NOT IN ('completed', 'failed') LIMIT 1",
            )
            .bind(self.name.as_str())
            .bind(&key)
            .fetch_one(&mut *tx)
            .await?;
            tx.rollback().await?;
            metrics::jobs_enqueued().add(
                1,
                &[
                    KeyValue::new("queue", self.name.as_str()),
                    KeyValue::new("result", "rejected"),
                ],
            );
            return Err(Error::AdmissionRejected {
                key,
                existing: JobId(existing.0),
            });
        }
        tx.commit()
            .await
            .map_err(|e| Error::QueueUnavailable(e.to_string()))?;

        metrics::jobs_enqueued().add(
            1,
            &[
                KeyValue::new("queue", self.name.as_str()),
                KeyValue::new("result", "ok"),
            ],
        );
        info!(queue = %self.name, job_id = %job.id, "job enqueued");
        Ok(job.id)
    }

    async fn dequeue(&self, worker_id: &str) -> Result<Option<Job>> {
        let vt = secs(self.options.visibility_timeout).max(1);
        for _ in 0..MAX_READS_PER_DEQUEUE {
            let Some(msg) = pgmq::read(self.db.pool(), &self.pgmq_name, vt)
                .await
                .map_err(unavailable)?
            else {
                return Ok(None);
            };
            if let Some(job) = self.claim(&msg).await? {
                debug!(queue = %self.name, job_id = %job.id, worker_id, attempt = job.attempts, "job claimed");
                return Ok(Some(job));
            }
        }
        Ok(None)
    }

    async fn heartbeat(&self, job: &Job) -> Result<()> {
        let mut tx = self.begin().await?;
        let (current, msg_id) = self
            .load_for_update(&mut tx, job.id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("job {}", job.id)))?;
        current.check_lease(job.lease)?;
        if let Some(msg_id) = msg_id {
            pgmq::set_vt(&mut *tx, &self.pgmq_name, msg_id, secs(self.options.visibility_timeout)).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn checkpoint(&self, job: &Job, progress: serde_json::Value) -> Result<()> {
        let mut tx = self.begin().await?;
        let (mut current, _) = self
            .load_for_update(&mut tx, job.id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("job {}", job.id)))?;
        current.checkpoint(job.lease, progress)?;
        self.save(&mut tx, &current).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn complete(&self, job: &Job, result: serde_json::Value) -> Result<()> {
        let mut tx = self.begin().await?;
        let (mut current, msg_id) = self
            .load_for_update(&mut tx, job.id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("job {}", job.id)))?;
        current.check_lease(job.lease)?;
        current.complete(result, Utc::now())?;
        self.save(&mut tx, &current).await?;
        if let Some(msg_id) = msg_id {
            pgmq::archive(&mut *tx, &self.pgmq_name, msg_id).await?;
        }

        if let Some(ms) = current.repeat_every_ms {
            let mut next = Job::new(self.name, current.payload.clone(), current.max_attempts);
            next.priority = current.priority;
            next.dedup_key = current.dedup_key.clone();
            next.repeat_every_ms = Some(ms);
            next.run_at += chrono::Duration::milliseconds(ms as i64);
            self.insert_job(&mut tx, &next).await?;
            debug!(queue = %self.name, job_id = %next.id, "repeat scheduled");
        }
        self.prune(&mut tx, JobState::Completed, self.options.remove_on_complete)
            .await?;
        tx.commit().await?;
        self.record_transition(JobState::Active, JobState::Completed);
        Ok(())
    }

    async fn fail(&self, job: &Job, error: &str, retryable: bool) -> Result<FailOutcome> {
        let mut tx = self.begin().await?;
        let (mut current, msg_id) = self
            .load_for_update(&mut tx, job.id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("job {}", job.id)))?;
        current.check_lease(job.lease)?;
        let outcome = current.fail(error, retryable, &self.options.backoff, Utc::now())?;
        self.save(&mut tx, &current).await?;

        let to = match (outcome, msg_id) {
            (FailOutcome::Retrying { delay, .. }, Some(msg_id)) => {
                pgmq::set_vt(&mut *tx, &self.pgmq_name, msg_id, secs(delay)).await?;
                JobState::Delayed
            }
            (FailOutcome::Retrying { .. }, None) => JobState::Delayed,
            (FailOutcome::Dead { .. }, msg_id) => {
                if let Some(msg_id) = msg_id {
                    pgmq::archive(&mut *tx, &self.pgmq_name, msg_id).await?;
                }
                self.prune(&mut tx, JobState::Failed, self.options.remove_on_fail)
                    .await?;
                JobState::Failed
            }
        };
        tx.commit().await?;
        self.record_transition(JobState::Active, to);
        Ok(outcome)
    }

    async fn get(&self, id: JobId) -> Result<Job> {
        let row: Option<JobRow> = sqlx::query_as(
            "SELECT id, queue, payload, attempts, max_attempts, priority, state, dedup_key,
                    repeat_every_ms, stalls, lease, msg_id, enqueued_at, started_at, finished_at,
                    run_at, last_error, result
             FROM jobs WHERE id = $1 AND queue = $2",
        )
        .bind(id.0)
        .bind(self.name.as_str())
        .fetch_optional(self.db.pool())
        .await?;
        row.map(|r| r.try_into_job().map(|(job, _)| job))
            .transpose()?
            .ok_or_else(|| Error::NotFound(format!("job {id}")))
    }

    async fn list(&self, state: JobState) -> Result<Vec<Job>> {
        let rows: Vec<JobRow> = sqlx::query_as(
            "SELECT id, queue, payload, attempts, max_attempts, priority, state, dedup_key,
                    repeat_every_ms, stalls, lease, msg_id, enqueued_at, started_at, finished_at,
                    run_at, last_error, result
             FROM jobs WHERE queue = $1 AND state = $2 ORDER BY enqueued_at",
        )
        .bind(self.name.as_str())
        .bind(state.as_str())
        .fetch_all(self.db.pool())
        .await?;
        rows.into_iter()
            .map(|r| r.try_into_job().map(|(job, _)| job))
            .collect()
    }

    async fn stats(&self) -> Result<QueueStats> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT state, COUNT(*) FROM jobs WHERE queue = $1 GROUP BY state")
                .bind(self.name.as_str())
                .fetch_all(self.db.pool())
                .await?;
        let mut stats = QueueStats::default();
        for (state, count) in rows {
            stats.record(state.parse()?, count as u64);
        }
        Ok(stats)
    }
}

#[derive(sqlx::FromRow)]
struct JobRow {
    id: Uuid,
    queue: String,
    payload: serde_json::Value,
    attempts: i32,
    max_attempts: i32,
    priority: i32,
    state: String,
    dedup_key: Option<String>,
    repeat_every_ms: Option<i64>,
    stalls: i32,
    lease: Option<Uuid>,
    msg_id: Option<i64>,
    enqueued_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    run_at: DateTime<Utc>,
    last_error: Option<String>,
    result: Option<serde_json::Value>,
}

impl JobRow {
    fn try_into_job(self) -> Result<(Job, Option<i64>)> {
        let job = Job {
            id: JobId(self.id),
            queue: self.queue.parse()?,
            payload: self.payload,
            attempts: self.attempts as u32,
            max_attempts: self.max_attempts as u32,
            priority: self.priority,
            state: self.state.parse()?,
            dedup_key: self.dedup_key,
            repeat_every_ms: self.repeat_every_ms.map(|ms| ms as u64),
            stalls: self.stalls as u32,
            lease: self.lease,
            enqueued_at: self.enqueued_at,
            started_at: self.started_at,
            finished_at: self.finished_at,
            run_at: self.run_at,
            last_error: self.last_error,
            result: self.result,
        };
        Ok((job, self.msg_id))
    }
}
