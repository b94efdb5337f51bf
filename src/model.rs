//! Core data model.
//!
//! A job is one unit of queued work: a build or a deploy. It carries an
//! opaque payload, an attempt budget and a lifecycle state. The transition
//! methods on [`Job`] are the single source of truth for lifecycle rules;
//! every queue backend applies them rather than re-deriving the rules.

pub mod change;
pub mod project;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::queue::backoff::BackoffPolicy;

pub use change::{ChangeSet, FileAction, FileChange};
pub use project::{
    ConversationMessage, DeploymentRecord, DeploymentState, ProjectFile, ProjectStatus, Role,
    Version,
};

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// Newtype for job IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for JobId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(JobId)
            .map_err(|e| Error::Other(format!("bad job id {s}: {e}")))
    }
}

/// The two queues the core runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueName {
    Build,
    Deploy,
}

impl QueueName {
    pub fn as_str(self) -> &'static str {
        match self {
            QueueName::Build => "build",
            QueueName::Deploy => "deploy",
        }
    }
}

impl std::fmt::Display for QueueName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for QueueName {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "build" => Ok(QueueName::Build),
            "deploy" => Ok(QueueName::Deploy),
            other => Err(Error::NotFound(format!("queue {other}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Ready to be claimed.
    Waiting,
    /// Claimed by exactly one worker.
    Active,
    /// Done successfully. Terminal.
    Completed,
    /// Attempts exhausted or failed with a non-retryable error. Terminal.
    Failed,
    /// Scheduled for a retry after a backoff delay.
    Delayed,
}

impl JobState {
    /// Can transition from self to `to`?
    pub fn can_transition_to(self, to: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, to),
            (Waiting, Active)
                | (Active, Completed)
                | (Active, Failed)
                | (Active, Delayed) // retry or stall recovery
                | (Delayed, Waiting)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Waiting => "waiting",
            JobState::Active => "active",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Delayed => "delayed",
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "waiting" => Ok(JobState::Waiting),
            "active" => Ok(JobState::Active),
            "completed" => Ok(JobState::Completed),
            "failed" => Ok(JobState::Failed),
            "delayed" => Ok(JobState::Delayed),
            other => Err(Error::Other(format!("unknown job state: {other}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Job
// ---------------------------------------------------------------------------

/// A unit of queued work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub queue: QueueName,
    /// Worker-specific parameters. The queue never interprets these.
    pub payload: serde_json::Value,
    /// Attempts made so far. Incremented on every claim.
    pub attempts: u32,
    pub max_attempts: u32,
    /// Higher is claimed first.
    pub priority: i32,
    pub state: JobState,
    /// Admission-control key: at most one unfinished job per key.
    pub dedup_key: Option<String>,
    /// When set, completing the job schedules a successor this far out.
    pub repeat_every_ms: Option<u64>,
    /// Times the job was recovered after its lease lapsed.
    pub stalls: u32,
    /// Claim token of the current attempt. Cleared when the attempt ends.
    pub lease: Option<Uuid>,
    pub enqueued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Earliest time the job may be claimed.
    pub run_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub result: Option<serde_json::Value>,
}

/// What happened to a job after a failed or stalled attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    /// Another attempt is scheduled after `delay`.
    Retrying { delay: std::time::Duration, attempt: u32 },
    /// The job reached terminal `failed`.
    Dead { attempts: u32 },
}

impl Job {
    pub fn new(queue: QueueName, payload: serde_json::Value, max_attempts: u32) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            queue,
            payload,
            attempts: 0,
            max_attempts: max_attempts.max(1),
            priority: 0,
            state: JobState::Waiting,
            dedup_key: None,
            repeat_every_ms: None,
            stalls: 0,
            lease: None,
            enqueued_at: now,
            started_at: None,
            finished_at: None,
            run_at: now,
            last_error: None,
            result: None,
        }
    }

    /// Deserialize the payload into a typed struct.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.payload.clone()).map_err(Error::from)
    }

    fn transition(&mut self, to: JobState) -> Result<()> {
        if !self.state.can_transition_to(to) {
            return Err(Error::InvalidTransition {
                from: self.state.to_string(),
                to: to.to_string(),
            });
        }
        self.state = to;
        Ok(())
    }

    /// Verify that `lease` is the current claim on this job.
    pub fn check_lease(&self, lease: Option<Uuid>) -> Result<()> {
        if self.state == JobState::Active && lease.is_some() && self.lease == lease {
            Ok(())
        } else {
            Err(Error::LeaseLost(self.id))
        }
    }

    /// Claim the job for a new attempt: waiting (or due delayed) → active.
    pub fn begin_attempt(&mut self, now: DateTime<Utc>) -> Result<Uuid> {
        if self.state == JobState::Delayed {
            self.transition(JobState::Waiting)?;
        }
        if self.attempts >= self.max_attempts {
            return Err(Error::InvalidTransition {
                from: format!("{} ({} attempts)", self.state, self.attempts),
                to: JobState::Active.to_string(),
            });
        }
        self.transition(JobState::Active)?;
        self.attempts += 1;
        self.started_at = Some(now);
        self.finished_at = None;
        let lease = Uuid::new_v4();
        self.lease = Some(lease);
        Ok(lease)
    }

    /// Store progress of the running attempt in `result`. A retried attempt
    /// sees the last checkpoint; completion overwrites it.
    pub fn checkpoint(&mut self, lease: Option<Uuid>, progress: serde_json::Value) -> Result<()> {
        self.check_lease(lease)?;
        self.result = Some(progress);
        Ok(())
    }

    /// active → completed.
    pub fn complete(&mut self, result: serde_json::Value, now: DateTime<Utc>) -> Result<()> {
        self.transition(JobState::Completed)?;
        self.result = Some(result);
        self.finished_at = Some(now);
        self.lease = None;
        Ok(())
    }

    /// active → delayed (retry) or failed (terminal).
    ///
    /// `attempts` was already incremented by [`Job::begin_attempt`], so the
    /// current value is compared directly against the budget.
    pub fn fail(
        &mut self,
        error: &str,
        retryable: bool,
        policy: &BackoffPolicy,
        now: DateTime<Utc>,
    ) -> Result<FailOutcome> {
        self.last_error = Some(error.to_string());
        self.lease = None;
        let policy = policy.with_max_attempts(self.max_attempts);
        if retryable && policy.allows_retry(self.attempts) {
            let delay = policy.delay_for(self.attempts);
            self.transition(JobState::Delayed)?;
            self.run_at = now + chrono::Duration::from_std(delay).unwrap_or_default();
            Ok(FailOutcome::Retrying {
                delay,
                attempt: self.attempts,
            })
        } else {
            self.transition(JobState::Failed)?;
            self.finished_at = Some(now);
            Ok(FailOutcome::Dead {
                attempts: self.attempts,
            })
        }
    }

    /// Recover an active job whose lease lapsed (worker died mid-attempt).
    ///
    /// The job is requeued immediately while it has stall budget and
    /// attempts left; otherwise it fails terminally so a poisoned job cannot
    /// loop forever.
    pub fn stall(&mut self, stall_limit: u32, now: DateTime<Utc>) -> Result<FailOutcome> {
        self.stalls += 1;
        self.lease = None;
        let error = format!("stalled: lease expired during attempt {}", self.attempts);
        self.last_error = Some(error);
        if self.stalls <= stall_limit && self.attempts < self.max_attempts {
            self.transition(JobState::Delayed)?;
            self.run_at = now;
            Ok(FailOutcome::Retrying {
                delay: std::time::Duration::ZERO,
                attempt: self.attempts,
            })
        } else {
            self.transition(JobState::Failed)?;
            self.finished_at = Some(now);
            Ok(FailOutcome::Dead {
                attempts: self.attempts,
            })
        }
    }
}

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

/// Payload of a build job, produced by the message-send flow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildPayload {
    pub project_id: String,
    pub conversation_id: String,
    pub message_id: String,
    /// Model override; `None` uses the client's default model.
    #[serde(default)]
    pub model: Option<String>,
}

/// Payload of a deploy job, chained from a successful build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeployPayload {
    pub project_id: String,
    pub version_number: u32,
    #[serde(default)]
    pub build_job: Option<JobId>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn policy() -> BackoffPolicy {
        BackoffPolicy::new(Duration::from_secs(2), 2, Duration::from_secs(60), 3)
    }

    #[test]
    fn lifecycle_never_skips_active() {
        let mut job = Job::new(QueueName::Build, serde_json::json!({}), 3);
        assert!(job.complete(serde_json::json!(null), Utc::now()).is_err());

        job.begin_attempt(Utc::now()).unwrap();
        assert_eq!(job.state, JobState::Active);
        assert_eq!(job.attempts, 1);
        job.complete(serde_json::json!({"ok": true}), Utc::now()).unwrap();
        assert_eq!(job.state, JobState::Completed);
        assert!(job.lease.is_none());
    }

    #[test]
    fn retry_then_dead_after_budget() {
        let mut job = Job::new(QueueName::Deploy, serde_json::json!({}), 2);

        job.begin_attempt(Utc::now()).unwrap();
        let outcome = job.fail("boom", true, &policy(), Utc::now()).unwrap();
        assert_eq!(
            outcome,
            FailOutcome::Retrying {
                delay: Duration::from_secs(2),
                attempt: 1
            }
        );
        assert_eq!(job.state, JobState::Delayed);

        job.begin_attempt(Utc::now()).unwrap();
        let outcome = job.fail("boom again", true, &policy(), Utc::now()).unwrap();
        assert_eq!(outcome, FailOutcome::Dead { attempts: 2 });
        assert_eq!(job.state, JobState::Failed);
        assert!(job.begin_attempt(Utc::now()).is_err());
    }

    #[test]
    fn job_budget_overrides_queue_policy() {
        let mut job = Job::new(QueueName::Build, serde_json::json!({}), 4);
        for attempt in 1..=3 {
            job.begin_attempt(Utc::now()).unwrap();
            let outcome = job.fail("boom", true, &policy(), Utc::now()).unwrap();
            assert!(matches!(outcome, FailOutcome::Retrying { attempt: a, .. } if a == attempt));
        }
        job.begin_attempt(Utc::now()).unwrap();
        let outcome = job.fail("boom", true, &policy(), Utc::now()).unwrap();
        assert_eq!(outcome, FailOutcome::Dead { attempts: 4 });
    }

    #[test]
    fn checkpoint_survives_a_retry() {
        let mut job = Job::new(QueueName::Build, serde_json::json!({}), 3);
        let lease = job.begin_attempt(Utc::now()).unwrap();
        job.checkpoint(Some(lease), serde_json::json!({"step": 1})).unwrap();
        job.fail("boom", true, &policy(), Utc::now()).unwrap();
        assert!(job.checkpoint(Some(lease), serde_json::json!({"step": 2})).is_err());

        job.begin_attempt(Utc::now()).unwrap();
        assert_eq!(job.result, Some(serde_json::json!({"step": 1})));
    }

    #[test]
    fn non_retryable_failure_is_terminal_on_first_attempt() {
        let mut job = Job::new(QueueName::Build, serde_json::json!({}), 3);
        job.begin_attempt(Utc::now()).unwrap();
        let outcome = job.fail("no changes", false, &policy(), Utc::now()).unwrap();
        assert_eq!(outcome, FailOutcome::Dead { attempts: 1 });
    }

    #[test]
    fn second_stall_escalates() {
        let mut job = Job::new(QueueName::Build, serde_json::json!({}), 3);
        job.begin_attempt(Utc::now()).unwrap();
        assert!(matches!(
            job.stall(1, Utc::now()).unwrap(),
            FailOutcome::Retrying { .. }
        ));
        job.begin_attempt(Utc::now()).unwrap();
        assert_eq!(
            job.stall(1, Utc::now()).unwrap(),
            FailOutcome::Dead { attempts: 2 }
        );
    }

    #[test]
    fn stale_lease_is_rejected() {
        let mut job = Job::new(QueueName::Build, serde_json::json!({}), 3);
        let first = job.begin_attempt(Utc::now()).unwrap();
        job.stall(1, Utc::now()).unwrap();
        let second = job.begin_attempt(Utc::now()).unwrap();
        assert!(job.check_lease(Some(first)).is_err());
        assert!(job.check_lease(Some(second)).is_ok());
    }
}
