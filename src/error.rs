//! Error types for shipwright.
//!
//! One enum covers the whole taxonomy: infrastructure failures, agent logic
//! failures and deploy failures. Workers decide between retry and terminal
//! failure through [`Error::is_retryable`].

use std::time::Duration;

use thiserror::Error;

use crate::model::JobId;
use crate::validator::FileIssue;

#[derive(Debug, Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid state transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    /// The worker's claim on a job expired and another worker may own it.
    #[error("lease lost for job {0}")]
    LeaseLost(JobId),

    #[error("queue unavailable: {0}")]
    QueueUnavailable(String),

    #[error("job {existing} is already in flight for {key}")]
    AdmissionRejected { key: String, existing: JobId },

    #[error("model unavailable: {0}")]
    ModelUnavailable(String),

    #[error("model could not produce valid files: {}", summarize_issues(.errors))]
    ValidationExhausted { errors: Vec<FileIssue> },

    #[error("model finished without proposing any changes")]
    NoChangesProduced,

    #[error("turn budget of {max_turns} exhausted")]
    MaxTurnsExceeded { max_turns: u32 },

    #[error("version {version} of project {project_id} was committed concurrently")]
    PersistConflict { project_id: String, version: u32 },

    #[error("deployment failed: {reason}")]
    ProviderDeployFailure {
        reason: String,
        logs: Option<String>,
    },

    #[error("cancelled")]
    Cancelled,

    #[error("job exceeded its {0:?} timeout")]
    JobTimeout(Duration),

    #[error("config error: {0}")]
    Config(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Whether the queue should schedule another attempt.
    ///
    /// Transient infrastructure and provider failures are retried. Agent
    /// logic failures are not: replaying the same prompt against the same
    /// model rarely converges.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::QueueUnavailable(_)
                | Error::ModelUnavailable(_)
                | Error::ProviderDeployFailure { .. }
                | Error::JobTimeout(_)
                | Error::Database(_)
                | Error::Http(_)
                | Error::Io(_)
        )
    }

    /// Stable label for metrics and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::NotFound(_) => "not_found",
            Error::InvalidTransition { .. } => "invalid_transition",
            Error::LeaseLost(_) => "lease_lost",
            Error::QueueUnavailable(_) => "queue_unavailable",
            Error::AdmissionRejected { .. } => "admission_rejected",
            Error::ModelUnavailable(_) => "model_unavailable",
            Error::ValidationExhausted { .. } => "validation_exhausted",
            Error::NoChangesProduced => "no_changes_produced",
            Error::MaxTurnsExceeded { .. } => "max_turns_exceeded",
            Error::PersistConflict { .. } => "persist_conflict",
            Error::ProviderDeployFailure { .. } => "provider_deploy_failure",
            Error::Cancelled => "cancelled",
            Error::JobTimeout(_) => "job_timeout",
            Error::Config(_) => "config",
            Error::Database(_) => "database",
            Error::Http(_) => "http",
            Error::Json(_) => "json",
            Error::Io(_) => "io",
            Error::Other(_) => "other",
        }
    }
}

fn summarize_issues(errors: &[FileIssue]) -> String {
    match errors.first() {
        None => "no diagnostics".to_string(),
        Some(first) if errors.len() == 1 => first.to_string(),
        Some(first) => format!("{first} (and {} more)", errors.len() - 1),
    }
}

pub type Result<T> = std::result::Result<T, Error>;
