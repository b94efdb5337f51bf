//! Build jobs: run the iteration agent, commit a version and chain a deploy.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::{CancelRegistry, Processor};
use crate::agent::{AgentRequest, IterationAgent};
use crate::error::{Error, Result};
use crate::model::{
    BuildPayload, ConversationMessage, DeployPayload, Job, JobId, ProjectStatus, Role,
};
use crate::progress::{EventKind, ProgressBus, ProgressEvent, ProgressReporter};
use crate::queue::{EnqueueOptions, WorkQueue};
use crate::store::ProjectStore;

/// Enqueue a build. At most one unfinished build per project is admitted;
/// a second request fails with `AdmissionRejected`.
pub async fn submit_build(queue: &dyn WorkQueue, payload: &BuildPayload) -> Result<JobId> {
    let id = queue
        .enqueue(
            serde_json::to_value(payload)?,
            EnqueueOptions::default().dedup_key(build_key(&payload.project_id)),
        )
        .await?;
    info!(project_id = %payload.project_id, job_id = %id, "build submitted");
    Ok(id)
}

fn build_key(project_id: &str) -> String {
    format!("build:{project_id}")
}

/// A committed version, as far as the steps after the commit need it.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Committed {
    version_number: u32,
    turns: u32,
    partial: bool,
    files: usize,
    summary: String,
    diff_summary: String,
    #[serde(default)]
    env_vars_needed: BTreeSet<String>,
}

/// Progress of a build job saved on the job between attempts. A retry
/// after the commit skips the agent, and one after the deploy was queued
/// skips the enqueue.
#[derive(Debug, Default, Serialize, Deserialize)]
struct BuildCheckpoint {
    #[serde(default)]
    committed: Option<Committed>,
    #[serde(default)]
    deploy_job: Option<JobId>,
}

impl BuildCheckpoint {
    fn from_job(job: &Job) -> Self {
        job.result
            .as_ref()
            .and_then(|value| serde_json::from_value(value.clone()).ok())
            .unwrap_or_default()
    }
}

pub struct BuildProcessor {
    agent: Arc<IterationAgent>,
    projects: Arc<dyn ProjectStore>,
    deploy_queue: Arc<dyn WorkQueue>,
    bus: ProgressBus,
    cancels: Arc<CancelRegistry>,
}

impl BuildProcessor {
    pub fn new(
        agent: Arc<IterationAgent>,
        projects: Arc<dyn ProjectStore>,
        deploy_queue: Arc<dyn WorkQueue>,
        bus: ProgressBus,
        cancels: Arc<CancelRegistry>,
    ) -> Self {
        Self {
            agent,
            projects,
            deploy_queue,
            bus,
            cancels,
        }
    }

    async fn build(
        &self,
        job: &Job,
        queue: &dyn WorkQueue,
        payload: &BuildPayload,
        reporter: &ProgressReporter,
        cancel: &CancellationToken,
    ) -> Result<serde_json::Value> {
        let project_id = payload.project_id.as_str();
        let mut checkpoint = BuildCheckpoint::from_job(job);
        let committed = match checkpoint.committed.clone() {
            Some(committed) => {
                info!(
                    project_id,
                    version = committed.version_number,
                    attempt = job.attempts,
                    "version already committed, resuming after the commit"
                );
                committed
            }
            None => {
                let committed = self.run_agent(payload, reporter, cancel).await?;
                checkpoint.committed = Some(committed.clone());
                self.save_checkpoint(job, queue, &checkpoint).await;
                committed
            }
        };
        let version_number = committed.version_number;

        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        self.append_reply(job, payload, &committed.summary).await?;

        let deploy_job = match checkpoint.deploy_job {
            Some(id) => id,
            None => {
                reporter.progress("queue_deploy", 90, "Queueing deployment");
                let id = self.enqueue_deploy(job, project_id, version_number).await?;
                checkpoint.deploy_job = Some(id);
                self.save_checkpoint(job, queue, &checkpoint).await;
                id
            }
        };
        self.projects
            .set_status(project_id, ProjectStatus::Deploying, None)
            .await?;

        reporter.complete(
            "build_complete",
            &format!("Version {version_number} ready: {}", committed.diff_summary),
        );
        info!(
            project_id,
            version = version_number,
            turns = committed.turns,
            %deploy_job,
            "build finished"
        );

        Ok(json!({
            "version_number": version_number,
            "turns": committed.turns,
            "partial": committed.partial,
            "files": committed.files,
            "summary": committed.summary,
            "env_vars_needed": committed.env_vars_needed,
            "deploy_job": deploy_job,
        }))
    }

    /// Run the agent up to a committed version.
    async fn run_agent(
        &self,
        payload: &BuildPayload,
        reporter: &ProgressReporter,
        cancel: &CancellationToken,
    ) -> Result<Committed> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let project_id = payload.project_id.as_str();
        self.projects
            .set_status(project_id, ProjectStatus::Building, None)
            .await?;
        reporter.progress("starting", 5, "Build started");

        let mut messages = self
            .projects
            .conversation(project_id, &payload.conversation_id)
            .await?;
        if let Some(pos) = messages.iter().position(|m| m.id == payload.message_id) {
            messages.truncate(pos + 1);
        }

        let request = AgentRequest {
            project_id: project_id.to_string(),
            messages,
            model: payload.model.clone(),
        };
        let outcome = self.agent.run(&request, reporter, cancel).await?;
        Ok(Committed {
            version_number: outcome.version.version_number,
            turns: outcome.turns,
            partial: outcome.partial,
            files: outcome.change_set.files.len(),
            diff_summary: outcome.change_set.diff_summary(),
            env_vars_needed: outcome.change_set.env_vars_needed,
            summary: outcome.summary,
        })
    }

    /// A failed checkpoint only costs idempotence on a later retry, so the
    /// attempt goes on.
    async fn save_checkpoint(&self, job: &Job, queue: &dyn WorkQueue, checkpoint: &BuildCheckpoint) {
        let saved = match serde_json::to_value(checkpoint) {
            Ok(value) => queue.checkpoint(job, value).await,
            Err(e) => Err(e.into()),
        };
        if let Err(e) = saved {
            warn!(job_id = %job.id, "failed to save build checkpoint: {e}");
        }
    }

    /// Add the summary as the assistant's reply, once per build job.
    async fn append_reply(&self, job: &Job, payload: &BuildPayload, summary: &str) -> Result<()> {
        let reply_id = format!("reply-{}", job.id);
        let conversation = self
            .projects
            .conversation(&payload.project_id, &payload.conversation_id)
            .await?;
        if conversation.iter().any(|m| m.id == reply_id) {
            return Ok(());
        }
        self.projects
            .append_message(
                &payload.project_id,
                &payload.conversation_id,
                ConversationMessage {
                    id: reply_id,
                    role: Role::Assistant,
                    content: summary.to_string(),
                },
            )
            .await
    }

    /// Chain the deploy. The dedup key makes a repeated enqueue from a
    /// retried attempt return the deploy job already queued.
    async fn enqueue_deploy(&self, job: &Job, project_id: &str, version_number: u32) -> Result<JobId> {
        let deploy = DeployPayload {
            project_id: project_id.to_string(),
            version_number,
            build_job: Some(job.id),
        };
        let enqueued = self
            .deploy_queue
            .enqueue(
                serde_json::to_value(&deploy)?,
                EnqueueOptions::default().dedup_key(format!("deploy:{}", job.id)),
            )
            .await;
        match enqueued {
            Err(Error::AdmissionRejected { existing, .. }) => Ok(existing),
            other => other,
        }
    }
}

#[async_trait]
impl Processor for BuildProcessor {
    async fn process(&self, job: &Job, queue: &dyn WorkQueue) -> Result<serde_json::Value> {
        let payload: BuildPayload = job.payload_as()?;
        let registration = self.cancels.register(&payload.project_id);
        let token = registration.token().clone();
        let reporter = ProgressReporter::new(self.bus.clone(), &payload.project_id)
            .for_job(job.id)
            .with_cancel(token.clone());

        self.build(job, queue, &payload, &reporter, &token).await
    }

    async fn on_retry(&self, job: &Job, error: &Error, delay: Duration) {
        let Ok(payload) = job.payload_as::<BuildPayload>() else {
            return;
        };
        self.bus.publish(
            ProgressEvent::new(
                &payload.project_id,
                EventKind::Progress,
                "retrying",
                0,
                format!("Build attempt {} failed ({error}); retrying in {}s", job.attempts, delay.as_secs()),
            )
            .for_job(job.id),
        );
    }

    async fn on_dead(&self, job: &Job, error: &Error) {
        let Ok(payload) = job.payload_as::<BuildPayload>() else {
            warn!(job_id = %job.id, "dead build job has an unreadable payload");
            return;
        };
        let cancelled = matches!(error, Error::Cancelled);
        let message = if cancelled {
            "Build cancelled".to_string()
        } else {
            format!("Build failed: {error}")
        };
        if let Err(e) = self
            .projects
            .set_status(&payload.project_id, ProjectStatus::Failed, Some(&message))
            .await
        {
            warn!(project_id = %payload.project_id, "failed to record build failure: {e}");
        }
        // Viewers already got the cancel event.
        if cancelled {
            return;
        }
        self.bus.publish(
            ProgressEvent::new(&payload.project_id, EventKind::Error, "build_failed", 0, message)
                .for_job(job.id),
        );
    }
}
