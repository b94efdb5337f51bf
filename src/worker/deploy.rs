//! Deploy jobs: drive the external deployment provider for a committed
//! version.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};

use super::Processor;
use crate::error::{Error, Result};
use crate::model::{DeployPayload, DeploymentRecord, DeploymentState, Job, ProjectStatus, Version};
use crate::progress::{EventKind, ProgressBus, ProgressEvent, ProgressReporter};
use crate::queue::WorkQueue;
use crate::store::{FileStore, ProjectStore};

/// Provider-side identifier of one deployment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentHandle {
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DeployStatus {
    Pending,
    Building,
    Ready { url: Option<String> },
    Failed { reason: String },
}

/// The narrow contract of a deployment provider.
#[async_trait]
pub trait DeployProvider: Send + Sync {
    async fn start(&self, project_id: &str, version: &Version) -> Result<DeploymentHandle>;

    async fn poll_status(&self, handle: &DeploymentHandle) -> Result<DeployStatus>;

    async fn fetch_logs(&self, handle: &DeploymentHandle) -> Result<String>;
}

/// Provider that marks every version live immediately without publishing
/// it anywhere. Used when no provider is configured.
pub struct NullDeployProvider;

#[async_trait]
impl DeployProvider for NullDeployProvider {
    async fn start(&self, project_id: &str, version: &Version) -> Result<DeploymentHandle> {
        Ok(DeploymentHandle {
            id: format!("{project_id}-v{}", version.version_number),
        })
    }

    async fn poll_status(&self, _handle: &DeploymentHandle) -> Result<DeployStatus> {
        Ok(DeployStatus::Ready { url: None })
    }

    async fn fetch_logs(&self, _handle: &DeploymentHandle) -> Result<String> {
        Ok(String::new())
    }
}

pub struct DeployProcessor {
    provider: Arc<dyn DeployProvider>,
    files: Arc<dyn FileStore>,
    projects: Arc<dyn ProjectStore>,
    bus: ProgressBus,
    poll_interval: Duration,
}

impl DeployProcessor {
    pub fn new(
        provider: Arc<dyn DeployProvider>,
        files: Arc<dyn FileStore>,
        projects: Arc<dyn ProjectStore>,
        bus: ProgressBus,
    ) -> Self {
        Self {
            provider,
            files,
            projects,
            bus,
            poll_interval: Duration::from_secs(3),
        }
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

#[async_trait]
impl Processor for DeployProcessor {
    async fn process(&self, job: &Job, _queue: &dyn WorkQueue) -> Result<serde_json::Value> {
        let payload: DeployPayload = job.payload_as()?;
        let project_id = payload.project_id.as_str();
        let reporter = ProgressReporter::new(self.bus.clone(), project_id).for_job(job.id);

        reporter.progress("deploy_starting", 5, "Starting deployment");
        let version = self.files.version(project_id, payload.version_number).await?;
        let handle = self.provider.start(project_id, &version).await?;
        info!(project_id, version = version.version_number, deployment = %handle.id, "deployment started");

        let mut percent = 10u8;
        let url = loop {
            match self.provider.poll_status(&handle).await? {
                DeployStatus::Ready { url } => break url,
                DeployStatus::Failed { reason } => {
                    let logs = match self.provider.fetch_logs(&handle).await {
                        Ok(logs) => Some(logs),
                        Err(e) => {
                            warn!(deployment = %handle.id, "could not fetch deploy logs: {e}");
                            None
                        }
                    };
                    return Err(Error::ProviderDeployFailure { reason, logs });
                }
                status => {
                    debug!(deployment = %handle.id, ?status, "deployment in progress");
                    let stage = match status {
                        DeployStatus::Pending => "deploy_pending",
                        _ => "deploy_building",
                    };
                    reporter.progress(stage, percent, "Deploying");
                    percent = (percent + 10).min(90);
                    tokio::time::sleep(self.poll_interval).await;
                }
            }
        };

        self.projects
            .record_deployment(
                project_id,
                DeploymentRecord {
                    version_number: payload.version_number,
                    state: DeploymentState::Live,
                    url: url.clone(),
                    error: None,
                    logs: None,
                    updated_at: Utc::now(),
                },
            )
            .await?;
        self.projects
            .set_status(project_id, ProjectStatus::Live, None)
            .await?;
        reporter.complete(
            "deploy_live",
            &match &url {
                Some(url) => format!("Live at {url}"),
                None => "Deployment live".to_string(),
            },
        );

        Ok(json!({
            "deployment": handle.id,
            "version_number": payload.version_number,
            "url": url,
        }))
    }

    async fn on_retry(&self, job: &Job, error: &Error, delay: Duration) {
        let Ok(payload) = job.payload_as::<DeployPayload>() else {
            return;
        };
        self.bus.publish(
            ProgressEvent::new(
                &payload.project_id,
                EventKind::Progress,
                "deploy_retrying",
                0,
                format!("Deployment failed ({error}); retrying in {}s", delay.as_secs()),
            )
            .for_job(job.id),
        );
    }

    async fn on_dead(&self, job: &Job, error: &Error) {
        let Ok(payload) = job.payload_as::<DeployPayload>() else {
            warn!(job_id = %job.id, "dead deploy job has an unreadable payload");
            return;
        };
        let project_id = payload.project_id.as_str();
        let (reason, logs) = match error {
            Error::ProviderDeployFailure { reason, logs } => (reason.clone(), logs.clone()),
            other => (other.to_string(), None),
        };
        let message = format!("Deployment failed: {reason}");

        let record = DeploymentRecord {
            version_number: payload.version_number,
            state: DeploymentState::Failed,
            url: None,
            error: Some(reason),
            logs,
            updated_at: Utc::now(),
        };
        if let Err(e) = self.projects.record_deployment(project_id, record).await {
            warn!(project_id, "failed to record deployment failure: {e}");
        }
        if let Err(e) = self
            .projects
            .set_status(project_id, ProjectStatus::Failed, Some(&message))
            .await
        {
            warn!(project_id, "failed to record project failure: {e}");
        }
        self.bus.publish(
            ProgressEvent::new(project_id, EventKind::Error, "deploy_failed", 0, message)
                .for_job(job.id),
        );
    }
}
