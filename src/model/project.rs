//! Records owned by the persistence collaborators: files, versions,
//! conversations and project status.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// A file as stored for a project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectFile {
    pub path: String,
    pub content: String,
    #[serde(default)]
    pub language: Option<String>,
}

/// An immutable, numbered snapshot of a project's full file set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Version {
    pub project_id: String,
    /// Strictly increasing per project, starting at 1, no gaps.
    pub version_number: u32,
    pub snapshot: BTreeMap<String, ProjectFile>,
    pub prompt_summary: String,
    pub diff_summary: String,
    pub commit_sha: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

/// One message of the conversation that drives a build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationMessage {
    pub id: String,
    pub role: Role,
    pub content: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectStatus {
    Idle,
    Building,
    Deploying,
    Live,
    Failed,
}

impl ProjectStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ProjectStatus::Idle => "idle",
            ProjectStatus::Building => "building",
            ProjectStatus::Deploying => "deploying",
            ProjectStatus::Live => "live",
            ProjectStatus::Failed => "failed",
        }
    }
}

impl std::str::FromStr for ProjectStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "idle" => Ok(ProjectStatus::Idle),
            "building" => Ok(ProjectStatus::Building),
            "deploying" => Ok(ProjectStatus::Deploying),
            "live" => Ok(ProjectStatus::Live),
            "failed" => Ok(ProjectStatus::Failed),
            other => Err(Error::Other(format!("unknown project status: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentState {
    Live,
    Failed,
}

/// The project's deployment record, written by the deploy worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentRecord {
    pub version_number: u32,
    pub state: DeploymentState,
    pub url: Option<String>,
    pub error: Option<String>,
    pub logs: Option<String>,
    pub updated_at: DateTime<Utc>,
}
