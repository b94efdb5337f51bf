//! Persistence collaborators: project files, versions, conversations and
//! project status.
//!
//! The build core only needs narrow contracts from storage. [`FileStore`]
//! commits versions with compare-and-increment semantics; [`VersionWriter`]
//! layers per-project serialization and one conflict retry on top so version
//! numbers stay strictly increasing without gaps.

pub mod memory;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::model::{
    ChangeSet, ConversationMessage, DeploymentRecord, FileAction, ProjectFile, ProjectStatus,
    Version,
};

pub use memory::{MemoryFileStore, MemoryProjectStore};

/// Project files and their version history.
#[async_trait]
pub trait FileStore: Send + Sync {
    /// Current files of a project, ordered by path. Unknown projects have none.
    async fn list_files(&self, project_id: &str) -> Result<Vec<ProjectFile>>;

    async fn read_file(&self, project_id: &str, path: &str) -> Result<Option<ProjectFile>>;

    /// Latest version number, 0 before the first commit.
    async fn current_version(&self, project_id: &str) -> Result<u32>;

    async fn version(&self, project_id: &str, version_number: u32) -> Result<Version>;

    /// Apply `changes` and record version `expected_current + 1` in one
    /// atomic step. Fails with `PersistConflict` when another commit moved
    /// the project past `expected_current` first.
    async fn commit_version(
        &self,
        project_id: &str,
        expected_current: u32,
        changes: &ChangeSet,
        prompt_summary: &str,
    ) -> Result<Version>;
}

/// Project status, conversation history and deployment records.
#[async_trait]
pub trait ProjectStore: Send + Sync {
    async fn project(&self, project_id: &str) -> Result<ProjectRecord>;

    /// Messages of a conversation in order.
    async fn conversation(
        &self,
        project_id: &str,
        conversation_id: &str,
    ) -> Result<Vec<ConversationMessage>>;

    async fn append_message(
        &self,
        project_id: &str,
        conversation_id: &str,
        message: ConversationMessage,
    ) -> Result<()>;

    /// Set status and the user-facing error message. `None` clears the error.
    async fn set_status(
        &self,
        project_id: &str,
        status: ProjectStatus,
        error: Option<&str>,
    ) -> Result<()>;

    async fn record_deployment(&self, project_id: &str, record: DeploymentRecord) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectRecord {
    pub id: String,
    pub status: ProjectStatus,
    pub error: Option<String>,
    pub deployment: Option<DeploymentRecord>,
}

impl ProjectRecord {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            status: ProjectStatus::Idle,
            error: None,
            deployment: None,
        }
    }
}

/// Apply a change set to a file map. Deleting an absent path is a no-op.
pub(crate) fn apply_to_snapshot(
    files: &mut std::collections::BTreeMap<String, ProjectFile>,
    changes: &ChangeSet,
) {
    for change in &changes.files {
        match change.action {
            FileAction::Create | FileAction::Modify => {
                files.insert(
                    change.path.clone(),
                    ProjectFile {
                        path: change.path.clone(),
                        content: change.content.clone().unwrap_or_default(),
                        language: change.language.clone(),
                    },
                );
            }
            FileAction::Delete => {
                files.remove(&change.path);
            }
        }
    }
}

/// Serializes version creation per project.
///
/// Commits for the same project inside this process queue on an async
/// lock. Commits from other processes are caught by the store's
/// compare-and-increment; a conflict is retried once against a freshly
/// read version number before it surfaces.
pub struct VersionWriter {
    files: Arc<dyn FileStore>,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl VersionWriter {
    pub fn new(files: Arc<dyn FileStore>) -> Self {
        Self {
            files,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn files(&self) -> &Arc<dyn FileStore> {
        &self.files
    }

    fn lock_for(&self, project_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(project_id.to_string())
            .or_default()
            .clone()
    }

    fn release(&self, project_id: &str, lock: Arc<tokio::sync::Mutex<()>>) {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        // One reference in the map, one held here: nobody else is waiting.
        if Arc::strong_count(&lock) == 2 {
            locks.remove(project_id);
        }
    }

    pub async fn commit(
        &self,
        project_id: &str,
        changes: &ChangeSet,
        prompt_summary: &str,
    ) -> Result<Version> {
        let lock = self.lock_for(project_id);
        let result = {
            let _guard = lock.lock().await;
            self.commit_locked(project_id, changes, prompt_summary).await
        };
        self.release(project_id, lock);
        result
    }

    async fn commit_locked(
        &self,
        project_id: &str,
        changes: &ChangeSet,
        prompt_summary: &str,
    ) -> Result<Version> {
        let current = self.files.current_version(project_id).await?;
        let version = match self
            .files
            .commit_version(project_id, current, changes, prompt_summary)
            .await
        {
            Err(Error::PersistConflict { version, .. }) => {
                warn!(project_id, version, "version conflict, retrying with fresh number");
                let current = self.files.current_version(project_id).await?;
                self.files
                    .commit_version(project_id, current, changes, prompt_summary)
                    .await?
            }
            other => other?,
        };
        info!(
            project_id,
            version = version.version_number,
            diff = %version.diff_summary,
            "version committed"
        );
        Ok(version)
    }
}
