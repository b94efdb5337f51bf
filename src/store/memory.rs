//! In-process store implementations for tests and single-node runs.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::Utc;

use super::{FileStore, ProjectRecord, ProjectStore, apply_to_snapshot};
use crate::error::{Error, Result};
use crate::model::{
    ChangeSet, ConversationMessage, DeploymentRecord, ProjectFile, ProjectStatus, Version,
};

#[derive(Default)]
struct ProjectFiles {
    files: BTreeMap<String, ProjectFile>,
    versions: Vec<Version>,
}

#[derive(Default)]
pub struct MemoryFileStore {
    projects: Mutex<HashMap<String, ProjectFiles>>,
}

impl MemoryFileStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed current files without creating a version.
    pub fn seed(&self, project_id: &str, files: impl IntoIterator<Item = ProjectFile>) {
        let mut projects = self.lock();
        let project = projects.entry(project_id.to_string()).or_default();
        for file in files {
            project.files.insert(file.path.clone(), file);
        }
    }

    /// All versions of a project, oldest first.
    pub fn versions(&self, project_id: &str) -> Vec<Version> {
        self.lock()
            .get(project_id)
            .map(|p| p.versions.clone())
            .unwrap_or_default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, ProjectFiles>> {
        self.projects.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl FileStore for MemoryFileStore {
    async fn list_files(&self, project_id: &str) -> Result<Vec<ProjectFile>> {
        Ok(self
            .lock()
            .get(project_id)
            .map(|p| p.files.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn read_file(&self, project_id: &str, path: &str) -> Result<Option<ProjectFile>> {
        Ok(self
            .lock()
            .get(project_id)
            .and_then(|p| p.files.get(path).cloned()))
    }

    async fn current_version(&self, project_id: &str) -> Result<u32> {
        Ok(self
            .lock()
            .get(project_id)
            .and_then(|p| p.versions.last())
            .map(|v| v.version_number)
            .unwrap_or(0))
    }

    async fn version(&self, project_id: &str, version_number: u32) -> Result<Version> {
        self.lock()
            .get(project_id)
            .and_then(|p| {
                p.versions
                    .iter()
                    .find(|v| v.version_number == version_number)
                    .cloned()
            })
            .ok_or_else(|| Error::NotFound(format!("version {version_number} of {project_id}")))
    }

    async fn commit_version(
        &self,
        project_id: &str,
        expected_current: u32,
        changes: &ChangeSet,
        prompt_summary: &str,
    ) -> Result<Version> {
        let mut projects = self.lock();
        let project = projects.entry(project_id.to_string()).or_default();
        let current = project.versions.last().map(|v| v.version_number).unwrap_or(0);
        if current != expected_current {
            return Err(Error::PersistConflict {
                project_id: project_id.to_string(),
                version: expected_current + 1,
            });
        }

        let mut snapshot = project.files.clone();
        apply_to_snapshot(&mut snapshot, changes);
        let version = Version {
            project_id: project_id.to_string(),
            version_number: current + 1,
            snapshot: snapshot.clone(),
            prompt_summary: prompt_summary.to_string(),
            diff_summary: changes.diff_summary(),
            commit_sha: None,
            created_at: Utc::now(),
        };
        project.files = snapshot;
        project.versions.push(version.clone());
        Ok(version)
    }
}

#[derive(Default)]
struct ProjectsInner {
    records: HashMap<String, ProjectRecord>,
    conversations: HashMap<(String, String), Vec<ConversationMessage>>,
}

#[derive(Default)]
pub struct MemoryProjectStore {
    inner: Mutex<ProjectsInner>,
}

impl MemoryProjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_project(&self, project_id: &str) {
        self.lock()
            .records
            .entry(project_id.to_string())
            .or_insert_with(|| ProjectRecord::new(project_id));
    }

    fn lock(&self) -> MutexGuard<'_, ProjectsInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl ProjectStore for MemoryProjectStore {
    async fn project(&self, project_id: &str) -> Result<ProjectRecord> {
        self.lock()
            .records
            .get(project_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("project {project_id}")))
    }

    async fn conversation(
        &self,
        project_id: &str,
        conversation_id: &str,
    ) -> Result<Vec<ConversationMessage>> {
        Ok(self
            .lock()
            .conversations
            .get(&(project_id.to_string(), conversation_id.to_string()))
            .cloned()
            .unwrap_or_default())
    }

    async fn append_message(
        &self,
        project_id: &str,
        conversation_id: &str,
        message: ConversationMessage,
    ) -> Result<()> {
        let mut inner = self.lock();
        inner
            .records
            .entry(project_id.to_string())
            .or_insert_with(|| ProjectRecord::new(project_id));
        inner
            .conversations
            .entry((project_id.to_string(), conversation_id.to_string()))
            .or_default()
            .push(message);
        Ok(())
    }

    async fn set_status(
        &self,
        project_id: &str,
        status: ProjectStatus,
        error: Option<&str>,
    ) -> Result<()> {
        let mut inner = self.lock();
        let record = inner
            .records
            .entry(project_id.to_string())
            .or_insert_with(|| ProjectRecord::new(project_id));
        record.status = status;
        record.error = error.map(str::to_string);
        Ok(())
    }

    async fn record_deployment(&self, project_id: &str, record: DeploymentRecord) -> Result<()> {
        let mut inner = self.lock();
        let project = inner
            .records
            .entry(project_id.to_string())
            .or_insert_with(|| ProjectRecord::new(project_id));
        project.deployment = Some(record);
        Ok(())
    }
}
