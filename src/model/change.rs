//! Change sets: the file mutations one agent run proposes.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileAction {
    Create,
    Modify,
    Delete,
}

/// One proposed file mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChange {
    pub path: String,
    pub action: FileAction,
    /// Required for create/modify. Ignored for delete.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
}

impl FileChange {
    pub fn create(path: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            action: FileAction::Create,
            content: Some(content.into()),
            language: None,
        }
    }

    pub fn modify(path: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            action: FileAction::Modify,
            content: Some(content.into()),
            language: None,
        }
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            action: FileAction::Delete,
            content: None,
            language: None,
        }
    }

    pub fn language(mut self, language: impl Into<String>) -> Self {
        self.language = Some(language.into());
        self
    }

    /// Drop content carried on a delete so it can never be persisted.
    pub(crate) fn normalized(mut self) -> Self {
        if self.action == FileAction::Delete {
            self.content = None;
        }
        self
    }
}

/// The agent's proposed mutation to a project.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeSet {
    /// Ordered; paths are unique once validated.
    pub files: Vec<FileChange>,
    pub summary: String,
    #[serde(default)]
    pub env_vars_needed: BTreeSet<String>,
}

impl ChangeSet {
    pub fn new(files: Vec<FileChange>, summary: impl Into<String>) -> Self {
        Self {
            files: files.into_iter().map(FileChange::normalized).collect(),
            summary: summary.into(),
            env_vars_needed: BTreeSet::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Append another change set. Duplicate paths are kept so validation can
    /// reject them.
    pub fn extend(&mut self, other: ChangeSet) {
        self.files
            .extend(other.files.into_iter().map(FileChange::normalized));
        if !other.summary.is_empty() {
            if !self.summary.is_empty() {
                self.summary.push('\n');
            }
            self.summary.push_str(&other.summary);
        }
        self.env_vars_needed.extend(other.env_vars_needed);
    }

    /// Human-readable counts, e.g. "2 created, 1 modified, 0 deleted".
    pub fn diff_summary(&self) -> String {
        let count = |action| self.files.iter().filter(|f| f.action == action).count();
        format!(
            "{} created, {} modified, {} deleted",
            count(FileAction::Create),
            count(FileAction::Modify),
            count(FileAction::Delete)
        )
    }
}
