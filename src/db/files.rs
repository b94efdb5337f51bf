//! Postgres [`FileStore`]: current files in `project_files`, immutable
//! snapshots in `versions`.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::debug;

use super::{Db, is_unique_violation};
use crate::error::{Error, Result};
use crate::model::{ChangeSet, FileAction, ProjectFile, Version};
use crate::store::FileStore;

pub struct PgFileStore {
    db: Arc<Db>,
}

impl PgFileStore {
    pub fn new(db: Arc<Db>) -> Self {
        Self { db }
    }
}

fn conflict(project_id: &str, expected_current: u32) -> Error {
    Error::PersistConflict {
        project_id: project_id.to_string(),
        version: expected_current + 1,
    }
}

#[async_trait]
impl FileStore for PgFileStore {
    async fn list_files(&self, project_id: &str) -> Result<Vec<ProjectFile>> {
        let rows: Vec<(String, String, Option<String>)> = sqlx::query_as(
            "SELECT path, content, language FROM project_files WHERE project_id = $1 ORDER BY path",
        )
        .bind(project_id)
        .fetch_all(self.db.pool())
        .await?;
        Ok(rows
            .into_iter()
            .map(|(path, content, language)| ProjectFile {
                path,
                content,
                language,
            })
            .collect())
    }

    async fn read_file(&self, project_id: &str, path: &str) -> Result<Option<ProjectFile>> {
        let row: Option<(String, Option<String>)> = sqlx::query_as(
            "SELECT content, language FROM project_files WHERE project_id = $1 AND path = $2",
        )
        .bind(project_id)
        .bind(path)
        .fetch_optional(self.db.pool())
        .await?;
        Ok(row.map(|(content, language)| ProjectFile {
            path: path.to_string(),
            content,
            language,
        }))
    }

    async fn current_version(&self, project_id: &str) -> Result<u32> {
        let row: (Option<i32>,) =
            sqlx::query_as("SELECT MAX(version_number) FROM versions WHERE project_id = $1")
                .bind(project_id)
                .fetch_one(self.db.pool())
                .await?;
        Ok(row.0.unwrap_or(0) as u32)
    }

    async fn version(&self, project_id: &str, version_number: u32) -> Result<Version> {
        let row: Option<VersionRow> = sqlx::query_as(
            "SELECT project_id, version_number, snapshot, prompt_summary, diff_summary, commit_sha, created_at
             FROM versions WHERE project_id = $1 AND version_number = $2",
        )
        .bind(project_id)
        .bind(version_number as i32)
        .fetch_optional(self.db.pool())
        .await?;
        row.map(VersionRow::try_into_version)
            .transpose()?
            .ok_or_else(|| Error::NotFound(format!("version {version_number} of {project_id}")))
    }

    async fn commit_version(
        &self,
        project_id: &str,
        expected_current: u32,
        changes: &ChangeSet,
        prompt_summary: &str,
    ) -> Result<Version> {
        let mut tx = self.db.pool().begin().await?;

        let (current,): (Option<i32>,) =
            sqlx::query_as("SELECT MAX(version_number) FROM versions WHERE project_id = $1")
                .bind(project_id)
                .fetch_one(&mut *tx)
                .await?;
        if current.unwrap_or(0) as u32 != expected_current {
            return Err(conflict(project_id, expected_current));
        }

        for change in &changes.files {
            match change.action {
                FileAction::Create | FileAction::Modify => {
                    sqlx::query(
                        "INSERT INTO project_files (project_id, path, content, language)
                         VALUES ($1, $2, $3, $4)
                         ON CONFLICT (project_id, path)
                         DO UPDATE SET content = EXCLUDED.content, language = EXCLUDED.language",
                    )
                    .bind(project_id)
                    .bind(&change.path)
                    .bind(change.content.as_deref().unwrap_or_default())
                    .bind(&change.language)
                    .execute(&mut *tx)
                    .await?;
                }
                FileAction::Delete => {
                    sqlx::query("DELETE FROM project_files WHERE project_id = $1 AND path = $2")
                        .bind(project_id)
                        .bind(&change.path)
                        .execute(&mut *tx)
                        .await?;
                }
            }
        }

        let rows: Vec<(String, String, Option<String>)> = sqlx::query_as(
            "SELECT path, content, language FROM project_files WHERE project_id = $1",
        )
        .bind(project_id)
        .fetch_all(&mut *tx)
        .await?;
        let snapshot: BTreeMap<String, ProjectFile> = rows
            .into_iter()
            .map(|(path, content, language)| {
                (
                    path.clone(),
                    ProjectFile {
                        path,
                        content,
                        language,
                    },
                )
            })
            .collect();

        let version = Version {
            project_id: project_id.to_string(),
            version_number: expected_current + 1,
            snapshot,
            prompt_summary: prompt_summary.to_string(),
            diff_summary: changes.diff_summary(),
            commit_sha: None,
            created_at: Utc::now(),
        };
        let inserted = sqlx::query(
            "INSERT INTO versions (project_id, version_number, snapshot, prompt_summary, diff_summary, commit_sha, created_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(project_id)
        .bind(version.version_number as i32)
        .bind(serde_json::to_value(&version.snapshot)?)
        .bind(&version.prompt_summary)
        .bind(&version.diff_summary)
        .bind(&version.commit_sha)
        .bind(version.created_at)
        .execute(&mut *tx)
        .await;
        match inserted {
            Err(e) if is_unique_violation(&e) => return Err(conflict(project_id, expected_current)),
            other => {
                other?;
            }
        }
        tx.commit().await?;

        debug!(project_id, version = version.version_number, "version row written");
        Ok(version)
    }
}

#[derive(sqlx::FromRow)]
struct VersionRow {
    project_id: String,
    version_number: i32,
    snapshot: serde_json::Value,
    prompt_summary: String,
    diff_summary: String,
    commit_sha: Option<String>,
    created_at: DateTime<Utc>,
}

impl VersionRow {
    fn try_into_version(self) -> Result<Version> {
        Ok(Version {
            project_id: self.project_id,
            version_number: self.version_number as u32,
            snapshot: serde_json::from_value(self.snapshot)?,
            prompt_summary: self.prompt_summary,
            diff_summary: self.diff_summary,
            commit_sha: self.commit_sha,
            created_at: self.created_at,
        })
    }
}
