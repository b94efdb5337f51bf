//! Postgres [`ProjectStore`]: project status rows and conversation history.

use std::sync::Arc;

use async_trait::async_trait;

use super::Db;
use crate::error::{Error, Result};
use crate::model::{ConversationMessage, DeploymentRecord, ProjectStatus, Role};
use crate::store::{ProjectRecord, ProjectStore};

pub struct PgProjectStore {
    db: Arc<Db>,
}

impl PgProjectStore {
    pub fn new(db: Arc<Db>) -> Self {
        Self { db }
    }
}

fn role_str(role: Role) -> &'static str {
    match role {
        Role::User => "user",
        Role::Assistant => "assistant",
    }
}

fn parse_role(s: &str) -> Result<Role> {
    match s {
        "user" => Ok(Role::User),
        "assistant" => Ok(Role::Assistant),
        other => Err(Error::Other(format!("unknown message role: {other}"))),
    }
}

#[async_trait]
impl ProjectStore for PgProjectStore {
    async fn project(&self, project_id: &str) -> Result<ProjectRecord> {
        let row: Option<(String, String, Option<String>, Option<serde_json::Value>)> =
            sqlx::query_as("SELECT id, status, error, deployment FROM projects WHERE id = $1")
                .bind(project_id)
                .fetch_optional(self.db.pool())
                .await?;
        let (id, status, error, deployment) =
            row.ok_or_else(|| Error::NotFound(format!("project {project_id}")))?;
        Ok(ProjectRecord {
            id,
            status: status.parse()?,
            error,
            deployment: deployment.map(serde_json::from_value).transpose()?,
        })
    }

    async fn conversation(
        &self,
        project_id: &str,
        conversation_id: &str,
    ) -> Result<Vec<ConversationMessage>> {
        let rows: Vec<(String, String, String)> = sqlx::query_as(
            "SELECT id, role, content FROM messages
             WHERE project_id = $1 AND conversation_id = $2 ORDER BY seq",
        )
        .bind(project_id)
        .bind(conversation_id)
        .fetch_all(self.db.pool())
        .await?;
        rows.into_iter()
            .map(|(id, role, content)| {
                Ok(ConversationMessage {
                    id,
                    role: parse_role(&role)?,
                    content,
                })
            })
            .collect()
    }

    async fn append_message(
        &self,
        project_id: &str,
        conversation_id: &str,
        message: ConversationMessage,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO messages (id, project_id, conversation_id, role, content)
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(&message.id)
        .bind(project_id)
        .bind(conversation_id)
        .bind(role_str(message.role))
        .bind(&message.content)
        .execute(self.db.pool())
        .await?;
        Ok(())
    }

    async fn set_status(
        &self,
        project_id: &str,
        status: ProjectStatus,
        error: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO projects (id, status, error, updated_at) VALUES ($1, $2, $3, now())
             ON CONFLICT (id) DO UPDATE SET status = EXCLUDED.status, error = EXCLUDED.error,
                                            updated_at = now()",
        )
        .bind(project_id)
        .bind(status.as_str())
        .bind(error)
        .execute(self.db.pool())
        .await?;
        Ok(())
    }

    async fn record_deployment(&self, project_id: &str, record: DeploymentRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO projects (id, deployment, updated_at) VALUES ($1, $2, now())
             ON CONFLICT (id) DO UPDATE SET deployment = EXCLUDED.deployment, updated_at = now()",
        )
        .bind(project_id)
        .bind(serde_json::to_value(&record)?)
        .execute(self.db.pool())
        .await?;
        Ok(())
    }
}
