//! pgmq calls via direct SQLx.
//!
//! Thin wrappers over pgmq's SQL functions (`create`, `send`, `read`,
//! `set_vt`, `archive`). Each takes any executor so queue operations can
//! run inside the same transaction as the job-row update.

use crate::error::Result;
use crate::telemetry::metrics;
use opentelemetry::KeyValue;
use sqlx::PgExecutor;

/// A message read from a pgmq queue.
#[derive(Debug, Clone)]
pub struct PgmqMessage {
    pub msg_id: i64,
    pub read_ct: i32,
    pub enqueued_at: chrono::DateTime<chrono::Utc>,
    pub vt: chrono::DateTime<chrono::Utc>,
    pub message: serde_json::Value,
}

fn record(queue_name: &str, operation: &'static str) {
    metrics::queue_operations().add(
        1,
        &[
            KeyValue::new("queue", queue_name.to_string()),
            KeyValue::new("operation", operation),
        ],
    );
}

/// Create a pgmq queue (idempotent).
pub async fn create_queue<'e>(exec: impl PgExecutor<'e>, queue_name: &str) -> Result<()> {
    sqlx::query("SELECT pgmq.create($1)")
        .bind(queue_name)
        .execute(exec)
        .await?;
    record(queue_name, "create");
    Ok(())
}

/// Send a message, visible after `delay_seconds`. Returns the message ID.
pub async fn send<'e>(
    exec: impl PgExecutor<'e>,
    queue_name: &str,
    payload: &serde_json::Value,
    delay_seconds: i32,
) -> Result<i64> {
    let row: (i64,) = sqlx::query_as("SELECT pgmq.send($1, $2, $3)")
        .bind(queue_name)
        .bind(payload)
        .bind(delay_seconds)
        .fetch_one(exec)
        .await?;
    record(queue_name, "send");
    Ok(row.0)
}

/// Read the next visible message and hide it for `vt_seconds`.
pub async fn read<'e>(
    exec: impl PgExecutor<'e>,
    queue_name: &str,
    vt_seconds: i32,
) -> Result<Option<PgmqMessage>> {
    let row = sqlx::query_as::<
        _,
        (
            i64,
            i32,
            chrono::DateTime<chrono::Utc>,
            chrono::DateTime<chrono::Utc>,
            serde_json::Value,
        ),
    >("SELECT msg_id, read_ct, enqueued_at, vt, message FROM pgmq.read($1, $2, 1)")
    .bind(queue_name)
    .bind(vt_seconds)
    .fetch_optional(exec)
    .await?;

    let msg = row.map(|(msg_id, read_ct, enqueued_at, vt, message)| PgmqMessage {
        msg_id,
        read_ct,
        enqueued_at,
        vt,
        message,
    });
    record(queue_name, if msg.is_some() { "read" } else { "read_empty" });
    Ok(msg)
}

/// Make a message visible again `vt_seconds` from now. Used to extend a
/// lease and to schedule a retry.
pub async fn set_vt<'e>(
    exec: impl PgExecutor<'e>,
    queue_name: &str,
    msg_id: i64,
    vt_seconds: i32,
) -> Result<()> {
    sqlx::query("SELECT msg_id FROM pgmq.set_vt($1, $2, $3)")
        .bind(queue_name)
        .bind(msg_id)
        .bind(vt_seconds)
        .fetch_optional(exec)
        .await?;
    record(queue_name, "set_vt");
    Ok(())
}

/// Archive a message (moves to the archive table, preserved for audit).
pub async fn archive<'e>(exec: impl PgExecutor<'e>, queue_name: &str, msg_id: i64) -> Result<()> {
    sqlx::query("SELECT pgmq.archive($1, $2)")
        .bind(queue_name)
        .bind(msg_id)
        .execute(exec)
        .await?;
    record(queue_name, "archive");
    Ok(())
}
