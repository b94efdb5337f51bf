//! HTTP surface: the per-project progress stream plus build submission,
//! cancellation and queue stats.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::{
        IntoResponse, Response,
        sse::{Event, KeepAlive, Sse},
    },
    routing::{get, post},
};
use futures::stream::{self, Stream, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

use crate::error::Error;
use crate::model::{BuildPayload, QueueName};
use crate::progress::{ProgressBus, StreamMessage};
use crate::queue::WorkQueue;
use crate::store::ProjectStore;
use crate::worker::{CancelRegistry, cancel_build, submit_build};

/// Shared handles of the HTTP handlers.
#[derive(Clone)]
pub struct AppState {
    pub bus: ProgressBus,
    pub build_queue: Arc<dyn WorkQueue>,
    pub deploy_queue: Arc<dyn WorkQueue>,
    pub projects: Arc<dyn ProjectStore>,
    pub cancels: Arc<CancelRegistry>,
}

impl AppState {
    fn queue(&self, name: QueueName) -> &Arc<dyn WorkQueue> {
        match name {
            QueueName::Build => &self.build_queue,
            QueueName::Deploy => &self.deploy_queue,
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/projects/{id}", get(get_project))
        .route("/projects/{id}/progress", get(progress_stream))
        .route("/projects/{id}/builds", post(submit))
        .route("/projects/{id}/cancel", post(cancel))
        .route("/queues/{name}/stats", get(queue_stats))
        .with_state(state)
}

/// Handler error carrying the crate error and its HTTP status.
pub struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::AdmissionRejected { .. } => StatusCode::CONFLICT,
            Error::QueueUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Error::Config(_) | Error::Json(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            warn!(kind = self.0.kind(), "request failed: {}", self.0);
        }
        let mut body = json!({ "error": self.0.to_string(), "kind": self.0.kind() });
        if let Error::AdmissionRejected { existing, .. } = &self.0 {
            body["job_id"] = json!(existing);
        }
        (status, Json(body)).into_response()
    }
}

async fn health() -> &'static str {
    "ok"
}

async fn get_project(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let record = state.projects.project(&id).await?;
    Ok(Json(record).into_response())
}

/// Live progress for one project. Opens with `connected`, then relays every
/// event published while the connection lives. The subscription is dropped,
/// and so unsubscribed, when the client goes away.
async fn progress_stream(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let subscription = state.bus.subscribe(&id);
    debug!(project_id = %id, "progress viewer connected");

    let connected = StreamMessage::Connected { project_id: id };
    let events = stream::unfold(subscription, |mut subscription| async move {
        let event = subscription.recv().await?;
        Some((StreamMessage::from(event), subscription))
    });
    let stream = stream::once(async move { connected })
        .chain(events)
        .map(|message| Ok(Event::default().data(message.json())));

    Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(15)))
}

#[derive(Debug, Deserialize)]
pub struct SubmitBuild {
    pub conversation_id: String,
    pub message_id: String,
    #[serde(default)]
    pub model: Option<String>,
}

async fn submit(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<SubmitBuild>,
) -> Result<Response, ApiError> {
    let payload = BuildPayload {
        project_id: id,
        conversation_id: body.conversation_id,
        message_id: body.message_id,
        model: body.model,
    };
    let job_id = submit_build(state.build_queue.as_ref(), &payload).await?;
    Ok((StatusCode::ACCEPTED, Json(json!({ "job_id": job_id }))).into_response())
}

async fn cancel(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let found = cancel_build(
        &id,
        &state.cancels,
        state.projects.as_ref(),
        state.build_queue.as_ref(),
        &state.bus,
    )
    .await?;
    Ok(Json(json!({ "cancelled": found })).into_response())
}

async fn queue_stats(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Response, ApiError> {
    let name: QueueName = name.parse()?;
    let stats = state.queue(name).stats().await?;
    Ok(Json(stats).into_response())
}
