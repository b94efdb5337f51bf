//! Build and deploy workers end to end over in-memory queues and stores.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use shipwright::agent::{AgentConfig, IterationAgent};
use shipwright::error::Result;
use shipwright::llm::{ModelClient, ModelResponse, Provider, ScriptedModel, ToolCall};
use shipwright::model::{
    BuildPayload, ChangeSet, ConversationMessage, DeployPayload, DeploymentState, FileChange,
    JobState, ProjectStatus, QueueName, Role, Version,
};
use shipwright::progress::{EventKind, ProgressBus};
use shipwright::queue::{EnqueueOptions, MemoryQueue, QueueOptions, WorkQueue};
use shipwright::store::{
    FileStore, MemoryFileStore, MemoryProjectStore, ProjectStore, VersionWriter,
};
use shipwright::tools::APPLY_CHANGES;
use shipwright::worker::{
    BuildProcessor, CancelRegistry, DeployProcessor, DeployProvider, DeployStatus,
    DeploymentHandle, JobRun, NullDeployProvider, WorkerConfig, WorkerPool, cancel_build,
    submit_build,
};

struct World {
    build_queue: Arc<MemoryQueue>,
    deploy_queue: Arc<MemoryQueue>,
    files: Arc<MemoryFileStore>,
    projects: Arc<MemoryProjectStore>,
    bus: ProgressBus,
    cancels: Arc<CancelRegistry>,
}

impl World {
    async fn new() -> Self {
        Self::with_build_options(QueueOptions::build()).await
    }

    async fn with_build_options(build: QueueOptions) -> Self {
        let projects = Arc::new(MemoryProjectStore::new());
        projects.insert_project("p1");
        projects
            .append_message(
                "p1",
                "c1",
                ConversationMessage {
                    id: "m1".to_string(),
                    role: Role::User,
                    content: "Build a todo list".to_string(),
                },
            )
            .await
            .unwrap();
        Self {
            build_queue: Arc::new(MemoryQueue::new(QueueName::Build, build)),
            deploy_queue: Arc::new(MemoryQueue::with_defaults(QueueName::Deploy)),
            files: Arc::new(MemoryFileStore::new()),
            projects,
            bus: ProgressBus::new(),
            cancels: Arc::new(CancelRegistry::new()),
        }
    }

    fn build_pool(&self, model: ScriptedModel) -> WorkerPool {
        self.build_pool_shared(Arc::new(model))
    }

    fn build_pool_shared(&self, model: Arc<ScriptedModel>) -> WorkerPool {
        let writer = Arc::new(VersionWriter::new(self.files.clone()));
        let agent = Arc::new(IterationAgent::new(
            model as Arc<dyn ModelClient>,
            writer,
            AgentConfig::default(),
        ));
        WorkerPool::new(
            self.build_queue.clone(),
            Arc::new(BuildProcessor::new(
                agent,
                self.projects.clone(),
                self.deploy_queue.clone(),
                self.bus.clone(),
                self.cancels.clone(),
            )),
            WorkerConfig::default(),
        )
    }

    fn deploy_pool(&self, provider: Arc<dyn DeployProvider>) -> WorkerPool {
        WorkerPool::new(
            self.deploy_queue.clone(),
            Arc::new(
                DeployProcessor::new(provider, self.files.clone(), self.projects.clone(), self.bus.clone())
                    .poll_interval(Duration::from_millis(100)),
            ),
            WorkerConfig::default(),
        )
    }

    async fn status(&self) -> (ProjectStatus, Option<String>) {
        let record = self.projects.project("p1").await.unwrap();
        (record.status, record.error)
    }
}

fn build_payload() -> BuildPayload {
    BuildPayload {
        project_id: "p1".to_string(),
        conversation_id: "c1".to_string(),
        message_id: "m1".to_string(),
        model: None,
    }
}

fn todo_app() -> ScriptedModel {
    ScriptedModel::new(Provider::Anthropic).respond(todo_changes())
}

fn todo_changes() -> ModelResponse {
    ModelResponse::tool_calls(vec![ToolCall {
        id: "t1".to_string(),
        name: APPLY_CHANGES.to_string(),
        arguments: json!({
            "files": [
                { "path": "index.html", "action": "create", "content": "<ul id=\"todos\"></ul>\n<script src=\"app.js\"></script>\n" },
                { "path": "app.js", "action": "create", "content": "const todos = [];\nfunction add(t) {\n  todos.push(t);\n}\n" }
            ],
            "summary": "Created a todo list",
        }),
    }])
}

#[tokio::test(start_paused = true)]
async fn build_commits_a_version_and_chains_a_deploy() {
    let world = World::new().await;
    let mut viewer = world.bus.subscribe("p1");
    let job_id = submit_build(world.build_queue.as_ref(), &build_payload()).await.unwrap();

    let run = world.build_pool(todo_app()).process_next().await.unwrap();
    assert_eq!(run, Some(JobRun::Completed(job_id)));

    let build = world.build_queue.get(job_id).await.unwrap();
    assert_eq!(build.state, JobState::Completed);
    assert_eq!(build.result.as_ref().unwrap()["version_number"], 1);
    assert_eq!(world.status().await.0, ProjectStatus::Deploying);

    // The summary lands in the conversation as the assistant's reply.
    let conversation = world.projects.conversation("p1", "c1").await.unwrap();
    assert_eq!(conversation.len(), 2);
    assert_eq!(conversation[1].role, Role::Assistant);
    assert_eq!(conversation[1].content, "Created a todo list");

    let deploys = world.deploy_queue.list(JobState::Waiting).await.unwrap();
    assert_eq!(deploys.len(), 1);
    let deploy: DeployPayload = deploys[0].payload_as().unwrap();
    assert_eq!(deploy.version_number, 1);
    assert_eq!(deploy.build_job, Some(job_id));

    let run = world.deploy_pool(Arc::new(NullDeployProvider)).process_next().await.unwrap();
    assert!(matches!(run, Some(JobRun::Completed(_))));
    let record = world.projects.project("p1").await.unwrap();
    assert_eq!(record.status, ProjectStatus::Live);
    assert_eq!(record.deployment.unwrap().state, DeploymentState::Live);

    let events: Vec<_> = std::iter::from_fn(|| viewer.try_recv()).collect();
    let completes: Vec<&str> = events
        .iter()
        .filter(|e| e.kind == EventKind::Complete)
        .map(|e| e.stage.as_str())
        .collect();
    assert_eq!(completes, vec!["build_complete", "deploy_live"]);
    assert!(events.iter().all(|e| e.project_id == "p1"));
}

#[tokio::test(start_paused = true)]
async fn agent_failure_fails_the_project_without_retry() {
    let world = World::new().await;
    let mut viewer = world.bus.subscribe("p1");
    let job_id = submit_build(world.build_queue.as_ref(), &build_payload()).await.unwrap();

    // An empty script answers with text only.
    let run = world
        .build_pool(ScriptedModel::new(Provider::Anthropic))
        .process_next()
        .await
        .unwrap();
    assert_eq!(run, Some(JobRun::Dead(job_id)));

    let (status, error) = world.status().await;
    assert_eq!(status, ProjectStatus::Failed);
    assert_eq!(
        error.as_deref(),
        Some("Build failed: model finished without proposing any changes")
    );
    assert!(world.files.versions("p1").is_empty());
    assert!(world.deploy_queue.list(JobState::Waiting).await.unwrap().is_empty());

    let last = std::iter::from_fn(|| viewer.try_recv()).last().unwrap();
    assert_eq!(last.kind, EventKind::Error);
    assert_eq!(last.stage, "build_failed");
}

#[tokio::test(start_paused = true)]
async fn model_outage_is_retried_with_backoff() {
    let world = World::new().await;
    let job_id = submit_build(world.build_queue.as_ref(), &build_payload()).await.unwrap();
    let pool = world.build_pool(
        ScriptedModel::new(Provider::Anthropic)
            .fail("upstream overloaded")
            .respond(ModelResponse::tool_calls(vec![ToolCall {
                id: "t1".to_string(),
                name: APPLY_CHANGES.to_string(),
                arguments: json!({
                    "files": [{ "path": "app.js", "action": "create", "content": "export const ready = true;\n" }],
                    "summary": "Ready",
                }),
            }])),
    );

    assert_eq!(pool.process_next().await.unwrap(), Some(JobRun::Retrying(job_id)));
    assert_eq!(world.build_queue.get(job_id).await.unwrap().state, JobState::Delayed);
    assert!(pool.process_next().await.unwrap().is_none());

    tokio::time::advance(Duration::from_secs(2)).await;
    assert_eq!(pool.process_next().await.unwrap(), Some(JobRun::Completed(job_id)));
    assert_eq!(world.files.versions("p1").len(), 1);
}

/// Provider whose deployments always fail after one building poll.
struct BrokenProvider {
    statuses: Mutex<VecDeque<DeployStatus>>,
}

impl BrokenProvider {
    fn new() -> Self {
        Self {
            statuses: Mutex::new(VecDeque::new()),
        }
    }
}

#[async_trait]
impl DeployProvider for BrokenProvider {
    async fn start(&self, project_id: &str, version: &Version) -> Result<DeploymentHandle> {
        let mut statuses = self.statuses.lock().unwrap();
        statuses.push_back(DeployStatus::Building);
        statuses.push_back(DeployStatus::Failed {
            reason: "build step exited with code 1".to_string(),
        });
        Ok(DeploymentHandle {
            id: format!("{project_id}-{}", version.version_number),
        })
    }

    async fn poll_status(&self, _handle: &DeploymentHandle) -> Result<DeployStatus> {
        Ok(self
            .statuses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(DeployStatus::Pending))
    }

    async fn fetch_logs(&self, _handle: &DeploymentHandle) -> Result<String> {
        Ok("npm ERR! missing script: build".to_string())
    }
}

#[tokio::test(start_paused = true)]
async fn failed_deploy_records_reason_and_logs() {
    let world = World::new().await;
    world
        .files
        .commit_version(
            "p1",
            0,
            &ChangeSet::new(vec![FileChange::create("index.html", "<p>hi</p>\n")], "hi"),
            "say hi",
        )
        .await
        .unwrap();
    let payload = DeployPayload {
        project_id: "p1".to_string(),
        version_number: 1,
        build_job: None,
    };
    let job_id = world
        .deploy_queue
        .enqueue(serde_json::to_value(&payload).unwrap(), EnqueueOptions::default())
        .await
        .unwrap();
    let pool = world.deploy_pool(Arc::new(BrokenProvider::new()));

    assert_eq!(pool.process_next().await.unwrap(), Some(JobRun::Retrying(job_id)));
    // Still building until the second attempt gives up.
    assert_ne!(world.status().await.0, ProjectStatus::Failed);

    tokio::time::advance(Duration::from_secs(5)).await;
    assert_eq!(pool.process_next().await.unwrap(), Some(JobRun::Dead(job_id)));

    let record = world.projects.project("p1").await.unwrap();
    assert_eq!(record.status, ProjectStatus::Failed);
    let deployment = record.deployment.unwrap();
    assert_eq!(deployment.state, DeploymentState::Failed);
    assert_eq!(deployment.error.as_deref(), Some("build step exited with code 1"));
    assert_eq!(deployment.logs.as_deref(), Some("npm ERR! missing script: build"));
    assert_eq!(world.deploy_queue.get(job_id).await.unwrap().attempts, 2);
}

#[tokio::test(start_paused = true)]
async fn cancelling_a_queued_build_stops_it_before_the_model_runs() {
    let world = World::new().await;
    let job_id = submit_build(world.build_queue.as_ref(), &build_payload()).await.unwrap();

    let found = cancel_build(
        "p1",
        &world.cancels,
        world.projects.as_ref(),
        world.build_queue.as_ref(),
        &world.bus,
    )
    .await
    .unwrap();
    assert!(found);

    let model = todo_app();
    let run = world.build_pool(model).process_next().await.unwrap();
    assert_eq!(run, Some(JobRun::Dead(job_id)));

    let (status, error) = world.status().await;
    assert_eq!(status, ProjectStatus::Failed);
    assert_eq!(error.as_deref(), Some("Build cancelled"));
    assert!(world.files.versions("p1").is_empty());
    assert!(!world.cancels.is_running("p1"));
}

#[tokio::test]
async fn cancel_without_a_build_still_marks_the_project() {
    let world = World::new().await;
    let mut viewer = world.bus.subscribe("p1");

    let found = cancel_build(
        "p1",
        &world.cancels,
        world.projects.as_ref(),
        world.build_queue.as_ref(),
        &world.bus,
    )
    .await
    .unwrap();

    assert!(!found);
    assert_eq!(world.status().await.0, ProjectStatus::Failed);
    let event = viewer.try_recv().unwrap();
    assert_eq!(event.stage, "cancelled");
    assert_eq!(event.kind, EventKind::Error);
}

#[tokio::test(start_paused = true)]
async fn pool_drains_queue_and_stops_on_shutdown() {
    let world = World::new().await;
    let job_id = submit_build(world.build_queue.as_ref(), &build_payload()).await.unwrap();
    let pool = world.build_pool(todo_app());

    let task = tokio::spawn({
        let pool = pool.clone();
        async move { pool.run().await }
    });
    for _ in 0..50 {
        if world.build_queue.get(job_id).await.unwrap().state == JobState::Completed {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(world.build_queue.get(job_id).await.unwrap().state, JobState::Completed);

    pool.shutdown();
    task.await.unwrap().unwrap();
    assert_eq!(pool.active(), 0);
}

#[tokio::test(start_paused = true)]
async fn retry_after_the_commit_does_not_build_again() {
    let world = World::new().await;
    let job_id = submit_build(world.build_queue.as_ref(), &build_payload()).await.unwrap();
    let model = Arc::new(
        ScriptedModel::new(Provider::Anthropic)
            .respond(todo_changes())
            .respond(todo_changes()),
    );
    let pool = world.build_pool_shared(model.clone());
    world.deploy_queue.close();

    assert_eq!(pool.process_next().await.unwrap(), Some(JobRun::Retrying(job_id)));
    tokio::time::advance(Duration::from_secs(2)).await;
    assert_eq!(pool.process_next().await.unwrap(), Some(JobRun::Retrying(job_id)));

    // Two failed attempts, one model run, one version, one reply.
    assert_eq!(model.calls(), 1);
    assert_eq!(world.files.versions("p1").len(), 1);
    assert_eq!(world.projects.conversation("p1", "c1").await.unwrap().len(), 2);

    world.deploy_queue.reopen();
    tokio::time::advance(Duration::from_secs(4)).await;
    assert_eq!(pool.process_next().await.unwrap(), Some(JobRun::Completed(job_id)));

    assert_eq!(model.calls(), 1);
    assert_eq!(world.files.versions("p1").len(), 1);
    assert_eq!(world.projects.conversation("p1", "c1").await.unwrap().len(), 2);
    let build = world.build_queue.get(job_id).await.unwrap();
    assert_eq!(build.attempts, 3);
    assert_eq!(build.result.as_ref().unwrap()["version_number"], 1);
    assert_eq!(world.deploy_queue.list(JobState::Waiting).await.unwrap().len(), 1);
    assert_eq!(world.status().await.0, ProjectStatus::Deploying);
}

fn short_timeout() -> QueueOptions {
    QueueOptions {
        job_timeout: Duration::from_secs(30),
        ..QueueOptions::build()
    }
}

#[tokio::test(start_paused = true)]
async fn hard_timeout_counts_as_a_failed_attempt() {
    let world = World::with_build_options(short_timeout()).await;
    let job_id = submit_build(world.build_queue.as_ref(), &build_payload()).await.unwrap();
    let pool = world.build_pool(
        ScriptedModel::new(Provider::Anthropic)
            .stall(Duration::from_secs(60), todo_changes())
            .stall(Duration::from_secs(60), todo_changes())
            .stall(Duration::from_secs(60), todo_changes()),
    );

    assert_eq!(pool.process_next().await.unwrap(), Some(JobRun::Retrying(job_id)));
    let job = world.build_queue.get(job_id).await.unwrap();
    assert_eq!(job.attempts, 1);
    assert_eq!(job.last_error.as_deref(), Some("job exceeded its 30s timeout"));

    tokio::time::advance(Duration::from_secs(2)).await;
    assert_eq!(pool.process_next().await.unwrap(), Some(JobRun::Retrying(job_id)));
    tokio::time::advance(Duration::from_secs(4)).await;
    assert_eq!(pool.process_next().await.unwrap(), Some(JobRun::Dead(job_id)));

    let job = world.build_queue.get(job_id).await.unwrap();
    assert_eq!(job.state, JobState::Failed);
    assert_eq!(job.attempts, 3);
    assert!(world.files.versions("p1").is_empty());
    assert_eq!(world.status().await.0, ProjectStatus::Failed);
}

#[tokio::test(start_paused = true)]
async fn cancel_after_a_timed_out_attempt_stops_the_retry() {
    let world = World::with_build_options(short_timeout()).await;
    let job_id = submit_build(world.build_queue.as_ref(), &build_payload()).await.unwrap();
    let pool = world.build_pool(
        ScriptedModel::new(Provider::Anthropic)
            .stall(Duration::from_secs(60), todo_changes())
            .respond(todo_changes()),
    );

    assert_eq!(pool.process_next().await.unwrap(), Some(JobRun::Retrying(job_id)));
    assert!(!world.cancels.is_running("p1"));

    let found = cancel_build(
        "p1",
        &world.cancels,
        world.projects.as_ref(),
        world.build_queue.as_ref(),
        &world.bus,
    )
    .await
    .unwrap();
    assert!(found);

    tokio::time::advance(Duration::from_secs(2)).await;
    assert_eq!(pool.process_next().await.unwrap(), Some(JobRun::Dead(job_id)));
    assert!(world.files.versions("p1").is_empty());
    let (status, error) = world.status().await;
    assert_eq!(status, ProjectStatus::Failed);
    assert_eq!(error.as_deref(), Some("Build cancelled"));
}
