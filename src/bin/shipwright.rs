//! shipwright CLI: run the build core, submit builds and inspect queues.

use shipwright::agent::IterationAgent;
use shipwright::api::{AppState, router};
use shipwright::config::secrets::{ExposeSecret, SecretString};
use shipwright::config::{Config, Settings};
use shipwright::db::{Db, PgFileStore, PgProjectStore, PgQueue};
use shipwright::llm::HttpModelClient;
use shipwright::model::{BuildPayload, QueueName};
use shipwright::progress::ProgressBus;
use shipwright::queue::{MemoryQueue, WorkQueue};
use shipwright::store::{FileStore, MemoryFileStore, MemoryProjectStore, ProjectStore, VersionWriter};
use shipwright::telemetry::{TelemetryConfig, init_telemetry};
use shipwright::worker::{
    BuildProcessor, CancelRegistry, DeployProcessor, NullDeployProvider, WorkerConfig, WorkerPool,
    submit_build,
};
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;

#[derive(Parser)]
#[command(name = "shipwright", about = "Build orchestration core for an AI app builder")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the build and deploy workers plus the HTTP API
    Serve {
        /// Listen address (overrides LISTEN_ADDR)
        #[arg(long)]
        listen: Option<SocketAddr>,
    },
    /// Build operations
    Build {
        #[command(subcommand)]
        action: BuildAction,
    },
    /// Queue operations
    Queue {
        #[command(subcommand)]
        action: QueueAction,
    },
    /// Cancel a project's build on a running server
    Cancel {
        project_id: String,
        /// Base URL of the running server
        #[arg(long, default_value = "http://127.0.0.1:8080")]
        server: String,
    },
}

#[derive(Subcommand)]
enum BuildAction {
    /// Enqueue a build for a project
    Submit {
        project_id: String,
        /// Conversation holding the triggering message
        #[arg(long)]
        conversation: String,
        /// Message that triggered the build
        #[arg(long)]
        message: String,
        /// Model override
        #[arg(long)]
        model: Option<String>,
    },
}

#[derive(Subcommand)]
enum QueueAction {
    /// Show job counts by state
    Stats {
        /// Queue name (build or deploy); both when omitted
        queue: Option<String>,
    },
}

/// Queues and stores the workers run against.
struct Backends {
    build_queue: Arc<dyn WorkQueue>,
    deploy_queue: Arc<dyn WorkQueue>,
    files: Arc<dyn FileStore>,
    projects: Arc<dyn ProjectStore>,
}

impl Backends {
    async fn connect(config: &Config, settings: &Settings) -> anyhow::Result<Self> {
        match &config.database_url {
            Some(_) => {
                let db = connect_db(config).await?;
                Ok(Self {
                    build_queue: Arc::new(pg_queue(&db, QueueName::Build, settings).await?),
                    deploy_queue: Arc::new(pg_queue(&db, QueueName::Deploy, settings).await?),
                    files: Arc::new(PgFileStore::new(Arc::clone(&db))),
                    projects: Arc::new(PgProjectStore::new(db)),
                })
            }
            None => {
                info!("DATABASE_URL not set, using in-memory queues and stores");
                Ok(Self {
                    build_queue: Arc::new(MemoryQueue::new(
                        QueueName::Build,
                        settings.queue_options(QueueName::Build),
                    )),
                    deploy_queue: Arc::new(MemoryQueue::new(
                        QueueName::Deploy,
                        settings.queue_options(QueueName::Deploy),
                    )),
                    files: Arc::new(MemoryFileStore::new()),
                    projects: Arc::new(MemoryProjectStore::new()),
                })
            }
        }
    }
}

async fn connect_db(config: &Config) -> anyhow::Result<Arc<Db>> {
    let Some(url) = &config.database_url else {
        anyhow::bail!("DATABASE_URL is required for this command");
    };
    let db = Db::connect(url.expose_secret()).await?;
    db.migrate().await?;
    Ok(Arc::new(db))
}

async fn pg_queue(db: &Arc<Db>, name: QueueName, settings: &Settings) -> anyhow::Result<PgQueue> {
    let queue = PgQueue::new(Arc::clone(db), name, settings.queue_options(name));
    queue.ensure().await?;
    Ok(queue)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = Config::from_env()?;

    match cli.command {
        Command::Serve { listen } => cmd_serve(config, listen).await,
        Command::Build {
            action:
                BuildAction::Submit {
                    project_id,
                    conversation,
                    message,
                    model,
                },
        } => {
            let settings = config.settings()?;
            let db = connect_db(&config).await?;
            let queue = pg_queue(&db, QueueName::Build, &settings).await?;
            let payload = BuildPayload {
                project_id,
                conversation_id: conversation,
                message_id: message,
                model,
            };
            let id = submit_build(&queue, &payload).await?;
            println!("Enqueued build {id} for {}", payload.project_id);
            Ok(())
        }
        Command::Queue {
            action: QueueAction::Stats { queue },
        } => cmd_queue_stats(&config, queue).await,
        Command::Cancel { project_id, server } => cmd_cancel(&project_id, &server).await,
    }
}

async fn cmd_serve(config: Config, listen: Option<SocketAddr>) -> anyhow::Result<()> {
    let _guard = init_telemetry(TelemetryConfig {
        endpoint: config.otel_endpoint.clone(),
        service_name: "shipwright".to_string(),
        log_level: config.log_level.clone(),
    })?;

    let settings = config.settings()?;
    let agent_config = settings.agent_config();
    let backends = Backends::connect(&config, &settings).await?;

    let model = HttpModelClient::new(
        config.model_provider,
        SecretString::from(config.model_api_key.expose_secret().to_string()),
        config.default_model(),
        config.model_base_url.clone(),
        agent_config.turn_timeout,
    )?;
    let writer = Arc::new(VersionWriter::new(Arc::clone(&backends.files)));
    let agent = Arc::new(IterationAgent::new(Arc::new(model), writer, agent_config));

    let bus = ProgressBus::new();
    let cancels = Arc::new(CancelRegistry::new());

    let build_pool = WorkerPool::new(
        Arc::clone(&backends.build_queue),
        Arc::new(BuildProcessor::new(
            agent,
            Arc::clone(&backends.projects),
            Arc::clone(&backends.deploy_queue),
            bus.clone(),
            Arc::clone(&cancels),
        )),
        WorkerConfig {
            concurrency: config.build_concurrency,
            ..WorkerConfig::default()
        },
    );
    let deploy_pool = WorkerPool::new(
        Arc::clone(&backends.deploy_queue),
        Arc::new(DeployProcessor::new(
            Arc::new(NullDeployProvider),
            Arc::clone(&backends.files),
            Arc::clone(&backends.projects),
            bus.clone(),
        )),
        WorkerConfig {
            concurrency: config.deploy_concurrency,
            ..WorkerConfig::default()
        },
    );

    let build_task = tokio::spawn({
        let pool = build_pool.clone();
        async move { pool.run().await }
    });
    let deploy_task = tokio::spawn({
        let pool = deploy_pool.clone();
        async move { pool.run().await }
    });

    let app = router(AppState {
        bus,
        build_queue: backends.build_queue,
        deploy_queue: backends.deploy_queue,
        projects: backends.projects,
        cancels,
    });
    let addr = listen.unwrap_or(config.listen_addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
        })
        .await?;

    info!("shutting down workers");
    build_pool.shutdown();
    deploy_pool.shutdown();
    build_task.await??;
    deploy_task.await??;
    Ok(())
}

async fn cmd_queue_stats(config: &Config, queue: Option<String>) -> anyhow::Result<()> {
    let settings = config.settings()?;
    let db = connect_db(config).await?;
    let names = match queue {
        Some(name) => vec![name.parse::<QueueName>()?],
        None => vec![QueueName::Build, QueueName::Deploy],
    };

    println!(
        "{:<8}  {:>8}  {:>8}  {:>9}  {:>8}  {:>8}",
        "QUEUE", "WAITING", "ACTIVE", "COMPLETED", "FAILED", "DELAYED"
    );
    for name in names {
        let stats = pg_queue(&db, name, &settings).await?.stats().await?;
        println!(
            "{:<8}  {:>8}  {:>8}  {:>9}  {:>8}  {:>8}",
            name, stats.waiting, stats.active, stats.completed, stats.failed, stats.delayed
        );
    }
    Ok(())
}

async fn cmd_cancel(project_id: &str, server: &str) -> anyhow::Result<()> {
    let url = format!("{}/projects/{project_id}/cancel", server.trim_end_matches('/'));
    let response = reqwest::Client::new().post(&url).send().await?;
    let status = response.status();
    let body: serde_json::Value = response.json().await?;
    if !status.is_success() {
        anyhow::bail!("cancel failed ({status}): {}", body["error"]);
    }
    if body["cancelled"].as_bool().unwrap_or(false) {
        println!("Cancelled build for {project_id}");
    } else {
        println!("No build in flight for {project_id}; project marked failed");
    }
    Ok(())
}
