//! Skyfuse Server
//!
//! Fuses aircraft position reports from many feeders into one live picture,
//! then fans changes out to webhook subscribers and live viewers.

mod api;
mod config;
mod server;
mod shutdown;
mod state;

use clap::Parser;
use config::file::StorageKind;
use config::{ConfigLoader, LoadedConfig, get_database_url};
use server::{build_router, run_server};
use shutdown::spawn_config_reload_handler;
use skyfuse_core::config::{ConfigStore, StaticWebhookConfig};
use skyfuse_core::connections::{Connections, webhook_http_client};
use skyfuse_core::events::{DEFAULT_CHANNEL_BUFFER, EventBus, ViewerHub};
use skyfuse_core::live_store::LiveStateStore;
use skyfuse_core::processors::{
    BroadcastBridge, HttpWebhookDelivery, IngestionWorker, WebhookDispatchWorker, WebhookFanIn,
    WebhookJob,
};
use skyfuse_core::queue::{MemoryQueue, PgQueue, QueueNames, SharedQueue};
use skyfuse_core::repository::{MemoryStateRepository, PgStateRepository, SharedRepository};
use skyfuse_core::subscribers::{
    CompositeDirectory, PgSubscriberDirectory, SharedDirectory, StaticSubscriberDirectory,
};
use skyfuse_sdk::objects::ReportEnvelope;
use state::AppState;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Skyfuse - multi-source aircraft position fusion pipeline
#[derive(Parser, Debug)]
#[command(name = "skyfuse-server")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, default_value = "./skyfuse.toml")]
    config: PathBuf,

    /// Override the listen address (e.g., 0.0.0.0:3000)
    #[arg(short, long)]
    listen: Option<SocketAddr>,

    /// Run database migrations on startup
    #[arg(long, default_value = "false")]
    migrate: bool,

    /// Emit logs as JSON lines
    #[arg(long, env = "SKYFUSE_LOG_JSON", default_value = "false")]
    log_json: bool,
}

/// Queues, storage and subscriber lookup for the selected backend.
struct Storage {
    connections: Option<Connections>,
    ingest_queue: SharedQueue<ReportEnvelope>,
    webhook_queue: SharedQueue<WebhookJob>,
    repository: SharedRepository,
    directory: SharedDirectory,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse command line arguments
    let args = Args::parse();

    init_tracing(args.log_json);

    tracing::info!("Starting skyfuse-server v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config_loader = Arc::new(ConfigLoader::new(&args.config, args.listen));
    let loaded_config = config_loader.load().map_err(|e| {
        tracing::error!("Failed to load configuration: {}", e);
        e
    })?;
    tracing::info!("Configuration loaded from {:?}", args.config);

    let listen_addr = loaded_config.listen;
    let pipeline = loaded_config.pipeline.clone();
    let webhooks = ConfigStore::new(loaded_config.webhooks.clone());
    let feeder_secret = ConfigStore::new(loaded_config.feeder_secret.clone());

    let storage = connect_storage(&args, &loaded_config, webhooks.clone()).await?;

    // Shared in-process channels and cache
    let mut bus = EventBus::new(DEFAULT_CHANNEL_BUFFER);
    let hub = ViewerHub::new();
    let live = Arc::new(LiveStateStore::new(
        pipeline.live.max_entries,
        pipeline.live.ttl,
    ));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Bus subscribers are created before the bus moves into its only
    // publisher. They stop once the ingestion worker returns and drops it.
    let fan_in = WebhookFanIn::new(&mut bus, storage.webhook_queue.clone());
    let bridge = BroadcastBridge::new(&bus, hub.clone(), pipeline.broadcast.flush_interval);
    let ingestion = IngestionWorker::new(
        storage.ingest_queue.clone(),
        storage.repository.clone(),
        live.clone(),
        bus,
        pipeline.ingest.clone(),
        shutdown_rx.clone(),
    );
    let http = match &storage.connections {
        Some(connections) => connections.http.clone(),
        None => webhook_http_client()?,
    };
    let dispatch = WebhookDispatchWorker::new(
        storage.webhook_queue.clone(),
        storage.directory.clone(),
        Arc::new(HttpWebhookDelivery::new(http)),
        pipeline.webhook.clone(),
        shutdown_rx.clone(),
    );

    let janitor_live = live.clone();
    let janitor_rx = shutdown_rx.clone();
    let janitor_interval = pipeline.live.janitor_interval;
    let ingestion_handle = tokio::spawn(ingestion.run());
    let handles = vec![
        tokio::spawn(fan_in.run()),
        tokio::spawn(dispatch.run()),
        tokio::spawn(bridge.run()),
        tokio::spawn(async move { janitor_live.run_janitor(janitor_rx, janitor_interval).await }),
    ];
    drop(shutdown_rx);

    // Create application state
    let state = AppState {
        ingest_queue: storage.ingest_queue.clone(),
        webhook_queue: storage.webhook_queue.clone(),
        repository: storage.repository.clone(),
        live,
        hub,
        feeder_secret,
        webhooks,
    };

    // Spawn config reload handler (listens for SIGHUP)
    let reload_notify = spawn_config_reload_handler(state.clone(), config_loader);

    // Build the router
    let router = build_router(state);

    // Run the server
    tracing::info!("Starting HTTP server on {}", listen_addr);
    let result = run_server(router, listen_addr).await;

    // Stop the pipeline; workers finish their in-flight batch first. The
    // ingestion worker goes first so every event it still publishes is
    // handed to the fan-in before the bus closes.
    reload_notify.notify_one();
    tracing::info!("Stopping pipeline workers...");
    let _ = shutdown_tx.send(true);
    if let Err(e) = ingestion_handle.await {
        tracing::error!(error = %e, "Ingestion worker panicked");
    }
    for joined in futures_util::future::join_all(handles).await {
        if let Err(e) = joined {
            tracing::error!(error = %e, "Pipeline task panicked");
        }
    }

    if let Some(connections) = &storage.connections {
        connections.close().await;
    }
    tracing::info!("Server shutdown complete");

    result.map_err(Into::into)
}

/// Build the selected storage backend, running migrations if requested.
async fn connect_storage(
    args: &Args,
    config: &LoadedConfig,
    webhooks: ConfigStore<Vec<StaticWebhookConfig>>,
) -> anyhow::Result<Storage> {
    let static_directory: SharedDirectory = Arc::new(StaticSubscriberDirectory::new(webhooks));
    let ingest = &config.pipeline.ingest;
    let webhook = &config.pipeline.webhook;

    match config.storage {
        StorageKind::Memory => {
            tracing::warn!("Using in-memory storage; queued work and state are lost on exit");
            Ok(Storage {
                connections: None,
                ingest_queue: Arc::new(
                    MemoryQueue::<ReportEnvelope>::new(&ingest.queue_name)
                        .with_visibility_timeout(ingest.visibility_timeout),
                ),
                webhook_queue: Arc::new(
                    MemoryQueue::<WebhookJob>::new(&webhook.queue_name)
                        .with_visibility_timeout(webhook.visibility_timeout),
                ),
                repository: Arc::new(MemoryStateRepository::new()),
                directory: static_directory,
            })
        }
        StorageKind::Postgres => {
            // Get database URL from environment
            let database_url = get_database_url().map_err(|e| {
                tracing::error!("DATABASE_URL environment variable not set");
                e
            })?;

            let connections = Connections::connect(&database_url, config.max_connections)
                .await
                .map_err(|e| {
                    tracing::error!("Failed to connect to database: {}", e);
                    e
                })?;

            // Run migrations if requested
            if args.migrate {
                tracing::info!("Running database migrations...");
                sqlx::migrate!("../migrations")
                    .run(&connections.pool)
                    .await
                    .map_err(|e| {
                        tracing::error!("Failed to run migrations: {}", e);
                        e
                    })?;
                tracing::info!("Migrations completed successfully");
            }

            let db = connections.database();
            let names = |worker: &skyfuse_core::config::WorkerConfig| QueueNames {
                main: worker.queue_name.clone(),
                dead_letter: worker.dead_letter_queue.clone(),
            };
            let pg_directory: SharedDirectory = Arc::new(PgSubscriberDirectory::new(db.clone()));
            let directory: SharedDirectory = Arc::new(CompositeDirectory::new(vec![
                pg_directory,
                static_directory,
            ]));

            Ok(Storage {
                ingest_queue: Arc::new(
                    PgQueue::<ReportEnvelope>::new(db.clone(), names(ingest))
                        .with_visibility_timeout(ingest.visibility_timeout),
                ),
                webhook_queue: Arc::new(
                    PgQueue::<WebhookJob>::new(db.clone(), names(webhook))
                        .with_visibility_timeout(webhook.visibility_timeout),
                ),
                repository: Arc::new(PgStateRepository::new(db)),
                directory,
                connections: Some(connections),
            })
        }
    }
}

/// Initialize the tracing subscriber with environment-based filtering.
fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,sqlx=warn,tower_http=debug"));

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}
