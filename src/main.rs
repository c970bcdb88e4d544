mod api;
mod application;
mod build;
mod config;
mod db;
mod error;
mod events;
mod git;
mod infrastructure;
mod providers;
mod state;

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use application::events::BroadcastEventBus;
use application::ports::{SecretVault, SourceControl, StackRuntime};
use build::{BuildQueue, BuildWorker, DeploymentExecutor};
use config::AppConfig;
use git::GitCliSync;
use infrastructure::database::SqliteStore;
use infrastructure::logging::BoundaryLogger;
use infrastructure::runtime::{ComposeStackRuntime, HealthCheck};
use infrastructure::vault::AesGcmVault;
use state::AppContext;

/// Upper bound for a single compose invocation; per-stack deploy timeouts are shorter.
const COMPOSE_TIMEOUT: Duration = Duration::from_secs(3600);

#[tokio::main]
async fn main() -> Result<()> {
    let config = AppConfig::from_env()?;
    let _log_guard = init_tracing(&config);

    info!("Starting stackhook");

    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("Failed to create data directory {}", config.data_dir.display()))?;
    info!("Data directory: {}", config.data_dir.display());

    let store = Arc::new(SqliteStore::connect(&config.database_url).await?);

    // Collaborators
    let logger = Arc::new(BoundaryLogger::new());
    let event_bus = BroadcastEventBus::new_default(logger.clone());
    let vault: Arc<dyn SecretVault> = Arc::new(AesGcmVault::from_env_or_file(
        config.vault_key.clone(),
        &config.data_dir,
    ));
    let source: Arc<dyn SourceControl> = Arc::new(GitCliSync::new(
        config.workspaces_dir(),
        config.credentials_dir(),
        vault.clone(),
        config.git_timeout,
    ));
    let runtime: Arc<dyn StackRuntime> = Arc::new(ComposeStackRuntime::new(
        config.stacks_dir(),
        config.compose_bin.clone(),
        COMPOSE_TIMEOUT,
    ));
    let executor = Arc::new(DeploymentExecutor::new(
        runtime,
        vault.clone(),
        HealthCheck::new(config.health_base_url.clone()),
        config.compose_bin.clone(),
    ));

    // Queue and worker; requests left over from the last run go first
    let queue = Arc::new(BuildQueue::new(store.clone()));
    let recovered = queue.recover().await.context("Failed to recover build queue")?;
    if recovered > 0 {
        info!("Recovered {} pending build(s)", recovered);
    }

    let worker = Arc::new(BuildWorker::new(
        store.clone(),
        event_bus.clone(),
        queue.clone(),
        source.clone(),
        executor,
        logger.clone(),
    ));
    worker.start();

    let context = AppContext::new(store, event_bus, queue, worker.clone(), vault, source, logger);
    info!("Application context initialized");

    let app = api::router(context);
    let listener = tokio::net::TcpListener::bind(config.bind)
        .await
        .with_context(|| format!("Failed to bind {}", config.bind))?;
    info!("API server listening on {}", config.bind);

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        error!("API server failed: {}", e);
    }

    info!("Shutting down...");
    worker.stop().await;

    Ok(())
}

/// stdout (text or JSON) plus an optional daily rolling file.
fn init_tracing(config: &AppConfig) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());

    let stdout = if config.log_json {
        fmt::layer().json().boxed()
    } else {
        fmt::layer().boxed()
    };

    let (file, guard) = match &config.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "stackhook.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().json().with_ansi(false).with_writer(writer).boxed();
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stdout)
        .with(file)
        .init();

    guard
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Received shutdown signal");
}
