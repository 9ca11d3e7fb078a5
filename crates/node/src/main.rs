use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use peerwork_db::{PgStore, SharedStore};
use peerwork_node::config::StatusConfig;
use peerwork_node::state::AppState;
use peerwork_queue::config::DEFAULT_WORKER_ADDR;
use peerwork_queue::{Coordinator, LocalPerformer, QueueConfig, WorkRegistry, WorkerProcess};

/// Run mode, from the first command-line argument.
enum Mode {
    /// Node controller: coordinator plus status endpoint (default).
    Node,
    /// Worker process attached to the local node controller.
    Worker,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // --- Tracing ---
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "peerwork_node=debug,peerwork_queue=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mode = match std::env::args().nth(1).as_deref() {
        None | Some("node") => Mode::Node,
        Some("worker") => Mode::Worker,
        Some(other) => anyhow::bail!("Unknown mode '{other}', expected 'node' or 'worker'"),
    };

    // --- Configuration ---
    let config = QueueConfig::from_env().context("Invalid queue configuration")?;
    tracing::info!(
        hostname = %config.hostname,
        peer_port = config.peer_port,
        "Loaded queue configuration",
    );

    // --- Database ---
    let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;

    let pool = peerwork_db::create_pool(&database_url)
        .await
        .context("Failed to connect to database")?;
    tracing::info!("Database connection pool created");

    peerwork_db::health_check(&pool)
        .await
        .context("Database health check failed")?;
    tracing::info!("Database health check passed");

    peerwork_db::run_migrations(&pool)
        .await
        .context("Failed to run database migrations")?;
    tracing::info!("Database migrations applied");

    // Work types are registered by applications embedding the queue; the
    // stock binary only coordinates.
    let registry = Arc::new(WorkRegistry::new());
    peerwork_db::ensure_tables(&pool, registry.tables())
        .await
        .context("Failed to create work tables")?;

    let store: SharedStore = Arc::new(PgStore::new(pool));

    match mode {
        Mode::Node => run_node(config, store, registry).await,
        Mode::Worker => run_worker(config, store, registry).await,
    }
}

async fn run_node(
    config: QueueConfig,
    store: SharedStore,
    registry: Arc<WorkRegistry>,
) -> anyhow::Result<()> {
    let status_config = StatusConfig::from_env().context("Invalid status configuration")?;

    // --- Coordinator ---
    let coordinator = Coordinator::new(config, store, registry);
    coordinator
        .start()
        .await
        .context("Failed to start coordinator")?;

    // --- Status server ---
    let app = peerwork_node::app(AppState {
        coordinator: Arc::clone(&coordinator),
    });
    let listener = tokio::net::TcpListener::bind((status_config.host.as_str(), status_config.port))
        .await
        .context("Failed to bind status endpoint")?;
    tracing::info!(addr = %listener.local_addr()?, "Starting status server");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Status server error")?;

    // --- Post-shutdown cleanup ---
    tracing::info!("Status server stopped, shutting down coordinator");
    coordinator.stop().await?;
    tracing::info!("Graceful shutdown complete");
    Ok(())
}

async fn run_worker(
    config: QueueConfig,
    store: SharedStore,
    registry: Arc<WorkRegistry>,
) -> anyhow::Result<()> {
    let node_addr = config
        .worker_addr
        .unwrap_or_else(|| DEFAULT_WORKER_ADDR.to_string());
    let worker = WorkerProcess::new(node_addr, LocalPerformer::new(store, registry));

    let cancel = CancellationToken::new();
    let run = {
        let cancel = cancel.clone();
        tokio::spawn(async move { worker.run(cancel).await })
    };

    shutdown_signal().await;
    cancel.cancel();
    run.await.context("Worker task panicked")?;
    tracing::info!("Graceful shutdown complete");
    Ok(())
}

/// Wait for SIGINT (Ctrl-C) or, on Unix, SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl-C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received SIGINT (Ctrl-C), starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown");
        }
    }
}
