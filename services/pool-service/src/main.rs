//! Account Pool Service
//!
//! Single-binary Rust service that:
//! 1. Opens the account store (SQLite or JSON file)
//! 2. Starts the replenishment and aging jobs
//! 3. Serves the admin API for allocation and pool management
//! 4. Stops the jobs and drains the API on SIGINT/SIGTERM

mod admin;
mod config;
mod error;
mod metrics;
mod producer;

use std::sync::Arc;
use std::time::Duration;

use account_pool::{AllocationEngine, FileStore, Scheduler, SqlStore, Storage, SystemClock};
use anyhow::{Context, Result};
use token_exchange::TokenRefresher;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::admin::AdminState;
use crate::config::{Backend, Config};
use crate::producer::CommandProducer;

/// Upper bound on draining in-flight admin requests after a shutdown signal.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and LOG_LEVEL / RUST_LOG support
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("starting account-pool-service");

    // Install Prometheus metrics recorder before any metrics are emitted
    let prometheus_handle = metrics::install_recorder()?;

    // CLI: simple --config flag parsing
    let args: Vec<String> = std::env::args().collect();
    let cli_config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str());
    let config_path = Config::resolve_path(cli_config_path);
    info!(path = %config_path.display(), "loading configuration");
    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    info!(
        backend = ?config.storage.backend,
        listen_addr = %config.admin.listen_addr,
        replenish = config.scheduler.enable_replenish,
        aging = config.scheduler.enable_aging,
        "configuration loaded"
    );

    let storage = open_storage(&config).await?;
    let refresher = TokenRefresher::new(reqwest::Client::new(), config.exchange_config());
    let producer = Arc::new(CommandProducer::new(
        config.producer.create_command.clone(),
        config.producer.login_command.clone(),
    ));
    let engine = Arc::new(AllocationEngine::new(storage, refresher, producer));

    let scheduler = Arc::new(Scheduler::new(
        engine.clone(),
        config.scheduler_config()?,
    ));
    scheduler.start().await;

    let state = AdminState::new(engine, scheduler.clone(), Some(prometheus_handle));
    let app = admin::build_router(state, config.admin.max_connections);

    let listen_addr = config.admin.listen_addr;
    let listener = TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind to {listen_addr}"))?;
    info!(addr = %listen_addr, "admin API listening");

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
    });

    shutdown_signal().await;

    // No new background work once shutdown starts
    scheduler.stop().await;
    let _ = shutdown_tx.send(());

    // The drain timer starts at signal receipt
    match tokio::time::timeout(DRAIN_TIMEOUT, server_handle).await {
        Ok(Ok(Ok(()))) => info!("all in-flight requests drained"),
        Ok(Ok(Err(e))) => error!(error = %e, "server error during shutdown"),
        Ok(Err(e)) => error!(error = %e, "server task panicked"),
        Err(_) => warn!(
            drain_timeout_secs = DRAIN_TIMEOUT.as_secs(),
            "drain timeout exceeded, forcing shutdown"
        ),
    }

    info!("shutdown complete");
    Ok(())
}

/// Open the configured backend. Failure here is fatal to the process.
async fn open_storage(config: &Config) -> Result<Arc<dyn Storage>> {
    let clock = Arc::new(SystemClock);
    let storage: Arc<dyn Storage> = match config.storage.backend {
        Backend::Sqlite => {
            let url = config
                .storage
                .url
                .as_deref()
                .context("storage.url is required for the sqlite backend")?;
            Arc::new(
                SqlStore::connect(url, clock)
                    .await
                    .with_context(|| format!("failed to open account database {url}"))?,
            )
        }
        Backend::File => {
            let path = config
                .storage
                .path
                .clone()
                .context("storage.path is required for the file backend")?;
            Arc::new(
                FileStore::load(path.clone(), clock)
                    .await
                    .with_context(|| format!("failed to load account file {}", path.display()))?,
            )
        }
    };
    info!(backend = storage.backend(), "account storage ready");
    Ok(storage)
}

/// Wait for SIGTERM or SIGINT for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use account_pool::{Insert, NewAccount};

    fn config_for(storage: &str) -> Config {
        let contents = format!(
            r#"
{storage}

[exchange]
associate_url = "http://127.0.0.1:9/associate"
poll_url = "http://127.0.0.1:9/poll"
"#
        );
        toml::from_str(&contents).unwrap()
    }

    #[tokio::test]
    async fn opens_file_backend() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("accounts.json");
        let config = config_for(&format!(
            "[storage]\nbackend = \"file\"\npath = \"{}\"",
            path.display()
        ));

        let storage = open_storage(&config).await.unwrap();
        assert_eq!(storage.backend(), "file");
        assert!(path.exists());
    }

    #[tokio::test]
    async fn opens_sqlite_backend() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("pool.db").display());
        let config = config_for(&format!("[storage]\nbackend = \"sqlite\"\nurl = \"{url}\""));

        let storage = open_storage(&config).await.unwrap();
        assert_eq!(storage.backend(), "sqlite");
        let inserted = storage.add(NewAccount::new("a@x.test", "pw")).await.unwrap();
        assert_eq!(inserted, Insert::Added { id: 1 });
    }

    #[tokio::test]
    async fn unreadable_storage_is_fatal() {
        let config = config_for(
            "[storage]\nbackend = \"sqlite\"\nurl = \"sqlite:///nonexistent/dir/pool.db\"",
        );
        let err = open_storage(&config).await.err().unwrap();
        assert!(
            format!("{err:#}").contains("failed to open account database"),
            "got: {err:#}"
        );
    }
}
