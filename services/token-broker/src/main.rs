//! Token Broker
//!
//! Single-binary Rust service that:
//! 1. Loads credentials, tokens and history from file-backed stores
//! 2. Drives a login portal (automation command or HTTP endpoint)
//! 3. Serves tokens over HTTP, logging in at most once per (site, account)
//! 4. Exposes statistics, history and Prometheus metrics

mod api;
mod config;
mod error;
mod metrics;

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use acquisition::{AcquisitionOrchestrator, Collaborators};
use anyhow::{Context, Result};
use portal::{CommandPortal, HttpPortal, LoginPortal};
use stores::{FileCredentialStore, FileTokenStore, JsonlHistoryStore};
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::api::{AppState, build_router};
use crate::config::{Config, PortalKind};

/// How often expired token cache entries are swept.
const CACHE_PURGE_INTERVAL: Duration = Duration::from_secs(300);

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

    info!("starting token-broker");

    // Install Prometheus metrics recorder before any metrics are emitted
    let prometheus_handle = metrics::install_recorder();

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
        listen_addr = %config.server.listen_addr,
        portal = ?config.portal.kind,
        credentials = %config.stores.credentials_path.display(),
        "configuration loaded"
    );

    let credentials = FileCredentialStore::load(config.stores.credentials_path.clone())
        .await
        .with_context(|| {
            format!(
                "failed to load credentials from {}",
                config.stores.credentials_path.display()
            )
        })?;
    if credentials.is_empty().await {
        warn!("credential store is empty; every acquisition will fail until credentials are added");
    } else {
        info!(credentials = credentials.len().await, "credentials loaded");
    }
    let tokens = FileTokenStore::load(config.stores.tokens_path.clone())
        .await
        .with_context(|| {
            format!(
                "failed to load tokens from {}",
                config.stores.tokens_path.display()
            )
        })?;
    let history = JsonlHistoryStore::new(config.stores.history_path.clone());

    let orchestrator = AcquisitionOrchestrator::new(
        config.acquisition(),
        Collaborators {
            portal: build_portal(&config)?,
            credentials: Arc::new(credentials),
            tokens: Arc::new(tokens),
            history: Arc::new(history),
        },
    )
    .context("invalid acquisition configuration")?;
    let orchestrator = Arc::new(orchestrator);

    let purge_task = spawn_cache_purge(orchestrator.clone(), CACHE_PURGE_INTERVAL);

    let app_state = AppState::new(orchestrator, prometheus_handle);
    let in_flight = app_state.in_flight.clone();
    let app = build_router(app_state, config.server.max_connections);

    let listen_addr = config.server.listen_addr;
    let listener = TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind to {listen_addr}"))?;
    info!(addr = %listen_addr, "accepting requests");

    // The drain timeout starts when the shutdown signal fires: notify the
    // server to drain, then race the drain against the timeout.
    let drain_timeout = Duration::from_secs(config.server.drain_timeout_secs);
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
    });

    shutdown_signal().await;
    let _ = shutdown_tx.send(());

    match tokio::time::timeout(drain_timeout, server_handle).await {
        Ok(Ok(Ok(()))) => {
            info!("all in-flight requests drained");
        }
        Ok(Ok(Err(e))) => {
            error!(error = %e, "server error during shutdown");
        }
        Ok(Err(e)) => {
            error!(error = %e, "server task panicked");
        }
        Err(_) => {
            let remaining = in_flight.load(Ordering::Relaxed);
            warn!(
                remaining,
                drain_timeout_secs = drain_timeout.as_secs(),
                "drain timeout exceeded, forcing shutdown"
            );
        }
    }

    purge_task.abort();
    info!("shutdown complete");
    Ok(())
}

/// Build the configured login portal.
fn build_portal(config: &Config) -> Result<Arc<dyn LoginPortal>> {
    let portal = &config.portal;
    match portal.kind {
        PortalKind::Command => {
            let program = portal
                .command
                .clone()
                .context("portal.command is required for the command portal")?;
            info!(program = %program.display(), "using command portal");
            Ok(Arc::new(CommandPortal::new(
                program,
                portal.args.clone(),
                Duration::from_secs(portal.timeout_secs),
            )))
        }
        PortalKind::Http => {
            let url = portal
                .login_url
                .clone()
                .context("portal.login_url is required for the http portal")?;
            info!(login_url = %url, authenticated = portal.api_key.is_some(), "using http portal");
            Ok(Arc::new(HttpPortal::new(
                url,
                portal.api_key.clone(),
                Duration::from_secs(portal.timeout_secs),
            )))
        }
    }
}

/// Spawn a background task that sweeps expired token cache entries.
///
/// Expired entries are never served, so this only bounds memory.
fn spawn_cache_purge(
    orchestrator: Arc<AcquisitionOrchestrator>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // First tick fires immediately and the cache starts empty
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let purged = orchestrator.cache().purge_expired().await;
            if purged > 0 {
                info!(purged, "expired cache entries purged");
            }
        }
    })
}

/// Wait for SIGTERM or SIGINT for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for Ctrl+C");
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
