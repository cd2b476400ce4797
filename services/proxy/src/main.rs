//! plfm-vt Proxy
//!
//! Load-balancing TCP and HTTP proxy driven by a live admin API.
//!
//! This service:
//! - Serves the admin API that creates, updates and removes services
//! - Runs one TCP listener per service with health-checked backends
//! - Optionally routes HTTP by Host header to virtual hosts
//! - Optionally persists the service configuration to a snapshot file

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use plfm_proxy::{
    api, config, persistence::StatePersistence, state::AppState, HostRouter, ServiceRegistry,
};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = config::Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to GHOST_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting plfm-vt proxy");
    info!(
        admin_addr = %config.admin_addr,
        http_addr = ?config.http_addr,
        state_file = ?config.state_file,
        max_connections = config.max_connections,
        "Configuration loaded"
    );

    let registry = Arc::new(ServiceRegistry::with_max_connections(config.max_connections));
    let persistence = config.state_file.clone().map(StatePersistence::new);
    if let Some(persistence) = &persistence {
        seed(&registry, persistence).await?;
    }

    let state = AppState::new(Arc::clone(&registry), persistence);
    let admin = api::create_router(state);

    // Create shutdown channel for graceful shutdown
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut servers = JoinSet::new();

    let admin_listener = TcpListener::bind(config.admin_addr)
        .await
        .with_context(|| format!("Failed to bind admin API on {}", config.admin_addr))?;
    info!(addr = %config.admin_addr, "Admin API listening");
    servers.spawn({
        let app = admin.clone();
        let shutdown_rx = shutdown_rx.clone();
        async move {
            axum::serve(admin_listener, app)
                .with_graceful_shutdown(wait_for_shutdown(shutdown_rx))
                .await
        }
    });

    if let Some(http_addr) = config.http_addr {
        let http_listener = TcpListener::bind(http_addr)
            .await
            .with_context(|| format!("Failed to bind HTTP router on {http_addr}"))?;
        info!(addr = %http_addr, "HTTP router listening");

        let app = HostRouter::new(Arc::clone(&registry), admin).into_router();
        let shutdown_rx = shutdown_rx.clone();
        servers.spawn(async move {
            axum::serve(
                http_listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(wait_for_shutdown(shutdown_rx))
            .await
        });
    }

    // Wait for shutdown signal (Ctrl+C) or the first server to exit
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        Some(result) = servers.join_next() => {
            match result {
                Ok(Ok(())) => info!("Server exited normally"),
                Ok(Err(e)) => error!(error = %e, "Server error"),
                Err(e) => error!(error = %e, "Server task panicked"),
            }
        }
    }

    let _ = shutdown_tx.send(true);

    info!("Waiting for servers to shut down...");
    let drained = tokio::time::timeout(Duration::from_secs(10), async {
        while servers.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        warn!("Servers did not shut down in time");
    }

    registry.shutdown().await;
    info!("Proxy shutdown complete");
    Ok(())
}

/// Register every service from the snapshot. A service that fails to start
/// is logged and skipped.
async fn seed(registry: &ServiceRegistry, persistence: &StatePersistence) -> Result<()> {
    let services = persistence.load()?;
    let total = services.len();
    let mut restored = 0usize;

    for config in services {
        let name = config.name.clone();
        match registry.add_service(config).await {
            Ok(_) => restored += 1,
            Err(e) => warn!(service = %name, error = %e, "Failed to restore service"),
        }
    }

    info!(restored, total, "Registry seeded from snapshot");
    Ok(())
}

async fn wait_for_shutdown(mut shutdown_rx: watch::Receiver<bool>) {
    loop {
        if *shutdown_rx.borrow() {
            break;
        }
        if shutdown_rx.changed().await.is_err() {
            break;
        }
    }
    info!("HTTP server shutting down");
}
