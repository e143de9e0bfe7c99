//! exile controller
//!
//! Accepts node connections, tracks fleet membership and brokers commands
//! to nodes.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use exile_controller::{api, config, registry::InMemoryRegistry, state::AppState};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = config::Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to EXILE_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting exile controller");
    info!(
        listen_addr = %config.listen_addr,
        outbound_queue = config.outbound_queue,
        read_deadline_secs = config.read_deadline.as_secs(),
        "Configuration loaded"
    );

    let registry = Arc::new(InMemoryRegistry::new());
    for (host, port) in &config.enrolled_nodes {
        let node_id = registry.enroll(host, *port).await;
        info!(node_id = %node_id, host = %host, port = *port, "Enrolled node");
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let listen_addr = config.listen_addr;
    let state = AppState::new(config, registry);
    let hub = Arc::clone(state.hub());
    let app = api::create_router(state);

    let listener = tokio::net::TcpListener::bind(listen_addr).await?;
    info!(addr = %listen_addr, path = api::NODE_SOCKET_PATH, "Listening for connections");

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let mut shutdown_rx = shutdown_rx;
                loop {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                    if shutdown_rx.changed().await.is_err() {
                        break;
                    }
                }
                info!("HTTP server shutting down");
            })
            .await
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = server_handle => {
            match result {
                Ok(Ok(())) => info!("Server exited normally"),
                Ok(Err(e)) => error!(error = %e, "Server error"),
                Err(e) => error!(error = %e, "Server task panicked"),
            }
            return Ok(());
        }
    }

    let _ = shutdown_tx.send(true);
    hub.close_all().await;

    info!("Waiting for node connections to close...");
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while !hub.connected_nodes().await.is_empty() {
        if tokio::time::Instant::now() >= deadline {
            warn!("Node connections did not close in time");
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    info!("Controller shutdown complete");
    Ok(())
}
