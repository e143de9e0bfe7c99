//! exile node agent
//!
//! Supervises game-server instances on this host on behalf of the
//! controller.
//!
//! - **Client**: persistent controller connection, reconnects with backoff;
//!   runs the heartbeat and host metrics loops while connected
//! - **Instance Manager**: provisioning, process supervision, backups
//! - **Stats Collector**: per-instance CPU/memory history

use std::fs::OpenOptions;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use tokio::sync::{watch, RwLock};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use exile_node_agent::client::{ClientError, NodeClient};
use exile_node_agent::config::{Config, FirewallKind, RuntimeSettings};
use exile_node_agent::firewall::{Firewall, MemoryFirewall, UfwFirewall};
use exile_node_agent::heartbeat::SharedMetrics;
use exile_node_agent::instance::InstanceManager;
use exile_node_agent::state::SqliteSnapshotStore;
use exile_node_agent::template::{HttpTemplateSource, LocalTemplate, TemplateSource};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;
    init_tracing(&config)?;

    info!("Starting exile node agent");
    info!(
        region = %config.region,
        host = %config.host,
        port = config.port,
        controller_url = %config.controller_url,
        instances_dir = %config.instances_dir.display(),
        "Configuration loaded"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    std::fs::create_dir_all(&config.instances_dir).with_context(|| {
        format!("failed to create instances dir {}", config.instances_dir.display())
    })?;

    let settings = Arc::new(RwLock::new(RuntimeSettings::from_config(&config)));
    let store = SqliteSnapshotStore::open(&config.state_file)
        .with_context(|| format!("failed to open state file {}", config.state_file.display()))?;
    let firewall: Arc<dyn Firewall> = match config.firewall {
        FirewallKind::Ufw => Arc::new(UfwFirewall),
        FirewallKind::None => Arc::new(MemoryFirewall::new()),
    };
    let template: Arc<dyn TemplateSource> = match &config.template_url {
        Some(url) => Arc::new(HttpTemplateSource::new(url.clone(), config.api_key.clone())),
        None => Arc::new(LocalTemplate),
    };

    let manager = Arc::new(InstanceManager::new(
        config.clone(),
        Arc::clone(&settings),
        Arc::new(store),
        firewall,
        template,
    ));

    match manager.restore_instances().await {
        Ok(restarted) => info!(
            total = manager.instance_count().await,
            restarted,
            "Restored instances from state file"
        ),
        Err(e) => error!(error = %e, "Failed to restore instances"),
    }

    let metrics: SharedMetrics = Arc::default();
    let stats_handle = tokio::spawn(
        Arc::clone(&manager).run_stats_collector(config.stats_interval, shutdown_rx.clone()),
    );

    let client = Arc::new(NodeClient::new(
        config.clone(),
        Arc::clone(&manager),
        settings,
        metrics,
    ));
    let mut client_handle = tokio::spawn({
        let client = Arc::clone(&client);
        let shutdown_rx = shutdown_rx.clone();
        async move { client.run(shutdown_rx).await }
    });

    let outcome = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
            Ok(())
        }
        result = &mut client_handle => match result {
            Ok(Err(ClientError::NotEnrolled(reason))) => Err(anyhow!("node not enrolled: {reason}")),
            Ok(Err(e)) => Err(e.into()),
            Ok(Ok(())) => Ok(()),
            Err(e) => Err(anyhow!("client task panicked: {e}")),
        },
    };

    let _ = shutdown_tx.send(true);
    manager.shutdown().await;

    info!("Waiting for workers to shut down...");
    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        let _ = stats_handle.await;
        if !client_handle.is_finished() {
            let _ = client_handle.await;
        }
    })
    .await;

    info!("Node agent shutdown complete");
    outcome
}

/// JSON logs to stdout and to the node log file served by `get_logs`.
fn init_tracing(config: &Config) -> Result<()> {
    let log_file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&config.node_log_file)
        .with_context(|| format!("failed to open log file {}", config.node_log_file.display()))?;

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_ansi(false)
                .with_writer(Mutex::new(log_file)),
        )
        .init();
    Ok(())
}
