//! Heartbeat and host metrics loops.
//!
//! Metrics are sampled on their own timer and cached, so building a
//! heartbeat never waits on a sysinfo refresh.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use exile_proto::{Envelope, HeartbeatPayload, NodeReportedStatus, Verb};
use tokio::sync::{mpsc, watch, RwLock};
use tracing::{debug, error, info, warn};

use crate::config::SharedSettings;
use crate::files;
use crate::instance::InstanceManager;
use crate::logs::{self, KEEP_LINES, MAX_NODE_LOG_BYTES};
use crate::resources::{HostMetrics, HostSampler};

pub type SharedMetrics = Arc<RwLock<HostMetrics>>;

/// Builds a heartbeat from cached metrics and the manager's current view.
pub async fn build_heartbeat(
    manager: &InstanceManager,
    settings: &SharedSettings,
    metrics: &SharedMetrics,
) -> HeartbeatPayload {
    let (max_instances, is_draining) = {
        let settings = settings.read().await;
        (settings.max_instances, settings.is_draining)
    };
    let metrics = *metrics.read().await;
    let status = if manager.is_busy() {
        NodeReportedStatus::Updating
    } else {
        NodeReportedStatus::Online
    };

    HeartbeatPayload {
        current_instances: manager.instance_count().await as u32,
        max_instances,
        status,
        cpu_usage: metrics.cpu_usage,
        mem_used: metrics.mem_used,
        mem_total: metrics.mem_total,
        disk_used: metrics.disk_used,
        disk_total: metrics.disk_total,
        game_version: files::read_version(manager.game_install_dir()),
        is_draining,
    }
}

/// Sends a heartbeat every `interval` until the connection is cancelled or
/// its outbound queue closes.
pub async fn run_heartbeat_loop(
    interval: Duration,
    manager: Arc<InstanceManager>,
    settings: SharedSettings,
    metrics: SharedMetrics,
    outbound: mpsc::Sender<String>,
    mut cancel: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    // The first tick fires immediately; registration already reported state.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            changed = cancel.changed() => {
                if changed.is_err() || *cancel.borrow() {
                    debug!("Connection cancelled, stopping heartbeat loop");
                    break;
                }
                continue;
            }
        }
        let payload = build_heartbeat(&manager, &settings, &metrics).await;
        let frame = match Envelope::notify(Verb::Heartbeat.as_str(), &payload)
            .and_then(|envelope| envelope.to_json())
        {
            Ok(frame) => frame,
            Err(e) => {
                error!(error = %e, "Failed to encode heartbeat");
                continue;
            }
        };

        debug!(current_instances = payload.current_instances, "Sending heartbeat");
        if outbound.send(frame).await.is_err() {
            debug!("Connection closed, stopping heartbeat loop");
            break;
        }
    }
}

/// Refreshes the metrics cache and rotates the node log until cancelled.
pub async fn run_metrics_loop(
    interval: Duration,
    disk_path: PathBuf,
    node_log_file: PathBuf,
    metrics: SharedMetrics,
    mut cancel: watch::Receiver<bool>,
) {
    debug!(interval_secs = interval.as_secs(), "Starting metrics loop");
    let mut sampler = Some(HostSampler::new());
    let mut ticker = tokio::time::interval(interval);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let Some(mut current) = sampler.take() else { break };
                let path = disk_path.clone();
                match tokio::task::spawn_blocking(move || {
                    let sample = current.sample(&path);
                    (current, sample)
                })
                .await
                {
                    Ok((returned, sample)) => {
                        sampler = Some(returned);
                        *metrics.write().await = sample;
                    }
                    Err(e) => {
                        warn!(error = %e, "Metrics sampling task failed");
                        sampler = Some(HostSampler::new());
                    }
                }

                match logs::rotate_if_needed(&node_log_file, MAX_NODE_LOG_BYTES, KEEP_LINES).await {
                    Ok(true) => info!(kept_lines = KEEP_LINES, "Node log rotated"),
                    Ok(false) => {}
                    Err(e) => error!(error = %e, "Failed to rotate node log"),
                }
            }
            changed = cancel.changed() => {
                if changed.is_err() || *cancel.borrow() {
                    debug!("Metrics loop stopped");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, RuntimeSettings};
    use crate::firewall::MemoryFirewall;
    use crate::state::SqliteSnapshotStore;
    use crate::template::LocalTemplate;

    #[tokio::test]
    async fn test_heartbeat_reflects_settings_and_template_version() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::for_base_dir(dir.path());
        std::fs::create_dir_all(&config.game_install_dir).unwrap();
        std::fs::write(config.game_install_dir.join("version.txt"), "1.4.2\n").unwrap();

        let settings = Arc::new(RwLock::new(RuntimeSettings::from_config(&config)));
        settings.write().await.is_draining = true;
        let manager = InstanceManager::new(
            config,
            Arc::clone(&settings),
            Arc::new(SqliteSnapshotStore::open_in_memory().unwrap()),
            Arc::new(MemoryFirewall::new()),
            Arc::new(LocalTemplate),
        );
        let metrics: SharedMetrics = Arc::new(RwLock::new(HostMetrics {
            cpu_usage: 12.5,
            mem_total: 1024,
            ..HostMetrics::default()
        }));

        let payload = build_heartbeat(&manager, &settings, &metrics).await;
        assert_eq!(payload.status, NodeReportedStatus::Online);
        assert_eq!(payload.current_instances, 0);
        assert_eq!(payload.max_instances, 10);
        assert_eq!(payload.game_version, "1.4.2");
        assert_eq!(payload.cpu_usage, 12.5);
        assert!(payload.is_draining);
    }

    #[tokio::test]
    async fn test_heartbeat_loop_stops_on_cancel() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::for_base_dir(dir.path());
        let settings = Arc::new(RwLock::new(RuntimeSettings::from_config(&config)));
        let manager = Arc::new(InstanceManager::new(
            config,
            Arc::clone(&settings),
            Arc::new(SqliteSnapshotStore::open_in_memory().unwrap()),
            Arc::new(MemoryFirewall::new()),
            Arc::new(LocalTemplate),
        ));
        let metrics: SharedMetrics = Arc::default();

        let (tx, mut rx) = mpsc::channel(4);
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let task = tokio::spawn(run_heartbeat_loop(
            Duration::from_millis(10),
            manager,
            settings,
            metrics,
            tx,
            cancel_rx,
        ));

        let frame = rx.recv().await.unwrap();
        let envelope = Envelope::from_json(&frame).unwrap();
        assert_eq!(envelope.verb(), Some(Verb::Heartbeat));

        cancel_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_metrics_loop_fills_cache() {
        let dir = tempfile::tempdir().unwrap();
        let metrics: SharedMetrics = Arc::default();
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let task = tokio::spawn(run_metrics_loop(
            Duration::from_millis(10),
            dir.path().to_path_buf(),
            dir.path().join("node.log"),
            Arc::clone(&metrics),
            cancel_rx,
        ));

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while metrics.read().await.mem_total == 0 {
            assert!(tokio::time::Instant::now() < deadline);
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        drop(cancel_tx);
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap();
    }
}
