//! End-to-end fleet loop.
//!
//! A real controller endpoint and a real node client talk over loopback:
//!
//! 1. The node connects and registers as the enrolled `10.0.0.5:8080`
//! 2. Two spawns land on ports 7777 and 7778
//! 3. A third spawn fails with port exhaustion
//! 4. Heartbeats reach the fleet registry
//! 5. Stopping the node takes it offline
//!
//! ## Running
//!
//! ```bash
//! cargo test -p exile-e2e --test fleet_loop
//! ```

#![cfg(unix)]

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use exile_controller::registry::{FleetRegistry, InMemoryRegistry, NodeStatus};
use exile_controller::{api, config::Config as ControllerConfig, AppState};
use exile_id::NodeId;
use exile_node_agent::config::{Config as NodeConfig, RuntimeSettings};
use exile_node_agent::firewall::MemoryFirewall;
use exile_node_agent::instance::InstanceManager;
use exile_node_agent::state::SqliteSnapshotStore;
use exile_node_agent::template::LocalTemplate;
use exile_node_agent::{ClientError, NodeClient};
use exile_proto::{InstanceRequest, InstanceStatus, InstanceView, Verb};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::{watch, RwLock};

const COMMAND_TIMEOUT: Duration = Duration::from_secs(10);

async fn start_controller(registry: Arc<InMemoryRegistry>) -> (AppState, String) {
    let state = AppState::new(ControllerConfig::default(), registry);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = api::create_router(state.clone());
    tokio::spawn(async move { axum::serve(listener, app).await });
    (state, format!("ws://{addr}{}", api::NODE_SOCKET_PATH))
}

fn install_game(dir: &Path) {
    std::fs::create_dir_all(dir).unwrap();
    std::fs::write(dir.join("gameserver"), "#!/bin/sh\nexec sleep 30\n").unwrap();
    std::fs::write(dir.join("version.txt"), "2.0.1\n").unwrap();
}

fn node(base: &Path, controller_url: &str, host: &str) -> (Arc<InstanceManager>, NodeClient) {
    let mut config = NodeConfig::for_base_dir(base);
    config.controller_url = controller_url.to_string();
    config.host = host.to_string();
    config.port = 8080;
    config.region = "eu".to_string();
    config.starting_port = 7777;
    config.max_instances = 2;
    config.heartbeat_interval = Duration::from_millis(100);
    config.reconnect_backoff = Duration::from_millis(100);
    config.stop_timeout = Duration::from_secs(5);
    install_game(&config.game_install_dir);

    let settings = Arc::new(RwLock::new(RuntimeSettings::from_config(&config)));
    let manager = Arc::new(InstanceManager::new(
        config.clone(),
        Arc::clone(&settings),
        Arc::new(SqliteSnapshotStore::open_in_memory().unwrap()),
        Arc::new(MemoryFirewall::new()),
        Arc::new(LocalTemplate),
    ));
    let client = NodeClient::new(config, Arc::clone(&manager), settings, Arc::default());
    (manager, client)
}

async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while !check().await {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

#[tokio::test]
async fn test_spawn_until_ports_exhausted() {
    let registry = Arc::new(InMemoryRegistry::new());
    let node_id: NodeId = registry.enroll("10.0.0.5", 8080).await;
    let (state, url) = start_controller(registry.clone()).await;
    let hub = Arc::clone(state.hub());

    let base = tempfile::tempdir().unwrap();
    let (manager, client) = node(base.path(), &url, "10.0.0.5");
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let client_handle = tokio::spawn(async move { client.run(shutdown_rx).await });

    eventually("node registration", || hub.is_connected(node_id)).await;
    assert_eq!(
        registry.get(node_id).await.unwrap().region,
        "eu".to_string()
    );

    let mut ports = Vec::new();
    for expected in ["eu-7777", "eu-7778"] {
        let response = hub
            .send_command_sync(node_id, Verb::Spawn, &json!({}), COMMAND_TIMEOUT)
            .await
            .unwrap();
        assert!(response.is_success(), "spawn failed: {:?}", response.error);
        let view: InstanceView = response.data_as().unwrap();
        assert_eq!(view.id.as_str(), expected);
        ports.push(view.port);
    }
    assert_eq!(ports, vec![7777, 7778]);

    let exhausted = hub
        .send_command_sync(node_id, Verb::Spawn, &json!({}), COMMAND_TIMEOUT)
        .await
        .unwrap();
    assert!(!exhausted.is_success());
    assert!(exhausted.error.unwrap().contains("no available ports"));

    eventually("heartbeat with two instances", || {
        let registry = registry.clone();
        async move {
            let node = registry.get(node_id).await.unwrap();
            node.current_instances == 2 && node.game_version == "2.0.1"
        }
    })
    .await;

    eventually("first instance running", || {
        let manager = Arc::clone(&manager);
        async move {
            manager
                .get_instance("eu-7777")
                .await
                .is_some_and(|view| view.status == InstanceStatus::Running)
        }
    })
    .await;
    let stop = InstanceRequest {
        instance_id: "eu-7777".parse().unwrap(),
    };
    let response = hub
        .send_command_sync(node_id, Verb::StopInstance, &stop, COMMAND_TIMEOUT)
        .await
        .unwrap();
    assert!(response.is_success(), "stop failed: {:?}", response.error);
    assert_eq!(
        manager.get_instance("eu-7777").await.unwrap().status,
        InstanceStatus::Stopped
    );

    shutdown_tx.send(true).unwrap();
    client_handle.await.unwrap().unwrap();
    manager.shutdown().await;

    eventually("node offline", || {
        let registry = registry.clone();
        async move { registry.get(node_id).await.unwrap().status == NodeStatus::Offline }
    })
    .await;
    assert_eq!(hub.pending_requests(), 0);
}

#[tokio::test]
async fn test_unenrolled_node_stops_retrying() {
    let registry = Arc::new(InMemoryRegistry::new());
    let (_, url) = start_controller(registry).await;

    let base = tempfile::tempdir().unwrap();
    let (_manager, client) = node(base.path(), &url, "10.0.0.99");
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);

    let result = tokio::time::timeout(Duration::from_secs(10), client.run(shutdown_rx))
        .await
        .expect("client kept retrying");
    assert!(matches!(result, Err(ClientError::NotEnrolled(_))));
}
