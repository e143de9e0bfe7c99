//! Shared fixtures: a temp node layout with a shell script standing in for
//! the game binary.

#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use exile_node_agent::config::{Config, RuntimeSettings, SharedSettings};
use exile_node_agent::firewall::MemoryFirewall;
use exile_node_agent::instance::InstanceManager;
use exile_node_agent::state::{SnapshotStore, SqliteSnapshotStore};
use exile_node_agent::template::{LocalTemplate, TemplateSource};
use exile_proto::{InstanceStatus, InstanceView};
use tempfile::TempDir;
use tokio::sync::RwLock;

pub const GAME_VERSION: &str = "1.0.0";

pub struct Node {
    pub dir: TempDir,
    pub config: Config,
    pub settings: SharedSettings,
    pub firewall: Arc<MemoryFirewall>,
    pub manager: Arc<InstanceManager>,
}

impl Node {
    pub fn new(starting_port: u16, max_instances: u32) -> Self {
        Self::with_template(starting_port, max_instances, Arc::new(LocalTemplate))
    }

    pub fn with_template(
        starting_port: u16,
        max_instances: u32,
        template: Arc<dyn TemplateSource>,
    ) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SqliteSnapshotStore::open_in_memory().unwrap());
        Self::build(dir, starting_port, max_instances, template, store)
    }

    pub fn build(
        dir: TempDir,
        starting_port: u16,
        max_instances: u32,
        template: Arc<dyn TemplateSource>,
        store: Arc<dyn SnapshotStore>,
    ) -> Self {
        let mut config = Config::for_base_dir(dir.path());
        config.starting_port = starting_port;
        config.max_instances = max_instances;
        config.stop_timeout = Duration::from_secs(5);
        install_game(&config.game_install_dir);

        let settings = Arc::new(RwLock::new(RuntimeSettings::from_config(&config)));
        let firewall = Arc::new(MemoryFirewall::new());
        let manager = Arc::new(InstanceManager::new(
            config.clone(),
            Arc::clone(&settings),
            store,
            firewall.clone(),
            template,
        ));
        Self {
            dir,
            config,
            settings,
            firewall,
            manager,
        }
    }
}

/// Writes a template whose binary sleeps until killed.
pub fn install_game(dir: &Path) {
    if dir.join("gameserver").exists() {
        return;
    }
    std::fs::create_dir_all(dir.join("data")).unwrap();
    std::fs::write(dir.join("gameserver"), "#!/bin/sh\nexec sleep 30\n").unwrap();
    std::fs::write(dir.join("version.txt"), format!("{GAME_VERSION}\n")).unwrap();
    std::fs::write(dir.join("data/world.cfg"), "seed=42\n").unwrap();
}

/// Polls until the instance reaches `status`.
pub async fn wait_for_status(
    manager: &InstanceManager,
    id: &str,
    status: InstanceStatus,
) -> InstanceView {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        if let Some(view) = manager.get_instance(id).await {
            if view.status == status {
                return view;
            }
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "instance {id} never reached {status}"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
