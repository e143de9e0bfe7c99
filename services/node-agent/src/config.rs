//! Configuration for the node agent.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use exile_proto::ConfigUpdate;
use tokio::sync::RwLock;

/// Node agent configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// WebSocket URL of the controller's node endpoint.
    pub controller_url: String,

    /// Key sent as `X-API-Key` when connecting.
    pub api_key: String,

    /// Region used to derive instance ids.
    pub region: String,

    /// Host the controller knows this node by.
    pub host: String,

    /// Node API port advertised at registration.
    pub port: u16,

    /// First port of the instance range.
    pub starting_port: u16,

    /// Size of the instance port range.
    pub max_instances: u32,

    /// Game binary, relative to an instance directory.
    pub game_binary_path: PathBuf,

    /// Template directory copied into every new instance.
    pub game_install_dir: PathBuf,

    /// Parent directory of all instance directories.
    pub instances_dir: PathBuf,

    /// SQLite snapshot of instance records.
    pub state_file: PathBuf,

    /// Optional tar.gz download refreshing the template.
    pub template_url: Option<String>,

    pub heartbeat_interval: Duration,
    pub stats_interval: Duration,
    pub reconnect_backoff: Duration,
    pub stop_timeout: Duration,

    /// Connection is dropped when nothing arrives within this window.
    pub read_deadline: Duration,

    /// Firewall backend for instance ports.
    pub firewall: FirewallKind,

    /// Node log file served by `get_logs`.
    pub node_log_file: PathBuf,

    /// Draining nodes keep running but accept no new placements.
    pub is_draining: bool,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let controller_url = env_or("EXILE_CONTROLLER_URL", "ws://127.0.0.1:8081/api/nodes/ws");
        let api_key = env_or("EXILE_API_KEY", "");
        let region = env_or("EXILE_REGION", "local");
        let host = env_or("EXILE_HOST", "127.0.0.1");
        let port = env_parse("EXILE_PORT", 8080u16)?;
        let starting_port = env_parse("EXILE_STARTING_PORT", 7777u16)?;
        let max_instances = env_parse("EXILE_MAX_INSTANCES", 10u32)?;

        let game_binary_path = PathBuf::from(env_or("EXILE_GAME_BINARY_PATH", "gameserver"));
        let game_install_dir = PathBuf::from(env_or("EXILE_GAME_INSTALL_DIR", "game"));
        let instances_dir = PathBuf::from(env_or("EXILE_INSTANCES_DIR", "instances"));
        let state_file = PathBuf::from(env_or("EXILE_STATE_FILE", "instances.db"));
        let template_url = std::env::var("EXILE_TEMPLATE_URL")
            .ok()
            .filter(|s| !s.is_empty());

        let heartbeat_interval = Duration::from_secs(env_parse("EXILE_HEARTBEAT_INTERVAL_SECS", 5)?);
        let stats_interval = Duration::from_secs(env_parse("EXILE_STATS_INTERVAL_SECS", 60)?);
        let reconnect_backoff = Duration::from_secs(env_parse("EXILE_RECONNECT_BACKOFF_SECS", 3)?);
        let stop_timeout = Duration::from_secs(env_parse("EXILE_STOP_TIMEOUT_SECS", 10)?);
        let read_deadline = Duration::from_secs(env_parse("EXILE_READ_DEADLINE_SECS", 60)?);
        let firewall = env_parse("EXILE_FIREWALL", FirewallKind::Ufw)?;

        let node_log_file = PathBuf::from(env_or("EXILE_NODE_LOG_FILE", "node.log"));
        let is_draining = env_parse("EXILE_IS_DRAINING", false)?;
        let log_level = env_or("EXILE_LOG_LEVEL", "info");

        let config = Self {
            controller_url,
            api_key,
            region,
            host,
            port,
            starting_port,
            max_instances,
            game_binary_path,
            game_install_dir,
            instances_dir,
            state_file,
            template_url,
            heartbeat_interval,
            stats_interval,
            reconnect_backoff,
            stop_timeout,
            read_deadline,
            firewall,
            node_log_file,
            is_draining,
            log_level,
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the manager cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.region.trim().is_empty() {
            bail!("EXILE_REGION must not be empty");
        }
        if self.max_instances == 0 {
            bail!("EXILE_MAX_INSTANCES must be greater than zero");
        }
        if self.starting_port == 0 {
            bail!("EXILE_STARTING_PORT must be greater than zero");
        }
        if self.game_binary_path.as_os_str().is_empty() {
            bail!("EXILE_GAME_BINARY_PATH must not be empty");
        }
        Ok(())
    }

    /// Configuration rooted in `base`, used by tests and local runs.
    pub fn for_base_dir(base: &std::path::Path) -> Self {
        Self {
            controller_url: "ws://127.0.0.1:8081/api/nodes/ws".to_string(),
            api_key: String::new(),
            region: "local".to_string(),
            host: "127.0.0.1".to_string(),
            port: 8080,
            starting_port: 7777,
            max_instances: 10,
            game_binary_path: PathBuf::from("gameserver"),
            game_install_dir: base.join("game"),
            instances_dir: base.join("instances"),
            state_file: base.join("instances.db"),
            template_url: None,
            heartbeat_interval: Duration::from_secs(5),
            stats_interval: Duration::from_secs(60),
            reconnect_backoff: Duration::from_secs(3),
            stop_timeout: Duration::from_secs(10),
            read_deadline: Duration::from_secs(60),
            firewall: FirewallKind::None,
            node_log_file: base.join("node.log"),
            is_draining: false,
            log_level: "info".to_string(),
        }
    }
}

/// Which firewall backend opens instance ports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FirewallKind {
    /// Shell out to `ufw`.
    Ufw,
    /// Track ports in memory only.
    None,
}

impl std::str::FromStr for FirewallKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ufw" => Ok(FirewallKind::Ufw),
            "none" | "memory" => Ok(FirewallKind::None),
            other => Err(format!("unknown firewall backend {other:?} (expected ufw or none)")),
        }
    }
}

/// Settings the controller may change at runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeSettings {
    pub region: String,
    pub max_instances: u32,
    pub is_draining: bool,
}

impl RuntimeSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            region: config.region.clone(),
            max_instances: config.max_instances,
            is_draining: config.is_draining,
        }
    }

    /// Applies an `update_config` message. Empty or zero fields are ignored.
    pub fn apply(&mut self, update: &ConfigUpdate) {
        if !update.region.is_empty() {
            self.region = update.region.clone();
        }
        if update.max_instances > 0 {
            self.max_instances = update.max_instances;
        }
        self.is_draining = update.is_draining;
    }
}

pub type SharedSettings = Arc<RwLock<RuntimeSettings>>;

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T>(key: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) if !raw.is_empty() => raw
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid {key}={raw:?}: {e}")),
        _ => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_rejects_empty_region() {
        let mut config = Config::for_base_dir(std::path::Path::new("/tmp"));
        config.region = " ".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_capacity() {
        let mut config = Config::for_base_dir(std::path::Path::new("/tmp"));
        config.max_instances = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_runtime_update_ignores_blank_fields() {
        let config = Config::for_base_dir(std::path::Path::new("/tmp"));
        let mut settings = RuntimeSettings::from_config(&config);
        settings.apply(&ConfigUpdate {
            region: String::new(),
            max_instances: 0,
            is_draining: true,
        });
        assert_eq!(settings.region, "local");
        assert_eq!(settings.max_instances, 10);
        assert!(settings.is_draining);

        settings.apply(&ConfigUpdate {
            region: "eu".into(),
            max_instances: 4,
            is_draining: false,
        });
        assert_eq!(settings.region, "eu");
        assert_eq!(settings.max_instances, 4);
    }

    #[test]
    fn test_firewall_kind_parses() {
        assert_eq!("UFW".parse::<FirewallKind>().unwrap(), FirewallKind::Ufw);
        assert_eq!("none".parse::<FirewallKind>().unwrap(), FirewallKind::None);
        assert!("iptables".parse::<FirewallKind>().is_err());
    }

    #[test]
    fn test_base_dir_defaults_are_valid() {
        let config = Config::for_base_dir(std::path::Path::new("/tmp"));
        assert!(config.validate().is_ok());
        assert_eq!(config.starting_port, 7777);
    }
}
