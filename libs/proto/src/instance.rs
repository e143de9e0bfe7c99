//! Data shapes describing instances as seen over the wire.

use chrono::{DateTime, Utc};
use exile_id::InstanceId;
use serde::{Deserialize, Serialize};

/// Samples retained per instance; one day at the default one-minute tick.
pub const HISTORY_CAPACITY: usize = 1440;

/// Lifecycle state of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InstanceStatus {
    Provisioning,
    Running,
    Stopped,
    Error,
}

impl InstanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceStatus::Provisioning => "Provisioning",
            InstanceStatus::Running => "Running",
            InstanceStatus::Stopped => "Stopped",
            InstanceStatus::Error => "Error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Provisioning" => Some(InstanceStatus::Provisioning),
            "Running" => Some(InstanceStatus::Running),
            "Stopped" => Some(InstanceStatus::Stopped),
            "Error" => Some(InstanceStatus::Error),
            _ => None,
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self, InstanceStatus::Running)
    }
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Public view of an instance record. History is served separately.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceView {
    pub id: InstanceId,
    pub port: u16,
    /// OS process id; `0` when no process is tracked.
    pub pid: u32,
    pub status: InstanceStatus,
    pub region: String,
    #[serde(default)]
    pub version: String,
    pub start_time: Option<DateTime<Utc>>,
    pub path: String,
    #[serde(default)]
    pub player_count: u32,
    #[serde(default)]
    pub max_players: u32,
}

/// Live resource usage for one instance.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InstanceStats {
    pub cpu_percent: f64,
    pub memory_usage: u64,
    pub disk_usage: u64,
    pub status: String,
    /// Seconds since the process started; `0` when not running.
    pub uptime: i64,
    pub player_count: u32,
    pub maximum_players: u32,
}

/// One sample of the bounded per-instance history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryPoint {
    pub timestamp: DateTime<Utc>,
    pub cpu: f64,
    pub memory_bytes: u64,
    pub memory_percent: f64,
    pub player_count: u32,
}

/// A backup archive stored in an instance's backups directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupEntry {
    pub filename: String,
    pub size: u64,
    pub date: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_status_serializes_pascal_case() {
        assert_eq!(
            serde_json::to_value(InstanceStatus::Provisioning).unwrap(),
            json!("Provisioning")
        );
        for status in [
            InstanceStatus::Provisioning,
            InstanceStatus::Running,
            InstanceStatus::Stopped,
            InstanceStatus::Error,
        ] {
            assert_eq!(InstanceStatus::parse(status.as_str()), Some(status));
        }
    }

    #[test]
    fn test_view_field_names() {
        let view = InstanceView {
            id: InstanceId::derive("eu", 7777).unwrap(),
            port: 7777,
            pid: 42,
            status: InstanceStatus::Running,
            region: "eu".into(),
            version: "1.2.0".into(),
            start_time: None,
            path: "/srv/instances/eu-7777".into(),
            player_count: 3,
            max_players: 16,
        };
        let value = serde_json::to_value(&view).unwrap();
        assert_eq!(value["id"], "eu-7777");
        assert_eq!(value["pid"], 42);
        assert_eq!(value["status"], "Running");
        assert_eq!(value["max_players"], 16);
    }
}
