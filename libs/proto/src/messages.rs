//! Typed payloads for each verb.

use exile_id::InstanceId;
use serde::{Deserialize, Serialize};

/// Status a node reports about itself in heartbeats and registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeReportedStatus {
    Online,
    /// A template update is in progress.
    Updating,
}

/// `REGISTER`: sent by the node immediately after connecting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub region: String,
    pub host: String,
    pub port: u16,
    pub max_instances: u32,
    pub current_instances: u32,
    pub status: NodeReportedStatus,
}

/// `REGISTER_RESPONSE`: the controller's verdict on a registration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterResponse {
    pub status: crate::ResponseStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<exile_id::NodeId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RegisterResponse {
    /// Error text used when the claimed host:port is not in the registry.
    pub const NOT_ENROLLED: &'static str = "node not enrolled";

    pub fn accepted(id: exile_id::NodeId) -> Self {
        Self {
            status: crate::ResponseStatus::Success,
            id: Some(id),
            error: None,
        }
    }

    pub fn rejected(error: impl Into<String>) -> Self {
        Self {
            status: crate::ResponseStatus::Error,
            id: None,
            error: Some(error.into()),
        }
    }

    /// True when retrying would never succeed without operator action.
    pub fn is_not_enrolled(&self) -> bool {
        self.error
            .as_deref()
            .is_some_and(|e| e.contains("not enrolled"))
    }
}

/// `HEARTBEAT`: periodic status and host metrics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatPayload {
    pub current_instances: u32,
    pub max_instances: u32,
    pub status: NodeReportedStatus,
    pub cpu_usage: f64,
    pub mem_used: u64,
    pub mem_total: u64,
    pub disk_used: u64,
    pub disk_total: u64,
    #[serde(default)]
    pub game_version: String,
    #[serde(default)]
    pub is_draining: bool,
}

/// Payload of every verb that targets a single instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceRequest {
    pub instance_id: InstanceId,
}

/// `rename_instance`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenameRequest {
    pub instance_id: InstanceId,
    pub new_id: InstanceId,
}

/// `restore_instance` and `delete_backup`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupFileRequest {
    pub instance_id: InstanceId,
    pub filename: String,
}

/// `update_config`: fire-and-forget runtime settings.
///
/// An empty region or a zero `max_instances` leaves the current value alone.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigUpdate {
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub max_instances: u32,
    #[serde(default)]
    pub is_draining: bool,
}

/// Generic `{ "message": ... }` success body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageResponse {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_id: Option<String>,
}

impl MessageResponse {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            new_id: None,
        }
    }
}

/// `update_template` success body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateUpdateResponse {
    pub message: String,
    pub version: String,
}

/// `get_logs` / `get_instance_logs` success body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogsResponse {
    pub logs: String,
    #[serde(default)]
    pub size: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_instance_request_rejects_traversal() {
        let result: Result<InstanceRequest, _> =
            serde_json::from_value(json!({"instance_id": "../etc"}));
        assert!(result.is_err());
    }

    #[test]
    fn test_heartbeat_field_names() {
        let hb = HeartbeatPayload {
            current_instances: 1,
            max_instances: 4,
            status: NodeReportedStatus::Updating,
            cpu_usage: 12.5,
            mem_used: 1,
            mem_total: 2,
            disk_used: 3,
            disk_total: 4,
            game_version: "1.0".into(),
            is_draining: false,
        };
        let value = serde_json::to_value(&hb).unwrap();
        assert_eq!(value["status"], "Updating");
        assert_eq!(value["current_instances"], 1);
        assert_eq!(value["game_version"], "1.0");
    }

    #[test]
    fn test_register_rejection_detects_enrollment() {
        let resp = RegisterResponse::rejected(RegisterResponse::NOT_ENROLLED);
        assert!(resp.is_not_enrolled());
        assert!(!RegisterResponse::rejected("busy").is_not_enrolled());
    }

    #[test]
    fn test_config_update_defaults() {
        let update: ConfigUpdate = serde_json::from_value(json!({"is_draining": true})).unwrap();
        assert_eq!(update.region, "");
        assert_eq!(update.max_instances, 0);
        assert!(update.is_draining);
    }
}
