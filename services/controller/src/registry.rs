//! Fleet registry: the controller's view of every enrolled node.
//!
//! The hub is the only writer of [`NodeStatus`]; it marks a node online when
//! its connection registers and offline when the connection goes away.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use exile_id::NodeId;
use exile_proto::{HeartbeatPayload, NodeReportedStatus, RegisterRequest};
use serde::Serialize;
use tokio::sync::RwLock;

use crate::error::RegistryError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum NodeStatus {
    Online,
    Offline,
}

/// Host resource usage from the latest heartbeat.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct NodeMetrics {
    pub cpu_usage: f64,
    pub mem_used: u64,
    pub mem_total: u64,
    pub disk_used: u64,
    pub disk_total: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Node {
    pub id: NodeId,
    pub region: String,
    pub host: String,
    pub port: u16,
    pub max_instances: u32,
    pub current_instances: u32,
    pub status: NodeStatus,
    /// What the node last said about itself; `Updating` during a template update.
    pub reported_status: Option<NodeReportedStatus>,
    pub last_seen: Option<DateTime<Utc>>,
    pub metrics: NodeMetrics,
    pub game_version: String,
    pub is_draining: bool,
}

impl Node {
    /// A freshly enrolled node that has never connected.
    pub fn enrolled(host: impl Into<String>, port: u16) -> Self {
        Self {
            id: NodeId::new(),
            region: String::new(),
            host: host.into(),
            port,
            max_instances: 0,
            current_instances: 0,
            status: NodeStatus::Offline,
            reported_status: None,
            last_seen: None,
            metrics: NodeMetrics::default(),
            game_version: String::new(),
            is_draining: false,
        }
    }

    /// Applies the metadata a node sends in `REGISTER`.
    pub fn apply_registration(&mut self, request: &RegisterRequest) {
        self.region = request.region.clone();
        self.max_instances = request.max_instances;
        self.current_instances = request.current_instances;
        self.reported_status = Some(request.status);
    }
}

/// Storage for fleet membership.
#[async_trait]
pub trait FleetRegistry: Send + Sync {
    /// Finds the enrolled node claiming `host:port`.
    async fn lookup(&self, host: &str, port: u16) -> Option<Node>;

    /// Stores `node`, marks it online and returns its id.
    async fn register(&self, node: Node) -> Result<NodeId, RegistryError>;

    async fn update_heartbeat(
        &self,
        id: NodeId,
        heartbeat: &HeartbeatPayload,
    ) -> Result<(), RegistryError>;

    async fn get(&self, id: NodeId) -> Option<Node>;

    async fn set_status(&self, id: NodeId, status: NodeStatus) -> Result<(), RegistryError>;

    async fn list(&self) -> Vec<Node>;
}

/// Registry kept in process memory.
#[derive(Default)]
pub struct InMemoryRegistry {
    nodes: RwLock<HashMap<NodeId, Node>>,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enrolls `host:port`, returning the existing id if already enrolled.
    pub async fn enroll(&self, host: &str, port: u16) -> NodeId {
        let mut nodes = self.nodes.write().await;
        if let Some(node) = nodes.values().find(|n| n.host == host && n.port == port) {
            return node.id;
        }
        let node = Node::enrolled(host, port);
        let id = node.id;
        nodes.insert(id, node);
        id
    }
}

#[async_trait]
impl FleetRegistry for InMemoryRegistry {
    async fn lookup(&self, host: &str, port: u16) -> Option<Node> {
        self.nodes
            .read()
            .await
            .values()
            .find(|n| n.host == host && n.port == port)
            .cloned()
    }

    async fn register(&self, mut node: Node) -> Result<NodeId, RegistryError> {
        let mut nodes = self.nodes.write().await;
        if !nodes.contains_key(&node.id) {
            return Err(RegistryError::NotEnrolled {
                host: node.host,
                port: node.port,
            });
        }
        node.status = NodeStatus::Online;
        node.last_seen = Some(Utc::now());
        let id = node.id;
        nodes.insert(id, node);
        Ok(id)
    }

    async fn update_heartbeat(
        &self,
        id: NodeId,
        heartbeat: &HeartbeatPayload,
    ) -> Result<(), RegistryError> {
        let mut nodes = self.nodes.write().await;
        let node = nodes.get_mut(&id).ok_or(RegistryError::NotFound(id))?;
        node.current_instances = heartbeat.current_instances;
        node.max_instances = heartbeat.max_instances;
        node.reported_status = Some(heartbeat.status);
        node.metrics = NodeMetrics {
            cpu_usage: heartbeat.cpu_usage,
            mem_used: heartbeat.mem_used,
            mem_total: heartbeat.mem_total,
            disk_used: heartbeat.disk_used,
            disk_total: heartbeat.disk_total,
        };
        node.game_version = heartbeat.game_version.clone();
        node.is_draining = heartbeat.is_draining;
        node.last_seen = Some(Utc::now());
        Ok(())
    }

    async fn get(&self, id: NodeId) -> Option<Node> {
        self.nodes.read().await.get(&id).cloned()
    }

    async fn set_status(&self, id: NodeId, status: NodeStatus) -> Result<(), RegistryError> {
        let mut nodes = self.nodes.write().await;
        let node = nodes.get_mut(&id).ok_or(RegistryError::NotFound(id))?;
        node.status = status;
        node.last_seen = Some(Utc::now());
        Ok(())
    }

    async fn list(&self) -> Vec<Node> {
        let mut nodes: Vec<Node> = self.nodes.read().await.values().cloned().collect();
        nodes.sort_by(|a, b| (&a.host, a.port).cmp(&(&b.host, b.port)));
        nodes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn heartbeat() -> HeartbeatPayload {
        HeartbeatPayload {
            current_instances: 2,
            max_instances: 4,
            status: NodeReportedStatus::Updating,
            cpu_usage: 37.5,
            mem_used: 512,
            mem_total: 2048,
            disk_used: 10,
            disk_total: 100,
            game_version: "1.2.0".to_string(),
            is_draining: true,
        }
    }

    #[tokio::test]
    async fn test_enroll_is_idempotent_per_address() {
        let registry = InMemoryRegistry::new();
        let a = registry.enroll("10.0.0.5", 8080).await;
        let b = registry.enroll("10.0.0.5", 8080).await;
        let c = registry.enroll("10.0.0.5", 8081).await;
        assert_eq!(a, b);
        assert_ne!(a, c);

        let node = registry.lookup("10.0.0.5", 8080).await.unwrap();
        assert_eq!(node.id, a);
        assert_eq!(node.status, NodeStatus::Offline);
        assert!(registry.lookup("10.0.0.6", 8080).await.is_none());
    }

    #[tokio::test]
    async fn test_register_requires_enrollment() {
        let registry = InMemoryRegistry::new();
        let err = registry
            .register(Node::enrolled("10.0.0.9", 1))
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::NotEnrolled { port: 1, .. }));

        registry.enroll("10.0.0.5", 8080).await;
        let node = registry.lookup("10.0.0.5", 8080).await.unwrap();
        let id = registry.register(node).await.unwrap();
        let node = registry.get(id).await.unwrap();
        assert_eq!(node.status, NodeStatus::Online);
        assert!(node.last_seen.is_some());
    }

    #[tokio::test]
    async fn test_heartbeat_updates_metrics() {
        let registry = InMemoryRegistry::new();
        let id = registry.enroll("10.0.0.5", 8080).await;
        registry.update_heartbeat(id, &heartbeat()).await.unwrap();

        let node = registry.get(id).await.unwrap();
        assert_eq!(node.current_instances, 2);
        assert_eq!(node.reported_status, Some(NodeReportedStatus::Updating));
        assert_eq!(node.metrics.cpu_usage, 37.5);
        assert_eq!(node.game_version, "1.2.0");
        assert!(node.is_draining);

        let unknown = NodeId::new();
        assert_eq!(
            registry.update_heartbeat(unknown, &heartbeat()).await,
            Err(RegistryError::NotFound(unknown))
        );
    }
}
