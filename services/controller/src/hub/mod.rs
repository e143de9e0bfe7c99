//! Connection hub: one live socket per online node, and request/response
//! correlation on top of it.
//!
//! Each node connection owns a bounded outbound queue drained by its writer
//! task. Commands are queued with `try_send`, so a stalled node surfaces as
//! [`HubError::BackpressureExceeded`] instead of blocking the caller.

mod pending;

pub use pending::{ConnectionId, Delivery, PendingGuard, PendingRequests};

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use exile_id::NodeId;
use exile_proto::{Envelope, HeartbeatPayload, RegisterRequest, ResponsePayload, Verb};
use serde::Serialize;
use tokio::sync::{mpsc, watch, RwLock};
use tracing::{debug, error, info, warn};

use crate::error::{HubError, RegistryError};
use crate::registry::{FleetRegistry, NodeStatus};

/// The hub's handle on one node socket.
pub struct Link {
    pub connection: ConnectionId,
    pub outbound: mpsc::Sender<String>,
    /// Set to `true` when a newer connection replaces this one.
    pub close: watch::Sender<bool>,
}

pub struct ConnectionHub {
    registry: Arc<dyn FleetRegistry>,
    links: RwLock<HashMap<NodeId, Link>>,
    pending: PendingRequests,
    next_connection: AtomicU64,
}

impl ConnectionHub {
    pub fn new(registry: Arc<dyn FleetRegistry>) -> Self {
        Self {
            registry,
            links: RwLock::new(HashMap::new()),
            pending: PendingRequests::new(),
            next_connection: AtomicU64::new(1),
        }
    }

    pub fn registry(&self) -> &Arc<dyn FleetRegistry> {
        &self.registry
    }

    pub fn next_connection_id(&self) -> ConnectionId {
        self.next_connection.fetch_add(1, Ordering::Relaxed)
    }

    /// Binds a connection to the enrolled node claiming `request.host:port`
    /// and marks it online. An existing connection for the same node is
    /// closed and replaced.
    pub async fn register(
        &self,
        request: &RegisterRequest,
        link: Link,
    ) -> Result<NodeId, RegistryError> {
        let mut links = self.links.write().await;

        let mut node = self
            .registry
            .lookup(&request.host, request.port)
            .await
            .ok_or_else(|| RegistryError::NotEnrolled {
                host: request.host.clone(),
                port: request.port,
            })?;
        node.apply_registration(request);
        let node_id = self.registry.register(node).await?;

        let connection = link.connection;
        if let Some(previous) = links.insert(node_id, link) {
            warn!(
                node_id = %node_id,
                previous_connection = previous.connection,
                connection,
                "Node registered again, closing previous connection"
            );
            let _ = previous.close.send(true);
            self.pending.fail_connection(previous.connection);
        }

        info!(
            node_id = %node_id,
            connection,
            region = %request.region,
            host = %request.host,
            port = request.port,
            max_instances = request.max_instances,
            "Node registered"
        );
        Ok(node_id)
    }

    /// Forgets `connection` and marks its node offline, unless the node has
    /// already moved to a newer connection.
    pub async fn unregister(&self, node_id: NodeId, connection: ConnectionId) {
        let mut links = self.links.write().await;
        let current = links.get(&node_id).map(|link| link.connection);
        if current == Some(connection) {
            links.remove(&node_id);
            if let Err(e) = self.registry.set_status(node_id, NodeStatus::Offline).await {
                error!(node_id = %node_id, error = %e, "Failed to mark node offline");
            }
            info!(node_id = %node_id, connection, "Node disconnected");
        } else {
            debug!(node_id = %node_id, connection, "Superseded connection closed");
        }
        drop(links);

        let failed = self.pending.fail_connection(connection);
        if failed > 0 {
            warn!(node_id = %node_id, failed, "Dropped in-flight requests of closed connection");
        }
    }

    pub async fn heartbeat(&self, node_id: NodeId, heartbeat: &HeartbeatPayload) {
        debug!(
            node_id = %node_id,
            current_instances = heartbeat.current_instances,
            status = ?heartbeat.status,
            "Heartbeat"
        );
        if let Err(e) = self.registry.update_heartbeat(node_id, heartbeat).await {
            warn!(node_id = %node_id, error = %e, "Failed to apply heartbeat");
        }
    }

    /// Routes a `RESPONSE` read from `from`'s connection to its caller.
    pub fn handle_response(&self, from: NodeId, response: ResponsePayload) -> Delivery {
        let request_id = response.request_id.clone();
        let delivery = self.pending.complete(from, response);
        match delivery {
            Delivery::Delivered => {}
            Delivery::Unknown => {
                debug!(node_id = %from, request_id = %request_id, "Dropping response with no waiting caller");
            }
            Delivery::Foreign { expected } => {
                warn!(
                    node_id = %from,
                    expected_node_id = %expected,
                    request_id = %request_id,
                    "Dropping response from a node the request was not sent to"
                );
            }
        }
        delivery
    }

    /// Sends `verb` to a node and waits up to `timeout` for its response.
    ///
    /// Fails without touching the network when the node is not online.
    pub async fn send_command_sync<P: Serialize>(
        &self,
        node_id: NodeId,
        verb: Verb,
        payload: &P,
        timeout: Duration,
    ) -> Result<ResponsePayload, HubError> {
        let (connection, outbound) = self.online_link(node_id).await?;

        let (guard, reply) = self.pending.insert(node_id, connection);
        let request_id = guard.request_id();
        let frame = Envelope::request(verb.as_str(), request_id.to_string(), payload)?.to_json()?;
        enqueue(&outbound, node_id, frame)?;
        if !verb.is_chatty() {
            debug!(node_id = %node_id, verb = %verb, request_id = %request_id, "Sent command");
        }

        match tokio::time::timeout(timeout, reply).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(HubError::ConnectionLost(node_id)),
            Err(_) => {
                warn!(
                    node_id = %node_id,
                    verb = %verb,
                    request_id = %request_id,
                    timeout_ms = timeout.as_millis() as u64,
                    "Command timed out"
                );
                Err(HubError::Timeout {
                    node_id,
                    verb: verb.to_string(),
                    timeout,
                })
            }
        }
    }

    /// Queues `verb` for a node without waiting for any reply.
    pub async fn send_command<P: Serialize>(
        &self,
        node_id: NodeId,
        verb: Verb,
        payload: &P,
    ) -> Result<(), HubError> {
        let (_, outbound) = self.online_link(node_id).await?;
        let frame = Envelope::notify(verb.as_str(), payload)?.to_json()?;
        enqueue(&outbound, node_id, frame)
    }

    /// Queues `verb` on every connected node, skipping nodes whose queue is
    /// full. Returns how many nodes it was queued for.
    pub async fn broadcast<P: Serialize>(&self, verb: Verb, payload: &P) -> Result<usize, HubError> {
        let frame = Envelope::notify(verb.as_str(), payload)?.to_json()?;
        let links = self.links.read().await;
        let mut queued = 0;
        for (node_id, link) in links.iter() {
            match link.outbound.try_send(frame.clone()) {
                Ok(()) => queued += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(node_id = %node_id, verb = %verb, "Outbound queue full, skipping broadcast");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    debug!(node_id = %node_id, verb = %verb, "Connection closing, skipping broadcast");
                }
            }
        }
        Ok(queued)
    }

    pub async fn is_connected(&self, node_id: NodeId) -> bool {
        self.links.read().await.contains_key(&node_id)
    }

    pub async fn connected_nodes(&self) -> Vec<NodeId> {
        let mut nodes: Vec<NodeId> = self.links.read().await.keys().copied().collect();
        nodes.sort();
        nodes
    }

    pub fn pending_requests(&self) -> usize {
        self.pending.len()
    }

    /// Asks every connection to close. Used on shutdown.
    pub async fn close_all(&self) {
        for link in self.links.read().await.values() {
            let _ = link.close.send(true);
        }
    }

    async fn online_link(
        &self,
        node_id: NodeId,
    ) -> Result<(ConnectionId, mpsc::Sender<String>), HubError> {
        let online = self
            .registry
            .get(node_id)
            .await
            .is_some_and(|node| node.status == NodeStatus::Online);
        if !online {
            return Err(HubError::NodeUnavailable(node_id));
        }
        self.links
            .read()
            .await
            .get(&node_id)
            .filter(|link| !link.outbound.is_closed())
            .map(|link| (link.connection, link.outbound.clone()))
            .ok_or(HubError::NodeUnavailable(node_id))
    }
}

fn enqueue(outbound: &mpsc::Sender<String>, node_id: NodeId, frame: String) -> Result<(), HubError> {
    outbound.try_send(frame).map_err(|e| match e {
        mpsc::error::TrySendError::Full(_) => HubError::BackpressureExceeded(node_id),
        mpsc::error::TrySendError::Closed(_) => HubError::NodeUnavailable(node_id),
    })
}
