//! Request/response correlation through the hub, with the node side of the
//! socket played by the test.

use std::sync::Arc;
use std::time::Duration;

use exile_controller::hub::{ConnectionHub, Delivery, Link};
use exile_controller::registry::{FleetRegistry, InMemoryRegistry, NodeStatus};
use exile_controller::HubError;
use exile_id::NodeId;
use exile_proto::{
    Envelope, InstanceRequest, NodeReportedStatus, RegisterRequest, ResponsePayload, Verb,
};
use serde_json::json;
use tokio::sync::{mpsc, watch};

const TIMEOUT: Duration = Duration::from_secs(5);

/// Test double for the node end of one connection.
struct FakeNode {
    node_id: NodeId,
    connection: u64,
    frames: mpsc::Receiver<String>,
    closed: watch::Receiver<bool>,
}

impl FakeNode {
    async fn next_request(&mut self) -> Envelope {
        let frame = tokio::time::timeout(TIMEOUT, self.frames.recv())
            .await
            .expect("no frame queued")
            .expect("queue closed");
        Envelope::from_json(&frame).unwrap()
    }
}

async fn hub_with_node(host: &str) -> (Arc<ConnectionHub>, Arc<InMemoryRegistry>) {
    let registry = Arc::new(InMemoryRegistry::new());
    registry.enroll(host, 8080).await;
    (Arc::new(ConnectionHub::new(registry.clone())), registry)
}

async fn connect(hub: &ConnectionHub, host: &str, queue: usize) -> FakeNode {
    let connection = hub.next_connection_id();
    let (outbound, frames) = mpsc::channel(queue);
    let (close, closed) = watch::channel(false);
    let request = RegisterRequest {
        region: "eu".to_string(),
        host: host.to_string(),
        port: 8080,
        max_instances: 2,
        current_instances: 0,
        status: NodeReportedStatus::Online,
    };
    let node_id = hub
        .register(
            &request,
            Link {
                connection,
                outbound,
                close,
            },
        )
        .await
        .unwrap();
    FakeNode {
        node_id,
        connection,
        frames,
        closed,
    }
}

fn stop(id: &str) -> InstanceRequest {
    InstanceRequest {
        instance_id: id.parse().unwrap(),
    }
}

#[tokio::test]
async fn test_concurrent_calls_get_their_own_replies() {
    let (hub, _) = hub_with_node("10.0.0.5").await;
    let mut node = connect(&hub, "10.0.0.5", 16).await;
    let node_id = node.node_id;

    let mut calls = Vec::new();
    for port in [7777, 7778, 7779] {
        let hub = Arc::clone(&hub);
        calls.push(tokio::spawn(async move {
            let id = format!("eu-{port}");
            let response = hub
                .send_command_sync(node_id, Verb::StopInstance, &stop(&id), TIMEOUT)
                .await
                .unwrap();
            (id, response)
        }));
    }

    let mut requests = Vec::new();
    for _ in 0..3 {
        requests.push(node.next_request().await);
    }
    // Answer in reverse order, echoing the instance each request named.
    for request in requests.iter().rev() {
        let body: InstanceRequest = request.payload_as().unwrap();
        let response = ResponsePayload::success(
            request.request_id.clone().unwrap(),
            Some(json!({ "instance_id": body.instance_id })),
        );
        assert_eq!(hub.handle_response(node_id, response), Delivery::Delivered);
    }

    for call in calls {
        let (id, response) = call.await.unwrap();
        assert!(response.is_success());
        assert_eq!(response.data, Some(json!({ "instance_id": id })));
    }
    assert_eq!(hub.pending_requests(), 0);
}

#[tokio::test]
async fn test_late_reply_is_discarded() {
    let (hub, _) = hub_with_node("10.0.0.5").await;
    let mut node = connect(&hub, "10.0.0.5", 16).await;

    let err = hub
        .send_command_sync(
            node.node_id,
            Verb::ListInstances,
            &json!({}),
            Duration::from_millis(50),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, HubError::Timeout { .. }));
    assert_eq!(hub.pending_requests(), 0);

    let request = node.next_request().await;
    let late = ResponsePayload::success(request.request_id.unwrap(), None);
    assert_eq!(hub.handle_response(node.node_id, late), Delivery::Unknown);
}

#[tokio::test]
async fn test_full_queue_is_backpressure() {
    let (hub, _) = hub_with_node("10.0.0.5").await;
    let node = connect(&hub, "10.0.0.5", 1).await;

    hub.send_command(node.node_id, Verb::UpdateConfig, &json!({}))
        .await
        .unwrap();
    let err = hub
        .send_command_sync(node.node_id, Verb::Spawn, &json!({}), TIMEOUT)
        .await
        .unwrap_err();
    assert!(matches!(err, HubError::BackpressureExceeded(id) if id == node.node_id));
    assert_eq!(hub.pending_requests(), 0);
}

#[tokio::test]
async fn test_offline_or_unknown_node_is_unavailable() {
    let (hub, registry) = hub_with_node("10.0.0.5").await;

    let unknown = NodeId::new();
    let err = hub
        .send_command_sync(unknown, Verb::Spawn, &json!({}), TIMEOUT)
        .await
        .unwrap_err();
    assert!(matches!(err, HubError::NodeUnavailable(_)));

    let enrolled = registry.lookup("10.0.0.5", 8080).await.unwrap();
    let err = hub
        .send_command(enrolled.id, Verb::Spawn, &json!({}))
        .await
        .unwrap_err();
    assert!(matches!(err, HubError::NodeUnavailable(_)));

    let node = connect(&hub, "10.0.0.5", 4).await;
    assert_eq!(node.node_id, enrolled.id);
    hub.unregister(node.node_id, node.connection).await;

    assert_eq!(
        registry.get(node.node_id).await.unwrap().status,
        NodeStatus::Offline
    );
    let err = hub
        .send_command(node.node_id, Verb::Spawn, &json!({}))
        .await
        .unwrap_err();
    assert!(matches!(err, HubError::NodeUnavailable(_)));
}

#[tokio::test]
async fn test_disconnect_fails_in_flight_request() {
    let (hub, _) = hub_with_node("10.0.0.5").await;
    let mut node = connect(&hub, "10.0.0.5", 4).await;
    let node_id = node.node_id;

    let call = tokio::spawn({
        let hub = Arc::clone(&hub);
        async move {
            hub.send_command_sync(node_id, Verb::UpdateTemplate, &json!({}), TIMEOUT)
                .await
        }
    });
    node.next_request().await;
    hub.unregister(node_id, node.connection).await;

    let err = call.await.unwrap().unwrap_err();
    assert!(matches!(err, HubError::ConnectionLost(id) if id == node_id));
    assert_eq!(hub.pending_requests(), 0);
}

#[tokio::test]
async fn test_reregistration_replaces_connection() {
    let (hub, registry) = hub_with_node("10.0.0.5").await;
    let mut first = connect(&hub, "10.0.0.5", 4).await;
    let mut second = connect(&hub, "10.0.0.5", 4).await;
    assert_eq!(first.node_id, second.node_id);

    tokio::time::timeout(TIMEOUT, first.closed.changed())
        .await
        .unwrap()
        .unwrap();
    assert!(*first.closed.borrow());

    // The old socket closing afterwards must not take the node offline.
    hub.unregister(first.node_id, first.connection).await;
    assert_eq!(
        registry.get(second.node_id).await.unwrap().status,
        NodeStatus::Online
    );

    hub.send_command(second.node_id, Verb::ListInstances, &json!({}))
        .await
        .unwrap();
    assert_eq!(second.next_request().await.verb(), Some(Verb::ListInstances));
    assert!(first.frames.try_recv().is_err());
}

#[tokio::test]
async fn test_response_from_other_node_is_dropped() {
    let registry = Arc::new(InMemoryRegistry::new());
    registry.enroll("10.0.0.5", 8080).await;
    registry.enroll("10.0.0.6", 8080).await;
    let hub = Arc::new(ConnectionHub::new(registry.clone()));
    let mut target = connect(&hub, "10.0.0.5", 4).await;
    let other = connect(&hub, "10.0.0.6", 4).await;

    let call = tokio::spawn({
        let hub = Arc::clone(&hub);
        let node_id = target.node_id;
        async move {
            hub.send_command_sync(node_id, Verb::ListBackups, &stop("eu-7777"), TIMEOUT)
                .await
        }
    });
    let request = target.next_request().await;
    let request_id = request.request_id.unwrap();

    let spoofed = ResponsePayload::failure(request_id.clone(), "spoofed");
    assert_eq!(
        hub.handle_response(other.node_id, spoofed),
        Delivery::Foreign {
            expected: target.node_id
        }
    );

    let genuine = ResponsePayload::success(request_id, Some(json!({ "backups": [] })));
    assert_eq!(hub.handle_response(target.node_id, genuine), Delivery::Delivered);
    let response = call.await.unwrap().unwrap();
    assert!(response.is_success());
}

#[tokio::test]
async fn test_broadcast_skips_full_queues() {
    let registry = Arc::new(InMemoryRegistry::new());
    registry.enroll("10.0.0.5", 8080).await;
    registry.enroll("10.0.0.6", 8080).await;
    let hub = ConnectionHub::new(registry);
    let mut open = connect(&hub, "10.0.0.5", 4).await;
    let full = connect(&hub, "10.0.0.6", 1).await;
    hub.send_command(full.node_id, Verb::ListInstances, &json!({}))
        .await
        .unwrap();

    let queued = hub
        .broadcast(Verb::UpdateConfig, &json!({ "is_draining": true }))
        .await
        .unwrap();
    assert_eq!(queued, 1);

    let frame = open.next_request().await;
    assert_eq!(frame.verb(), Some(Verb::UpdateConfig));
    assert!(frame.request_id.is_none());
}
