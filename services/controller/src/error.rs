//! Controller error types.

use std::time::Duration;

use exile_id::NodeId;
use exile_proto::ProtoError;
use thiserror::Error;

/// Failures of a command sent through the hub.
///
/// None of these are retried by the hub; the caller decides.
#[derive(Debug, Error)]
pub enum HubError {
    #[error("node {0} is not online")]
    NodeUnavailable(NodeId),

    #[error("outbound queue for node {0} is full")]
    BackpressureExceeded(NodeId),

    #[error("node {node_id} did not answer {verb} within {timeout:?}")]
    Timeout {
        node_id: NodeId,
        verb: String,
        timeout: Duration,
    },

    #[error(transparent)]
    Encode(#[from] ProtoError),

    #[error("connection to node {0} was lost before it answered")]
    ConnectionLost(NodeId),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("node {0} not found")]
    NotFound(NodeId),

    #[error("node at {host}:{port} is not enrolled")]
    NotEnrolled { host: String, port: u16 },
}
