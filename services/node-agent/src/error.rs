//! Errors returned by instance operations.
//!
//! Every variant names the failing operation and keeps the underlying cause
//! as its source, so callers can branch on [`NodeError::kind`] while logs
//! still carry the OS error.

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use exile_id::IdError;
use thiserror::Error;

use crate::state::StateStoreError;
use crate::template::TemplateError;

/// Coarse classification of a [`NodeError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidInstanceId,
    InstanceNotFound,
    InstanceBusyGlobal,
    InstanceNotRunning,
    InstanceAlreadyRunning,
    PortExhausted,
    ProcessStartFailure,
    FileOperationFailure,
    PermissionFailure,
    Persistence,
    Conflict,
    Timeout,
    InvalidRequest,
}

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("invalid instance id: {0}")]
    InvalidInstanceId(#[from] IdError),

    #[error("instance {0} not found")]
    InstanceNotFound(String),

    #[error("node is busy updating the game template")]
    InstanceBusyGlobal,

    #[error("instance {0} is not running")]
    InstanceNotRunning(String),

    #[error("instance {0} is already running")]
    InstanceAlreadyRunning(String),

    #[error("instance {id} must be stopped before {op}")]
    MustBeStopped { id: String, op: &'static str },

    #[error("no available ports in range {start}-{end} (max instances reached)")]
    PortExhausted { start: u16, end: u32 },

    #[error("{op}: failed to start game server: {source}")]
    ProcessStart {
        op: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("{op} failed for {}: {source}", path.display())]
    FileOperation {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("{op}: permission denied for {}: {source}", path.display())]
    Permission {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("template update failed: {0}")]
    Template(#[from] TemplateError),

    #[error("failed to persist instance state: {0}")]
    Persistence(#[from] StateStoreError),

    #[error("{0}")]
    Conflict(String),

    #[error("timed out after {after:?} waiting for {what}")]
    Timeout { what: String, after: Duration },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl NodeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            NodeError::InvalidInstanceId(_) => ErrorKind::InvalidInstanceId,
            NodeError::InstanceNotFound(_) => ErrorKind::InstanceNotFound,
            NodeError::InstanceBusyGlobal => ErrorKind::InstanceBusyGlobal,
            NodeError::InstanceNotRunning(_) => ErrorKind::InstanceNotRunning,
            NodeError::InstanceAlreadyRunning(_) | NodeError::MustBeStopped { .. } => {
                ErrorKind::InstanceAlreadyRunning
            }
            NodeError::PortExhausted { .. } => ErrorKind::PortExhausted,
            NodeError::ProcessStart { .. } => ErrorKind::ProcessStartFailure,
            NodeError::FileOperation { .. } | NodeError::Template(_) | NodeError::Join(_) => {
                ErrorKind::FileOperationFailure
            }
            NodeError::Permission { .. } => ErrorKind::PermissionFailure,
            NodeError::Persistence(_) => ErrorKind::Persistence,
            NodeError::Conflict(_) => ErrorKind::Conflict,
            NodeError::Timeout { .. } => ErrorKind::Timeout,
            NodeError::InvalidRequest(_) => ErrorKind::InvalidRequest,
        }
    }

    pub(crate) fn file(op: &'static str, path: impl Into<PathBuf>, source: io::Error) -> Self {
        NodeError::FileOperation {
            op,
            path: path.into(),
            source,
        }
    }
}

/// Outcome of a successful `remove_instance`.
///
/// The record is always gone; `file_error` reports a directory that could
/// not be deleted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoveOutcome {
    pub file_error: Option<String>,
}
