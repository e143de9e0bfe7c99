//! Maps controller requests onto instance manager operations.

use std::path::PathBuf;
use std::sync::Arc;

use exile_proto::{
    BackupFileRequest, ConfigUpdate, Envelope, InstanceRequest, LogsResponse, MessageResponse,
    ProtoError, RenameRequest, ResponsePayload, TemplateUpdateResponse, Verb,
};
use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::SharedSettings;
use crate::error::NodeError;
use crate::instance::InstanceManager;
use crate::logs;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("{0} is not a node command")]
    NotACommand(Verb),

    #[error("invalid payload: {0}")]
    InvalidPayload(#[source] serde_json::Error),

    #[error(transparent)]
    Node(#[from] NodeError),

    #[error("{op} failed: {source}")]
    Io {
        op: &'static str,
        #[source]
        source: std::io::Error,
    },
}

impl From<ProtoError> for DispatchError {
    fn from(err: ProtoError) -> Self {
        match err {
            ProtoError::Malformed(source)
            | ProtoError::InvalidPayload { source, .. }
            | ProtoError::Encode { source, .. } => DispatchError::InvalidPayload(source),
        }
    }
}

type Outcome = Result<Option<Value>, DispatchError>;

pub struct Dispatcher {
    manager: Arc<InstanceManager>,
    settings: SharedSettings,
    node_log_file: PathBuf,
}

impl Dispatcher {
    pub fn new(manager: Arc<InstanceManager>, settings: SharedSettings, node_log_file: PathBuf) -> Self {
        Self {
            manager,
            settings,
            node_log_file,
        }
    }

    /// Runs one request frame.
    ///
    /// Returns the response to send back, or `None` when the frame carried
    /// no request id.
    pub async fn dispatch(&self, envelope: &Envelope) -> Option<ResponsePayload> {
        let Some(verb) = envelope.verb() else {
            debug!(verb = %envelope.kind, "Ignoring unknown verb");
            return None;
        };
        let outcome = self.execute(verb, envelope).await;
        let request_id = envelope.request_id.clone()?;
        Some(match outcome {
            Ok(data) => ResponsePayload::success(request_id, data),
            Err(e) => {
                warn!(verb = %envelope.kind, request_id = %request_id, error = %e, "Request failed");
                ResponsePayload::failure(request_id, e.to_string())
            }
        })
    }

    async fn execute(&self, verb: Verb, envelope: &Envelope) -> Outcome {
        let manager = &self.manager;

        match verb {
            Verb::Spawn => data(&manager.spawn().await?),
            Verb::StartInstance => {
                let req: InstanceRequest = envelope.payload_as()?;
                manager.start_instance(req.instance_id.as_str()).await?;
                Ok(None)
            }
            Verb::StopInstance => {
                let req: InstanceRequest = envelope.payload_as()?;
                manager.stop_instance(req.instance_id.as_str()).await?;
                Ok(None)
            }
            Verb::RestartInstance => {
                let req: InstanceRequest = envelope.payload_as()?;
                manager.restart_instance(req.instance_id.as_str()).await?;
                Ok(None)
            }
            Verb::RemoveInstance => {
                let req: InstanceRequest = envelope.payload_as()?;
                let outcome = manager.remove_instance(req.instance_id.as_str()).await?;
                Ok(outcome
                    .file_error
                    .map(|warning| json!({ "message": "instance removed", "warning": warning })))
            }
            Verb::RenameInstance => {
                let req: RenameRequest = envelope.payload_as()?;
                let view = manager
                    .rename_instance(req.instance_id.as_str(), req.new_id.as_str())
                    .await?;
                data(&MessageResponse {
                    message: "instance renamed".to_string(),
                    new_id: Some(view.id.to_string()),
                })
            }
            Verb::UpdateInstance => {
                let req: InstanceRequest = envelope.payload_as()?;
                manager.update_instance(req.instance_id.as_str()).await?;
                data(&MessageResponse::new("instance updated"))
            }
            Verb::UpdateTemplate => {
                let update = manager.update_template().await?;
                let message = if update.changed() {
                    "Template updated."
                } else {
                    "Template already up to date."
                };
                data(&TemplateUpdateResponse {
                    message: message.to_string(),
                    version: update.version,
                })
            }
            Verb::UpdateConfig => {
                let update: ConfigUpdate = envelope.payload_as()?;
                info!(
                    region = %update.region,
                    max_instances = update.max_instances,
                    is_draining = update.is_draining,
                    "Received config update"
                );
                self.settings.write().await.apply(&update);
                Ok(None)
            }
            Verb::ListInstances => data(&json!({ "instances": manager.list_instances().await })),
            Verb::GetInstanceStats => {
                let req: InstanceRequest = envelope.payload_as()?;
                data(&manager.get_instance_stats(req.instance_id.as_str()).await?)
            }
            Verb::GetInstanceHistory => {
                let req: InstanceRequest = envelope.payload_as()?;
                let history = manager.get_instance_history(req.instance_id.as_str()).await?;
                data(&json!({ "history": history }))
            }
            Verb::BackupInstance => {
                let req: InstanceRequest = envelope.payload_as()?;
                let backup = manager.backup_instance(req.instance_id.as_str()).await?;
                data(&json!({ "message": "backup created", "filename": backup.filename }))
            }
            Verb::RestoreInstance => {
                let req: BackupFileRequest = envelope.payload_as()?;
                manager
                    .restore_instance(req.instance_id.as_str(), &req.filename)
                    .await?;
                data(&MessageResponse::new("instance restored"))
            }
            Verb::ListBackups => {
                let req: InstanceRequest = envelope.payload_as()?;
                let backups = manager.list_backups(req.instance_id.as_str()).await?;
                data(&json!({ "backups": backups }))
            }
            Verb::DeleteBackup => {
                let req: BackupFileRequest = envelope.payload_as()?;
                manager
                    .delete_backup(req.instance_id.as_str(), &req.filename)
                    .await?;
                data(&MessageResponse::new("backup deleted"))
            }
            Verb::GetLogs => {
                let (logs, size) = logs::read_log(&self.node_log_file)
                    .await
                    .map_err(|source| DispatchError::Io {
                        op: "read_node_logs",
                        source,
                    })?;
                data(&LogsResponse { logs, size })
            }
            Verb::ClearLogs => {
                logs::clear_log(&self.node_log_file)
                    .await
                    .map_err(|source| DispatchError::Io {
                        op: "clear_node_logs",
                        source,
                    })?;
                data(&MessageResponse::new("logs cleared"))
            }
            Verb::GetInstanceLogs => {
                let req: InstanceRequest = envelope.payload_as()?;
                let logs = manager.read_instance_logs(req.instance_id.as_str()).await?;
                let size = logs.len() as u64;
                data(&LogsResponse { logs, size })
            }
            Verb::ClearInstanceLogs => {
                let req: InstanceRequest = envelope.payload_as()?;
                manager.clear_instance_logs(req.instance_id.as_str()).await?;
                data(&MessageResponse::new("logs cleared"))
            }
            Verb::Register | Verb::RegisterResponse | Verb::Heartbeat | Verb::Response => {
                Err(DispatchError::NotACommand(verb))
            }
        }
    }
}

fn data<T: Serialize>(value: &T) -> Outcome {
    serde_json::to_value(value)
        .map(Some)
        .map_err(DispatchError::InvalidPayload)
}
