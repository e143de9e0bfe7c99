//! # exile-proto
//!
//! JSON wire protocol spoken over the persistent controller <-> node
//! connection.
//!
//! Every frame is an [`Envelope`]: a `type` discriminator, an optional
//! `request_id`, and an opaque JSON `payload`. Requests that expect a reply
//! carry a `request_id`; the node answers with a `RESPONSE` envelope whose
//! payload is a [`ResponsePayload`] echoing that id.
//!
//! ```text
//! Request:  { "type": "stop_instance", "request_id": "req_01H...", "payload": { "instance_id": "eu-7777" } }
//! Response: { "type": "RESPONSE", "payload": { "request_id": "req_01H...", "status": "success" } }
//! ```

mod envelope;
mod instance;
mod messages;
mod verb;

pub use envelope::{Envelope, ProtoError, ResponsePayload, ResponseStatus};
pub use instance::{
    BackupEntry, HistoryPoint, InstanceStats, InstanceStatus, InstanceView, HISTORY_CAPACITY,
};
pub use messages::{
    BackupFileRequest, ConfigUpdate, HeartbeatPayload, InstanceRequest, LogsResponse,
    MessageResponse, NodeReportedStatus, RegisterRequest, RegisterResponse, RenameRequest,
    TemplateUpdateResponse,
};
pub use verb::Verb;
