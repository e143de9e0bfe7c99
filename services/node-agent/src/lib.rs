//! exile node agent library.
//!
//! The node agent runs on each game host. It keeps one WebSocket connection
//! to the controller, registers itself, reports heartbeats, and executes
//! instance commands: provisioning game-server directories from a shared
//! template, launching and supervising the server processes, and managing
//! their backups and logs.
//!
//! ## Modules
//!
//! - `instance`: instance records and the manager that owns their lifecycle
//! - `client`: controller connection, registration and reconnect loop
//! - `dispatch`: maps controller verbs onto manager operations
//! - `heartbeat`: heartbeat frames and host metrics sampling
//! - `state`: SQLite snapshot of instance records

pub mod archive;
pub mod busy;
pub mod client;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod files;
pub mod firewall;
pub mod heartbeat;
pub mod instance;
pub mod logs;
pub mod ports;
pub mod probe;
pub mod process;
pub mod resources;
pub mod state;
pub mod template;

pub use client::{ClientError, ConnectionState, NodeClient};
pub use config::{Config, RuntimeSettings, SharedSettings};
pub use error::{ErrorKind, NodeError, RemoveOutcome};
pub use instance::{InstanceManager, TemplateUpdate};
