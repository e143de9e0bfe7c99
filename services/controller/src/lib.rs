//! exile controller library.
//!
//! The controller keeps one WebSocket per online node and brokers commands
//! to them through the [`hub::ConnectionHub`]. The binary wires it to an
//! axum server; the library surface exists for integration testing and for
//! embedding the hub behind other front ends.

pub mod api;
pub mod config;
pub mod error;
pub mod hub;
pub mod registry;
pub mod state;

pub use error::{HubError, RegistryError};
pub use hub::{ConnectionHub, Delivery};
pub use registry::{FleetRegistry, InMemoryRegistry, Node, NodeStatus};
pub use state::AppState;
