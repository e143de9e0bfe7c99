//! Durable snapshot of the instance table.
//!
//! The manager writes the full table after every mutation and reads it back
//! at startup to restart instances that were running.

mod store;

pub use store::{InstanceRecord, SnapshotStore, SqliteSnapshotStore, StateStoreError};
