//! # exile-id
//!
//! Identifier types shared by the controller and the node agent.
//!
//! ## ID Formats
//!
//! Generated identifiers use a prefixed ULID: `{prefix}_{ulid}`.
//!
//! - `node_01HV4Z2WQXKJNM8GPQY6VBKC3D` for fleet members
//! - `req_01HV4Z3MXNKPQR9HSTZ7WCLD4E` for RPC correlation ids
//!
//! ULIDs are millisecond-timestamped with 80 bits of randomness, so request
//! ids stay unique across concurrent callers without coordination.
//!
//! Instance ids are different: they are derived from the node's region and
//! the allocated port (`eu-west-7777`) and are used as directory names on the
//! node, so they are restricted to `[A-Za-z0-9_-]`.

mod error;
mod instance;
mod macros;
mod types;

pub use error::IdError;
pub use instance::InstanceId;
pub use types::*;

/// Re-export ulid for consumers that need raw ULID operations
pub use ulid::Ulid;
