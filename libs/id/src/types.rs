//! Generated identifiers for fleet resources.

use crate::define_id;

define_id!(NodeId, "node");
define_id!(RequestId, "req");
