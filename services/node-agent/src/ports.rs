//! Instance port allocation.

use std::collections::HashSet;
use std::net::{Ipv4Addr, TcpListener};

use crate::error::NodeError;

/// Returns the first port in `[start, start + count)` that no instance
/// reserves and that `probe` reports bindable.
///
/// Stopped instances keep their port reserved, so `reserved` must hold the
/// port of every known instance regardless of status.
pub fn allocate(
    start: u16,
    count: u32,
    reserved: &HashSet<u16>,
    probe: impl Fn(u16) -> bool,
) -> Result<u16, NodeError> {
    let end = (u32::from(start) + count).min(u32::from(u16::MAX) + 1);

    for candidate in u32::from(start)..end {
        let Ok(port) = u16::try_from(candidate) else {
            break;
        };
        if reserved.contains(&port) {
            continue;
        }
        if probe(port) {
            return Ok(port);
        }
    }

    Err(NodeError::PortExhausted {
        start,
        end: end.saturating_sub(1),
    })
}

/// Bind-and-release probe on all interfaces.
pub fn os_probe(port: u16) -> bool {
    TcpListener::bind((Ipv4Addr::UNSPECIFIED, port)).is_ok()
}
