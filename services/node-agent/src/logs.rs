//! Node and instance log files.

use std::io;
use std::path::Path;

use tracing::info;

/// Rotate once the node log grows past this size.
pub const MAX_NODE_LOG_BYTES: u64 = 5 * 1024 * 1024;

/// Lines kept after rotation.
pub const KEEP_LINES: usize = 20;

/// Reads a log file; a missing file reads as empty.
pub async fn read_log(path: &Path) -> io::Result<(String, u64)> {
    match tokio::fs::read(path).await {
        Ok(bytes) => {
            let size = bytes.len() as u64;
            Ok((String::from_utf8_lossy(&bytes).into_owned(), size))
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok((String::new(), 0)),
        Err(e) => Err(e),
    }
}

/// Truncates a log file in place.
pub async fn clear_log(path: &Path) -> io::Result<()> {
    let file = tokio::fs::OpenOptions::new().write(true).open(path).await?;
    file.set_len(0).await
}

/// Rewrites `path` keeping its last `keep` lines once it exceeds `max_bytes`.
///
/// Returns whether the file was rotated.
pub async fn rotate_if_needed(path: &Path, max_bytes: u64, keep: usize) -> io::Result<bool> {
    let size = match tokio::fs::metadata(path).await {
        Ok(meta) => meta.len(),
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e),
    };
    if size < max_bytes {
        return Ok(false);
    }

    let content = tokio::fs::read(path).await?;
    let content = String::from_utf8_lossy(&content);
    let lines: Vec<&str> = content.lines().collect();
    let tail = &lines[lines.len().saturating_sub(keep)..];
    let mut rewritten = tail.join("\n");
    rewritten.push('\n');

    // Writers hold the file with O_APPEND, so they continue at the new end.
    tokio::fs::write(path, rewritten).await?;

    info!(previous_size = size, kept_lines = tail.len(), "Rotated node log");
    Ok(true)
}
