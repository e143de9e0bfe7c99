//! Gzip-compressed tar archives for instance backups and templates.

use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

/// Extension of backup archives.
pub const BACKUP_EXTENSION: &str = ".tar.gz";

/// `backup_<YYYY-mm-dd_HH-MM-SS>_v<version>.tar.gz`; spaces in the version become `_`.
pub fn backup_file_name(at: DateTime<Utc>, version: &str) -> String {
    let version = if version.is_empty() {
        "unknown".to_string()
    } else {
        version.replace(' ', "_")
    };
    format!(
        "backup_{}_v{}{}",
        at.format("%Y-%m-%d_%H-%M-%S"),
        version,
        BACKUP_EXTENSION
    )
}

/// Archives the contents of `src` into `dest`, skipping top-level entries
/// named in `excludes`.
pub fn create(src: &Path, dest: &Path, excludes: &[&str]) -> io::Result<()> {
    let file = File::create(dest)?;
    let encoder = GzEncoder::new(file, Compression::default());
    let mut builder = tar::Builder::new(encoder);
    builder.follow_symlinks(false);

    let mut entries = std::fs::read_dir(src)?.collect::<Result<Vec<_>, _>>()?;
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        let name = entry.file_name();
        if excludes.iter().any(|ex| name == *ex) {
            continue;
        }
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            builder.append_dir_all(&name, &path)?;
        } else {
            builder.append_path_with_name(&path, &name)?;
        }
    }

    builder.into_inner()?.finish()?.sync_all()
}

/// Unpacks `archive` into `dest`. Entries escaping `dest` are skipped by `tar`.
pub fn extract(archive: &Path, dest: &Path) -> io::Result<()> {
    unpack(File::open(archive)?, dest)
}

/// Unpacks a gzip tar stream into `dest`.
pub fn unpack(reader: impl Read, dest: &Path) -> io::Result<()> {
    std::fs::create_dir_all(dest)?;
    let mut archive = tar::Archive::new(GzDecoder::new(reader));
    archive.set_preserve_permissions(true);
    archive.unpack(dest)
}
