//! Filesystem helpers for instance directories.
//!
//! These are blocking and run under `spawn_blocking`.

use std::fs;
use std::io;
use std::path::Path;

/// Version marker shipped with the game template.
pub const VERSION_FILE: &str = "version.txt";

/// Live game-server log inside an instance directory.
pub const GAME_LOG_FILE: &str = "gameserver.log";

/// Backups sub-directory inside an instance directory.
pub const BACKUPS_DIR: &str = "backups";

/// Recursively copies `src` into `dst`, overwriting existing files.
pub fn copy_dir(src: &Path, dst: &Path) -> io::Result<()> {
    fs::create_dir_all(dst)?;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        let target = dst.join(entry.file_name());
        if file_type.is_dir() {
            copy_dir(&entry.path(), &target)?;
        } else if file_type.is_symlink() {
            let link = fs::read_link(entry.path())?;
            let _ = fs::remove_file(&target);
            #[cfg(unix)]
            std::os::unix::fs::symlink(link, &target)?;
            #[cfg(not(unix))]
            fs::copy(entry.path(), &target).map(|_| ())?;
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

/// Total size of regular files under `path`.
pub fn dir_size(path: &Path) -> io::Result<u64> {
    let mut total = 0;
    for entry in fs::read_dir(path)? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            total += dir_size(&entry.path())?;
        } else if file_type.is_file() {
            total += entry.metadata()?.len();
        }
    }
    Ok(total)
}

/// Reads the trimmed `version.txt` in `dir`; empty when absent.
pub fn read_version(dir: &Path) -> String {
    fs::read_to_string(dir.join(VERSION_FILE))
        .map(|s| s.trim().to_string())
        .unwrap_or_default()
}

/// Removes every entry of `dir` except the one named `keep`.
pub fn wipe_except(dir: &Path, keep: &str) -> io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_name() == keep {
            continue;
        }
        if entry.file_type()?.is_dir() {
            fs::remove_dir_all(entry.path())?;
        } else {
            fs::remove_file(entry.path())?;
        }
    }
    Ok(())
}

/// True for a bare file name: no separators, not `.` or `..`.
pub fn is_plain_file_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains('/')
        && !name.contains('\\')
        && !name.contains('\0')
}
