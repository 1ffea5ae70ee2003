//! Atomic file write utility.
//!
//! Received files are written with the write-to-temp-then-rename pattern so a
//! crash or power loss mid-write never leaves a truncated file at the
//! destination path.
//!
//! Invariants:
//! - Write goes to a `.part` sibling first, then a rename replaces the target.
//! - On rename failure the temp file is removed.
//! - Missing parent directories are created; failure to create them is an error.

use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};
use tracing::error;

/// Atomically write `content` to `path` via a temporary file and rename.
pub fn atomic_write(path: &Path, content: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| {
            error!(
                event = "atomic_mkdir_failure",
                path = %parent.display(),
                error = %e,
                "Failed to create parent directory"
            );
            e
        })?;
    }

    let tmp_path = part_path(path);

    std::fs::write(&tmp_path, content).map_err(|e| {
        error!(
            event = "atomic_write_failure",
            path = %tmp_path.display(),
            error = %e,
            "Failed to write temp file"
        );
        let _ = std::fs::remove_file(&tmp_path);
        e
    })?;

    std::fs::rename(&tmp_path, path).map_err(|e| {
        error!(
            event = "atomic_rename_failure",
            from = %tmp_path.display(),
            to = %path.display(),
            error = %e,
            "Failed to rename temp file"
        );
        let _ = std::fs::remove_file(&tmp_path);
        e
    })
}

/// `a/b/file.txt` -> `a/b/file.txt.part`
fn part_path(path: &Path) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(".part");
    PathBuf::from(name)
}
