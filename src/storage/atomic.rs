//! Atomic file replacement
//!
//! Bytes are written to a hidden temporary file next to the target, flushed to
//! disk, and then renamed over the target. A reader of the target path sees
//! either the old content or the new content, never a partial write.

use crate::error::{Error, Result};
use log::{debug, warn};
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use uuid::Uuid;
use walkdir::WalkDir;

/// Suffix of temporary files created during an atomic write.
pub const TEMP_SUFFIX: &str = ".tmp";

/// Name of the temporary sibling used while writing `target`.
fn temp_path_for(target: &Path) -> PathBuf {
    let file_name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let token = Uuid::new_v4().simple().to_string();
    target.with_file_name(format!(".{}.{}{}", file_name, &token[..12], TEMP_SUFFIX))
}

/// Write `bytes` to `target` atomically.
pub fn write_atomic(target: &Path, bytes: &[u8]) -> Result<()> {
    write_atomic_with(target, bytes, |_| Ok(()))
}

/// [`write_atomic`] with a hook that runs after the temporary file is durable
/// and before it replaces the target.
///
/// If the hook fails the temporary file is left behind, exactly as a crash at
/// that point would leave it.
pub(crate) fn write_atomic_with<F>(target: &Path, bytes: &[u8], before_replace: F) -> Result<()>
where
    F: FnOnce(&Path) -> io::Result<()>,
{
    let temp = temp_path_for(target);
    let write_err = |source: io::Error| Error::FileWrite {
        path: target.to_path_buf(),
        source,
    };

    if let Err(e) = write_temp(&temp, bytes) {
        let _ = fs::remove_file(&temp);
        return Err(write_err(e));
    }

    before_replace(&temp).map_err(write_err)?;

    if let Err(e) = fs::rename(&temp, target) {
        let _ = fs::remove_file(&temp);
        return Err(write_err(e));
    }

    sync_parent(target);
    debug!("Wrote {} bytes to {}", bytes.len(), target.display());
    Ok(())
}

fn write_temp(temp: &Path, bytes: &[u8]) -> io::Result<()> {
    let mut file = OpenOptions::new().write(true).create_new(true).open(temp)?;
    file.write_all(bytes)?;
    file.sync_all()
}

/// Flush the directory entry for the rename where the platform allows it.
#[cfg(unix)]
fn sync_parent(target: &Path) {
    if let Some(parent) = target.parent() {
        match fs::File::open(parent).and_then(|dir| dir.sync_all()) {
            Ok(()) => {}
            Err(e) => debug!("Could not sync directory {}: {}", parent.display(), e),
        }
    }
}

#[cfg(not(unix))]
fn sync_parent(_target: &Path) {}

/// Whether `path` names a leftover temporary file from an interrupted write.
pub fn is_temp_file(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.starts_with('.') && n.ends_with(TEMP_SUFFIX))
        .unwrap_or(false)
}

/// Remove temporary files left behind by interrupted writes under `root`.
///
/// Returns the number of files removed.
pub fn sweep_temp_files(root: &Path) -> usize {
    let mut removed = 0;
    for entry in WalkDir::new(root).into_iter().filter_map(|e| e.ok()) {
        if !entry.file_type().is_file() || !is_temp_file(entry.path()) {
            continue;
        }
        match fs::remove_file(entry.path()) {
            Ok(()) => {
                debug!("Removed leftover temp file {}", entry.path().display());
                removed += 1;
            }
            Err(e) => warn!(
                "Failed to remove temp file {}: {}",
                entry.path().display(),
                e
            ),
        }
    }
    removed
}
