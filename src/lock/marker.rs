//! Lock marker files
//!
//! A marker is a small JSON file next to the document (`.<file>.lock`). It is
//! created with a single atomic create-if-absent step: the content is written
//! to a private temporary file first and then hard-linked to the marker name,
//! which fails if the marker already exists. Readers never see a half-written
//! marker.
//!
//! Filesystems without hard links fall back to `create_new`, which creates the
//! file before its content lands. An unparseable marker younger than
//! [`INCOMPLETE_GRACE`] is therefore reported as [`MarkerRead::Incomplete`]
//! and treated as held, not stale.

use chrono::{DateTime, Utc};
use log::debug;
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use uuid::Uuid;

/// Suffix of lock marker files.
pub const MARKER_SUFFIX: &str = ".lock";

/// Suffix of the private file a marker is written to before it is linked.
const STAGING_SUFFIX: &str = "new";

/// Suffix of a marker moved aside while a stale lock is reclaimed.
const ASIDE_SUFFIX: &str = "stale";

/// How long an unparseable marker is assumed to still be in the middle of
/// being written.
pub const INCOMPLETE_GRACE: Duration = Duration::from_secs(5);

/// Contents of a lock marker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockMarker {
    pub owner_pid: u32,
    #[serde(default)]
    pub owner_start_time: Option<u64>,
    pub session_token: String,
    pub acquired_at: DateTime<Utc>,
    pub host: String,
}

/// Marker path for a document: `dir/.<file name>.lock`.
pub fn marker_path_for(document: &Path) -> PathBuf {
    let file_name = document
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    document.with_file_name(format!(".{}{}", file_name, MARKER_SUFFIX))
}

/// The document a marker belongs to, if `marker` is a marker path.
pub fn document_for_marker(marker: &Path) -> Option<PathBuf> {
    let name = marker.file_name()?.to_str()?;
    let document = name.strip_prefix('.')?.strip_suffix(MARKER_SUFFIX)?;
    if document.is_empty() {
        return None;
    }
    Some(marker.with_file_name(document))
}

/// Outcome of reading a marker from disk.
#[derive(Debug)]
pub enum MarkerRead {
    Present(LockMarker),
    Missing,
    /// A fresh marker that does not parse yet; its writer may still be
    /// filling it in. Carries the file's modification time.
    Incomplete(DateTime<Utc>),
    /// The file exists, does not parse and is older than [`INCOMPLETE_GRACE`].
    Unreadable(String),
}

pub fn read_marker(path: &Path) -> io::Result<MarkerRead> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(MarkerRead::Missing),
        Err(e) => return Err(e),
    };
    Ok(match serde_json::from_slice(&bytes) {
        Ok(marker) => MarkerRead::Present(marker),
        Err(e) => match fresh_since(path) {
            Some(modified) => MarkerRead::Incomplete(modified),
            None => MarkerRead::Unreadable(e.to_string()),
        },
    })
}

/// Modification time of `path` if it lies within [`INCOMPLETE_GRACE`].
///
/// A timestamp in the future (clock skew) counts as fresh.
fn fresh_since(path: &Path) -> Option<DateTime<Utc>> {
    let modified = fs::metadata(path).and_then(|m| m.modified()).ok()?;
    let fresh = match SystemTime::now().duration_since(modified) {
        Ok(age) => age < INCOMPLETE_GRACE,
        Err(_) => true,
    };
    fresh.then(|| DateTime::<Utc>::from(modified))
}

/// Whether `name` is a staging or aside file left next to a marker.
pub fn is_leftover_name(name: &str) -> bool {
    if !name.starts_with('.') {
        return false;
    }
    [STAGING_SUFFIX, ASIDE_SUFFIX].iter().any(|suffix| {
        name.strip_suffix(suffix)
            .and_then(|rest| rest.strip_suffix('.'))
            .and_then(|rest| rest.rsplit_once('.'))
            .map(|(head, token)| {
                head.ends_with(MARKER_SUFFIX)
                    && token.len() == 12
                    && token.chars().all(|c| c.is_ascii_hexdigit())
            })
            .unwrap_or(false)
    })
}

/// Create `path` holding `marker`, failing with `AlreadyExists` if it exists.
pub fn create_marker(path: &Path, marker: &LockMarker) -> io::Result<()> {
    let bytes = serde_json::to_vec(marker).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let staging = staging_path(path);

    {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&staging)?;
        file.write_all(&bytes)?;
        file.sync_all()?;
    }

    let linked = fs::hard_link(&staging, path);
    let _ = fs::remove_file(&staging);
    match linked {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Err(e),
        Err(e) => {
            // Filesystems without hard links: create_new is still atomic.
            debug!(
                "Hard link unavailable for {} ({}), using create_new",
                path.display(),
                e
            );
            let mut file = OpenOptions::new().write(true).create_new(true).open(path)?;
            file.write_all(&bytes)?;
            file.sync_all()
        }
    }
}

fn sibling_with_suffix(marker: &Path, suffix: &str) -> PathBuf {
    let name = marker
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let token = Uuid::new_v4().simple().to_string();
    marker.with_file_name(format!("{}.{}.{}", name, &token[..12], suffix))
}

fn staging_path(marker: &Path) -> PathBuf {
    sibling_with_suffix(marker, STAGING_SUFFIX)
}

/// Unique path a marker is moved to while a stale lock is being reclaimed.
pub fn aside_path(marker: &Path) -> PathBuf {
    sibling_with_suffix(marker, ASIDE_SUFFIX)
}
