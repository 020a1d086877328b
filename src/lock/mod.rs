//! Process lock manager
//!
//! Guarantees that at most one live process writes a given document file.
//! This is independent from the user-facing `locked` flag on a document.
//!
//! A lock is a marker file next to the document (see [`marker`]). Markers left
//! behind by crashed processes are recognised through a liveness heuristic and
//! reclaimed:
//!
//! - a marker from another host is always treated as live
//! - our own pid with a foreign session token means an earlier process that
//!   had the same pid, so the marker is stale
//! - a pid that no longer exists is stale
//! - a pid whose start time differs from the recorded one was reused, stale
//!
//! A marker that does not parse is held while it is younger than
//! [`marker::INCOMPLETE_GRACE`] and stale after that.

pub mod marker;
mod probe;

pub use probe::{ProcessProbe, SystemProbe};

use crate::error::{Error, Result};
use crate::storage::atomic::sweep_temp_files;
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use marker::{
    aside_path, create_marker, document_for_marker, marker_path_for, read_marker, LockMarker,
    is_leftover_name, MarkerRead, MARKER_SUFFIX,
};
use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::thread;
use std::time::Duration;
use uuid::Uuid;
use walkdir::WalkDir;

/// Attempts at creating a marker before giving up on a contended path.
const MAX_ACQUIRE_ATTEMPTS: usize = 3;

/// Pause before looking again at a marker that is still being written.
const INCOMPLETE_RETRY_DELAY: Duration = Duration::from_millis(50);

/// Random token identifying this process in markers it writes.
fn process_token() -> &'static str {
    static TOKEN: OnceLock<String> = OnceLock::new();
    TOKEN.get_or_init(|| Uuid::new_v4().simple().to_string())
}

fn lock_set(set: &Mutex<HashSet<PathBuf>>) -> MutexGuard<'_, HashSet<PathBuf>> {
    set.lock().unwrap_or_else(PoisonError::into_inner)
}

// ─────────────────────────────────────────────────────────────────────────────
// Public Types
// ─────────────────────────────────────────────────────────────────────────────

/// Who holds a lock, as reported to the shell.
///
/// `pid` is 0 and `host` empty when the owner has not finished writing its
/// marker yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockOwner {
    pub pid: u32,
    pub host: String,
    pub acquired_at: DateTime<Utc>,
}

impl LockOwner {
    fn unknown(since: DateTime<Utc>) -> Self {
        Self {
            pid: 0,
            host: String::new(),
            acquired_at: since,
        }
    }

    pub fn is_known(&self) -> bool {
        self.pid != 0
    }
}

impl fmt::Display for LockOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_known() {
            write!(f, "process {} on {}", self.pid, self.host)
        } else {
            write!(f, "another process")
        }
    }
}

impl From<&LockMarker> for LockOwner {
    fn from(marker: &LockMarker) -> Self {
        Self {
            pid: marker.owner_pid,
            host: marker.host.clone(),
            acquired_at: marker.acquired_at,
        }
    }
}

/// Process lock state of one document path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockStatus {
    Unlocked,
    HeldByUs,
    HeldByOther(LockOwner),
    /// A marker exists but its owner is gone. `None` when the marker is unreadable.
    Stale(Option<LockOwner>),
}

/// Result of a startup sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub stale_markers_removed: usize,
    pub temp_files_removed: usize,
    /// Staging and aside files left next to markers by interrupted lock operations.
    pub marker_leftovers_removed: usize,
}

enum Liveness {
    Ours,
    Live,
    Stale(&'static str),
}

// ─────────────────────────────────────────────────────────────────────────────
// Lock Handle
// ─────────────────────────────────────────────────────────────────────────────

/// Proof of holding a document's process lock. Released on drop.
#[derive(Debug, Clone)]
pub struct LockHandle {
    inner: Arc<HandleInner>,
}

#[derive(Debug)]
struct HandleInner {
    document: PathBuf,
    marker_path: PathBuf,
    marker: LockMarker,
    released: AtomicBool,
    held: Arc<Mutex<HashSet<PathBuf>>>,
}

impl LockHandle {
    pub fn document(&self) -> &Path {
        &self.inner.document
    }

    pub fn is_released(&self) -> bool {
        self.inner.released.load(Ordering::SeqCst)
    }

    /// Confirm the marker on disk still belongs to us before writing.
    ///
    /// A marker that vanished is recreated; one taken over by another
    /// process is a conflict.
    pub fn verify(&self) -> Result<()> {
        let inner = &self.inner;
        if self.is_released() {
            return Err(Error::Application(format!(
                "lock for '{}' was already released",
                inner.document.display()
            )));
        }
        for _ in 0..MAX_ACQUIRE_ATTEMPTS {
            match read_marker(&inner.marker_path)? {
                MarkerRead::Present(m) if m.session_token == inner.marker.session_token => {
                    return Ok(())
                }
                MarkerRead::Present(m) => {
                    return Err(Error::ProcessLockConflict {
                        path: inner.document.clone(),
                        owner: LockOwner::from(&m),
                    })
                }
                MarkerRead::Incomplete(since) => {
                    return Err(Error::ProcessLockConflict {
                        path: inner.document.clone(),
                        owner: LockOwner::unknown(since),
                    })
                }
                MarkerRead::Unreadable(msg) => {
                    return Err(Error::Application(format!(
                        "lock marker for '{}' is unreadable: {}",
                        inner.document.display(),
                        msg
                    )))
                }
                MarkerRead::Missing => {
                    warn!(
                        "Lock marker for '{}' vanished, recreating it",
                        inner.document.display()
                    );
                    match create_marker(&inner.marker_path, &inner.marker) {
                        Ok(()) => return Ok(()),
                        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
                        Err(e) => {
                            return Err(Error::FileWrite {
                                path: inner.marker_path.clone(),
                                source: e,
                            })
                        }
                    }
                }
            }
        }
        Err(Error::Application(format!(
            "could not confirm lock for '{}'",
            inner.document.display()
        )))
    }

    /// Release now instead of waiting for the last clone to drop.
    pub fn release(&self) -> Result<()> {
        self.inner.release()
    }

    /// Release after the document (or its folder) was moved to `new_document`
    /// while locked. The marker travelled with it and is removed there.
    pub fn release_relocated(&self, new_document: &Path) -> Result<()> {
        self.inner.release_at(&marker_path_for(new_document))
    }
}

impl HandleInner {
    fn release(&self) -> Result<()> {
        self.release_at(&self.marker_path)
    }

    fn release_at(&self, marker_path: &Path) -> Result<()> {
        if self.released.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        lock_set(&self.held).remove(&self.document);

        match read_marker(marker_path)? {
            MarkerRead::Present(m) if m.session_token == self.marker.session_token => {
                match fs::remove_file(marker_path) {
                    Ok(()) => {}
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
                debug!("Released lock for '{}'", self.document.display());
            }
            MarkerRead::Present(m) => warn!(
                "Lock for '{}' is now held by process {}, leaving its marker",
                self.document.display(),
                m.owner_pid
            ),
            MarkerRead::Incomplete(_) | MarkerRead::Unreadable(_) => warn!(
                "Lock marker for '{}' is unreadable, leaving it",
                self.document.display()
            ),
            MarkerRead::Missing => {}
        }
        Ok(())
    }
}

impl Drop for HandleInner {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            warn!(
                "Failed to release lock for '{}': {}",
                self.document.display(),
                e
            );
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Lock Manager
// ─────────────────────────────────────────────────────────────────────────────

/// Acquires, releases and inspects document process locks.
#[derive(Debug, Clone)]
pub struct LockManager {
    probe: Arc<dyn ProcessProbe>,
    token: String,
    host: String,
    held: Arc<Mutex<HashSet<PathBuf>>>,
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new()
    }
}

impl LockManager {
    pub fn new() -> Self {
        Self::with_probe(Arc::new(SystemProbe))
    }

    pub fn with_probe(probe: Arc<dyn ProcessProbe>) -> Self {
        let host = probe.host();
        Self {
            probe,
            token: process_token().to_string(),
            host,
            held: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    fn new_marker(&self) -> LockMarker {
        let pid = self.probe.current_pid();
        LockMarker {
            owner_pid: pid,
            owner_start_time: self.probe.start_time(pid),
            session_token: self.token.clone(),
            acquired_at: Utc::now(),
            host: self.host.clone(),
        }
    }

    fn classify(&self, marker: &LockMarker) -> Liveness {
        if marker.host != self.host {
            return Liveness::Live;
        }
        if marker.owner_pid == self.probe.current_pid() {
            return if marker.session_token == self.token {
                Liveness::Ours
            } else {
                Liveness::Stale("left by an earlier process with our pid")
            };
        }
        if !self.probe.is_alive(marker.owner_pid) {
            return Liveness::Stale("owner process has exited");
        }
        if let (Some(recorded), Some(current)) = (
            marker.owner_start_time,
            self.probe.start_time(marker.owner_pid),
        ) {
            if recorded != current {
                return Liveness::Stale("owner pid was reused");
            }
        }
        Liveness::Live
    }

    /// Take the process lock for `document`.
    pub fn acquire(&self, document: &Path) -> Result<LockHandle> {
        if lock_set(&self.held).contains(document) {
            return Err(Error::AlreadyLocked {
                path: document.to_path_buf(),
                owner: LockOwner::from(&self.new_marker()),
            });
        }

        let marker_path = marker_path_for(document);
        let marker = self.new_marker();
        let mut incomplete_since = None;

        for _ in 0..MAX_ACQUIRE_ATTEMPTS {
            match create_marker(&marker_path, &marker) {
                Ok(()) => {
                    lock_set(&self.held).insert(document.to_path_buf());
                    debug!("Acquired lock for '{}'", document.display());
                    return Ok(LockHandle {
                        inner: Arc::new(HandleInner {
                            document: document.to_path_buf(),
                            marker_path,
                            marker,
                            released: AtomicBool::new(false),
                            held: Arc::clone(&self.held),
                        }),
                    });
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
                Err(e) => {
                    return Err(Error::FileWrite {
                        path: marker_path,
                        source: e,
                    })
                }
            }

            incomplete_since = None;
            match read_marker(&marker_path)? {
                MarkerRead::Missing => continue,
                MarkerRead::Incomplete(since) => {
                    debug!(
                        "Lock marker for '{}' is still being written",
                        document.display()
                    );
                    incomplete_since = Some(since);
                    thread::sleep(INCOMPLETE_RETRY_DELAY);
                }
                MarkerRead::Present(existing) => match self.classify(&existing) {
                    Liveness::Ours | Liveness::Live => {
                        return Err(Error::AlreadyLocked {
                            path: document.to_path_buf(),
                            owner: LockOwner::from(&existing),
                        })
                    }
                    Liveness::Stale(reason) => {
                        info!(
                            "Reclaiming stale lock on '{}' (pid {}): {}",
                            document.display(),
                            existing.owner_pid,
                            reason
                        );
                        reclaim(&marker_path, Some(&existing))?;
                    }
                },
                MarkerRead::Unreadable(msg) => {
                    warn!(
                        "Reclaiming unreadable lock marker for '{}': {}",
                        document.display(),
                        msg
                    );
                    reclaim(&marker_path, None)?;
                }
            }
        }

        if let Some(since) = incomplete_since {
            return Err(Error::AlreadyLocked {
                path: document.to_path_buf(),
                owner: LockOwner::unknown(since),
            });
        }
        Err(Error::Application(format!(
            "could not acquire lock for '{}' after {} attempts",
            document.display(),
            MAX_ACQUIRE_ATTEMPTS
        )))
    }

    /// Release a lock. Releasing twice is harmless.
    pub fn release(&self, handle: &LockHandle) -> Result<()> {
        handle.release()
    }

    /// Current lock state of `document`, without changing anything.
    pub fn status(&self, document: &Path) -> Result<LockStatus> {
        Ok(match read_marker(&marker_path_for(document))? {
            MarkerRead::Missing => LockStatus::Unlocked,
            MarkerRead::Incomplete(since) => LockStatus::HeldByOther(LockOwner::unknown(since)),
            MarkerRead::Unreadable(_) => LockStatus::Stale(None),
            MarkerRead::Present(marker) => match self.classify(&marker) {
                Liveness::Ours => LockStatus::HeldByUs,
                Liveness::Live => LockStatus::HeldByOther(LockOwner::from(&marker)),
                Liveness::Stale(_) => LockStatus::Stale(Some(LockOwner::from(&marker))),
            },
        })
    }

    /// Remove stale markers and leftover temporary files below `root`.
    ///
    /// Run at startup, before any document below `root` is opened.
    pub fn sweep_stale(&self, root: &Path) -> Result<SweepReport> {
        let mut report = SweepReport::default();
        let mut markers = Vec::new();
        let mut leftovers = Vec::new();
        for path in WalkDir::new(root)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .map(|e| e.into_path())
        {
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if is_leftover_name(name) {
                leftovers.push(path);
            } else if name.starts_with('.') && name.ends_with(MARKER_SUFFIX) {
                markers.push(path);
            }
        }

        for leftover in leftovers {
            match fs::remove_file(&leftover) {
                Ok(()) => {
                    debug!("Removed lock leftover {}", leftover.display());
                    report.marker_leftovers_removed += 1;
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => warn!("Could not remove {}: {}", leftover.display(), e),
            }
        }

        for marker_path in markers {
            let Some(document) = document_for_marker(&marker_path) else {
                continue;
            };
            let stale = match read_marker(&marker_path)? {
                MarkerRead::Missing | MarkerRead::Incomplete(_) => continue,
                MarkerRead::Unreadable(_) => Some(None),
                MarkerRead::Present(m) => match self.classify(&m) {
                    Liveness::Stale(_) => Some(Some(m)),
                    Liveness::Ours | Liveness::Live => None,
                },
            };
            if let Some(expected) = stale {
                reclaim(&marker_path, expected.as_ref())?;
                debug!("Swept stale lock for '{}'", document.display());
                report.stale_markers_removed += 1;
            }
        }

        report.temp_files_removed = sweep_temp_files(root);
        if report != SweepReport::default() {
            info!(
                "Startup sweep removed {} stale lock(s), {} lock leftover(s) and {} temp file(s)",
                report.stale_markers_removed,
                report.marker_leftovers_removed,
                report.temp_files_removed
            );
        }
        Ok(report)
    }
}

/// Move a stale marker aside and delete it, unless what we moved turns out to
/// be a fresh marker written in the meantime, which is put back.
fn reclaim(marker_path: &Path, expected: Option<&LockMarker>) -> Result<()> {
    let aside = aside_path(marker_path);
    match fs::rename(marker_path, &aside) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => {
            return Err(Error::FileWrite {
                path: marker_path.to_path_buf(),
                source: e,
            })
        }
    }

    let moved_expected = match (read_marker(&aside)?, expected) {
        (MarkerRead::Present(m), Some(expected)) => m == *expected,
        (MarkerRead::Unreadable(_), None) => true,
        _ => false,
    };
    if !moved_expected {
        if let Err(e) = fs::hard_link(&aside, marker_path) {
            warn!(
                "Could not restore lock marker {}: {}",
                marker_path.display(),
                e
            );
        }
    }
    if let Err(e) = fs::remove_file(&aside) {
        warn!("Could not remove {}: {}", aside.display(), e);
    }
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Test Support
// ─────────────────────────────────────────────────────────────────────────────


// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
