//! Autosave controller
//!
//! Owns every open document together with its [`DirtyTracker`] and process
//! lock. Edits mark a document dirty; saves run either on demand or from a
//! background [`AutosaveTimer`]. The document mutex is only held to mutate or
//! snapshot a document, never while writing the file, so typing is never
//! blocked by a save. A separate per-document save mutex keeps explicit and
//! timer saves from overlapping.

mod state;
mod timer;

pub use state::{DirtyTracker, SaveState, SaveTicket};
pub use timer::AutosaveTimer;

use crate::config::Settings;
use crate::document::{Document, EditOutcome, Mutation};
use crate::error::{Error, Result};
use crate::events::{EngineEvent, EventSink};
use crate::lock::{LockHandle, LockStatus};
use crate::storage;
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, TryLockError, Weak};
use std::time::Duration;

/// Lock a mutex, recovering the data if a panicking thread poisoned it.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ─────────────────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Autosave interval used when none is configured, in milliseconds.
pub const DEFAULT_INTERVAL_MS: u64 = 8000;
/// Shortest accepted autosave interval, in milliseconds.
pub const MIN_INTERVAL_MS: u64 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AutosaveConfig {
    pub enabled: bool,
    pub interval: Duration,
}

impl AutosaveConfig {
    /// Build a config, clamping the interval to at least [`MIN_INTERVAL_MS`].
    pub fn new(enabled: bool, interval_ms: u64) -> Self {
        Self {
            enabled,
            interval: Duration::from_millis(interval_ms.max(MIN_INTERVAL_MS)),
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(settings.autosave_enabled, settings.autosave_interval_ms)
    }
}

impl Default for AutosaveConfig {
    fn default() -> Self {
        Self::new(false, DEFAULT_INTERVAL_MS)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Save Sink
// ─────────────────────────────────────────────────────────────────────────────

/// Where document snapshots are written.
pub trait SaveSink: Send + Sync {
    /// Persist `document` and return the checksum of what was written.
    fn persist(&self, document: &Document, lock: &LockHandle) -> Result<String>;
}

/// Writes through the storage codec after confirming the lock is still ours.
#[derive(Debug, Default, Clone, Copy)]
pub struct CodecSink;

impl SaveSink for CodecSink {
    fn persist(&self, document: &Document, lock: &LockHandle) -> Result<String> {
        lock.verify()?;
        storage::save(document)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Sessions
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug)]
struct OpenDocument {
    document: Document,
    tracker: DirtyTracker,
    /// Set after a failure that retrying cannot fix; ticks skip the document
    /// until its next edit or a successful save.
    ticks_paused: bool,
}

struct Session {
    open: Mutex<OpenDocument>,
    save_guard: Mutex<()>,
    lock: LockHandle,
    /// Set once the session left the controller; a tick still holding it skips it.
    closed: AtomicBool,
}

/// An open document taken out of the controller with its lock still held.
#[derive(Debug)]
pub struct DetachedSession {
    pub document: Document,
    pub state: SaveState,
    pub lock: LockHandle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SaveMode {
    /// Timer tick: skip if a save is already running.
    Background,
    /// Shutdown or close: wait for a running save, write only if dirty.
    Flush,
    /// User request: wait and always write.
    Explicit,
}

// ─────────────────────────────────────────────────────────────────────────────
// Controller
// ─────────────────────────────────────────────────────────────────────────────

pub struct AutosaveController {
    /// Handed to the timer thread so it never keeps the controller alive.
    this: Weak<Self>,
    sessions: Mutex<HashMap<PathBuf, Arc<Session>>>,
    sink: Box<dyn SaveSink>,
    events: EventSink,
    config: Mutex<AutosaveConfig>,
    timer: Mutex<Option<AutosaveTimer>>,
}

impl AutosaveController {
    pub fn new(sink: Box<dyn SaveSink>, events: EventSink) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            sessions: Mutex::new(HashMap::new()),
            sink,
            events,
            config: Mutex::new(AutosaveConfig::default()),
            timer: Mutex::new(None),
        })
    }

    pub fn config(&self) -> AutosaveConfig {
        *lock(&self.config)
    }

    /// Apply a new config, starting, restarting or stopping the timer.
    ///
    /// The timer keeps running while disabled if an open document turned
    /// autosave on for itself.
    pub fn set_config(&self, config: AutosaveConfig) -> Result<()> {
        *lock(&self.config) = config;
        if config.enabled {
            info!(
                "Autosave enabled every {} ms",
                config.interval.as_millis()
            );
        } else {
            info!("Autosave disabled");
        }
        self.sync_timer()
    }

    /// Whether any open document should be saved by the timer.
    fn wants_timer(&self) -> bool {
        let enabled = self.config().enabled;
        if enabled {
            return true;
        }
        let sessions: Vec<Arc<Session>> = lock(&self.sessions).values().cloned().collect();
        sessions
            .iter()
            .any(|s| lock(&s.open).document.autosaves(enabled))
    }

    /// Start or stop the timer to match the config and the open documents.
    ///
    /// Must not be called while holding a session's document mutex.
    fn sync_timer(&self) -> Result<()> {
        let wanted = self.wants_timer();
        let interval = self.config().interval;
        let mut timer = lock(&self.timer);
        let current = timer.as_ref().map(AutosaveTimer::interval);
        if (wanted && current == Some(interval)) || (!wanted && current.is_none()) {
            return Ok(());
        }
        if let Some(mut running) = timer.take() {
            running.stop();
        }
        if wanted {
            let weak = self.this.clone();
            *timer = Some(AutosaveTimer::spawn(interval, move || {
                if let Some(controller) = weak.upgrade() {
                    controller.tick();
                }
            })?);
        }
        Ok(())
    }

    fn refresh_timer(&self) {
        if let Err(e) = self.sync_timer() {
            warn!("Failed to update the autosave timer: {}", e);
        }
    }

    /// Stop the background timer, waiting for a running tick.
    pub fn stop_timer(&self) {
        if let Some(mut timer) = lock(&self.timer).take() {
            timer.stop();
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Open / Close
    // ─────────────────────────────────────────────────────────────────────────

    /// Register a freshly loaded document. It starts out clean.
    pub fn open(&self, document: Document, lock_handle: LockHandle) {
        let path = document.path().to_path_buf();
        let session = Arc::new(Session {
            open: Mutex::new(OpenDocument {
                document,
                tracker: DirtyTracker::new(),
                ticks_paused: false,
            }),
            save_guard: Mutex::new(()),
            lock: lock_handle,
            closed: AtomicBool::new(false),
        });
        lock(&self.sessions).insert(path, session);
        self.refresh_timer();
    }

    pub fn is_open(&self, path: &Path) -> bool {
        lock(&self.sessions).contains_key(path)
    }

    pub fn open_paths(&self) -> Vec<PathBuf> {
        lock(&self.sessions).keys().cloned().collect()
    }

    /// Take a document out of the controller without saving or releasing its
    /// lock, waiting for any running save first.
    pub fn detach(&self, path: &Path) -> Option<DetachedSession> {
        let session = lock(&self.sessions).remove(path)?;
        let detached = {
            let _guard = lock(&session.save_guard);
            session.closed.store(true, Ordering::SeqCst);
            let open = lock(&session.open);
            DetachedSession {
                document: open.document.clone(),
                state: open.tracker.state(),
                lock: session.lock.clone(),
            }
        };
        self.refresh_timer();
        Some(detached)
    }

    /// Put a detached document back, keeping its dirty state.
    pub fn attach(&self, detached: DetachedSession) {
        let DetachedSession {
            document,
            state,
            lock: lock_handle,
        } = detached;
        let dirty = state.is_dirty();
        let path = document.path().to_path_buf();
        self.open(document, lock_handle);
        if dirty {
            if let Ok(session) = self.session(&path) {
                lock(&session.open).tracker.mark_edited();
            }
        }
    }

    /// Forget a document without saving, waiting for any running save, and
    /// release its process lock. Returns the last in-memory state.
    pub fn close(&self, path: &Path) -> Option<(Document, SaveState)> {
        let detached = self.detach(path)?;
        if let Err(e) = detached.lock.release() {
            warn!("Failed to release lock for '{}': {}", path.display(), e);
        }
        debug!("Closed '{}'", path.display());
        Some((detached.document, detached.state))
    }

    fn session(&self, path: &Path) -> Result<Arc<Session>> {
        lock(&self.sessions)
            .get(path)
            .cloned()
            .ok_or_else(|| Error::DocumentNotOpen(path.to_path_buf()))
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Queries
    // ─────────────────────────────────────────────────────────────────────────

    pub fn state(&self, path: &Path) -> Option<SaveState> {
        let session = self.session(path).ok()?;
        let state = lock(&session.open).tracker.state();
        Some(state)
    }

    /// A copy of the in-memory document.
    pub fn snapshot(&self, path: &Path) -> Option<Document> {
        let session = self.session(path).ok()?;
        let document = lock(&session.open).document.clone();
        Some(document)
    }

    /// Run `f` against the in-memory document without copying it.
    pub fn with_document<R>(&self, path: &Path, f: impl FnOnce(&Document) -> R) -> Result<R> {
        let session = self.session(path)?;
        let open = lock(&session.open);
        Ok(f(&open.document))
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Editing
    // ─────────────────────────────────────────────────────────────────────────

    /// Apply an edit to an open document and mark it dirty if it changed.
    pub fn edit(
        &self,
        path: &Path,
        mutation: Mutation,
        status: &LockStatus,
    ) -> Result<EditOutcome> {
        let session = self.session(path)?;
        let autosave_choice = matches!(mutation, Mutation::SetAutosave(_));
        let mut open = lock(&session.open);
        let outcome = match open.document.edit(mutation, status) {
            Ok(outcome) => outcome,
            Err(e) => {
                if matches!(e, Error::ProcessLockConflict { .. }) {
                    self.events.emit(EngineEvent::LockConflictDetected {
                        path: path.to_path_buf(),
                    });
                }
                return Err(e);
            }
        };
        if outcome.is_change() {
            let was_dirty = open.tracker.is_dirty();
            open.tracker.mark_edited();
            open.ticks_paused = false;
            if !was_dirty {
                self.events.emit(EngineEvent::DirtyStateChanged {
                    path: path.to_path_buf(),
                    is_dirty: true,
                });
            }
        }
        drop(open);
        if autosave_choice && outcome.is_change() {
            self.refresh_timer();
        }
        Ok(outcome)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Saving
    // ─────────────────────────────────────────────────────────────────────────

    /// Save a document now, even if it has no pending edits.
    pub fn save_now(&self, path: &Path) -> Result<()> {
        let session = self.session(path)?;
        self.save_session(path, &session, SaveMode::Explicit)
            .map(|_| ())
    }

    /// Save a document if it is dirty, waiting for a running save first.
    pub fn flush(&self, path: &Path) -> Result<()> {
        let session = self.session(path)?;
        self.save_session(path, &session, SaveMode::Flush).map(|_| ())
    }

    /// One autosave pass over every dirty document that autosaves. Returns how
    /// many were saved.
    pub fn tick(&self) -> usize {
        let sessions: Vec<(PathBuf, Arc<Session>)> = lock(&self.sessions)
            .iter()
            .map(|(p, s)| (p.clone(), Arc::clone(s)))
            .collect();

        let mut saved = 0;
        for (path, session) in sessions {
            // Failures were already reported as events.
            if let Ok(true) = self.save_session(&path, &session, SaveMode::Background) {
                saved += 1;
            }
        }
        if saved > 0 {
            debug!("Autosave tick saved {} document(s)", saved);
        }
        saved
    }

    /// Synchronously save every dirty document. Returns the failures.
    pub fn flush_all(&self) -> Vec<(PathBuf, Error)> {
        let sessions: Vec<(PathBuf, Arc<Session>)> = lock(&self.sessions)
            .iter()
            .map(|(p, s)| (p.clone(), Arc::clone(s)))
            .collect();

        sessions
            .into_iter()
            .filter_map(|(path, session)| {
                self.save_session(&path, &session, SaveMode::Flush)
                    .err()
                    .map(|e| (path, e))
            })
            .collect()
    }

    /// Returns `Ok(true)` if a file was written.
    fn save_session(&self, path: &Path, session: &Session, mode: SaveMode) -> Result<bool> {
        let _guard = match mode {
            SaveMode::Background => match session.save_guard.try_lock() {
                Ok(guard) => guard,
                Err(TryLockError::WouldBlock) => return Ok(false),
                Err(TryLockError::Poisoned(p)) => p.into_inner(),
            },
            SaveMode::Flush | SaveMode::Explicit => lock(&session.save_guard),
        };
        if session.closed.load(Ordering::SeqCst) {
            return Ok(false);
        }

        let (snapshot, ticket, was_dirty) = {
            let mut open = lock(&session.open);
            if mode == SaveMode::Background
                && (open.ticks_paused || !open.document.autosaves(self.config().enabled))
            {
                return Ok(false);
            }
            let was_dirty = open.tracker.is_dirty();
            match open.tracker.begin_save(mode == SaveMode::Explicit) {
                Some(ticket) => (open.document.clone(), ticket, was_dirty),
                None => return Ok(false),
            }
        };

        let result = self.sink.persist(&snapshot, &session.lock);

        let mut open = lock(&session.open);
        match result {
            Ok(checksum) => {
                open.document.set_saved_checksum(checksum);
                open.tracker.finish_save(ticket, Ok(()));
                open.ticks_paused = false;
                let now_dirty = open.tracker.is_dirty();
                drop(open);

                info!("Saved '{}'", path.display());
                self.events.emit(EngineEvent::DocumentSaved {
                    path: path.to_path_buf(),
                });
                if was_dirty && !now_dirty {
                    self.events.emit(EngineEvent::DirtyStateChanged {
                        path: path.to_path_buf(),
                        is_dirty: false,
                    });
                }
                Ok(true)
            }
            Err(e) => {
                let kind = e.kind();
                open.tracker.finish_save(ticket, Err(kind));
                if e.is_transient() {
                    drop(open);
                    warn!("Failed to save '{}', will retry: {}", path.display(), e);
                } else {
                    open.ticks_paused = true;
                    drop(open);
                    error!(
                        "Failed to save '{}', background saves paused until the next edit: {}",
                        path.display(),
                        e
                    );
                }
                self.events.emit(EngineEvent::SaveFailed {
                    path: path.to_path_buf(),
                    kind,
                });
                if matches!(e, Error::ProcessLockConflict { .. }) {
                    self.events.emit(EngineEvent::LockConflictDetected {
                        path: path.to_path_buf(),
                    });
                }
                Err(e)
            }
        }
    }
}

impl Drop for AutosaveController {
    fn drop(&mut self) {
        self.stop_timer();
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
