//! Library management for QuickCopy
//!
//! The library is a folder on disk: subfolders are folders, `.qcdoc` files are
//! documents. [`Library`] is the object the UI shell talks to. It owns the
//! lock manager, the autosave controller, the favorites set and the tree
//! view, consumes the shell's callbacks and publishes [`EngineEvent`]s that
//! the shell drains with [`Library::poll_events`].

mod favorites;
mod file_tree;
pub mod names;
mod ops;
mod persistence;
mod search;
mod watcher;

pub use favorites::Favorites;
pub use file_tree::{list_folder, scan_directory, Entry, Listing, Rescanner, TreeNode, TreeNodeKind};
pub use persistence::{load_library_state, save_library_state, LibraryState, STATE_DIR};
pub use search::{SearchHit, MAX_RESULTS};
pub use watcher::{LibraryWatcher, WatchEvent};

use crate::autosave::{AutosaveConfig, AutosaveController, CodecSink, SaveState};
use crate::clipboard::{self, ClipboardTarget, SystemClipboard};
use crate::config::{get_favorites_file_path, Settings};
use crate::document::{Document, EditOutcome, Mutation, SectionId};
use crate::error::{Error, LockReason, Result, ResultExt};
use crate::events::{EngineEvent, EventSink};
use crate::lock::{LockManager, LockStatus, ProcessProbe, SweepReport};
use crate::storage::bundle::{self, BundleSummary};
use crate::storage::legacy::{self, ImportReport};
use crate::storage::{self, FileSummary, RepairReport};
use log::{debug, info, warn};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{channel, Receiver};
use std::sync::Arc;

// ─────────────────────────────────────────────────────────────────────────────
// Options & Reports
// ─────────────────────────────────────────────────────────────────────────────

/// Collaborators that can be swapped out when opening a library.
pub struct LibraryOptions {
    /// Favorites record; `None` uses `<config_dir>/quickcopy/favorites.json`.
    pub favorites_file: Option<PathBuf>,
    /// Process liveness checks; `None` asks the operating system.
    pub probe: Option<Arc<dyn ProcessProbe>>,
    /// Clipboard for copy operations; `None` uses the system clipboard.
    pub clipboard: Option<Box<dyn ClipboardTarget>>,
    /// Whether to start the file system watcher (also needs `watch_filesystem`).
    pub watch: bool,
}

impl Default for LibraryOptions {
    fn default() -> Self {
        Self {
            favorites_file: None,
            probe: None,
            clipboard: None,
            watch: true,
        }
    }
}

/// How to close an open document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseMode {
    /// Write pending edits first; the document stays open if that fails.
    Save,
    /// Drop pending edits.
    Discard,
}

/// Outcome of [`Library::on_app_shutdown`].
#[derive(Debug, Default)]
pub struct ShutdownReport {
    /// Documents that were saved and closed.
    pub closed: Vec<PathBuf>,
    /// Documents that could not be saved. They stay open so the shell can
    /// retry or discard them.
    pub failed: Vec<(PathBuf, Error)>,
}

impl ShutdownReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Library
// ─────────────────────────────────────────────────────────────────────────────

pub struct Library {
    root: PathBuf,
    settings: Settings,
    locks: LockManager,
    autosave: Arc<AutosaveController>,
    favorites: Favorites,
    tree: TreeNode,
    rescanner: Rescanner,
    watcher: Option<LibraryWatcher>,
    clipboard: Box<dyn ClipboardTarget>,
    events: EventSink,
    event_rx: Receiver<EngineEvent>,
}

impl Library {
    /// Open the library configured in `settings`.
    pub fn open(settings: Settings) -> Result<Self> {
        let root = settings
            .resolved_library_root()
            .ok_or(Error::ConfigDirNotFound)?;
        Self::open_with(root, settings, LibraryOptions::default())
    }

    /// Open the library at `root`, creating the folder if needed.
    pub fn open_with(
        root: impl Into<PathBuf>,
        settings: Settings,
        options: LibraryOptions,
    ) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root).map_err(|e| Error::FileWrite {
            path: root.clone(),
            source: e,
        })?;

        let locks = match options.probe {
            Some(probe) => LockManager::with_probe(probe),
            None => LockManager::new(),
        };

        if settings.sweep_stale_locks_on_startup {
            let report = locks
                .sweep_stale(&root)
                .unwrap_or_warn_default(SweepReport::default(), "Startup lock sweep failed");
            debug!("Startup sweep: {:?}", report);
            let leftovers = ops::sweep_deleting(&root);
            if leftovers > 0 {
                info!("Removed {} interrupted delete(s)", leftovers);
            }
        }

        let favorites = match options.favorites_file.map(Ok).unwrap_or_else(get_favorites_file_path) {
            Ok(file) => Favorites::load(file, &root),
            Err(e) => {
                warn!("Favorites will not be persisted: {}", e);
                Favorites::in_memory(&root)
            }
        };

        let hidden = hidden_filter(&settings);
        let mut tree = scan_directory(&root, &hidden);
        if let Some(state) = load_library_state(&root) {
            tree.restore_expanded_paths(&state.expanded_paths);
        }

        let (tx, event_rx) = channel();
        let events = EventSink::new(tx);
        let autosave = AutosaveController::new(Box::new(CodecSink), events.clone());
        autosave.set_config(AutosaveConfig::from_settings(&settings))?;

        let watcher = if options.watch && settings.watch_filesystem {
            match LibraryWatcher::new(root.clone()) {
                Ok(watcher) => Some(watcher),
                Err(e) => {
                    warn!("File watching disabled: {}", e);
                    None
                }
            }
        } else {
            None
        };

        info!("Opened library at {}", root.display());
        Ok(Self {
            root,
            settings,
            locks,
            autosave,
            favorites,
            tree,
            rescanner: Rescanner::new(),
            watcher,
            clipboard: options
                .clipboard
                .unwrap_or_else(|| Box::new(SystemClipboard)),
            events,
            event_rx,
        })
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Accessors
    // ─────────────────────────────────────────────────────────────────────────

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn tree(&self) -> &TreeNode {
        &self.tree
    }

    pub fn tree_mut(&mut self) -> &mut TreeNode {
        &mut self.tree
    }

    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    pub fn favorites(&self) -> &Favorites {
        &self.favorites
    }

    pub fn is_open(&self, path: &Path) -> bool {
        self.autosave.is_open(path)
    }

    pub fn open_documents(&self) -> Vec<PathBuf> {
        self.autosave.open_paths()
    }

    /// Save state of an open document.
    pub fn save_state(&self, path: &Path) -> Option<SaveState> {
        self.autosave.state(path)
    }

    /// Current in-memory content of an open document.
    pub fn document(&self, path: &Path) -> Option<Document> {
        self.autosave.snapshot(path)
    }

    pub fn lock_status(&self, path: &Path) -> Result<LockStatus> {
        self.locks.status(path)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Events
    // ─────────────────────────────────────────────────────────────────────────

    /// Drain pending engine events. Call once per frame.
    ///
    /// Also applies finished rescans and turns watcher notifications into
    /// `FolderListChanged` events followed by a rescan.
    pub fn poll_events(&mut self) -> Vec<EngineEvent> {
        let mut rescan = false;
        if let Some(watcher) = &self.watcher {
            for event in watcher.poll_events() {
                match event {
                    WatchEvent::FolderChanged(path) => {
                        self.events.emit(EngineEvent::FolderListChanged { path });
                        rescan = true;
                    }
                    WatchEvent::Error(message) => warn!("File watcher error: {}", message),
                }
            }
        }
        if rescan {
            self.request_rescan();
        }

        if let Some(result) = self.rescanner.poll() {
            let expanded = self.tree.expanded_paths();
            self.tree = result.tree;
            self.tree.restore_expanded_paths(&expanded);
            self.events.emit(EngineEvent::RescanCompleted {
                generation: result.generation,
            });
        }

        self.event_rx.try_iter().collect()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Tree View
    // ─────────────────────────────────────────────────────────────────────────

    /// List the folders and documents directly inside `folder`.
    pub fn list(&self, folder: &Path) -> Result<Listing> {
        self.check_inside(folder)?;
        let hidden = hidden_filter(&self.settings);
        list_folder(folder, &hidden).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => Error::NotFound(folder.to_path_buf()),
            _ => Error::FileRead {
                path: folder.to_path_buf(),
                source: e,
            },
        })
    }

    /// Start a background rescan. The result arrives through `poll_events`.
    pub fn request_rescan(&mut self) -> u64 {
        let hidden = hidden_filter(&self.settings);
        self.rescanner.request(self.root.clone(), hidden)
    }

    /// Whether a background rescan is still running.
    pub fn is_loading(&self) -> bool {
        self.rescanner.is_loading()
    }

    /// Rescan synchronously, keeping expanded folders.
    pub fn refresh_tree(&mut self) {
        let expanded = self.tree.expanded_paths();
        self.tree = scan_directory(&self.root, &hidden_filter(&self.settings));
        self.tree.restore_expanded_paths(&expanded);
    }

    /// Fuzzy search over folder and document names.
    pub fn search(&self, query: &str) -> Vec<SearchHit> {
        search::search(&self.tree, query, &self.favorites, MAX_RESULTS)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Shell Callbacks
    // ─────────────────────────────────────────────────────────────────────────

    /// The shell opened a document for editing.
    ///
    /// Takes the process lock and loads the file. If another live process
    /// holds the lock, `LockConflictDetected` is emitted and `AlreadyLocked`
    /// returned; the shell may then show the document read-only by loading it
    /// with [`storage::load`].
    pub fn on_document_opened(&mut self, path: &Path) -> Result<Document> {
        self.check_inside(path)?;
        if let Some(document) = self.autosave.snapshot(path) {
            return Ok(document);
        }

        let handle = match self.locks.acquire(path) {
            Ok(handle) => handle,
            Err(e @ Error::AlreadyLocked { .. }) => {
                self.events.emit(EngineEvent::LockConflictDetected {
                    path: path.to_path_buf(),
                });
                return Err(e);
            }
            Err(e) => return Err(e),
        };
        let document = storage::load(path)?;

        if document.is_favorite() && !self.favorites.contains(path) {
            debug!("Restoring favorite '{}'", path.display());
            self.favorites
                .set(path, true)
                .unwrap_or_warn_default(false, "Failed to restore favorite");
        }

        self.settings.add_recent_document(path.to_path_buf());
        self.autosave.open(document.clone(), handle);
        info!("Opened '{}'", path.display());
        Ok(document)
    }

    /// The shell requested an edit of an open document.
    pub fn on_edit_requested(&mut self, path: &Path, mutation: Mutation) -> Result<EditOutcome> {
        let is_favorite_toggle = matches!(mutation, Mutation::ToggleFavorite);
        let status = self.locks.status(path)?;
        let outcome = self.autosave.edit(path, mutation, &status)?;

        if is_favorite_toggle && outcome.is_change() {
            let favorite = self.autosave.with_document(path, Document::is_favorite)?;
            self.favorites.set(path, favorite)?;
        }
        Ok(outcome)
    }

    /// The shell requested an explicit save.
    pub fn on_save_requested(&self, path: &Path) -> Result<()> {
        self.autosave.save_now(path)
    }

    /// The application is quitting: flush every dirty document, persist the
    /// view state and release the locks of every document that was saved.
    pub fn on_app_shutdown(&mut self) -> ShutdownReport {
        self.autosave.stop_timer();
        let failed = self.autosave.flush_all();

        let state = LibraryState {
            expanded_paths: self.tree.expanded_paths(),
            current_folder: None,
            open_documents: self.autosave.open_paths(),
        };
        save_library_state(&self.root, &state)
            .unwrap_or_warn_default((), "Failed to save library state");

        let mut report = ShutdownReport::default();
        for path in self.autosave.open_paths() {
            if failed.iter().any(|(p, _)| p == &path) {
                continue;
            }
            self.autosave.close(&path);
            report.closed.push(path);
        }
        report.failed = failed;
        if report.is_clean() {
            info!("Shutdown complete, {} document(s) closed", report.closed.len());
        } else {
            warn!(
                "Shutdown left {} unsaved document(s)",
                report.failed.len()
            );
        }
        report
    }

    /// Close an open document and release its lock.
    pub fn close_document(&mut self, path: &Path, mode: CloseMode) -> Result<()> {
        if !self.autosave.is_open(path) {
            return Err(Error::DocumentNotOpen(path.to_path_buf()));
        }
        if mode == CloseMode::Save {
            self.autosave.flush(path)?;
        }
        if let Some((_, state)) = self.autosave.close(path) {
            if state.is_dirty() {
                info!("Discarded unsaved changes to '{}'", path.display());
                self.events.emit(EngineEvent::DirtyStateChanged {
                    path: path.to_path_buf(),
                    is_dirty: false,
                });
            }
        }
        Ok(())
    }

    /// Turn background saving on or off.
    pub fn set_autosave(&mut self, enabled: bool, interval_ms: u64) -> Result<()> {
        self.settings.autosave_enabled = enabled;
        self.settings.autosave_interval_ms = interval_ms;
        self.settings.sanitize();
        self.autosave
            .set_config(AutosaveConfig::from_settings(&self.settings))
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Favorites
    // ─────────────────────────────────────────────────────────────────────────

    pub fn is_favorite(&self, path: &Path) -> bool {
        self.favorites.contains(path)
    }

    /// Flip a document's favorite state. Returns the new state.
    ///
    /// An open document is edited in memory; a closed one is rewritten on
    /// disk under its process lock so the stored flag matches the set.
    pub fn toggle_favorite(&mut self, path: &Path) -> Result<bool> {
        self.check_inside(path)?;
        if self.autosave.is_open(path) {
            self.on_edit_requested(path, Mutation::ToggleFavorite)?;
            return Ok(self.favorites.contains(path));
        }

        let handle = self.acquire_for_change(path)?;
        let mut document = storage::load(path)?;
        document.edit(Mutation::ToggleFavorite, &LockStatus::HeldByUs)?;
        handle.verify()?;
        storage::save(&document)?;
        handle.release()?;

        let favorite = document.is_favorite();
        self.favorites.set(path, favorite)?;
        Ok(favorite)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Clipboard
    // ─────────────────────────────────────────────────────────────────────────

    /// Copy one copy section to the clipboard and return its plain text.
    ///
    /// Works on open documents (current content) and closed ones (saved
    /// content).
    pub fn copy_section_to_clipboard(
        &mut self,
        path: &Path,
        section: SectionId,
        rich: bool,
    ) -> Result<String> {
        let text = self.read_document(path, |doc| {
            doc.copy_section(section)
                .map(|s| s.rich_text().clone())
                .ok_or(Error::SectionNotFound(section))
        })??;
        clipboard::copy_rich_text(self.clipboard.as_mut(), &text, rich)?;
        Ok(text.plain_text())
    }

    /// Copy the copy section at `index` (0-based, for the 1..9 hotkeys).
    pub fn copy_section_at(&mut self, path: &Path, index: usize) -> Result<String> {
        let text = self.read_document(path, |doc| doc.copy_text_at(index))?;
        let text = text.ok_or_else(|| {
            Error::InvalidOrder(format!("no copy section at position {}", index + 1))
        })?;
        self.clipboard.set_text(&text)?;
        Ok(text)
    }

    fn read_document<R>(&self, path: &Path, f: impl FnOnce(&Document) -> R) -> Result<R> {
        if self.autosave.is_open(path) {
            self.autosave.with_document(path, f)
        } else {
            self.check_inside(path)?;
            Ok(f(&storage::load(path)?))
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Repair & Inspect
    // ─────────────────────────────────────────────────────────────────────────

    /// Summarize a document file, even one that fails to load.
    pub fn inspect(&self, path: &Path) -> Result<FileSummary> {
        self.check_inside(path)?;
        storage::inspect(path)
    }

    /// Prepare a repair of a damaged document. Nothing is written.
    pub fn repair_document(&self, path: &Path) -> Result<RepairReport> {
        self.check_inside(path)?;
        storage::repair(path)
    }

    /// Write a repaired document after the user confirmed it.
    pub fn apply_repair(&mut self, report: &RepairReport) -> Result<()> {
        let path = report.document.path();
        self.check_inside(path)?;
        let handle = self.acquire_for_change(path)?;
        handle.verify()?;
        storage::save(&report.document)?;
        handle.release()?;
        info!(
            "Repaired '{}': {}",
            path.display(),
            report.actions.join(", ")
        );
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Import & Export
    // ─────────────────────────────────────────────────────────────────────────

    /// Import an old single-file database into `folder` and register its
    /// favorites.
    pub fn import_legacy(&mut self, file: &Path, folder: &Path) -> Result<ImportReport> {
        self.check_inside(folder)?;
        let report = legacy::import_file(file, folder)?;
        for path in &report.favorites {
            self.favorites.set(path, true)?;
        }
        for skipped in &report.skipped {
            warn!("Legacy import skipped {}", skipped);
        }
        self.refresh_tree();
        self.events.emit(EngineEvent::FolderListChanged {
            path: folder.to_path_buf(),
        });
        Ok(report)
    }

    /// Export `folder` to a bundle file. Pending edits of open documents in
    /// the folder are saved first so the bundle matches what the user sees.
    pub fn export_bundle(&self, folder: &Path, file: &Path) -> Result<BundleSummary> {
        self.check_inside(folder)?;
        for path in self.autosave.open_paths() {
            if path.starts_with(folder) {
                self.autosave.flush(&path)?;
            }
        }
        bundle::export_folder(folder, file)
    }

    /// Import a bundle as a new folder inside `folder`. Returns the new folder.
    pub fn import_bundle(&mut self, file: &Path, folder: &Path) -> Result<PathBuf> {
        self.check_inside(folder)?;
        let (path, _) = bundle::import_bundle(file, folder)?;
        self.refresh_tree();
        self.events.emit(EngineEvent::FolderListChanged {
            path: folder.to_path_buf(),
        });
        Ok(path)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Helpers
    // ─────────────────────────────────────────────────────────────────────────

    /// Paths handed in by the shell must lie inside the library.
    fn check_inside(&self, path: &Path) -> Result<()> {
        if path.starts_with(&self.root) {
            Ok(())
        } else {
            Err(Error::NotFound(path.to_path_buf()))
        }
    }

    /// Take the process lock of a document that is about to change on disk
    /// outside an editing session.
    fn acquire_for_change(&self, path: &Path) -> Result<crate::lock::LockHandle> {
        if self.autosave.is_open(path) {
            return Err(Error::LockedDocument {
                path: path.to_path_buf(),
                reason: LockReason::OpenInSession,
            });
        }
        match self.locks.acquire(path) {
            Ok(handle) => Ok(handle),
            Err(Error::AlreadyLocked { path, owner }) => Err(Error::LockedDocument {
                path,
                reason: LockReason::OtherProcess(owner),
            }),
            Err(e) => Err(e),
        }
    }
}

impl Drop for Library {
    fn drop(&mut self) {
        self.autosave.stop_timer();
    }
}

/// Name filter built from the user's hidden patterns.
fn hidden_filter(settings: &Settings) -> impl Fn(&str) -> bool + Send + 'static {
    let settings = Settings {
        hidden_patterns: settings.hidden_patterns.clone(),
        ..Settings::default()
    };
    move |name: &str| settings.is_hidden_name(name)
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clipboard::testing::MemoryClipboard;
    use crate::document::SectionTarget;
    use crate::lock::marker::marker_path_for;
    use crate::lock::testing::{plant_marker, FakeProbe};
    use std::time::{Duration, Instant};
    use tempfile::TempDir;

    pub(crate) struct TestLibrary {
        pub library: Library,
        pub root: PathBuf,
        pub clipboard: MemoryClipboard,
        _dir: TempDir,
    }

    pub(crate) fn open_library(probe: Arc<FakeProbe>) -> TestLibrary {
        let _ = env_logger::builder().is_test(true).try_init();
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("library");
        let clipboard = MemoryClipboard::default();
        let options = LibraryOptions {
            favorites_file: Some(dir.path().join("config/favorites.json")),
            probe: Some(probe),
            clipboard: Some(Box::new(clipboard.clone())),
            watch: false,
        };
        let library = Library::open_with(&root, Settings::default(), options).unwrap();
        TestLibrary {
            library,
            root,
            clipboard,
            _dir: dir,
        }
    }

    fn insert(id: SectionId, text: &str) -> Mutation {
        Mutation::InsertText {
            target: SectionTarget::Copy(id),
            position: 0,
            text: text.to_string(),
        }
    }

    #[test]
    fn test_open_edit_save() {
        let mut env = open_library(FakeProbe::new());
        let doc = env.library.create_document(&env.root, "Intro").unwrap();
        let opened = env.library.on_document_opened(&doc).unwrap();
        let id = opened.section_ids()[0];
        assert_eq!(env.library.lock_status(&doc).unwrap(), LockStatus::HeldByUs);
        env.library.poll_events();

        env.library.on_edit_requested(&doc, insert(id, "Hello")).unwrap();
        assert_eq!(env.library.save_state(&doc), Some(SaveState::Dirty));
        env.library.on_save_requested(&doc).unwrap();
        assert_eq!(env.library.save_state(&doc), Some(SaveState::Clean));
        assert_eq!(storage::load(&doc).unwrap().copy_text_at(0).unwrap(), "Hello");

        let events = env.library.poll_events();
        assert_eq!(
            events,
            vec![
                EngineEvent::DirtyStateChanged {
                    path: doc.clone(),
                    is_dirty: true
                },
                EngineEvent::DocumentSaved { path: doc.clone() },
                EngineEvent::DirtyStateChanged {
                    path: doc.clone(),
                    is_dirty: false
                },
            ]
        );
        assert_eq!(env.library.settings().recent_documents, vec![doc]);
    }

    #[test]
    fn test_open_held_by_other_process() {
        let probe = FakeProbe::new();
        let mut env = open_library(probe.clone());
        let doc = env.library.create_document(&env.root, "Intro").unwrap();
        probe.spawn(4242, Some(7));
        plant_marker(&doc, 4242, Some(7), "other-session");
        env.library.poll_events();

        assert!(matches!(
            env.library.on_document_opened(&doc),
            Err(Error::AlreadyLocked { .. })
        ));
        assert!(!env.library.is_open(&doc));
        assert!(env
            .library
            .poll_events()
            .contains(&EngineEvent::LockConflictDetected { path: doc.clone() }));

        probe.kill(4242);
        assert!(env.library.on_document_opened(&doc).is_ok());
    }

    #[test]
    fn test_startup_sweeps_stale_markers() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("library");
        std::fs::create_dir_all(&root).unwrap();
        let doc = root.join("Intro.qcdoc");
        storage::save(&Document::new("Intro", &doc)).unwrap();
        plant_marker(&doc, 999_999, None, "dead-session");

        let options = LibraryOptions {
            favorites_file: Some(dir.path().join("favorites.json")),
            probe: Some(FakeProbe::new()),
            clipboard: Some(Box::new(MemoryClipboard::default())),
            watch: false,
        };
        let _library = Library::open_with(&root, Settings::default(), options).unwrap();
        assert!(!marker_path_for(&doc).exists());
    }

    #[test]
    fn test_favorite_flag_restored_into_set() {
        let mut env = open_library(FakeProbe::new());
        let doc = storage::document_path(&env.root, "Intro");
        let mut document = Document::new("Intro", &doc);
        document
            .edit(Mutation::ToggleFavorite, &LockStatus::HeldByUs)
            .unwrap();
        storage::save(&document).unwrap();
        assert!(!env.library.is_favorite(&doc));

        env.library.on_document_opened(&doc).unwrap();
        assert!(env.library.is_favorite(&doc));
    }

    #[test]
    fn test_toggle_favorite_closed_and_open() {
        let mut env = open_library(FakeProbe::new());
        let doc = env.library.create_document(&env.root, "Intro").unwrap();

        assert!(env.library.toggle_favorite(&doc).unwrap());
        assert!(storage::load(&doc).unwrap().is_favorite());
        assert!(!marker_path_for(&doc).exists());
        assert_eq!(env.library.search("")[0].path, doc);

        env.library.on_document_opened(&doc).unwrap();
        assert!(!env.library.toggle_favorite(&doc).unwrap());
        assert!(!env.library.is_favorite(&doc));
        assert_eq!(env.library.save_state(&doc), Some(SaveState::Dirty));
    }

    #[test]
    fn test_toggle_favorite_refused_when_held_elsewhere() {
        let probe = FakeProbe::new();
        let mut env = open_library(probe.clone());
        let doc = env.library.create_document(&env.root, "Intro").unwrap();
        probe.spawn(4242, None);
        plant_marker(&doc, 4242, None, "other-session");

        assert!(matches!(
            env.library.toggle_favorite(&doc),
            Err(Error::LockedDocument {
                reason: LockReason::OtherProcess(_),
                ..
            })
        ));
        assert!(!env.library.is_favorite(&doc));
    }

    #[test]
    fn test_copy_sections_to_clipboard() {
        let mut env = open_library(FakeProbe::new());
        let doc = env.library.create_document(&env.root, "Intro").unwrap();
        let id = env.library.on_document_opened(&doc).unwrap().section_ids()[0];
        env.library.on_edit_requested(&doc, insert(id, "Dear Sam")).unwrap();
        env.library
            .on_edit_requested(
                &doc,
                Mutation::ToggleBold {
                    target: SectionTarget::Copy(id),
                    range: 5..8,
                },
            )
            .unwrap();

        assert_eq!(env.library.copy_section_at(&doc, 0).unwrap(), "Dear Sam");
        assert_eq!(env.clipboard.text.lock().unwrap().as_deref(), Some("Dear Sam"));
        assert!(env.library.copy_section_at(&doc, 3).is_err());

        env.library.copy_section_to_clipboard(&doc, id, true).unwrap();
        let html = env.clipboard.html.lock().unwrap().clone().unwrap();
        assert_eq!(html, "Dear <b>Sam</b>");
    }

    #[test]
    fn test_copy_from_closed_document_uses_saved_content() {
        let mut env = open_library(FakeProbe::new());
        let doc = env.library.create_document(&env.root, "Intro").unwrap();
        let id = env.library.on_document_opened(&doc).unwrap().section_ids()[0];
        env.library.on_edit_requested(&doc, insert(id, "Saved")).unwrap();
        env.library.close_document(&doc, CloseMode::Save).unwrap();

        assert_eq!(env.library.copy_section_at(&doc, 0).unwrap(), "Saved");
        assert!(matches!(
            env.library.copy_section_to_clipboard(&doc, SectionId::new(), false),
            Err(Error::SectionNotFound(_))
        ));
    }

    #[test]
    fn test_close_discard_drops_edits() {
        let mut env = open_library(FakeProbe::new());
        let doc = env.library.create_document(&env.root, "Intro").unwrap();
        let id = env.library.on_document_opened(&doc).unwrap().section_ids()[0];
        env.library.on_edit_requested(&doc, insert(id, "Draft")).unwrap();

        env.library.close_document(&doc, CloseMode::Discard).unwrap();
        assert!(!env.library.is_open(&doc));
        assert!(!marker_path_for(&doc).exists());
        assert_eq!(storage::load(&doc).unwrap().copy_text_at(0).unwrap(), "");
        assert!(matches!(
            env.library.close_document(&doc, CloseMode::Discard),
            Err(Error::DocumentNotOpen(_))
        ));
    }

    #[test]
    fn test_shutdown_flushes_and_persists_state() {
        let mut env = open_library(FakeProbe::new());
        let work = env.library.create_folder(&env.root, "work").unwrap();
        let doc = env.library.create_document(&work, "Intro").unwrap();
        env.library.tree_mut().set_expanded(&work, true);
        let id = env.library.on_document_opened(&doc).unwrap().section_ids()[0];
        env.library.on_edit_requested(&doc, insert(id, "Bye")).unwrap();

        let report = env.library.on_app_shutdown();
        assert!(report.is_clean());
        assert_eq!(report.closed, vec![doc.clone()]);
        assert!(!marker_path_for(&doc).exists());
        assert_eq!(storage::load(&doc).unwrap().copy_text_at(0).unwrap(), "Bye");

        let state = load_library_state(&env.root).unwrap();
        assert!(state.expanded_paths.contains(&work));
        assert_eq!(state.open_documents, vec![doc]);
    }

    #[test]
    fn test_list_and_search() {
        let mut env = open_library(FakeProbe::new());
        let root = env.root.clone();
        env.library.create_folder(&root, "letters").unwrap();
        env.library.create_document(&root, "Letter intro").unwrap();
        env.library.create_document(&root, "Alpha").unwrap();
        std::fs::write(root.join(".hidden.qcdoc"), b"{}").unwrap();

        let listing = env.library.list(&root).unwrap();
        let folders: Vec<&str> = listing.folders.iter().map(|e| e.name.as_str()).collect();
        let documents: Vec<&str> = listing.documents.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(folders, vec!["letters"]);
        assert_eq!(documents, vec!["Alpha", "Letter intro"]);

        let hits = env.library.search("letter");
        assert_eq!(hits.len(), 2);
        assert!(matches!(
            env.library.list(&root.join("missing")),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_background_rescan_reports_completion() {
        let mut env = open_library(FakeProbe::new());
        std::fs::create_dir(env.root.join("outside")).unwrap();
        let generation = env.library.request_rescan();

        let deadline = Instant::now() + Duration::from_secs(5);
        let mut completed = false;
        while Instant::now() < deadline && !completed {
            completed = env
                .library
                .poll_events()
                .contains(&EngineEvent::RescanCompleted { generation });
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(completed);
        assert!(!env.library.is_loading());
        assert!(env.library.tree().find(&env.root.join("outside")).is_some());
    }

    #[test]
    fn test_apply_repair_refuses_open_document() {
        let mut env = open_library(FakeProbe::new());
        let doc = env.library.create_document(&env.root, "Intro").unwrap();
        let report = env.library.repair_document(&doc).unwrap();
        assert!(!report.changed());
        assert_eq!(env.library.inspect(&doc).unwrap().copy_sections, Some(1));

        env.library.on_document_opened(&doc).unwrap();
        assert!(matches!(
            env.library.apply_repair(&report),
            Err(Error::LockedDocument {
                reason: LockReason::OpenInSession,
                ..
            })
        ));
        env.library.close_document(&doc, CloseMode::Discard).unwrap();
        env.library.apply_repair(&report).unwrap();
        assert!(!marker_path_for(&doc).exists());
    }

    #[test]
    fn test_paths_outside_library_rejected() {
        let mut env = open_library(FakeProbe::new());
        assert!(matches!(
            env.library.on_document_opened(Path::new("/elsewhere/Intro.qcdoc")),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_import_legacy_registers_favorites() {
        let mut env = open_library(FakeProbe::new());
        let data = env.root.parent().unwrap().join("data.json");
        std::fs::write(
            &data,
            serde_json::json!({
                "quickcopy_root_id": "qc",
                "favorites_root_id": "fav",
                "nodes": {
                    "qc": {"id": "qc", "type": "folder", "name": "QuickCopy", "children": ["f"]},
                    "fav": {"id": "fav", "type": "folder", "name": "Favorites", "children": []},
                    "f": {"id": "f", "type": "file", "name": "Intro", "pinned": true,
                          "content": {"read_text": "", "copy_blocks": ["Hello"]}}
                }
            })
            .to_string(),
        )
        .unwrap();

        let root = env.root.clone();
        let report = env.library.import_legacy(&data, &root).unwrap();
        let doc = root.join("Intro.qcdoc");
        assert_eq!(report.favorites, vec![doc.clone()]);
        assert!(env.library.is_favorite(&doc));
        assert!(env.library.tree().find(&doc).is_some());
    }

    #[test]
    fn test_bundle_export_includes_unsaved_edits() {
        let mut env = open_library(FakeProbe::new());
        let root = env.root.clone();
        let work = env.library.create_folder(&root, "work").unwrap();
        let doc = env.library.create_document(&work, "Intro").unwrap();
        let id = env.library.on_document_opened(&doc).unwrap().section_ids()[0];
        env.library.on_edit_requested(&doc, insert(id, "Pending")).unwrap();

        let file = env.root.parent().unwrap().join("work.qcbundle");
        let summary = env.library.export_bundle(&work, &file).unwrap();
        assert_eq!(summary.documents, 1);
        assert_eq!(env.library.save_state(&doc), Some(SaveState::Clean));

        let imported = env.library.import_bundle(&file, &root).unwrap();
        assert_eq!(imported, root.join("work (2)"));
        let copy = storage::load(&imported.join("Intro.qcdoc")).unwrap();
        assert_eq!(copy.copy_text_at(0).unwrap(), "Pending");
    }
}
