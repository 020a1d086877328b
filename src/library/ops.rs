//! Tree operations: create, rename, move and delete.
//!
//! Every operation validates names and checks the process locks of every
//! affected document before the filesystem is touched, so a refused operation
//! leaves the library exactly as it was.

use super::names::{ensure_unique, normalize_name};
use super::Library;
use crate::autosave::DetachedSession;
use crate::document::Document;
use crate::error::{Error, Result};
use crate::events::EngineEvent;
use crate::lock::LockHandle;
use crate::storage;
use log::{debug, info, warn};
use std::fs;
use std::path::{Path, PathBuf};
use uuid::Uuid;
use walkdir::WalkDir;

/// Marker in the name of an entry that is being deleted.
const DELETING_MARKER: &str = ".deleting.";

impl Library {
    // ─────────────────────────────────────────────────────────────────────────
    // Create
    // ─────────────────────────────────────────────────────────────────────────

    /// Create an empty folder. Returns its path.
    pub fn create_folder(&mut self, parent: &Path, name: &str) -> Result<PathBuf> {
        self.check_folder(parent)?;
        let name = normalize_name(name)?;
        ensure_unique(parent, &name, None)?;

        let path = parent.join(&name);
        fs::create_dir(&path).map_err(|e| Error::FileWrite {
            path: path.clone(),
            source: e,
        })?;
        info!("Created folder '{}'", path.display());
        self.tree_changed(parent);
        Ok(path)
    }

    /// Create a new document with one empty copy section. Returns its path.
    pub fn create_document(&mut self, parent: &Path, name: &str) -> Result<PathBuf> {
        self.check_folder(parent)?;
        let name = normalize_name(name)?;
        ensure_unique(parent, &name, None)?;

        let path = storage::document_path(parent, &name);
        storage::save(&Document::new(name, path.clone()))?;
        info!("Created document '{}'", path.display());
        self.tree_changed(parent);
        Ok(path)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Rename & Move
    // ─────────────────────────────────────────────────────────────────────────

    /// Rename a folder or document in place. Returns the new path.
    pub fn rename(&mut self, path: &Path, new_name: &str) -> Result<PathBuf> {
        self.check_entry(path)?;
        let parent = parent_of(path)?;
        let name = normalize_name(new_name)?;
        ensure_unique(&parent, &name, Some(path))?;

        let target = if path.is_dir() {
            parent.join(&name)
        } else {
            storage::document_path(&parent, &name)
        };
        if target == path {
            return Ok(target);
        }
        self.relocate(path, &target)?;
        Ok(target)
    }

    /// Move a folder or document into `new_parent`. Returns the new path.
    pub fn move_to(&mut self, path: &Path, new_parent: &Path) -> Result<PathBuf> {
        self.check_entry(path)?;
        self.check_folder(new_parent)?;
        if path.is_dir() && new_parent.starts_with(path) {
            return Err(Error::InvalidName {
                name: display_name(path),
                reason: "cannot be moved into itself",
            });
        }
        let file_name = path
            .file_name()
            .ok_or_else(|| Error::NotFound(path.to_path_buf()))?;
        let target = new_parent.join(file_name);
        if target == path {
            return Ok(target);
        }
        let name = if path.is_dir() {
            display_name(path)
        } else {
            storage::document_name(path).unwrap_or_default()
        };
        ensure_unique(new_parent, &name, Some(path))?;
        self.relocate(path, &target)?;
        Ok(target)
    }

    fn relocate(&mut self, from: &Path, to: &Path) -> Result<()> {
        let locks = self.lock_documents_under(from)?;

        fs::rename(from, to).map_err(|e| Error::FileWrite {
            path: from.to_path_buf(),
            source: e,
        })?;

        let is_dir = to.is_dir();
        for handle in &locks {
            let result = if is_dir {
                let rest = handle.document().strip_prefix(from).unwrap_or(Path::new(""));
                handle.release_relocated(&to.join(rest))
            } else {
                handle.release()
            };
            if let Err(e) = result {
                warn!("Failed to release lock after move: {}", e);
            }
        }
        if !is_dir && storage::document_name(from) != storage::document_name(to) {
            self.store_file_name(to);
        }

        self.favorites.relocate(from, to)?;
        self.settings.forget_recent_document(from);
        info!("Moved '{}' to '{}'", from.display(), to.display());

        if let Some(old_parent) = from.parent() {
            self.tree_changed(old_parent);
        }
        if let Some(new_parent) = to.parent() {
            if Some(new_parent) != from.parent() {
                self.tree_changed(new_parent);
            }
        }
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Delete
    // ─────────────────────────────────────────────────────────────────────────

    /// Delete a folder (with everything in it) or a document.
    ///
    /// Documents open in this session are closed without saving. Any document
    /// held by another process aborts the whole delete before anything changes.
    pub fn delete(&mut self, path: &Path) -> Result<()> {
        self.check_entry(path)?;

        let documents = documents_under(path);
        let mut locks: Vec<LockHandle> = Vec::new();
        for document in documents.iter().filter(|d| !self.autosave.is_open(d)) {
            locks.push(self.acquire_for_change(document)?);
        }
        let detached: Vec<DetachedSession> = documents
            .iter()
            .filter_map(|d| self.autosave.detach(d))
            .collect();

        let aside = aside_path(path)?;
        if let Err(e) = fs::rename(path, &aside) {
            for session in detached {
                self.autosave.attach(session);
            }
            return Err(Error::FileWrite {
                path: path.to_path_buf(),
                source: e,
            });
        }

        let removed = if aside.is_dir() {
            fs::remove_dir_all(&aside)
        } else {
            fs::remove_file(&aside)
        };
        if let Err(e) = removed {
            // Swept on next startup.
            warn!("Failed to remove '{}': {}", aside.display(), e);
        }

        for session in detached {
            if session.state.is_dirty() {
                info!(
                    "Discarded unsaved changes to '{}'",
                    session.document.path().display()
                );
                self.events.emit(EngineEvent::DirtyStateChanged {
                    path: session.document.path().to_path_buf(),
                    is_dirty: false,
                });
            }
        }
        for handle in locks {
            if let Err(e) = handle.release() {
                debug!("Lock release after delete: {}", e);
            }
        }

        self.favorites.remove_under(path)?;
        self.settings.forget_recent_document(path);
        info!("Deleted '{}'", path.display());
        if let Some(parent) = path.parent() {
            self.tree_changed(parent);
        }
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Helpers
    // ─────────────────────────────────────────────────────────────────────────

    /// Rewrite a renamed document so its stored name matches the file name.
    ///
    /// Loading already takes the name from the file, so a failure here only
    /// leaves a stale name inside the file.
    fn store_file_name(&self, document: &Path) {
        let result = self.locks.acquire(document).and_then(|handle| {
            let renamed = storage::load(document)?;
            handle.verify()?;
            storage::save(&renamed)?;
            handle.release()
        });
        match result {
            Ok(()) => debug!("Stored new name in '{}'", document.display()),
            Err(e) => warn!(
                "Failed to store the new name in '{}': {}",
                document.display(),
                e
            ),
        }
    }

    /// Take the process lock of every document at or below `path`.
    ///
    /// Fails with `LockedDocument` on the first document that is open in this
    /// session or held by another process; locks taken so far are released.
    pub(crate) fn lock_documents_under(&self, path: &Path) -> Result<Vec<LockHandle>> {
        documents_under(path)
            .iter()
            .map(|document| self.acquire_for_change(document))
            .collect()
    }

    fn check_folder(&self, folder: &Path) -> Result<()> {
        self.check_inside(folder)?;
        if folder.is_dir() {
            Ok(())
        } else {
            Err(Error::NotFound(folder.to_path_buf()))
        }
    }

    /// `path` must be an existing entry strictly inside the library.
    fn check_entry(&self, path: &Path) -> Result<()> {
        self.check_inside(path)?;
        if path == self.root {
            return Err(Error::InvalidName {
                name: display_name(path),
                reason: "is the library root",
            });
        }
        if !path.exists() {
            return Err(Error::NotFound(path.to_path_buf()));
        }
        Ok(())
    }

    fn tree_changed(&mut self, folder: &Path) {
        self.refresh_tree();
        self.events.emit(EngineEvent::FolderListChanged {
            path: folder.to_path_buf(),
        });
    }
}

/// Documents at or below `path`, hidden entries skipped.
fn documents_under(path: &Path) -> Vec<PathBuf> {
    if path.is_file() {
        return vec![path.to_path_buf()];
    }
    WalkDir::new(path)
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || !e.file_name().to_string_lossy().starts_with('.'))
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file() && storage::is_document_path(e.path()))
        .map(|e| e.into_path())
        .collect()
}

fn parent_of(path: &Path) -> Result<PathBuf> {
    path.parent()
        .map(Path::to_path_buf)
        .ok_or_else(|| Error::NotFound(path.to_path_buf()))
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Hidden sibling name an entry is renamed to before it is removed.
fn aside_path(path: &Path) -> Result<PathBuf> {
    let token = Uuid::new_v4().simple().to_string();
    let name = format!(".{}{}{}", display_name(path), DELETING_MARKER, &token[..12]);
    Ok(parent_of(path)?.join(name))
}

/// Remove entries left behind by deletes that were interrupted. Returns how
/// many were removed.
pub(crate) fn sweep_deleting(root: &Path) -> usize {
    let leftovers: Vec<PathBuf> = WalkDir::new(root)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| {
            let name = e.file_name().to_string_lossy();
            name.starts_with('.') && name.contains(DELETING_MARKER)
        })
        .map(|e| e.into_path())
        .collect();

    let mut removed = 0;
    for path in leftovers {
        let result = if path.is_dir() {
            fs::remove_dir_all(&path)
        } else {
            fs::remove_file(&path)
        };
        match result {
            Ok(()) => removed += 1,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove '{}': {}", path.display(), e),
        }
    }
    removed
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
