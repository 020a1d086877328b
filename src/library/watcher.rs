//! File system watcher for the library.
//!
//! Watches the library root recursively and reports which folders changed.
//! Changes to hidden entries (lock markers, temp files, the state folder) are
//! dropped so the engine's own bookkeeping never triggers a rescan.

use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::BTreeSet;
use std::path::{Component, Path, PathBuf};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::time::Duration;

/// Raw notifications forwarded from the notify callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    /// Something inside this folder was created, modified or removed
    FolderChanged(PathBuf),
    /// The watcher encountered an error
    Error(String),
}

/// Watches a library root for external changes.
#[derive(Debug)]
pub struct LibraryWatcher {
    _watcher: RecommendedWatcher,
    receiver: Receiver<WatchEvent>,
    root: PathBuf,
}

impl LibraryWatcher {
    /// Start watching `root` recursively.
    pub fn new(root: PathBuf) -> Result<Self, String> {
        let (tx, rx) = channel();

        let callback_root = root.clone();
        let mut watcher = RecommendedWatcher::new(
            move |result: Result<Event, notify::Error>| {
                Self::handle_event(result, &callback_root, &tx);
            },
            Config::default().with_poll_interval(Duration::from_millis(500)),
        )
        .map_err(|e| format!("Failed to create file watcher: {}", e))?;

        watcher
            .watch(&root, RecursiveMode::Recursive)
            .map_err(|e| format!("Failed to watch path {}: {}", root.display(), e))?;

        Ok(Self {
            _watcher: watcher,
            receiver: rx,
            root,
        })
    }

    fn handle_event(result: Result<Event, notify::Error>, root: &Path, tx: &Sender<WatchEvent>) {
        match result {
            Ok(event) => {
                if !matches!(
                    event.kind,
                    EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
                ) {
                    return;
                }
                for path in event.paths {
                    if let Some(folder) = changed_folder(root, &path) {
                        let _ = tx.send(WatchEvent::FolderChanged(folder));
                    }
                }
            }
            Err(e) => {
                let _ = tx.send(WatchEvent::Error(e.to_string()));
            }
        }
    }

    /// Folders that changed since the last poll, deduplicated.
    ///
    /// Errors are passed through unchanged. This is non-blocking.
    pub fn poll_events(&self) -> Vec<WatchEvent> {
        let mut folders = BTreeSet::new();
        let mut errors = Vec::new();
        while let Ok(event) = self.receiver.try_recv() {
            match event {
                WatchEvent::FolderChanged(folder) => {
                    folders.insert(folder);
                }
                error @ WatchEvent::Error(_) => errors.push(error),
            }
        }
        folders
            .into_iter()
            .map(WatchEvent::FolderChanged)
            .chain(errors)
            .collect()
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

/// The folder whose listing is affected by a change at `path`, or `None` if
/// the path is outside the library or inside a hidden entry.
pub fn changed_folder(root: &Path, path: &Path) -> Option<PathBuf> {
    let relative = path.strip_prefix(root).ok()?;
    let hidden = relative.components().any(|component| match component {
        Component::Normal(name) => name.to_string_lossy().starts_with('.'),
        _ => false,
    });
    if hidden || relative.as_os_str().is_empty() {
        return None;
    }
    path.parent().map(Path::to_path_buf)
}
