//! Events published by the engine for the UI shell.
//!
//! The shell drains them with `Library::poll_events` once per frame, the same
//! way it polls file watcher events.

use crate::error::ErrorKind;
use std::path::PathBuf;
use std::sync::mpsc::Sender;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    /// The unsaved-changes indicator of a document flipped.
    DirtyStateChanged { path: PathBuf, is_dirty: bool },
    /// A save attempt failed; the document stays dirty.
    SaveFailed { path: PathBuf, kind: ErrorKind },
    /// Another process holds (or took over) the document's lock.
    LockConflictDetected { path: PathBuf },
    /// The contents of a folder changed on disk.
    FolderListChanged { path: PathBuf },
    /// A document was written successfully.
    DocumentSaved { path: PathBuf },
    /// A background rescan finished and its tree was applied.
    RescanCompleted { generation: u64 },
}

/// Sending half shared by engine components.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: Sender<EngineEvent>,
}

impl EventSink {
    pub fn new(tx: Sender<EngineEvent>) -> Self {
        Self { tx }
    }

    /// Publish an event. A shell that stopped listening is not an error.
    pub fn emit(&self, event: EngineEvent) {
        let _ = self.tx.send(event);
    }
}
