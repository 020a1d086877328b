//! Centralized error handling for QuickCopy
//!
//! This module provides a unified error type that covers every failure the
//! engine can report: edits refused by the user lock, process lock conflicts,
//! corrupt or too-new document files, invalid edit requests, file I/O and
//! configuration problems.

use crate::document::SectionId;
use crate::lock::LockOwner;
use log::warn;
use std::fmt;
use std::io;
use std::path::PathBuf;

// ─────────────────────────────────────────────────────────────────────────────
// Custom Result Type Alias
// ─────────────────────────────────────────────────────────────────────────────

/// A specialized `Result` type for the engine.
pub type Result<T> = std::result::Result<T, Error>;

/// Why a document counts as locked when an operation was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockReason {
    /// The user switched the document's `locked` flag on.
    UserFlag,
    /// Another live process holds the lock marker.
    OtherProcess(LockOwner),
    /// The document is open for editing in this engine.
    OpenInSession,
}

impl fmt::Display for LockReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockReason::UserFlag => write!(f, "document is locked"),
            LockReason::OtherProcess(owner) => write!(f, "in use by {}", owner),
            LockReason::OpenInSession => write!(f, "document is open for editing"),
        }
    }
}

/// The centralized error type for the engine.
#[derive(Debug)]
pub enum Error {
    // ─────────────────────────────────────────────────────────────────────────
    // Lock Errors
    // ─────────────────────────────────────────────────────────────────────────
    /// Content edit or tree operation refused because the document is locked
    LockedDocument { path: PathBuf, reason: LockReason },

    /// Another process holds the process lock for this document
    ProcessLockConflict { path: PathBuf, owner: LockOwner },

    /// `acquire` found a marker owned by a live process
    AlreadyLocked { path: PathBuf, owner: LockOwner },

    // ─────────────────────────────────────────────────────────────────────────
    // Document File Errors
    // ─────────────────────────────────────────────────────────────────────────
    /// The file is not valid JSON or violates a structural invariant
    CorruptFile { path: PathBuf, message: String },

    /// The file was written by a newer format than this build understands
    VersionMismatch {
        path: PathBuf,
        found: u64,
        supported: u64,
    },

    // ─────────────────────────────────────────────────────────────────────────
    // Edit Request Errors
    // ─────────────────────────────────────────────────────────────────────────
    /// Reorder request is not a permutation of the existing section ids
    InvalidOrder(String),

    /// A text position or range lies outside the content
    InvalidRange { start: usize, end: usize, len: usize },

    /// The edit targets a copy section that does not exist
    SectionNotFound(SectionId),

    /// The only remaining copy section cannot be removed
    LastSection,

    // ─────────────────────────────────────────────────────────────────────────
    // Folder Tree Errors
    // ─────────────────────────────────────────────────────────────────────────
    /// A folder or document name is not acceptable
    InvalidName { name: String, reason: &'static str },

    /// The name collides (case-insensitively) with a sibling
    NameCollision { parent: PathBuf, name: String },

    /// No folder or document exists at the path
    NotFound(PathBuf),

    /// The operation needs an open editing session for this document
    DocumentNotOpen(PathBuf),

    // ─────────────────────────────────────────────────────────────────────────
    // File I/O Errors
    // ─────────────────────────────────────────────────────────────────────────
    /// Generic I/O error wrapper
    Io(io::Error),

    /// Failed to read file contents
    FileRead { path: PathBuf, source: io::Error },

    /// Failed to write file contents
    FileWrite { path: PathBuf, source: io::Error },

    // ─────────────────────────────────────────────────────────────────────────
    // Configuration Errors
    // ─────────────────────────────────────────────────────────────────────────
    /// Failed to load configuration file
    ConfigLoad {
        path: PathBuf,
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Failed to save configuration file
    ConfigSave {
        path: PathBuf,
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Failed to parse configuration (invalid JSON/format)
    ConfigParse {
        message: String,
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Configuration directory not found or inaccessible
    ConfigDirNotFound,

    // ─────────────────────────────────────────────────────────────────────────
    // Application Errors
    // ─────────────────────────────────────────────────────────────────────────
    /// The system clipboard could not be accessed or written
    Clipboard(String),

    /// Generic application error with a message
    Application(String),
}

/// Flat classification of an [`Error`], reported to the shell with `SaveFailed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    LockedDocument,
    ProcessLockConflict,
    AlreadyLocked,
    CorruptFile,
    VersionMismatch,
    InvalidOrder,
    InvalidRange,
    NotFound,
    InvalidName,
    Io,
    Config,
    Clipboard,
    Other,
}

impl Error {
    /// Shorthand for a corrupt-file error.
    pub fn corrupt(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Error::CorruptFile {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Classify this error for event reporting.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::LockedDocument { .. } => ErrorKind::LockedDocument,
            Error::ProcessLockConflict { .. } => ErrorKind::ProcessLockConflict,
            Error::AlreadyLocked { .. } => ErrorKind::AlreadyLocked,
            Error::CorruptFile { .. } => ErrorKind::CorruptFile,
            Error::VersionMismatch { .. } => ErrorKind::VersionMismatch,
            Error::InvalidOrder(_) | Error::LastSection | Error::SectionNotFound(_) => {
                ErrorKind::InvalidOrder
            }
            Error::InvalidRange { .. } => ErrorKind::InvalidRange,
            Error::NotFound(_) | Error::DocumentNotOpen(_) => ErrorKind::NotFound,
            Error::InvalidName { .. } | Error::NameCollision { .. } => ErrorKind::InvalidName,
            Error::Io(_) | Error::FileRead { .. } | Error::FileWrite { .. } => ErrorKind::Io,
            Error::ConfigLoad { .. }
            | Error::ConfigSave { .. }
            | Error::ConfigParse { .. }
            | Error::ConfigDirNotFound => ErrorKind::Config,
            Error::Clipboard(_) => ErrorKind::Clipboard,
            Error::Application(_) => ErrorKind::Other,
        }
    }

    /// Whether a failed save with this error may succeed on a later attempt.
    ///
    /// Corrupt and version errors never heal on their own.
    pub fn is_transient(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Io | ErrorKind::ProcessLockConflict | ErrorKind::AlreadyLocked
        )
    }
}

// Implement From traits for convenient error conversion
impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::ConfigParse {
            message: err.to_string(),
            source: Some(Box::new(err)),
        }
    }
}

impl From<arboard::Error> for Error {
    fn from(err: arboard::Error) -> Self {
        Error::Clipboard(err.to_string())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Display trait implementation for user-friendly error messages
// ─────────────────────────────────────────────────────────────────────────────
impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            // Lock Errors
            Error::LockedDocument { path, reason } => {
                write!(f, "'{}' cannot be changed: {}", path.display(), reason)
            }
            Error::ProcessLockConflict { path, owner } => {
                write!(f, "'{}' is being edited by {}", path.display(), owner)
            }
            Error::AlreadyLocked { path, owner } => {
                write!(f, "'{}' is already locked by {}", path.display(), owner)
            }

            // Document File Errors
            Error::CorruptFile { path, message } => {
                write!(f, "'{}' is corrupt: {}", path.display(), message)
            }
            Error::VersionMismatch {
                path,
                found,
                supported,
            } => write!(
                f,
                "'{}' uses format version {} but only versions up to {} are supported",
                path.display(),
                found,
                supported
            ),

            // Edit Request Errors
            Error::InvalidOrder(msg) => write!(f, "Invalid section order: {}", msg),
            Error::InvalidRange { start, end, len } => write!(
                f,
                "Range {}..{} is outside text of length {}",
                start, end, len
            ),
            Error::SectionNotFound(id) => write!(f, "Copy section {} not found", id),
            Error::LastSection => {
                write!(f, "A document must keep at least one copy section")
            }

            // Folder Tree Errors
            Error::InvalidName { name, reason } => {
                write!(f, "Invalid name '{}': {}", name, reason)
            }
            Error::NameCollision { parent, name } => write!(
                f,
                "'{}' already exists in '{}'",
                name,
                parent.display()
            ),
            Error::NotFound(path) => write!(f, "'{}' not found", path.display()),
            Error::DocumentNotOpen(path) => {
                write!(f, "'{}' is not open for editing", path.display())
            }

            // File I/O Errors
            Error::Io(err) => write!(f, "I/O error: {}", err),
            Error::FileRead { path, source } => {
                write!(f, "Failed to read '{}': {}", path.display(), source)
            }
            Error::FileWrite { path, source } => {
                write!(f, "Failed to write '{}': {}", path.display(), source)
            }

            // Configuration Errors
            Error::ConfigLoad { path, source } => {
                write!(
                    f,
                    "Failed to load configuration from '{}': {}",
                    path.display(),
                    source
                )
            }
            Error::ConfigSave { path, source } => {
                write!(
                    f,
                    "Failed to save configuration to '{}': {}",
                    path.display(),
                    source
                )
            }
            Error::ConfigParse { message, .. } => {
                write!(f, "Invalid configuration format: {}", message)
            }
            Error::ConfigDirNotFound => {
                write!(f, "Configuration directory not found")
            }

            // Application Errors
            Error::Clipboard(msg) => write!(f, "Clipboard error: {}", msg),
            Error::Application(msg) => write!(f, "{}", msg),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// std::error::Error trait implementation for error chaining
// ─────────────────────────────────────────────────────────────────────────────
impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(err) => Some(err),
            Error::FileRead { source, .. } | Error::FileWrite { source, .. } => Some(source),
            Error::ConfigLoad { source, .. } => Some(source.as_ref()),
            Error::ConfigSave { source, .. } => Some(source.as_ref()),
            Error::ConfigParse { source, .. } => source
                .as_ref()
                .map(|s| s.as_ref() as &(dyn std::error::Error + 'static)),
            _ => None,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Graceful Degradation Helpers
// ─────────────────────────────────────────────────────────────────────────────

/// Extension trait for Result to support graceful degradation.
pub trait ResultExt<T> {
    /// If the result is an error, log it at warning level and return the provided default.
    fn unwrap_or_warn_default(self, default: T, context: &str) -> T;
}

impl<T> ResultExt<T> for Result<T> {
    fn unwrap_or_warn_default(self, default: T, context: &str) -> T {
        match self {
            Ok(value) => value,
            Err(err) => {
                warn!("{}: {}. Using default.", context, err);
                default
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
