//! QuickCopy - Document Engine
//!
//! Persistence and edit state for QuickCopy script libraries: rich text
//! documents with a read-only guide and ordered copy sections, stored one
//! file per document in a folder tree. The UI shell drives a [`Library`]
//! through its callbacks and polls [`EngineEvent`]s back.

pub mod autosave;
pub mod clipboard;
pub mod config;
pub mod document;
pub mod error;
pub mod events;
pub mod library;
pub mod lock;
pub mod richtext;
pub mod storage;
mod string_utils;

pub use config::{load_config, save_config, Settings, APP_NAME};
pub use document::{Document, EditOutcome, Mutation, SectionId, SectionTarget};
pub use error::{Error, ErrorKind, Result};
pub use events::EngineEvent;
pub use library::{CloseMode, Library, LibraryOptions, ShutdownReport};
pub use richtext::{Attributes, Color, RichText, Span};
