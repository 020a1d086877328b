//! User settings for QuickCopy
//!
//! This module defines the `Settings` struct that holds all user-configurable
//! options, with serde support for JSON persistence.

use crate::autosave::{DEFAULT_INTERVAL_MS, MIN_INTERVAL_MS};
use crate::richtext::{MAX_FONT_SIZE, MIN_FONT_SIZE};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// User-configurable options.
///
/// This struct is serialized to JSON and persisted to the user's config directory.
/// All fields have sensible defaults via the `Default` trait and `#[serde(default)]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    // ─────────────────────────────────────────────────────────────────────────
    // Library
    // ─────────────────────────────────────────────────────────────────────────
    /// Root folder of the document library. `None` uses `<documents>/QuickCopy`.
    pub library_root: Option<PathBuf>,

    /// Glob-like name patterns hidden from listings, in addition to dot files
    pub hidden_patterns: Vec<String>,

    /// Whether to watch the library for external changes
    pub watch_filesystem: bool,

    /// Whether to remove stale lock markers and temp files at startup
    pub sweep_stale_locks_on_startup: bool,

    // ─────────────────────────────────────────────────────────────────────────
    // Autosave
    // ─────────────────────────────────────────────────────────────────────────
    /// Whether open documents are saved in the background
    pub autosave_enabled: bool,

    /// Background save interval in milliseconds
    pub autosave_interval_ms: u64,

    // ─────────────────────────────────────────────────────────────────────────
    // Editing
    // ─────────────────────────────────────────────────────────────────────────
    /// Font size offered by the size picker for new formatting (in points)
    pub default_font_size: u16,

    // ─────────────────────────────────────────────────────────────────────────
    // Session & History
    // ─────────────────────────────────────────────────────────────────────────
    /// Recently opened documents (most recent first)
    pub recent_documents: Vec<PathBuf>,

    /// Maximum number of recent documents to remember
    pub max_recent_documents: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            // Library
            library_root: None,
            hidden_patterns: Vec::new(),
            watch_filesystem: true,
            sweep_stale_locks_on_startup: true,

            // Autosave
            autosave_enabled: false,
            autosave_interval_ms: DEFAULT_INTERVAL_MS,

            // Editing
            default_font_size: 11,

            // Session & History
            recent_documents: Vec::new(),
            max_recent_documents: 10,
        }
    }
}

impl Settings {
    /// Add a document to the recent documents list.
    ///
    /// If the document already exists in the list, it's moved to the front.
    /// The list is trimmed to `max_recent_documents`.
    pub fn add_recent_document(&mut self, path: PathBuf) {
        self.recent_documents.retain(|p| p != &path);
        self.recent_documents.insert(0, path);
        self.recent_documents.truncate(self.max_recent_documents);
    }

    /// Drop a document from the recent list, e.g. after it was deleted.
    pub fn forget_recent_document(&mut self, path: &std::path::Path) {
        self.recent_documents.retain(|p| !p.starts_with(path));
    }

    /// Resolve the library root, falling back to `<documents>/QuickCopy`.
    pub fn resolved_library_root(&self) -> Option<PathBuf> {
        self.library_root.clone().or_else(|| {
            dirs::document_dir()
                .or_else(dirs::home_dir)
                .map(|base| base.join("QuickCopy"))
        })
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Validation Constants and Sanitization
    // ─────────────────────────────────────────────────────────────────────────

    /// Maximum number of recent documents that can be configured.
    pub const MAX_RECENT_LIMIT: usize = 100;

    /// Sanitize settings by clamping values to valid ranges.
    ///
    /// This is useful after loading settings from a file that might have
    /// been manually edited with invalid values.
    pub fn sanitize(&mut self) {
        if self.autosave_interval_ms < MIN_INTERVAL_MS {
            self.autosave_interval_ms = MIN_INTERVAL_MS;
        }

        self.default_font_size = self.default_font_size.clamp(MIN_FONT_SIZE, MAX_FONT_SIZE);

        if self.max_recent_documents == 0 {
            self.max_recent_documents = 10;
        } else if self.max_recent_documents > Self::MAX_RECENT_LIMIT {
            self.max_recent_documents = Self::MAX_RECENT_LIMIT;
        }
        self.recent_documents.truncate(self.max_recent_documents);

        self.hidden_patterns.retain(|p| !p.trim().is_empty());
    }

    /// Load settings and sanitize them to ensure validity.
    pub fn from_json_sanitized(json: &str) -> Result<Self, serde_json::Error> {
        let mut settings: Self = serde_json::from_str(json)?;
        settings.sanitize();
        Ok(settings)
    }

    /// Whether a file or folder name matches one of `hidden_patterns`.
    ///
    /// Patterns support a single leading or trailing `*` wildcard.
    pub fn is_hidden_name(&self, name: &str) -> bool {
        let name = name.to_lowercase();
        self.hidden_patterns.iter().any(|pattern| {
            let pattern = pattern.trim().to_lowercase();
            if let Some(suffix) = pattern.strip_prefix('*') {
                name.ends_with(suffix)
            } else if let Some(prefix) = pattern.strip_suffix('*') {
                name.starts_with(prefix)
            } else {
                name == pattern
            }
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings() {
        let settings = Settings::default();
        assert!(!settings.autosave_enabled);
        assert_eq!(settings.autosave_interval_ms, 8000);
        assert!(settings.sweep_stale_locks_on_startup);
        assert!(settings.watch_filesystem);
        assert_eq!(settings.default_font_size, 11);
        assert!(settings.recent_documents.is_empty());
    }

    #[test]
    fn test_add_recent_document() {
        let mut settings = Settings {
            max_recent_documents: 3,
            ..Settings::default()
        };
        for name in ["a", "b", "c", "d"] {
            settings.add_recent_document(PathBuf::from(name));
        }
        assert_eq!(
            settings.recent_documents,
            vec![PathBuf::from("d"), PathBuf::from("c"), PathBuf::from("b")]
        );

        settings.add_recent_document(PathBuf::from("b"));
        assert_eq!(settings.recent_documents[0], PathBuf::from("b"));
        assert_eq!(settings.recent_documents.len(), 3);
    }

    #[test]
    fn test_forget_recent_document_under_folder() {
        let mut settings = Settings::default();
        settings.add_recent_document(PathBuf::from("/lib/Work/a.qcdoc"));
        settings.add_recent_document(PathBuf::from("/lib/Home/b.qcdoc"));
        settings.forget_recent_document(std::path::Path::new("/lib/Work"));
        assert_eq!(
            settings.recent_documents,
            vec![PathBuf::from("/lib/Home/b.qcdoc")]
        );
    }

    #[test]
    fn test_settings_deserialize_with_defaults() {
        let settings: Settings = serde_json::from_str(r#"{"autosave_enabled": true}"#).unwrap();
        assert!(settings.autosave_enabled);
        assert_eq!(settings.autosave_interval_ms, 8000);
        assert_eq!(settings.max_recent_documents, 10);
    }

    #[test]
    fn test_settings_serialization_roundtrip() {
        let settings = Settings {
            library_root: Some(PathBuf::from("/tmp/lib")),
            autosave_enabled: true,
            hidden_patterns: vec!["*.bak".into()],
            ..Settings::default()
        };
        let json = serde_json::to_string(&settings).unwrap();
        let loaded: Settings = serde_json::from_str(&json).unwrap();
        assert_eq!(settings, loaded);
    }

    #[test]
    fn test_sanitize_clamps_values() {
        let settings = Settings::from_json_sanitized(
            r#"{"autosave_interval_ms": 10, "default_font_size": 500, "max_recent_documents": 0, "hidden_patterns": ["  ", "tmp*"]}"#,
        )
        .unwrap();
        assert_eq!(settings.autosave_interval_ms, MIN_INTERVAL_MS);
        assert_eq!(settings.default_font_size, MAX_FONT_SIZE);
        assert_eq!(settings.max_recent_documents, 10);
        assert_eq!(settings.hidden_patterns, vec!["tmp*".to_string()]);
    }

    #[test]
    fn test_from_json_sanitized_rejects_wrong_types() {
        assert!(Settings::from_json_sanitized(r#"{"autosave_enabled": "yes"}"#).is_err());
    }

    #[test]
    fn test_hidden_patterns() {
        let settings = Settings {
            hidden_patterns: vec!["*.bak".into(), "Draft*".into(), "notes".into()],
            ..Settings::default()
        };
        assert!(settings.is_hidden_name("old.BAK"));
        assert!(settings.is_hidden_name("drafts"));
        assert!(settings.is_hidden_name("Notes"));
        assert!(!settings.is_hidden_name("Scripts"));
    }
}
