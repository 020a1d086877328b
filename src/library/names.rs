//! Folder and document name rules.
//!
//! Names are display names: a folder's directory name, or a document's file
//! stem. No two entries under one parent may share a name ignoring case,
//! whatever their kinds.

use crate::error::{Error, Result};
use crate::storage;
use regex::Regex;
use std::fs;
use std::path::Path;
use std::sync::OnceLock;

/// Name given to entries created with a blank name.
pub const UNTITLED: &str = "Untitled";

/// Longest accepted name, in chars.
pub const MAX_NAME_CHARS: usize = 200;

/// Device names Windows refuses as file names, with or without an extension.
const RESERVED_DEVICE_NAMES: &[&str] = &[
    "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8",
    "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
];

fn reserved_chars() -> Result<&'static Regex> {
    static RESERVED: OnceLock<std::result::Result<Regex, regex::Error>> = OnceLock::new();
    RESERVED
        .get_or_init(|| Regex::new(r#"[<>:"/\\|?*\x00-\x1F]"#))
        .as_ref()
        .map_err(|e| Error::Application(format!("invalid name pattern: {}", e)))
}

/// Trim and validate a user-supplied name. A blank name becomes [`UNTITLED`].
pub fn normalize_name(raw: &str) -> Result<String> {
    let name = raw.trim();
    if name.is_empty() {
        return Ok(UNTITLED.to_string());
    }

    let invalid = |reason: &'static str| Error::InvalidName {
        name: name.to_string(),
        reason,
    };

    if reserved_chars()?.is_match(name) {
        return Err(invalid("contains a reserved character"));
    }
    if name.starts_with('.') {
        return Err(invalid("must not start with a dot"));
    }
    if name.ends_with('.') {
        return Err(invalid("must not end with a dot"));
    }
    if name.chars().count() > MAX_NAME_CHARS {
        return Err(invalid("is too long"));
    }
    let stem = name.split('.').next().unwrap_or(name);
    if RESERVED_DEVICE_NAMES
        .iter()
        .any(|reserved| reserved.eq_ignore_ascii_case(stem))
    {
        return Err(invalid("is reserved by the operating system"));
    }
    Ok(name.to_string())
}

/// Display name of a directory entry, or `None` for entries that are not part
/// of the library (hidden files, markers, temp files, foreign files).
pub fn entry_name(path: &Path, is_dir: bool) -> Option<String> {
    let file_name = path.file_name()?.to_str()?;
    if file_name.starts_with('.') {
        return None;
    }
    if is_dir {
        Some(file_name.to_string())
    } else if storage::is_document_path(path) {
        storage::document_name(path)
    } else {
        None
    }
}

/// Names of all library entries directly inside `parent`.
fn sibling_names(parent: &Path) -> Result<Vec<(String, std::path::PathBuf)>> {
    let read_dir = match fs::read_dir(parent) {
        Ok(read_dir) => read_dir,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(Error::NotFound(parent.to_path_buf()))
        }
        Err(e) => return Err(e.into()),
    };
    Ok(read_dir
        .flatten()
        .filter_map(|entry| {
            let path = entry.path();
            let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
            entry_name(&path, is_dir).map(|name| (name, path))
        })
        .collect())
}

/// Fail with `NameCollision` if `name` is taken under `parent`, ignoring
/// `except` (the entry being renamed).
pub fn ensure_unique(parent: &Path, name: &str, except: Option<&Path>) -> Result<()> {
    let wanted = name.to_lowercase();
    let taken = sibling_names(parent)?
        .into_iter()
        .any(|(existing, path)| existing.to_lowercase() == wanted && Some(path.as_path()) != except);
    if taken {
        Err(Error::NameCollision {
            parent: parent.to_path_buf(),
            name: name.to_string(),
        })
    } else {
        Ok(())
    }
}

/// First of `base`, `base (2)`, `base (3)`, ... that is free under `parent`.
pub fn unique_name(parent: &Path, base: &str) -> Result<String> {
    let taken: Vec<String> = match sibling_names(parent) {
        Ok(names) => names.into_iter().map(|(n, _)| n.to_lowercase()).collect(),
        Err(Error::NotFound(_)) => Vec::new(),
        Err(e) => return Err(e),
    };
    if !taken.contains(&base.to_lowercase()) {
        return Ok(base.to_string());
    }
    let mut n = 2;
    loop {
        let candidate = format!("{} ({})", base, n);
        if !taken.contains(&candidate.to_lowercase()) {
            return Ok(candidate);
        }
        n += 1;
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_normalize_trims_and_defaults() {
        assert_eq!(normalize_name("  Scripts  ").unwrap(), "Scripts");
        assert_eq!(normalize_name("   ").unwrap(), UNTITLED);
        assert_eq!(normalize_name("").unwrap(), UNTITLED);
        assert_eq!(normalize_name("v1.2 notes").unwrap(), "v1.2 notes");
    }

    #[test]
    fn test_normalize_rejects_bad_names() {
        for bad in ["a/b", "a\\b", "what?", "x:y", "<tag>", ".hidden", "trailing.", "CON", "lpt1.txt"] {
            assert!(
                matches!(normalize_name(bad), Err(Error::InvalidName { .. })),
                "{} should be rejected",
                bad
            );
        }
        assert!(normalize_name(&"x".repeat(MAX_NAME_CHARS + 1)).is_err());
    }

    #[test]
    fn test_collision_is_case_insensitive_across_kinds() {
        let dir = TempDir::new().unwrap();
        fs::create_dir(dir.path().join("Letters")).unwrap();
        fs::write(dir.path().join("Intro.qcdoc"), b"{}").unwrap();
        fs::write(dir.path().join("notes.txt"), b"").unwrap();
        fs::write(dir.path().join(".Hidden.qcdoc.lock"), b"").unwrap();

        assert!(matches!(
            ensure_unique(dir.path(), "letters", None),
            Err(Error::NameCollision { .. })
        ));
        assert!(ensure_unique(dir.path(), "INTRO", None).is_err());
        // Foreign and hidden files do not take names.
        assert!(ensure_unique(dir.path(), "notes", None).is_ok());
        assert!(ensure_unique(dir.path(), "Hidden", None).is_ok());
        // Renaming an entry to a different case of its own name is fine.
        let own = dir.path().join("Intro.qcdoc");
        assert!(ensure_unique(dir.path(), "intro", Some(&own)).is_ok());
    }

    #[test]
    fn test_unique_name_counts_up() {
        let dir = TempDir::new().unwrap();
        assert_eq!(unique_name(dir.path(), "Intro").unwrap(), "Intro");
        fs::write(dir.path().join("Intro.qcdoc"), b"{}").unwrap();
        fs::create_dir(dir.path().join("intro (2)")).unwrap();
        assert_eq!(unique_name(dir.path(), "Intro").unwrap(), "Intro (3)");
    }

    #[test]
    fn test_missing_parent() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("nope");
        assert!(matches!(
            ensure_unique(&missing, "a", None),
            Err(Error::NotFound(_))
        ));
        assert_eq!(unique_name(&missing, "a").unwrap(), "a");
    }
}
