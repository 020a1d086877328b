//! Favorites set.
//!
//! Stored as `{"favorites": [...]}` with paths relative to the library root,
//! using `/` separators so the record survives moving the library.

use crate::error::{Error, Result, ResultExt};
use crate::storage::atomic::write_atomic;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Component, Path, PathBuf};

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
struct FavoritesRecord {
    favorites: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct Favorites {
    /// Where the record is persisted; `None` keeps the set in memory only.
    file: Option<PathBuf>,
    root: PathBuf,
    entries: BTreeSet<String>,
}

impl Favorites {
    /// An empty set that is never written to disk.
    pub fn in_memory(root: impl Into<PathBuf>) -> Self {
        Self {
            file: None,
            root: root.into(),
            entries: BTreeSet::new(),
        }
    }

    /// Load the record at `file`, dropping entries whose document no longer
    /// exists. A missing or unreadable record yields an empty set.
    pub fn load(file: impl Into<PathBuf>, root: impl Into<PathBuf>) -> Self {
        let file = file.into();
        let root = root.into();
        let record = read_record(&file)
            .unwrap_or_warn_default(FavoritesRecord::default(), "Failed to load favorites");

        let mut favorites = Self {
            file: Some(file),
            root,
            entries: record.favorites.into_iter().collect(),
        };
        let pruned = favorites.prune();
        if pruned > 0 {
            info!("Pruned {} stale favorite(s)", pruned);
            favorites
                .save()
                .unwrap_or_warn_default((), "Failed to save pruned favorites");
        }
        favorites
    }

    /// Remove entries that no longer point at a document. Returns how many.
    pub fn prune(&mut self) -> usize {
        let before = self.entries.len();
        let root = self.root.clone();
        self.entries
            .retain(|key| from_key(&root, key).map(|p| p.is_file()).unwrap_or(false));
        before - self.entries.len()
    }

    pub fn save(&self) -> Result<()> {
        let Some(file) = &self.file else {
            return Ok(());
        };
        if let Some(parent) = file.parent() {
            fs::create_dir_all(parent).map_err(|e| Error::FileWrite {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }
        let record = FavoritesRecord {
            favorites: self.entries.iter().cloned().collect(),
        };
        let json = serde_json::to_string_pretty(&record)?;
        write_atomic(file, json.as_bytes())?;
        debug!("Saved {} favorite(s) to {}", self.entries.len(), file.display());
        Ok(())
    }

    pub fn contains(&self, document: &Path) -> bool {
        to_key(&self.root, document)
            .map(|key| self.entries.contains(&key))
            .unwrap_or(false)
    }

    /// Add or remove a document. Returns whether the set changed.
    pub fn set(&mut self, document: &Path, favorite: bool) -> Result<bool> {
        let key = to_key(&self.root, document)
            .ok_or_else(|| Error::NotFound(document.to_path_buf()))?;
        let changed = if favorite {
            self.entries.insert(key)
        } else {
            self.entries.remove(&key)
        };
        if changed {
            self.save()?;
        }
        Ok(changed)
    }

    /// Flip membership of a document. Returns the new state.
    pub fn toggle(&mut self, document: &Path) -> Result<bool> {
        let now = !self.contains(document);
        self.set(document, now)?;
        Ok(now)
    }

    /// Absolute paths of all favorites, sorted.
    pub fn list(&self) -> Vec<PathBuf> {
        self.entries
            .iter()
            .filter_map(|key| from_key(&self.root, key))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Follow a rename or move of `from` (a document or a folder) to `to`.
    pub fn relocate(&mut self, from: &Path, to: &Path) -> Result<()> {
        let (Some(from_key_prefix), Some(to_key_prefix)) =
            (to_key(&self.root, from), to_key(&self.root, to))
        else {
            return Ok(());
        };
        let moved: Vec<String> = self
            .entries
            .iter()
            .filter(|key| is_under(key, &from_key_prefix))
            .cloned()
            .collect();
        if moved.is_empty() {
            return Ok(());
        }
        for key in moved {
            self.entries.remove(&key);
            let rest = &key[from_key_prefix.len()..];
            self.entries.insert(format!("{}{}", to_key_prefix, rest));
        }
        self.save()
    }

    /// Drop `path` (a document or a folder) and everything below it.
    pub fn remove_under(&mut self, path: &Path) -> Result<()> {
        let Some(prefix) = to_key(&self.root, path) else {
            return Ok(());
        };
        let before = self.entries.len();
        self.entries.retain(|key| !is_under(key, &prefix));
        if self.entries.len() != before {
            self.save()?;
        }
        Ok(())
    }
}

fn read_record(file: &Path) -> Result<FavoritesRecord> {
    match fs::read_to_string(file) {
        Ok(contents) if contents.trim().is_empty() => Ok(FavoritesRecord::default()),
        Ok(contents) => Ok(serde_json::from_str(&contents)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(FavoritesRecord::default()),
        Err(e) => Err(Error::FileRead {
            path: file.to_path_buf(),
            source: e,
        }),
    }
}

/// `key` equals `prefix` or lies below it.
fn is_under(key: &str, prefix: &str) -> bool {
    key == prefix || key.starts_with(&format!("{}/", prefix))
}

/// Relative `/`-separated key for an absolute path under `root`.
fn to_key(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let parts: Vec<String> = relative
        .components()
        .map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect::<Option<_>>()?;
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("/"))
    }
}

/// Absolute path for a stored key. Keys that try to escape the root are ignored.
fn from_key(root: &Path, key: &str) -> Option<PathBuf> {
    let mut path = root.to_path_buf();
    for part in key.split('/') {
        if part.is_empty() || part == "." || part == ".." {
            return None;
        }
        path.push(part);
    }
    Some(path)
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    struct Env {
        _dir: TempDir,
        root: PathBuf,
        file: PathBuf,
    }

    fn env() -> Env {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("library");
        fs::create_dir_all(root.join("work")).unwrap();
        fs::write(root.join("work/Intro.qcdoc"), b"{}").unwrap();
        fs::write(root.join("Closing.qcdoc"), b"{}").unwrap();
        let file = dir.path().join("config/favorites.json");
        Env {
            _dir: dir,
            root,
            file,
        }
    }

    #[test]
    fn test_toggle_and_persist() {
        let env = env();
        let intro = env.root.join("work/Intro.qcdoc");
        let mut favorites = Favorites::load(&env.file, &env.root);
        assert!(favorites.is_empty());

        assert!(favorites.toggle(&intro).unwrap());
        assert!(favorites.contains(&intro));
        let raw = fs::read_to_string(&env.file).unwrap();
        assert!(raw.contains("work/Intro.qcdoc"));

        let reloaded = Favorites::load(&env.file, &env.root);
        assert_eq!(reloaded.list(), vec![intro.clone()]);

        assert!(!favorites.toggle(&intro).unwrap());
        assert!(Favorites::load(&env.file, &env.root).is_empty());
    }

    #[test]
    fn test_stale_entries_pruned_on_load() {
        let env = env();
        fs::create_dir_all(env.file.parent().unwrap()).unwrap();
        fs::write(
            &env.file,
            r#"{"favorites": ["Closing.qcdoc", "gone/Missing.qcdoc", "../outside.qcdoc"]}"#,
        )
        .unwrap();

        let favorites = Favorites::load(&env.file, &env.root);
        assert_eq!(favorites.list(), vec![env.root.join("Closing.qcdoc")]);
        let raw = fs::read_to_string(&env.file).unwrap();
        assert!(!raw.contains("Missing"));
    }

    #[test]
    fn test_corrupt_record_yields_empty_set() {
        let env = env();
        fs::create_dir_all(env.file.parent().unwrap()).unwrap();
        fs::write(&env.file, "not json").unwrap();
        assert!(Favorites::load(&env.file, &env.root).is_empty());
    }

    #[test]
    fn test_relocate_folder_and_remove_under() {
        let env = env();
        let mut favorites = Favorites::load(&env.file, &env.root);
        favorites.set(&env.root.join("work/Intro.qcdoc"), true).unwrap();
        favorites.set(&env.root.join("Closing.qcdoc"), true).unwrap();

        favorites
            .relocate(&env.root.join("work"), &env.root.join("jobs"))
            .unwrap();
        assert!(favorites.contains(&env.root.join("jobs/Intro.qcdoc")));
        assert!(favorites.contains(&env.root.join("Closing.qcdoc")));

        favorites.remove_under(&env.root.join("jobs")).unwrap();
        assert_eq!(favorites.list(), vec![env.root.join("Closing.qcdoc")]);
    }

    #[test]
    fn test_prefix_does_not_match_sibling_names() {
        let env = env();
        let mut favorites = Favorites::in_memory(&env.root);
        favorites.set(&env.root.join("workshop/A.qcdoc"), true).unwrap();
        favorites
            .relocate(&env.root.join("work"), &env.root.join("jobs"))
            .unwrap();
        assert!(favorites.contains(&env.root.join("workshop/A.qcdoc")));
    }

    #[test]
    fn test_paths_outside_root_rejected() {
        let env = env();
        let mut favorites = Favorites::in_memory(&env.root);
        assert!(matches!(
            favorites.set(Path::new("/somewhere/else.qcdoc"), true),
            Err(Error::NotFound(_))
        ));
    }
}
