//! Folder bundles: a whole folder subtree in one JSON file, for sharing
//! scripts between machines.
//!
//! Imports are staged in a hidden folder and moved into place with one rename,
//! so a failed import leaves nothing behind in the library.

use super::legacy;
use super::{atomic, document_path, DocumentRecord};
use crate::document::SectionId;
use crate::error::{Error, Result};
use crate::library::names::{entry_name, normalize_name, unique_name, UNTITLED};
use crate::storage;
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Newest bundle layout this build reads and the one it writes.
pub const BUNDLE_VERSION: u64 = 1;

/// File extension of bundle files.
pub const BUNDLE_EXTENSION: &str = "qcbundle";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bundle {
    pub bundle_version: u64,
    pub exported_at: DateTime<Utc>,
    pub root: BundleFolder,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BundleFolder {
    pub name: String,
    #[serde(default)]
    pub folders: Vec<BundleFolder>,
    #[serde(default)]
    pub documents: Vec<DocumentRecord>,
}

/// Counts of what a bundle contains, root folder included.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BundleSummary {
    pub folders: usize,
    pub documents: usize,
}

// ─────────────────────────────────────────────────────────────────────────────
// Export
// ─────────────────────────────────────────────────────────────────────────────

/// Write `folder` and everything below it to `file`.
///
/// Every document must load cleanly; a damaged one aborts the export.
pub fn export_folder(folder: &Path, file: &Path) -> Result<BundleSummary> {
    let mut summary = BundleSummary::default();
    let root = collect_folder(folder, &mut summary)?;
    let bundle = Bundle {
        bundle_version: BUNDLE_VERSION,
        exported_at: Utc::now(),
        root,
    };
    let json = serde_json::to_vec_pretty(&bundle)?;
    atomic::write_atomic(file, &json)?;
    info!(
        "Exported {} folder(s) and {} document(s) to {}",
        summary.folders,
        summary.documents,
        file.display()
    );
    Ok(summary)
}

fn collect_folder(folder: &Path, summary: &mut BundleSummary) -> Result<BundleFolder> {
    let read_dir = fs::read_dir(folder).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => Error::NotFound(folder.to_path_buf()),
        _ => Error::FileRead {
            path: folder.to_path_buf(),
            source: e,
        },
    })?;

    let mut entries: Vec<(String, PathBuf, bool)> = read_dir
        .flatten()
        .filter_map(|entry| {
            let path = entry.path();
            let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
            entry_name(&path, is_dir).map(|name| (name, path, is_dir))
        })
        .collect();
    entries.sort_by_key(|(name, _, _)| name.to_lowercase());

    summary.folders += 1;
    let mut bundle_folder = BundleFolder {
        name: folder
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| UNTITLED.to_string()),
        folders: Vec::new(),
        documents: Vec::new(),
    };
    for (_, path, is_dir) in entries {
        if is_dir {
            bundle_folder.folders.push(collect_folder(&path, summary)?);
        } else {
            let document = storage::load(&path)?;
            bundle_folder
                .documents
                .push(DocumentRecord::from_document(&document));
            summary.documents += 1;
        }
    }
    Ok(bundle_folder)
}

// ─────────────────────────────────────────────────────────────────────────────
// Import
// ─────────────────────────────────────────────────────────────────────────────

/// Import the bundle in `file` as a new folder under `target`.
///
/// The folder is renamed "Name (2)" and so on when its name is taken. Every
/// copy section gets a fresh id. Bundles written by the old single-database
/// application (`{bundle_root_id, nodes}`) are accepted too.
pub fn import_bundle(file: &Path, target: &Path) -> Result<(PathBuf, BundleSummary)> {
    let bytes = fs::read(file).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => Error::NotFound(file.to_path_buf()),
        _ => Error::FileRead {
            path: file.to_path_buf(),
            source: e,
        },
    })?;
    let value: Value = serde_json::from_slice(&bytes)
        .map_err(|e| Error::corrupt(file, format!("invalid JSON: {}", e)))?;

    if !target.is_dir() {
        return Err(Error::NotFound(target.to_path_buf()));
    }
    let staging = target.join(format!(".import.{}", Uuid::new_v4().simple()));
    fs::create_dir(&staging).map_err(|e| Error::FileWrite {
        path: staging.clone(),
        source: e,
    })?;

    let result = stage(file, &value, &staging).and_then(|(staged, summary)| {
        let name = staged
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| UNTITLED.to_string());
        let final_path = target.join(unique_name(target, &name)?);
        fs::rename(&staged, &final_path).map_err(|e| Error::FileWrite {
            path: final_path.clone(),
            source: e,
        })?;
        Ok((final_path, summary))
    });

    if let Err(e) = fs::remove_dir_all(&staging) {
        warn!("Failed to remove import staging folder {}: {}", staging.display(), e);
    }
    if let Ok((path, summary)) = &result {
        info!(
            "Imported {} folder(s) and {} document(s) into {}",
            summary.folders,
            summary.documents,
            path.display()
        );
    }
    result
}

/// Materialize the bundle inside `staging`. Returns the created root folder.
fn stage(file: &Path, value: &Value, staging: &Path) -> Result<(PathBuf, BundleSummary)> {
    if let Some(version) = value.get("bundle_version") {
        let version = version
            .as_u64()
            .ok_or_else(|| Error::corrupt(file, "bundle_version is not a positive integer"))?;
        if version > BUNDLE_VERSION {
            return Err(Error::VersionMismatch {
                path: file.to_path_buf(),
                found: version,
                supported: BUNDLE_VERSION,
            });
        }
        let bundle: Bundle = serde_json::from_value(value.clone())
            .map_err(|e| Error::corrupt(file, e.to_string()))?;
        let mut summary = BundleSummary::default();
        let root = write_folder(file, &bundle.root, staging, &mut summary)?;
        return Ok((root, summary));
    }

    let root_id = value.get("bundle_root_id").and_then(Value::as_str);
    let nodes = value
        .get("nodes")
        .and_then(|n| serde_json::from_value::<HashMap<String, Value>>(n.clone()).ok());
    match (root_id, nodes) {
        (Some(root_id), Some(nodes)) => {
            debug!("Importing old-style bundle {}", file.display());
            let (root, report) = legacy::import_subtree(&nodes, root_id, staging)?;
            Ok((
                root,
                BundleSummary {
                    folders: report.folders_created,
                    documents: report.documents_created,
                },
            ))
        }
        _ => Err(Error::corrupt(file, "not a QuickCopy bundle")),
    }
}

fn write_folder(
    file: &Path,
    folder: &BundleFolder,
    parent: &Path,
    summary: &mut BundleSummary,
) -> Result<PathBuf> {
    let name = unique_name(parent, &import_name(&folder.name))?;
    let path = parent.join(&name);
    fs::create_dir(&path).map_err(|e| Error::FileWrite {
        path: path.clone(),
        source: e,
    })?;
    summary.folders += 1;

    for record in &folder.documents {
        let name = unique_name(&path, &import_name(&record.name))?;
        let doc_path = document_path(&path, &name);
        let mut record = record.clone();
        record.name = name;
        record.favorite = false;
        for section in &mut record.copy_sections {
            section.id = SectionId::new();
        }
        let document = record
            .into_document(&doc_path)
            .map_err(|message| Error::corrupt(file, message))?;
        storage::save(&document)?;
        summary.documents += 1;
    }
    for child in &folder.folders {
        write_folder(file, child, &path, summary)?;
    }
    Ok(path)
}

/// Bundle names come from another machine; fall back rather than fail.
fn import_name(raw: &str) -> String {
    normalize_name(raw).unwrap_or_else(|_| UNTITLED.to_string())
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{Document, Mutation, SectionTarget};
    use crate::lock::LockStatus;
    use serde_json::json;
    use tempfile::TempDir;

    fn write_doc(folder: &Path, name: &str, text: &str) -> Document {
        let path = document_path(folder, name);
        let mut document = Document::new(name, &path);
        let id = document.section_ids()[0];
        document
            .edit(
                Mutation::InsertText {
                    target: SectionTarget::Copy(id),
                    position: 0,
                    text: text.to_string(),
                },
                &LockStatus::HeldByUs,
            )
            .unwrap();
        storage::save(&document).unwrap();
        document
    }

    fn sample(dir: &Path) -> PathBuf {
        let folder = dir.join("library/Scripts");
        fs::create_dir_all(folder.join("Closings")).unwrap();
        write_doc(&folder, "Intro", "Hello");
        write_doc(&folder.join("Closings"), "Thanks", "Thank you");
        fs::write(folder.join(".Intro.qcdoc.lock"), b"{}").unwrap();
        folder
    }

    #[test]
    fn test_export_then_import_elsewhere() {
        let dir = TempDir::new().unwrap();
        let folder = sample(dir.path());
        let file = dir.path().join("scripts.qcbundle");

        let exported = export_folder(&folder, &file).unwrap();
        assert_eq!(exported, BundleSummary { folders: 2, documents: 2 });

        let target = dir.path().join("other");
        fs::create_dir(&target).unwrap();
        let (root, imported) = import_bundle(&file, &target).unwrap();
        assert_eq!(root, target.join("Scripts"));
        assert_eq!(imported, exported);

        let original = storage::load(&folder.join("Intro.qcdoc")).unwrap();
        let copy = storage::load(&root.join("Intro.qcdoc")).unwrap();
        assert_eq!(copy.copy_text_at(0).unwrap(), "Hello");
        assert_ne!(copy.section_ids(), original.section_ids());
        assert!(root.join("Closings/Thanks.qcdoc").exists());
        assert!(!root.join(".Intro.qcdoc.lock").exists());
    }

    #[test]
    fn test_import_renames_on_collision() {
        let dir = TempDir::new().unwrap();
        let folder = sample(dir.path());
        let file = dir.path().join("scripts.qcbundle");
        export_folder(&folder, &file).unwrap();

        let parent = folder.parent().unwrap();
        let (root, _) = import_bundle(&file, parent).unwrap();
        assert_eq!(root, parent.join("Scripts (2)"));
        let (root, _) = import_bundle(&file, parent).unwrap();
        assert_eq!(root, parent.join("Scripts (3)"));

        let leftovers: Vec<_> = fs::read_dir(parent)
            .unwrap()
            .flatten()
            .filter(|e| e.file_name().to_string_lossy().starts_with(".import."))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_newer_bundle_refused() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("future.qcbundle");
        fs::write(
            &file,
            json!({"bundle_version": BUNDLE_VERSION + 1, "exported_at": Utc::now(), "root": {"name": "X"}})
                .to_string(),
        )
        .unwrap();
        assert!(matches!(
            import_bundle(&file, dir.path()),
            Err(Error::VersionMismatch { .. })
        ));
        assert!(!dir.path().join("X").exists());
    }

    #[test]
    fn test_broken_document_leaves_nothing() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("broken.qcbundle");
        fs::write(
            &file,
            json!({
                "bundle_version": 1,
                "exported_at": Utc::now(),
                "root": {"name": "Broken", "documents": [{
                    "name": "Empty", "read_only_section": [], "copy_sections": [],
                    "last_modified": Utc::now()
                }]}
            })
            .to_string(),
        )
        .unwrap();
        let target = dir.path().join("target");
        fs::create_dir(&target).unwrap();
        assert!(matches!(
            import_bundle(&file, &target),
            Err(Error::CorruptFile { .. })
        ));
        assert_eq!(fs::read_dir(&target).unwrap().count(), 0);
    }

    #[test]
    fn test_old_style_bundle() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("old.json");
        fs::write(
            &file,
            json!({
                "bundle_root_id": "f",
                "nodes": {
                    "f": {"id": "f", "type": "folder", "name": "Shared", "children": ["d"]},
                    "d": {"id": "d", "type": "file", "name": "Greeting", "children": [],
                          "content": {"read_rich": {"text": "", "tags": []},
                                      "copy_blocks": [{"text": "Hi", "tags": []}, "plain"]}}
                }
            })
            .to_string(),
        )
        .unwrap();
        let (root, summary) = import_bundle(&file, dir.path()).unwrap();
        assert_eq!(root, dir.path().join("Shared"));
        assert_eq!(summary, BundleSummary { folders: 1, documents: 1 });
        let document = storage::load(&root.join("Greeting.qcdoc")).unwrap();
        assert_eq!(document.copy_text_at(1).unwrap(), "plain");
    }

    #[test]
    fn test_export_refuses_damaged_document() {
        let dir = TempDir::new().unwrap();
        let folder = sample(dir.path());
        fs::write(folder.join("Bad.qcdoc"), b"{oops").unwrap();
        assert!(matches!(
            export_folder(&folder, &dir.path().join("x.qcbundle")),
            Err(Error::CorruptFile { .. })
        ));
    }
}
