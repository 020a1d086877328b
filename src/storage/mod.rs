//! Storage codec for QuickCopy documents
//!
//! Documents live in `<name>.qcdoc` files holding versioned JSON. Saving goes
//! through [`atomic::write_atomic`]; loading is strict and never repairs a file
//! on its own. Damaged files can be recovered with [`repair`], which the shell
//! only offers after an explicit user confirmation.

pub mod atomic;
pub mod bundle;
mod format;
pub mod legacy;

pub use format::{DocumentFile, DocumentRecord, SectionRecord, FORMAT_VERSION};

use crate::document::{CopySection, Document, SectionId};
use crate::error::{Error, Result};
use crate::richtext::RichText;
use chrono::Utc;
use format::LenientFile;
use log::{debug, info, warn};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// File extension of document files.
pub const DOCUMENT_EXTENSION: &str = "qcdoc";

// ─────────────────────────────────────────────────────────────────────────────
// Paths
// ─────────────────────────────────────────────────────────────────────────────

/// Whether `path` looks like a document file.
pub fn is_document_path(path: &Path) -> bool {
    path.extension()
        .map(|ext| ext.eq_ignore_ascii_case(DOCUMENT_EXTENSION))
        .unwrap_or(false)
}

/// Path of the document called `name` inside `folder`.
pub fn document_path(folder: &Path, name: &str) -> PathBuf {
    folder.join(format!("{}.{}", name, DOCUMENT_EXTENSION))
}

/// Display name of a document file: its file stem.
pub fn document_name(path: &Path) -> Option<String> {
    path.file_stem().map(|s| s.to_string_lossy().into_owned())
}

/// Hex SHA-256 of a serialized payload.
pub fn checksum(bytes: &[u8]) -> String {
    Sha256::digest(bytes)
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

// ─────────────────────────────────────────────────────────────────────────────
// Save
// ─────────────────────────────────────────────────────────────────────────────

/// Serialize a document to its file representation.
pub fn encode(document: &Document) -> Result<Vec<u8>> {
    let file = DocumentFile {
        format_version: FORMAT_VERSION,
        record: DocumentRecord::from_document(document),
    };
    serde_json::to_vec_pretty(&file).map_err(|e| Error::FileWrite {
        path: document.path().to_path_buf(),
        source: io::Error::new(io::ErrorKind::InvalidData, e),
    })
}

/// Save a document to its path atomically and return the payload checksum.
pub fn save(document: &Document) -> Result<String> {
    let bytes = encode(document)?;
    atomic::write_atomic(document.path(), &bytes)?;
    debug!("Saved document '{}'", document.path().display());
    Ok(checksum(&bytes))
}

// ─────────────────────────────────────────────────────────────────────────────
// Load
// ─────────────────────────────────────────────────────────────────────────────

fn read_bytes(path: &Path) -> Result<Vec<u8>> {
    fs::read(path).map_err(|e| match e.kind() {
        io::ErrorKind::NotFound => Error::NotFound(path.to_path_buf()),
        _ => Error::FileRead {
            path: path.to_path_buf(),
            source: e,
        },
    })
}

fn parse_json(path: &Path, bytes: &[u8]) -> Result<Value> {
    serde_json::from_slice(bytes).map_err(|e| Error::corrupt(path, format!("invalid JSON: {}", e)))
}

/// Read `format_version` before anything else so newer files fail closed.
fn check_version(path: &Path, value: &Value) -> Result<u64> {
    let version = value
        .get("format_version")
        .ok_or_else(|| Error::corrupt(path, "missing format_version"))?
        .as_u64()
        .filter(|v| *v > 0)
        .ok_or_else(|| Error::corrupt(path, "format_version is not a positive integer"))?;
    if version > FORMAT_VERSION {
        return Err(Error::VersionMismatch {
            path: path.to_path_buf(),
            found: version,
            supported: FORMAT_VERSION,
        });
    }
    Ok(version)
}

/// Load a document, rejecting malformed files and files from newer versions.
pub fn load(path: &Path) -> Result<Document> {
    let bytes = read_bytes(path)?;
    let value = parse_json(path, &bytes)?;
    check_version(path, &value)?;

    let file: DocumentFile =
        serde_json::from_value(value).map_err(|e| Error::corrupt(path, e.to_string()))?;
    let mut document = file
        .record
        .into_document(path)
        .map_err(|message| Error::corrupt(path, message))?;

    // The file name wins over the stored name after an outside rename.
    if let Some(stem) = document_name(path) {
        if stem != document.name {
            debug!(
                "Stored name '{}' differs from file name '{}'",
                document.name, stem
            );
            document.name = stem;
        }
    }

    document.set_saved_checksum(checksum(&bytes));
    debug!("Loaded document '{}'", path.display());
    Ok(document)
}

// ─────────────────────────────────────────────────────────────────────────────
// Repair & Inspect
// ─────────────────────────────────────────────────────────────────────────────

/// A document recovered by [`repair`], not yet written to disk.
#[derive(Debug, Clone)]
pub struct RepairReport {
    pub document: Document,
    /// Human-readable list of what was changed.
    pub actions: Vec<String>,
}

impl RepairReport {
    pub fn changed(&self) -> bool {
        !self.actions.is_empty()
    }
}

/// Leniently load a damaged document and fix what can be fixed.
///
/// Refuses files from newer format versions and files that are not JSON.
pub fn repair(path: &Path) -> Result<RepairReport> {
    let bytes = read_bytes(path)?;
    let value = parse_json(path, &bytes)?;
    let mut actions = Vec::new();

    match check_version(path, &value) {
        Ok(_) => {}
        Err(e @ Error::VersionMismatch { .. }) => return Err(e),
        Err(_) => actions.push(format!("assumed format version {}", FORMAT_VERSION)),
    }

    let file: LenientFile = serde_json::from_value(value)
        .map_err(|e| Error::corrupt(path, format!("cannot be repaired: {}", e)))?;

    let name = document_name(path).unwrap_or_else(|| "Untitled".to_string());
    if file.name.as_deref() != Some(name.as_str()) {
        actions.push(format!("set name to '{}'", name));
    }

    let read_only = RichText::from_runs(file.read_only_section.clone()).normalized();
    if read_only.spans() != file.read_only_section.as_slice() {
        actions.push("normalized read-only section".to_string());
    }

    let mut records: Vec<_> = file.copy_sections.into_iter().enumerate().collect();
    records.sort_by_key(|(index, r)| (r.order.unwrap_or(u32::MAX), *index));

    let mut seen = HashSet::new();
    let mut sections = Vec::with_capacity(records.len());
    for (position, (_, record)) in records.into_iter().enumerate() {
        let id = match record.id {
            Some(id) if seen.insert(id) => id,
            Some(id) => {
                let fresh = SectionId::new();
                seen.insert(fresh);
                actions.push(format!("assigned new id to duplicate section {}", id));
                fresh
            }
            None => {
                let fresh = SectionId::new();
                seen.insert(fresh);
                actions.push(format!("assigned id to section at position {}", position));
                fresh
            }
        };
        if record.order != Some(position as u32) {
            actions.push(format!("renumbered section {} to {}", id, position));
        }
        let rich_text = RichText::from_runs(record.spans.clone()).normalized();
        if rich_text.spans() != record.spans.as_slice() {
            actions.push(format!("normalized copy section {}", id));
        }
        sections.push(CopySection {
            id,
            rich_text,
            order: position as u32,
        });
    }
    if sections.is_empty() {
        actions.push("added an empty copy section".to_string());
        sections.push(CopySection {
            id: SectionId::new(),
            rich_text: RichText::new(),
            order: 0,
        });
    }

    let last_modified = file.last_modified.unwrap_or_else(|| {
        actions.push("reset last modified time".to_string());
        Utc::now()
    });

    if actions.is_empty() {
        info!("Repair found nothing to fix in {}", path.display());
    } else {
        warn!("Repairing {}: {}", path.display(), actions.join("; "));
    }

    Ok(RepairReport {
        document: Document {
            name,
            path: path.to_path_buf(),
            read_only,
            sections,
            locked: file.locked,
            favorite: file.favorite,
            autosave: file.autosave,
            last_modified,
            last_saved_checksum: None,
        },
        actions,
    })
}

/// Best-effort summary of a document file, for files that may not load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileSummary {
    pub name: Option<String>,
    pub format_version: Option<u64>,
    pub copy_sections: Option<usize>,
    pub locked: Option<bool>,
    /// Why a strict load fails, if it does.
    pub problem: Option<String>,
}

impl FileSummary {
    pub fn is_loadable(&self) -> bool {
        self.problem.is_none()
    }
}

/// Summarize a document file without requiring it to be valid.
pub fn inspect(path: &Path) -> Result<FileSummary> {
    let bytes = read_bytes(path)?;
    let problem = load(path).err().map(|e| e.to_string());

    let summary = match serde_json::from_slice::<Value>(&bytes) {
        Ok(value) => FileSummary {
            name: value.get("name").and_then(Value::as_str).map(String::from),
            format_version: value.get("format_version").and_then(Value::as_u64),
            copy_sections: value
                .get("copy_sections")
                .and_then(Value::as_array)
                .map(Vec::len),
            locked: value.get("locked").and_then(Value::as_bool),
            problem,
        },
        Err(_) => FileSummary {
            name: None,
            format_version: None,
            copy_sections: None,
            locked: None,
            problem,
        },
    };
    Ok(summary)
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{Mutation, SectionTarget};
    use crate::lock::LockStatus;
    use crate::richtext::AttributePatch;
    use serde_json::json;
    use tempfile::TempDir;

    fn sample(dir: &Path) -> Document {
        let mut doc = Document::new("Intro", document_path(dir, "Intro"));
        let lock = LockStatus::HeldByUs;
        doc.edit(
            Mutation::ReplaceSection {
                target: SectionTarget::ReadOnly,
                text: RichText::plain("Greet the caller"),
            },
            &lock,
        )
        .unwrap();
        let id = doc.section_ids()[0];
        doc.edit(
            Mutation::InsertText {
                target: SectionTarget::Copy(id),
                position: 0,
                text: "Hello".into(),
            },
            &lock,
        )
        .unwrap();
        doc.edit(
            Mutation::ApplyFormatting {
                target: SectionTarget::Copy(id),
                range: 0..5,
                patch: AttributePatch::bold(true),
            },
            &lock,
        )
        .unwrap();
        doc.edit(Mutation::AddCopySection { after: None }, &lock)
            .unwrap();
        doc
    }

    fn write_json(path: &Path, value: &Value) {
        fs::write(path, serde_json::to_vec(value).unwrap()).unwrap();
    }

    fn valid_json() -> Value {
        json!({
            "format_version": 1,
            "name": "Doc",
            "read_only_section": [],
            "copy_sections": [
                {"id": "6f1c1b1e-1d7a-4a55-9b89-0f3c3f8c2b10", "order": 0, "spans": [{"text": "a"}]},
                {"id": "0b7f3c1e-5a2d-4e4f-8a55-7d6c1b9e2f31", "order": 1, "spans": []}
            ],
            "locked": false,
            "favorite": false,
            "last_modified": "2024-05-01T10:00:00Z"
        })
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Save / Load
    // ─────────────────────────────────────────────────────────────────────────

    #[test]
    fn test_save_then_load_is_equal() {
        let dir = TempDir::new().unwrap();
        let doc = sample(dir.path());
        let checksum = save(&doc).unwrap();

        let loaded = load(doc.path()).unwrap();
        assert!(loaded.content_eq(&doc));
        assert_eq!(loaded.last_saved_checksum(), Some(checksum.as_str()));

        let spans = loaded.copy_sections()[0].rich_text().spans();
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].text, "Hello");
        assert!(spans[0].attrs.bold);
    }

    #[test]
    fn test_saved_file_shape() {
        let dir = TempDir::new().unwrap();
        let doc = sample(dir.path());
        save(&doc).unwrap();
        let value: Value = serde_json::from_slice(&fs::read(doc.path()).unwrap()).unwrap();
        assert_eq!(value["format_version"], json!(1));
        assert_eq!(value["name"], json!("Intro"));
        assert_eq!(value["copy_sections"][1]["order"], json!(1));
        assert_eq!(
            value["copy_sections"][0]["spans"][0],
            json!({"text": "Hello", "bold": true, "underline": false})
        );
    }

    #[test]
    fn test_autosave_override_is_stored_only_when_set() {
        let dir = TempDir::new().unwrap();
        let mut doc = sample(dir.path());
        save(&doc).unwrap();
        let value: Value = serde_json::from_slice(&fs::read(doc.path()).unwrap()).unwrap();
        assert!(value.get("autosave").is_none());
        assert_eq!(load(doc.path()).unwrap().autosave_override(), None);

        doc.edit(Mutation::SetAutosave(Some(true)), &LockStatus::HeldByUs)
            .unwrap();
        save(&doc).unwrap();
        let loaded = load(doc.path()).unwrap();
        assert_eq!(loaded.autosave_override(), Some(true));
        assert!(loaded.content_eq(&doc));
    }

    #[test]
    fn test_newer_version_fails_closed() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("future.qcdoc");
        write_json(&path, &json!({"format_version": 7, "whatever": [1, 2, 3]}));
        match load(&path) {
            Err(Error::VersionMismatch {
                found, supported, ..
            }) => {
                assert_eq!(found, 7);
                assert_eq!(supported, FORMAT_VERSION);
            }
            other => panic!("expected version mismatch, got {:?}", other),
        }
        assert!(matches!(repair(&path), Err(Error::VersionMismatch { .. })));
    }

    #[test]
    fn test_load_rejects_structural_violations() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("Doc.qcdoc");

        let mut cases: Vec<Value> = Vec::new();
        let mut v = valid_json();
        v.as_object_mut().unwrap().remove("format_version");
        cases.push(v);
        let mut v = valid_json();
        v["copy_sections"][1]["order"] = json!(0);
        cases.push(v);
        let mut v = valid_json();
        v["copy_sections"][1]["order"] = json!(5);
        cases.push(v);
        let mut v = valid_json();
        v["copy_sections"][1]["id"] = v["copy_sections"][0]["id"].clone();
        cases.push(v);
        let mut v = valid_json();
        v["copy_sections"] = json!([]);
        cases.push(v);
        let mut v = valid_json();
        v["read_only_section"] = json!([{"text": "a"}, {"text": "b"}]);
        cases.push(v);
        let mut v = valid_json();
        v["read_only_section"] = json!([{"text": "a", "font_size": 2}]);
        cases.push(v);

        for case in cases {
            write_json(&path, &case);
            let err = load(&path).unwrap_err();
            assert!(
                matches!(err, Error::CorruptFile { .. }),
                "case {} gave {:?}",
                case,
                err
            );
        }

        fs::write(&path, b"{not json").unwrap();
        assert!(matches!(load(&path), Err(Error::CorruptFile { .. })));
        write_json(&path, &valid_json());
        assert!(load(&path).is_ok());
    }

    #[test]
    fn test_missing_file_is_not_found() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            load(&dir.path().join("nope.qcdoc")),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_file_name_wins_over_stored_name() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("Renamed.qcdoc");
        write_json(&path, &valid_json());
        assert_eq!(load(&path).unwrap().name(), "Renamed");
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Repair / Inspect
    // ─────────────────────────────────────────────────────────────────────────

    #[test]
    fn test_repair_fixes_what_load_rejects() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("Doc.qcdoc");
        let mut v = valid_json();
        v["copy_sections"][1]["id"] = v["copy_sections"][0]["id"].clone();
        v["copy_sections"][1]["order"] = json!(9);
        v["read_only_section"] = json!([{"text": "a"}, {"text": ""}, {"text": "b"}]);
        write_json(&path, &v);
        assert!(load(&path).is_err());

        let report = repair(&path).unwrap();
        assert!(report.changed());
        let doc = &report.document;
        assert_eq!(doc.read_only_section().spans().len(), 1);
        assert_eq!(doc.read_only_section().plain_text(), "ab");
        assert_eq!(doc.copy_sections().len(), 2);
        assert_ne!(doc.copy_sections()[0].id(), doc.copy_sections()[1].id());
        assert_eq!(doc.copy_sections()[1].order(), 1);

        // Repair does not write; saving the report makes the file loadable.
        assert!(load(&path).is_err());
        save(doc).unwrap();
        assert!(load(&path).unwrap().content_eq(doc));
    }

    #[test]
    fn test_repair_of_valid_file_changes_nothing() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("Doc.qcdoc");
        write_json(&path, &valid_json());
        let report = repair(&path).unwrap();
        assert!(!report.changed(), "{:?}", report.actions);
    }

    #[test]
    fn test_repair_adds_missing_section() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("Doc.qcdoc");
        write_json(&path, &json!({"name": "Doc"}));
        let report = repair(&path).unwrap();
        assert_eq!(report.document.copy_sections().len(), 1);
        assert!(report.actions.iter().any(|a| a.contains("format version")));
    }

    #[test]
    fn test_inspect_summarizes_broken_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("Doc.qcdoc");
        let mut v = valid_json();
        v["locked"] = json!(true);
        v["copy_sections"] = json!([]);
        write_json(&path, &v);

        let summary = inspect(&path).unwrap();
        assert_eq!(summary.name.as_deref(), Some("Doc"));
        assert_eq!(summary.format_version, Some(1));
        assert_eq!(summary.copy_sections, Some(0));
        assert_eq!(summary.locked, Some(true));
        assert!(!summary.is_loadable());

        fs::write(&path, b"garbage").unwrap();
        let summary = inspect(&path).unwrap();
        assert_eq!(summary.name, None);
        assert!(summary.problem.is_some());
    }

    #[test]
    fn test_checksum_is_stable_hex() {
        let a = checksum(b"abc");
        assert_eq!(a.len(), 64);
        assert_eq!(
            a,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
