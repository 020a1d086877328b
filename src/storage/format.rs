//! On-disk JSON layout of a document.

use crate::document::{CopySection, Document, SectionId};
use crate::richtext::{RichText, Span};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

/// Newest `format_version` this build reads and the one it writes.
pub const FORMAT_VERSION: u64 = 1;

/// A copy section as stored on disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SectionRecord {
    pub id: SectionId,
    pub order: u32,
    pub spans: Vec<Span>,
}

/// Everything persisted about a document, without the version header.
///
/// Shared by document files and bundles.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentRecord {
    pub name: String,
    pub read_only_section: Vec<Span>,
    pub copy_sections: Vec<SectionRecord>,
    #[serde(default)]
    pub locked: bool,
    #[serde(default)]
    pub favorite: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub autosave: Option<bool>,
    pub last_modified: DateTime<Utc>,
}

/// A complete `.qcdoc` file.
#[derive(Debug, Serialize, Deserialize)]
pub struct DocumentFile {
    pub format_version: u64,
    #[serde(flatten)]
    pub record: DocumentRecord,
}

impl DocumentRecord {
    pub fn from_document(document: &Document) -> Self {
        Self {
            name: document.name().to_string(),
            read_only_section: document.read_only_section().spans().to_vec(),
            copy_sections: document
                .copy_sections()
                .iter()
                .map(|s| SectionRecord {
                    id: s.id(),
                    order: s.order(),
                    spans: s.rich_text().spans().to_vec(),
                })
                .collect(),
            locked: document.is_locked(),
            favorite: document.is_favorite(),
            autosave: document.autosave_override(),
            last_modified: document.last_modified(),
        }
    }

    /// Build a document, rejecting any structural violation.
    ///
    /// The error string describes the first problem found.
    pub fn into_document(self, path: &Path) -> Result<Document, String> {
        let read_only = RichText::from_spans(self.read_only_section)
            .map_err(|v| format!("read-only section: {}", v))?;

        if self.copy_sections.is_empty() {
            return Err("document has no copy sections".to_string());
        }

        let mut records = self.copy_sections;
        records.sort_by_key(|r| r.order);
        let mut ids = HashSet::with_capacity(records.len());
        let mut sections = Vec::with_capacity(records.len());
        for (index, record) in records.into_iter().enumerate() {
            if record.order as usize != index {
                return Err(format!(
                    "copy section orders are not contiguous (found {} at position {})",
                    record.order, index
                ));
            }
            if !ids.insert(record.id) {
                return Err(format!("duplicate copy section id {}", record.id));
            }
            let rich_text = RichText::from_spans(record.spans)
                .map_err(|v| format!("copy section {}: {}", record.id, v))?;
            sections.push(CopySection {
                id: record.id,
                rich_text,
                order: record.order,
            });
        }

        Ok(Document {
            name: self.name,
            path: path.to_path_buf(),
            read_only,
            sections,
            locked: self.locked,
            favorite: self.favorite,
            autosave: self.autosave,
            last_modified: self.last_modified,
            last_saved_checksum: None,
        })
    }
}

/// Lenient mirror of [`DocumentFile`] used only by repair.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub(crate) struct LenientFile {
    pub name: Option<String>,
    pub read_only_section: Vec<Span>,
    pub copy_sections: Vec<LenientSection>,
    pub locked: bool,
    pub favorite: bool,
    pub autosave: Option<bool>,
    pub last_modified: Option<DateTime<Utc>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub(crate) struct LenientSection {
    pub id: Option<SectionId>,
    pub order: Option<u32>,
    pub spans: Vec<Span>,
}
