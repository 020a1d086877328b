//! Import of the single-file database used by the first QuickCopy releases.
//!
//! That format keeps everything in one `data.json`: a map of nodes (folders,
//! files and favorite shortcuts) under a QuickCopy root and a Favorites root.
//! File contents are text widget dumps: the plain text plus named tags with
//! `line.col` ranges. Importing materializes the nodes as folders and
//! `.qcdoc` documents under a target folder.

use crate::document::{CopySection, Document, SectionId};
use crate::error::{Error, Result};
use crate::library::names::{normalize_name, unique_name, MAX_NAME_CHARS, UNTITLED};
use crate::richtext::{Attributes, Color, RichText, Span, MAX_FONT_SIZE, MIN_FONT_SIZE};
use crate::storage;
use chrono::{DateTime, Local, NaiveDateTime, TimeZone, Utc};
use log::{debug, info};
use serde::Deserialize;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

/// Keys of the per-file metadata stored inside the read-only text dump.
const LOCKED_KEY: &str = "_locked";
const AUTOSAVE_KEY: &str = "_autosave";
const LAST_SAVED_KEY: &str = "_last_saved_ts";

// ─────────────────────────────────────────────────────────────────────────────
// Database Shape
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct LegacyDatabase {
    quickcopy_root_id: Option<String>,
    favorites_root_id: Option<String>,
    /// Root of the oldest databases, before the Favorites root existed.
    root_id: Option<String>,
    nodes: HashMap<String, Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct LegacyNode {
    id: Option<String>,
    #[serde(rename = "type")]
    kind: Option<String>,
    name: Option<String>,
    children: Vec<String>,
    content: Option<Value>,
    target_id: Option<String>,
    pinned: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NodeKind {
    Folder,
    File,
    Shortcut,
}

impl LegacyNode {
    fn kind(&self) -> NodeKind {
        match self.kind.as_deref() {
            Some("file") => NodeKind::File,
            Some("shortcut") => NodeKind::Shortcut,
            _ => NodeKind::Folder,
        }
    }
}

/// What an import created.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportReport {
    pub folders_created: usize,
    pub documents_created: usize,
    /// Documents that were favorites in the old database.
    pub favorites: Vec<PathBuf>,
    /// Nodes that could not be imported, with the reason.
    pub skipped: Vec<String>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Import
// ─────────────────────────────────────────────────────────────────────────────

/// Import an old `data.json` into `target`.
pub fn import_file(path: &Path, target: &Path) -> Result<ImportReport> {
    let bytes = fs::read(path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => Error::NotFound(path.to_path_buf()),
        _ => Error::FileRead {
            path: path.to_path_buf(),
            source: e,
        },
    })?;
    let value: Value = serde_json::from_slice(&bytes)
        .map_err(|e| Error::corrupt(path, format!("invalid JSON: {}", e)))?;
    info!("Importing legacy database {}", path.display());
    import_value(&value, target)
}

/// Import an already parsed old database into `target`.
pub fn import_value(value: &Value, target: &Path) -> Result<ImportReport> {
    let database: LegacyDatabase = serde_json::from_value(value.clone())
        .map_err(|e| Error::corrupt(target, format!("not a QuickCopy database: {}", e)))?;
    fs::create_dir_all(target).map_err(|e| Error::FileWrite {
        path: target.to_path_buf(),
        source: e,
    })?;

    let mut importer = Importer::new(&database);
    for root in importer.top_level(&database) {
        importer.import_node(&root, target)?;
    }
    importer.report.favorites = importer
        .favorite_ids
        .iter()
        .filter_map(|id| importer.created.get(id).cloned())
        .collect();
    importer.report.favorites.sort();

    info!(
        "Legacy import created {} folder(s) and {} document(s)",
        importer.report.folders_created, importer.report.documents_created
    );
    Ok(importer.report)
}

/// Materialize a legacy node subtree rooted at `root_id` under `target`.
/// Used by bundle import for bundles written by the old application.
pub(crate) fn import_subtree(
    nodes: &HashMap<String, Value>,
    root_id: &str,
    target: &Path,
) -> Result<(PathBuf, ImportReport)> {
    let database = LegacyDatabase {
        nodes: nodes.clone(),
        ..LegacyDatabase::default()
    };
    let mut importer = Importer::new(&database);
    let created = importer
        .import_node(root_id, target)?
        .ok_or_else(|| Error::Application(format!("bundle root '{}' is missing", root_id)))?;
    Ok((created, importer.report))
}

struct Importer {
    nodes: HashMap<String, LegacyNode>,
    favorite_ids: Vec<String>,
    visited: HashSet<String>,
    created: HashMap<String, PathBuf>,
    report: ImportReport,
}

impl Importer {
    fn new(database: &LegacyDatabase) -> Self {
        let mut report = ImportReport::default();
        let mut nodes = HashMap::new();
        for (key, raw) in &database.nodes {
            match serde_json::from_value::<LegacyNode>(raw.clone()) {
                Ok(node) => {
                    let id = node.id.clone().unwrap_or_else(|| key.clone());
                    nodes.insert(id, node);
                }
                Err(e) => report.skipped.push(format!("node {}: {}", key, e)),
            }
        }

        let mut favorite_ids: Vec<String> = nodes
            .iter()
            .filter(|(_, node)| node.pinned && node.kind() == NodeKind::File)
            .map(|(id, _)| id.clone())
            .collect();
        if let Some(favorites) = database
            .favorites_root_id
            .as_ref()
            .and_then(|id| nodes.get(id))
        {
            for child in &favorites.children {
                if let Some(target) = nodes.get(child).and_then(|n| n.target_id.clone()) {
                    favorite_ids.push(target);
                }
            }
        }
        favorite_ids.sort();
        favorite_ids.dedup();

        Self {
            nodes,
            favorite_ids,
            visited: HashSet::new(),
            created: HashMap::new(),
            report,
        }
    }

    /// Nodes whose children land directly in the target folder, in order.
    ///
    /// The QuickCopy root maps onto the target itself. An old single-root
    /// database keeps its root as a folder. Without any root, every node that
    /// is nobody's child is imported.
    fn top_level(&mut self, database: &LegacyDatabase) -> Vec<String> {
        if let Some(root) = database
            .quickcopy_root_id
            .as_ref()
            .filter(|id| self.nodes.contains_key(*id))
        {
            self.visited.insert(root.clone());
            let mut roots = self.nodes[root].children.clone();
            if let Some(legacy) = database
                .root_id
                .as_ref()
                .filter(|id| self.nodes.contains_key(*id) && !roots.contains(*id))
            {
                roots.push(legacy.clone());
            }
            return roots;
        }

        if let Some(legacy) = database.root_id.as_ref().filter(|id| {
            self.nodes
                .get(*id)
                .map(|n| n.kind() == NodeKind::Folder)
                .unwrap_or(false)
        }) {
            return vec![legacy.clone()];
        }

        let referenced: HashSet<&String> =
            self.nodes.values().flat_map(|n| n.children.iter()).collect();
        let mut roots: Vec<String> = self
            .nodes
            .iter()
            .filter(|(id, node)| {
                !referenced.contains(id)
                    && node.kind() != NodeKind::Shortcut
                    && database.favorites_root_id.as_ref() != Some(*id)
            })
            .map(|(id, _)| id.clone())
            .collect();
        roots.sort_by_key(|id| self.nodes[id].name.clone().unwrap_or_default().to_lowercase());
        roots
    }

    /// Import one node under `parent`. Returns the created path, if any.
    fn import_node(&mut self, id: &str, parent: &Path) -> Result<Option<PathBuf>> {
        if !self.visited.insert(id.to_string()) {
            self.report
                .skipped
                .push(format!("node {}: already imported (cycle or shared child)", id));
            return Ok(None);
        }
        let Some(node) = self.nodes.get(id).cloned() else {
            self.report.skipped.push(format!("node {}: missing", id));
            return Ok(None);
        };

        let path = match node.kind() {
            NodeKind::Shortcut => {
                debug!("Skipping shortcut node {}", id);
                return Ok(None);
            }
            NodeKind::Folder => {
                let name = unique_name(parent, &legacy_name(node.name.as_deref()))?;
                let path = parent.join(&name);
                fs::create_dir(&path).map_err(|e| Error::FileWrite {
                    path: path.clone(),
                    source: e,
                })?;
                self.report.folders_created += 1;
                for child in &node.children {
                    self.import_node(child, &path)?;
                }
                path
            }
            NodeKind::File => {
                let name = unique_name(parent, &legacy_name(node.name.as_deref()))?;
                let path = storage::document_path(parent, &name);
                let mut document = convert_content(&name, &path, node.content.as_ref());
                document.favorite = self.favorite_ids.iter().any(|f| f == id);
                storage::save(&document)?;
                self.report.documents_created += 1;
                path
            }
        };
        self.created.insert(id.to_string(), path.clone());
        Ok(Some(path))
    }
}

/// Turn an old node name into a valid library name.
fn legacy_name(raw: Option<&str>) -> String {
    let cleaned: String = raw
        .unwrap_or_default()
        .chars()
        .map(|c| match c {
            '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    let cleaned: String = cleaned
        .trim()
        .trim_matches('.')
        .chars()
        .take(MAX_NAME_CHARS - 1)
        .collect();
    normalize_name(&cleaned)
        .or_else(|_| normalize_name(&format!("{}_", cleaned)))
        .unwrap_or_else(|_| UNTITLED.to_string())
}

// ─────────────────────────────────────────────────────────────────────────────
// Content Conversion
// ─────────────────────────────────────────────────────────────────────────────

/// Build a document from any of the old content shapes:
/// `{read_doc, copy_docs}`, `{read_rich, copy_blocks}` (old bundles) and the
/// oldest `{read_text, copy_blocks: [string]}`.
fn convert_content(name: &str, path: &Path, content: Option<&Value>) -> Document {
    let empty = Value::Null;
    let content = content.unwrap_or(&empty);

    let read = content.get("read_doc").or_else(|| content.get("read_rich"));
    let read_only = match read {
        Some(doc) if doc.is_object() => rich_doc(doc),
        _ => RichText::plain(
            content
                .get("read_text")
                .and_then(Value::as_str)
                .unwrap_or_default(),
        ),
    };

    let blocks = content
        .get("copy_docs")
        .or_else(|| content.get("copy_blocks"))
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    let mut sections: Vec<CopySection> = blocks
        .iter()
        .map(|block| match block {
            Value::String(text) => RichText::plain(text.as_str()),
            other => rich_doc(other),
        })
        .enumerate()
        .map(|(order, rich_text)| CopySection {
            id: SectionId::new(),
            rich_text,
            order: order as u32,
        })
        .collect();
    if sections.is_empty() {
        sections.push(CopySection {
            id: SectionId::new(),
            rich_text: RichText::new(),
            order: 0,
        });
    }

    let locked = read
        .and_then(|doc| doc.get(LOCKED_KEY))
        .map(|v| v.as_bool().unwrap_or(false))
        .unwrap_or(false);
    let autosave = read
        .and_then(|doc| doc.get(AUTOSAVE_KEY))
        .map(|v| v.as_bool().unwrap_or(false));
    let last_modified = read
        .and_then(|doc| doc.get(LAST_SAVED_KEY))
        .and_then(Value::as_str)
        .and_then(parse_timestamp)
        .unwrap_or_else(Utc::now);

    Document {
        name: name.to_string(),
        path: path.to_path_buf(),
        read_only,
        sections,
        locked,
        favorite: false,
        autosave,
        last_modified,
        last_saved_checksum: None,
    }
}

/// Old timestamps are local time without an offset; newer ones may carry one.
fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    let naive: NaiveDateTime = raw.parse().ok()?;
    Local
        .from_local_datetime(&naive)
        .earliest()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Formatting carried by one text widget tag.
#[derive(Debug, Default, Clone, Copy)]
struct TagEffect {
    bold: bool,
    underline: bool,
    color: Option<Color>,
    font_size: Option<u16>,
}

impl TagEffect {
    fn from_tag(name: &str, config: Option<&Value>) -> Self {
        let mut effect = Self::default();
        match name {
            "BOLD" => effect.bold = true,
            "UNDER" => effect.underline = true,
            _ => {
                if let Some(hex) = name.strip_prefix("COLOR_") {
                    effect.color = Color::from_hex(&format!("#{}", hex));
                } else if let Some(size) = name.strip_prefix("SIZE_") {
                    effect.font_size = size
                        .parse::<u16>()
                        .ok()
                        .map(|s| s.clamp(MIN_FONT_SIZE, MAX_FONT_SIZE));
                }
            }
        }

        if let Some(config) = config {
            let underline = match config.get("underline") {
                Some(Value::Number(n)) => n.as_i64() == Some(1),
                Some(Value::String(s)) => s == "1",
                Some(Value::Bool(b)) => *b,
                _ => false,
            };
            effect.underline |= underline;
            if effect.color.is_none() {
                effect.color = config
                    .get("foreground")
                    .and_then(Value::as_str)
                    .and_then(Color::from_hex);
            }
        }
        effect
    }

    fn apply(&self, attrs: &mut Attributes) {
        attrs.bold |= self.bold;
        attrs.underline |= self.underline;
        if self.color.is_some() {
            attrs.color = self.color;
        }
        if self.font_size.is_some() {
            attrs.font_size = self.font_size;
        }
    }
}

/// Convert a `{text, tags: [{name, ranges, config}]}` dump into rich text.
fn rich_doc(doc: &Value) -> RichText {
    let text = doc.get("text").and_then(Value::as_str).unwrap_or_default();
    let chars: Vec<char> = text.chars().collect();
    let mut attrs = vec![Attributes::default(); chars.len()];
    let lines = line_starts(&chars);

    let tags = doc.get("tags").and_then(Value::as_array);
    for tag in tags.into_iter().flatten() {
        let Some(name) = tag.get("name").and_then(Value::as_str) else {
            continue;
        };
        let effect = TagEffect::from_tag(name, tag.get("config"));
        let ranges = tag.get("ranges").and_then(Value::as_array);
        for range in ranges.into_iter().flatten() {
            let Some([start, end]) = range.as_array().map(Vec::as_slice).and_then(|r| {
                match r {
                    [a, b] => Some([a.as_str()?, b.as_str()?]),
                    _ => None,
                }
            }) else {
                continue;
            };
            let (Some(start), Some(end)) = (
                parse_line_col_index(&lines, chars.len(), start),
                parse_line_col_index(&lines, chars.len(), end),
            ) else {
                debug!("Ignoring bad range {:?} on tag {}", range, name);
                continue;
            };
            for slot in attrs.iter_mut().take(end).skip(start) {
                effect.apply(slot);
            }
        }
    }

    let mut runs: Vec<Span> = Vec::new();
    for (ch, attr) in chars.into_iter().zip(attrs) {
        match runs.last_mut() {
            Some(run) if run.attrs == attr => run.text.push(ch),
            _ => runs.push(Span::new(ch.to_string(), attr)),
        }
    }
    RichText::from_runs(runs)
}

/// Char offset of the first char of each line.
fn line_starts(chars: &[char]) -> Vec<usize> {
    let mut starts = vec![0];
    starts.extend(
        chars
            .iter()
            .enumerate()
            .filter(|(_, c)| **c == '\n')
            .map(|(i, _)| i + 1),
    );
    starts
}

/// Convert a `line.col` index (1-based line, 0-based column) to a char
/// offset. Columns past the end of a line clamp to the line end; lines past
/// the end clamp to the text end. `end` is also accepted.
fn parse_line_col_index(lines: &[usize], len: usize, index: &str) -> Option<usize> {
    if index == "end" {
        return Some(len);
    }
    let (line, col) = index.split_once('.')?;
    let line: usize = line.parse().ok()?;
    let col: usize = col.parse().ok()?;
    if line == 0 {
        return None;
    }
    let Some(&start) = lines.get(line - 1) else {
        return Some(len);
    };
    let line_end = lines.get(line).map(|next| next - 1).unwrap_or(len);
    Some((start + col).min(line_end))
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
