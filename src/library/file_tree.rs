//! Folder tree data structures, directory scanning and background rescans.

use crate::library::names::entry_name;
use log::{debug, warn};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::thread;

// ─────────────────────────────────────────────────────────────────────────────
// Tree Node
// ─────────────────────────────────────────────────────────────────────────────

/// A node in the library tree: a folder or a document.
#[derive(Debug, Clone, PartialEq)]
pub struct TreeNode {
    /// Display name (directory name, or document file stem)
    pub name: String,

    /// Full path to the directory or `.qcdoc` file
    pub path: PathBuf,

    pub kind: TreeNodeKind,

    /// Whether this folder is expanded in the shell
    pub is_expanded: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TreeNodeKind {
    Document,
    Folder { children: Vec<TreeNode> },
}

impl TreeNode {
    pub fn document(name: String, path: PathBuf) -> Self {
        Self {
            name,
            path,
            kind: TreeNodeKind::Document,
            is_expanded: false,
        }
    }

    pub fn folder(name: String, path: PathBuf, children: Vec<TreeNode>) -> Self {
        Self {
            name,
            path,
            kind: TreeNodeKind::Folder { children },
            is_expanded: false,
        }
    }

    pub fn is_folder(&self) -> bool {
        matches!(self.kind, TreeNodeKind::Folder { .. })
    }

    pub fn is_document(&self) -> bool {
        matches!(self.kind, TreeNodeKind::Document)
    }

    pub fn children(&self) -> Option<&[TreeNode]> {
        match &self.kind {
            TreeNodeKind::Folder { children } => Some(children),
            TreeNodeKind::Document => None,
        }
    }

    /// Set expanded state for the folder at `target_path`.
    pub fn set_expanded(&mut self, target_path: &Path, expanded: bool) -> bool {
        if self.path == target_path {
            self.is_expanded = expanded;
            return true;
        }

        if let TreeNodeKind::Folder { children } = &mut self.kind {
            for child in children {
                if child.set_expanded(target_path, expanded) {
                    return true;
                }
            }
        }
        false
    }

    /// All expanded folder paths (for persistence).
    pub fn expanded_paths(&self) -> Vec<PathBuf> {
        let mut paths = Vec::new();
        self.collect_expanded_paths(&mut paths);
        paths
    }

    fn collect_expanded_paths(&self, paths: &mut Vec<PathBuf>) {
        if self.is_expanded {
            paths.push(self.path.clone());
        }
        if let TreeNodeKind::Folder { children } = &self.kind {
            for child in children {
                child.collect_expanded_paths(paths);
            }
        }
    }

    /// Restore expanded state from a list of paths. The root stays expanded.
    pub fn restore_expanded_paths(&mut self, expanded_paths: &[PathBuf]) {
        let is_root = self.is_expanded;
        self.restore_inner(expanded_paths);
        self.is_expanded |= is_root;
    }

    fn restore_inner(&mut self, expanded_paths: &[PathBuf]) {
        self.is_expanded = expanded_paths.contains(&self.path);
        if let TreeNodeKind::Folder { children } = &mut self.kind {
            for child in children {
                child.restore_inner(expanded_paths);
            }
        }
    }

    /// Find a node by path.
    pub fn find(&self, target_path: &Path) -> Option<&TreeNode> {
        if self.path == target_path {
            return Some(self);
        }
        if !target_path.starts_with(&self.path) {
            return None;
        }

        if let TreeNodeKind::Folder { children } = &self.kind {
            for child in children {
                if let Some(found) = child.find(target_path) {
                    return Some(found);
                }
            }
        }
        None
    }

    /// Visit this node and all descendants, parents before children.
    pub fn walk<'a>(&'a self, visit: &mut impl FnMut(&'a TreeNode)) {
        visit(self);
        if let TreeNodeKind::Folder { children } = &self.kind {
            for child in children {
                child.walk(visit);
            }
        }
    }

    /// Count all documents in this tree (recursive).
    pub fn document_count(&self) -> usize {
        match &self.kind {
            TreeNodeKind::Document => 1,
            TreeNodeKind::Folder { children } => children.iter().map(|c| c.document_count()).sum(),
        }
    }

    /// Count all folders in this tree, including this one (recursive).
    pub fn folder_count(&self) -> usize {
        match &self.kind {
            TreeNodeKind::Document => 0,
            TreeNodeKind::Folder { children } => {
                1 + children.iter().map(|c| c.folder_count()).sum::<usize>()
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Listing
// ─────────────────────────────────────────────────────────────────────────────

/// One entry of a folder listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub name: String,
    pub path: PathBuf,
}

/// Direct contents of one folder, each list sorted case-insensitively.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Listing {
    pub folders: Vec<Entry>,
    pub documents: Vec<Entry>,
}

impl Listing {
    pub fn is_empty(&self) -> bool {
        self.folders.is_empty() && self.documents.is_empty()
    }
}

/// List the folders and documents directly inside `folder`.
pub fn list_folder(folder: &Path, hidden: &dyn Fn(&str) -> bool) -> std::io::Result<Listing> {
    let mut listing = Listing::default();
    for entry in std::fs::read_dir(folder)?.flatten() {
        let path = entry.path();
        let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
        let Some(name) = entry_name(&path, is_dir) else {
            continue;
        };
        if hidden(&name) {
            continue;
        }
        let item = Entry { name, path };
        if is_dir {
            listing.folders.push(item);
        } else {
            listing.documents.push(item);
        }
    }
    listing.folders.sort_by_key(|e| e.name.to_lowercase());
    listing.documents.sort_by_key(|e| e.name.to_lowercase());
    Ok(listing)
}

// ─────────────────────────────────────────────────────────────────────────────
// Directory Scanning
// ─────────────────────────────────────────────────────────────────────────────

/// Scan the library below `root` and build a tree.
///
/// Only folders and `.qcdoc` documents appear. Dot entries (markers, temp
/// files, the state folder) and names matching `hidden` are skipped.
pub fn scan_directory(root: &Path, hidden: &dyn Fn(&str) -> bool) -> TreeNode {
    let name = root
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("Library")
        .to_string();

    let children = scan_children(root, hidden);

    let mut node = TreeNode::folder(name, root.to_path_buf(), children);
    node.is_expanded = true; // Root is always expanded
    node
}

fn scan_children(dir: &Path, hidden: &dyn Fn(&str) -> bool) -> Vec<TreeNode> {
    let mut entries: Vec<TreeNode> = Vec::new();

    let Ok(read_dir) = std::fs::read_dir(dir) else {
        return entries;
    };

    for entry in read_dir.flatten() {
        let path = entry.path();
        let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
        let Some(name) = entry_name(&path, is_dir) else {
            continue;
        };
        if hidden(&name) {
            continue;
        }

        let node = if is_dir {
            let children = scan_children(&path, hidden);
            TreeNode::folder(name, path, children)
        } else {
            TreeNode::document(name, path)
        };
        entries.push(node);
    }

    // Sort: folders first, then alphabetically (case-insensitive)
    entries.sort_by(|a, b| match (a.is_folder(), b.is_folder()) {
        (true, false) => std::cmp::Ordering::Less,
        (false, true) => std::cmp::Ordering::Greater,
        _ => a.name.to_lowercase().cmp(&b.name.to_lowercase()),
    });

    entries
}

// ─────────────────────────────────────────────────────────────────────────────
// Background Rescans
// ─────────────────────────────────────────────────────────────────────────────

/// A finished scan.
#[derive(Debug)]
pub struct ScanResult {
    pub generation: u64,
    pub tree: TreeNode,
}

/// Runs full scans on worker threads. Only the newest requested generation
/// is ever handed out; older results are dropped when they arrive.
#[derive(Debug)]
pub struct Rescanner {
    tx: Sender<ScanResult>,
    rx: Receiver<ScanResult>,
    latest_requested: u64,
    pending: usize,
}

impl Default for Rescanner {
    fn default() -> Self {
        Self::new()
    }
}

impl Rescanner {
    pub fn new() -> Self {
        let (tx, rx) = channel();
        Self {
            tx,
            rx,
            latest_requested: 0,
            pending: 0,
        }
    }

    /// Start a scan of `root`. Returns its generation number.
    pub fn request<H>(&mut self, root: PathBuf, hidden: H) -> u64
    where
        H: Fn(&str) -> bool + Send + 'static,
    {
        self.latest_requested += 1;
        let generation = self.latest_requested;
        let tx = self.tx.clone();
        let spawned = thread::Builder::new()
            .name(format!("quickcopy-scan-{}", generation))
            .spawn(move || {
                let tree = scan_directory(&root, &hidden);
                let _ = tx.send(ScanResult { generation, tree });
            });
        match spawned {
            Ok(_) => {
                self.pending += 1;
                debug!("Rescan {} started", generation);
            }
            Err(e) => warn!("Failed to start rescan {}: {}", generation, e),
        }
        generation
    }

    /// Whether any requested scan has not reported back yet.
    pub fn is_loading(&self) -> bool {
        self.pending > 0
    }

    /// Collect finished scans, returning the newest one if it is current.
    pub fn poll(&mut self) -> Option<ScanResult> {
        let mut current = None;
        while let Ok(result) = self.rx.try_recv() {
            self.pending = self.pending.saturating_sub(1);
            if result.generation == self.latest_requested {
                current = Some(result);
            } else {
                debug!(
                    "Discarding stale rescan {} (latest {})",
                    result.generation, self.latest_requested
                );
            }
        }
        current
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::time::{Duration, Instant};
    use tempfile::TempDir;

    fn no_hidden(_: &str) -> bool {
        false
    }

    fn sample_library() -> TempDir {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("work/letters")).unwrap();
        fs::create_dir(root.join("Archive")).unwrap();
        fs::create_dir(root.join(".quickcopy")).unwrap();
        fs::write(root.join("b intro.qcdoc"), b"{}").unwrap();
        fs::write(root.join("A closing.qcdoc"), b"{}").unwrap();
        fs::write(root.join(".A closing.qcdoc.lock"), b"{}").unwrap();
        fs::write(root.join(".x.qcdoc.0123.tmp"), b"").unwrap();
        fs::write(root.join("readme.txt"), b"").unwrap();
        fs::write(root.join("work/letters/Thanks.qcdoc"), b"{}").unwrap();
        dir
    }

    #[test]
    fn test_scan_sorts_and_filters() {
        let dir = sample_library();
        let tree = scan_directory(dir.path(), &no_hidden);
        assert!(tree.is_expanded);

        let names: Vec<&str> = tree
            .children()
            .unwrap()
            .iter()
            .map(|n| n.name.as_str())
            .collect();
        assert_eq!(names, vec!["Archive", "work", "A closing", "b intro"]);
        assert_eq!(tree.document_count(), 3);
        assert_eq!(tree.folder_count(), 4);

        let thanks = dir.path().join("work/letters/Thanks.qcdoc");
        assert!(tree.find(&thanks).unwrap().is_document());
    }

    #[test]
    fn test_scan_honours_hidden_names() {
        let dir = sample_library();
        let tree = scan_directory(dir.path(), &|name: &str| name == "Archive");
        assert!(tree.find(&dir.path().join("Archive")).is_none());
    }

    #[test]
    fn test_list_folder() {
        let dir = sample_library();
        let listing = list_folder(dir.path(), &no_hidden).unwrap();
        let folders: Vec<&str> = listing.folders.iter().map(|e| e.name.as_str()).collect();
        let documents: Vec<&str> = listing.documents.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(folders, vec!["Archive", "work"]);
        assert_eq!(documents, vec!["A closing", "b intro"]);
        assert!(list_folder(&dir.path().join("Archive"), &no_hidden)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_expanded_paths_roundtrip() {
        let dir = sample_library();
        let mut tree = scan_directory(dir.path(), &no_hidden);
        let work = dir.path().join("work");
        assert!(tree.set_expanded(&work, true));
        let saved = tree.expanded_paths();
        assert_eq!(saved.len(), 2);

        let mut fresh = scan_directory(dir.path(), &no_hidden);
        fresh.restore_expanded_paths(&saved);
        assert!(fresh.find(&work).unwrap().is_expanded);
        assert!(fresh.is_expanded);
    }

    #[test]
    fn test_rescanner_only_delivers_latest_generation() {
        let dir = sample_library();
        let mut rescanner = Rescanner::new();
        let first = rescanner.request(dir.path().to_path_buf(), no_hidden);
        let second = rescanner.request(dir.path().to_path_buf(), no_hidden);
        assert!(second > first);
        assert!(rescanner.is_loading());

        let deadline = Instant::now() + Duration::from_secs(5);
        let mut delivered = Vec::new();
        while rescanner.is_loading() && Instant::now() < deadline {
            if let Some(result) = rescanner.poll() {
                delivered.push(result.generation);
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(!rescanner.is_loading());
        assert_eq!(delivered, vec![second]);
    }
}
