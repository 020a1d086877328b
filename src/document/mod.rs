//! Document model
//!
//! A document is a read-only guide section followed by an ordered list of copy
//! sections, each holding its own [`RichText`]. Edits arrive as [`Mutation`]s
//! and are refused while the user lock is on (except the unlock itself) or
//! while another process holds the file lock.

mod mutation;

pub use mutation::{EditOutcome, Mutation, SectionTarget};

use crate::error::{Error, LockReason, Result};
use crate::lock::LockStatus;
use crate::richtext::RichText;
use chrono::{DateTime, Utc};
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use uuid::Uuid;

// ─────────────────────────────────────────────────────────────────────────────
// Copy Sections
// ─────────────────────────────────────────────────────────────────────────────

/// Stable identity of a copy section. Survives reorders and saves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SectionId(Uuid);

impl SectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One independently copyable block of text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopySection {
    pub(crate) id: SectionId,
    pub(crate) rich_text: RichText,
    pub(crate) order: u32,
}

impl CopySection {
    pub fn id(&self) -> SectionId {
        self.id
    }

    pub fn rich_text(&self) -> &RichText {
        &self.rich_text
    }

    /// Position of this section, `0..n` within its document.
    pub fn order(&self) -> u32 {
        self.order
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Document
// ─────────────────────────────────────────────────────────────────────────────

/// A script document.
#[derive(Debug, Clone)]
pub struct Document {
    pub(crate) name: String,
    pub(crate) path: PathBuf,
    pub(crate) read_only: RichText,
    /// Always sorted by `order`, which equals the index.
    pub(crate) sections: Vec<CopySection>,
    pub(crate) locked: bool,
    pub(crate) favorite: bool,
    /// Per-document autosave choice; `None` follows the user setting.
    pub(crate) autosave: Option<bool>,
    pub(crate) last_modified: DateTime<Utc>,
    pub(crate) last_saved_checksum: Option<String>,
}

impl Document {
    /// A new empty document: empty guide text and one empty copy section.
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            read_only: RichText::new(),
            sections: vec![CopySection {
                id: SectionId::new(),
                rich_text: RichText::new(),
                order: 0,
            }],
            locked: false,
            favorite: false,
            autosave: None,
            last_modified: Utc::now(),
            last_saved_checksum: None,
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Accessors
    // ─────────────────────────────────────────────────────────────────────────

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn read_only_section(&self) -> &RichText {
        &self.read_only
    }

    pub fn copy_sections(&self) -> &[CopySection] {
        &self.sections
    }

    pub fn copy_section(&self, id: SectionId) -> Option<&CopySection> {
        self.sections.iter().find(|s| s.id == id)
    }

    pub fn section_ids(&self) -> Vec<SectionId> {
        self.sections.iter().map(|s| s.id).collect()
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    pub fn is_favorite(&self) -> bool {
        self.favorite
    }

    /// Autosave override stored with the document, if any.
    pub fn autosave_override(&self) -> Option<bool> {
        self.autosave
    }

    /// Whether the background timer should save this document.
    pub fn autosaves(&self, default_enabled: bool) -> bool {
        self.autosave.unwrap_or(default_enabled)
    }

    pub fn last_modified(&self) -> DateTime<Utc> {
        self.last_modified
    }

    /// SHA-256 of the payload at the last save or load.
    pub fn last_saved_checksum(&self) -> Option<&str> {
        self.last_saved_checksum.as_deref()
    }

    pub(crate) fn set_saved_checksum(&mut self, checksum: String) {
        self.last_saved_checksum = Some(checksum);
    }

    /// Plain text a copy section puts on the clipboard.
    pub fn copy_text(&self, id: SectionId) -> Result<String> {
        self.copy_section(id)
            .map(|s| s.rich_text.plain_text())
            .ok_or(Error::SectionNotFound(id))
    }

    /// Plain text of the copy section at `index` (quick-copy hotkeys).
    pub fn copy_text_at(&self, index: usize) -> Option<String> {
        self.sections.get(index).map(|s| s.rich_text.plain_text())
    }

    /// Compare everything that is written to disk.
    pub fn content_eq(&self, other: &Document) -> bool {
        self.name == other.name
            && self.read_only == other.read_only
            && self.sections == other.sections
            && self.locked == other.locked
            && self.favorite == other.favorite
            && self.autosave == other.autosave
            && self.last_modified == other.last_modified
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Editing
    // ─────────────────────────────────────────────────────────────────────────

    /// Apply an edit, respecting the user lock and the process lock.
    ///
    /// On error the document is left untouched.
    pub fn edit(&mut self, mutation: Mutation, lock: &LockStatus) -> Result<EditOutcome> {
        if self.locked && !mutation.is_metadata() {
            return Err(Error::LockedDocument {
                path: self.path.clone(),
                reason: LockReason::UserFlag,
            });
        }
        if let LockStatus::HeldByOther(owner) = lock {
            return Err(Error::ProcessLockConflict {
                path: self.path.clone(),
                owner: owner.clone(),
            });
        }

        let label = mutation.label();
        let outcome = self.apply(mutation)?;
        if outcome.is_change() {
            self.last_modified = Utc::now();
            debug!("Applied {} to '{}'", label, self.name);
        }
        Ok(outcome)
    }

    fn apply(&mut self, mutation: Mutation) -> Result<EditOutcome> {
        match mutation {
            Mutation::InsertText {
                target,
                position,
                text,
            } => self.edit_text(target, |t| t.insert_text(position, &text)),
            Mutation::DeleteRange { target, range } => {
                self.edit_text(target, |t| t.delete_range(range))
            }
            Mutation::ApplyFormatting {
                target,
                range,
                patch,
            } => self.edit_text(target, |t| t.apply_formatting(range, &patch)),
            Mutation::ToggleBold { target, range } => {
                self.edit_text(target, |t| t.toggle_bold(range))
            }
            Mutation::ToggleUnderline { target, range } => {
                self.edit_text(target, |t| t.toggle_underline(range))
            }
            Mutation::ClearFormatting { target, range } => {
                self.edit_text(target, |t| t.clear_formatting(range))
            }
            Mutation::ReplaceSection { target, text } => self.edit_text(target, |t| {
                *t = text;
                Ok(())
            }),
            Mutation::AddCopySection { after } => self.add_copy_section(after),
            Mutation::RemoveCopySection(id) => self.remove_copy_section(id),
            Mutation::MoveCopySection { id, delta } => self.move_copy_section(id, delta),
            Mutation::ReorderCopySections(ids) => self.reorder_copy_sections(&ids),
            Mutation::ToggleFavorite => {
                self.favorite = !self.favorite;
                Ok(EditOutcome::Changed)
            }
            Mutation::ToggleLocked => {
                self.locked = !self.locked;
                Ok(EditOutcome::Changed)
            }
            Mutation::SetAutosave(autosave) => {
                if self.autosave == autosave {
                    return Ok(EditOutcome::Unchanged);
                }
                self.autosave = autosave;
                Ok(EditOutcome::Changed)
            }
            Mutation::SetLocked(locked) => {
                if self.locked == locked {
                    return Ok(EditOutcome::Unchanged);
                }
                self.locked = locked;
                Ok(EditOutcome::Changed)
            }
        }
    }

    fn edit_text<F>(&mut self, target: SectionTarget, op: F) -> Result<EditOutcome>
    where
        F: FnOnce(&mut RichText) -> Result<()>,
    {
        let text = match target {
            SectionTarget::ReadOnly => &mut self.read_only,
            SectionTarget::Copy(id) => self
                .sections
                .iter_mut()
                .find(|s| s.id == id)
                .map(|s| &mut s.rich_text)
                .ok_or(Error::SectionNotFound(id))?,
        };
        let before = text.clone();
        op(text)?;
        if *text == before {
            Ok(EditOutcome::Unchanged)
        } else {
            Ok(EditOutcome::Changed)
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Section Ordering
    // ─────────────────────────────────────────────────────────────────────────

    fn index_of(&self, id: SectionId) -> Result<usize> {
        self.sections
            .iter()
            .position(|s| s.id == id)
            .ok_or(Error::SectionNotFound(id))
    }

    fn renumber(&mut self) {
        for (index, section) in self.sections.iter_mut().enumerate() {
            section.order = index as u32;
        }
    }

    fn add_copy_section(&mut self, after: Option<SectionId>) -> Result<EditOutcome> {
        let index = match after {
            Some(id) => self.index_of(id)? + 1,
            None => self.sections.len(),
        };
        let id = SectionId::new();
        self.sections.insert(
            index,
            CopySection {
                id,
                rich_text: RichText::new(),
                order: 0,
            },
        );
        self.renumber();
        Ok(EditOutcome::SectionAdded(id))
    }

    fn remove_copy_section(&mut self, id: SectionId) -> Result<EditOutcome> {
        let index = self.index_of(id)?;
        if self.sections.len() == 1 {
            return Err(Error::LastSection);
        }
        self.sections.remove(index);
        self.renumber();
        Ok(EditOutcome::Changed)
    }

    fn move_copy_section(&mut self, id: SectionId, delta: isize) -> Result<EditOutcome> {
        let index = self.index_of(id)?;
        let target = index as isize + delta;
        if delta == 0 || target < 0 || target >= self.sections.len() as isize {
            return Ok(EditOutcome::Unchanged);
        }
        let section = self.sections.remove(index);
        self.sections.insert(target as usize, section);
        self.renumber();
        Ok(EditOutcome::Changed)
    }

    /// `new_order` must be a permutation of the current section ids.
    fn reorder_copy_sections(&mut self, new_order: &[SectionId]) -> Result<EditOutcome> {
        if new_order.len() != self.sections.len() {
            return Err(Error::InvalidOrder(format!(
                "expected {} section ids, got {}",
                self.sections.len(),
                new_order.len()
            )));
        }
        let mut seen = HashSet::with_capacity(new_order.len());
        for id in new_order {
            if !seen.insert(*id) {
                return Err(Error::InvalidOrder(format!("section {} listed twice", id)));
            }
            if self.copy_section(*id).is_none() {
                return Err(Error::InvalidOrder(format!("unknown section {}", id)));
            }
        }
        if new_order == self.section_ids().as_slice() {
            return Ok(EditOutcome::Unchanged);
        }

        let mut remaining = std::mem::take(&mut self.sections);
        for id in new_order {
            if let Some(pos) = remaining.iter().position(|s| s.id == *id) {
                self.sections.push(remaining.swap_remove(pos));
            }
        }
        self.renumber();
        Ok(EditOutcome::Changed)
    }

    /// Reorder by current positions, e.g. `[1, 0]` swaps the first two sections.
    pub fn section_ids_for_positions(&self, positions: &[usize]) -> Result<Vec<SectionId>> {
        positions
            .iter()
            .map(|&p| {
                self.sections
                    .get(p)
                    .map(|s| s.id)
                    .ok_or_else(|| Error::InvalidOrder(format!("no section at position {}", p)))
            })
            .collect()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
