//! Edit requests that can be applied to a [`Document`](super::Document).

use super::SectionId;
use crate::richtext::{AttributePatch, RichText};
use std::ops::Range;

/// Which rich text area of a document an edit targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SectionTarget {
    /// The guide text shown above the copy sections.
    ReadOnly,
    /// One copy section, by id.
    Copy(SectionId),
}

/// A single edit request from the shell.
#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    InsertText {
        target: SectionTarget,
        position: usize,
        text: String,
    },
    DeleteRange {
        target: SectionTarget,
        range: Range<usize>,
    },
    ApplyFormatting {
        target: SectionTarget,
        range: Range<usize>,
        patch: AttributePatch,
    },
    ToggleBold {
        target: SectionTarget,
        range: Range<usize>,
    },
    ToggleUnderline {
        target: SectionTarget,
        range: Range<usize>,
    },
    ClearFormatting {
        target: SectionTarget,
        range: Range<usize>,
    },
    /// Replace the whole content of a section (paste over everything).
    ReplaceSection {
        target: SectionTarget,
        text: RichText,
    },
    /// Add an empty copy section after `after`, or at the end.
    AddCopySection { after: Option<SectionId> },
    RemoveCopySection(SectionId),
    /// Move a copy section up (negative) or down (positive) by `delta` places.
    MoveCopySection { id: SectionId, delta: isize },
    ReorderCopySections(Vec<SectionId>),
    ToggleFavorite,
    ToggleLocked,
    SetLocked(bool),
    /// Turn background saving on or off for this document; `None` follows
    /// the user setting again.
    SetAutosave(Option<bool>),
}

impl Mutation {
    /// Metadata mutations are allowed even while the document is locked.
    pub fn is_metadata(&self) -> bool {
        matches!(
            self,
            Mutation::ToggleFavorite
                | Mutation::ToggleLocked
                | Mutation::SetLocked(_)
                | Mutation::SetAutosave(_)
        )
    }

    /// Short name for log lines.
    pub fn label(&self) -> &'static str {
        match self {
            Mutation::InsertText { .. } => "insert text",
            Mutation::DeleteRange { .. } => "delete range",
            Mutation::ApplyFormatting { .. } => "apply formatting",
            Mutation::ToggleBold { .. } => "toggle bold",
            Mutation::ToggleUnderline { .. } => "toggle underline",
            Mutation::ClearFormatting { .. } => "clear formatting",
            Mutation::ReplaceSection { .. } => "replace section",
            Mutation::AddCopySection { .. } => "add copy section",
            Mutation::RemoveCopySection(_) => "remove copy section",
            Mutation::MoveCopySection { .. } => "move copy section",
            Mutation::ReorderCopySections(_) => "reorder copy sections",
            Mutation::ToggleFavorite => "toggle favorite",
            Mutation::ToggleLocked => "toggle locked",
            Mutation::SetLocked(_) => "set locked",
            Mutation::SetAutosave(_) => "set autosave",
        }
    }
}

/// Result of a successful edit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EditOutcome {
    /// The document content changed.
    Changed,
    /// The request was valid but left the document as it was.
    Unchanged,
    /// A new copy section was created.
    SectionAdded(SectionId),
}

impl EditOutcome {
    pub fn is_change(&self) -> bool {
        !matches!(self, EditOutcome::Unchanged)
    }
}
