//! Per-document save state machine.

use crate::error::ErrorKind;
use chrono::{DateTime, Utc};

/// Save state of one open document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SaveState {
    /// In-memory content matches the file.
    #[default]
    Clean,
    /// There are edits not yet written.
    Dirty,
    /// A write of the pending edits is in flight.
    Saving,
}

impl SaveState {
    /// Whether the shell should show the unsaved-changes indicator.
    pub fn is_dirty(&self) -> bool {
        !matches!(self, SaveState::Clean)
    }
}

/// Token proving a save was started. Must be passed back to `finish_save`.
#[derive(Debug)]
#[must_use]
pub struct SaveTicket {
    _private: (),
}

/// Tracks `Clean -> Dirty -> Saving -> Clean`, with `Saving -> Dirty` when an
/// edit lands while a save is in flight.
#[derive(Debug, Default)]
pub struct DirtyTracker {
    state: SaveState,
    in_flight: bool,
    last_error: Option<ErrorKind>,
    last_saved_at: Option<DateTime<Utc>>,
}

impl DirtyTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> SaveState {
        self.state
    }

    pub fn is_dirty(&self) -> bool {
        self.state.is_dirty()
    }

    /// Kind of the most recent failed save, cleared by the next success.
    pub fn last_error(&self) -> Option<ErrorKind> {
        self.last_error
    }

    pub fn last_saved_at(&self) -> Option<DateTime<Utc>> {
        self.last_saved_at
    }

    /// Record an edit. Never blocked by an in-flight save.
    pub fn mark_edited(&mut self) {
        self.state = SaveState::Dirty;
    }

    /// Start a save. Returns `None` when another save is in flight, or when
    /// nothing is pending and `force` is false.
    pub fn begin_save(&mut self, force: bool) -> Option<SaveTicket> {
        if self.in_flight {
            return None;
        }
        match self.state {
            SaveState::Dirty => self.state = SaveState::Saving,
            SaveState::Clean if force => {}
            _ => return None,
        }
        self.in_flight = true;
        Some(SaveTicket { _private: () })
    }

    /// Finish a save. An edit that arrived meanwhile keeps the document dirty.
    pub fn finish_save(&mut self, ticket: SaveTicket, outcome: Result<(), ErrorKind>) {
        let SaveTicket { .. } = ticket;
        self.in_flight = false;
        match outcome {
            Ok(()) => {
                if self.state == SaveState::Saving {
                    self.state = SaveState::Clean;
                }
                self.last_error = None;
                self.last_saved_at = Some(Utc::now());
            }
            Err(kind) => {
                if self.state == SaveState::Saving {
                    self.state = SaveState::Dirty;
                }
                self.last_error = Some(kind);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_dirty_saving_clean() {
        let mut tracker = DirtyTracker::new();
        assert_eq!(tracker.state(), SaveState::Clean);
        assert!(tracker.begin_save(false).is_none());

        tracker.mark_edited();
        assert_eq!(tracker.state(), SaveState::Dirty);

        let ticket = tracker.begin_save(false).unwrap();
        assert_eq!(tracker.state(), SaveState::Saving);
        assert!(tracker.is_dirty());

        tracker.finish_save(ticket, Ok(()));
        assert_eq!(tracker.state(), SaveState::Clean);
        assert!(tracker.last_saved_at().is_some());
    }

    #[test]
    fn test_edit_during_save_ends_dirty() {
        let mut tracker = DirtyTracker::new();
        tracker.mark_edited();
        let ticket = tracker.begin_save(false).unwrap();
        tracker.mark_edited();
        assert_eq!(tracker.state(), SaveState::Dirty);
        // A second save cannot start while the first is in flight.
        assert!(tracker.begin_save(true).is_none());

        tracker.finish_save(ticket, Ok(()));
        assert_eq!(tracker.state(), SaveState::Dirty);
    }

    #[test]
    fn test_failed_save_stays_dirty() {
        let mut tracker = DirtyTracker::new();
        tracker.mark_edited();
        let ticket = tracker.begin_save(false).unwrap();
        tracker.finish_save(ticket, Err(ErrorKind::Io));
        assert_eq!(tracker.state(), SaveState::Dirty);
        assert_eq!(tracker.last_error(), Some(ErrorKind::Io));

        let ticket = tracker.begin_save(false).unwrap();
        tracker.finish_save(ticket, Ok(()));
        assert_eq!(tracker.last_error(), None);
    }

    #[test]
    fn test_forced_save_of_clean_document() {
        let mut tracker = DirtyTracker::new();
        let ticket = tracker.begin_save(true).unwrap();
        assert_eq!(tracker.state(), SaveState::Clean);
        tracker.finish_save(ticket, Ok(()));
        assert_eq!(tracker.state(), SaveState::Clean);
    }
}
