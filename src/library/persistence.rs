//! Library view state persistence (runtime state, not settings).

use crate::storage::atomic::write_atomic;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Runtime state of a library that should survive restarts.
///
/// Stored in `{library_root}/.quickcopy/state.json`. Different from
/// [`Settings`](crate::config::Settings), which holds user configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(default)]
pub struct LibraryState {
    /// Paths of expanded folders in the tree
    pub expanded_paths: Vec<PathBuf>,

    /// Folder last shown in the listing pane
    pub current_folder: Option<PathBuf>,

    /// Documents open when the app last shut down
    pub open_documents: Vec<PathBuf>,
}

/// The subdirectory name for library state.
pub const STATE_DIR: &str = ".quickcopy";

/// The state file name.
const STATE_FILE: &str = "state.json";

/// Load library state from disk.
///
/// Returns `None` if the state file doesn't exist or is invalid.
pub fn load_library_state(library_root: &Path) -> Option<LibraryState> {
    let state_path = library_root.join(STATE_DIR).join(STATE_FILE);

    if !state_path.exists() {
        log::debug!("No library state file at {:?}", state_path);
        return None;
    }

    match std::fs::read_to_string(&state_path) {
        Ok(content) => match serde_json::from_str(&content) {
            Ok(state) => {
                log::debug!("Loaded library state from {:?}", state_path);
                Some(state)
            }
            Err(e) => {
                log::warn!("Failed to parse library state: {}", e);
                None
            }
        },
        Err(e) => {
            log::warn!("Failed to read library state: {}", e);
            None
        }
    }
}

/// Save library state to disk, creating the `.quickcopy` directory if needed.
pub fn save_library_state(library_root: &Path, state: &LibraryState) -> crate::error::Result<()> {
    let state_dir = library_root.join(STATE_DIR);
    if !state_dir.exists() {
        std::fs::create_dir_all(&state_dir)?;
    }

    let state_path = state_dir.join(STATE_FILE);
    let content = serde_json::to_string_pretty(state)?;
    write_atomic(&state_path, content.as_bytes())?;
    log::debug!("Saved library state to {:?}", state_path);

    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
