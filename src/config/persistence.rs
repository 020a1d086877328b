//! Configuration file persistence for QuickCopy
//!
//! Settings live in `config.json` under the platform config directory. A
//! missing, empty or unreadable file falls back to defaults.

use crate::config::Settings;
use crate::error::{Error, Result, ResultExt};
use crate::storage::atomic::write_atomic;
use log::{debug, info, warn};
use std::fs;
use std::path::{Path, PathBuf};

// ─────────────────────────────────────────────────────────────────────────────
// Constants
// ─────────────────────────────────────────────────────────────────────────────

/// Application name used for the config directory
pub const APP_NAME: &str = "quickcopy";

/// Configuration file name
const CONFIG_FILE_NAME: &str = "config.json";

/// Favorites record file name
const FAVORITES_FILE_NAME: &str = "favorites.json";

// ─────────────────────────────────────────────────────────────────────────────
// Platform-Specific Directory Resolution
// ─────────────────────────────────────────────────────────────────────────────

/// Get the platform-specific configuration directory for the application.
///
/// - **Windows**: `%APPDATA%\quickcopy\`
/// - **macOS**: `~/Library/Application Support/quickcopy/`
/// - **Linux**: `~/.config/quickcopy/`
///
/// # Errors
///
/// Returns `Error::ConfigDirNotFound` if the config directory cannot be determined.
pub fn get_config_dir() -> Result<PathBuf> {
    dirs::config_dir()
        .map(|base| base.join(APP_NAME))
        .ok_or(Error::ConfigDirNotFound)
}

/// Get the full path to the configuration file.
pub fn get_config_file_path() -> Result<PathBuf> {
    Ok(get_config_dir()?.join(CONFIG_FILE_NAME))
}

/// Get the full path to the favorites record.
pub fn get_favorites_file_path() -> Result<PathBuf> {
    Ok(get_config_dir()?.join(FAVORITES_FILE_NAME))
}

// ─────────────────────────────────────────────────────────────────────────────
// Load Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Load configuration from the default config file location.
///
/// If the file doesn't exist or is corrupted, logs a warning and falls back
/// to defaults.
pub fn load_config() -> Settings {
    get_config_file_path()
        .and_then(|path| load_config_from(&path))
        .unwrap_or_warn_default(Settings::default(), "Failed to load configuration")
}

/// Load and sanitize settings from `config_path`.
///
/// A missing or empty file yields defaults.
pub fn load_config_from(config_path: &Path) -> Result<Settings> {
    if !config_path.exists() {
        debug!(
            "Config file not found at {}, using defaults",
            config_path.display()
        );
        return Ok(Settings::default());
    }

    debug!("Loading config from: {}", config_path.display());

    let contents = fs::read_to_string(config_path).map_err(|e| Error::ConfigLoad {
        path: config_path.to_path_buf(),
        source: Box::new(e),
    })?;

    if contents.trim().is_empty() {
        debug!("Config file is empty, using defaults");
        return Ok(Settings::default());
    }

    let settings = Settings::from_json_sanitized(&contents).map_err(|e| {
        warn!(
            "Config file at {} contains invalid JSON: {}",
            config_path.display(),
            e
        );
        Error::ConfigParse {
            message: format!("Failed to parse config file: {}", e),
            source: Some(Box::new(e)),
        }
    })?;

    info!(
        "Configuration loaded successfully from {}",
        config_path.display()
    );
    Ok(settings)
}

// ─────────────────────────────────────────────────────────────────────────────
// Save Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Save configuration to the default config file location.
pub fn save_config(settings: &Settings) -> Result<()> {
    save_config_to(&get_config_file_path()?, settings)
}

/// Write `settings` to `config_path`, creating its directory on first use.
///
/// The file is replaced through [`write_atomic`], so a crash mid-save keeps the
/// previous settings readable.
pub fn save_config_to(config_path: &Path, settings: &Settings) -> Result<()> {
    let save_err = |path: &Path, source: Box<dyn std::error::Error + Send + Sync>| {
        Error::ConfigSave {
            path: path.to_path_buf(),
            source,
        }
    };

    if let Some(dir) = config_path.parent() {
        fs::create_dir_all(dir).map_err(|e| save_err(dir, Box::new(e)))?;
    }

    let json =
        serde_json::to_vec_pretty(settings).map_err(|e| save_err(config_path, Box::new(e)))?;
    write_atomic(config_path, &json).map_err(|e| save_err(config_path, Box::new(e)))?;

    info!("Settings written to {}", config_path.display());
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    struct TestEnv {
        _temp_dir: TempDir,
        config_file: PathBuf,
    }

    impl TestEnv {
        fn new() -> Self {
            let temp_dir = TempDir::new().expect("Failed to create temp dir");
            let config_file = temp_dir.path().join(APP_NAME).join(CONFIG_FILE_NAME);
            Self {
                _temp_dir: temp_dir,
                config_file,
            }
        }

        fn write_config(&self, content: &str) {
            fs::create_dir_all(self.config_file.parent().unwrap()).unwrap();
            fs::write(&self.config_file, content).expect("Failed to write config");
        }
    }

    #[test]
    fn test_config_paths_use_app_name() {
        if let Ok(path) = get_config_file_path() {
            assert!(path.to_string_lossy().contains(APP_NAME));
            assert!(path.ends_with(CONFIG_FILE_NAME));
        }
        if let Ok(path) = get_favorites_file_path() {
            assert!(path.ends_with(FAVORITES_FILE_NAME));
        }
    }

    #[test]
    fn test_missing_config_uses_defaults() {
        let env = TestEnv::new();
        assert_eq!(load_config_from(&env.config_file).unwrap(), Settings::default());
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let env = TestEnv::new();
        env.write_config("   \n");
        assert_eq!(load_config_from(&env.config_file).unwrap(), Settings::default());
    }

    #[test]
    fn test_corrupted_config_is_parse_error() {
        let env = TestEnv::new();
        env.write_config("{ invalid json }");
        assert!(matches!(
            load_config_from(&env.config_file),
            Err(Error::ConfigParse { .. })
        ));
    }

    #[test]
    fn test_load_sanitizes_values() {
        let env = TestEnv::new();
        env.write_config(r#"{"autosave_interval_ms": 5}"#);
        let settings = load_config_from(&env.config_file).unwrap();
        assert_eq!(settings.autosave_interval_ms, 1000);
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let env = TestEnv::new();
        let original = Settings {
            autosave_enabled: true,
            autosave_interval_ms: 3000,
            library_root: Some(PathBuf::from("/data/scripts")),
            ..Settings::default()
        };
        save_config_to(&env.config_file, &original).unwrap();
        let leftovers = fs::read_dir(env.config_file.parent().unwrap()).unwrap().count();
        assert_eq!(leftovers, 1);
        assert_eq!(load_config_from(&env.config_file).unwrap(), original);
    }

    #[test]
    fn test_unknown_fields_ignored() {
        let env = TestEnv::new();
        env.write_config(r#"{"autosave_enabled": true, "future_feature": 1}"#);
        assert!(load_config_from(&env.config_file).unwrap().autosave_enabled);
    }
}
