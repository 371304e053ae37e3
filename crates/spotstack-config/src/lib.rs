//! Locating and loading spotstack engine settings
//!
//! Settings live in a single YAML file mirroring
//! [`EngineSettings`](spotstack_cloud::EngineSettings). Every field is
//! optional; anything the file leaves out keeps its default.
//!
//! ```yaml
//! state_dir: /var/lib/spotstack/state
//! monitor:
//!   poll_interval_secs: 30
//!   failure_threshold: 3
//! recovery:
//!   restore_on: [manual, interruption]
//! ```

pub mod error;

pub use error::*;

use spotstack_cloud::EngineSettings;
use std::path::{Path, PathBuf};

/// Path of the settings file, overriding discovery.
pub const CONFIG_ENV: &str = "SPOTSTACK_CONFIG";
/// State directory, overriding the settings file.
pub const STATE_DIR_ENV: &str = "SPOTSTACK_STATE_DIR";

const LOCAL_FILE: &str = "spotstack.yaml";
const PROJECT_DIR: &str = ".spotstack";
const SETTINGS_FILE: &str = "settings.yaml";

/// Effective settings and where they came from
#[derive(Debug, Clone)]
pub struct LoadedSettings {
    pub settings: EngineSettings,
    /// `None` when no settings file was found
    pub source: Option<PathBuf>,
}

impl LoadedSettings {
    pub fn origin(&self) -> String {
        self.source
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "built-in defaults".to_string())
    }
}

/// `~/.config/spotstack`, if the platform has a config directory.
pub fn config_dir() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("spotstack"))
}

/// `~/.local/share/spotstack/state` on Linux.
pub fn default_state_dir() -> Result<PathBuf> {
    dirs::data_local_dir()
        .map(|dir| dir.join("spotstack").join("state"))
        .ok_or(ConfigError::DataDirNotFound)
}

/// Find the settings file.
///
/// Search order:
/// 1. `SPOTSTACK_CONFIG` (must exist when set)
/// 2. `./spotstack.yaml`
/// 3. `./.spotstack/settings.yaml`
/// 4. `~/.config/spotstack/settings.yaml`
pub fn find_settings_file() -> Result<Option<PathBuf>> {
    if let Some(path) = std::env::var_os(CONFIG_ENV).filter(|v| !v.is_empty()) {
        let path = PathBuf::from(path);
        if path.is_file() {
            return Ok(Some(path));
        }
        return Err(ConfigError::SettingsFileMissing(path));
    }

    let current_dir = std::env::current_dir()?;
    let candidates = [
        current_dir.join(LOCAL_FILE),
        current_dir.join(PROJECT_DIR).join(SETTINGS_FILE),
    ];
    if let Some(found) = candidates.into_iter().find(|p| p.is_file()) {
        return Ok(Some(found));
    }

    Ok(config_dir()
        .map(|dir| dir.join(SETTINGS_FILE))
        .filter(|p| p.is_file()))
}

/// Load settings from a specific file.
///
/// A relative `state_dir` is resolved against the file's directory; a file
/// that does not name one gets [`default_state_dir`].
pub fn load_settings_from(path: &Path) -> Result<EngineSettings> {
    let content = std::fs::read_to_string(path)?;
    let value: serde_yaml::Value =
        serde_yaml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

    if value.is_null() {
        return Ok(EngineSettings::default().with_state_dir(default_state_dir()?));
    }
    let names_state_dir = value.get("state_dir").is_some();

    let mut settings: EngineSettings =
        serde_yaml::from_value(value).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

    if !names_state_dir {
        settings.state_dir = default_state_dir()?;
    } else if settings.state_dir.is_relative()
        && let Some(base) = path.parent()
    {
        settings.state_dir = base.join(&settings.state_dir);
    }
    Ok(settings)
}

/// Discover, load, apply environment overrides and validate.
pub fn load_settings() -> Result<LoadedSettings> {
    let source = find_settings_file()?;
    let mut settings = match &source {
        Some(path) => load_settings_from(path)?,
        None => EngineSettings::default().with_state_dir(default_state_dir()?),
    };

    if let Some(dir) = std::env::var_os(STATE_DIR_ENV).filter(|v| !v.is_empty()) {
        settings.state_dir = PathBuf::from(dir);
    }

    let loaded = LoadedSettings { settings, source };
    loaded
        .settings
        .validate()
        .map_err(|e| ConfigError::Invalid {
            origin: loaded.origin(),
            message: e.to_string(),
        })?;
    Ok(loaded)
}
