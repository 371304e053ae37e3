use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Could not determine the user's data directory; set SPOTSTACK_STATE_DIR")]
    DataDirNotFound,

    #[error("Settings file named by SPOTSTACK_CONFIG does not exist: {}", .0.display())]
    SettingsFileMissing(PathBuf),

    #[error("Failed to parse {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("Invalid settings in {origin}: {message}")]
    Invalid { origin: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ConfigError>;
