//! Configuration Management Module
//!
//! Loads `remote.json` from the user config directory (or the path in
//! `OXIDE_REMOTE_CONFIG`). A missing file yields defaults.

pub mod types;

use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, info};

pub use types::{
    ApplicationOptions, CopyStrategy, NativeOptions, RemoteConfig, RuntimeOptions, ServerOptions,
    SetupOptions, SshOptions, CONFIG_VERSION,
};

/// Environment variable overriding the config file location
pub const CONFIG_PATH_ENV: &str = "OXIDE_REMOTE_CONFIG";

const CONFIG_DIR_NAME: &str = "oxide-remote";
const CONFIG_FILE_NAME: &str = "remote.json";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Config directory not found")]
    NoConfigDir,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid config file {path}: {message}")]
    Parse { path: String, message: String },
}

/// Default config file path: `<config_dir>/oxide-remote/remote.json`
pub fn config_file() -> Result<PathBuf, ConfigError> {
    if let Ok(path) = std::env::var(CONFIG_PATH_ENV) {
        return Ok(PathBuf::from(path));
    }
    dirs::config_dir()
        .map(|dir| dir.join(CONFIG_DIR_NAME).join(CONFIG_FILE_NAME))
        .ok_or(ConfigError::NoConfigDir)
}

/// Load configuration from the default location
pub async fn load() -> Result<RemoteConfig, ConfigError> {
    let path = config_file()?;
    load_from(&path).await
}

/// Load configuration from an explicit path
pub async fn load_from(path: &Path) -> Result<RemoteConfig, ConfigError> {
    let contents = match tokio::fs::read_to_string(path).await {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!("Config file {:?} not found, using defaults", path);
            return Ok(RemoteConfig::default());
        }
        Err(e) => return Err(e.into()),
    };

    let config: RemoteConfig =
        serde_json::from_str(&contents).map_err(|e| ConfigError::Parse {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;

    info!("Loaded config from {:?} (version {})", path, config.version);
    Ok(config)
}
