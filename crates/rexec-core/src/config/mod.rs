//! Configuration management

mod remote;
pub mod serde_utils;

pub use remote::{
    RemoteExecutionConfig, DEFAULT_COMMAND_ENDPOINT, DEFAULT_CONNECT_TIMEOUT,
    DEFAULT_MULTICAST_BIND_ADDRESS, DEFAULT_MULTICAST_GROUP_ENDPOINT, DEFAULT_MULTICAST_TTL,
    NODE_PING_INTERVAL, NODE_TIMEOUT,
};

use crate::error::ConfigError;
use std::path::{Path, PathBuf};

/// Get the default configuration directory
pub fn default_config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("rexec")
}

/// Get the default configuration file path
pub fn default_config_path() -> PathBuf {
    default_config_dir().join("config.toml")
}

/// Load and validate a configuration file
pub fn load_config(path: &Path) -> Result<RemoteExecutionConfig, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::NotFound(path.to_path_buf()));
    }

    let content = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Invalid(format!("Failed to read config: {}", e)))?;

    let config: RemoteExecutionConfig = toml::from_str(&content)?;
    config.validate()?;
    Ok(config)
}

/// Load the configuration at `path`, or the default path when `None`.
///
/// A missing default file yields the default configuration; a missing
/// explicit file is an error.
pub fn load_or_default(path: Option<&Path>) -> Result<RemoteExecutionConfig, ConfigError> {
    match path {
        Some(path) => load_config(path),
        None => {
            let default_path = default_config_path();
            if default_path.exists() {
                load_config(&default_path)
            } else {
                tracing::debug!("No config at {:?}, using defaults", default_path);
                Ok(RemoteExecutionConfig::default())
            }
        }
    }
}

/// Save configuration to a file
pub fn save_config(path: &Path, config: &RemoteExecutionConfig) -> Result<(), ConfigError> {
    let content = toml::to_string_pretty(config)?;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| ConfigError::Invalid(format!("Failed to create config dir: {}", e)))?;
    }

    std::fs::write(path, content)
        .map_err(|e| ConfigError::Invalid(format!("Failed to write config: {}", e)))?;

    Ok(())
}
