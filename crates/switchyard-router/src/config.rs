//! Router configuration loading from `~/.switchyard/router.toml` with defaults.

use std::path::{Path, PathBuf};
use switchyard_types::{ConfigError, RouterConfig};
use tracing::{info, warn};

/// Load router configuration, falling back to defaults when the file is
/// missing or unreadable.
pub fn load_config(path: Option<&Path>) -> RouterConfig {
    let config_path = path
        .map(|p| p.to_path_buf())
        .unwrap_or_else(default_config_path);

    if !config_path.exists() {
        info!(
            path = %config_path.display(),
            "Config file not found, using defaults"
        );
        return RouterConfig::default();
    }

    match try_load_config(&config_path) {
        Ok(config) => {
            info!(path = %config_path.display(), "Loaded configuration");
            config
        }
        Err(e) => {
            warn!(
                error = %e,
                path = %config_path.display(),
                "Failed to load config, using defaults"
            );
            RouterConfig::default()
        }
    }
}

/// Read, parse and validate a configuration file.
///
/// Used where a broken file must not silently turn into defaults, such as
/// reloading reserved agents on a running router.
pub fn try_load_config(path: &Path) -> Result<RouterConfig, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let config = RouterConfig::from_toml(&contents).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    config.validate()?;
    Ok(config)
}

/// Get the default config file path.
pub fn default_config_path() -> PathBuf {
    switchyard_home().join("router.toml")
}

/// Get the default Switchyard home directory.
pub fn switchyard_home() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".switchyard")
}
