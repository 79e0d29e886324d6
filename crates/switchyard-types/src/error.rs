//! Shared error types.

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while loading or validating configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("Failed to read config {path}: {source}")]
    Read {
        /// File that was being read.
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The configuration file is not valid TOML for this schema.
    #[error("Failed to parse config {path}: {source}")]
    Parse {
        /// File that was being parsed.
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    /// A value is outside its allowed range or contradicts another value.
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
