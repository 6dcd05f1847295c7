//! Errors raised while reading, checking or writing configuration.

use std::path::PathBuf;
use thiserror::Error;

/// Configuration-related errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file does not exist.
    #[error("no configuration at {0}")]
    NotFound(PathBuf),

    /// The file exists but could not be read.
    #[error("cannot read {path}: {source}")]
    Read {
        /// File being read.
        path: PathBuf,
        /// Cause.
        #[source]
        source: std::io::Error,
    },

    /// The file could not be written.
    #[error("cannot write {path}: {source}")]
    Write {
        /// File being written.
        path: PathBuf,
        /// Cause.
        #[source]
        source: std::io::Error,
    },

    /// The content is not valid TOML for [`ServiceConfig`](super::ServiceConfig).
    #[error("malformed configuration: {0}")]
    Parse(#[from] toml::de::Error),

    /// The configuration could not be turned into TOML.
    #[error("cannot serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// Validators reported errors, formatted as `field: message`.
    #[error("invalid configuration: {}", .0.join("; "))]
    Invalid(Vec<String>),
}

/// Result type for configuration operations.
pub type ConfigResult<T> = Result<T, ConfigError>;
