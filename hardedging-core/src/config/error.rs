//! Configuration errors

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Cannot read {}: {source}", path.display())]
    Read { path: PathBuf, source: std::io::Error },

    #[error("Cannot write {}: {source}", path.display())]
    Write { path: PathBuf, source: std::io::Error },

    #[error("Invalid TOML: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Cannot render config as TOML: {0}")]
    Render(#[from] toml::ser::Error),

    /// A `HARDEDGING_*` override could not be parsed
    #[error("Invalid value for {key}: {reason}")]
    InvalidValue { key: String, reason: String },

    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),
}
