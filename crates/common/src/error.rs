//! Error types for WebBench

use thiserror::Error;

/// Result type alias using WebBench Error
pub type Result<T> = std::result::Result<T, Error>;

/// WebBench error types
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Storage error at {path}: {reason}")]
    Storage { path: String, reason: String },

    #[error("Invalid duration: {0}")]
    InvalidDuration(String),
}

impl Error {
    /// Build a storage error for a state file path
    pub fn storage(path: &std::path::Path, reason: impl std::fmt::Display) -> Self {
        Error::Storage {
            path: path.display().to_string(),
            reason: reason.to_string(),
        }
    }
}
