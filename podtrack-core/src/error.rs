use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    // Configuration errors
    #[error("Config file not found at {path}. A template has been created - please edit it with your Spotify credentials and restart.")]
    ConfigNotFound { path: PathBuf },

    #[error("Missing required config field: {field}")]
    ConfigMissingField { field: String },

    #[error("Failed to parse config file: {0}")]
    ConfigParseError(#[from] toml::de::Error),

    // Authentication errors
    #[error("Authentication failed: {reason}")]
    AuthFailed { reason: String },

    // Persistence errors
    #[error("Store write failed for key {key}: {reason}")]
    StoreWrite { key: String, reason: String },

    #[error("Store read failed for key {key}: {reason}")]
    StoreRead { key: String, reason: String },

    #[error("Failed to serialize listening history: {0}")]
    Serialization(#[from] serde_json::Error),

    // IO errors
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, CoreError>;
