use std::path::PathBuf;
use thiserror::Error;

/// Main error type for weft
#[derive(Error, Debug)]
pub enum WeftError {
    /// Configuration related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Configuration validation errors
    #[error("Configuration validation failed: {errors:?}")]
    ConfigValidation { errors: Vec<ValidationError> },

    /// Configuration file not found
    #[error("Configuration file not found: {path}")]
    ConfigNotFound { path: PathBuf },

    /// Invalid configuration value
    #[error("Invalid configuration value at {path}: {message}")]
    InvalidConfigValue { path: String, message: String },

    /// Document source errors
    #[error("Document source error: {0}")]
    Source(String),

    /// Document missing from the source
    #[error("Document not found: {path}")]
    DocumentNotFound { path: String },

    /// IO errors
    #[error("IO error: {context}: {source}")]
    Io {
        source: std::io::Error,
        context: String,
    },

    /// TOML deserialization errors
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// TOML serialization errors
    #[error("TOML serialization error: {0}")]
    TomlSerialization(#[from] toml::ser::Error),

    /// JSON errors
    #[error("JSON error: {context}: {source}")]
    Json {
        source: serde_json::Error,
        context: String,
    },

    /// Embedding provider errors
    #[error("Embedding error: {0}")]
    Embedding(#[from] crate::embedding::EmbeddingError),

    /// Index errors
    #[error("Index error: {0}")]
    Index(#[from] crate::index::IndexError),

    /// Snapshot encoding / decoding errors
    #[error("Snapshot error: {0}")]
    Snapshot(#[from] crate::storage::SnapshotError),

    /// Search errors
    #[error("Search error: {0}")]
    Search(#[from] crate::retrieval::SearchError),

    /// Background worker errors
    #[error("Worker error: {0}")]
    Worker(String),

    /// The worker has shut down and no longer accepts messages
    #[error("Worker is not running")]
    WorkerStopped,

    /// Work cancelled by a superseding request
    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    /// Generic errors
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Configuration validation error
#[derive(Debug, Clone)]
pub struct ValidationError {
    /// Path to the configuration key that failed validation
    pub path: String,
    /// Error message describing the validation failure
    pub message: String,
}

impl ValidationError {
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

/// Result type for weft operations
pub type Result<T> = std::result::Result<T, WeftError>;
