//! Error types for the bronze ingestion jobs

use thiserror::Error;

/// Result type alias for bronze operations
pub type Result<T> = std::result::Result<T, BronzeError>;

/// Typed failures shared by both pipelines.
///
/// Transport errors from S3, Kafka or Arrow are not wrapped here; pipeline
/// code propagates them as `anyhow::Error` with context. This enum covers the
/// failures callers are expected to match on.
#[derive(Error, Debug)]
pub enum BronzeError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Unsupported file format: {0}")]
    UnsupportedFormat(String),

    #[error("Invalid storage location: {0}")]
    InvalidLocation(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Corrupt checkpoint at {path}: {reason}")]
    Checkpoint { path: String, reason: String },

    #[error("Object not found: {0}")]
    NotFound(String),
}
