//! Error types for snapvault

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for snapvault operations
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Failed to read source {}: {source}", path.display())]
    SourceIo {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to write destination {}: {source}", path.display())]
    DestinationIo {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Object not found: {hash}")]
    ObjectNotFound { hash: String },

    #[error("Corrupt snapshot {}: {reason}", path.display())]
    CorruptSnapshot { path: PathBuf, reason: String },

    #[error("{operation} rejected: {reason}")]
    Precondition {
        operation: &'static str,
        reason: String,
    },

    #[error("Timed out during {operation} after {seconds}s")]
    Timeout {
        operation: &'static str,
        seconds: u64,
    },

    #[error("Operation cancelled")]
    Cancelled,
}

/// Result type alias for snapvault operations
pub type Result<T> = std::result::Result<T, Error>;
