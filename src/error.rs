//! Error types for the relay fallback core

use std::io;

use thiserror::Error;

/// Result type alias for the relay fallback core
pub type Result<T> = std::result::Result<T, Error>;

/// Relay fallback errors
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Upstream transport failure during an attempt
    #[error("Upstream error: {0}")]
    Upstream(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}
