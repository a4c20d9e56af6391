//! Error types for the Solegate service.

use thiserror::Error;

use crate::ratelimit::StoreError;

/// Main error type for Solegate operations.
#[derive(Error, Debug)]
pub enum GateError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Configuration sources that could not be read or merged
    #[error("Configuration source error: {0}")]
    ConfigSource(#[from] ::config::ConfigError),

    /// Rate limit store errors
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Solegate operations.
pub type Result<T> = std::result::Result<T, GateError>;
