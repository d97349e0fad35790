//! Error types for `Marquee` core library.

use thiserror::Error;

/// Result type alias using `Marquee` Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types for `Marquee` operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Malformed reward address
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    /// Malformed currency amount
    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
