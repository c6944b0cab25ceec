//! Error types for the relay core library.

use thiserror::Error;

/// Result type alias using the core `Error`.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types for relay configuration and plumbing.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Log filter or subscriber setup failed
    #[error("Tracing setup error: {0}")]
    Tracing(String),
}
