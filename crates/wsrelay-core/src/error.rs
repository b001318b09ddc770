//! Error types for the `wsrelay` core library.

use thiserror::Error;

/// Result type alias using the core `Error`.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types for `wsrelay` configuration and bootstrap.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Upstream address could not be parsed or uses an unsupported scheme
    #[error("Invalid upstream address {address}: {reason}")]
    InvalidUpstream { address: String, reason: String },
}
