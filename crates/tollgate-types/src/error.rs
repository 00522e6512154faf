//! Error types shared across tollgate crates.
//!
//! [`TollgateError`] covers the failures that can happen before a request
//! is ever proxied: loading and validating configuration. Request-path
//! errors live next to the code that produces them (`ProtocolError` and
//! `UpstreamError` in `tollgate-llm`, `PipelineError` in `tollgate-core`).

use thiserror::Error;

/// Top-level error type for configuration and startup.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum TollgateError {
    /// Configuration is malformed or semantically invalid.
    #[error("invalid config: {reason}")]
    ConfigInvalid {
        /// What is wrong with the configuration.
        reason: String,
    },

    /// An explicitly requested config file does not exist.
    #[error("config file not found: {path}")]
    ConfigNotFound {
        /// The path that was looked up.
        path: String,
    },

    /// Underlying I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization / deserialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// A convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, TollgateError>;
