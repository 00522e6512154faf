//! Service error types.

use thiserror::Error;

/// Errors produced by services in this crate.
#[derive(Error, Debug)]
pub enum ServiceError {
    /// MCP transport-layer failure.
    #[error("mcp transport error: {0}")]
    McpTransport(String),

    /// MCP protocol-layer failure (JSON-RPC error or tool error result).
    #[error("mcp protocol error: {0}")]
    McpProtocol(String),

    /// Underlying I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization / deserialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Convenience alias for results in this crate.
pub type Result<T> = std::result::Result<T, ServiceError>;
