//! Error types for the guardrail pipeline.
//!
//! Only [`PipelineError`] reaches the HTTP layer. Classification and
//! persistence failures degrade inside the pipeline and are logged, never
//! returned; a policy refusal is an outcome, not an error.

use thiserror::Error;
use tollgate_llm::{ProtocolError, UpstreamError};

/// A collaborator lookup failed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The store could not be reached; the lookup may succeed if retried.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// The store answered with something unusable.
    #[error("store error: {0}")]
    Backend(String),
}

impl StoreError {
    /// Whether retrying the same idempotent lookup may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

/// Server-side tool execution failed.
///
/// The pipeline turns this into a `{"error": ...}` tool result so the model
/// sees the failure in the continuation.
#[derive(Error, Debug)]
pub enum ExecutionError {
    /// No MCP server is bound to the tool.
    #[error("tool '{0}' is not bound to an MCP server")]
    Unbound(String),

    /// The tool server could not be reached or answered badly.
    #[error("tool '{tool}' failed: {message}")]
    Failed {
        /// Tool name.
        tool: String,
        /// What went wrong.
        message: String,
    },
}

/// The audit recorder failed. Logged, never surfaced.
#[derive(Error, Debug)]
#[error("failed to persist interaction: {0}")]
pub struct PersistenceError(pub String);

/// A request could not be served.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// The client sent a malformed provider payload.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// The provider call failed.
    #[error(transparent)]
    Upstream(#[from] UpstreamError),

    /// A tool, agent, or policy lookup failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The agent named in the route does not exist.
    #[error("agent not found: {0}")]
    AgentNotFound(String),
}

impl PipelineError {
    /// HTTP status to answer with.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Protocol(_) => 400,
            Self::AgentNotFound(_) => 404,
            Self::Upstream(e) => e.status().unwrap_or(500),
            Self::Store(_) => 503,
        }
    }

    /// The `error.type` field of the error body.
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::Protocol(_) => "invalid_request_error",
            Self::AgentNotFound(_) => "not_found_error",
            Self::Upstream(_) => "upstream_error",
            Self::Store(_) => "service_unavailable",
        }
    }

    /// The `error.message` field of the error body.
    pub fn client_message(&self) -> String {
        match self {
            Self::Upstream(e) => e.client_message(),
            other => other.to_string(),
        }
    }

    /// `{"error": {"message": ..., "type": ...}}`.
    pub fn to_body(&self) -> serde_json::Value {
        serde_json::json!({
            "error": {
                "message": self.client_message(),
                "type": self.error_type(),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_retryable() {
        assert!(StoreError::Unavailable("down".into()).is_retryable());
        assert!(!StoreError::Backend("bad".into()).is_retryable());
    }

    #[test]
    fn protocol_is_400() {
        let err = PipelineError::from(ProtocolError::missing("messages"));
        assert_eq!(err.status_code(), 400);
        assert_eq!(err.to_body()["error"]["type"], "invalid_request_error");
        assert_eq!(
            err.to_body()["error"]["message"],
            "malformed payload at 'messages': missing required field"
        );
    }

    #[test]
    fn upstream_status_passthrough() {
        let err = PipelineError::from(UpstreamError::Status {
            status: 429,
            body: r#"{"error":{"message":"slow down"}}"#.into(),
        });
        assert_eq!(err.status_code(), 429);
        assert_eq!(err.client_message(), "slow down");
    }

    #[test]
    fn upstream_without_status_is_500() {
        let err = PipelineError::from(UpstreamError::Timeout);
        assert_eq!(err.status_code(), 500);
        assert_eq!(err.error_type(), "upstream_error");
    }

    #[test]
    fn agent_not_found_is_404() {
        let err = PipelineError::AgentNotFound("ghost".into());
        assert_eq!(err.status_code(), 404);
        assert_eq!(err.to_body()["error"]["message"], "agent not found: ghost");
    }

    #[test]
    fn store_is_503() {
        let err = PipelineError::from(StoreError::Unavailable("db".into()));
        assert_eq!(err.status_code(), 503);
    }
}
