//! Error types for tollgate-llm.
//!
//! [`ProtocolError`] is raised when a provider payload (client request or
//! upstream response) does not have the expected shape; it carries the
//! JSON path of the offending field. [`UpstreamError`] is raised when the
//! upstream call itself fails.

use thiserror::Error;

/// A malformed provider payload.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("malformed payload at '{path}': {message}")]
pub struct ProtocolError {
    /// JSON path of the offending field, e.g. `messages[2].tool_calls[0].id`.
    pub path: String,
    /// What is wrong with it.
    pub message: String,
}

impl ProtocolError {
    /// Create an error for `path`.
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }

    /// A required field is absent.
    pub fn missing(path: impl Into<String>) -> Self {
        Self::new(path, "missing required field")
    }

    /// A field has the wrong JSON type.
    pub fn expected(path: impl Into<String>, what: &str) -> Self {
        Self::new(path, format!("expected {what}"))
    }
}

/// A failed upstream provider call.
#[derive(Error, Debug)]
pub enum UpstreamError {
    /// The provider answered with a non-success status.
    #[error("upstream returned HTTP {status}: {body}")]
    Status {
        /// HTTP status code from the provider.
        status: u16,
        /// Response body, verbatim.
        body: String,
    },

    /// The request timed out.
    #[error("upstream request timed out")]
    Timeout,

    /// Connection or transport failure.
    #[error("upstream request failed: {0}")]
    Transport(String),

    /// The provider answered 2xx with a body we could not interpret.
    #[error("invalid upstream response: {0}")]
    InvalidResponse(#[from] ProtocolError),
}

impl UpstreamError {
    /// The provider's HTTP status, when it sent one.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// A client-facing message: the provider's own error message when it
    /// sent a structured error body, else the display string.
    pub fn client_message(&self) -> String {
        if let Self::Status { body, .. } = self
            && let Some(msg) = extract_error_message(body)
        {
            return msg;
        }
        self.to_string()
    }
}

impl From<reqwest::Error> for UpstreamError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout
        } else {
            Self::Transport(e.to_string())
        }
    }
}

/// Pull `error.message` (OpenAI, Anthropic, Gemini) out of an error body.
fn extract_error_message(body: &str) -> Option<String> {
    let json: serde_json::Value = serde_json::from_str(body).ok()?;
    json.get("error")
        .and_then(|e| e.get("message"))
        .and_then(|m| m.as_str())
        .map(String::from)
}
