//! Services for the tollgate proxy.
//!
//! Provides the HTTP proxy API in front of the guardrail pipeline, the MCP
//! client that executes agent-assigned tools, and the JSONL interaction
//! recorder.

pub mod api;
pub mod error;
pub mod mcp;
pub mod recorder;

pub use api::{ProxyState, build_router, serve};
pub use error::{Result, ServiceError};
pub use mcp::McpToolExecutor;
pub use recorder::JsonlRecorder;
