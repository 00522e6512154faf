//! MCP (Model Context Protocol) client.
//!
//! Executes agent-assigned tools on the MCP server they are bound to,
//! using JSON-RPC 2.0 `tools/call` over HTTP.

pub mod transport;
pub mod types;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, info};

use tollgate_core::error::ExecutionError;
use tollgate_core::store::ToolExecutor;
use tollgate_types::config::McpConfig;
use tollgate_types::{ToolCall, ToolDefinition};

use crate::error::{Result, ServiceError};
use transport::{HttpTransport, McpTransport};
use types::{CallToolResult, JsonRpcRequest};

/// Client for one MCP server.
pub struct McpClient {
    transport: Arc<dyn McpTransport>,
    request_id: AtomicU64,
}

impl std::fmt::Debug for McpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("McpClient")
            .field("request_id", &self.request_id.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl McpClient {
    /// Create a new MCP client with the given transport.
    pub fn new(transport: Arc<dyn McpTransport>) -> Self {
        Self {
            transport,
            request_id: AtomicU64::new(1),
        }
    }

    /// Call a tool and return its result.
    ///
    /// A JSON-RPC error becomes [`ServiceError::McpProtocol`]; a result with
    /// `isError` set is returned as-is for the caller to interpret.
    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<CallToolResult> {
        let id = self.next_id();
        let request = JsonRpcRequest::new(
            id,
            "tools/call",
            serde_json::json!({
                "name": name,
                "arguments": arguments,
            }),
        );

        let response = self.transport.send_request(request).await?;

        if let Some(err) = response.error {
            return Err(ServiceError::McpProtocol(format!(
                "code={}, message={}",
                err.code, err.message
            )));
        }

        let result = response
            .result
            .ok_or_else(|| ServiceError::McpProtocol("empty result".into()))?;
        Ok(serde_json::from_value(result)?)
    }

    fn next_id(&self) -> u64 {
        self.request_id.fetch_add(1, Ordering::Relaxed)
    }
}

/// [`ToolExecutor`] that routes each call to the MCP server its tool is
/// bound to.
#[derive(Debug, Default)]
pub struct McpToolExecutor {
    clients: HashMap<String, McpClient>,
}

impl McpToolExecutor {
    /// One HTTP client per configured server.
    pub fn from_config(config: &McpConfig) -> Self {
        let clients = config
            .servers
            .iter()
            .map(|server| {
                info!(server = %server.name, url = %server.url, "registering MCP server");
                let transport: Arc<dyn McpTransport> = Arc::new(HttpTransport::new(server));
                (server.name.clone(), McpClient::new(transport))
            })
            .collect();
        Self { clients }
    }

    /// Register (or replace) a server's client.
    pub fn insert(&mut self, name: impl Into<String>, client: McpClient) {
        self.clients.insert(name.into(), client);
    }

    /// Number of registered servers.
    pub fn len(&self) -> usize {
        self.clients.len()
    }

    /// Whether no server is registered.
    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}

#[async_trait]
impl ToolExecutor for McpToolExecutor {
    async fn execute(
        &self,
        agent_id: &str,
        tool: &ToolDefinition,
        call: &ToolCall,
    ) -> std::result::Result<String, ExecutionError> {
        let failed = |message: String| ExecutionError::Failed {
            tool: tool.name.clone(),
            message,
        };

        let server = tool
            .mcp_server
            .as_deref()
            .ok_or_else(|| ExecutionError::Unbound(tool.name.clone()))?;
        let client = self
            .clients
            .get(server)
            .ok_or_else(|| failed(format!("unknown mcp server '{server}'")))?;

        let arguments = call.parsed_arguments();
        if !arguments.is_object() {
            return Err(failed("arguments are not a JSON object".into()));
        }

        debug!(agent_id, tool = %tool.name, server, call_id = %call.id, "executing tool");
        let result = client
            .call_tool(&tool.name, arguments)
            .await
            .map_err(|e| failed(e.to_string()))?;

        if result.is_error {
            return Err(failed(result.text()));
        }
        Ok(result.text())
    }
}
