//! MCP transport.
//!
//! Provides the [`McpTransport`] trait and [`HttpTransport`], which posts
//! each JSON-RPC request to the server's endpoint.

use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use tollgate_types::config::McpServerConfig;

use super::types::{JsonRpcRequest, JsonRpcResponse};
use crate::error::{Result, ServiceError};

/// Transport layer for MCP JSON-RPC communication.
#[async_trait]
pub trait McpTransport: Send + Sync {
    /// Send a JSON-RPC request and return the response.
    async fn send_request(&self, request: JsonRpcRequest) -> Result<JsonRpcResponse>;
}

/// Transport that communicates via HTTP POST.
pub struct HttpTransport {
    client: reqwest::Client,
    endpoint: String,
    headers: Vec<(String, String)>,
    timeout: Duration,
}

impl HttpTransport {
    /// Create a transport for a configured server.
    pub fn new(config: &McpServerConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: config.url.clone(),
            headers: config
                .headers
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            timeout: Duration::from_secs(config.timeout_secs),
        }
    }
}

#[async_trait]
impl McpTransport for HttpTransport {
    async fn send_request(&self, request: JsonRpcRequest) -> Result<JsonRpcResponse> {
        debug!(
            method = %request.method,
            id = request.id,
            endpoint = %self.endpoint,
            "sending MCP request"
        );

        let mut req = self
            .client
            .post(&self.endpoint)
            .timeout(self.timeout)
            .header("Accept", "application/json")
            .json(&request);
        for (k, v) in &self.headers {
            req = req.header(k.as_str(), v.as_str());
        }

        let resp = req
            .send()
            .await
            .map_err(|e| ServiceError::McpTransport(format!("HTTP request failed: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ServiceError::McpTransport(format!("HTTP {status}: {body}")));
        }

        resp.json()
            .await
            .map_err(|e| ServiceError::McpTransport(format!("failed to parse response: {e}")))
    }
}

impl std::fmt::Debug for HttpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpTransport")
            .field("endpoint", &self.endpoint)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

/// A transport that answers from a script, for tests.
#[cfg(test)]
pub struct MockTransport {
    responses: std::sync::Mutex<Vec<Result<JsonRpcResponse>>>,
    requests: std::sync::Mutex<Vec<JsonRpcRequest>>,
}

#[cfg(test)]
impl MockTransport {
    /// Responses are returned in order.
    pub fn new(responses: Vec<Result<JsonRpcResponse>>) -> Self {
        Self {
            responses: std::sync::Mutex::new(responses),
            requests: std::sync::Mutex::new(Vec::new()),
        }
    }

    /// Requests sent so far.
    pub fn requests(&self) -> Vec<JsonRpcRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[cfg(test)]
#[async_trait]
impl McpTransport for MockTransport {
    async fn send_request(&self, request: JsonRpcRequest) -> Result<JsonRpcResponse> {
        self.requests.lock().unwrap().push(request);
        let mut responses = self.responses.lock().unwrap();
        if responses.is_empty() {
            Err(ServiceError::McpTransport("no more mock responses".into()))
        } else {
            responses.remove(0)
        }
    }
}
