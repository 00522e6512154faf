//! HTTP request handlers for the proxy routes.

use std::collections::HashMap;
use std::sync::OnceLock;
use std::time::Instant;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::Value;

use tollgate_core::{Pipeline, PipelineError, ProxyRequest};
use tollgate_llm::{ProtocolError, RouteInfo};
use tollgate_types::ProviderKind;

use super::ProxyState;
use super::credentials::{client_name, extract_credentials};
use super::response::{error_response, sse_response};

/// Build all proxy routes.
pub fn proxy_routes() -> Router<ProxyState> {
    Router::new()
        // OpenAI
        .route("/v1/openai/chat/completions", post(openai))
        .route("/v1/openai/{agent_id}/chat/completions", post(openai_for_agent))
        // Anthropic
        .route("/v1/anthropic/v1/messages", post(anthropic))
        .route("/v1/anthropic/{agent_id}/v1/messages", post(anthropic_for_agent))
        // Gemini: the last segment is `{model}:{action}`
        .route("/v1/gemini/v1beta/models/{target}", post(gemini))
        .route("/v1/gemini/{agent_id}/v1beta/models/{target}", post(gemini_for_agent))
        // Health check
        .route("/health", get(health_check))
}

/// Everything a proxy handler extracts before running the pipeline.
struct Inbound {
    headers: HeaderMap,
    query: HashMap<String, String>,
    body: Bytes,
}

async fn openai(
    State(state): State<ProxyState>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let inbound = Inbound { headers, query, body };
    proxy(state, ProviderKind::OpenAi, None, RouteInfo::default(), inbound).await
}

async fn openai_for_agent(
    State(state): State<ProxyState>,
    Path(agent_id): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let inbound = Inbound { headers, query, body };
    proxy(state, ProviderKind::OpenAi, Some(agent_id), RouteInfo::default(), inbound).await
}

async fn anthropic(
    State(state): State<ProxyState>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let inbound = Inbound { headers, query, body };
    proxy(state, ProviderKind::Anthropic, None, RouteInfo::default(), inbound).await
}

async fn anthropic_for_agent(
    State(state): State<ProxyState>,
    Path(agent_id): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let inbound = Inbound { headers, query, body };
    proxy(state, ProviderKind::Anthropic, Some(agent_id), RouteInfo::default(), inbound).await
}

async fn gemini(
    State(state): State<ProxyState>,
    Path(target): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let route = match gemini_route(&target) {
        Ok(route) => route,
        Err(e) => return error_response(&PipelineError::from(e)),
    };
    let inbound = Inbound { headers, query, body };
    proxy(state, ProviderKind::Gemini, None, route, inbound).await
}

async fn gemini_for_agent(
    State(state): State<ProxyState>,
    Path((agent_id, target)): Path<(String, String)>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let route = match gemini_route(&target) {
        Ok(route) => route,
        Err(e) => return error_response(&PipelineError::from(e)),
    };
    let inbound = Inbound { headers, query, body };
    proxy(state, ProviderKind::Gemini, Some(agent_id), route, inbound).await
}

/// Split `gemini-2.0-flash:streamGenerateContent` into model and streaming
/// flag.
pub fn gemini_route(target: &str) -> Result<RouteInfo, ProtocolError> {
    let (model, action) = target
        .split_once(':')
        .ok_or_else(|| ProtocolError::new("path", "expected models/{model}:{action}"))?;
    if model.is_empty() {
        return Err(ProtocolError::missing("model"));
    }
    let stream = match action {
        "generateContent" => false,
        "streamGenerateContent" => true,
        other => {
            return Err(ProtocolError::new(
                "path",
                format!("unsupported action '{other}'"),
            ));
        }
    };
    Ok(RouteInfo {
        model: Some(model.to_owned()),
        stream: Some(stream),
    })
}

async fn proxy(
    state: ProxyState,
    kind: ProviderKind,
    agent_id: Option<String>,
    route: RouteInfo,
    inbound: Inbound,
) -> Response {
    let body: Value = match serde_json::from_slice(&inbound.body) {
        Ok(body) => body,
        Err(e) => {
            let err = ProtocolError::new("$", format!("body is not JSON: {e}"));
            return error_response(&PipelineError::from(err));
        }
    };

    let req = ProxyRequest {
        kind,
        agent_id,
        client_name: client_name(&inbound.headers),
        credentials: extract_credentials(kind, &inbound.headers, &inbound.query, &state.providers),
        route,
        body,
    };

    if Pipeline::wants_stream(kind, &req.body, &req.route) {
        match state.pipeline.clone().handle_stream(req).await {
            Ok(rx) => sse_response(rx).await,
            Err(e) => error_response(&e),
        }
    } else {
        match state.pipeline.handle(req).await {
            Ok(body) => Json(body).into_response(),
            Err(e) => error_response(&e),
        }
    }
}

/// Server start time, set when the router is built.
static START_TIME: OnceLock<Instant> = OnceLock::new();

pub(super) fn mark_start() {
    START_TIME.get_or_init(Instant::now);
}

/// Returns basic health status, version, and uptime.
async fn health_check() -> Json<Value> {
    let start = START_TIME.get_or_init(Instant::now);
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": start.elapsed().as_secs()
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gemini_generate() {
        let route = gemini_route("gemini-2.0-flash:generateContent").unwrap();
        assert_eq!(route.model.as_deref(), Some("gemini-2.0-flash"));
        assert_eq!(route.stream, Some(false));
    }

    #[test]
    fn gemini_stream() {
        let route = gemini_route("gemini-2.0-flash:streamGenerateContent").unwrap();
        assert_eq!(route.stream, Some(true));
    }

    #[test]
    fn gemini_bad_targets() {
        assert!(gemini_route("gemini-2.0-flash").is_err());
        assert!(gemini_route(":generateContent").is_err());
        let err = gemini_route("gemini-2.0-flash:countTokens").unwrap_err();
        assert!(err.to_string().contains("unsupported action 'countTokens'"));
    }
}
