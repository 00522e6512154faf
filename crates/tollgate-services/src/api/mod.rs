//! Proxy HTTP API.
//!
//! Each supported provider is mounted under `/v1/{provider}` with the
//! provider's own path layout, with and without an explicit agent id, so
//! clients only change their base URL.

pub mod credentials;
pub mod handlers;
pub mod response;

use std::future::Future;
use std::sync::Arc;

use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use tollgate_core::{
    InMemoryStore, InteractionRecorder, Pipeline, PipelineDeps, PipelineSettings, ToolExecutor,
};
use tollgate_llm::HttpUpstream;
use tollgate_types::config::{Config, ProvidersConfig};

use crate::error::Result;
use crate::mcp::McpToolExecutor;
use crate::recorder::JsonlRecorder;

/// Shared state accessible by all API handlers.
#[derive(Clone)]
pub struct ProxyState {
    /// The guardrail pipeline.
    pub pipeline: Arc<Pipeline>,
    /// Provider settings, for fallback credentials.
    pub providers: Arc<ProvidersConfig>,
}

impl ProxyState {
    /// State over an already-built pipeline.
    pub fn new(pipeline: Arc<Pipeline>, providers: ProvidersConfig) -> Self {
        Self {
            pipeline,
            providers: Arc::new(providers),
        }
    }

    /// Wire the production collaborators described by `config`.
    pub fn from_config(config: &Config) -> Self {
        let store = Arc::new(InMemoryStore::from_config(config));

        let executor: Option<Arc<dyn ToolExecutor>> = if config.mcp.servers.is_empty() {
            None
        } else {
            Some(Arc::new(McpToolExecutor::from_config(&config.mcp)))
        };

        let recorder: Option<Arc<dyn InteractionRecorder>> =
            config.audit.resolved_path().map(|path| {
                info!(path = %path.display(), "recording interactions");
                Arc::new(JsonlRecorder::new(path)) as Arc<dyn InteractionRecorder>
            });

        let deps = PipelineDeps {
            upstream: Arc::new(HttpUpstream::new(&config.providers)),
            tools: store.clone(),
            policies: store,
            executor,
            recorder,
        };
        let pipeline = Pipeline::new(deps, PipelineSettings::from_config(config));
        Self::new(Arc::new(pipeline), config.providers.clone())
    }
}

impl std::fmt::Debug for ProxyState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyState").finish_non_exhaustive()
    }
}

/// Build the proxy router. CORS is only enabled when origins are listed.
pub fn build_router(state: ProxyState, cors_origins: &[String]) -> Router {
    handlers::mark_start();

    let mut router = handlers::proxy_routes()
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    if !cors_origins.is_empty() {
        let origins: Vec<_> = cors_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        router = router.layer(
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods(Any)
                .allow_headers(Any),
        );
    }
    router
}

/// Bind `server.host:server.port` and serve the proxy until `shutdown`
/// resolves.
pub async fn serve<F>(config: &Config, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let router = build_router(ProxyState::from_config(config), &config.server.cors_origins);
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(
        addr = %listener.local_addr()?,
        agents = config.agents.len(),
        mcp_servers = config.mcp.servers.len(),
        "tollgate proxy listening"
    );
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await?;
    info!("tollgate proxy stopped");
    Ok(())
}
