//! Pipeline Orchestrator.
//!
//! Sequences one proxied request:
//!
//! 1. **Agent**: resolve the agent from the route, the client name, or the
//!    default-agent fallback.
//! 2. **Normalize**: parse the provider body and convert its messages to the
//!    Common Message Model.
//! 3. **Classify**: fetch the agent's assigned tools once and run the
//!    [`TrustClassifier`] against them.
//! 4. **Upstream body**: apply the verdict's message updates and merge tools
//!    ([`inject_tools`]). The client's body is never modified.
//! 5. **Complete**: call the provider once.
//! 6. **Policy**: tag the returned tool calls with the verdict and run the
//!    [`PolicyEvaluator`]. A refusal replaces the calls with assistant text.
//! 7. **Execute**: when every allowed call names an MCP-bound assigned tool,
//!    execute the calls and issue one continuation call.
//! 8. **Audit**: hand the exchange to the [`AuditDispatcher`] without
//!    waiting for it.
//!
//! Streaming requests follow the same sequence in [`Pipeline::handle_stream`].

mod stream;

#[cfg(test)]
pub(crate) mod fakes;

pub use stream::StreamItem;

use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::{debug, info};
use uuid::Uuid;

use tollgate_llm::{
    Credentials, ProtocolAdapter, ProviderRequest, RouteInfo, Upstream, UpstreamCall,
    UpstreamError, adapter_for,
};
use tollgate_types::config::{ClassifierConfig, Config};
use tollgate_types::{
    Agent, CommonMessage, Interaction, InteractionStatus, ProviderKind, ToolCall, ToolDefinition,
    TrustVerdict, UsageTokens,
};

use crate::audit::AuditDispatcher;
use crate::classifier::{ProgressSink, TrustClassifier};
use crate::error::PipelineError;
use crate::injector::inject_tools;
use crate::policy::{PolicyEvaluator, Refusal};
use crate::retry::{RetryConfig, with_retry};
use crate::store::{InteractionRecorder, PolicyStore, ToolExecutor, ToolResult, ToolStore};

/// One request as received by the proxy.
#[derive(Debug, Clone)]
pub struct ProxyRequest {
    /// Protocol selected by the route.
    pub kind: ProviderKind,
    /// Agent id from the route, if the client named one.
    pub agent_id: Option<String>,
    /// Client name derived from the request (e.g. the `User-Agent` product).
    pub client_name: String,
    /// Values taken from the route rather than the body.
    pub route: RouteInfo,
    /// The request body as received.
    pub body: Value,
    /// Credential forwarded upstream and used for classification.
    pub credentials: Credentials,
}

/// Collaborators the pipeline runs against.
#[derive(Clone)]
pub struct PipelineDeps {
    /// Provider endpoint.
    pub upstream: Arc<dyn Upstream>,
    /// Agent and assigned-tool lookups.
    pub tools: Arc<dyn ToolStore>,
    /// Policy lookups.
    pub policies: Arc<dyn PolicyStore>,
    /// Server-side tool execution; `None` leaves every call to the client.
    pub executor: Option<Arc<dyn ToolExecutor>>,
    /// Audit sink; `None` disables auditing.
    pub recorder: Option<Arc<dyn InteractionRecorder>>,
}

/// Behaviour switches.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    /// Trust classifier configuration.
    pub classifier: ClassifierConfig,
    /// Execute MCP-bound assigned tools and continue server-side.
    pub execute_assigned_tools: bool,
    /// Retry policy for store lookups.
    pub retry: RetryConfig,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            classifier: ClassifierConfig::default(),
            execute_assigned_tools: true,
            retry: RetryConfig::default(),
        }
    }
}

impl PipelineSettings {
    /// Settings from the loaded configuration.
    pub fn from_config(config: &Config) -> Self {
        Self {
            classifier: config.classifier.clone(),
            execute_assigned_tools: config.pipeline.execute_assigned_tools,
            retry: RetryConfig::default(),
        }
    }
}

/// A parsed request bound to its agent.
struct Intake {
    adapter: &'static dyn ProtocolAdapter,
    agent_id: String,
    request: ProviderRequest,
    credentials: Credentials,
    client_body: Value,
    original_messages: Vec<Value>,
    common: Vec<CommonMessage>,
    request_tools: tollgate_llm::RequestTools,
}

/// A classified request ready for the upstream call.
struct Screened {
    adapter: &'static dyn ProtocolAdapter,
    agent_id: String,
    kind: ProviderKind,
    model: String,
    credentials: Credentials,
    client_body: Value,
    original_messages: Vec<Value>,
    /// Common messages with the verdict applied.
    common: Vec<CommonMessage>,
    verdict: TrustVerdict,
    assigned: Vec<ToolDefinition>,
    /// Body sent upstream.
    body: Map<String, Value>,
}

impl Screened {
    fn call(&self) -> UpstreamCall<'_> {
        self.call_with(&self.body)
    }

    fn call_with<'a>(&'a self, body: &'a Map<String, Value>) -> UpstreamCall<'a> {
        UpstreamCall {
            kind: self.kind,
            model: &self.model,
            body,
            credentials: &self.credentials,
        }
    }

    /// Body for the continuation after `assistant` asked for tools and
    /// `results` came back.
    fn continuation_body(
        &self,
        assistant: &CommonMessage,
        results: &[ToolResult],
    ) -> Result<Map<String, Value>, PipelineError> {
        let mut common = self.common.clone();
        let mut assistant = assistant.clone();
        assistant.origin = None;
        common.push(assistant);
        common.extend(
            results
                .iter()
                .map(|r| {
                    CommonMessage::tool_result(&r.call_id, Some(r.name.clone()), &r.content)
                        .failed(r.is_error)
                }),
        );
        let messages = self.adapter.from_common(&common, &self.original_messages)?;
        let mut body = self.body.clone();
        self.adapter.set_messages(&mut body, messages);
        Ok(body)
    }

    fn record(&self, status: InteractionStatus, response: Value, usage: UsageTokens) -> Interaction {
        Interaction::new(
            self.agent_id.clone(),
            self.kind,
            status,
            self.client_body.clone(),
            response,
            usage,
        )
    }
}

/// Tag every call with the verdict's trust classification.
fn tag_calls(calls: &mut [ToolCall], verdict: &TrustVerdict) {
    let tag = verdict.tag();
    for call in calls {
        call.trust_tag = Some(tag);
    }
}

/// The guardrail pipeline.
pub struct Pipeline {
    upstream: Arc<dyn Upstream>,
    tools: Arc<dyn ToolStore>,
    policies: PolicyEvaluator,
    executor: Option<Arc<dyn ToolExecutor>>,
    classifier: TrustClassifier,
    audit: AuditDispatcher,
    retry: RetryConfig,
    execute_assigned_tools: bool,
    surface_progress: bool,
}

impl Pipeline {
    /// Wire a pipeline from its collaborators.
    pub fn new(deps: PipelineDeps, settings: PipelineSettings) -> Self {
        let classifier = TrustClassifier::new(deps.upstream.clone(), settings.classifier.clone());
        let audit = match deps.recorder {
            Some(recorder) => AuditDispatcher::new(recorder),
            None => AuditDispatcher::disabled(),
        };
        Self {
            upstream: deps.upstream,
            tools: deps.tools,
            policies: PolicyEvaluator::new(deps.policies, settings.retry.clone()),
            executor: deps.executor,
            classifier,
            audit,
            retry: settings.retry,
            execute_assigned_tools: settings.execute_assigned_tools,
            surface_progress: settings.classifier.surface_progress,
        }
    }

    /// Whether a request body asks for a streamed response.
    pub fn wants_stream(kind: ProviderKind, body: &Value, route: &RouteInfo) -> bool {
        match kind {
            ProviderKind::Gemini => route.stream.unwrap_or(false),
            _ => body.get("stream").and_then(Value::as_bool).unwrap_or(false),
        }
    }

    /// Resolve the agent a request runs for.
    ///
    /// An explicit id must exist. Otherwise the agent bound to the client
    /// name is used, then the default agent, and finally a new agent is
    /// created for the client.
    pub async fn resolve_agent(
        &self,
        explicit: Option<&str>,
        client_name: &str,
    ) -> Result<Agent, PipelineError> {
        if let Some(id) = explicit {
            return with_retry(&self.retry, "agent", || self.tools.find_agent_by_id(id))
                .await?
                .ok_or_else(|| PipelineError::AgentNotFound(id.to_owned()));
        }

        if let Some(agent) = with_retry(&self.retry, "client agent", || {
            self.tools.find_agent_for_client(client_name)
        })
        .await?
        {
            return Ok(agent);
        }

        if let Some(agent) =
            with_retry(&self.retry, "default agent", || self.tools.find_default_agent()).await?
        {
            return Ok(agent);
        }

        let agent = Agent::for_client(Uuid::new_v4().to_string(), client_name);
        info!(agent_id = %agent.id, client = client_name, "no agent for client, creating one");
        Ok(self.tools.create_agent(agent).await?)
    }

    async fn intake(&self, req: ProxyRequest) -> Result<Intake, PipelineError> {
        let adapter = adapter_for(req.kind);
        let client_body = req.body.clone();
        let request = adapter.parse_request(req.body, &req.route)?;
        let agent = self
            .resolve_agent(req.agent_id.as_deref(), &req.client_name)
            .await?;

        let original_messages = adapter.request_messages(&request.body)?.to_vec();
        let common = adapter.to_common(&original_messages)?;
        let request_tools = adapter.request_tools(&request.body)?;

        info!(
            agent_id = %agent.id,
            provider = %req.kind,
            model = %request.model,
            stream = request.stream,
            messages = common.len(),
            "proxying request"
        );

        Ok(Intake {
            adapter,
            agent_id: agent.id,
            request,
            credentials: req.credentials,
            client_body,
            original_messages,
            common,
            request_tools,
        })
    }

    async fn screen(&self, intake: Intake, sink: &dyn ProgressSink) -> Result<Screened, PipelineError> {
        let Intake {
            adapter,
            agent_id,
            request,
            credentials,
            client_body,
            original_messages,
            common,
            request_tools,
        } = intake;

        let assigned = with_retry(&self.retry, "assigned tools", || {
            self.tools.find_assigned_tools(&agent_id)
        })
        .await?;
        let verdict = self
            .classifier
            .evaluate(&common, &agent_id, &assigned, &credentials, request.kind, sink)
            .await;
        debug!(
            agent_id = %agent_id,
            trusted = verdict.context_is_trusted,
            updates = verdict.message_updates.len(),
            assigned = assigned.len(),
            "request classified"
        );

        let common = verdict.apply_to(&common);
        let mut body = request.body;
        if !verdict.message_updates.is_empty() {
            let messages = adapter.from_common(&common, &original_messages)?;
            adapter.set_messages(&mut body, messages);
        }
        if !assigned.is_empty() {
            let merged = inject_tools(&request_tools.functions, &assigned);
            adapter.set_tools(&mut body, &merged, &request_tools.opaque);
        }

        Ok(Screened {
            adapter,
            agent_id,
            kind: request.kind,
            model: request.model,
            credentials,
            client_body,
            original_messages,
            common,
            verdict,
            assigned,
            body,
        })
    }

    /// The calls to execute server-side, or `None` to leave them to the
    /// client.
    fn executable_calls(
        &self,
        calls: &[ToolCall],
        assigned: &[ToolDefinition],
    ) -> Option<(Arc<dyn ToolExecutor>, Vec<(ToolDefinition, ToolCall)>)> {
        if !self.execute_assigned_tools || calls.is_empty() {
            return None;
        }
        let executor = self.executor.clone()?;
        let batch = calls
            .iter()
            .map(|call| {
                assigned
                    .iter()
                    .find(|t| t.name == call.name && t.mcp_server.is_some())
                    .map(|tool| (tool.clone(), call.clone()))
            })
            .collect::<Option<Vec<_>>>()?;
        Some((executor, batch))
    }

    /// Serve a buffered request. Returns the provider-shaped response body.
    pub async fn handle(&self, req: ProxyRequest) -> Result<Value, PipelineError> {
        let intake = self.intake(req).await?;
        let screened = self.screen(intake, &crate::classifier::NoopSink).await?;
        let adapter = screened.adapter;

        let response = self.upstream.complete(screened.call()).await?;
        let mut usage = adapter.response_usage(&response);
        let mut message = adapter
            .parse_response(&response)
            .map_err(UpstreamError::from)?;
        tag_calls(&mut message.tool_calls, &screened.verdict);

        if message.tool_calls.is_empty() {
            return Ok(self.finish(&screened, InteractionStatus::Completed, response, usage));
        }

        let trusted = screened.verdict.context_is_trusted;
        if let Some(refusal) = self
            .policies
            .evaluate_policies(&message.tool_calls, &screened.agent_id, trusted)
            .await?
        {
            return Ok(self.refuse(&screened, &response, &refusal, usage));
        }

        let Some((executor, batch)) = self.executable_calls(&message.tool_calls, &screened.assigned)
        else {
            debug!(agent_id = %screened.agent_id, calls = message.tool_calls.len(), "returning tool calls to client");
            return Ok(self.finish(&screened, InteractionStatus::Completed, response, usage));
        };

        info!(agent_id = %screened.agent_id, calls = batch.len(), "executing assigned tools");
        let results = executor
            .execute_tool_calls(&screened.agent_id, &batch)
            .await;
        let body = screened.continuation_body(&message, &results)?;

        let response = self.upstream.complete(screened.call_with(&body)).await?;
        usage += adapter.response_usage(&response);
        let mut followup = adapter
            .parse_response(&response)
            .map_err(UpstreamError::from)?;

        let trusted = trusted && batch.iter().all(|(tool, _)| tool.trusted);
        let verdict = if trusted {
            TrustVerdict::trusted()
        } else {
            TrustVerdict::untrusted()
        };
        tag_calls(&mut followup.tool_calls, &verdict);
        if let Some(refusal) = self
            .policies
            .evaluate_policies(&followup.tool_calls, &screened.agent_id, trusted)
            .await?
        {
            return Ok(self.refuse(&screened, &response, &refusal, usage));
        }
        Ok(self.finish(&screened, InteractionStatus::Completed, response, usage))
    }

    fn refuse(&self, screened: &Screened, response: &Value, refusal: &Refusal, usage: UsageTokens) -> Value {
        info!(agent_id = %screened.agent_id, reason = %refusal.internal_reason, "refusing tool calls");
        let body = screened
            .adapter
            .refusal_response(response, &refusal.user_message);
        self.finish(screened, InteractionStatus::Refused, body, usage)
    }

    fn finish(&self, screened: &Screened, status: InteractionStatus, body: Value, usage: UsageTokens) -> Value {
        self.audit
            .dispatch(screened.record(status, body.clone(), usage));
        body
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("execute_assigned_tools", &self.execute_assigned_tools)
            .field("surface_progress", &self.surface_progress)
            .field("audit", &self.audit)
            .finish_non_exhaustive()
    }
}
