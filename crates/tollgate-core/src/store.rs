//! Collaborator contracts consumed by the pipeline.
//!
//! The pipeline reads agents, assigned tools, and policies through
//! [`ToolStore`] and [`PolicyStore`], executes server-side tools through
//! [`ToolExecutor`], and hands finished exchanges to an
//! [`InteractionRecorder`]. [`InMemoryStore`] serves the first two from the
//! `agents` section of the config file.

use std::sync::{Mutex, RwLock};

use async_trait::async_trait;
use futures_util::future::join_all;
use tracing::{debug, error};

use tollgate_types::config::{AgentConfig, Config};
use tollgate_types::{Agent, Interaction, Policy, ToolCall, ToolDefinition};

use crate::error::{ExecutionError, PersistenceError, StoreError};

// ── Contracts ───────────────────────────────────────────────────────────

/// Agents and their assigned tools.
#[async_trait]
pub trait ToolStore: Send + Sync {
    /// Look up an agent by id.
    async fn find_agent_by_id(&self, id: &str) -> Result<Option<Agent>, StoreError>;

    /// The agent bound to a client name, if any.
    async fn find_agent_for_client(&self, client_name: &str) -> Result<Option<Agent>, StoreError>;

    /// The agent flagged as default, if any.
    async fn find_default_agent(&self) -> Result<Option<Agent>, StoreError>;

    /// Persist a new agent with no assigned tools or policies.
    async fn create_agent(&self, agent: Agent) -> Result<Agent, StoreError>;

    /// Tools assigned to an agent.
    async fn find_assigned_tools(&self, agent_id: &str) -> Result<Vec<ToolDefinition>, StoreError>;
}

/// Tool invocation policies.
#[async_trait]
pub trait PolicyStore: Send + Sync {
    /// The agent's policies, in evaluation order.
    async fn get_tool_invocation_policies(&self, agent_id: &str) -> Result<Vec<Policy>, StoreError>;
}

/// Output of one executed tool call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolResult {
    /// Call this result answers.
    pub call_id: String,
    /// Tool name.
    pub name: String,
    /// Result text handed back to the model.
    pub content: String,
    /// The call failed; `content` describes the failure.
    pub is_error: bool,
}

/// Runs assigned tools server-side.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    /// Execute one call of an assigned tool and return its text output.
    async fn execute(
        &self,
        agent_id: &str,
        tool: &ToolDefinition,
        call: &ToolCall,
    ) -> Result<String, ExecutionError>;

    /// Execute a batch concurrently. Results come back in call order;
    /// failures become `{"error": ...}` results.
    async fn execute_tool_calls(
        &self,
        agent_id: &str,
        calls: &[(ToolDefinition, ToolCall)],
    ) -> Vec<ToolResult> {
        let runs = calls.iter().map(|(tool, call)| async move {
            match self.execute(agent_id, tool, call).await {
                Ok(content) => ToolResult {
                    call_id: call.id.clone(),
                    name: call.name.clone(),
                    content,
                    is_error: false,
                },
                Err(e) => {
                    error!(tool = %call.name, error = %e, "tool execution failed");
                    ToolResult {
                        call_id: call.id.clone(),
                        name: call.name.clone(),
                        content: serde_json::json!({"error": e.to_string()}).to_string(),
                        is_error: true,
                    }
                }
            }
        });
        join_all(runs).await
    }
}

/// Audit sink for finished exchanges.
#[async_trait]
pub trait InteractionRecorder: Send + Sync {
    /// Persist one record.
    async fn record_interaction(&self, interaction: Interaction) -> Result<(), PersistenceError>;
}

// ── In-memory store ─────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct AgentEntry {
    agent: Agent,
    tools: Vec<ToolDefinition>,
    policies: Vec<Policy>,
}

impl From<&AgentConfig> for AgentEntry {
    fn from(cfg: &AgentConfig) -> Self {
        Self {
            agent: cfg.to_agent(),
            tools: cfg.tools.clone(),
            policies: cfg.policies.clone(),
        }
    }
}

/// Agent, tool, and policy store backed by the config file.
///
/// Reads dominate; agents created for unknown clients live until restart.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    agents: RwLock<Vec<AgentEntry>>,
}

impl InMemoryStore {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// A store seeded with the configured agents.
    pub fn from_config(config: &Config) -> Self {
        Self {
            agents: RwLock::new(config.agents.iter().map(AgentEntry::from).collect()),
        }
    }

    /// Add an agent with tools and policies.
    pub fn insert(&self, agent: Agent, tools: Vec<ToolDefinition>, policies: Vec<Policy>) {
        if let Ok(mut agents) = self.agents.write() {
            agents.retain(|e| e.agent.id != agent.id);
            agents.push(AgentEntry {
                agent,
                tools,
                policies,
            });
        }
    }

    /// Number of known agents.
    pub fn len(&self) -> usize {
        self.agents.read().map(|a| a.len()).unwrap_or(0)
    }

    /// Returns `true` if no agents are known.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read<T>(&self, f: impl FnOnce(&[AgentEntry]) -> T) -> Result<T, StoreError> {
        let agents = self
            .agents
            .read()
            .map_err(|_| StoreError::Backend("agent table lock poisoned".into()))?;
        Ok(f(&agents))
    }
}

#[async_trait]
impl ToolStore for InMemoryStore {
    async fn find_agent_by_id(&self, id: &str) -> Result<Option<Agent>, StoreError> {
        self.read(|agents| agents.iter().find(|e| e.agent.id == id).map(|e| e.agent.clone()))
    }

    async fn find_agent_for_client(&self, client_name: &str) -> Result<Option<Agent>, StoreError> {
        self.read(|agents| {
            agents
                .iter()
                .find(|e| e.agent.client_name.as_deref() == Some(client_name))
                .map(|e| e.agent.clone())
        })
    }

    async fn find_default_agent(&self) -> Result<Option<Agent>, StoreError> {
        self.read(|agents| agents.iter().find(|e| e.agent.is_default).map(|e| e.agent.clone()))
    }

    async fn create_agent(&self, agent: Agent) -> Result<Agent, StoreError> {
        let mut agents = self
            .agents
            .write()
            .map_err(|_| StoreError::Backend("agent table lock poisoned".into()))?;
        if let Some(existing) = agents.iter().find(|e| e.agent.id == agent.id) {
            return Ok(existing.agent.clone());
        }
        debug!(agent_id = %agent.id, name = %agent.name, "creating agent");
        agents.push(AgentEntry {
            agent: agent.clone(),
            tools: Vec::new(),
            policies: Vec::new(),
        });
        Ok(agent)
    }

    async fn find_assigned_tools(&self, agent_id: &str) -> Result<Vec<ToolDefinition>, StoreError> {
        self.read(|agents| {
            agents
                .iter()
                .find(|e| e.agent.id == agent_id)
                .map(|e| e.tools.clone())
                .unwrap_or_default()
        })
    }
}

#[async_trait]
impl PolicyStore for InMemoryStore {
    async fn get_tool_invocation_policies(&self, agent_id: &str) -> Result<Vec<Policy>, StoreError> {
        self.read(|agents| {
            agents
                .iter()
                .find(|e| e.agent.id == agent_id)
                .map(|e| e.policies.clone())
                .unwrap_or_default()
        })
    }
}

/// Recorder that keeps interactions in memory.
#[derive(Debug, Default)]
pub struct MemoryRecorder {
    records: Mutex<Vec<Interaction>>,
}

impl MemoryRecorder {
    /// An empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of recorded interactions.
    pub fn records(&self) -> Vec<Interaction> {
        self.records.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl InteractionRecorder for MemoryRecorder {
    async fn record_interaction(&self, interaction: Interaction) -> Result<(), PersistenceError> {
        self.records
            .lock()
            .map_err(|_| PersistenceError("recorder lock poisoned".into()))?
            .push(interaction);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tollgate_types::{InteractionStatus, ProviderKind, UsageTokens};

    fn fixture() -> Config {
        let path = concat!(env!("CARGO_MANIFEST_DIR"), "/../../tests/fixtures/config.json");
        let content = std::fs::read_to_string(path).unwrap();
        serde_json::from_str(&content).unwrap()
    }

    #[tokio::test]
    async fn seeded_from_config() {
        let store = InMemoryStore::from_config(&fixture());
        let agent = store.find_agent_by_id("assistant").await.unwrap().unwrap();
        assert!(agent.is_default);

        let tools = store.find_assigned_tools("assistant").await.unwrap();
        assert_eq!(tools.len(), 2);
        assert_eq!(tools[0].mcp_server.as_deref(), Some("mail"));
        assert!(tools[1].trusted);

        let policies = store.get_tool_invocation_policies("assistant").await.unwrap();
        assert_eq!(policies.len(), 2);
        assert_eq!(policies[0].tool_name, "send_email");
    }

    #[tokio::test]
    async fn unknown_agent_has_nothing() {
        let store = InMemoryStore::from_config(&fixture());
        assert!(store.find_agent_by_id("ghost").await.unwrap().is_none());
        assert!(store.find_assigned_tools("ghost").await.unwrap().is_empty());
        assert!(store.get_tool_invocation_policies("ghost").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn default_and_client_lookup() {
        let store = InMemoryStore::new();
        store.insert(
            Agent {
                id: "cursor-agent".into(),
                name: "Cursor".into(),
                is_default: false,
                client_name: Some("cursor".into()),
            },
            Vec::new(),
            Vec::new(),
        );
        assert!(store.find_default_agent().await.unwrap().is_none());
        let bound = store.find_agent_for_client("cursor").await.unwrap().unwrap();
        assert_eq!(bound.id, "cursor-agent");
        assert!(store.find_agent_for_client("curl").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn create_agent_is_idempotent_by_id() {
        let store = InMemoryStore::new();
        let first = store.create_agent(Agent::for_client("a1", "curl")).await.unwrap();
        let again = store
            .create_agent(Agent::for_client("a1", "something-else"))
            .await
            .unwrap();
        assert_eq!(first, again);
        assert_eq!(store.len(), 1);
    }

    struct EchoExecutor;

    #[async_trait]
    impl ToolExecutor for EchoExecutor {
        async fn execute(
            &self,
            _agent_id: &str,
            tool: &ToolDefinition,
            call: &ToolCall,
        ) -> Result<String, ExecutionError> {
            if tool.name == "broken" {
                return Err(ExecutionError::Failed {
                    tool: tool.name.clone(),
                    message: "connection refused".into(),
                });
            }
            Ok(format!("{} ran with {}", tool.name, call.arguments))
        }
    }

    #[tokio::test]
    async fn execute_batch_keeps_order_and_wraps_errors() {
        let calls = vec![
            (ToolDefinition::new("echo", None, None), ToolCall::new("c1", "echo", "{}")),
            (ToolDefinition::new("broken", None, None), ToolCall::new("c2", "broken", "{}")),
        ];
        let results = EchoExecutor.execute_tool_calls("a", &calls).await;
        assert_eq!(results[0].content, "echo ran with {}");
        assert!(!results[0].is_error);
        assert_eq!(results[1].call_id, "c2");
        assert!(results[1].is_error);
        let err: serde_json::Value = serde_json::from_str(&results[1].content).unwrap();
        assert_eq!(err["error"], "tool 'broken' failed: connection refused");
    }

    #[tokio::test]
    async fn memory_recorder_keeps_records() {
        let recorder = MemoryRecorder::new();
        recorder
            .record_interaction(Interaction::new(
                "a",
                ProviderKind::OpenAi,
                InteractionStatus::Completed,
                serde_json::json!({}),
                serde_json::json!({}),
                UsageTokens::default(),
            ))
            .await
            .unwrap();
        assert_eq!(recorder.records().len(), 1);
    }
}
