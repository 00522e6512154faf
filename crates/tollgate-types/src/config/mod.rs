//! Configuration schema types.
//!
//! All structs accept both `snake_case` and `camelCase` field names in JSON
//! via `#[serde(alias)]`. Unknown fields are silently ignored for forward
//! compatibility. Every section has a usable default, so an empty file (or
//! no file at all) yields a working proxy with no agents configured.
//!
//! # Module Structure
//!
//! - [`loader`] -- config file discovery and loading

pub mod loader;

pub use loader::{CONFIG_ENV_VAR, discover_config_path, load_config};

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::agent::Agent;
use crate::error::{Result, TollgateError};
use crate::policy::{Policy, PolicyOperator};
use crate::provider::ProviderKind;
use crate::secret::SecretString;
use crate::tool::ToolDefinition;

pub(crate) fn default_true() -> bool {
    true
}

// ── Root config ──────────────────────────────────────────────────────────

/// Root configuration for the tollgate proxy.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// HTTP listener settings.
    #[serde(default)]
    pub server: ServerConfig,

    /// Upstream provider endpoints and credentials.
    #[serde(default)]
    pub providers: ProvidersConfig,

    /// Trust classifier settings.
    #[serde(default)]
    pub classifier: ClassifierConfig,

    /// Pipeline behaviour switches.
    #[serde(default)]
    pub pipeline: PipelineConfig,

    /// Interaction audit log.
    #[serde(default)]
    pub audit: AuditConfig,

    /// MCP servers that execute assigned tools.
    #[serde(default)]
    pub mcp: McpConfig,

    /// Log level and format.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Agents with their assigned tools and invocation policies.
    #[serde(default)]
    pub agents: Vec<AgentConfig>,
}

impl Config {
    /// Check cross-references the type system cannot express.
    ///
    /// Reports duplicate agent ids, duplicate MCP server names, tools bound
    /// to an unknown MCP server, and `regex` policies whose value does not
    /// compile.
    pub fn validate(&self) -> Result<()> {
        let mut servers = HashSet::new();
        for server in &self.mcp.servers {
            if !servers.insert(server.name.as_str()) {
                return Err(invalid(format!("duplicate mcp server '{}'", server.name)));
            }
            if server.url.is_empty() {
                return Err(invalid(format!("mcp server '{}' has no url", server.name)));
            }
        }

        let mut ids = HashSet::new();
        for agent in &self.agents {
            if agent.id.is_empty() {
                return Err(invalid("agent with empty id".into()));
            }
            if !ids.insert(agent.id.as_str()) {
                return Err(invalid(format!("duplicate agent id '{}'", agent.id)));
            }
            for tool in &agent.tools {
                if let Some(server) = &tool.mcp_server
                    && !servers.contains(server.as_str())
                {
                    return Err(invalid(format!(
                        "agent '{}' tool '{}' references unknown mcp server '{server}'",
                        agent.id, tool.name
                    )));
                }
            }
            for policy in &agent.policies {
                if policy.operator == PolicyOperator::Regex
                    && let Err(e) = regex::Regex::new(&policy.value)
                {
                    return Err(invalid(format!(
                        "agent '{}' policy on '{}' has invalid regex: {e}",
                        agent.id, policy.tool_name
                    )));
                }
            }
        }
        Ok(())
    }

    /// Look up an MCP server by name.
    pub fn mcp_server(&self, name: &str) -> Option<&McpServerConfig> {
        self.mcp.servers.iter().find(|s| s.name == name)
    }
}

fn invalid(reason: String) -> TollgateError {
    TollgateError::ConfigInvalid { reason }
}

// ── Server ───────────────────────────────────────────────────────────────

/// HTTP listener configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address.
    #[serde(default = "default_host")]
    pub host: String,

    /// Bind port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Allowed CORS origins. Empty = CORS disabled.
    #[serde(default, alias = "corsOrigins")]
    pub cors_origins: Vec<String>,
}

fn default_host() -> String {
    "127.0.0.1".into()
}
fn default_port() -> u16 {
    9000
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            cors_origins: Vec::new(),
        }
    }
}

// ── Providers ────────────────────────────────────────────────────────────

/// Settings for the three supported upstream protocols.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProvidersConfig {
    /// OpenAI-compatible chat completions.
    #[serde(default)]
    pub openai: ProviderSettings,

    /// Anthropic messages API.
    #[serde(default)]
    pub anthropic: ProviderSettings,

    /// Gemini generate-content API.
    #[serde(default)]
    pub gemini: ProviderSettings,
}

impl ProvidersConfig {
    /// Settings for one provider.
    pub fn get(&self, kind: ProviderKind) -> &ProviderSettings {
        match kind {
            ProviderKind::OpenAi => &self.openai,
            ProviderKind::Anthropic => &self.anthropic,
            ProviderKind::Gemini => &self.gemini,
        }
    }
}

/// Connection settings for one upstream provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderSettings {
    /// Base URL; the provider's public endpoint when unset.
    #[serde(default, alias = "baseUrl")]
    pub base_url: Option<String>,

    /// API key used when the client sends no credential of its own.
    #[serde(default, alias = "apiKey")]
    pub api_key: SecretString,

    /// Environment variable consulted when `api_key` is empty.
    #[serde(default, alias = "apiKeyEnv")]
    pub api_key_env: Option<String>,

    /// Extra headers sent with every upstream request.
    #[serde(default)]
    pub headers: HashMap<String, String>,

    /// Upstream request timeout in seconds.
    #[serde(default = "default_provider_timeout", alias = "timeoutSecs")]
    pub timeout_secs: u64,
}

fn default_provider_timeout() -> u64 {
    120
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            base_url: None,
            api_key: SecretString::default(),
            api_key_env: None,
            headers: HashMap::new(),
            timeout_secs: default_provider_timeout(),
        }
    }
}

impl ProviderSettings {
    /// Base URL with the provider default applied.
    pub fn base_url_for(&self, kind: ProviderKind) -> String {
        match &self.base_url {
            Some(url) if !url.is_empty() => url.trim_end_matches('/').to_owned(),
            _ => match kind {
                ProviderKind::OpenAi => "https://api.openai.com/v1".into(),
                ProviderKind::Anthropic => "https://api.anthropic.com".into(),
                ProviderKind::Gemini => "https://generativelanguage.googleapis.com".into(),
            },
        }
    }

    /// Name of the API-key environment variable for `kind`.
    pub fn api_key_env_for(&self, kind: ProviderKind) -> String {
        match &self.api_key_env {
            Some(var) if !var.is_empty() => var.clone(),
            _ => match kind {
                ProviderKind::OpenAi => "OPENAI_API_KEY".into(),
                ProviderKind::Anthropic => "ANTHROPIC_API_KEY".into(),
                ProviderKind::Gemini => "GEMINI_API_KEY".into(),
            },
        }
    }

    /// Fallback credential: the configured key, else the environment.
    pub fn resolve_api_key(&self, kind: ProviderKind) -> Option<SecretString> {
        if !self.api_key.is_empty() {
            return Some(self.api_key.clone());
        }
        std::env::var(self.api_key_env_for(kind))
            .ok()
            .filter(|v| !v.is_empty())
            .map(SecretString::from)
    }
}

// ── Classifier ───────────────────────────────────────────────────────────

/// Trust classifier configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifierConfig {
    /// When disabled every request with untrusted spans is untrusted.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Model used for OpenAI-routed requests.
    #[serde(default = "default_openai_classifier", alias = "openaiModel")]
    pub openai_model: String,

    /// Model used for Anthropic-routed requests.
    #[serde(default = "default_anthropic_classifier", alias = "anthropicModel")]
    pub anthropic_model: String,

    /// Model used for Gemini-routed requests.
    #[serde(default = "default_gemini_classifier", alias = "geminiModel")]
    pub gemini_model: String,

    /// Output token cap for one classification call.
    #[serde(default = "default_classifier_max_tokens", alias = "maxTokens")]
    pub max_tokens: u32,

    /// Emit classification progress as text deltas to streaming clients.
    #[serde(default, alias = "surfaceProgress")]
    pub surface_progress: bool,
}

fn default_openai_classifier() -> String {
    "gpt-4o-mini".into()
}
fn default_anthropic_classifier() -> String {
    "claude-3-5-haiku-latest".into()
}
fn default_gemini_classifier() -> String {
    "gemini-2.0-flash".into()
}
fn default_classifier_max_tokens() -> u32 {
    512
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            openai_model: default_openai_classifier(),
            anthropic_model: default_anthropic_classifier(),
            gemini_model: default_gemini_classifier(),
            max_tokens: default_classifier_max_tokens(),
            surface_progress: false,
        }
    }
}

impl ClassifierConfig {
    /// Classifier model for a provider.
    pub fn model_for(&self, kind: ProviderKind) -> &str {
        match kind {
            ProviderKind::OpenAi => &self.openai_model,
            ProviderKind::Anthropic => &self.anthropic_model,
            ProviderKind::Gemini => &self.gemini_model,
        }
    }
}

// ── Pipeline ─────────────────────────────────────────────────────────────

/// Pipeline behaviour switches.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Execute allowed calls to MCP-bound assigned tools and continue the
    /// turn server-side.
    #[serde(default = "default_true", alias = "executeAssignedTools")]
    pub execute_assigned_tools: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            execute_assigned_tools: true,
        }
    }
}

// ── Audit ────────────────────────────────────────────────────────────────

/// Interaction audit log configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditConfig {
    /// Record interactions at all.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// JSONL file; `~/.tollgate/interactions.jsonl` when unset.
    #[serde(default)]
    pub path: Option<String>,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: None,
        }
    }
}

impl AuditConfig {
    /// The JSONL path with `~/` expanded, or `None` when disabled.
    pub fn resolved_path(&self) -> Option<PathBuf> {
        if !self.enabled {
            return None;
        }
        match &self.path {
            Some(raw) => {
                if let Some(rest) = raw.strip_prefix("~/")
                    && let Some(home) = dirs::home_dir()
                {
                    return Some(home.join(rest));
                }
                Some(PathBuf::from(raw))
            }
            None => dirs::home_dir().map(|h| h.join(".tollgate").join("interactions.jsonl")),
        }
    }
}

// ── MCP ──────────────────────────────────────────────────────────────────

/// MCP servers reachable over HTTP.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct McpConfig {
    /// Named servers referenced by `ToolDefinition::mcp_server`.
    #[serde(default)]
    pub servers: Vec<McpServerConfig>,
}

/// One MCP server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpServerConfig {
    /// Name referenced from tool definitions.
    pub name: String,

    /// JSON-RPC endpoint URL.
    #[serde(default)]
    pub url: String,

    /// Extra headers (e.g. authorization) for every call.
    #[serde(default)]
    pub headers: HashMap<String, String>,

    /// Per-call timeout in seconds.
    #[serde(default = "default_mcp_timeout", alias = "timeoutSecs")]
    pub timeout_secs: u64,
}

fn default_mcp_timeout() -> u64 {
    30
}

// ── Logging ──────────────────────────────────────────────────────────────

/// Output format for log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable.
    #[default]
    Text,
    /// One JSON object per line.
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format.
    #[serde(default)]
    pub format: LogFormat,
}

fn default_log_level() -> String {
    "info".into()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::Text,
        }
    }
}

// ── Agents ───────────────────────────────────────────────────────────────

/// One configured agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Agent id used in proxy routes.
    pub id: String,

    /// Display name; defaults to the id.
    #[serde(default)]
    pub name: Option<String>,

    /// Serve clients with no dedicated agent.
    #[serde(default)]
    pub default: bool,

    /// Client name this agent serves.
    #[serde(default, alias = "clientName")]
    pub client_name: Option<String>,

    /// Tools assigned to this agent. Authoritative over request tools.
    #[serde(default)]
    pub tools: Vec<ToolDefinition>,

    /// Ordered tool invocation policies.
    #[serde(default)]
    pub policies: Vec<Policy>,
}

impl AgentConfig {
    /// The agent record this entry describes.
    pub fn to_agent(&self) -> Agent {
        Agent {
            id: self.id.clone(),
            name: self.name.clone().unwrap_or_else(|| self.id.clone()),
            is_default: self.default,
            client_name: self.client_name.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Path to the test fixture config.
    const FIXTURE_PATH: &str = concat!(
        env!("CARGO_MANIFEST_DIR"),
        "/../../tests/fixtures/config.json"
    );

    fn load_fixture() -> Config {
        let content =
            std::fs::read_to_string(FIXTURE_PATH).expect("fixture config.json should exist");
        serde_json::from_str(&content).expect("fixture should deserialize")
    }

    #[test]
    fn deserialize_fixture() {
        let cfg = load_fixture();

        assert_eq!(cfg.server.port, 9100);
        assert_eq!(cfg.server.cors_origins, vec!["http://localhost:3000"]);

        assert_eq!(
            cfg.providers.openai.base_url_for(ProviderKind::OpenAi),
            "http://localhost:8080/v1"
        );
        assert_eq!(cfg.providers.anthropic.api_key.expose(), "sk-ant-test-key");
        assert_eq!(cfg.providers.gemini.timeout_secs, 120);

        assert_eq!(cfg.classifier.openai_model, "gpt-4o-mini");
        assert_eq!(cfg.classifier.max_tokens, 256);
        assert!(!cfg.pipeline.execute_assigned_tools);
        assert_eq!(cfg.mcp.servers[0].name, "mail");
        assert_eq!(cfg.logging.format, LogFormat::Json);

        let agent = &cfg.agents[0];
        assert_eq!(agent.id, "assistant");
        assert!(agent.default);
        assert_eq!(agent.tools.len(), 2);
        assert_eq!(agent.tools[0].mcp_server.as_deref(), Some("mail"));
        assert!(agent.tools[1].trusted);
        assert_eq!(agent.tools[1].description, "no description");
        assert_eq!(agent.policies[0].tool_name, "send_email");

        cfg.validate().unwrap();
    }

    #[test]
    fn empty_object_uses_defaults() {
        let cfg: Config = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.server.host, "127.0.0.1");
        assert_eq!(cfg.server.port, 9000);
        assert!(cfg.classifier.enabled);
        assert!(cfg.pipeline.execute_assigned_tools);
        assert!(cfg.agents.is_empty());
        cfg.validate().unwrap();
    }

    #[test]
    fn provider_defaults() {
        let settings = ProviderSettings::default();
        assert_eq!(
            settings.base_url_for(ProviderKind::Anthropic),
            "https://api.anthropic.com"
        );
        assert_eq!(settings.api_key_env_for(ProviderKind::Gemini), "GEMINI_API_KEY");
    }

    #[test]
    fn base_url_trailing_slash_trimmed() {
        let settings = ProviderSettings {
            base_url: Some("http://proxy.local/v1/".into()),
            ..Default::default()
        };
        assert_eq!(
            settings.base_url_for(ProviderKind::OpenAi),
            "http://proxy.local/v1"
        );
    }

    #[test]
    fn configured_key_wins_over_env() {
        let settings = ProviderSettings {
            api_key: SecretString::from("sk-config"),
            api_key_env: Some("TOLLGATE_TEST_UNSET_VAR".into()),
            ..Default::default()
        };
        let key = settings.resolve_api_key(ProviderKind::OpenAi).unwrap();
        assert_eq!(key.expose(), "sk-config");
    }

    #[test]
    fn missing_env_key_is_none() {
        let settings = ProviderSettings {
            api_key_env: Some("TOLLGATE_TEST_DEFINITELY_UNSET".into()),
            ..Default::default()
        };
        assert!(settings.resolve_api_key(ProviderKind::OpenAi).is_none());
    }

    #[test]
    fn env_key_used_when_unconfigured() {
        let settings = ProviderSettings {
            api_key_env: Some("TOLLGATE_TEST_OPENAI_KEY".into()),
            ..Default::default()
        };
        temp_env::with_var("TOLLGATE_TEST_OPENAI_KEY", Some("sk-from-env"), || {
            let key = settings.resolve_api_key(ProviderKind::OpenAi).unwrap();
            assert_eq!(key.expose(), "sk-from-env");
        });
    }

    #[test]
    fn default_env_var_per_provider() {
        let settings = ProviderSettings::default();
        temp_env::with_vars(
            [("ANTHROPIC_API_KEY", Some("sk-ant-env")), ("GEMINI_API_KEY", Some(""))],
            || {
                let key = settings.resolve_api_key(ProviderKind::Anthropic).unwrap();
                assert_eq!(key.expose(), "sk-ant-env");
                assert!(settings.resolve_api_key(ProviderKind::Gemini).is_none());
            },
        );
    }

    #[test]
    fn classifier_model_per_provider() {
        let cfg = ClassifierConfig::default();
        assert_eq!(cfg.model_for(ProviderKind::Anthropic), "claude-3-5-haiku-latest");
        assert_eq!(cfg.model_for(ProviderKind::Gemini), "gemini-2.0-flash");
    }

    #[test]
    fn audit_disabled_has_no_path() {
        let cfg = AuditConfig {
            enabled: false,
            path: Some("/tmp/x.jsonl".into()),
        };
        assert!(cfg.resolved_path().is_none());
    }

    #[test]
    fn audit_explicit_path() {
        let cfg = AuditConfig {
            enabled: true,
            path: Some("/var/log/tollgate.jsonl".into()),
        };
        assert_eq!(
            cfg.resolved_path(),
            Some(PathBuf::from("/var/log/tollgate.jsonl"))
        );
    }

    #[test]
    fn validate_rejects_duplicate_agent_ids() {
        let cfg: Config = serde_json::from_str(r#"{"agents":[{"id":"a"},{"id":"a"}]}"#).unwrap();
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("duplicate agent id 'a'"));
    }

    #[test]
    fn validate_rejects_unknown_mcp_server() {
        let cfg: Config = serde_json::from_str(
            r#"{"agents":[{"id":"a","tools":[{"name":"fetch","mcpServer":"web"}]}]}"#,
        )
        .unwrap();
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("unknown mcp server 'web'"));
    }

    #[test]
    fn validate_rejects_bad_regex() {
        let cfg: Config = serde_json::from_str(
            r#"{"agents":[{"id":"a","policies":[{
                "toolName":"fetch","attributePath":"url","operator":"regex",
                "value":"(unclosed","action":"block"}]}]}"#,
        )
        .unwrap();
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("invalid regex"));
    }

    #[test]
    fn agent_name_defaults_to_id() {
        let cfg: AgentConfig = serde_json::from_str(r#"{"id":"ops","clientName":"curl"}"#).unwrap();
        let agent = cfg.to_agent();
        assert_eq!(agent.name, "ops");
        assert_eq!(agent.client_name.as_deref(), Some("curl"));
    }

    #[test]
    fn serialized_config_hides_keys() {
        let cfg = load_fixture();
        let json = serde_json::to_string(&cfg).unwrap();
        assert!(!json.contains("sk-ant-test-key"));
    }
}
