//! Tool definitions.
//!
//! A [`ToolDefinition`] is either assigned to an agent (authoritative) or
//! declared by the client in the request body. Both are normalized the same
//! way on construction: a missing description becomes `"no description"`
//! and a missing or empty parameter schema becomes an empty-object schema.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Value, json};

/// Description used when a tool carries none.
pub const NO_DESCRIPTION: &str = "no description";

/// The schema used when a tool declares no parameters.
pub fn empty_object_schema() -> Value {
    json!({"type": "object", "properties": {}})
}

/// A callable tool, as seen by the model.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDefinition {
    /// Tool name; unique within one agent scope.
    pub name: String,

    /// Human-readable description. Never empty.
    pub description: String,

    /// JSON Schema of the arguments. Never `null`.
    pub parameters_schema: Value,

    /// Results of this tool are trusted content.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub trusted: bool,

    /// MCP server that executes this tool, if it runs server-side.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mcp_server: Option<String>,
}

impl ToolDefinition {
    /// Build a normalized definition.
    pub fn new(name: impl Into<String>, description: Option<String>, schema: Option<Value>) -> Self {
        Self {
            name: name.into(),
            description: normalize_description(description),
            parameters_schema: normalize_schema(schema),
            trusted: false,
            mcp_server: None,
        }
    }

    /// Mark tool output as trusted.
    pub fn trusted(mut self, trusted: bool) -> Self {
        self.trusted = trusted;
        self
    }

    /// Bind the tool to an MCP server.
    pub fn with_mcp_server(mut self, server: impl Into<String>) -> Self {
        self.mcp_server = Some(server.into());
        self
    }
}

fn normalize_description(description: Option<String>) -> String {
    match description {
        Some(d) if !d.trim().is_empty() => d,
        _ => NO_DESCRIPTION.to_owned(),
    }
}

fn normalize_schema(schema: Option<Value>) -> Value {
    match schema {
        None | Some(Value::Null) => empty_object_schema(),
        Some(Value::Object(map)) if map.is_empty() => empty_object_schema(),
        Some(other) => other,
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawToolDefinition {
    name: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default, alias = "parameters_schema", alias = "parameters", alias = "inputSchema")]
    parameters_schema: Option<Value>,
    #[serde(default)]
    trusted: bool,
    #[serde(default, alias = "mcp_server")]
    mcp_server: Option<String>,
}

impl<'de> Deserialize<'de> for ToolDefinition {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = RawToolDefinition::deserialize(deserializer)?;
        Ok(Self {
            name: raw.name,
            description: normalize_description(raw.description),
            parameters_schema: normalize_schema(raw.parameters_schema),
            trusted: raw.trusted,
            mcp_server: raw.mcp_server,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_description_and_schema_normalize() {
        let tool = ToolDefinition::new("now", None, None);
        assert_eq!(tool.description, "no description");
        assert_eq!(tool.parameters_schema, empty_object_schema());
    }

    #[test]
    fn empty_description_and_schema_normalize() {
        let tool = ToolDefinition::new("now", Some("  ".into()), Some(json!({})));
        assert_eq!(tool.description, NO_DESCRIPTION);
        assert_eq!(tool.parameters_schema["type"], "object");
    }

    #[test]
    fn deserialize_normalizes_and_accepts_aliases() {
        let tool: ToolDefinition = serde_json::from_str(
            r#"{"name":"fetch","inputSchema":null,"mcpServer":"web","trusted":false}"#,
        )
        .unwrap();
        assert_eq!(tool.description, NO_DESCRIPTION);
        assert_eq!(tool.parameters_schema, empty_object_schema());
        assert_eq!(tool.mcp_server.as_deref(), Some("web"));
    }

    #[test]
    fn schema_is_kept_when_present() {
        let schema = json!({"type":"object","properties":{"to":{"type":"string"}}});
        let tool = ToolDefinition::new("send_email", Some("Send mail".into()), Some(schema.clone()));
        assert_eq!(tool.parameters_schema, schema);
        assert_eq!(tool.description, "Send mail");
    }

    #[test]
    fn builders_set_flags() {
        let tool = ToolDefinition::new("wiki", None, None)
            .trusted(true)
            .with_mcp_server("docs");
        assert!(tool.trusted);
        assert_eq!(tool.mcp_server.as_deref(), Some("docs"));
    }
}
