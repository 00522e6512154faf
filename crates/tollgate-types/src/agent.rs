//! Agents the proxy operates on behalf of.

use serde::{Deserialize, Serialize};

/// An agent: the scope for assigned tools and invocation policies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Agent {
    /// Unique identifier, as used in proxy routes.
    pub id: String,

    /// Display name.
    pub name: String,

    /// Fallback agent for clients without a dedicated one.
    #[serde(default)]
    pub is_default: bool,

    /// Client name (first `User-Agent` product token) this agent serves.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_name: Option<String>,
}

impl Agent {
    /// The agent created on first contact from an unknown client.
    pub fn for_client(id: impl Into<String>, client_name: &str) -> Self {
        Self {
            id: id.into(),
            name: format!("{client_name} default agent"),
            is_default: false,
            client_name: Some(client_name.to_owned()),
        }
    }
}
