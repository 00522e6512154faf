//! Audit records for completed (or aborted) proxy exchanges.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::provider::ProviderKind;

/// Token usage reported by a provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageTokens {
    /// Prompt / input tokens.
    pub input: u64,
    /// Completion / output tokens.
    pub output: u64,
}

impl std::ops::Add for UsageTokens {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self {
            input: self.input + rhs.input,
            output: self.output + rhs.output,
        }
    }
}

impl std::ops::AddAssign for UsageTokens {
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}

/// How the exchange ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InteractionStatus {
    /// The turn completed normally.
    Completed,
    /// A tool invocation policy refused the turn.
    Refused,
    /// The client went away mid-stream; the response is partial.
    Aborted,
}

/// One proxied request and the response returned for it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Interaction {
    /// Record id.
    pub id: Uuid,

    /// Agent the request was served for.
    pub agent_id: String,

    /// Upstream protocol.
    pub provider: ProviderKind,

    /// `"<provider>:chat"`.
    #[serde(rename = "type")]
    pub interaction_type: String,

    /// Final outcome.
    pub status: InteractionStatus,

    /// Request body as received from the client.
    pub request: Value,

    /// Response returned to the client (assembled for streams).
    pub response: Value,

    /// Summed usage across the first turn and any continuation.
    pub usage: UsageTokens,

    /// When the record was created.
    pub created_at: DateTime<Utc>,
}

impl Interaction {
    /// Create a record stamped now.
    pub fn new(
        agent_id: impl Into<String>,
        provider: ProviderKind,
        status: InteractionStatus,
        request: Value,
        response: Value,
        usage: UsageTokens,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            agent_id: agent_id.into(),
            provider,
            interaction_type: format!("{provider}:chat"),
            status,
            request,
            response,
            usage,
            created_at: Utc::now(),
        }
    }
}
