//! Tool invocation policies and the per-request trust verdict.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::message::{CommonMessage, MessageUpdate, TrustTag};

/// Comparison applied between a tool-call attribute and a policy value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PolicyOperator {
    /// String-exact equality.
    Equal,
    /// String-exact inequality.
    NotEqual,
    /// Substring test.
    Contains,
    /// Prefix test.
    StartsWith,
    /// Suffix test.
    EndsWith,
    /// `value` is compiled as a regular expression.
    Regex,
}

impl fmt::Display for PolicyOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Equal => "equal",
            Self::NotEqual => "notEqual",
            Self::Contains => "contains",
            Self::StartsWith => "startsWith",
            Self::EndsWith => "endsWith",
            Self::Regex => "regex",
        };
        f.write_str(s)
    }
}

/// What happens when a policy matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyAction {
    /// Allow the call; stops evaluation for that call.
    Allow,
    /// Refuse the whole batch.
    Block,
}

/// A rule matching one attribute of a tool call's arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Policy {
    /// Tool this policy applies to.
    #[serde(alias = "tool_name")]
    pub tool_name: String,

    /// Dotted path into the parsed arguments (`to`, `arguments.to`,
    /// `recipients.0`).
    #[serde(alias = "attribute_path")]
    pub attribute_path: String,

    /// Comparison operator.
    pub operator: PolicyOperator,

    /// Right-hand side of the comparison.
    pub value: String,

    /// Action taken on match.
    pub action: PolicyAction,

    /// Reason shown to the user when this policy blocks.
    #[serde(default, alias = "block_message", skip_serializing_if = "Option::is_none")]
    pub block_message: Option<String>,
}

impl Policy {
    /// The reason reported when this policy blocks a call.
    pub fn reason(&self) -> String {
        match &self.block_message {
            Some(msg) if !msg.is_empty() => msg.clone(),
            _ => format!("{} {} {}", self.attribute_path, self.operator, self.value),
        }
    }
}

/// Outcome of the Trust Classifier for one request.
///
/// Produced once and never mutated afterward; consumers read it through
/// shared references.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrustVerdict {
    /// `true` only if no untrusted data is present in the context.
    pub context_is_trusted: bool,

    /// Replacement content for untrusted spans.
    #[serde(default)]
    pub message_updates: Vec<MessageUpdate>,
}

impl TrustVerdict {
    /// A trusted verdict with no updates.
    pub fn trusted() -> Self {
        Self {
            context_is_trusted: true,
            message_updates: Vec::new(),
        }
    }

    /// An untrusted verdict with no updates (fail-closed result).
    pub fn untrusted() -> Self {
        Self {
            context_is_trusted: false,
            message_updates: Vec::new(),
        }
    }

    /// Tag to attach to tool calls produced under this verdict.
    pub fn tag(&self) -> TrustTag {
        if self.context_is_trusted {
            TrustTag::Trusted
        } else {
            TrustTag::Untrusted
        }
    }

    /// Return a copy of `messages` with the updates applied.
    ///
    /// Updated messages are marked `altered`. Updates whose index is out of
    /// range are ignored. The input slice is left as received.
    pub fn apply_to(&self, messages: &[CommonMessage]) -> Vec<CommonMessage> {
        let mut out = messages.to_vec();
        for update in &self.message_updates {
            if let Some(msg) = out.get_mut(update.index) {
                msg.content = Some(update.new_content.clone());
                msg.altered = true;
            }
        }
        out
    }
}
