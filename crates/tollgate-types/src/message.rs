//! The Common Message Model.
//!
//! Every provider protocol is normalized into a list of [`CommonMessage`]s
//! before classification and policy evaluation. Messages remember where
//! they came from ([`MessageOrigin`]) so that an adapter can hand back the
//! original provider JSON untouched for every message nobody altered.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Author of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Operator instructions.
    System,
    /// The trusted principal.
    User,
    /// The model.
    Assistant,
    /// Output of an executed tool call.
    Tool,
}

/// Trust classification attached to a tool call once the verdict is known.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrustTag {
    /// The call was produced from a trusted context.
    Trusted,
    /// The call was produced while untrusted data was in context.
    Untrusted,
}

/// A tool invocation requested by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCall {
    /// Provider-assigned (or synthesized) call identifier.
    pub id: String,

    /// Name of the tool to invoke.
    pub name: String,

    /// Arguments as raw JSON text. Parsed on demand by
    /// [`parsed_arguments`](ToolCall::parsed_arguments).
    pub arguments: String,

    /// `None` until the request has been classified.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trust_tag: Option<TrustTag>,
}

impl ToolCall {
    /// Create an unclassified tool call.
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments: arguments.into(),
            trust_tag: None,
        }
    }

    /// Parse the argument text.
    ///
    /// Empty text is an empty object. Text that is not valid JSON is
    /// returned as a JSON string holding the raw text.
    pub fn parsed_arguments(&self) -> Value {
        if self.arguments.trim().is_empty() {
            return Value::Object(serde_json::Map::new());
        }
        serde_json::from_str(&self.arguments)
            .unwrap_or_else(|_| Value::String(self.arguments.clone()))
    }
}

/// Position of a common message inside the provider's message array.
///
/// `part` is set when one provider message fans out into several common
/// messages (Anthropic content blocks, Gemini parts).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageOrigin {
    /// Index in the provider message array.
    pub message: usize,
    /// Index of the content block / part within that message.
    pub part: Option<usize>,
}

/// A provider-agnostic conversation message.
///
/// An assistant message with tool calls may have no content. A tool
/// message always carries `tool_call_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommonMessage {
    /// Message author.
    pub role: Role,

    /// Text content, if any.
    pub content: Option<String>,

    /// Tool calls requested by an assistant message.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,

    /// For tool messages, the call this result answers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,

    /// For tool messages, the tool name when the provider carries it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// For tool messages, the tool failed and `content` describes why.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_error: bool,

    /// Where this message was read from; `None` for messages the proxy added.
    #[serde(skip)]
    pub origin: Option<MessageOrigin>,

    /// Set when a trust update replaced the content.
    #[serde(skip)]
    pub altered: bool,
}

impl CommonMessage {
    fn with_role(role: Role, content: Option<String>) -> Self {
        Self {
            role,
            content,
            tool_calls: Vec::new(),
            tool_call_id: None,
            name: None,
            is_error: false,
            origin: None,
            altered: false,
        }
    }

    /// A system message.
    pub fn system(content: impl Into<String>) -> Self {
        Self::with_role(Role::System, Some(content.into()))
    }

    /// A user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self::with_role(Role::User, Some(content.into()))
    }

    /// An assistant text message.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::with_role(Role::Assistant, Some(content.into()))
    }

    /// An assistant message requesting tool calls.
    pub fn assistant_tool_calls(content: Option<String>, tool_calls: Vec<ToolCall>) -> Self {
        let mut msg = Self::with_role(Role::Assistant, content);
        msg.tool_calls = tool_calls;
        msg
    }

    /// A tool result answering `tool_call_id`.
    pub fn tool_result(
        tool_call_id: impl Into<String>,
        name: Option<String>,
        content: impl Into<String>,
    ) -> Self {
        let mut msg = Self::with_role(Role::Tool, Some(content.into()));
        msg.tool_call_id = Some(tool_call_id.into());
        msg.name = name;
        msg
    }

    /// Mark a tool result as a failure.
    pub fn failed(mut self, is_error: bool) -> Self {
        self.is_error = is_error;
        self
    }

    /// Record where the message was read from.
    pub fn with_origin(mut self, message: usize, part: Option<usize>) -> Self {
        self.origin = Some(MessageOrigin { message, part });
        self
    }

    /// Returns the text content or an empty string.
    pub fn text(&self) -> &str {
        self.content.as_deref().unwrap_or_default()
    }
}

/// Replacement content for one message, by index into the common list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageUpdate {
    /// Index into the common message list.
    pub index: usize,
    /// New content for that message.
    pub new_content: String,
}
