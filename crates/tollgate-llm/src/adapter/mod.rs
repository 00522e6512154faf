//! Protocol adapters.
//!
//! One [`ProtocolAdapter`] per provider protocol converts between the
//! provider's JSON shapes and the Common Message Model. Adapters are
//! stateless and selected by route through [`adapter_for`]; per-stream
//! state lives in the [`StreamDecoder`] an adapter hands out.
//!
//! Round-trip guarantee: [`from_common`](ProtocolAdapter::from_common)
//! returns the original provider message, untouched, for every message
//! whose common counterparts were not altered by a trust update.

pub mod anthropic;
pub mod gemini;
pub mod openai;

pub use anthropic::AnthropicAdapter;
pub use gemini::GeminiAdapter;
pub use openai::OpenAiAdapter;

use serde_json::{Map, Value};
use tollgate_types::{CommonMessage, ProviderKind, ToolDefinition, UsageTokens};

use crate::error::ProtocolError;
use crate::stream::StreamDecoder;

/// Values that come from the route rather than the body.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouteInfo {
    /// Model from the path (Gemini).
    pub model: Option<String>,
    /// Streaming selected by the path action (Gemini).
    pub stream: Option<bool>,
}

/// A client request, tagged by provider.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderRequest {
    /// Which protocol the body speaks.
    pub kind: ProviderKind,
    /// Target model.
    pub model: String,
    /// Whether the client asked for a stream.
    pub stream: bool,
    /// The request body as received.
    pub body: Map<String, Value>,
}

/// Tools declared in a request body.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RequestTools {
    /// Function tools, in declaration order.
    pub functions: Vec<ToolDefinition>,
    /// Provider built-in tools (web search, code execution, ...), kept as-is.
    pub opaque: Vec<Value>,
}

/// Conversion between one provider protocol and the Common Message Model.
pub trait ProtocolAdapter: Send + Sync {
    /// The protocol this adapter speaks.
    fn kind(&self) -> ProviderKind;

    /// Validate the body and extract model and streaming flag.
    fn parse_request(&self, body: Value, route: &RouteInfo) -> Result<ProviderRequest, ProtocolError>;

    /// Key of the message array in request bodies.
    fn messages_key(&self) -> &'static str;

    /// Provider message list to common messages.
    fn to_common(&self, messages: &[Value]) -> Result<Vec<CommonMessage>, ProtocolError>;

    /// Common messages back to a provider message list.
    ///
    /// `original` is the list `common` was read from. Messages added by
    /// the proxy (no origin) are rendered in provider shape.
    fn from_common(
        &self,
        common: &[CommonMessage],
        original: &[Value],
    ) -> Result<Vec<Value>, ProtocolError>;

    /// Normalize a provider usage object.
    fn usage_tokens(&self, raw_usage: &Value) -> UsageTokens;

    /// Usage of a buffered response.
    fn response_usage(&self, response: &Value) -> UsageTokens;

    /// Tools declared in the request body.
    fn request_tools(&self, body: &Map<String, Value>) -> Result<RequestTools, ProtocolError>;

    /// Provider-shaped `tools` value.
    fn render_tools(&self, tools: &[ToolDefinition], opaque: &[Value]) -> Value;

    /// The assistant message of a buffered response.
    fn parse_response(&self, response: &Value) -> Result<CommonMessage, ProtocolError>;

    /// `response` with its content replaced by `text` and no tool calls.
    fn refusal_response(&self, response: &Value, text: &str) -> Value;

    /// Body for an isolated, single-turn classification call.
    fn classification_request(
        &self,
        model: &str,
        max_tokens: u32,
        instructions: &str,
        content: &str,
    ) -> Map<String, Value>;

    /// A decoder for one upstream stream.
    fn stream_decoder(&self, model: &str) -> Box<dyn StreamDecoder>;

    /// The message array of a request body.
    fn request_messages<'a>(
        &self,
        body: &'a Map<String, Value>,
    ) -> Result<&'a [Value], ProtocolError> {
        let key = self.messages_key();
        match body.get(key) {
            Some(Value::Array(items)) => Ok(items),
            Some(_) => Err(ProtocolError::expected(key, "array")),
            None => Err(ProtocolError::missing(key)),
        }
    }

    /// Replace the message array of a request body.
    fn set_messages(&self, body: &mut Map<String, Value>, messages: Vec<Value>) {
        body.insert(self.messages_key().to_owned(), Value::Array(messages));
    }

    /// Replace the tools of a request body.
    fn set_tools(&self, body: &mut Map<String, Value>, tools: &[ToolDefinition], opaque: &[Value]) {
        if tools.is_empty() && opaque.is_empty() {
            return;
        }
        body.insert("tools".into(), self.render_tools(tools, opaque));
    }
}

static OPENAI: OpenAiAdapter = OpenAiAdapter;
static ANTHROPIC: AnthropicAdapter = AnthropicAdapter;
static GEMINI: GeminiAdapter = GeminiAdapter;

/// The adapter for a provider kind.
pub fn adapter_for(kind: ProviderKind) -> &'static dyn ProtocolAdapter {
    match kind {
        ProviderKind::OpenAi => &OPENAI,
        ProviderKind::Anthropic => &ANTHROPIC,
        ProviderKind::Gemini => &GEMINI,
    }
}

/// Rebuild a provider message list from common messages.
///
/// Walks `common` in order. Each run of messages sharing an origin maps
/// back to that original message, cloned, with `patch` applied for every
/// altered member. Runs without origin are rendered by `render`. Original
/// messages with no common counterpart are copied through in position.
pub(crate) fn rebuild_messages(
    common: &[CommonMessage],
    original: &[Value],
    patch: fn(&mut Value, &CommonMessage, &str) -> Result<(), ProtocolError>,
    render: fn(&[CommonMessage]) -> Vec<Value>,
) -> Result<Vec<Value>, ProtocolError> {
    let mut out = Vec::with_capacity(original.len() + 2);
    let mut next = 0usize;
    let mut i = 0usize;

    while i < common.len() {
        match common[i].origin {
            Some(origin) => {
                let idx = origin.message;
                let mut j = i;
                while j < common.len() && common[j].origin.map(|o| o.message) == Some(idx) {
                    j += 1;
                }

                if idx >= next {
                    let msg = original.get(idx).ok_or_else(|| {
                        ProtocolError::new(format!("messages[{idx}]"), "origin out of range")
                    })?;
                    out.extend(original[next..idx].iter().cloned());

                    let mut msg = msg.clone();
                    for member in &common[i..j] {
                        if member.altered {
                            patch(&mut msg, member, &format!("messages[{idx}]"))?;
                        }
                    }
                    out.push(msg);
                    next = idx + 1;
                }
                i = j;
            }
            None => {
                let mut j = i;
                while j < common.len() && common[j].origin.is_none() {
                    j += 1;
                }
                let upto = common[j..]
                    .iter()
                    .find_map(|m| m.origin.map(|o| o.message))
                    .unwrap_or(original.len())
                    .min(original.len());
                if upto > next {
                    out.extend(original[next..upto].iter().cloned());
                    next = upto;
                }
                out.extend(render(&common[i..j]));
                i = j;
            }
        }
    }

    if next < original.len() {
        out.extend(original[next..].iter().cloned());
    }
    Ok(out)
}

/// Text of a string-or-blocks content value. Text blocks are joined with
/// `\n`; other block types are skipped.
pub(crate) fn content_text(content: &Value) -> Option<String> {
    match content {
        Value::String(s) => Some(s.clone()),
        Value::Array(blocks) => {
            let texts: Vec<&str> = blocks
                .iter()
                .filter_map(|b| match b {
                    Value::String(s) => Some(s.as_str()),
                    other => other.get("text").and_then(Value::as_str),
                })
                .collect();
            if texts.is_empty() {
                None
            } else {
                Some(texts.join("\n"))
            }
        }
        _ => None,
    }
}

/// A required string field.
pub(crate) fn required_str<'a>(
    value: &'a Value,
    key: &str,
    path: &str,
) -> Result<&'a str, ProtocolError> {
    match value.get(key) {
        Some(Value::String(s)) => Ok(s),
        Some(_) => Err(ProtocolError::expected(format!("{path}.{key}"), "string")),
        None => Err(ProtocolError::missing(format!("{path}.{key}"))),
    }
}

/// A JSON object as a map reference.
pub(crate) fn as_object<'a>(
    value: &'a Value,
    path: &str,
) -> Result<&'a Map<String, Value>, ProtocolError> {
    value
        .as_object()
        .ok_or_else(|| ProtocolError::expected(path.to_owned(), "object"))
}

/// Read a non-negative integer field, defaulting to zero.
pub(crate) fn count(value: &Value, key: &str) -> u64 {
    value.get(key).and_then(Value::as_u64).unwrap_or(0)
}

/// The object form of a body, required at the top level.
pub(crate) fn into_object(body: Value) -> Result<Map<String, Value>, ProtocolError> {
    match body {
        Value::Object(map) => Ok(map),
        _ => Err(ProtocolError::expected("$", "object")),
    }
}
