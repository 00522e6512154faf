//! OpenAI chat completions protocol.
//!
//! Tool-call arguments travel as a JSON *string* (`function.arguments`);
//! in streams that string arrives in fragments keyed by `tool_calls[].index`.

use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::{Map, Value, json};
use tollgate_types::{CommonMessage, ProviderKind, Role, ToolCall, ToolDefinition, UsageTokens};

use super::{
    ProtocolAdapter, ProviderRequest, RequestTools, RouteInfo, as_object, content_text, count,
    into_object, rebuild_messages, required_str,
};
use crate::error::ProtocolError;
use crate::sse::{DONE_SENTINEL, SseEvent};
use crate::stream::{DecodedEvent, Disposition, StreamDecoder, ToolCallFragment};

/// Adapter for `POST /chat/completions`.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenAiAdapter;

impl ProtocolAdapter for OpenAiAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::OpenAi
    }

    fn parse_request(&self, body: Value, _route: &RouteInfo) -> Result<ProviderRequest, ProtocolError> {
        let model = required_str(&body, "model", "$")?.to_owned();
        let stream = body.get("stream").and_then(Value::as_bool).unwrap_or(false);
        Ok(ProviderRequest {
            kind: ProviderKind::OpenAi,
            model,
            stream,
            body: into_object(body)?,
        })
    }

    fn messages_key(&self) -> &'static str {
        "messages"
    }

    fn to_common(&self, messages: &[Value]) -> Result<Vec<CommonMessage>, ProtocolError> {
        messages
            .iter()
            .enumerate()
            .map(|(i, msg)| read_message(i, msg))
            .collect()
    }

    fn from_common(
        &self,
        common: &[CommonMessage],
        original: &[Value],
    ) -> Result<Vec<Value>, ProtocolError> {
        rebuild_messages(common, original, patch_message, render_messages)
    }

    fn usage_tokens(&self, raw_usage: &Value) -> UsageTokens {
        UsageTokens {
            input: count(raw_usage, "prompt_tokens"),
            output: count(raw_usage, "completion_tokens"),
        }
    }

    fn response_usage(&self, response: &Value) -> UsageTokens {
        response
            .get("usage")
            .map(|u| self.usage_tokens(u))
            .unwrap_or_default()
    }

    fn request_tools(&self, body: &Map<String, Value>) -> Result<RequestTools, ProtocolError> {
        let mut tools = RequestTools::default();
        let Some(declared) = body.get("tools") else {
            return Ok(tools);
        };
        let declared = declared
            .as_array()
            .ok_or_else(|| ProtocolError::expected("tools", "array"))?;

        for (i, tool) in declared.iter().enumerate() {
            if tool.get("type").and_then(Value::as_str) != Some("function") {
                tools.opaque.push(tool.clone());
                continue;
            }
            let path = format!("tools[{i}].function");
            let function = tool.get("function").ok_or_else(|| ProtocolError::missing(&path))?;
            let name = required_str(function, "name", &path)?;
            tools.functions.push(ToolDefinition::new(
                name,
                function.get("description").and_then(Value::as_str).map(String::from),
                function.get("parameters").cloned(),
            ));
        }
        Ok(tools)
    }

    fn render_tools(&self, tools: &[ToolDefinition], opaque: &[Value]) -> Value {
        let mut out: Vec<Value> = tools
            .iter()
            .map(|t| {
                json!({
                    "type": "function",
                    "function": {
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.parameters_schema,
                    }
                })
            })
            .collect();
        out.extend(opaque.iter().cloned());
        Value::Array(out)
    }

    fn parse_response(&self, response: &Value) -> Result<CommonMessage, ProtocolError> {
        let message = response
            .get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("message"))
            .ok_or_else(|| ProtocolError::missing("choices[0].message"))?;
        let tool_calls = read_tool_calls(message, "choices[0].message")?;
        Ok(CommonMessage::assistant_tool_calls(
            message.get("content").and_then(content_text),
            tool_calls,
        ))
    }

    fn refusal_response(&self, response: &Value, text: &str) -> Value {
        let mut out = response.clone();
        let choice = json!({
            "index": 0,
            "message": {"role": "assistant", "content": text},
            "finish_reason": "stop",
        });
        if let Some(obj) = out.as_object_mut() {
            obj.insert("choices".into(), Value::Array(vec![choice]));
        }
        out
    }

    fn classification_request(
        &self,
        model: &str,
        max_tokens: u32,
        instructions: &str,
        content: &str,
    ) -> Map<String, Value> {
        let body = json!({
            "model": model,
            "max_tokens": max_tokens,
            "messages": [
                {"role": "system", "content": instructions},
                {"role": "user", "content": content},
            ],
        });
        match body {
            Value::Object(map) => map,
            _ => Map::new(),
        }
    }

    fn stream_decoder(&self, model: &str) -> Box<dyn StreamDecoder> {
        Box::new(OpenAiStreamDecoder::new(model))
    }
}

fn read_message(i: usize, msg: &Value) -> Result<CommonMessage, ProtocolError> {
    let path = format!("messages[{i}]");
    as_object(msg, &path)?;
    let role = required_str(msg, "role", &path)?;
    let content = msg.get("content").and_then(content_text);

    let common = match role {
        "system" | "developer" => CommonMessage {
            content,
            ..CommonMessage::system("")
        },
        "user" => CommonMessage {
            content,
            ..CommonMessage::user("")
        },
        "assistant" => CommonMessage::assistant_tool_calls(content, read_tool_calls(msg, &path)?),
        "tool" => {
            let call_id = required_str(msg, "tool_call_id", &path)?;
            let name = msg.get("name").and_then(Value::as_str).map(String::from);
            CommonMessage::tool_result(call_id, name, content.unwrap_or_default())
        }
        "function" => {
            let name = required_str(msg, "name", &path)?;
            CommonMessage::tool_result(name, Some(name.to_owned()), content.unwrap_or_default())
        }
        other => {
            return Err(ProtocolError::new(
                format!("{path}.role"),
                format!("unknown role '{other}'"),
            ));
        }
    };
    Ok(common.with_origin(i, None))
}

fn read_tool_calls(msg: &Value, path: &str) -> Result<Vec<ToolCall>, ProtocolError> {
    let Some(calls) = msg.get("tool_calls").filter(|v| !v.is_null()) else {
        return Ok(Vec::new());
    };
    let calls = calls
        .as_array()
        .ok_or_else(|| ProtocolError::expected(format!("{path}.tool_calls"), "array"))?;

    calls
        .iter()
        .enumerate()
        .map(|(k, call)| {
            let call_path = format!("{path}.tool_calls[{k}]");
            let id = required_str(call, "id", &call_path)?;
            let function_path = format!("{call_path}.function");
            let function = call
                .get("function")
                .ok_or_else(|| ProtocolError::missing(&function_path))?;
            let name = required_str(function, "name", &function_path)?;
            let arguments = match function.get("arguments") {
                Some(Value::String(s)) => s.clone(),
                Some(Value::Null) | None => String::new(),
                Some(other) => other.to_string(),
            };
            Ok(ToolCall::new(id, name, arguments))
        })
        .collect()
}

fn patch_message(msg: &mut Value, common: &CommonMessage, _path: &str) -> Result<(), ProtocolError> {
    if let Some(obj) = msg.as_object_mut() {
        obj.insert("content".into(), Value::String(common.text().to_owned()));
    }
    Ok(())
}

fn render_messages(messages: &[CommonMessage]) -> Vec<Value> {
    messages.iter().map(render_message).collect()
}

fn render_message(msg: &CommonMessage) -> Value {
    match msg.role {
        Role::Assistant => {
            let mut out = json!({
                "role": "assistant",
                "content": msg.content,
            });
            if !msg.tool_calls.is_empty() {
                out["tool_calls"] = msg
                    .tool_calls
                    .iter()
                    .map(|c| {
                        json!({
                            "id": c.id,
                            "type": "function",
                            "function": {"name": c.name, "arguments": c.arguments},
                        })
                    })
                    .collect();
            }
            out
        }
        Role::Tool => json!({
            "role": "tool",
            "tool_call_id": msg.tool_call_id,
            "content": msg.text(),
        }),
        Role::User => json!({"role": "user", "content": msg.text()}),
        Role::System => json!({"role": "system", "content": msg.text()}),
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Stream decoder for `chat.completion.chunk` events.
#[derive(Debug, Clone)]
pub struct OpenAiStreamDecoder {
    model: String,
    id: Option<String>,
    created: Option<u64>,
}

impl OpenAiStreamDecoder {
    /// A decoder for a stream of `model`.
    pub fn new(model: &str) -> Self {
        Self {
            model: model.to_owned(),
            id: None,
            created: None,
        }
    }

    fn chunk(&mut self, delta: Value, finish_reason: Option<&str>) -> SseEvent {
        let id = self
            .id
            .get_or_insert_with(|| format!("chatcmpl-{}", uuid::Uuid::new_v4().simple()))
            .clone();
        let created = *self.created.get_or_insert_with(unix_now);
        let chunk = json!({
            "id": id,
            "object": "chat.completion.chunk",
            "created": created,
            "model": self.model,
            "choices": [{"index": 0, "delta": delta, "finish_reason": finish_reason}],
        });
        SseEvent::data(chunk.to_string())
    }
}

/// Split a stream chunk into its content delta and everything else.
///
/// The content half carries no finish reason or usage.
fn split_content(chunk: &Value) -> (Value, Value) {
    let mut lead = chunk.clone();
    let mut rest = chunk.clone();
    if let Some(obj) = lead.as_object_mut() {
        obj.remove("usage");
    }
    if let Some(choice) = lead.pointer_mut("/choices/0").and_then(Value::as_object_mut) {
        choice.insert("finish_reason".into(), Value::Null);
        if let Some(delta) = choice.get_mut("delta").and_then(Value::as_object_mut) {
            delta.remove("tool_calls");
        }
    }
    if let Some(delta) = rest.pointer_mut("/choices/0/delta").and_then(Value::as_object_mut) {
        delta.remove("content");
    }
    (lead, rest)
}

impl StreamDecoder for OpenAiStreamDecoder {
    fn decode(&mut self, event: SseEvent) -> Result<DecodedEvent, ProtocolError> {
        if event.is_done() {
            return Ok(DecodedEvent::terminal(event));
        }
        let Some(chunk) = event.json() else {
            return Ok(DecodedEvent::forward(event));
        };

        if self.id.is_none() {
            self.id = chunk.get("id").and_then(Value::as_str).map(String::from);
        }
        if self.created.is_none() {
            self.created = chunk.get("created").and_then(Value::as_u64);
        }

        let usage = chunk.get("usage").filter(|u| u.is_object()).map(|u| UsageTokens {
            input: count(u, "prompt_tokens"),
            output: count(u, "completion_tokens"),
        });

        let choice = chunk.get("choices").and_then(|c| c.get(0));
        let mut decoded = DecodedEvent {
            usage,
            ..DecodedEvent::forward(event)
        };

        let Some(choice) = choice else {
            if decoded.usage.is_some() {
                decoded.disposition = Disposition::Terminal;
            }
            return Ok(decoded);
        };

        let delta = choice.get("delta");
        decoded.text = delta
            .and_then(|d| d.get("content"))
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(String::from);

        if let Some(calls) = delta.and_then(|d| d.get("tool_calls")).and_then(Value::as_array) {
            for (k, call) in calls.iter().enumerate() {
                let index = call.get("index").and_then(Value::as_u64).ok_or_else(|| {
                    ProtocolError::missing(format!("choices[0].delta.tool_calls[{k}].index"))
                })?;
                let function = call.get("function");
                decoded.tool_calls.push(ToolCallFragment {
                    index: index as usize,
                    id: call.get("id").and_then(Value::as_str).map(String::from),
                    name: function
                        .and_then(|f| f.get("name"))
                        .and_then(Value::as_str)
                        .map(String::from),
                    arguments: function
                        .and_then(|f| f.get("arguments"))
                        .and_then(Value::as_str)
                        .map(String::from),
                });
            }
        }

        decoded.finish_reason = choice
            .get("finish_reason")
            .and_then(Value::as_str)
            .map(String::from);

        decoded.disposition = if !decoded.tool_calls.is_empty() {
            Disposition::ToolCall
        } else if decoded.finish_reason.is_some() {
            Disposition::Terminal
        } else {
            Disposition::Forward
        };

        // Content sharing a chunk with tool calls or a finish reason is
        // sent now; the rest of the chunk waits for the verdict.
        if decoded.disposition != Disposition::Forward && decoded.text.is_some() {
            let (lead, rest) = split_content(&chunk);
            decoded.lead = Some(SseEvent::data(lead.to_string()));
            decoded.event = SseEvent::data(rest.to_string());
        }
        Ok(decoded)
    }

    fn progress_events(&mut self, text: &str) -> Vec<SseEvent> {
        vec![self.chunk(json!({"role": "assistant", "content": text}), None)]
    }

    fn refusal_events(&mut self, text: &str) -> Vec<SseEvent> {
        vec![
            self.chunk(json!({"role": "assistant", "content": text}), None),
            self.chunk(json!({}), Some("stop")),
            SseEvent::data(DONE_SENTINEL),
        ]
    }

    fn continuation(&self) -> Box<dyn StreamDecoder> {
        Box::new(self.clone())
    }
}
