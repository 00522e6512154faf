//! Anthropic messages protocol.
//!
//! Messages carry either a string or an array of content blocks. One
//! provider message can fan out into several common messages (one per
//! `tool_result` or `text` block of a user turn), each tagged with its block
//! index so trust updates can be written back into the right block.
//!
//! Tool-call input is a structured object in buffered bodies but arrives as
//! `input_json_delta` string fragments in streams.

use std::collections::HashSet;

use serde_json::{Map, Value, json};
use tollgate_types::{CommonMessage, ProviderKind, Role, ToolCall, ToolDefinition, UsageTokens};

use super::{
    ProtocolAdapter, ProviderRequest, RequestTools, RouteInfo, as_object, content_text, count,
    into_object, rebuild_messages, required_str,
};
use crate::error::ProtocolError;
use crate::sse::SseEvent;
use crate::stream::{DecodedEvent, Disposition, StreamDecoder, ToolCallFragment};

/// Adapter for `POST /v1/messages`.
#[derive(Debug, Clone, Copy, Default)]
pub struct AnthropicAdapter;

impl ProtocolAdapter for AnthropicAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Anthropic
    }

    fn parse_request(&self, body: Value, _route: &RouteInfo) -> Result<ProviderRequest, ProtocolError> {
        let model = required_str(&body, "model", "$")?.to_owned();
        let stream = body.get("stream").and_then(Value::as_bool).unwrap_or(false);
        Ok(ProviderRequest {
            kind: ProviderKind::Anthropic,
            model,
            stream,
            body: into_object(body)?,
        })
    }

    fn messages_key(&self) -> &'static str {
        "messages"
    }

    fn to_common(&self, messages: &[Value]) -> Result<Vec<CommonMessage>, ProtocolError> {
        let mut out = Vec::with_capacity(messages.len());
        for (i, msg) in messages.iter().enumerate() {
            read_message(i, msg, &mut out)?;
        }
        Ok(out)
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
            input: count(raw_usage, "input_tokens"),
            output: count(raw_usage, "output_tokens"),
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
            let custom = match tool.get("type").and_then(Value::as_str) {
                None | Some("custom") => true,
                Some(_) => false,
            };
            if !custom {
                tools.opaque.push(tool.clone());
                continue;
            }
            let path = format!("tools[{i}]");
            let name = required_str(tool, "name", &path)?;
            tools.functions.push(ToolDefinition::new(
                name,
                tool.get("description").and_then(Value::as_str).map(String::from),
                tool.get("input_schema").cloned(),
            ));
        }
        Ok(tools)
    }

    fn render_tools(&self, tools: &[ToolDefinition], opaque: &[Value]) -> Value {
        let mut out: Vec<Value> = tools
            .iter()
            .map(|t| {
                json!({
                    "name": t.name,
                    "description": t.description,
                    "input_schema": t.parameters_schema,
                })
            })
            .collect();
        out.extend(opaque.iter().cloned());
        Value::Array(out)
    }

    fn parse_response(&self, response: &Value) -> Result<CommonMessage, ProtocolError> {
        let blocks = response
            .get("content")
            .and_then(Value::as_array)
            .ok_or_else(|| ProtocolError::missing("content"))?;
        read_assistant_blocks(blocks, "content")
    }

    fn refusal_response(&self, response: &Value, text: &str) -> Value {
        let mut out = response.clone();
        if let Some(obj) = out.as_object_mut() {
            obj.insert("content".into(), json!([{"type": "text", "text": text}]));
            obj.insert("stop_reason".into(), json!("end_turn"));
            obj.insert("stop_sequence".into(), Value::Null);
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
            "system": instructions,
            "messages": [{"role": "user", "content": content}],
        });
        match body {
            Value::Object(map) => map,
            _ => Map::new(),
        }
    }

    fn stream_decoder(&self, model: &str) -> Box<dyn StreamDecoder> {
        Box::new(AnthropicStreamDecoder::new(model))
    }
}

fn read_message(i: usize, msg: &Value, out: &mut Vec<CommonMessage>) -> Result<(), ProtocolError> {
    let path = format!("messages[{i}]");
    as_object(msg, &path)?;
    let role = match required_str(msg, "role", &path)? {
        "user" => Role::User,
        "assistant" => Role::Assistant,
        other => {
            return Err(ProtocolError::new(
                format!("{path}.role"),
                format!("unknown role '{other}'"),
            ));
        }
    };

    let content = msg
        .get("content")
        .ok_or_else(|| ProtocolError::missing(format!("{path}.content")))?;

    let blocks = match content {
        Value::String(text) => {
            out.push(plain(role, Some(text.clone())).with_origin(i, None));
            return Ok(());
        }
        Value::Array(blocks) => blocks,
        _ => return Err(ProtocolError::expected(format!("{path}.content"), "string or array")),
    };

    if role == Role::Assistant {
        let msg = read_assistant_blocks(blocks, &format!("{path}.content"))?;
        out.push(msg.with_origin(i, None));
        return Ok(());
    }

    let before = out.len();
    for (p, block) in blocks.iter().enumerate() {
        let block_path = format!("{path}.content[{p}]");
        match block.get("type").and_then(Value::as_str) {
            Some("text") => {
                let text = block.get("text").and_then(Value::as_str).unwrap_or_default();
                out.push(CommonMessage::user(text).with_origin(i, Some(p)));
            }
            Some("tool_result") => {
                let call_id = required_str(block, "tool_use_id", &block_path)?;
                let text = match block.get("content") {
                    Some(c) => content_text(c).unwrap_or_else(|| c.to_string()),
                    None => String::new(),
                };
                let is_error = block.get("is_error").and_then(Value::as_bool).unwrap_or(false);
                out.push(
                    CommonMessage::tool_result(call_id, None, text)
                        .failed(is_error)
                        .with_origin(i, Some(p)),
                );
            }
            _ => {}
        }
    }
    if out.len() == before {
        out.push(plain(role, None).with_origin(i, None));
    }
    Ok(())
}

fn plain(role: Role, content: Option<String>) -> CommonMessage {
    match role {
        Role::Assistant => CommonMessage::assistant_tool_calls(content, Vec::new()),
        _ => CommonMessage {
            content,
            ..CommonMessage::user("")
        },
    }
}

fn read_assistant_blocks(blocks: &[Value], path: &str) -> Result<CommonMessage, ProtocolError> {
    let mut texts = Vec::new();
    let mut calls = Vec::new();
    for (p, block) in blocks.iter().enumerate() {
        match block.get("type").and_then(Value::as_str) {
            Some("text") => {
                if let Some(text) = block.get("text").and_then(Value::as_str) {
                    texts.push(text);
                }
            }
            Some("tool_use") => {
                let block_path = format!("{path}[{p}]");
                let id = required_str(block, "id", &block_path)?;
                let name = required_str(block, "name", &block_path)?;
                let input = block.get("input").cloned().unwrap_or_else(|| json!({}));
                calls.push(ToolCall::new(id, name, input.to_string()));
            }
            _ => {}
        }
    }
    let content = if texts.is_empty() {
        None
    } else {
        Some(texts.join("\n"))
    };
    Ok(CommonMessage::assistant_tool_calls(content, calls))
}

fn patch_message(msg: &mut Value, common: &CommonMessage, path: &str) -> Result<(), ProtocolError> {
    let new_text = Value::String(common.text().to_owned());
    let Some(part) = common.origin.and_then(|o| o.part) else {
        if let Some(obj) = msg.as_object_mut() {
            obj.insert("content".into(), new_text);
        }
        return Ok(());
    };

    let block = msg
        .get_mut("content")
        .and_then(|c| c.get_mut(part))
        .and_then(Value::as_object_mut)
        .ok_or_else(|| ProtocolError::missing(format!("{path}.content[{part}]")))?;

    match block.get("type").and_then(Value::as_str) {
        Some("tool_result") => {
            block.insert("content".into(), new_text);
        }
        _ => {
            block.insert("text".into(), new_text);
        }
    }
    Ok(())
}

fn render_messages(messages: &[CommonMessage]) -> Vec<Value> {
    let mut out = Vec::new();
    let mut results: Vec<Value> = Vec::new();

    for msg in messages {
        if msg.role == Role::Tool {
            let mut block = json!({
                "type": "tool_result",
                "tool_use_id": msg.tool_call_id,
                "content": msg.text(),
            });
            if msg.is_error {
                block["is_error"] = Value::Bool(true);
            }
            results.push(block);
            continue;
        }
        if !results.is_empty() {
            out.push(json!({"role": "user", "content": std::mem::take(&mut results)}));
        }
        match msg.role {
            Role::Assistant => {
                let mut blocks = Vec::new();
                if let Some(text) = msg.content.as_deref().filter(|t| !t.is_empty()) {
                    blocks.push(json!({"type": "text", "text": text}));
                }
                for call in &msg.tool_calls {
                    let input = match call.parsed_arguments() {
                        obj @ Value::Object(_) => obj,
                        _ => json!({}),
                    };
                    blocks.push(json!({
                        "type": "tool_use",
                        "id": call.id,
                        "name": call.name,
                        "input": input,
                    }));
                }
                out.push(json!({"role": "assistant", "content": blocks}));
            }
            _ => out.push(json!({"role": "user", "content": msg.text()})),
        }
    }
    if !results.is_empty() {
        out.push(json!({"role": "user", "content": results}));
    }
    out
}

/// Stream decoder for Anthropic message events.
///
/// Tracks which content-block indices belong to `tool_use` blocks so their
/// deltas and stop events are withheld, and rebases block indices when the
/// client has already received blocks from an earlier stream (progress
/// text or a first turn before a continuation).
#[derive(Debug, Clone)]
pub struct AnthropicStreamDecoder {
    model: String,
    message_started: bool,
    suppress_message_start: bool,
    block_offset: usize,
    forwarded_blocks: usize,
    tool_blocks: HashSet<usize>,
}

impl AnthropicStreamDecoder {
    /// A decoder for a stream of `model`.
    pub fn new(model: &str) -> Self {
        Self {
            model: model.to_owned(),
            message_started: false,
            suppress_message_start: false,
            block_offset: 0,
            forwarded_blocks: 0,
            tool_blocks: HashSet::new(),
        }
    }

    fn named(kind: &str, data: Value) -> SseEvent {
        SseEvent::named(kind, data.to_string())
    }

    fn open_message(&mut self, out: &mut Vec<SseEvent>) {
        if self.message_started {
            return;
        }
        self.message_started = true;
        self.suppress_message_start = true;
        out.push(Self::named(
            "message_start",
            json!({
                "type": "message_start",
                "message": {
                    "id": format!("msg_{}", uuid::Uuid::new_v4().simple()),
                    "type": "message",
                    "role": "assistant",
                    "model": self.model,
                    "content": [],
                    "stop_reason": null,
                    "stop_sequence": null,
                    "usage": {"input_tokens": 0, "output_tokens": 0},
                }
            }),
        ));
    }

    fn text_block(&mut self, text: &str, out: &mut Vec<SseEvent>) {
        let index = self.forwarded_blocks;
        self.forwarded_blocks += 1;
        out.push(Self::named(
            "content_block_start",
            json!({"type": "content_block_start", "index": index, "content_block": {"type": "text", "text": ""}}),
        ));
        out.push(Self::named(
            "content_block_delta",
            json!({"type": "content_block_delta", "index": index, "delta": {"type": "text_delta", "text": text}}),
        ));
        out.push(Self::named(
            "content_block_stop",
            json!({"type": "content_block_stop", "index": index}),
        ));
    }

    /// Shift the block index of a forwarded event and remember that the
    /// client has seen it.
    fn rebase(&mut self, mut event: SseEvent, mut data: Value, index: usize) -> SseEvent {
        let client_index = index + self.block_offset;
        self.forwarded_blocks = self.forwarded_blocks.max(client_index + 1);
        if self.block_offset > 0 {
            data["index"] = json!(client_index);
            event.data = data.to_string();
        }
        event
    }
}

impl StreamDecoder for AnthropicStreamDecoder {
    fn decode(&mut self, event: SseEvent) -> Result<DecodedEvent, ProtocolError> {
        let Some(data) = event.json() else {
            return Ok(DecodedEvent::forward(event));
        };
        let kind = data
            .get("type")
            .and_then(Value::as_str)
            .map(String::from)
            .or_else(|| event.event.clone())
            .unwrap_or_default();
        let index = data.get("index").and_then(Value::as_u64).map(|i| i as usize);

        match kind.as_str() {
            "message_start" => {
                let usage = data
                    .get("message")
                    .and_then(|m| m.get("usage"))
                    .map(|u| UsageTokens {
                        input: count(u, "input_tokens"),
                        output: count(u, "output_tokens"),
                    });
                let disposition = if self.suppress_message_start {
                    Disposition::Drop
                } else {
                    self.message_started = true;
                    Disposition::Forward
                };
                Ok(DecodedEvent {
                    disposition,
                    usage,
                    ..DecodedEvent::forward(event)
                })
            }
            "content_block_start" => {
                let index = index.ok_or_else(|| ProtocolError::missing("content_block_start.index"))?;
                let block = data.get("content_block");
                if block.and_then(|b| b.get("type")).and_then(Value::as_str) == Some("tool_use") {
                    self.tool_blocks.insert(index);
                    let fragment = ToolCallFragment {
                        index,
                        id: block.and_then(|b| b.get("id")).and_then(Value::as_str).map(String::from),
                        name: block.and_then(|b| b.get("name")).and_then(Value::as_str).map(String::from),
                        arguments: None,
                    };
                    return Ok(DecodedEvent {
                        disposition: Disposition::ToolCall,
                        tool_calls: vec![fragment],
                        ..DecodedEvent::forward(event)
                    });
                }
                let text = block
                    .and_then(|b| b.get("text"))
                    .and_then(Value::as_str)
                    .filter(|t| !t.is_empty())
                    .map(String::from);
                let event = self.rebase(event, data, index);
                Ok(DecodedEvent {
                    text,
                    ..DecodedEvent::forward(event)
                })
            }
            "content_block_delta" => {
                let index = index.ok_or_else(|| ProtocolError::missing("content_block_delta.index"))?;
                let delta = data.get("delta");
                if self.tool_blocks.contains(&index) {
                    let fragment = ToolCallFragment {
                        index,
                        arguments: delta
                            .and_then(|d| d.get("partial_json"))
                            .and_then(Value::as_str)
                            .map(String::from),
                        ..Default::default()
                    };
                    return Ok(DecodedEvent {
                        disposition: Disposition::ToolCall,
                        tool_calls: vec![fragment],
                        ..DecodedEvent::forward(event)
                    });
                }
                let text = match delta.and_then(|d| d.get("type")).and_then(Value::as_str) {
                    Some("text_delta") => delta
                        .and_then(|d| d.get("text"))
                        .and_then(Value::as_str)
                        .map(String::from),
                    _ => None,
                };
                let event = self.rebase(event, data, index);
                Ok(DecodedEvent {
                    text,
                    ..DecodedEvent::forward(event)
                })
            }
            "content_block_stop" => {
                let index = index.ok_or_else(|| ProtocolError::missing("content_block_stop.index"))?;
                if self.tool_blocks.contains(&index) {
                    return Ok(DecodedEvent {
                        disposition: Disposition::ToolCall,
                        ..DecodedEvent::forward(event)
                    });
                }
                let event = self.rebase(event, data, index);
                Ok(DecodedEvent::forward(event))
            }
            "message_delta" => {
                let finish_reason = data
                    .get("delta")
                    .and_then(|d| d.get("stop_reason"))
                    .and_then(Value::as_str)
                    .map(String::from);
                let usage = data.get("usage").map(|u| UsageTokens {
                    input: count(u, "input_tokens"),
                    output: count(u, "output_tokens"),
                });
                Ok(DecodedEvent {
                    usage,
                    finish_reason,
                    ..DecodedEvent::terminal(event)
                })
            }
            "message_stop" => Ok(DecodedEvent::terminal(event)),
            _ => Ok(DecodedEvent::forward(event)),
        }
    }

    fn progress_events(&mut self, text: &str) -> Vec<SseEvent> {
        let mut out = Vec::new();
        self.open_message(&mut out);
        self.text_block(text, &mut out);
        self.block_offset = self.forwarded_blocks;
        out
    }

    fn refusal_events(&mut self, text: &str) -> Vec<SseEvent> {
        let mut out = Vec::new();
        self.open_message(&mut out);
        self.text_block(text, &mut out);
        out.push(Self::named(
            "message_delta",
            json!({
                "type": "message_delta",
                "delta": {"stop_reason": "end_turn", "stop_sequence": null},
                "usage": {"output_tokens": 0},
            }),
        ));
        out.push(Self::named("message_stop", json!({"type": "message_stop"})));
        out
    }

    fn continuation(&self) -> Box<dyn StreamDecoder> {
        Box::new(Self {
            model: self.model.clone(),
            message_started: self.message_started,
            suppress_message_start: self.message_started,
            block_offset: self.forwarded_blocks,
            forwarded_blocks: self.forwarded_blocks,
            tool_blocks: HashSet::new(),
        })
    }
}
