//! Gemini `generateContent` protocol.
//!
//! The model and the streaming flag come from the route
//! (`/v1beta/models/{model}:generateContent` or `:streamGenerateContent`),
//! not the body. Function calls carry structured `args` and usually no id,
//! so results are matched to calls by name; ids are synthesized from the
//! call's position when absent.
//!
//! Streams (`alt=sse`) deliver whole `GenerateContentResponse` objects per
//! event; a function call always arrives complete within one event.

use serde_json::{Map, Value, json};
use tollgate_types::{CommonMessage, ProviderKind, Role, ToolCall, ToolDefinition, UsageTokens};

use super::{
    ProtocolAdapter, ProviderRequest, RequestTools, RouteInfo, as_object, count, into_object,
    rebuild_messages, required_str,
};
use crate::error::ProtocolError;
use crate::sse::SseEvent;
use crate::stream::{DecodedEvent, Disposition, StreamDecoder, ToolCallFragment};

/// Adapter for `POST /v1beta/models/{model}:generateContent`.
#[derive(Debug, Clone, Copy, Default)]
pub struct GeminiAdapter;

impl ProtocolAdapter for GeminiAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Gemini
    }

    fn parse_request(&self, body: Value, route: &RouteInfo) -> Result<ProviderRequest, ProtocolError> {
        let model = route
            .model
            .clone()
            .filter(|m| !m.is_empty())
            .ok_or_else(|| ProtocolError::new("model", "model missing from request path"))?;
        Ok(ProviderRequest {
            kind: ProviderKind::Gemini,
            model,
            stream: route.stream.unwrap_or(false),
            body: into_object(body)?,
        })
    }

    fn messages_key(&self) -> &'static str {
        "contents"
    }

    fn to_common(&self, messages: &[Value]) -> Result<Vec<CommonMessage>, ProtocolError> {
        let mut out = Vec::with_capacity(messages.len());
        // (name, id) of calls not yet answered, oldest first.
        let mut pending: Vec<(String, String)> = Vec::new();

        for (i, content) in messages.iter().enumerate() {
            let path = format!("contents[{i}]");
            as_object(content, &path)?;
            let parts = parts_of(content, &path)?;
            let role = content.get("role").and_then(Value::as_str).unwrap_or("user");

            if role == "model" {
                let msg = read_model_parts(parts, i, &format!("{path}.parts"))?;
                pending.extend(msg.tool_calls.iter().map(|c| (c.name.clone(), c.id.clone())));
                out.push(msg.with_origin(i, None));
                continue;
            }

            let before = out.len();
            for (p, part) in parts.iter().enumerate() {
                if let Some(text) = part.get("text").and_then(Value::as_str) {
                    out.push(CommonMessage::user(text).with_origin(i, Some(p)));
                } else if let Some(response) = part.get("functionResponse") {
                    let part_path = format!("{path}.parts[{p}].functionResponse");
                    let name = required_str(response, "name", &part_path)?;
                    let call_id = match response.get("id").and_then(Value::as_str) {
                        Some(id) => {
                            pending.retain(|(_, pending_id)| pending_id != id);
                            id.to_owned()
                        }
                        None => match pending.iter().position(|(n, _)| n == name) {
                            Some(pos) => pending.remove(pos).1,
                            None => format!("call_{i}_{p}"),
                        },
                    };
                    let content = response.get("response").cloned().unwrap_or(Value::Null);
                    out.push(
                        CommonMessage::tool_result(call_id, Some(name.to_owned()), content.to_string())
                            .with_origin(i, Some(p)),
                    );
                }
            }
            if out.len() == before {
                out.push(
                    CommonMessage {
                        content: None,
                        ..CommonMessage::user("")
                    }
                    .with_origin(i, None),
                );
            }
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
            input: count(raw_usage, "promptTokenCount"),
            output: count(raw_usage, "candidatesTokenCount"),
        }
    }

    fn response_usage(&self, response: &Value) -> UsageTokens {
        response
            .get("usageMetadata")
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

        for (i, entry) in declared.iter().enumerate() {
            let Some(functions) = entry.get("functionDeclarations") else {
                tools.opaque.push(entry.clone());
                continue;
            };
            let functions = functions.as_array().ok_or_else(|| {
                ProtocolError::expected(format!("tools[{i}].functionDeclarations"), "array")
            })?;
            for (j, function) in functions.iter().enumerate() {
                let name = required_str(function, "name", &format!("tools[{i}].functionDeclarations[{j}]"))?;
                tools.functions.push(ToolDefinition::new(
                    name,
                    function.get("description").and_then(Value::as_str).map(String::from),
                    function.get("parameters").cloned(),
                ));
            }
        }
        Ok(tools)
    }

    fn render_tools(&self, tools: &[ToolDefinition], opaque: &[Value]) -> Value {
        let mut out = Vec::with_capacity(opaque.len() + 1);
        if !tools.is_empty() {
            let declarations: Vec<Value> = tools
                .iter()
                .map(|t| {
                    json!({
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.parameters_schema,
                    })
                })
                .collect();
            out.push(json!({"functionDeclarations": declarations}));
        }
        out.extend(opaque.iter().cloned());
        Value::Array(out)
    }

    fn parse_response(&self, response: &Value) -> Result<CommonMessage, ProtocolError> {
        let parts = response
            .get("candidates")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("content"))
            .and_then(|c| c.get("parts"))
            .and_then(Value::as_array)
            .ok_or_else(|| ProtocolError::missing("candidates[0].content.parts"))?;
        read_model_parts(parts, 0, "candidates[0].content.parts")
    }

    fn refusal_response(&self, response: &Value, text: &str) -> Value {
        let mut out = response.clone();
        if let Some(obj) = out.as_object_mut() {
            obj.insert("candidates".into(), json!([refusal_candidate(text)]));
        }
        out
    }

    fn classification_request(
        &self,
        _model: &str,
        max_tokens: u32,
        instructions: &str,
        content: &str,
    ) -> Map<String, Value> {
        let body = json!({
            "systemInstruction": {"parts": [{"text": instructions}]},
            "contents": [{"role": "user", "parts": [{"text": content}]}],
            "generationConfig": {
                "maxOutputTokens": max_tokens,
                "responseMimeType": "application/json",
            },
        });
        match body {
            Value::Object(map) => map,
            _ => Map::new(),
        }
    }

    fn stream_decoder(&self, model: &str) -> Box<dyn StreamDecoder> {
        Box::new(GeminiStreamDecoder::new(model))
    }
}

fn parts_of<'a>(content: &'a Value, path: &str) -> Result<&'a [Value], ProtocolError> {
    match content.get("parts") {
        Some(Value::Array(parts)) => Ok(parts),
        Some(_) => Err(ProtocolError::expected(format!("{path}.parts"), "array")),
        None => Err(ProtocolError::missing(format!("{path}.parts"))),
    }
}

fn read_model_parts(parts: &[Value], i: usize, path: &str) -> Result<CommonMessage, ProtocolError> {
    let mut texts = Vec::new();
    let mut calls = Vec::new();
    for (p, part) in parts.iter().enumerate() {
        if let Some(text) = part.get("text").and_then(Value::as_str) {
            texts.push(text);
        } else if let Some(call) = part.get("functionCall") {
            let name = required_str(call, "name", &format!("{path}[{p}].functionCall"))?;
            let id = call
                .get("id")
                .and_then(Value::as_str)
                .map(String::from)
                .unwrap_or_else(|| format!("call_{i}_{p}"));
            let args = call.get("args").cloned().unwrap_or_else(|| json!({}));
            calls.push(ToolCall::new(id, name, args.to_string()));
        }
    }
    let content = if texts.is_empty() {
        None
    } else {
        Some(texts.concat())
    };
    Ok(CommonMessage::assistant_tool_calls(content, calls))
}

fn patch_message(msg: &mut Value, common: &CommonMessage, path: &str) -> Result<(), ProtocolError> {
    let new_text = common.text().to_owned();
    let Some(part) = common.origin.and_then(|o| o.part) else {
        if let Some(obj) = msg.as_object_mut() {
            obj.insert("parts".into(), json!([{"text": new_text}]));
        }
        return Ok(());
    };

    let target = msg
        .get_mut("parts")
        .and_then(|p| p.get_mut(part))
        .and_then(Value::as_object_mut)
        .ok_or_else(|| ProtocolError::missing(format!("{path}.parts[{part}]")))?;

    if let Some(response) = target.get_mut("functionResponse").and_then(Value::as_object_mut) {
        response.insert("response".into(), json!({"content": new_text}));
    } else {
        target.insert("text".into(), Value::String(new_text));
    }
    Ok(())
}

fn render_messages(messages: &[CommonMessage]) -> Vec<Value> {
    let mut out = Vec::new();
    let mut responses: Vec<Value> = Vec::new();

    for msg in messages {
        if msg.role == Role::Tool {
            let response = match serde_json::from_str::<Value>(msg.text()) {
                Ok(obj @ Value::Object(_)) => obj,
                _ => json!({"content": msg.text()}),
            };
            responses.push(json!({
                "functionResponse": {
                    "name": msg.name.as_deref().unwrap_or_default(),
                    "response": response,
                }
            }));
            continue;
        }
        if !responses.is_empty() {
            out.push(json!({"role": "user", "parts": std::mem::take(&mut responses)}));
        }
        match msg.role {
            Role::Assistant => {
                let mut parts = Vec::new();
                if let Some(text) = msg.content.as_deref().filter(|t| !t.is_empty()) {
                    parts.push(json!({"text": text}));
                }
                for call in &msg.tool_calls {
                    let args = match call.parsed_arguments() {
                        obj @ Value::Object(_) => obj,
                        _ => json!({}),
                    };
                    parts.push(json!({"functionCall": {"name": call.name, "args": args}}));
                }
                out.push(json!({"role": "model", "parts": parts}));
            }
            _ => out.push(json!({"role": "user", "parts": [{"text": msg.text()}]})),
        }
    }
    if !responses.is_empty() {
        out.push(json!({"role": "user", "parts": responses}));
    }
    out
}

fn refusal_candidate(text: &str) -> Value {
    json!({
        "content": {"role": "model", "parts": [{"text": text}]},
        "finishReason": "STOP",
        "index": 0,
    })
}

/// Split a stream chunk into its text parts and everything else.
///
/// The text half carries no finish reason or usage.
fn split_text_parts(chunk: &Value) -> (Value, Value) {
    let mut lead = chunk.clone();
    let mut rest = chunk.clone();
    if let Some(obj) = lead.as_object_mut() {
        obj.remove("usageMetadata");
    }
    if let Some(candidate) = lead.pointer_mut("/candidates/0").and_then(Value::as_object_mut) {
        candidate.remove("finishReason");
    }
    retain_parts(&mut lead, |part| part.get("text").is_some());
    retain_parts(&mut rest, |part| part.get("text").is_none());
    (lead, rest)
}

fn retain_parts(chunk: &mut Value, keep: impl Fn(&Value) -> bool) {
    if let Some(Value::Array(parts)) = chunk.pointer_mut("/candidates/0/content/parts") {
        parts.retain(|part| keep(part));
    }
}

/// Stream decoder for Gemini `alt=sse` streams.
#[derive(Debug, Clone)]
pub struct GeminiStreamDecoder {
    model: String,
    next_call: usize,
}

impl GeminiStreamDecoder {
    /// A decoder for a stream of `model`.
    pub fn new(model: &str) -> Self {
        Self {
            model: model.to_owned(),
            next_call: 0,
        }
    }

    fn chunk(&self, candidate: Value) -> SseEvent {
        SseEvent::data(json!({"candidates": [candidate], "modelVersion": self.model}).to_string())
    }
}

impl StreamDecoder for GeminiStreamDecoder {
    fn decode(&mut self, event: SseEvent) -> Result<DecodedEvent, ProtocolError> {
        let Some(data) = event.json() else {
            return Ok(DecodedEvent::forward(event));
        };
        let candidate = data.get("candidates").and_then(|c| c.get(0));
        let parts = candidate
            .and_then(|c| c.get("content"))
            .and_then(|c| c.get("parts"))
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default();

        let mut text = String::new();
        let mut fragments = Vec::new();
        for (p, part) in parts.iter().enumerate() {
            if let Some(t) = part.get("text").and_then(Value::as_str) {
                text.push_str(t);
            } else if let Some(call) = part.get("functionCall") {
                let name = required_str(call, "name", &format!("candidates[0].content.parts[{p}].functionCall"))?;
                let args = call.get("args").cloned().unwrap_or_else(|| json!({}));
                fragments.push(ToolCallFragment {
                    index: self.next_call,
                    id: call.get("id").and_then(Value::as_str).map(String::from),
                    name: Some(name.to_owned()),
                    arguments: Some(args.to_string()),
                });
                self.next_call += 1;
            }
        }

        let finish_reason = candidate
            .and_then(|c| c.get("finishReason"))
            .and_then(Value::as_str)
            .map(String::from);
        let usage = data.get("usageMetadata").map(|u| UsageTokens {
            input: count(u, "promptTokenCount"),
            output: count(u, "candidatesTokenCount"),
        });

        let disposition = if !fragments.is_empty() {
            Disposition::ToolCall
        } else if finish_reason.is_some() {
            Disposition::Terminal
        } else {
            Disposition::Forward
        };

        // Text sharing a chunk with a function call or finish reason is
        // sent now; the rest of the chunk waits for the verdict.
        let (event, lead) = if disposition != Disposition::Forward && !text.is_empty() {
            let (lead, rest) = split_text_parts(&data);
            (SseEvent::data(rest.to_string()), Some(SseEvent::data(lead.to_string())))
        } else {
            (event, None)
        };

        Ok(DecodedEvent {
            event,
            disposition,
            text: (!text.is_empty()).then_some(text),
            tool_calls: fragments,
            usage,
            finish_reason,
            lead,
        })
    }

    fn progress_events(&mut self, text: &str) -> Vec<SseEvent> {
        vec![self.chunk(json!({
            "content": {"role": "model", "parts": [{"text": text}]},
            "index": 0,
        }))]
    }

    fn refusal_events(&mut self, text: &str) -> Vec<SseEvent> {
        vec![self.chunk(refusal_candidate(text))]
    }

    fn continuation(&self) -> Box<dyn StreamDecoder> {
        Box::new(Self::new(&self.model))
    }
}
