//! Stream reconstruction.
//!
//! A provider stream is consumed one [`SseEvent`] at a time. A
//! per-provider [`StreamDecoder`] classifies each event, and the
//! [`StreamAccumulator`] decides what reaches the client:
//!
//! ```text
//! Open ──first event──▶ Accumulating ──end of turn──▶ ToolCallsPending ──release──▶ Done
//!                            │                                 │
//!                            │ (no tool calls) ──release──▶ Done
//!                            │                                 └──refuse──▶ Refused
//! ```
//!
//! Text and pass-through events are forwarded as they arrive. Tool-call
//! events and terminal events (finish reason, usage, `[DONE]`) are withheld
//! in arrival order until the full tool-call set is known.

use std::collections::BTreeMap;

use tollgate_types::{ToolCall, UsageTokens};
use tracing::trace;

use crate::error::ProtocolError;
use crate::sse::SseEvent;

/// What to do with a decoded event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Send to the client now.
    Forward,
    /// Part of a tool call; withhold until the turn completes.
    ToolCall,
    /// End-of-turn bookkeeping (stop reason, usage); withhold.
    Terminal,
    /// Record what it carries but never send it (a duplicate message
    /// header on a continuation stream).
    Drop,
}

/// A piece of one tool call, keyed by the provider's index.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolCallFragment {
    /// Provider-assigned position of the call within the turn.
    pub index: usize,
    /// Call id, on the fragment that opens the call.
    pub id: Option<String>,
    /// Tool name, on the fragment that opens the call.
    pub name: Option<String>,
    /// Partial argument JSON text.
    pub arguments: Option<String>,
}

/// One provider event after classification.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedEvent {
    /// The event as it should be sent to the client (possibly rebased).
    pub event: SseEvent,
    /// Forward or withhold.
    pub disposition: Disposition,
    /// Text delta carried by the event.
    pub text: Option<String>,
    /// Tool-call fragments carried by the event.
    pub tool_calls: Vec<ToolCallFragment>,
    /// Usage reported by the event. Later reports replace earlier ones
    /// field by field.
    pub usage: Option<UsageTokens>,
    /// Stop reason reported by the event.
    pub finish_reason: Option<String>,
    /// Text split off a withheld event, sent to the client now. `event`
    /// then carries only the withheld remainder.
    pub lead: Option<SseEvent>,
}

impl DecodedEvent {
    /// An event carrying nothing the accumulator tracks.
    pub fn forward(event: SseEvent) -> Self {
        Self {
            event,
            disposition: Disposition::Forward,
            text: None,
            tool_calls: Vec::new(),
            usage: None,
            finish_reason: None,
            lead: None,
        }
    }

    /// A terminal event.
    pub fn terminal(event: SseEvent) -> Self {
        Self {
            disposition: Disposition::Terminal,
            ..Self::forward(event)
        }
    }
}

/// Per-provider, per-stream event classifier.
pub trait StreamDecoder: Send {
    /// Classify one upstream event.
    fn decode(&mut self, event: SseEvent) -> Result<DecodedEvent, ProtocolError>;

    /// Synthetic events showing `text` to the client before the upstream
    /// stream starts.
    fn progress_events(&mut self, text: &str) -> Vec<SseEvent>;

    /// Events delivering a refusal as ordinary assistant text, including
    /// the provider's terminal events.
    fn refusal_events(&mut self, text: &str) -> Vec<SseEvent>;

    /// A decoder for a continuation stream that appends to what the
    /// client has already received from this one.
    fn continuation(&self) -> Box<dyn StreamDecoder>;
}

/// Accumulator lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// No event seen yet.
    Open,
    /// Reading the upstream stream.
    Accumulating,
    /// Policy refused the turn; withheld events were discarded.
    Refused,
    /// The turn ended with tool calls awaiting a verdict.
    ToolCallsPending,
    /// Withheld events were released (or there were none).
    Done,
}

#[derive(Debug, Default)]
struct PartialToolCall {
    id: Option<String>,
    name: Option<String>,
    arguments: String,
}

/// Transient, per-stream accumulation state.
#[derive(Debug)]
pub struct StreamAccumulator {
    state: StreamState,
    text: String,
    tool_calls: BTreeMap<usize, PartialToolCall>,
    withheld: Vec<SseEvent>,
    usage: Option<UsageTokens>,
    finish_reason: Option<String>,
}

impl Default for StreamAccumulator {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamAccumulator {
    /// A fresh accumulator in [`StreamState::Open`].
    pub fn new() -> Self {
        Self {
            state: StreamState::Open,
            text: String::new(),
            tool_calls: BTreeMap::new(),
            withheld: Vec::new(),
            usage: None,
            finish_reason: None,
        }
    }

    /// Current state.
    pub fn state(&self) -> StreamState {
        self.state
    }

    /// All text seen so far, forwarded or not.
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Usage as last reported by the provider.
    pub fn usage(&self) -> UsageTokens {
        self.usage.unwrap_or_default()
    }

    /// Stop reason as last reported by the provider.
    pub fn finish_reason(&self) -> Option<&str> {
        self.finish_reason.as_deref()
    }

    /// Record one decoded event. Returns the event to forward to the
    /// client immediately, if any: the event itself, or the text split off
    /// a withheld one.
    pub fn push(&mut self, decoded: DecodedEvent) -> Option<SseEvent> {
        if self.state == StreamState::Open {
            self.state = StreamState::Accumulating;
        }

        if let Some(text) = &decoded.text {
            self.text.push_str(text);
        }
        for fragment in decoded.tool_calls {
            let slot = self.tool_calls.entry(fragment.index).or_default();
            if let Some(id) = fragment.id {
                slot.id = Some(id);
            }
            if let Some(name) = fragment.name {
                slot.name = Some(name);
            }
            if let Some(args) = fragment.arguments {
                slot.arguments.push_str(&args);
            }
        }
        if let Some(usage) = decoded.usage {
            let current = self.usage.get_or_insert_with(UsageTokens::default);
            if usage.input > 0 {
                current.input = usage.input;
            }
            if usage.output > 0 {
                current.output = usage.output;
            }
        }
        if decoded.finish_reason.is_some() {
            self.finish_reason = decoded.finish_reason;
        }

        match decoded.disposition {
            Disposition::Forward => Some(decoded.event),
            Disposition::Drop => None,
            Disposition::ToolCall | Disposition::Terminal => {
                trace!(event = ?decoded.event.event, "withholding stream event");
                self.withheld.push(decoded.event);
                decoded.lead
            }
        }
    }

    /// Close the turn and return the assembled tool calls in index order.
    ///
    /// Argument fragments are concatenated per index; JSON parsing is left
    /// to [`ToolCall::parsed_arguments`], which falls back to the raw text.
    pub fn finish_turn(&mut self) -> Vec<ToolCall> {
        let calls: Vec<ToolCall> = self
            .tool_calls
            .iter()
            .map(|(index, partial)| {
                ToolCall::new(
                    partial.id.clone().unwrap_or_else(|| format!("call_{index}")),
                    partial.name.clone().unwrap_or_default(),
                    partial.arguments.clone(),
                )
            })
            .collect();

        self.state = if calls.is_empty() {
            StreamState::Done
        } else {
            StreamState::ToolCallsPending
        };
        calls
    }

    /// Release withheld events in arrival order.
    pub fn release(&mut self) -> Vec<SseEvent> {
        self.state = StreamState::Done;
        std::mem::take(&mut self.withheld)
    }

    /// Discard withheld events; nothing of the tool calls reaches the client.
    pub fn refuse(&mut self) {
        self.state = StreamState::Refused;
        self.withheld.clear();
    }

    /// Number of withheld events.
    pub fn withheld_len(&self) -> usize {
        self.withheld.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text_event(text: &str) -> DecodedEvent {
        DecodedEvent {
            text: Some(text.into()),
            ..DecodedEvent::forward(SseEvent::data(text))
        }
    }

    fn tool_fragment(index: usize, id: Option<&str>, name: Option<&str>, args: &str) -> DecodedEvent {
        DecodedEvent {
            disposition: Disposition::ToolCall,
            tool_calls: vec![ToolCallFragment {
                index,
                id: id.map(Into::into),
                name: name.map(Into::into),
                arguments: Some(args.into()),
            }],
            ..DecodedEvent::forward(SseEvent::data(format!("tool {index} {args}")))
        }
    }

    #[test]
    fn starts_open_then_accumulates() {
        let mut acc = StreamAccumulator::new();
        assert_eq!(acc.state(), StreamState::Open);
        acc.push(text_event("a"));
        assert_eq!(acc.state(), StreamState::Accumulating);
    }

    #[test]
    fn text_forwarded_in_order() {
        let mut acc = StreamAccumulator::new();
        let forwarded: Vec<_> = ["Hel", "lo"]
            .iter()
            .filter_map(|t| acc.push(text_event(t)))
            .map(|e| e.data)
            .collect();
        assert_eq!(forwarded, vec!["Hel", "lo"]);
        assert_eq!(acc.text(), "Hello");
        assert!(acc.finish_turn().is_empty());
        assert_eq!(acc.state(), StreamState::Done);
    }

    #[test]
    fn argument_fragments_concatenate_per_index() {
        let mut acc = StreamAccumulator::new();
        assert!(acc.push(tool_fragment(0, Some("toolu_1"), Some("calc"), "{\"a\":1")).is_none());
        assert!(acc.push(tool_fragment(0, None, None, "}")).is_none());

        let calls = acc.finish_turn();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].id, "toolu_1");
        assert_eq!(calls[0].arguments, "{\"a\":1}");
        assert_eq!(calls[0].parsed_arguments(), serde_json::json!({"a": 1}));
        assert_eq!(acc.state(), StreamState::ToolCallsPending);
    }

    #[test]
    fn interleaved_calls_keep_index_order() {
        let mut acc = StreamAccumulator::new();
        acc.push(tool_fragment(1, Some("b"), Some("second"), "{"));
        acc.push(tool_fragment(0, Some("a"), Some("first"), "{}"));
        acc.push(tool_fragment(1, None, None, "}"));
        let calls = acc.finish_turn();
        assert_eq!(calls[0].name, "first");
        assert_eq!(calls[1].name, "second");
        assert_eq!(calls[1].arguments, "{}");
    }

    #[test]
    fn unparsable_arguments_stay_raw() {
        let mut acc = StreamAccumulator::new();
        acc.push(tool_fragment(0, Some("x"), Some("t"), "{\"a\":"));
        let calls = acc.finish_turn();
        assert_eq!(
            calls[0].parsed_arguments(),
            serde_json::Value::String("{\"a\":".into())
        );
    }

    #[test]
    fn release_returns_withheld_in_arrival_order() {
        let mut acc = StreamAccumulator::new();
        acc.push(tool_fragment(0, Some("x"), Some("t"), "{"));
        acc.push(tool_fragment(0, None, None, "}"));
        acc.push(DecodedEvent::terminal(SseEvent::data("[DONE]")));
        acc.finish_turn();
        let released: Vec<_> = acc.release().into_iter().map(|e| e.data).collect();
        assert_eq!(released, vec!["tool 0 {", "tool 0 }", "[DONE]"]);
        assert_eq!(acc.state(), StreamState::Done);
        assert_eq!(acc.withheld_len(), 0);
    }

    #[test]
    fn refuse_discards_withheld() {
        let mut acc = StreamAccumulator::new();
        acc.push(tool_fragment(0, Some("x"), Some("t"), "{}"));
        acc.finish_turn();
        acc.refuse();
        assert_eq!(acc.state(), StreamState::Refused);
        assert!(acc.release().is_empty());
    }

    #[test]
    fn split_text_forwarded_while_remainder_withheld() {
        let mut acc = StreamAccumulator::new();
        let out = acc.push(DecodedEvent {
            text: Some("Done.".into()),
            finish_reason: Some("stop".into()),
            lead: Some(SseEvent::data("text: Done.")),
            ..DecodedEvent::terminal(SseEvent::data("finish: stop"))
        });
        assert_eq!(out.map(|e| e.data).as_deref(), Some("text: Done."));
        assert_eq!(acc.text(), "Done.");
        assert_eq!(acc.withheld_len(), 1);

        acc.finish_turn();
        let released: Vec<_> = acc.release().into_iter().map(|e| e.data).collect();
        assert_eq!(released, vec!["finish: stop"]);
    }

    #[test]
    fn usage_merges_field_by_field() {
        let mut acc = StreamAccumulator::new();
        acc.push(DecodedEvent {
            usage: Some(UsageTokens { input: 12, output: 1 }),
            ..DecodedEvent::forward(SseEvent::data("start"))
        });
        acc.push(DecodedEvent {
            usage: Some(UsageTokens { input: 0, output: 30 }),
            finish_reason: Some("end_turn".into()),
            ..DecodedEvent::terminal(SseEvent::data("delta"))
        });
        assert_eq!(acc.usage(), UsageTokens { input: 12, output: 30 });
        assert_eq!(acc.finish_reason(), Some("end_turn"));
    }
}
