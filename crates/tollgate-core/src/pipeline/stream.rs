//! Streaming orchestration.
//!
//! The request is parsed and bound to its agent before anything is sent,
//! so those failures still become HTTP errors. Everything after runs on a
//! spawned task that feeds a bounded channel the HTTP layer drains into the
//! response body.
//!
//! Text is forwarded as it arrives. Tool-call and terminal events are
//! withheld by the [`StreamAccumulator`] until the turn ends and the policy
//! verdict is known. A closed channel means the client went away: the
//! upstream stream is dropped and the partial turn is recorded as aborted.

use std::sync::{Arc, Mutex, PoisonError};

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use tollgate_llm::{SseEvent, StreamAccumulator, StreamDecoder, UpstreamError};
use tollgate_types::{CommonMessage, InteractionStatus, ToolCall, TrustVerdict, UsageTokens};

use super::{Intake, Pipeline, ProxyRequest, Screened, tag_calls};
use crate::classifier::{NoopSink, ProgressSink};
use crate::error::PipelineError;
use crate::policy::Refusal;

/// Channel capacity between the pipeline task and the response body.
const STREAM_BUFFER: usize = 64;

/// One item of a streamed response.
#[derive(Debug)]
pub enum StreamItem {
    /// An SSE event to write to the client.
    Event(SseEvent),
    /// The request failed. Always the last item.
    Error(PipelineError),
}

/// Turns classifier progress into synthetic provider events.
///
/// Sends never wait; progress is dropped when the channel is full.
struct StreamProgress {
    decoder: Mutex<Box<dyn StreamDecoder>>,
    tx: mpsc::Sender<StreamItem>,
}

impl StreamProgress {
    fn new(decoder: Box<dyn StreamDecoder>, tx: mpsc::Sender<StreamItem>) -> Self {
        Self {
            decoder: Mutex::new(decoder),
            tx,
        }
    }

    fn into_decoder(self) -> Box<dyn StreamDecoder> {
        self.decoder
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl ProgressSink for StreamProgress {
    fn on_start(&self) {
        debug!("surfacing classification progress");
    }

    fn on_progress(&self, text: &str) {
        let Ok(mut decoder) = self.decoder.lock() else {
            return;
        };
        for event in decoder.progress_events(text) {
            if self.tx.try_send(StreamItem::Event(event)).is_err() {
                debug!("progress event dropped");
            }
        }
    }
}

/// Decoder and accumulator for one upstream stream.
struct StreamTurn {
    decoder: Box<dyn StreamDecoder>,
    acc: StreamAccumulator,
}

impl StreamTurn {
    fn new(decoder: Box<dyn StreamDecoder>) -> Self {
        Self {
            decoder,
            acc: StreamAccumulator::new(),
        }
    }

    /// What the turn said, as recorded in the audit log.
    fn message(&self, calls: Vec<ToolCall>) -> Value {
        let text = self.acc.text();
        let content = (!text.is_empty()).then(|| text.to_owned());
        to_record(CommonMessage::assistant_tool_calls(content, calls))
    }
}

enum TurnEnd {
    /// The upstream stream ended; these calls were requested.
    Finished(Vec<ToolCall>),
    /// The client stopped reading.
    Disconnected,
    /// The upstream call failed.
    Failed(PipelineError),
}

fn to_record(message: CommonMessage) -> Value {
    serde_json::to_value(message).unwrap_or(Value::Null)
}

/// Send `events` in order. Returns `false` once the client is gone.
async fn send_all(tx: &mpsc::Sender<StreamItem>, events: Vec<SseEvent>) -> bool {
    for event in events {
        if tx.send(StreamItem::Event(event)).await.is_err() {
            return false;
        }
    }
    true
}

async fn fail(tx: &mpsc::Sender<StreamItem>, error: PipelineError) {
    warn!(error = %error, "streamed request failed");
    if tx.send(StreamItem::Error(error)).await.is_err() {
        debug!("client gone before error could be delivered");
    }
}

impl Pipeline {
    /// Serve a streaming request.
    ///
    /// Errors found before the first event is produced are returned
    /// directly; later failures arrive as a final [`StreamItem::Error`].
    pub async fn handle_stream(
        self: Arc<Self>,
        req: ProxyRequest,
    ) -> Result<mpsc::Receiver<StreamItem>, PipelineError> {
        let intake = self.intake(req).await?;
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        tokio::spawn(async move { self.run_stream(intake, tx).await });
        Ok(rx)
    }

    async fn run_stream(&self, intake: Intake, tx: mpsc::Sender<StreamItem>) {
        let decoder = intake.adapter.stream_decoder(&intake.request.model);
        let (screened, decoder) = if self.surface_progress {
            let sink = StreamProgress::new(decoder, tx.clone());
            let screened = self.screen(intake, &sink).await;
            (screened, sink.into_decoder())
        } else {
            (self.screen(intake, &NoopSink).await, decoder)
        };
        let screened = match screened {
            Ok(s) => s,
            Err(e) => return fail(&tx, e).await,
        };

        let mut turn = StreamTurn::new(decoder);
        let mut calls = match self.stream_turn(&screened, &screened.body, &mut turn, &tx).await {
            TurnEnd::Finished(calls) => calls,
            TurnEnd::Disconnected => return self.abort_turn(&screened, &turn, turn.acc.usage()),
            TurnEnd::Failed(e) => return fail(&tx, e).await,
        };
        let mut usage = turn.acc.usage();
        tag_calls(&mut calls, &screened.verdict);
        let trusted = screened.verdict.context_is_trusted;

        if calls.is_empty() {
            return self.release_turn(&screened, turn, calls, usage, &tx).await;
        }
        match self
            .policies
            .evaluate_policies(&calls, &screened.agent_id, trusted)
            .await
        {
            Err(e) => return fail(&tx, e.into()).await,
            Ok(Some(refusal)) => return self.refuse_turn(&screened, turn, &refusal, usage, &tx).await,
            Ok(None) => {}
        }

        let Some((executor, batch)) = self.executable_calls(&calls, &screened.assigned) else {
            return self.release_turn(&screened, turn, calls, usage, &tx).await;
        };

        if tx.is_closed() {
            info!(agent_id = %screened.agent_id, "client disconnected, skipping tool execution");
            return self.abort_turn(&screened, &turn, usage);
        }

        // The first turn's withheld tool-call events are consumed here and
        // never reach the client.
        info!(agent_id = %screened.agent_id, calls = batch.len(), "executing assigned tools");
        let text = turn.acc.text();
        let assistant = CommonMessage::assistant_tool_calls(
            (!text.is_empty()).then(|| text.to_owned()),
            calls,
        );
        let results = executor
            .execute_tool_calls(&screened.agent_id, &batch)
            .await;
        let body = match screened.continuation_body(&assistant, &results) {
            Ok(body) => body,
            Err(e) => return fail(&tx, e).await,
        };

        if tx.is_closed() {
            info!(agent_id = %screened.agent_id, "client disconnected, skipping continuation");
            return self.abort_turn(&screened, &turn, usage);
        }
        let mut next = StreamTurn::new(turn.decoder.continuation());
        let mut calls = match self.stream_turn(&screened, &body, &mut next, &tx).await {
            TurnEnd::Finished(calls) => calls,
            TurnEnd::Disconnected => return self.abort_turn(&screened, &next, usage + next.acc.usage()),
            TurnEnd::Failed(e) => return fail(&tx, e).await,
        };
        usage += next.acc.usage();

        let trusted = trusted && batch.iter().all(|(tool, _)| tool.trusted);
        let verdict = if trusted {
            TrustVerdict::trusted()
        } else {
            TrustVerdict::untrusted()
        };
        tag_calls(&mut calls, &verdict);
        match self
            .policies
            .evaluate_policies(&calls, &screened.agent_id, trusted)
            .await
        {
            Err(e) => fail(&tx, e.into()).await,
            Ok(Some(refusal)) => self.refuse_turn(&screened, next, &refusal, usage, &tx).await,
            Ok(None) => self.release_turn(&screened, next, calls, usage, &tx).await,
        }
    }

    /// Pump one upstream stream through `turn`.
    async fn stream_turn(
        &self,
        screened: &Screened,
        body: &serde_json::Map<String, Value>,
        turn: &mut StreamTurn,
        tx: &mpsc::Sender<StreamItem>,
    ) -> TurnEnd {
        if tx.is_closed() {
            return TurnEnd::Disconnected;
        }
        let mut events = match self.upstream.stream(screened.call_with(body)).await {
            Ok(events) => events,
            Err(e) => return TurnEnd::Failed(e.into()),
        };

        loop {
            // Withheld events never touch the channel; watch it directly.
            let next = tokio::select! {
                next = events.next_event() => next,
                () = tx.closed() => {
                    info!(agent_id = %screened.agent_id, "client disconnected, dropping upstream stream");
                    return TurnEnd::Disconnected;
                }
            };
            let Some(next) = next else { break };
            let event = match next {
                Ok(event) => event,
                Err(e) => return TurnEnd::Failed(e.into()),
            };
            let decoded = match turn.decoder.decode(event) {
                Ok(decoded) => decoded,
                Err(e) => return TurnEnd::Failed(UpstreamError::from(e).into()),
            };
            if let Some(out) = turn.acc.push(decoded)
                && tx.send(StreamItem::Event(out)).await.is_err()
            {
                info!(agent_id = %screened.agent_id, "client disconnected, dropping upstream stream");
                return TurnEnd::Disconnected;
            }
        }
        TurnEnd::Finished(turn.acc.finish_turn())
    }

    /// Flush withheld events and record the turn.
    async fn release_turn(
        &self,
        screened: &Screened,
        mut turn: StreamTurn,
        calls: Vec<ToolCall>,
        usage: UsageTokens,
        tx: &mpsc::Sender<StreamItem>,
    ) {
        let status = if send_all(tx, turn.acc.release()).await {
            InteractionStatus::Completed
        } else {
            InteractionStatus::Aborted
        };
        self.audit
            .dispatch(screened.record(status, turn.message(calls), usage));
    }

    /// Discard withheld events and deliver the refusal as assistant text.
    async fn refuse_turn(
        &self,
        screened: &Screened,
        mut turn: StreamTurn,
        refusal: &Refusal,
        usage: UsageTokens,
        tx: &mpsc::Sender<StreamItem>,
    ) {
        info!(agent_id = %screened.agent_id, reason = %refusal.internal_reason, "refusing streamed tool calls");
        turn.acc.refuse();
        let events = turn.decoder.refusal_events(&refusal.user_message);
        let status = if send_all(tx, events).await {
            InteractionStatus::Refused
        } else {
            InteractionStatus::Aborted
        };
        let response = to_record(CommonMessage::assistant(refusal.user_message.clone()));
        self.audit.dispatch(screened.record(status, response, usage));
    }

    fn abort_turn(&self, screened: &Screened, turn: &StreamTurn, usage: UsageTokens) {
        self.audit.dispatch(screened.record(
            InteractionStatus::Aborted,
            turn.message(Vec::new()),
            usage,
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::super::fakes::*;
    use super::*;
    use serde_json::json;
    use tollgate_llm::{Credentials, RouteInfo};
    use tollgate_types::ProviderKind;

    fn stream_request(messages: Value) -> ProxyRequest {
        ProxyRequest {
            kind: ProviderKind::OpenAi,
            agent_id: None,
            client_name: "curl".into(),
            route: RouteInfo::default(),
            body: json!({"model": "gpt-4o", "stream": true, "messages": messages}),
            credentials: Credentials::with_api_key("sk-client"),
        }
    }

    fn ask() -> Value {
        json!([{"role": "user", "content": "email bob"}])
    }

    async fn drain(mut rx: mpsc::Receiver<StreamItem>) -> Vec<StreamItem> {
        let mut items = Vec::new();
        while let Some(item) = rx.recv().await {
            items.push(item);
        }
        items
    }

    fn events(items: &[StreamItem]) -> Vec<&SseEvent> {
        items
            .iter()
            .filter_map(|i| match i {
                StreamItem::Event(e) => Some(e),
                StreamItem::Error(_) => None,
            })
            .collect()
    }

    fn delta_text(items: &[StreamItem]) -> String {
        events(items)
            .iter()
            .filter_map(|e| e.json())
            .filter_map(|v| v["choices"][0]["delta"]["content"].as_str().map(String::from))
            .collect()
    }

    #[tokio::test]
    async fn text_forwarded_in_order_and_recorded() {
        let upstream = FakeUpstream::new(vec![Reply::Events(openai_text_chunks(&["Hel", "lo"]))]);
        let h = harness(upstream, false);

        let rx = h.pipeline.clone().handle_stream(stream_request(ask())).await.unwrap();
        let items = drain(rx).await;
        assert_eq!(delta_text(&items), "Hello");
        assert!(events(&items).last().unwrap().is_done());

        let records = h.settle().await;
        assert_eq!(records[0].status, InteractionStatus::Completed);
        assert_eq!(records[0].response["content"], "Hello");
        assert_eq!(records[0].usage, UsageTokens { input: 7, output: 3 });
    }

    #[tokio::test]
    async fn allowed_tool_call_events_released_after_text() {
        let upstream = FakeUpstream::new(vec![Reply::Events(openai_tool_chunks(
            "send_email",
            ("{\"to\":\"x@external", ".com\"}"),
        ))]);
        let h = harness(upstream, false);

        let rx = h.pipeline.clone().handle_stream(stream_request(ask())).await.unwrap();
        let items = drain(rx).await;
        let sent = events(&items);
        assert_eq!(sent.len(), 5);
        assert_eq!(sent[0].json().unwrap()["choices"][0]["delta"]["content"], "Sending now. ");
        assert_eq!(sent[1].json().unwrap()["choices"][0]["delta"]["tool_calls"][0]["id"], "call_9");
        assert!(sent[4].is_done());

        let records = h.settle().await;
        assert_eq!(records[0].response["toolCalls"][0]["arguments"], "{\"to\":\"x@external.com\"}");
        assert_eq!(records[0].response["toolCalls"][0]["trustTag"], "trusted");
    }

    #[tokio::test]
    async fn refused_stream_never_shows_tool_calls() {
        let upstream = FakeUpstream::new(vec![
            Reply::Json(openai_text(r#"{"verdict":"unsafe","summary":"instructions"}"#)),
            Reply::Events(openai_tool_chunks("send_email", ("{\"to\":\"x@exter", "nal.com\"}"))),
        ]);
        let h = harness(upstream, false);

        let rx = h
            .pipeline
            .clone()
            .handle_stream(stream_request(fetched_page_conversation()))
            .await
            .unwrap();
        let items = drain(rx).await;
        assert!(events(&items).iter().all(|e| !e.data.contains("tool_calls")));
        let text = delta_text(&items);
        assert!(text.starts_with("Sending now. <tollgate-tool-name>send_email</tollgate-tool-name>"));
        assert!(events(&items).last().unwrap().is_done());

        let records = h.settle().await;
        assert_eq!(records[0].status, InteractionStatus::Refused);
    }

    #[tokio::test]
    async fn executed_calls_continue_in_same_stream() {
        let upstream = FakeUpstream::new(vec![
            Reply::Events(openai_tool_chunks("send_email", ("{\"to\":\"bob@inter", "nal.com\"}"))),
            Reply::Events(openai_text_chunks(&["Done."])),
        ]);
        let h = harness(upstream.clone(), true);

        let rx = h.pipeline.clone().handle_stream(stream_request(ask())).await.unwrap();
        let items = drain(rx).await;
        assert_eq!(delta_text(&items), "Sending now. Done.");
        let sent = events(&items);
        assert_eq!(sent.iter().filter(|e| e.is_done()).count(), 1);
        assert!(sent.iter().all(|e| !e.data.contains("tool_calls")));

        assert_eq!(
            h.executor.calls(),
            vec![("send_email".to_owned(), "{\"to\":\"bob@internal.com\"}".to_owned())]
        );
        let continuation = &upstream.bodies()[1]["messages"];
        assert_eq!(continuation[1]["content"], "Sending now. ");
        assert_eq!(continuation[2]["tool_call_id"], "call_9");

        let records = h.settle().await;
        assert_eq!(records[0].status, InteractionStatus::Completed);
        assert_eq!(records[0].response["content"], "Done.");
        assert_eq!(records[0].usage, UsageTokens { input: 7, output: 3 });
    }

    #[tokio::test]
    async fn upstream_failure_is_single_error_item() {
        let upstream = FakeUpstream::new(vec![Reply::Status(401)]);
        let h = harness(upstream, false);
        let rx = h.pipeline.clone().handle_stream(stream_request(ask())).await.unwrap();
        let items = drain(rx).await;
        assert_eq!(items.len(), 1);
        match &items[0] {
            StreamItem::Error(e) => assert_eq!(e.status_code(), 401),
            StreamItem::Event(e) => panic!("unexpected event {e:?}"),
        }
        assert!(h.settle().await.is_empty());
    }

    #[tokio::test]
    async fn unknown_agent_fails_before_streaming() {
        let h = harness(FakeUpstream::new(vec![]), false);
        let mut req = stream_request(ask());
        req.agent_id = Some("ghost".into());
        let err = h.pipeline.clone().handle_stream(req).await.unwrap_err();
        assert_eq!(err.status_code(), 404);
    }

    #[tokio::test]
    async fn client_disconnect_recorded_as_aborted() {
        let upstream = FakeUpstream::new(vec![Reply::Events(openai_text_chunks(&["a", "b"]))]);
        let h = harness(upstream, false);
        let rx = h.pipeline.clone().handle_stream(stream_request(ask())).await.unwrap();
        drop(rx);

        let records = h.settle().await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, InteractionStatus::Aborted);
    }

    #[tokio::test]
    async fn disconnect_during_tool_only_turn_executes_nothing() {
        let mut chunks = openai_tool_chunks("send_email", ("{\"to\":\"bob@inter", "nal.com\"}"));
        chunks.remove(0);
        let upstream = FakeUpstream::new(vec![
            Reply::Events(chunks),
            Reply::Events(openai_text_chunks(&["Done."])),
        ]);
        let h = harness(upstream.clone(), true);

        let rx = h.pipeline.clone().handle_stream(stream_request(ask())).await.unwrap();
        drop(rx);

        let records = h.settle().await;
        assert!(h.executor.calls().is_empty());
        // The continuation stream is never opened.
        assert!(upstream.bodies().len() <= 1);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, InteractionStatus::Aborted);
    }

    #[tokio::test]
    async fn classification_progress_surfaced_first() {
        let upstream = FakeUpstream::new(vec![
            Reply::Json(openai_text(r#"{"verdict":"safe","summary":"a page"}"#)),
            Reply::Events(openai_text_chunks(&["ok"])),
        ]);
        let h = progress_harness(upstream);
        let rx = h
            .pipeline
            .clone()
            .handle_stream(stream_request(fetched_page_conversation()))
            .await
            .unwrap();
        let items = drain(rx).await;
        assert_eq!(delta_text(&items), "Checking output of fetch_url...\nok");
    }
}
