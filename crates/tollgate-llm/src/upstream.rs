//! Upstream provider client.
//!
//! [`Upstream`] is the seam between the pipeline and the network: the
//! pipeline hands it a provider-shaped body and gets back a provider-shaped
//! response or an [`EventStream`]. [`HttpUpstream`] is the reqwest-backed
//! implementation; tests substitute their own.
//!
//! There is no retry here. A failed upstream call propagates to the caller.

use std::collections::VecDeque;
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use serde_json::{Map, Value};
use tollgate_types::config::ProvidersConfig;
use tollgate_types::{ProviderKind, SecretString};
use tracing::{debug, trace, warn};

use crate::error::{ProtocolError, UpstreamError};
use crate::sse::{SseEvent, SseParser};

/// Anthropic API version header value.
pub const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Provider credential for one request.
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    /// API key, sent in the provider's auth header.
    pub api_key: Option<SecretString>,
    /// Extra headers forwarded from the client (e.g. `anthropic-beta`).
    pub headers: Vec<(String, String)>,
}

impl Credentials {
    /// Credentials carrying only an API key.
    pub fn with_api_key(key: impl Into<String>) -> Self {
        Self {
            api_key: Some(SecretString::new(key)),
            headers: Vec::new(),
        }
    }
}

/// One upstream call.
#[derive(Debug, Clone, Copy)]
pub struct UpstreamCall<'a> {
    /// Protocol of `body`.
    pub kind: ProviderKind,
    /// Target model; part of the URL for Gemini.
    pub model: &'a str,
    /// Provider-shaped request body.
    pub body: &'a Map<String, Value>,
    /// Credential to authenticate with.
    pub credentials: &'a Credentials,
}

/// A provider endpoint that answers completion requests.
#[async_trait]
pub trait Upstream: Send + Sync {
    /// Buffered call; returns the provider's JSON response.
    async fn complete(&self, call: UpstreamCall<'_>) -> Result<Value, UpstreamError>;

    /// Streaming call; returns the provider's SSE events.
    async fn stream(&self, call: UpstreamCall<'_>) -> Result<EventStream, UpstreamError>;
}

type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, UpstreamError>> + Send>>;

/// SSE events read from an upstream response body.
///
/// Dropping the stream drops the underlying response, which closes the
/// upstream connection.
pub struct EventStream {
    bytes: ByteStream,
    parser: SseParser,
    pending: VecDeque<SseEvent>,
    finished: bool,
}

impl EventStream {
    /// Wrap a raw byte stream.
    pub fn new<S>(bytes: S) -> Self
    where
        S: Stream<Item = Result<Bytes, UpstreamError>> + Send + 'static,
    {
        Self {
            bytes: Box::pin(bytes),
            parser: SseParser::new(),
            pending: VecDeque::new(),
            finished: false,
        }
    }

    /// A stream that replays pre-encoded events.
    pub fn from_events(events: Vec<SseEvent>) -> Self {
        let chunks: Vec<Result<Bytes, UpstreamError>> = events
            .into_iter()
            .map(|e| Ok(Bytes::from(e.encode())))
            .collect();
        Self::new(futures_util::stream::iter(chunks))
    }

    /// The next event, or `None` at end of stream.
    pub async fn next_event(&mut self) -> Option<Result<SseEvent, UpstreamError>> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Some(Ok(event));
            }
            if self.finished {
                return None;
            }
            match self.bytes.next().await {
                Some(Ok(chunk)) => self.pending.extend(self.parser.push(&chunk)),
                Some(Err(e)) => {
                    self.finished = true;
                    return Some(Err(e));
                }
                None => {
                    self.finished = true;
                    self.pending.extend(self.parser.finish());
                }
            }
        }
    }
}

impl std::fmt::Debug for EventStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventStream")
            .field("pending", &self.pending.len())
            .field("finished", &self.finished)
            .finish()
    }
}

#[derive(Debug, Clone)]
struct Endpoint {
    base_url: String,
    headers: Vec<(String, String)>,
    timeout: Duration,
}

impl Endpoint {
    fn from_settings(config: &ProvidersConfig, kind: ProviderKind) -> Self {
        let settings = config.get(kind);
        Self {
            base_url: settings.base_url_for(kind),
            headers: settings
                .headers
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            timeout: Duration::from_secs(settings.timeout_secs),
        }
    }
}

/// reqwest-backed [`Upstream`].
#[derive(Debug, Clone)]
pub struct HttpUpstream {
    http: reqwest::Client,
    openai: Endpoint,
    anthropic: Endpoint,
    gemini: Endpoint,
}

impl HttpUpstream {
    /// Build a client for the configured provider endpoints.
    pub fn new(config: &ProvidersConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            openai: Endpoint::from_settings(config, ProviderKind::OpenAi),
            anthropic: Endpoint::from_settings(config, ProviderKind::Anthropic),
            gemini: Endpoint::from_settings(config, ProviderKind::Gemini),
        }
    }

    fn endpoint(&self, kind: ProviderKind) -> &Endpoint {
        match kind {
            ProviderKind::OpenAi => &self.openai,
            ProviderKind::Anthropic => &self.anthropic,
            ProviderKind::Gemini => &self.gemini,
        }
    }

    /// The request URL for a call.
    pub fn url(&self, kind: ProviderKind, model: &str, stream: bool) -> String {
        let base = &self.endpoint(kind).base_url;
        match kind {
            ProviderKind::OpenAi => format!("{base}/chat/completions"),
            ProviderKind::Anthropic => format!("{base}/v1/messages"),
            ProviderKind::Gemini if stream => {
                format!("{base}/v1beta/models/{model}:streamGenerateContent?alt=sse")
            }
            ProviderKind::Gemini => format!("{base}/v1beta/models/{model}:generateContent"),
        }
    }

    fn request(&self, call: &UpstreamCall<'_>, stream: bool) -> reqwest::RequestBuilder {
        let endpoint = self.endpoint(call.kind);
        let url = self.url(call.kind, call.model, stream);

        let mut req = self
            .http
            .post(&url)
            .timeout(endpoint.timeout)
            .header("Content-Type", "application/json");

        if stream {
            req = req.header("Accept", "text/event-stream");
        }

        if let Some(key) = call.credentials.api_key.as_ref().filter(|k| !k.is_empty()) {
            req = match call.kind {
                ProviderKind::OpenAi => req.header("Authorization", format!("Bearer {}", key.expose())),
                ProviderKind::Anthropic => req.header("x-api-key", key.expose()),
                ProviderKind::Gemini => req.header("x-goog-api-key", key.expose()),
            };
        } else {
            warn!(provider = %call.kind, "no credential available for upstream call");
        }
        if call.kind == ProviderKind::Anthropic {
            req = req.header("anthropic-version", ANTHROPIC_VERSION);
        }

        for (k, v) in endpoint.headers.iter().chain(&call.credentials.headers) {
            req = req.header(k.as_str(), v.as_str());
        }

        req.json(call.body)
    }

    async fn send(&self, call: &UpstreamCall<'_>, stream: bool) -> Result<reqwest::Response, UpstreamError> {
        let response = self.request(call, stream).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(
                provider = %call.kind,
                model = %call.model,
                status = status.as_u16(),
                "upstream returned error status"
            );
            return Err(UpstreamError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }
}

#[async_trait]
impl Upstream for HttpUpstream {
    async fn complete(&self, call: UpstreamCall<'_>) -> Result<Value, UpstreamError> {
        debug!(
            provider = %call.kind,
            model = %call.model,
            "sending upstream request"
        );
        let response = self.send(&call, false).await?;
        let text = response.text().await?;
        let value: Value = serde_json::from_str(&text)
            .map_err(|e| ProtocolError::new("$", format!("response is not JSON: {e}")))?;
        trace!(provider = %call.kind, bytes = text.len(), "upstream response received");
        Ok(value)
    }

    async fn stream(&self, call: UpstreamCall<'_>) -> Result<EventStream, UpstreamError> {
        debug!(
            provider = %call.kind,
            model = %call.model,
            "sending streaming upstream request"
        );
        let response = self.send(&call, true).await?;
        let bytes = response.bytes_stream().map(|r| r.map_err(UpstreamError::from));
        Ok(EventStream::new(bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tollgate_types::config::ProviderSettings;

    fn upstream_with_base(kind: ProviderKind, base: &str) -> HttpUpstream {
        let mut config = ProvidersConfig::default();
        let settings = ProviderSettings {
            base_url: Some(base.into()),
            ..Default::default()
        };
        match kind {
            ProviderKind::OpenAi => config.openai = settings,
            ProviderKind::Anthropic => config.anthropic = settings,
            ProviderKind::Gemini => config.gemini = settings,
        }
        HttpUpstream::new(&config)
    }

    #[test]
    fn default_urls() {
        let up = HttpUpstream::new(&ProvidersConfig::default());
        assert_eq!(
            up.url(ProviderKind::OpenAi, "gpt-4o", false),
            "https://api.openai.com/v1/chat/completions"
        );
        assert_eq!(
            up.url(ProviderKind::Anthropic, "claude", true),
            "https://api.anthropic.com/v1/messages"
        );
        assert_eq!(
            up.url(ProviderKind::Gemini, "gemini-2.0-flash", false),
            "https://generativelanguage.googleapis.com/v1beta/models/gemini-2.0-flash:generateContent"
        );
        assert_eq!(
            up.url(ProviderKind::Gemini, "gemini-2.0-flash", true),
            "https://generativelanguage.googleapis.com/v1beta/models/gemini-2.0-flash:streamGenerateContent?alt=sse"
        );
    }

    #[test]
    fn configured_base_url_trailing_slash() {
        let up = upstream_with_base(ProviderKind::OpenAi, "http://localhost:8080/v1/");
        assert_eq!(
            up.url(ProviderKind::OpenAi, "m", false),
            "http://localhost:8080/v1/chat/completions"
        );
    }

    #[tokio::test]
    async fn event_stream_splits_chunks() {
        let chunks: Vec<Result<Bytes, UpstreamError>> = vec![
            Ok(Bytes::from_static(b"data: {\"a\":")),
            Ok(Bytes::from_static(b"1}\n\ndata: [DONE]\n\n")),
        ];
        let mut stream = EventStream::new(futures_util::stream::iter(chunks));
        assert_eq!(stream.next_event().await.unwrap().unwrap().data, "{\"a\":1}");
        assert!(stream.next_event().await.unwrap().unwrap().is_done());
        assert!(stream.next_event().await.is_none());
    }

    #[tokio::test]
    async fn event_stream_flushes_unterminated_tail() {
        let chunks: Vec<Result<Bytes, UpstreamError>> = vec![Ok(Bytes::from_static(b"data: tail"))];
        let mut stream = EventStream::new(futures_util::stream::iter(chunks));
        assert_eq!(stream.next_event().await.unwrap().unwrap().data, "tail");
        assert!(stream.next_event().await.is_none());
    }

    #[tokio::test]
    async fn event_stream_surfaces_transport_error_once() {
        let chunks: Vec<Result<Bytes, UpstreamError>> = vec![
            Ok(Bytes::from_static(b"data: x\n\n")),
            Err(UpstreamError::Transport("reset".into())),
            Ok(Bytes::from_static(b"data: never\n\n")),
        ];
        let mut stream = EventStream::new(futures_util::stream::iter(chunks));
        assert!(stream.next_event().await.unwrap().is_ok());
        assert!(matches!(
            stream.next_event().await,
            Some(Err(UpstreamError::Transport(_)))
        ));
        assert!(stream.next_event().await.is_none());
    }

    #[tokio::test]
    async fn from_events_replays() {
        let mut stream = EventStream::from_events(vec![
            SseEvent::named("message_stop", "{}"),
            SseEvent::data("[DONE]"),
        ]);
        assert_eq!(
            stream.next_event().await.unwrap().unwrap().event.as_deref(),
            Some("message_stop")
        );
        assert!(stream.next_event().await.unwrap().unwrap().is_done());
        assert!(stream.next_event().await.is_none());
    }
}
