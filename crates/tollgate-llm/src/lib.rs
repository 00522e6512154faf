//! Provider protocols for tollgate.
//!
//! This crate speaks the three upstream protocols the proxy fronts
//! (OpenAI chat completions, Anthropic messages, Gemini generate-content)
//! and translates them to and from the Common Message Model defined in
//! `tollgate-types`.
//!
//! # Architecture
//!
//! - [`ProtocolAdapter`] converts request and response bodies, one
//!   implementation per provider, selected with [`adapter_for`]
//! - [`SseParser`] frames upstream SSE bytes into [`SseEvent`]s
//! - [`StreamDecoder`] classifies each event of one stream;
//!   [`StreamAccumulator`] forwards text and withholds tool calls until the
//!   turn is complete
//! - [`Upstream`] sends the rewritten body to the provider;
//!   [`HttpUpstream`] is the reqwest implementation
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use tollgate_llm::{adapter_for, RouteInfo};
//! use tollgate_types::ProviderKind;
//!
//! let adapter = adapter_for(ProviderKind::Anthropic);
//! let request = adapter.parse_request(body, &RouteInfo::default())?;
//! let messages = adapter.to_common(adapter.request_messages(&request.body)?)?;
//! ```

pub mod adapter;
pub mod error;
pub mod sse;
pub mod stream;
pub mod upstream;

pub use adapter::{ProtocolAdapter, ProviderRequest, RequestTools, RouteInfo, adapter_for};
pub use error::{ProtocolError, UpstreamError};
pub use sse::{SseEvent, SseParser};
pub use stream::{
    DecodedEvent, Disposition, StreamAccumulator, StreamDecoder, StreamState, ToolCallFragment,
};
pub use upstream::{Credentials, EventStream, HttpUpstream, Upstream, UpstreamCall};
