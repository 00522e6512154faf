//! Error bodies and SSE response bodies.

use std::convert::Infallible;

use axum::Json;
use axum::body::Body;
use axum::http::StatusCode;
use axum::http::header::{CACHE_CONTROL, CONTENT_TYPE};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

use tollgate_core::{PipelineError, StreamItem};
use tollgate_llm::SseEvent;

/// `{"error": {"message", "type"}}` with the error's status code.
pub fn error_response(err: &PipelineError) -> Response {
    let status =
        StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    if status.is_server_error() {
        warn!(status = status.as_u16(), error = %err, "request failed");
    } else {
        debug!(status = status.as_u16(), error = %err, "request rejected");
    }
    (status, Json(err.to_body())).into_response()
}

fn encode(item: StreamItem) -> Bytes {
    match item {
        StreamItem::Event(event) => Bytes::from(event.encode()),
        StreamItem::Error(err) => {
            warn!(error = %err, "stream failed after headers were sent");
            Bytes::from(SseEvent::named("error", err.to_body().to_string()).encode())
        }
    }
}

/// Stream pipeline output as `text/event-stream`.
///
/// Waits for the first item: a failure before any event is produced is
/// still answered with an HTTP error status. Later failures arrive as an
/// `error` event. Dropping the body (client disconnect) closes the
/// channel, which stops the pipeline.
pub async fn sse_response(mut rx: mpsc::Receiver<StreamItem>) -> Response {
    let first = match rx.recv().await {
        Some(StreamItem::Error(err)) => return error_response(&err),
        first => first,
    };

    let body = futures_util::stream::iter(first)
        .chain(ReceiverStream::new(rx))
        .map(|item| Ok::<_, Infallible>(encode(item)));

    (
        StatusCode::OK,
        [
            (CONTENT_TYPE, "text/event-stream"),
            (CACHE_CONTROL, "no-cache"),
        ],
        Body::from_stream(body),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tollgate_llm::{ProtocolError, UpstreamError};

    async fn body_text(resp: Response) -> String {
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn error_body_shape() {
        let resp = error_response(&PipelineError::from(ProtocolError::missing("messages")));
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let body: serde_json::Value = serde_json::from_str(&body_text(resp).await).unwrap();
        assert_eq!(body["error"]["type"], "invalid_request_error");
    }

    #[tokio::test]
    async fn first_item_error_is_http_error() {
        let (tx, rx) = mpsc::channel(4);
        tx.send(StreamItem::Error(PipelineError::from(UpstreamError::Status {
            status: 401,
            body: r#"{"error":{"message":"bad key"}}"#.into(),
        })))
        .await
        .unwrap();
        drop(tx);

        let resp = sse_response(rx).await;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        assert!(body_text(resp).await.contains("bad key"));
    }

    #[tokio::test]
    async fn events_then_late_error() {
        let (tx, rx) = mpsc::channel(4);
        tx.send(StreamItem::Event(SseEvent::data(r#"{"n":1}"#))).await.unwrap();
        tx.send(StreamItem::Error(PipelineError::from(UpstreamError::Timeout)))
            .await
            .unwrap();
        drop(tx);

        let resp = sse_response(rx).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers().get(CONTENT_TYPE).unwrap(),
            "text/event-stream"
        );
        let text = body_text(resp).await;
        assert!(text.starts_with("data: {\"n\":1}\n\n"));
        assert!(text.contains("event: error\ndata: {\"error\""));
    }

    #[tokio::test]
    async fn empty_stream_is_empty_body() {
        let (tx, rx) = mpsc::channel::<StreamItem>(1);
        drop(tx);
        let resp = sse_response(rx).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(body_text(resp).await.is_empty());
    }
}
