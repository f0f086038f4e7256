//! Responses returned to the capture layer.
//!
//! - **capture**: sink/capture pair bridging handler writes to a body stream
//! - `ProtocolResponse`: status, headers, legacy MIME type and body stream
//! - `ResponseBody`: captured, fixed or upstream byte stream

mod capture;

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use bytes::{Bytes, BytesMut};
use futures::stream::BoxStream;
use futures::{Stream, StreamExt};

use crate::error::AdapterError;
use crate::handler::HandlerError;
use crate::headers::HeaderList;

pub use capture::{
    CaptureAbortHandle, CapturePhase, DEFAULT_HIGH_WATER_MARK, ResponseCapture, ResponseSink,
    SinkError, capture,
};

use capture::CaptureState;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BodyError {
    #[error(transparent)]
    Handler(#[from] HandlerError),

    #[error("upstream body failed: {0}")]
    Upstream(String),
}

/// Status and headers, fixed at the headers-ready point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHead {
    pub status: u16,
    pub headers: HeaderList,
}

impl ResponseHead {
    pub fn mime_type(&self) -> Option<&str> {
        self.headers.get("content-type")
    }
}

struct CapturedBody {
    state: Arc<CaptureState>,
}

impl Drop for CapturedBody {
    fn drop(&mut self) {
        self.state.close_consumer();
    }
}

enum BodyInner {
    Captured(CapturedBody),
    Full(Option<Bytes>),
    Remote(BoxStream<'static, Result<Bytes, BodyError>>),
}

/// Lazily produced response body.
pub struct ResponseBody {
    inner: BodyInner,
}

impl ResponseBody {
    pub(crate) fn captured(state: Arc<CaptureState>) -> Self {
        Self {
            inner: BodyInner::Captured(CapturedBody { state }),
        }
    }

    pub fn full(bytes: impl Into<Bytes>) -> Self {
        let bytes = bytes.into();
        Self {
            inner: BodyInner::Full((!bytes.is_empty()).then_some(bytes)),
        }
    }

    pub fn empty() -> Self {
        Self {
            inner: BodyInner::Full(None),
        }
    }

    pub fn from_stream<S>(stream: S) -> Self
    where
        S: Stream<Item = Result<Bytes, BodyError>> + Send + 'static,
    {
        Self {
            inner: BodyInner::Remote(stream.boxed()),
        }
    }

    /// Read the whole body. Stops at the first error.
    pub async fn bytes(mut self) -> Result<Bytes, BodyError> {
        let mut buf = BytesMut::new();
        while let Some(chunk) = self.next().await {
            buf.extend_from_slice(&chunk?);
        }
        Ok(buf.freeze())
    }
}

impl Stream for ResponseBody {
    type Item = Result<Bytes, BodyError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match &mut self.inner {
            BodyInner::Captured(body) => body.state.poll_chunk(cx),
            BodyInner::Full(bytes) => Poll::Ready(bytes.take().map(Ok)),
            BodyInner::Remote(stream) => stream.poll_next_unpin(cx),
        }
    }
}

impl std::fmt::Debug for ResponseBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match &self.inner {
            BodyInner::Captured(_) => "captured",
            BodyInner::Full(_) => "full",
            BodyInner::Remote(_) => "remote",
        };
        f.debug_tuple("ResponseBody").field(&kind).finish()
    }
}

/// Response handed back to the capture layer.
#[derive(Debug)]
pub struct ProtocolResponse {
    pub status_code: u16,
    pub headers: HeaderList,
    /// `Content-Type`, for capture layers that take it separately.
    pub mime_type: Option<String>,
    pub body: ResponseBody,
}

impl ProtocolResponse {
    pub fn from_head(head: ResponseHead, body: ResponseBody) -> Self {
        let mime_type = head.mime_type().map(str::to_string);
        Self {
            status_code: head.status,
            headers: head.headers,
            mime_type,
            body,
        }
    }

    /// Plain-text response built by the adapter itself.
    pub fn synthetic(status: StatusCode, message: impl Into<String>) -> Self {
        let mut headers = HeaderList::new();
        headers.append("content-type", "text/plain; charset=utf-8");
        Self {
            status_code: status.as_u16(),
            headers,
            mime_type: Some("text/plain; charset=utf-8".to_string()),
            body: ResponseBody::full(message.into()),
        }
    }

    pub fn from_error(error: &AdapterError) -> Self {
        Self::synthetic(error.status_code(), error.to_string())
    }
}

impl IntoResponse for ProtocolResponse {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.status_code).unwrap_or_else(|_| {
            tracing::warn!(status = self.status_code, "Handler produced an invalid status");
            StatusCode::INTERNAL_SERVER_ERROR
        });
        let headers = self.headers.to_header_map();
        let body = axum::body::Body::from_stream(self.body);

        let mut response = Response::new(body);
        *response.status_mut() = status;
        *response.headers_mut() = headers;
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn synthetic_response_is_plain_text() {
        let response = ProtocolResponse::synthetic(StatusCode::BAD_GATEWAY, "nope");
        assert_eq!(response.status_code, 502);
        assert_eq!(
            response.mime_type.as_deref(),
            Some("text/plain; charset=utf-8")
        );
        assert_eq!(response.body.bytes().await.unwrap(), "nope");
    }

    #[tokio::test]
    async fn from_error_maps_status() {
        let response = ProtocolResponse::from_error(&AdapterError::Stopped);
        assert_eq!(response.status_code, 503);
        assert_eq!(response.body.bytes().await.unwrap(), "interceptor stopped");
    }

    #[tokio::test]
    async fn full_body_yields_once() {
        let mut body = ResponseBody::full("x");
        assert_eq!(body.next().await.unwrap().unwrap(), "x");
        assert!(body.next().await.is_none());

        let mut empty = ResponseBody::full(Bytes::new());
        assert!(empty.next().await.is_none());
    }

    #[tokio::test]
    async fn stream_body_stops_at_first_error() {
        let body = ResponseBody::from_stream(futures::stream::iter(vec![
            Ok(Bytes::from_static(b"a")),
            Err(BodyError::Upstream("reset".to_string())),
            Ok(Bytes::from_static(b"b")),
        ]));
        assert_eq!(
            body.bytes().await.unwrap_err(),
            BodyError::Upstream("reset".to_string())
        );
    }

    #[tokio::test]
    async fn into_response_carries_status_and_headers() {
        let mut headers = HeaderList::new();
        headers.append("Set-Cookie", "a=1");
        headers.append("Set-Cookie", "b=2");
        let response = ProtocolResponse {
            status_code: 201,
            headers,
            mime_type: None,
            body: ResponseBody::full("made"),
        }
        .into_response();

        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(response.headers().get_all("set-cookie").iter().count(), 2);
    }
}
