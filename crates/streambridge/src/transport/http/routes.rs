//! HTTP route handlers.
//!
//! There is a single fallback route. Every incoming request becomes a
//! `CapturedRequest` with an absolute URL and is dispatched through the local
//! protocol layer:
//! - origin-form targets (`/path?q`) are resolved against the local origin
//! - absolute-form targets (proxy requests) keep their URL, so the
//!   interceptor's external policy applies to them
//!
//! Request bodies are buffered up to a fixed limit; larger ones get 413.

use std::sync::Arc;

use axum::{
    Router,
    extract::{Request, State},
    http::{StatusCode, Uri},
    response::{IntoResponse, Response},
};

use http_body_util::LengthLimitError;

use crate::config::LocalOrigin;
use crate::headers::HeaderList;
use crate::layer::LocalProtocolLayer;
use crate::request::CapturedRequest;

#[derive(Clone)]
struct AppState {
    layer: Arc<LocalProtocolLayer>,
    origin: LocalOrigin,
    max_body_bytes: usize,
}

pub fn routes(
    layer: Arc<LocalProtocolLayer>,
    origin: LocalOrigin,
    max_body_bytes: usize,
) -> Router {
    Router::new()
        .fallback(capture_request)
        .with_state(AppState {
            layer,
            origin,
            max_body_bytes,
        })
}

fn absolute_url(uri: &Uri, origin: &LocalOrigin) -> String {
    if uri.scheme().is_some() && uri.authority().is_some() {
        return uri.to_string();
    }
    let path_and_query = uri.path_and_query().map(|p| p.as_str()).unwrap_or("/");
    origin.join(path_and_query)
}

async fn capture_request(State(state): State<AppState>, request: Request) -> Response {
    let (parts, body) = request.into_parts();

    let body = match axum::body::to_bytes(body, state.max_body_bytes).await {
        Ok(body) => body,
        Err(e) if std::error::Error::source(&e).is_some_and(|s| s.is::<LengthLimitError>()) => {
            tracing::warn!(limit = state.max_body_bytes, uri = %parts.uri, "Request body too large");
            return (
                StatusCode::PAYLOAD_TOO_LARGE,
                format!("request body exceeds {} bytes", state.max_body_bytes),
            )
                .into_response();
        }
        Err(e) => {
            tracing::warn!(error = %e, "Failed to read request body");
            return (StatusCode::BAD_REQUEST, format!("failed to read request body: {e}"))
                .into_response();
        }
    };

    let mut captured = CapturedRequest::new(
        parts.method.as_str(),
        absolute_url(&parts.uri, &state.origin),
    );
    captured.headers = HeaderList::from(&parts.headers);
    if !body.is_empty() {
        captured.body = Some(body);
    }

    tracing::trace!(method = %captured.method, url = %captured.url, "Captured request");
    state.layer.dispatch(captured).await.into_response()
}
