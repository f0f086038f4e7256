use std::convert::Infallible;

use async_trait::async_trait;
use axum::Router;
use axum::body::Body;
use axum::http::Request;
use http_body_util::BodyExt;
use tower::ServiceExt;

use super::{HandlerError, StreamingHandler};
use crate::headers::HeaderList;
use crate::request::{AdaptedRequest, ParsedUrl};
use crate::response::{ResponseSink, SinkError};

/// Serves adapted requests with an `axum::Router`.
///
/// Response frames are copied into the sink as they arrive; a full sink
/// pauses the router body until the consumer catches up.
#[derive(Clone)]
pub struct RouterHandler {
    router: Router,
}

impl RouterHandler {
    pub fn new(router: Router) -> Self {
        Self { router }
    }
}

#[async_trait]
impl StreamingHandler for RouterHandler {
    async fn handle(
        &self,
        req: AdaptedRequest,
        mut res: ResponseSink,
        _url: ParsedUrl,
    ) -> Result<(), HandlerError> {
        let (method, url, headers, body) = req.into_parts();

        let mut request = Request::builder()
            .method(method)
            .uri(url.as_str())
            .body(Body::from_stream(body.into_try_stream()))
            .map_err(|e| HandlerError::Failed(format!("cannot build request for '{url}': {e}")))?;
        *request.headers_mut() = headers.to_header_map();

        let response = self
            .router
            .clone()
            .oneshot(request)
            .await
            .unwrap_or_else(|never: Infallible| match never {});

        let (parts, mut body) = response.into_parts();
        res.write_head(parts.status.as_u16(), HeaderList::from(&parts.headers).iter());

        while let Some(frame) = body.frame().await {
            let frame = frame.map_err(|e| HandlerError::Failed(format!("response body: {e}")))?;
            let Ok(data) = frame.into_data() else {
                // Trailers have nowhere to go.
                continue;
            };
            match res.write(data) {
                Ok(true) => {}
                Ok(false) => res.drained().await,
                Err(SinkError::ConsumerClosed) => {
                    tracing::debug!(url = %url, "Consumer went away, dropping rest of body");
                    break;
                }
                Err(e) => return Err(HandlerError::Failed(e.to_string())),
            }
        }

        res.end(None)
            .map_err(|e| HandlerError::Failed(e.to_string()))
    }
}
