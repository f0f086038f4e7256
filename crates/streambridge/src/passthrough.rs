//! Forwards captured requests for non-local origins to the real network.

use std::time::Duration;

use async_trait::async_trait;
use axum::http::Method;
use futures::TryStreamExt;

use crate::error::AdapterError;
use crate::headers::HeaderList;
use crate::layer::CaptureHook;
use crate::request::CapturedRequest;
use crate::response::{BodyError, ProtocolResponse, ResponseBody};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Connection-level headers the client sets itself.
const SKIPPED_HEADERS: [&str; 4] = ["host", "connection", "content-length", "transfer-encoding"];

pub struct PassThrough {
    client: reqwest::Client,
}

impl PassThrough {
    pub fn new() -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            // Redirects are the caller's business.
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(Self { client })
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    /// Send `request` as-is and stream the upstream response back.
    pub async fn forward(&self, request: &CapturedRequest) -> Result<ProtocolResponse, AdapterError> {
        let url = request.parse_url()?;
        let method = Method::from_bytes(request.method.as_bytes()).map_err(|e| {
            AdapterError::RequestTranslation(format!("invalid method '{}': {e}", request.method))
        })?;

        let headers: HeaderList = request
            .headers
            .iter()
            .filter(|(name, _)| {
                !SKIPPED_HEADERS
                    .iter()
                    .any(|skipped| name.eq_ignore_ascii_case(skipped))
            })
            .collect();

        let mut builder = self
            .client
            .request(method, url.clone())
            .headers(headers.to_header_map());
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }

        tracing::debug!(url = %url, "Forwarding external request");
        let response = builder
            .send()
            .await
            .map_err(|e| AdapterError::Upstream(e.to_string()))?;

        let status_code = response.status().as_u16();
        let headers = HeaderList::from(response.headers());
        let mime_type = headers.get("content-type").map(str::to_string);
        let body = response
            .bytes_stream()
            .map_err(|e| BodyError::Upstream(e.to_string()));

        Ok(ProtocolResponse {
            status_code,
            headers,
            mime_type,
            body: ResponseBody::from_stream(body),
        })
    }
}

#[async_trait]
impl CaptureHook for PassThrough {
    async fn capture(&self, request: CapturedRequest) -> ProtocolResponse {
        self.forward(&request).await.unwrap_or_else(|e| {
            tracing::warn!(url = %request.url, error = %e, "Pass-through failed");
            ProtocolResponse::from_error(&e)
        })
    }
}
