//! ProtocolAdapter: one captured request in, one protocol response out.
//!
//! Per call:
//! - **prepare**: the handler's one-time readiness step, shared by all callers
//! - **translate**: captured request → adapted request with store cookies
//! - **capture**: handler runs on its own task against a fresh sink
//! - **sync**: once headers are ready, outgoing cookies go to the store
//!
//! The adapter never fails a call outright. Errors become synthetic
//! responses with the status from [`AdapterError::status_code`].

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use chrono::Utc;
use futures::FutureExt;
use tokio::sync::OnceCell;
use tracing::Instrument;
use uuid::Uuid;

use crate::channel::SyntheticChannel;
use crate::config::AdapterConfig;
use crate::cookies::{CookieStore, sync_cookies};
use crate::error::AdapterError;
use crate::handler::{HandlerError, StreamingHandler};
use crate::request::{CapturedRequest, translate};
use crate::response::{DEFAULT_HIGH_WATER_MARK, ProtocolResponse, capture};

pub struct ProtocolAdapter {
    handler: Arc<dyn StreamingHandler>,
    cookies: Arc<dyn CookieStore>,
    prepared: OnceCell<()>,
    high_water_mark: usize,
    debug: bool,
}

impl ProtocolAdapter {
    pub fn new(handler: Arc<dyn StreamingHandler>, cookies: Arc<dyn CookieStore>) -> Self {
        Self {
            handler,
            cookies,
            prepared: OnceCell::new(),
            high_water_mark: DEFAULT_HIGH_WATER_MARK,
            debug: false,
        }
    }

    pub fn with_config(mut self, config: &AdapterConfig) -> Self {
        self.high_water_mark = config.high_water_mark.max(1);
        self.debug = config.debug;
        self
    }

    pub fn cookies(&self) -> &Arc<dyn CookieStore> {
        &self.cookies
    }

    pub fn is_prepared(&self) -> bool {
        self.prepared.initialized()
    }

    /// Run the handler's `prepare` once. Concurrent callers wait on the same
    /// run; a failed run leaves the cell empty for the next caller.
    pub async fn ensure_prepared(&self) -> Result<(), HandlerError> {
        self.prepared
            .get_or_try_init(|| async {
                tracing::debug!("Preparing handler");
                self.handler.prepare().await
            })
            .await
            .map(|_| ())
    }

    /// Serve `captured` through the handler. Always yields a response.
    pub async fn handle(
        &self,
        captured: &CapturedRequest,
        channel: Arc<SyntheticChannel>,
    ) -> ProtocolResponse {
        let request_id = Uuid::new_v4();
        let span = tracing::info_span!(
            "adapt",
            %request_id,
            method = %captured.method,
            url = %captured.url
        );

        async {
            match self.try_handle(captured, channel).await {
                Ok(response) => response,
                Err(e) => {
                    tracing::error!(error = %e, status = e.status_code().as_u16(), "Adapted call failed");
                    ProtocolResponse::from_error(&e)
                }
            }
        }
        .instrument(span)
        .await
    }

    pub async fn try_handle(
        &self,
        captured: &CapturedRequest,
        channel: Arc<SyntheticChannel>,
    ) -> Result<ProtocolResponse, AdapterError> {
        self.ensure_prepared().await?;

        let (request, parsed) = translate(captured, self.cookies.as_ref(), channel).await?;
        let url = captured.parse_url()?;

        let (sink, capture) = capture(self.high_water_mark);
        let abort = capture.abort_handle();
        abort.supervise();

        let handler = Arc::clone(&self.handler);
        tokio::spawn(
            async move {
                let outcome = AssertUnwindSafe(handler.handle(request, sink, parsed))
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|_| {
                        tracing::error!("Handler panicked");
                        Err(HandlerError::Panicked)
                    });
                if let Err(e) = &outcome {
                    tracing::warn!(error = %e, "Handler returned an error");
                }
                abort.settle(outcome);
            }
            .in_current_span(),
        );

        let (head, body) = capture.headers_ready().await?;

        let set_cookies: Vec<&str> = head.headers.get_all("set-cookie").collect();
        if !set_cookies.is_empty() {
            match sync_cookies(self.cookies.as_ref(), &url, set_cookies, Utc::now()).await {
                Ok(report) => {
                    tracing::debug!(
                        upserted = report.upserted.len(),
                        removed = report.removed.len(),
                        "Cookies synced"
                    );
                }
                Err(e) => tracing::warn!(error = %e, "Cookie sync incomplete"),
            }
        }

        if self.debug {
            tracing::info!(
                url = %url,
                status = head.status,
                mime_type = head.mime_type().unwrap_or("-"),
                "Adapted response"
            );
        }

        Ok(ProtocolResponse::from_head(head, body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cookies::{CookieJar, CookieRecord, CookieStoreError};
    use crate::request::{AdaptedRequest, ParsedUrl};
    use crate::response::ResponseSink;
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use url::Url;

    /// Echoes the request line and cookie header; sets cookies from `?set=`.
    #[derive(Default)]
    struct EchoHandler {
        prepares: AtomicUsize,
        fail_prepares: AtomicUsize,
    }

    #[async_trait]
    impl StreamingHandler for EchoHandler {
        async fn prepare(&self) -> Result<(), HandlerError> {
            self.prepares.fetch_add(1, Ordering::SeqCst);
            if self.fail_prepares.load(Ordering::SeqCst) > 0 {
                self.fail_prepares.fetch_sub(1, Ordering::SeqCst);
                return Err(HandlerError::Prepare("not yet".to_string()));
            }
            tokio::task::yield_now().await;
            Ok(())
        }

        async fn handle(
            &self,
            req: AdaptedRequest,
            mut res: ResponseSink,
            url: ParsedUrl,
        ) -> Result<(), HandlerError> {
            match url.pathname.as_str() {
                "/fail" => return Err(HandlerError::Failed("boom".to_string())),
                "/panic" => panic!("handler blew up"),
                "/late-fail" => {
                    res.write_head(200, [("content-type", "text/plain")]);
                    res.write("partial").map_err(|e| HandlerError::Failed(e.to_string()))?;
                    return Err(HandlerError::Failed("late".to_string()));
                }
                _ => {}
            }

            let mut headers = vec![("Content-Type".to_string(), "text/plain".to_string())];
            if let Some(set) = url.query_value("set") {
                for cookie in set.split('|') {
                    headers.push(("Set-Cookie".to_string(), cookie.to_string()));
                }
            }
            res.write_head(200, headers);

            let line = format!(
                "{} {} cookie={}",
                req.method(),
                req.url(),
                req.headers().get("cookie").unwrap_or("")
            );
            // Finish from another task, the way a streaming server would.
            tokio::spawn(async move {
                let _ = res.write(line);
                let _ = res.end(None);
            });
            Ok(())
        }
    }

    struct BrokenStore;

    #[async_trait]
    impl CookieStore for BrokenStore {
        async fn get(&self, _url: &Url) -> Result<Vec<CookieRecord>, CookieStoreError> {
            Ok(Vec::new())
        }
        async fn set(&self, _url: &Url, cookie: CookieRecord) -> Result<(), CookieStoreError> {
            Err(CookieStoreError::Rejected {
                name: cookie.name,
                reason: "read-only".to_string(),
            })
        }
        async fn remove(&self, _url: &Url, _name: &str) -> Result<(), CookieStoreError> {
            Ok(())
        }
    }

    fn adapter(handler: Arc<EchoHandler>, jar: Arc<dyn CookieStore>) -> ProtocolAdapter {
        ProtocolAdapter::new(handler, jar)
    }

    async fn body_of(response: ProtocolResponse) -> Bytes {
        response.body.bytes().await.unwrap()
    }

    #[tokio::test]
    async fn round_trip_strips_origin() {
        let adapter = adapter(Arc::default(), Arc::new(CookieJar::new()));
        let captured = CapturedRequest::new("GET", "http://localhost:3000/page?x=1");

        let response = adapter.handle(&captured, SyntheticChannel::open()).await;
        assert_eq!(response.status_code, 200);
        assert_eq!(response.mime_type.as_deref(), Some("text/plain"));
        assert_eq!(body_of(response).await, "GET /page?x=1 cookie=");
    }

    #[tokio::test]
    async fn cookies_flow_back_into_next_request() {
        let jar = Arc::new(CookieJar::new());
        let adapter = adapter(Arc::default(), jar.clone());

        let first = CapturedRequest::new(
            "POST",
            "http://localhost:3000/test?set=iteration=1;%20Path=/;%20Max-Age=3600|gone=1;%20Max-Age=0",
        );
        let response = adapter.handle(&first, SyntheticChannel::open()).await;
        assert_eq!(response.status_code, 200);
        assert_eq!(response.headers.get_all("set-cookie").count(), 2);

        let second = CapturedRequest::new("GET", "http://localhost:3000/test");
        let response = adapter.handle(&second, SyntheticChannel::open()).await;
        assert_eq!(body_of(response).await, "GET /test cookie=iteration=1");
        assert_eq!(jar.len(), 1);
    }

    #[tokio::test]
    async fn cookie_sync_failure_still_returns_response() {
        let adapter = adapter(Arc::default(), Arc::new(BrokenStore));
        let captured = CapturedRequest::new("GET", "http://localhost:3000/?set=a=1");

        let response = adapter.handle(&captured, SyntheticChannel::open()).await;
        assert_eq!(response.status_code, 200);
        assert_eq!(body_of(response).await, "GET /?set=a=1 cookie=");
    }

    #[tokio::test]
    async fn handler_error_becomes_500() {
        let adapter = adapter(Arc::default(), Arc::new(CookieJar::new()));
        let captured = CapturedRequest::new("GET", "http://localhost:3000/fail");

        let response = adapter.handle(&captured, SyntheticChannel::open()).await;
        assert_eq!(response.status_code, 500);
        assert_eq!(body_of(response).await, "handler failed: boom");
    }

    #[tokio::test]
    async fn handler_panic_becomes_500() {
        let adapter = adapter(Arc::default(), Arc::new(CookieJar::new()));
        let captured = CapturedRequest::new("GET", "http://localhost:3000/panic");

        let response = adapter.handle(&captured, SyntheticChannel::open()).await;
        assert_eq!(response.status_code, 500);
        assert_eq!(body_of(response).await, "handler panicked");
    }

    #[tokio::test]
    async fn failure_after_head_ends_body_with_error() {
        let adapter = adapter(Arc::default(), Arc::new(CookieJar::new()));
        let captured = CapturedRequest::new("GET", "http://localhost:3000/late-fail");

        let response = adapter.handle(&captured, SyntheticChannel::open()).await;
        assert_eq!(response.status_code, 200);
        let err = response.body.bytes().await.unwrap_err();
        assert_eq!(
            err,
            crate::response::BodyError::Handler(HandlerError::Failed("late".to_string()))
        );
    }

    #[tokio::test]
    async fn prepare_runs_once_for_concurrent_callers() {
        let handler = Arc::new(EchoHandler::default());
        let adapter = Arc::new(adapter(handler.clone(), Arc::new(CookieJar::new())));

        let calls = (0..8).map(|_| {
            let adapter = Arc::clone(&adapter);
            tokio::spawn(async move {
                let captured = CapturedRequest::new("GET", "http://localhost:3000/");
                adapter.handle(&captured, SyntheticChannel::open()).await.status_code
            })
        });
        for status in futures::future::join_all(calls).await {
            assert_eq!(status.unwrap(), 200);
        }
        assert_eq!(handler.prepares.load(Ordering::SeqCst), 1);
        assert!(adapter.is_prepared());
    }

    #[tokio::test]
    async fn failed_prepare_is_retried() {
        let handler = Arc::new(EchoHandler::default());
        handler.fail_prepares.store(1, Ordering::SeqCst);
        let adapter = adapter(handler.clone(), Arc::new(CookieJar::new()));
        let captured = CapturedRequest::new("GET", "http://localhost:3000/");

        let first = adapter.handle(&captured, SyntheticChannel::open()).await;
        assert_eq!(first.status_code, 500);
        assert!(!adapter.is_prepared());

        let second = adapter.handle(&captured, SyntheticChannel::open()).await;
        assert_eq!(second.status_code, 200);
        assert_eq!(handler.prepares.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn malformed_request_never_reaches_handler() {
        let adapter = adapter(Arc::default(), Arc::new(CookieJar::new()));
        let captured = CapturedRequest::new("GET", "::not a url::");

        let response = adapter.handle(&captured, SyntheticChannel::open()).await;
        assert_eq!(response.status_code, 500);
        assert!(
            String::from_utf8_lossy(&body_of(response).await)
                .starts_with("malformed captured request")
        );
    }
}
