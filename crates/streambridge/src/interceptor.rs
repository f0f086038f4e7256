//! Interceptor lifecycle.
//!
//! `Unregistered → Armed → Active → Unregistered`
//!
//! - **arm**: register the local scheme as privileged with the layer
//! - **start**: arm if needed, open the synthetic channel, install the hook
//! - **stop**: stop accepting, remove the hook, release the channel, drop
//!   the scheme registration
//!
//! The installed hook routes by origin: the local origin goes through the
//! adapter, anything else is rejected or passed through.

use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::adapter::ProtocolAdapter;
use crate::channel::SyntheticChannel;
use crate::config::{AdapterConfig, ConfigError, ExternalPolicy, LocalOrigin};
use crate::error::AdapterError;
use crate::layer::{CaptureHook, LayerError, ProtocolLayer};
use crate::passthrough::PassThrough;
use crate::request::CapturedRequest;
use crate::response::ProtocolResponse;
use crate::signal::termination_signal;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterceptorState {
    Unregistered,
    Armed,
    Active,
}

struct Lifecycle {
    state: InterceptorState,
    channel: Option<Arc<SyntheticChannel>>,
    accepting: Option<CancellationToken>,
}

pub struct Interceptor {
    layer: Arc<dyn ProtocolLayer>,
    adapter: Arc<ProtocolAdapter>,
    origin: LocalOrigin,
    external: ExternalPolicy,
    forwarder: Option<Arc<PassThrough>>,
    lifecycle: Mutex<Lifecycle>,
}

impl Interceptor {
    /// Interceptor for `origin` that rejects every other origin.
    pub fn new(
        layer: Arc<dyn ProtocolLayer>,
        adapter: Arc<ProtocolAdapter>,
        origin: LocalOrigin,
    ) -> Self {
        Self {
            layer,
            adapter,
            origin,
            external: ExternalPolicy::Reject,
            forwarder: None,
            lifecycle: Mutex::new(Lifecycle {
                state: InterceptorState::Unregistered,
                channel: None,
                accepting: None,
            }),
        }
    }

    pub fn from_config(
        layer: Arc<dyn ProtocolLayer>,
        adapter: Arc<ProtocolAdapter>,
        config: &AdapterConfig,
    ) -> Result<Self, ConfigError> {
        let origin = config.validate()?;
        let interceptor = Self::new(layer, adapter, origin);
        Ok(match config.external {
            ExternalPolicy::Reject => interceptor,
            ExternalPolicy::PassThrough => {
                let forwarder = PassThrough::new().map_err(|e| ConfigError::Client(e.to_string()))?;
                interceptor.with_pass_through(Arc::new(forwarder))
            }
        })
    }

    /// Forward non-local origins through `forwarder` instead of rejecting.
    pub fn with_pass_through(mut self, forwarder: Arc<PassThrough>) -> Self {
        self.external = ExternalPolicy::PassThrough;
        self.forwarder = Some(forwarder);
        self
    }

    pub fn origin(&self) -> &LocalOrigin {
        &self.origin
    }

    pub fn state(&self) -> InterceptorState {
        self.lock().state
    }

    fn lock(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn scheme(&self) -> &str {
        self.origin.scheme()
    }

    fn register(&self, lifecycle: &mut Lifecycle) -> Result<(), AdapterError> {
        self.layer
            .register_privileged(self.scheme())
            .map_err(|e| match e {
                LayerError::AlreadyRegistered(scheme) => AdapterError::DoubleRegistration(scheme),
                other => AdapterError::Layer(other),
            })?;
        lifecycle.state = InterceptorState::Armed;
        tracing::debug!(scheme = self.scheme(), "Interceptor armed");
        Ok(())
    }

    /// Register the local scheme as privileged.
    pub fn arm(&self) -> Result<(), AdapterError> {
        let mut lifecycle = self.lock();
        if lifecycle.state != InterceptorState::Unregistered {
            return Err(AdapterError::DoubleRegistration(self.scheme().to_string()));
        }
        self.register(&mut lifecycle)
    }

    /// Install the capture hook, arming first if needed.
    pub fn start(&self) -> Result<(), AdapterError> {
        let mut lifecycle = self.lock();
        match lifecycle.state {
            InterceptorState::Active => {
                return Err(AdapterError::DoubleRegistration(self.scheme().to_string()));
            }
            InterceptorState::Unregistered => self.register(&mut lifecycle)?,
            InterceptorState::Armed => {}
        }

        let channel = SyntheticChannel::open();
        let accepting = CancellationToken::new();
        let hook = Arc::new(InterceptHook {
            adapter: Arc::clone(&self.adapter),
            origin: self.origin.clone(),
            external: self.external,
            forwarder: self.forwarder.clone(),
            channel: Arc::clone(&channel),
            accepting: accepting.clone(),
        });

        if let Err(e) = self.layer.intercept(self.scheme(), hook) {
            channel.release();
            return Err(match e {
                LayerError::AlreadyIntercepted(scheme) => AdapterError::DoubleRegistration(scheme),
                other => AdapterError::Layer(other),
            });
        }

        lifecycle.channel = Some(channel);
        lifecycle.accepting = Some(accepting);
        lifecycle.state = InterceptorState::Active;
        tracing::info!(origin = %self.origin, external = ?self.external, "Interceptor started");
        Ok(())
    }

    /// Tear down in order. Calls after the first are no-ops.
    pub fn stop(&self) {
        let mut lifecycle = self.lock();
        if lifecycle.state == InterceptorState::Unregistered {
            return;
        }

        if let Some(accepting) = lifecycle.accepting.take() {
            accepting.cancel();
        }
        if !self.layer.unintercept(self.scheme()) && lifecycle.state == InterceptorState::Active {
            tracing::warn!(scheme = self.scheme(), "Capture hook was already removed");
        }
        if let Some(channel) = lifecycle.channel.take() {
            channel.release();
        }
        self.layer.unregister(self.scheme());

        lifecycle.state = InterceptorState::Unregistered;
        tracing::info!(origin = %self.origin, "Interceptor stopped");
    }

    /// Run [`stop`](Self::stop) on SIGINT/SIGTERM.
    pub fn spawn_signal_teardown(self: &Arc<Self>) -> JoinHandle<()> {
        let interceptor = Arc::clone(self);
        tokio::spawn(async move {
            termination_signal().await;
            interceptor.stop();
        })
    }
}

impl Drop for Interceptor {
    fn drop(&mut self) {
        self.stop();
    }
}

struct InterceptHook {
    adapter: Arc<ProtocolAdapter>,
    origin: LocalOrigin,
    external: ExternalPolicy,
    forwarder: Option<Arc<PassThrough>>,
    channel: Arc<SyntheticChannel>,
    accepting: CancellationToken,
}

#[async_trait]
impl CaptureHook for InterceptHook {
    async fn capture(&self, request: CapturedRequest) -> ProtocolResponse {
        if self.accepting.is_cancelled() {
            tracing::debug!(url = %request.url, "Request captured after stop");
            return ProtocolResponse::from_error(&AdapterError::Stopped);
        }

        let url = match request.parse_url() {
            Ok(url) => url,
            Err(e) => return ProtocolResponse::from_error(&e),
        };

        if self.origin.matches(&url) {
            return self.adapter.handle(&request, Arc::clone(&self.channel)).await;
        }

        match (self.external, &self.forwarder) {
            (ExternalPolicy::PassThrough, Some(forwarder)) => forwarder.capture(request).await,
            _ => {
                tracing::debug!(url = %url, "Rejecting external request");
                ProtocolResponse::from_error(&AdapterError::ExternalNotSupported)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cookies::{CookieJar, CookieRecord, CookieStore, CookieStoreError};
    use crate::handler::{HandlerError, StreamingHandler};
    use crate::layer::LocalProtocolLayer;
    use crate::request::{AdaptedRequest, ParsedUrl};
    use crate::response::ResponseSink;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use url::Url;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct Hello;

    #[async_trait]
    impl StreamingHandler for Hello {
        async fn handle(
            &self,
            _req: AdaptedRequest,
            mut res: ResponseSink,
            url: ParsedUrl,
        ) -> Result<(), HandlerError> {
            res.write_head(200, [("content-type", "text/plain")]);
            res.end(Some(format!("hello {}", url.pathname).into()))
                .map_err(|e| HandlerError::Failed(e.to_string()))
        }
    }

    /// Writes the head and a first chunk, then holds the body until released.
    struct Gated {
        release: Mutex<Option<tokio::sync::oneshot::Receiver<()>>>,
    }

    #[async_trait]
    impl StreamingHandler for Gated {
        async fn handle(
            &self,
            _req: AdaptedRequest,
            mut res: ResponseSink,
            _url: ParsedUrl,
        ) -> Result<(), HandlerError> {
            let release = self.release.lock().unwrap().take();
            res.write_head(200, [("content-type", "text/plain")]);
            res.write("before ")
                .map_err(|e| HandlerError::Failed(e.to_string()))?;
            if let Some(release) = release {
                let _ = release.await;
            }
            res.end(Some("after".into()))
                .map_err(|e| HandlerError::Failed(e.to_string()))
        }
    }

    /// Counts cookie lookups, i.e. requests that reached translation.
    #[derive(Default)]
    struct CountingStore {
        lookups: AtomicUsize,
        inner: CookieJar,
    }

    #[async_trait]
    impl CookieStore for CountingStore {
        async fn get(&self, url: &Url) -> Result<Vec<CookieRecord>, CookieStoreError> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            self.inner.get(url).await
        }
        async fn set(&self, url: &Url, cookie: CookieRecord) -> Result<(), CookieStoreError> {
            self.inner.set(url, cookie).await
        }
        async fn remove(&self, url: &Url, name: &str) -> Result<(), CookieStoreError> {
            self.inner.remove(url, name).await
        }
    }

    /// Layer that remembers the last installed hook, so tests can call a
    /// hook that is no longer installed.
    #[derive(Default)]
    struct RecordingLayer {
        inner: LocalProtocolLayer,
        last_hook: Mutex<Option<Arc<dyn CaptureHook>>>,
    }

    impl ProtocolLayer for RecordingLayer {
        fn register_privileged(&self, scheme: &str) -> Result<(), LayerError> {
            self.inner.register_privileged(scheme)
        }
        fn is_registered(&self, scheme: &str) -> bool {
            self.inner.is_registered(scheme)
        }
        fn intercept(&self, scheme: &str, hook: Arc<dyn CaptureHook>) -> Result<(), LayerError> {
            *self.last_hook.lock().unwrap() = Some(Arc::clone(&hook));
            self.inner.intercept(scheme, hook)
        }
        fn unintercept(&self, scheme: &str) -> bool {
            self.inner.unintercept(scheme)
        }
        fn unregister(&self, scheme: &str) -> bool {
            self.inner.unregister(scheme)
        }
    }

    fn local_origin() -> LocalOrigin {
        LocalOrigin::parse("http://localhost:3000").unwrap()
    }

    fn adapter(store: Arc<dyn CookieStore>) -> Arc<ProtocolAdapter> {
        Arc::new(ProtocolAdapter::new(Arc::new(Hello), store))
    }

    #[tokio::test]
    async fn local_origin_goes_through_adapter() {
        let layer = Arc::new(LocalProtocolLayer::new());
        let interceptor = Interceptor::new(
            layer.clone(),
            adapter(Arc::new(CookieJar::new())),
            local_origin(),
        );
        interceptor.start().unwrap();
        assert_eq!(interceptor.state(), InterceptorState::Active);

        let response = layer
            .dispatch(CapturedRequest::new("GET", "http://localhost:3000/page"))
            .await;
        assert_eq!(response.status_code, 200);
        assert_eq!(response.body.bytes().await.unwrap(), "hello /page");
    }

    #[tokio::test]
    async fn external_origin_is_rejected() {
        let layer = Arc::new(LocalProtocolLayer::new());
        let interceptor = Interceptor::new(
            layer.clone(),
            adapter(Arc::new(CookieJar::new())),
            local_origin(),
        );
        interceptor.start().unwrap();

        for url in ["http://example.com/", "http://localhost:4000/"] {
            let response = layer.dispatch(CapturedRequest::new("GET", url)).await;
            assert_eq!(response.status_code, 502);
            assert_eq!(
                response.body.bytes().await.unwrap(),
                "External HTTP not supported"
            );
        }
    }

    #[tokio::test]
    async fn external_origin_passes_through() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/remote"))
            .respond_with(ResponseTemplate::new(200).set_body_string("from upstream"))
            .expect(1)
            .mount(&server)
            .await;

        let layer = Arc::new(LocalProtocolLayer::new());
        let interceptor = Interceptor::new(
            layer.clone(),
            adapter(Arc::new(CookieJar::new())),
            local_origin(),
        )
        .with_pass_through(Arc::new(PassThrough::new().unwrap()));
        interceptor.start().unwrap();

        let response = layer
            .dispatch(CapturedRequest::new("GET", format!("{}/remote", server.uri())))
            .await;
        assert_eq!(response.status_code, 200);
        assert_eq!(response.body.bytes().await.unwrap(), "from upstream");
    }

    #[test]
    fn arm_twice_keeps_first_registration() {
        let layer = Arc::new(LocalProtocolLayer::new());
        let interceptor = Interceptor::new(
            layer.clone(),
            adapter(Arc::new(CookieJar::new())),
            local_origin(),
        );

        interceptor.arm().unwrap();
        let err = interceptor.arm().unwrap_err();
        assert!(matches!(err, AdapterError::DoubleRegistration(ref s) if s == "http"));
        assert_eq!(interceptor.state(), InterceptorState::Armed);
        assert!(layer.is_registered("http"));
    }

    #[test]
    fn second_interceptor_cannot_take_scheme() {
        let layer = Arc::new(LocalProtocolLayer::new());
        let first = Interceptor::new(
            layer.clone(),
            adapter(Arc::new(CookieJar::new())),
            local_origin(),
        );
        let second = Interceptor::new(
            layer.clone(),
            adapter(Arc::new(CookieJar::new())),
            local_origin(),
        );

        first.start().unwrap();
        assert!(matches!(
            second.start(),
            Err(AdapterError::DoubleRegistration(_))
        ));
        assert_eq!(second.state(), InterceptorState::Unregistered);
        assert_eq!(first.state(), InterceptorState::Active);
        assert!(layer.is_intercepted("http"));
    }

    #[test]
    fn start_twice_fails_and_stop_is_idempotent() {
        let layer = Arc::new(LocalProtocolLayer::new());
        let interceptor = Interceptor::new(
            layer.clone(),
            adapter(Arc::new(CookieJar::new())),
            local_origin(),
        );

        interceptor.start().unwrap();
        assert!(matches!(
            interceptor.start(),
            Err(AdapterError::DoubleRegistration(_))
        ));

        interceptor.stop();
        interceptor.stop();
        assert_eq!(interceptor.state(), InterceptorState::Unregistered);
        assert!(!layer.is_registered("http"));

        interceptor.start().unwrap();
        assert_eq!(interceptor.state(), InterceptorState::Active);
    }

    #[test]
    fn start_after_lost_registration_reports_layer_error() {
        let layer = Arc::new(LocalProtocolLayer::new());
        let interceptor = Interceptor::new(
            layer.clone(),
            adapter(Arc::new(CookieJar::new())),
            local_origin(),
        );

        interceptor.arm().unwrap();
        assert!(layer.unregister("http"));

        let err = interceptor.start().unwrap_err();
        assert!(matches!(
            err,
            AdapterError::Layer(LayerError::NotRegistered(ref s)) if s == "http"
        ));
        assert_eq!(err.to_string(), "scheme 'http' is not registered");
        assert_eq!(interceptor.state(), InterceptorState::Armed);
        assert!(!layer.is_intercepted("http"));
    }

    #[tokio::test]
    async fn stopped_interceptor_never_translates() {
        let store = Arc::new(CountingStore::default());
        let layer = Arc::new(RecordingLayer::default());
        let interceptor = Interceptor::new(layer.clone(), adapter(store.clone()), local_origin());
        interceptor.start().unwrap();

        let request = CapturedRequest::new("GET", "http://localhost:3000/");
        let hook = layer.last_hook.lock().unwrap().clone().unwrap();
        assert_eq!(hook.capture(request.clone()).await.status_code, 200);
        assert_eq!(store.lookups.load(Ordering::SeqCst), 1);

        interceptor.stop();

        // Through the layer: no hook anymore.
        let response = layer.inner.dispatch(request.clone()).await;
        assert_eq!(response.status_code, 502);
        // Through a stale reference to the old hook.
        let response = hook.capture(request).await;
        assert_eq!(response.status_code, 503);

        assert_eq!(store.lookups.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn in_flight_response_drains_after_stop() {
        let (release_tx, release_rx) = tokio::sync::oneshot::channel();
        let handler = Gated {
            release: Mutex::new(Some(release_rx)),
        };
        let adapter = Arc::new(ProtocolAdapter::new(
            Arc::new(handler),
            Arc::new(CookieJar::new()),
        ));
        let layer = Arc::new(LocalProtocolLayer::new());
        let interceptor = Interceptor::new(layer.clone(), adapter, local_origin());
        interceptor.start().unwrap();

        let response = layer
            .dispatch(CapturedRequest::new("GET", "http://localhost:3000/slow"))
            .await;
        assert_eq!(response.status_code, 200);

        interceptor.stop();
        assert_eq!(interceptor.state(), InterceptorState::Unregistered);
        release_tx.send(()).unwrap();

        assert_eq!(response.body.bytes().await.unwrap(), "before after");
    }

    #[tokio::test]
    async fn signal_teardown_waits_for_a_signal() {
        let layer = Arc::new(LocalProtocolLayer::new());
        let interceptor = Arc::new(Interceptor::new(
            layer,
            adapter(Arc::new(CookieJar::new())),
            local_origin(),
        ));
        interceptor.start().unwrap();

        let teardown = interceptor.spawn_signal_teardown();
        tokio::task::yield_now().await;
        assert!(!teardown.is_finished());
        assert_eq!(interceptor.state(), InterceptorState::Active);
        teardown.abort();
    }

    #[test]
    fn from_config_validates_origin() {
        let layer = Arc::new(LocalProtocolLayer::new());
        let config = AdapterConfig {
            local_origin: "localhost".to_string(),
            ..Default::default()
        };
        let result = Interceptor::from_config(layer, adapter(Arc::new(CookieJar::new())), &config);
        assert!(matches!(result, Err(ConfigError::InvalidOrigin { .. })));
    }
}
