//! Capture layer boundary.
//!
//! A capture layer keeps a registry of schemes. A scheme must be registered
//! as privileged before a hook can intercept it; intercepted requests go to
//! the hook, which answers each one with a single [`ProtocolResponse`].
//!
//! [`LocalProtocolLayer`] is the in-process implementation. The HTTP front
//! and the tests drive it through [`LocalProtocolLayer::dispatch`].

use std::sync::Arc;

use async_trait::async_trait;
use axum::http::StatusCode;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use crate::request::CapturedRequest;
use crate::response::ProtocolResponse;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LayerError {
    #[error("scheme '{0}' is already registered")]
    AlreadyRegistered(String),

    #[error("scheme '{0}' is not registered")]
    NotRegistered(String),

    #[error("scheme '{0}' is already intercepted")]
    AlreadyIntercepted(String),
}

/// Receives every request captured for an intercepted scheme.
#[async_trait]
pub trait CaptureHook: Send + Sync + 'static {
    async fn capture(&self, request: CapturedRequest) -> ProtocolResponse;
}

/// Scheme registry of a capture layer.
pub trait ProtocolLayer: Send + Sync + 'static {
    fn register_privileged(&self, scheme: &str) -> Result<(), LayerError>;

    fn is_registered(&self, scheme: &str) -> bool;

    fn intercept(&self, scheme: &str, hook: Arc<dyn CaptureHook>) -> Result<(), LayerError>;

    /// Remove the hook for `scheme`. Returns whether one was installed.
    fn unintercept(&self, scheme: &str) -> bool;

    /// Drop the registration for `scheme`, hook included. Returns whether the
    /// scheme was registered.
    fn unregister(&self, scheme: &str) -> bool;
}

#[derive(Default)]
struct SchemeEntry {
    hook: Option<Arc<dyn CaptureHook>>,
}

/// In-process capture layer.
#[derive(Default)]
pub struct LocalProtocolLayer {
    schemes: DashMap<String, SchemeEntry>,
    /// Answers requests for schemes nobody intercepts.
    fallback: Option<Arc<dyn CaptureHook>>,
}

impl LocalProtocolLayer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_fallback(mut self, fallback: Arc<dyn CaptureHook>) -> Self {
        self.fallback = Some(fallback);
        self
    }

    pub fn is_intercepted(&self, scheme: &str) -> bool {
        self.schemes
            .get(&scheme.to_ascii_lowercase())
            .is_some_and(|entry| entry.hook.is_some())
    }

    /// Deliver `request` to the hook for its URL scheme.
    pub async fn dispatch(&self, request: CapturedRequest) -> ProtocolResponse {
        let scheme = match request.parse_url() {
            Ok(url) => url.scheme().to_string(),
            Err(e) => {
                tracing::debug!(url = %request.url, error = %e, "Cannot dispatch request");
                return ProtocolResponse::synthetic(StatusCode::BAD_REQUEST, e.to_string());
            }
        };

        // Clone the hook out so the map shard is not held across the await.
        let hook = self
            .schemes
            .get(&scheme)
            .and_then(|entry| entry.hook.clone())
            .or_else(|| self.fallback.clone());

        match hook {
            Some(hook) => hook.capture(request).await,
            None => {
                tracing::debug!(%scheme, url = %request.url, "No capture hook for scheme");
                ProtocolResponse::synthetic(
                    StatusCode::BAD_GATEWAY,
                    format!("no capture hook for scheme '{scheme}'"),
                )
            }
        }
    }
}

impl ProtocolLayer for LocalProtocolLayer {
    fn register_privileged(&self, scheme: &str) -> Result<(), LayerError> {
        match self.schemes.entry(scheme.to_ascii_lowercase()) {
            Entry::Occupied(_) => Err(LayerError::AlreadyRegistered(scheme.to_string())),
            Entry::Vacant(vacant) => {
                vacant.insert(SchemeEntry::default());
                tracing::debug!(%scheme, "Scheme registered as privileged");
                Ok(())
            }
        }
    }

    fn is_registered(&self, scheme: &str) -> bool {
        self.schemes.contains_key(&scheme.to_ascii_lowercase())
    }

    fn intercept(&self, scheme: &str, hook: Arc<dyn CaptureHook>) -> Result<(), LayerError> {
        let mut entry = self
            .schemes
            .get_mut(&scheme.to_ascii_lowercase())
            .ok_or_else(|| LayerError::NotRegistered(scheme.to_string()))?;
        if entry.hook.is_some() {
            return Err(LayerError::AlreadyIntercepted(scheme.to_string()));
        }
        entry.hook = Some(hook);
        tracing::debug!(%scheme, "Capture hook installed");
        Ok(())
    }

    fn unintercept(&self, scheme: &str) -> bool {
        self.schemes
            .get_mut(&scheme.to_ascii_lowercase())
            .and_then(|mut entry| entry.hook.take())
            .is_some()
    }

    fn unregister(&self, scheme: &str) -> bool {
        self.schemes.remove(&scheme.to_ascii_lowercase()).is_some()
    }
}
