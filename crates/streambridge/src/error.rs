//! Adapter-level error taxonomy.
//!
//! Every failure that can end an adapted call maps to a status code, because
//! the capture layer has no error channel: the adapter always answers with a
//! response, synthesizing one from the error when it has to.

use axum::http::StatusCode;

use crate::cookies::{CookieStoreError, CookieSyncError};
use crate::handler::HandlerError;
use crate::layer::LayerError;

#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    #[error("malformed captured request: {0}")]
    RequestTranslation(String),

    #[error("cookie lookup failed for {url}: {source}")]
    CookieLookup {
        url: String,
        #[source]
        source: CookieStoreError,
    },

    #[error(transparent)]
    CookieSync(#[from] CookieSyncError),

    #[error("scheme '{0}' is already registered")]
    DoubleRegistration(String),

    #[error(transparent)]
    Layer(#[from] LayerError),

    #[error(transparent)]
    Handler(#[from] HandlerError),

    #[error("External HTTP not supported")]
    ExternalNotSupported,

    #[error("interceptor stopped")]
    Stopped,

    #[error("upstream request failed: {0}")]
    Upstream(String),
}

impl AdapterError {
    /// Status of the synthetic response that stands in for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::ExternalNotSupported | Self::Upstream(_) => StatusCode::BAD_GATEWAY,
            Self::Stopped => StatusCode::SERVICE_UNAVAILABLE,
            Self::RequestTranslation(_)
            | Self::CookieLookup { .. }
            | Self::CookieSync(_)
            | Self::DoubleRegistration(_)
            | Self::Layer(_)
            | Self::Handler(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}
