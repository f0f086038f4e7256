//! The wrapped streaming handler.
//!
//! The handler is opaque to the adapter: it gets a prepared request, a
//! response sink and the parsed URL, and eventually writes a head and a body
//! to the sink. `RouterHandler` mounts an `axum::Router` behind that
//! interface.

mod router;

use async_trait::async_trait;

use crate::request::{AdaptedRequest, ParsedUrl};
use crate::response::ResponseSink;

pub use router::RouterHandler;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandlerError {
    #[error("handler failed to prepare: {0}")]
    Prepare(String),

    #[error("handler failed: {0}")]
    Failed(String),

    #[error("handler dropped the response before writing headers")]
    NoResponse,

    #[error("handler dropped the response before ending it")]
    Incomplete,

    #[error("handler panicked")]
    Panicked,
}

#[async_trait]
pub trait StreamingHandler: Send + Sync + 'static {
    /// One-time readiness step. Runs before the first request; concurrent
    /// first callers share a single run.
    async fn prepare(&self) -> Result<(), HandlerError> {
        Ok(())
    }

    /// Serve one request by writing to `res`. Returning before `res.end()`
    /// is fine as long as `res` is moved somewhere that finishes it.
    async fn handle(
        &self,
        req: AdaptedRequest,
        res: ResponseSink,
        url: ParsedUrl,
    ) -> Result<(), HandlerError>;
}
