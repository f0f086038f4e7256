//! streambridge: serve a streaming HTTP handler behind a request-capturing
//! protocol layer.
//!
//! The capture layer hands over whole, immutable requests and wants one
//! response back per request. The handler wants an incrementally readable
//! request and writes its response piece by piece. [`ProtocolAdapter`]
//! translates between the two and keeps a browser-style cookie store in sync
//! with the handler's `Set-Cookie` headers. [`Interceptor`] owns the hook
//! registration on a [`ProtocolLayer`].

mod channel;
mod error;
mod headers;
mod signal;

pub mod adapter;
pub mod config;
pub mod cookies;
pub mod handler;
pub mod interceptor;
pub mod layer;
pub mod passthrough;
pub mod request;
pub mod response;
pub mod transport;

pub use adapter::ProtocolAdapter;
pub use channel::SyntheticChannel;
pub use config::{AdapterConfig, ConfigError, ExternalPolicy, LocalOrigin, ServerConfig};
pub use cookies::{CookieJar, CookieRecord, CookieStore, CookieStoreError, CookieSyncError};
pub use error::AdapterError;
pub use handler::{HandlerError, RouterHandler, StreamingHandler};
pub use headers::HeaderList;
pub use interceptor::{Interceptor, InterceptorState};
pub use layer::{CaptureHook, LayerError, LocalProtocolLayer, ProtocolLayer};
pub use passthrough::PassThrough;
pub use request::{AdaptedRequest, CapturedRequest, ParsedUrl, RequestBody, translate};
pub use response::{
    BodyError, ProtocolResponse, ResponseBody, ResponseCapture, ResponseHead, ResponseSink,
    SinkError,
};
pub use signal::termination_signal;
