//! Transport layer for streambridge.
//!
//! Currently provides an HTTP front via axum that plays the capture layer
//! over a real socket.

pub mod http;

pub use http::{routes, serve, serve_with_shutdown};
