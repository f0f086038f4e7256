//! HTTP front: axum server feeding the local protocol layer.

mod routes;
mod server;

pub use routes::routes;
pub use server::{serve, serve_with_shutdown};
