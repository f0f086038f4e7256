//! HTTP server implementation.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::info;

use crate::config::ServerConfig;
use crate::interceptor::Interceptor;
use crate::layer::LocalProtocolLayer;
use crate::signal::termination_signal;

use super::routes::routes;

/// Start the HTTP front and run until SIGINT/SIGTERM. The interceptor is
/// stopped once the server has drained.
pub async fn serve(
    config: ServerConfig,
    layer: Arc<LocalProtocolLayer>,
    interceptor: Arc<Interceptor>,
) -> anyhow::Result<()> {
    let addr: SocketAddr = config.addr().parse()?;
    let listener = TcpListener::bind(addr).await?;

    serve_with_shutdown(
        listener,
        layer,
        interceptor,
        config.max_body_bytes,
        termination_signal(),
    )
    .await
}

/// Like [`serve`], on an already bound listener and with a caller-supplied
/// shutdown future.
pub async fn serve_with_shutdown<F>(
    listener: TcpListener,
    layer: Arc<LocalProtocolLayer>,
    interceptor: Arc<Interceptor>,
    max_body_bytes: usize,
    shutdown: F,
) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let app = routes(layer, interceptor.origin().clone(), max_body_bytes);
    let actual_addr = listener.local_addr()?;

    info!(origin = %interceptor.origin(), "Starting streambridge on {}", actual_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;

    info!("Server shutdown complete");

    interceptor.stop();

    Ok(())
}
