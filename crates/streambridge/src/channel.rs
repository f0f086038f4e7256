//! Placeholder duplex channel.
//!
//! Streaming handlers expect every request to be attached to a connection.
//! Intercepted requests have none, so one shared `SyntheticChannel` stands in
//! for it. It never carries bytes: reads hit end-of-stream immediately and
//! writes are swallowed until the channel is released, after which they fail
//! with `BrokenPipe`.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use uuid::Uuid;

#[derive(Debug)]
pub struct SyntheticChannel {
    id: Uuid,
    opened_at: Instant,
    released: CancellationToken,
}

impl SyntheticChannel {
    pub fn open() -> Arc<Self> {
        let channel = Arc::new(Self {
            id: Uuid::new_v4(),
            opened_at: Instant::now(),
            released: CancellationToken::new(),
        });
        tracing::debug!(channel_id = %channel.id, "Synthetic channel opened");
        channel
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn age(&self) -> Duration {
        self.opened_at.elapsed()
    }

    pub fn is_released(&self) -> bool {
        self.released.is_cancelled()
    }

    /// Release the channel. Safe to call more than once.
    pub fn release(&self) {
        if !self.released.is_cancelled() {
            self.released.cancel();
            tracing::debug!(
                channel_id = %self.id,
                age_ms = self.age().as_millis() as u64,
                "Synthetic channel released"
            );
        }
    }

    /// Resolves once the channel has been released.
    pub fn released(&self) -> WaitForCancellationFuture<'_> {
        self.released.cancelled()
    }

    fn broken_pipe(&self) -> io::Error {
        io::Error::new(
            io::ErrorKind::BrokenPipe,
            format!("synthetic channel {} released", self.id),
        )
    }
}

impl AsyncRead for &SyntheticChannel {
    fn poll_read(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        _buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        // Leaving `buf` untouched signals EOF.
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for &SyntheticChannel {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if self.is_released() {
            return Poll::Ready(Err(self.broken_pipe()));
        }
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}
