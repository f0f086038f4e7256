//! Response capture: the writable side handed to the handler and the
//! readable side handed back to the capture layer.
//!
//! State machine per response: `Pending → HeadersReady → Complete`.
//! - `Pending`: nothing written; status and headers may still be staged.
//! - `HeadersReady`: the head was resolved (explicitly via `write_head`, or
//!   implicitly by the first `write`/`end`) and body chunks flow.
//! - `Complete`: `end` was called (or the response was abandoned).
//!
//! The head is delivered through a oneshot that can fire only once. Body
//! chunks go through a queue drained by the single `ResponseBody` consumer.
//! `write` reports backpressure once the queued byte count reaches the
//! high-water mark, and `drained()` resolves when the consumer has emptied
//! the queue again.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll, Waker};

use bytes::Bytes;
use tokio::sync::{Notify, oneshot};

use super::{BodyError, ResponseHead};
use crate::handler::HandlerError;
use crate::headers::HeaderList;

/// Buffered bytes at which `ResponseSink::write` starts reporting backpressure.
pub const DEFAULT_HIGH_WATER_MARK: usize = 16 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapturePhase {
    Pending,
    HeadersReady,
    Complete,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SinkError {
    #[error("write after end")]
    WriteAfterEnd,

    #[error("response consumer closed")]
    ConsumerClosed,
}

type HeadResult = Result<ResponseHead, HandlerError>;

struct CaptureInner {
    phase: CapturePhase,
    status: u16,
    staged_headers: HeaderList,
    head_tx: Option<oneshot::Sender<HeadResult>>,
    queue: VecDeque<Bytes>,
    buffered: usize,
    bytes_written: u64,
    need_drain: bool,
    failure: Option<HandlerError>,
    consumer_waker: Option<Waker>,
    consumer_closed: bool,
    /// While set, an abandoned sink parks its error in `orphaned` until the
    /// supervisor settles the handler outcome.
    supervised: bool,
    orphaned: Option<HandlerError>,
}

impl CaptureInner {
    /// Fire the head signal if it has not fired yet. Returns true on the
    /// transition.
    fn resolve_head(&mut self) -> bool {
        let Some(tx) = self.head_tx.take() else {
            return false;
        };
        self.phase = CapturePhase::HeadersReady;
        let head = ResponseHead {
            status: self.status,
            headers: self.staged_headers.clone(),
        };
        // Receiver gone means nobody is waiting for this response anymore.
        if tx.send(Ok(head)).is_err() {
            self.consumer_closed = true;
        }
        true
    }

    fn wake_consumer(&mut self) {
        if let Some(waker) = self.consumer_waker.take() {
            waker.wake();
        }
    }

    fn is_drained(&self) -> bool {
        !self.need_drain || self.consumer_closed
    }
}

pub(crate) struct CaptureState {
    inner: Mutex<CaptureInner>,
    high_water_mark: usize,
    drain: Notify,
    finish: Notify,
}

impl CaptureState {
    fn lock(&self) -> MutexGuard<'_, CaptureInner> {
        // A poisoned lock only means a panic elsewhere mid-update; the queue
        // itself is still consistent enough to drain or fail.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn phase(&self) -> CapturePhase {
        self.lock().phase
    }

    /// Terminate the response with `error`.
    ///
    /// Before the head resolved, the head signal carries the error. After,
    /// the body stream yields it as its last item. A complete response is
    /// left alone.
    pub(crate) fn fail(&self, error: HandlerError) {
        let mut inner = self.lock();
        match inner.phase {
            CapturePhase::Complete => {
                tracing::debug!(error = %error, "Ignoring failure of a completed response");
                return;
            }
            CapturePhase::Pending => {
                inner.phase = CapturePhase::Complete;
                if let Some(tx) = inner.head_tx.take() {
                    let _ = tx.send(Err(error));
                }
            }
            CapturePhase::HeadersReady => {
                inner.phase = CapturePhase::Complete;
                inner.failure = Some(error);
            }
        }
        inner.wake_consumer();
        drop(inner);
        self.finish.notify_waiters();
        self.drain.notify_waiters();
    }

    fn abandon(&self, error: HandlerError) {
        let mut inner = self.lock();
        if inner.supervised {
            inner.orphaned = Some(error);
            return;
        }
        drop(inner);
        self.fail(error);
    }

    pub(crate) fn poll_chunk(&self, cx: &mut Context<'_>) -> Poll<Option<Result<Bytes, BodyError>>> {
        let mut inner = self.lock();

        if let Some(chunk) = inner.queue.pop_front() {
            inner.buffered -= chunk.len();
            if inner.need_drain && inner.buffered == 0 {
                inner.need_drain = false;
                drop(inner);
                self.drain.notify_waiters();
            }
            return Poll::Ready(Some(Ok(chunk)));
        }

        if let Some(error) = inner.failure.take() {
            return Poll::Ready(Some(Err(BodyError::Handler(error))));
        }

        if inner.phase == CapturePhase::Complete {
            drop(inner);
            self.finish.notify_waiters();
            return Poll::Ready(None);
        }

        inner.consumer_waker = Some(cx.waker().clone());
        Poll::Pending
    }

    pub(crate) fn close_consumer(&self) {
        let mut inner = self.lock();
        inner.consumer_closed = true;
        inner.queue.clear();
        inner.buffered = 0;
        inner.need_drain = false;
        drop(inner);
        self.drain.notify_waiters();
        self.finish.notify_waiters();
    }
}

/// Create a connected sink/capture pair.
pub fn capture(high_water_mark: usize) -> (ResponseSink, ResponseCapture) {
    let (head_tx, head_rx) = oneshot::channel();
    let state = Arc::new(CaptureState {
        inner: Mutex::new(CaptureInner {
            phase: CapturePhase::Pending,
            status: 200,
            staged_headers: HeaderList::new(),
            head_tx: Some(head_tx),
            queue: VecDeque::new(),
            buffered: 0,
            bytes_written: 0,
            need_drain: false,
            failure: None,
            consumer_waker: None,
            consumer_closed: false,
            supervised: false,
            orphaned: None,
        }),
        high_water_mark: high_water_mark.max(1),
        drain: Notify::new(),
        finish: Notify::new(),
    });

    let sink = ResponseSink {
        state: Arc::clone(&state),
        ended: false,
    };
    let capture = ResponseCapture { state, head_rx };
    (sink, capture)
}

/// Writable response handed to the streaming handler.
///
/// Dropping the sink without calling [`end`](Self::end) terminates the
/// response with an error, so the capture side never waits forever.
pub struct ResponseSink {
    state: Arc<CaptureState>,
    ended: bool,
}

impl ResponseSink {
    pub fn status_code(&self) -> u16 {
        self.state.lock().status
    }

    /// Stage the status used by an implicit head. Ignored once headers are
    /// sent.
    pub fn set_status_code(&mut self, status: u16) {
        let mut inner = self.state.lock();
        if inner.phase == CapturePhase::Pending {
            inner.status = status;
        }
    }

    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let mut inner = self.state.lock();
        if inner.phase == CapturePhase::Pending {
            inner.staged_headers.set(name, value);
        } else {
            tracing::debug!("set_header after headers were sent is ignored");
        }
    }

    pub fn append_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let mut inner = self.state.lock();
        if inner.phase == CapturePhase::Pending {
            inner.staged_headers.append(name, value);
        }
    }

    pub fn get_header(&self, name: &str) -> Option<String> {
        self.state.lock().staged_headers.get(name).map(str::to_string)
    }

    pub fn remove_header(&mut self, name: &str) {
        let mut inner = self.state.lock();
        if inner.phase == CapturePhase::Pending {
            inner.staged_headers.remove(name);
        }
    }

    pub fn headers_sent(&self) -> bool {
        self.state.lock().phase != CapturePhase::Pending
    }

    pub fn phase(&self) -> CapturePhase {
        self.state.phase()
    }

    /// Total body bytes accepted so far, whether or not they were consumed.
    pub fn bytes_written(&self) -> u64 {
        self.state.lock().bytes_written
    }

    /// Fix status and headers. A name present in `headers` replaces whatever
    /// was staged for it with `set_header`; repeated names (`Set-Cookie`)
    /// keep every value. Only the first head counts; later calls leave the
    /// delivered snapshot untouched.
    pub fn write_head<I, K, V>(&mut self, status: u16, headers: I) -> &mut Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        {
            let mut inner = self.state.lock();
            if inner.phase != CapturePhase::Pending {
                tracing::debug!(status, "write_head after headers were resolved is ignored");
                drop(inner);
                return self;
            }

            let incoming: HeaderList = headers.into_iter().collect();
            for (name, _) in incoming.iter() {
                inner.staged_headers.remove(name);
            }
            inner.staged_headers.extend(incoming.iter());
            inner.status = status;
            inner.resolve_head();
        }
        self
    }

    /// Queue `chunk` for the consumer.
    ///
    /// Returns `Ok(false)` when the queue has reached the high-water mark;
    /// the caller should wait for [`drained`](Self::drained) before writing
    /// more.
    pub fn write(&mut self, chunk: impl Into<Bytes>) -> Result<bool, SinkError> {
        let chunk = chunk.into();
        let mut inner = self.state.lock();

        if self.ended || inner.phase == CapturePhase::Complete {
            return Err(SinkError::WriteAfterEnd);
        }
        inner.resolve_head();
        if inner.consumer_closed {
            return Err(SinkError::ConsumerClosed);
        }

        inner.bytes_written += chunk.len() as u64;
        if !chunk.is_empty() {
            inner.buffered += chunk.len();
            inner.queue.push_back(chunk);
            inner.wake_consumer();
        }

        let below_mark = inner.buffered < self.state.high_water_mark;
        if !below_mark {
            inner.need_drain = true;
        }
        Ok(below_mark)
    }

    /// Finish the response, optionally with a last chunk. A second call is a
    /// no-op.
    pub fn end(&mut self, chunk: Option<Bytes>) -> Result<(), SinkError> {
        if self.ended {
            return Ok(());
        }

        let mut inner = self.state.lock();
        if inner.phase == CapturePhase::Complete {
            self.ended = true;
            return Ok(());
        }
        inner.resolve_head();

        if let Some(chunk) = chunk {
            inner.bytes_written += chunk.len() as u64;
            if !chunk.is_empty() && !inner.consumer_closed {
                inner.buffered += chunk.len();
                inner.queue.push_back(chunk);
            }
        }

        inner.phase = CapturePhase::Complete;
        inner.wake_consumer();
        self.ended = true;

        let flushed = inner.queue.is_empty() || inner.consumer_closed;
        drop(inner);
        if flushed {
            self.state.finish.notify_waiters();
        }
        Ok(())
    }

    /// Resolves when a write that returned `false` may be followed by more
    /// writes: the consumer emptied the queue, or went away.
    pub async fn drained(&self) {
        loop {
            let notified = self.state.drain.notified();
            if self.state.lock().is_drained() {
                return;
            }
            notified.await;
        }
    }

    /// Resolves once the response has ended and every queued chunk was
    /// handed to the consumer (or the consumer went away).
    pub async fn finished(&self) {
        loop {
            let notified = self.state.finish.notified();
            {
                let inner = self.state.lock();
                let done = inner.phase == CapturePhase::Complete
                    && (inner.queue.is_empty() || inner.consumer_closed);
                if done {
                    return;
                }
            }
            notified.await;
        }
    }
}

impl Drop for ResponseSink {
    fn drop(&mut self) {
        if self.ended {
            return;
        }
        let error = if self.headers_sent() {
            HandlerError::Incomplete
        } else {
            HandlerError::NoResponse
        };
        self.state.abandon(error);
    }
}

impl std::fmt::Debug for ResponseSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseSink")
            .field("phase", &self.phase())
            .field("ended", &self.ended)
            .finish()
    }
}

/// Capture-layer side of one response.
pub struct ResponseCapture {
    state: Arc<CaptureState>,
    head_rx: oneshot::Receiver<HeadResult>,
}

impl ResponseCapture {
    pub fn phase(&self) -> CapturePhase {
        self.state.phase()
    }

    /// Handle that can terminate the response from outside the handler.
    pub fn abort_handle(&self) -> CaptureAbortHandle {
        CaptureAbortHandle {
            state: Arc::clone(&self.state),
        }
    }

    /// Wait for the head. The returned body yields chunks in write order.
    pub async fn headers_ready(self) -> Result<(ResponseHead, super::ResponseBody), HandlerError> {
        let head = match self.head_rx.await {
            Ok(result) => result?,
            // Sender dropped without a value: the state was torn down.
            Err(_) => return Err(HandlerError::NoResponse),
        };
        Ok((head, super::ResponseBody::captured(self.state)))
    }
}

#[derive(Clone)]
pub struct CaptureAbortHandle {
    state: Arc<CaptureState>,
}

impl CaptureAbortHandle {
    pub fn fail(&self, error: HandlerError) {
        self.state.fail(error);
    }

    pub fn phase(&self) -> CapturePhase {
        self.state.phase()
    }

    /// Hold back failures from a dropped sink until [`settle`](Self::settle),
    /// so the handler's own error is the one reported.
    pub fn supervise(&self) {
        self.state.lock().supervised = true;
    }

    /// Report how the handler call ended. An error fails the response; a
    /// clean return only fails it if the sink was dropped unfinished.
    pub fn settle(&self, outcome: Result<(), HandlerError>) {
        let orphaned = {
            let mut inner = self.state.lock();
            inner.supervised = false;
            inner.orphaned.take()
        };
        match outcome {
            Err(error) => self.state.fail(error),
            Ok(()) => {
                if let Some(error) = orphaned {
                    self.state.fail(error);
                }
            }
        }
    }
}
