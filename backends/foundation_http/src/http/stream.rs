//! One request/response exchange on a leased connection.
//!
//! [`HttpStream`] is the caller's handle; the engine talks to the shared
//! core through [`ExchangeSink`] and the handler sees it as an
//! [`HttpStreamRef`].

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;

use crate::engine::{Exchange, ExchangeId, ExchangeSink};
use crate::errors::{ErrorCode, HttpError, HttpResult};
use crate::synca::{self, lock_or_recover, Completion, CompletionError, Latch, LatchWait, StateCell};

use super::connection::Lease;
use super::handler::{HeaderBlock, HttpResponseHandler};
use super::headers::Headers;
use super::request::Request;
use super::window::FlowWindow;

/// Lifecycle of a stream. States only ever move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum StreamState {
    Created,
    Activated,
    HeadersReceived,
    BodyReceiving,
    Complete,
    Closed,
}

impl From<StreamState> for u8 {
    fn from(value: StreamState) -> Self {
        value as u8
    }
}

impl From<u8> for StreamState {
    fn from(value: u8) -> Self {
        match value {
            0 => Self::Created,
            1 => Self::Activated,
            2 => Self::HeadersReceived,
            3 => Self::BodyReceiving,
            4 => Self::Complete,
            _ => Self::Closed,
        }
    }
}

/// Exchange id once submitted, plus window increments requested before the
/// engine handed the id back.
#[derive(Default)]
struct ExchangeSlot {
    id: Option<ExchangeId>,
    pending_increment: u64,
}

pub(crate) struct StreamCore {
    state: StateCell<StreamState>,
    request: Mutex<Option<Request>>,
    chunk_writes: bool,
    handler: Mutex<Box<dyn HttpResponseHandler>>,
    window: Mutex<FlowWindow>,
    status: AtomicU16,
    exchange: Mutex<ExchangeSlot>,
    completed: Latch<ErrorCode>,
    lease: Arc<Lease>,
    /// Set while the stream counts against its lease.
    on_lease: AtomicBool,
    this: Weak<StreamCore>,
}

impl StreamCore {
    fn stream_ref(&self) -> HttpStreamRef {
        HttpStreamRef {
            core: self.this.clone(),
        }
    }

    fn leave_lease(&self) {
        if self.on_lease.swap(false, Ordering::AcqRel) {
            self.lease.end_stream();
        }
    }

    fn exchange_id(&self) -> Option<ExchangeId> {
        lock_or_recover(&self.exchange).id
    }

    fn response_status(&self) -> Option<u16> {
        match self.status.load(Ordering::Acquire) {
            0 => None,
            status => Some(status),
        }
    }

    fn increment_window(&self, increment: u64) {
        if increment == 0 || self.state.get() >= StreamState::Complete {
            return;
        }
        if !lock_or_recover(&self.window).increase(increment) {
            return;
        }

        let target = {
            let mut slot = lock_or_recover(&self.exchange);
            match slot.id {
                Some(id) => Some(id),
                None => {
                    slot.pending_increment = slot.pending_increment.saturating_add(increment);
                    None
                }
            }
        };
        if let Some(id) = target {
            self.lease.engine().update_window(id, increment);
        }
    }
}

impl Drop for StreamCore {
    fn drop(&mut self) {
        // An engine that dropped the exchange without completing it.
        self.leave_lease();
    }
}

impl ExchangeSink for StreamCore {
    fn on_headers(&self, block: HeaderBlock, status: u16, headers: &Headers) {
        if block == HeaderBlock::Main {
            self.status.store(status, Ordering::Release);
        }
        if block != HeaderBlock::Trailing {
            let _ = self.state.advance(StreamState::HeadersReceived);
        }
        let stream = self.stream_ref();
        lock_or_recover(&self.handler).on_response_headers(&stream, status, block, headers);
    }

    fn on_headers_done(&self, block: HeaderBlock) {
        let stream = self.stream_ref();
        lock_or_recover(&self.handler).on_response_headers_done(&stream, block);
    }

    fn on_body(&self, data: &[u8]) -> u64 {
        let _ = self.state.advance(StreamState::BodyReceiving);
        lock_or_recover(&self.window).consume(data.len() as u64);

        let stream = self.stream_ref();
        let increment = lock_or_recover(&self.handler).on_response_body(&stream, data);
        lock_or_recover(&self.window).increase(increment);
        increment
    }

    fn on_complete(&self, code: ErrorCode) {
        let _ = self.state.advance(StreamState::Complete);
        // The lease is free again before the handler hears about it.
        self.leave_lease();
        let stream = self.stream_ref();
        lock_or_recover(&self.handler).on_response_complete(&stream, code);
        self.completed.set(code);

        if code.is_success() {
            debug!(connection = self.lease.id(), "stream completed");
        } else {
            warn!(connection = self.lease.id(), "stream completed with {code}");
        }
    }
}

/// A single HTTP exchange bound to one leased connection and one handler.
///
/// Nothing goes out until [`HttpStream::activate`]. Dropping the stream
/// closes it; an activated stream that has not completed yet is abandoned,
/// which also takes its connection down.
pub struct HttpStream {
    core: Arc<StreamCore>,
}

impl std::fmt::Debug for HttpStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpStream")
            .field("connection", &self.core.lease.id())
            .field("exchange", &self.core.exchange_id())
            .field("state", &self.core.state.get())
            .finish()
    }
}

impl HttpStream {
    pub(crate) fn new(
        lease: Arc<Lease>,
        request: Request,
        handler: Box<dyn HttpResponseHandler>,
    ) -> Self {
        let window = match lease.initial_window() {
            Some(initial) => FlowWindow::manual(initial),
            None => FlowWindow::unbounded(),
        };
        let chunk_writes = request.expects_chunk_writes();

        let core = Arc::new_cyclic(|this| StreamCore {
            state: StateCell::new(StreamState::Created),
            request: Mutex::new(Some(request)),
            chunk_writes,
            handler: Mutex::new(handler),
            window: Mutex::new(window),
            status: AtomicU16::new(0),
            exchange: Mutex::new(ExchangeSlot::default()),
            completed: Latch::new(),
            lease,
            on_lease: AtomicBool::new(false),
            this: this.clone(),
        });
        Self { core }
    }

    /// Submits the request; response callbacks start arriving on an engine
    /// thread.
    ///
    /// # Errors
    ///
    /// [`HttpError::Precondition`] when called twice,
    /// [`HttpError::ResourceClosed`] after [`HttpStream::close`], and
    /// [`HttpError::StreamActivation`] when the connection cannot take the
    /// request.
    pub fn activate(&self) -> HttpResult<()> {
        if let Err(observed) = self
            .core
            .state
            .transition(StreamState::Created, StreamState::Activated)
        {
            return Err(match observed {
                StreamState::Closed => HttpError::ResourceClosed("stream"),
                _ => HttpError::precondition("stream was already activated"),
            });
        }

        let Some(request) = lock_or_recover(&self.core.request).take() else {
            return Err(HttpError::precondition("stream has no request to send"));
        };

        let lease = &self.core.lease;
        if !lease.engine().is_open() || !lease.begin_stream() {
            self.fail_activation(ErrorCode::CONNECTION_CLOSED);
            return Err(HttpError::activation(
                ErrorCode::CONNECTION_CLOSED,
                "connection is closed",
            ));
        }

        self.core.on_lease.store(true, Ordering::Release);

        let sink: Arc<dyn ExchangeSink> = self.core.clone();
        let exchange = Exchange {
            request,
            sink,
            window: lease.initial_window(),
        };

        match lease.engine().submit(exchange) {
            Ok(id) => {
                let pending = {
                    let mut slot = lock_or_recover(&self.core.exchange);
                    slot.id = Some(id);
                    std::mem::take(&mut slot.pending_increment)
                };
                if pending > 0 {
                    lease.engine().update_window(id, pending);
                }
                debug!(connection = lease.id(), exchange = id, "stream activated");
                Ok(())
            }
            Err(failure) => {
                self.fail_activation(failure.code);
                Err(HttpError::activation(failure.code, failure.message))
            }
        }
    }

    fn fail_activation(&self, code: ErrorCode) {
        let _ = self.core.state.advance(StreamState::Closed);
        self.core.leave_lease();
        self.core.completed.set(code);
    }

    /// Sends one chunk of a chunked request body. The returned handle
    /// resolves once the chunk was handed to the transport; `is_final` ends
    /// the body.
    ///
    /// # Errors
    ///
    /// [`HttpError::Precondition`] before activation, after close, or for a
    /// request that does not take chunk writes.
    pub fn write_chunk(&self, data: impl Into<Bytes>, is_final: bool) -> HttpResult<ChunkWrite> {
        if !self.core.chunk_writes {
            return Err(HttpError::precondition(
                "chunk writes need a chunked request without a body source",
            ));
        }
        let state = self.core.state.get();
        if state == StreamState::Created || state == StreamState::Closed {
            return Err(HttpError::precondition(
                "chunks can only be written to an active stream",
            ));
        }
        let Some(id) = self.core.exchange_id() else {
            return Err(HttpError::precondition("stream was never submitted"));
        };

        let (done, completion) = synca::channel();
        self.core
            .lease
            .engine()
            .write_chunk(id, data.into(), is_final, done);
        Ok(ChunkWrite { completion })
    }

    /// Widens the response window by `increment` bytes. A no-op unless the
    /// manager runs with manual window management.
    pub fn increment_window(&self, increment: u64) {
        self.core.increment_window(increment);
    }

    /// Closes the stream. Idempotent.
    pub fn close(&self) {
        let Ok(previous) = self.core.state.advance(StreamState::Closed) else {
            return;
        };

        match previous {
            StreamState::Created => {
                lock_or_recover(&self.core.request).take();
                self.core.completed.set(ErrorCode::STREAM_ABANDONED);
            }
            StreamState::Activated | StreamState::HeadersReceived | StreamState::BodyReceiving => {
                if let Some(id) = self.core.exchange_id() {
                    debug!(exchange = id, "abandoning incomplete stream");
                    self.core
                        .lease
                        .engine()
                        .cancel(id, ErrorCode::STREAM_ABANDONED);
                }
            }
            StreamState::Complete | StreamState::Closed => {}
        }
    }

    /// Resolves with the terminal code once `on_response_complete` returned.
    #[must_use]
    pub fn completion(&self) -> LatchWait<ErrorCode> {
        self.core.completed.listen()
    }

    #[must_use]
    pub fn response_status(&self) -> Option<u16> {
        self.core.response_status()
    }

    #[must_use]
    pub fn state(&self) -> StreamState {
        self.core.state.get()
    }

    /// Engine exchange id; `None` until activated.
    #[must_use]
    pub fn id(&self) -> Option<ExchangeId> {
        self.core.exchange_id()
    }

    /// Bytes the engine may still deliver; `None` when unbounded.
    #[must_use]
    pub fn window_size(&self) -> Option<u64> {
        lock_or_recover(&self.core.window).available()
    }
}

impl Drop for HttpStream {
    fn drop(&mut self) {
        self.close();
    }
}

/// The view of a stream handed to response callbacks.
#[derive(Debug, Clone)]
pub struct HttpStreamRef {
    core: Weak<StreamCore>,
}

impl std::fmt::Debug for StreamCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamCore")
            .field("state", &self.state.get())
            .field("status", &self.response_status())
            .finish()
    }
}

impl HttpStreamRef {
    #[must_use]
    pub fn id(&self) -> Option<ExchangeId> {
        self.core.upgrade().and_then(|core| core.exchange_id())
    }

    #[must_use]
    pub fn state(&self) -> StreamState {
        self.core
            .upgrade()
            .map_or(StreamState::Closed, |core| core.state.get())
    }

    #[must_use]
    pub fn response_status(&self) -> Option<u16> {
        self.core.upgrade().and_then(|core| core.response_status())
    }

    /// Same as [`HttpStream::increment_window`]; callable from inside a
    /// callback.
    pub fn increment_window(&self, increment: u64) {
        if let Some(core) = self.core.upgrade() {
            core.increment_window(increment);
        }
    }
}

/// Pending hand-off of one chunk to the transport.
#[derive(Debug)]
pub struct ChunkWrite {
    completion: Completion<Result<(), ErrorCode>>,
}

fn chunk_outcome(result: Result<Result<(), ErrorCode>, CompletionError>) -> HttpResult<()> {
    match result {
        Ok(Ok(())) => Ok(()),
        Ok(Err(code)) => Err(HttpError::Stream { code }),
        Err(err) => Err(HttpError::Completion(err)),
    }
}

impl ChunkWrite {
    /// # Errors
    ///
    /// [`HttpError::Stream`] when the exchange ended before the chunk went
    /// out.
    pub fn wait(self) -> HttpResult<()> {
        chunk_outcome(self.completion.wait())
    }

    /// # Errors
    ///
    /// As [`ChunkWrite::wait`], plus a timed out [`HttpError::Completion`]
    /// that leaves the write pending.
    pub fn wait_timeout(&mut self, timeout: Duration) -> HttpResult<()> {
        chunk_outcome(self.completion.wait_timeout(timeout))
    }
}

impl Future for ChunkWrite {
    type Output = HttpResult<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.completion).poll(cx).map(chunk_outcome)
    }
}
