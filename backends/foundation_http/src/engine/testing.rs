//! A scripted engine for exercising the pool and stream layers without
//! sockets.
//!
//! Connect attempts queue up until the test resolves them with
//! [`ManualEngine::succeed_next`] or [`ManualEngine::fail_next`]; the
//! resulting [`ManualConnection`]s record submitted exchanges and let the test
//! play the response side of the callback protocol.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;

use crate::errors::ErrorCode;
use crate::http::{HeaderBlock, Headers, Request};
use crate::synca::{lock_or_recover, OneShotFlag, RunOnDrop};

use super::{
    ChunkCompleter, ConnectParams, ConnectResult, ConnectionId, EngineConnection, EngineFailure,
    EngineHold, Exchange, ExchangeId, ExchangeSink, OnceCallback, Task, TransportEngine,
};

struct ManualInner {
    pending: Mutex<VecDeque<(ConnectParams, OnceCallback<ConnectResult>)>>,
    arrived: Condvar,
    connections: Mutex<Vec<Arc<ManualConnection>>>,
    next_id: AtomicU64,
    holds: Arc<AtomicUsize>,
    closed: OneShotFlag,
}

/// Engine whose connect attempts are resolved by the test.
#[derive(Clone)]
pub struct ManualEngine {
    inner: Arc<ManualInner>,
}

impl std::fmt::Debug for ManualEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManualEngine")
            .field("pending_connects", &self.pending_connects())
            .field("holds", &self.active_holds())
            .finish()
    }
}

impl Default for ManualEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl ManualEngine {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ManualInner {
                pending: Mutex::new(VecDeque::new()),
                arrived: Condvar::new(),
                connections: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(1),
                holds: Arc::new(AtomicUsize::new(0)),
                closed: OneShotFlag::new(),
            }),
        }
    }

    #[must_use]
    pub fn pending_connects(&self) -> usize {
        lock_or_recover(&self.inner.pending).len()
    }

    /// Blocks until at least `count` connect attempts are queued.
    pub fn wait_for_connects(&self, count: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut pending = lock_or_recover(&self.inner.pending);
        while pending.len() < count {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            pending = match self.inner.arrived.wait_timeout(pending, remaining) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        true
    }

    /// Resolves the oldest connect attempt with a fresh connection.
    pub fn succeed_next(&self) -> Option<Arc<ManualConnection>> {
        let (params, callback) = lock_or_recover(&self.inner.pending).pop_front()?;
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let connection = Arc::new(ManualConnection::new(id, params));
        lock_or_recover(&self.inner.connections).push(connection.clone());

        callback.call(Ok(connection.clone() as Arc<dyn EngineConnection>));
        Some(connection)
    }

    /// Resolves the oldest connect attempt with a failure carrying `code`.
    pub fn fail_next(&self, code: ErrorCode) -> bool {
        let Some((_, callback)) = lock_or_recover(&self.inner.pending).pop_front() else {
            return false;
        };
        callback.call(Err(EngineFailure::new(code, "scripted connect failure")));
        true
    }

    /// Every connection handed out so far, oldest first.
    #[must_use]
    pub fn connections(&self) -> Vec<Arc<ManualConnection>> {
        lock_or_recover(&self.inner.connections).clone()
    }

    #[must_use]
    pub fn active_holds(&self) -> usize {
        self.inner.holds.load(Ordering::SeqCst)
    }

    /// Refuses further holds and drops queued attempts, which then report
    /// an event loop shutdown.
    pub fn close(&self) {
        self.inner.closed.fire();
        let pending = std::mem::take(&mut *lock_or_recover(&self.inner.pending));
        drop(pending);
    }
}

impl TransportEngine for ManualEngine {
    fn connect(&self, params: ConnectParams, on_connected: OnceCallback<ConnectResult>) {
        if self.inner.closed.is_fired() {
            return;
        }
        lock_or_recover(&self.inner.pending).push_back((params, on_connected));
        self.inner.arrived.notify_all();
    }

    fn schedule(&self, delay: Duration, task: Task) -> bool {
        if self.inner.closed.is_fired() {
            return false;
        }
        thread::spawn(move || {
            thread::sleep(delay);
            task();
        });
        true
    }

    fn hold(&self) -> Option<EngineHold> {
        if self.inner.closed.is_fired() {
            return None;
        }
        let holds = self.inner.holds.clone();
        holds.fetch_add(1, Ordering::SeqCst);
        Some(RunOnDrop::new(Box::new(move || {
            holds.fetch_sub(1, Ordering::SeqCst);
        }) as Box<dyn FnOnce() + Send>))
    }
}

struct ManualExchange {
    id: ExchangeId,
    request: Request,
    sink: Arc<dyn ExchangeSink>,
    window: Option<u64>,
    finished: bool,
}

/// A recorded chunk write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedChunk {
    pub exchange: ExchangeId,
    pub data: Bytes,
    pub is_final: bool,
}

/// Connection produced by [`ManualEngine`].
pub struct ManualConnection {
    id: ConnectionId,
    params: ConnectParams,
    open: AtomicBool,
    next_exchange: AtomicU64,
    exchanges: Mutex<Vec<ManualExchange>>,
    submitted: Condvar,
    chunks: Mutex<Vec<RecordedChunk>>,
    window_updates: Mutex<Vec<(ExchangeId, u64)>>,
    shutdown_code: Mutex<Option<ErrorCode>>,
}

impl std::fmt::Debug for ManualConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManualConnection")
            .field("id", &self.id)
            .field("open", &self.is_open())
            .finish()
    }
}

impl ManualConnection {
    fn new(id: ConnectionId, params: ConnectParams) -> Self {
        Self {
            id,
            params,
            open: AtomicBool::new(true),
            next_exchange: AtomicU64::new(1),
            exchanges: Mutex::new(Vec::new()),
            submitted: Condvar::new(),
            chunks: Mutex::new(Vec::new()),
            window_updates: Mutex::new(Vec::new()),
            shutdown_code: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn params(&self) -> &ConnectParams {
        &self.params
    }

    #[must_use]
    pub fn submitted(&self) -> usize {
        lock_or_recover(&self.exchanges).len()
    }

    /// Blocks until `count` exchanges were submitted; returns the newest id.
    pub fn wait_for_exchange(&self, count: usize, timeout: Duration) -> Option<ExchangeId> {
        let deadline = Instant::now() + timeout;
        let mut exchanges = lock_or_recover(&self.exchanges);
        while exchanges.len() < count {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }
            exchanges = match self.submitted.wait_timeout(exchanges, remaining) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        exchanges.last().map(|e| e.id)
    }

    #[must_use]
    pub fn request(&self, exchange: ExchangeId) -> Option<Request> {
        lock_or_recover(&self.exchanges)
            .iter()
            .find(|e| e.id == exchange)
            .map(|e| e.request.clone())
    }

    /// The window the exchange was submitted with.
    #[must_use]
    pub fn initial_window(&self, exchange: ExchangeId) -> Option<u64> {
        lock_or_recover(&self.exchanges)
            .iter()
            .find(|e| e.id == exchange)
            .and_then(|e| e.window)
    }

    #[must_use]
    pub fn is_finished(&self, exchange: ExchangeId) -> bool {
        lock_or_recover(&self.exchanges)
            .iter()
            .find(|e| e.id == exchange)
            .is_some_and(|e| e.finished)
    }

    #[must_use]
    pub fn chunks(&self) -> Vec<RecordedChunk> {
        lock_or_recover(&self.chunks).clone()
    }

    #[must_use]
    pub fn window_updates(&self) -> Vec<(ExchangeId, u64)> {
        lock_or_recover(&self.window_updates).clone()
    }

    #[must_use]
    pub fn shutdown_code(&self) -> Option<ErrorCode> {
        *lock_or_recover(&self.shutdown_code)
    }

    fn sink(&self, exchange: ExchangeId) -> Option<Arc<dyn ExchangeSink>> {
        lock_or_recover(&self.exchanges)
            .iter()
            .find(|e| e.id == exchange && !e.finished)
            .map(|e| e.sink.clone())
    }

    pub fn send_headers(
        &self,
        exchange: ExchangeId,
        block: HeaderBlock,
        status: u16,
        headers: &Headers,
    ) -> bool {
        let Some(sink) = self.sink(exchange) else {
            return false;
        };
        sink.on_headers(block, status, headers);
        sink.on_headers_done(block);
        true
    }

    /// Delivers body bytes; returns the window increment the sink granted.
    pub fn send_body(&self, exchange: ExchangeId, data: &[u8]) -> Option<u64> {
        self.sink(exchange).map(|sink| sink.on_body(data))
    }

    /// Completes the exchange. Returns false if it was already complete.
    pub fn complete(&self, exchange: ExchangeId, code: ErrorCode) -> bool {
        let sink = {
            let mut exchanges = lock_or_recover(&self.exchanges);
            let Some(entry) = exchanges
                .iter_mut()
                .find(|e| e.id == exchange && !e.finished)
            else {
                return false;
            };
            entry.finished = true;
            entry.sink.clone()
        };
        if !code.is_success() {
            self.open.store(false, Ordering::SeqCst);
        }
        sink.on_complete(code);
        true
    }

    /// Plays a whole successful response.
    pub fn respond(&self, exchange: ExchangeId, status: u16, body: &[u8]) -> bool {
        if !self.send_headers(exchange, HeaderBlock::Main, status, &Headers::default()) {
            return false;
        }
        if !body.is_empty() {
            self.send_body(exchange, body);
        }
        self.complete(exchange, ErrorCode::SUCCESS)
    }

    /// Simulates the peer dropping the connection.
    pub fn close_remotely(&self) {
        self.open.store(false, Ordering::SeqCst);
        self.complete_all(ErrorCode::SOCKET_CLOSED);
    }

    fn complete_all(&self, code: ErrorCode) {
        let unfinished: Vec<ExchangeId> = lock_or_recover(&self.exchanges)
            .iter()
            .filter(|e| !e.finished)
            .map(|e| e.id)
            .collect();
        for id in unfinished {
            self.complete(id, code);
        }
    }
}

impl EngineConnection for ManualConnection {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn submit(&self, exchange: Exchange) -> Result<ExchangeId, EngineFailure> {
        if !self.is_open() {
            return Err(EngineFailure::new(
                ErrorCode::CONNECTION_CLOSED,
                "manual connection is closed",
            ));
        }

        let id = self.next_exchange.fetch_add(1, Ordering::Relaxed);
        lock_or_recover(&self.exchanges).push(ManualExchange {
            id,
            request: exchange.request,
            sink: exchange.sink,
            window: exchange.window,
            finished: false,
        });
        self.submitted.notify_all();
        Ok(id)
    }

    fn write_chunk(&self, exchange: ExchangeId, data: Bytes, is_final: bool, done: ChunkCompleter) {
        if self.sink(exchange).is_none() || !self.is_open() {
            let _ = done.complete(Err(ErrorCode::CONNECTION_CLOSED));
            return;
        }
        lock_or_recover(&self.chunks).push(RecordedChunk {
            exchange,
            data,
            is_final,
        });
        let _ = done.complete(Ok(()));
    }

    fn update_window(&self, exchange: ExchangeId, increment: u64) {
        lock_or_recover(&self.window_updates).push((exchange, increment));
    }

    fn cancel(&self, exchange: ExchangeId, code: ErrorCode) {
        self.complete(exchange, code);
    }

    fn shutdown(&self, code: ErrorCode) {
        self.open.store(false, Ordering::SeqCst);
        lock_or_recover(&self.shutdown_code).get_or_insert(code);
        self.complete_all(code);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    struct LastCode(Mutex<Option<ErrorCode>>);

    impl ExchangeSink for LastCode {
        fn on_headers(&self, _: HeaderBlock, _: u16, _: &Headers) {}
        fn on_headers_done(&self, _: HeaderBlock) {}
        fn on_body(&self, data: &[u8]) -> u64 {
            data.len() as u64
        }
        fn on_complete(&self, code: ErrorCode) {
            *lock_or_recover(&self.0) = Some(code);
        }
    }

    #[test]
    fn scripted_connects_resolve_in_order() {
        let engine = ManualEngine::new();
        let (first_tx, first) = crate::synca::channel();
        let (second_tx, second) = crate::synca::channel();

        engine.connect(
            ConnectParams::new("a.test", 80),
            OnceCallback::new(
                move |r: ConnectResult| {
                    let _ = first_tx.complete(r.is_ok());
                },
                super::super::shutdown_failure,
            ),
        );
        engine.connect(
            ConnectParams::new("a.test", 80),
            OnceCallback::new(
                move |r: ConnectResult| {
                    let _ = second_tx.complete(r.err().map(|f| f.code));
                },
                super::super::shutdown_failure,
            ),
        );

        assert!(engine.succeed_next().is_some());
        assert!(engine.fail_next(ErrorCode::DNS_FAILURE));
        assert_eq!(first.wait(), Ok(true));
        assert_eq!(second.wait(), Ok(Some(ErrorCode::DNS_FAILURE)));
    }

    #[test]
    fn shutdown_completes_unfinished_exchanges_once() {
        let connection = ManualConnection::new(1, ConnectParams::new("a.test", 80));
        let sink = Arc::new(LastCode(Mutex::new(None)));
        let id = connection
            .submit(Exchange {
                request: Request::get("/").build().expect("request"),
                sink: sink.clone(),
                window: None,
            })
            .expect("submitted");

        connection.shutdown(ErrorCode::CONNECTION_CLOSED);
        assert!(!connection.complete(id, ErrorCode::SUCCESS));
        assert_eq!(*lock_or_recover(&sink.0), Some(ErrorCode::CONNECTION_CLOSED));
        assert!(!connection.is_open());
    }
}
