//! Connection pool for one endpoint.
//!
//! All bookkeeping lives in one [`PoolState`] under one mutex. Every
//! operation mutates the state under the lock and collects [`PoolWork`];
//! deliveries to waiters and calls into the engine run after the lock is
//! released, so engine threads and callers never wait on each other.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, Weak};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use crate::engine::{
    shutdown_failure, ConnectResult, EngineConnection, EngineHold, OnceCallback, TransportEngine,
};
use crate::errors::{ConfigError, ErrorCode, HttpError, HttpResult};
use crate::synca::{self, lock_or_recover, Completer, Completion, ShutdownSignal, ShutdownWait};

use super::connection::HttpClientConnection;
use super::options::ConnectionManagerOptions;

type AcquireCompleter = Completer<HttpResult<HttpClientConnection>>;

struct IdleConnection {
    connection: Arc<dyn EngineConnection>,
    since: Instant,
}

struct PoolState {
    /// Most recently returned last; acquisition pops from the back.
    idle: Vec<IdleConnection>,
    pending: VecDeque<AcquireCompleter>,
    connecting: usize,
    leased: usize,
    closing: bool,
    /// Engine and TLS holds, released together once drained.
    holds: Vec<EngineHold>,
}

impl PoolState {
    fn live(&self) -> usize {
        self.idle.len() + self.leased + self.connecting
    }

    fn metrics(&self) -> PoolMetrics {
        PoolMetrics {
            available: self.idle.len(),
            leased: self.leased,
            pending: self.pending.len(),
            connecting: self.connecting,
            live: self.live(),
        }
    }
}

enum PoolWork {
    Deliver(AcquireCompleter, HttpResult<HttpClientConnection>),
    Connect,
    Close(Arc<dyn EngineConnection>, ErrorCode),
    ExpireIdle(Duration),
    Drained(Vec<EngineHold>),
}

pub(crate) struct PoolShared {
    options: ConnectionManagerOptions,
    engine: Arc<dyn TransportEngine>,
    state: Mutex<PoolState>,
    shutdown: ShutdownSignal,
    this: Weak<PoolShared>,
}

impl PoolShared {
    fn window(&self) -> Option<u64> {
        self.options
            .manual_window_management()
            .then(|| self.options.initial_window_size())
    }

    fn lease(self: &Arc<Self>, connection: Arc<dyn EngineConnection>) -> HttpClientConnection {
        HttpClientConnection::leased(connection, self.clone(), self.window())
    }

    /// Serves waiters from the idle set, then opens connections for the
    /// waiters no attempt is covering yet, within capacity.
    fn balance(self: &Arc<Self>, state: &mut PoolState, work: &mut Vec<PoolWork>) {
        while !state.pending.is_empty() {
            let Some(idle) = state.idle.pop() else {
                break;
            };
            if !idle.connection.is_open() {
                debug!(connection = idle.connection.id(), "discarding dead idle connection");
                work.push(PoolWork::Close(idle.connection, ErrorCode::CONNECTION_CLOSED));
                continue;
            }
            if let Some(waiter) = state.pending.pop_front() {
                state.leased += 1;
                work.push(PoolWork::Deliver(waiter, Ok(self.lease(idle.connection))));
            }
        }

        while state.pending.len() > state.connecting
            && state.live() < self.options.max_connections()
        {
            state.connecting += 1;
            work.push(PoolWork::Connect);
        }
    }

    /// Places a usable connection: to the oldest waiter, else into the idle
    /// set.
    fn place(
        self: &Arc<Self>,
        state: &mut PoolState,
        connection: Arc<dyn EngineConnection>,
        work: &mut Vec<PoolWork>,
    ) {
        if state.closing {
            work.push(PoolWork::Close(connection, ErrorCode::MANAGER_SHUTTING_DOWN));
            return;
        }
        if !connection.is_open() {
            work.push(PoolWork::Close(connection, ErrorCode::CONNECTION_CLOSED));
            return;
        }

        if let Some(waiter) = state.pending.pop_front() {
            state.leased += 1;
            work.push(PoolWork::Deliver(waiter, Ok(self.lease(connection))));
            return;
        }

        state.idle.push(IdleConnection {
            connection,
            since: Instant::now(),
        });
        if let Some(timeout) = self.options.idle_timeout() {
            work.push(PoolWork::ExpireIdle(timeout));
        }
    }

    fn check_drained(state: &mut PoolState, work: &mut Vec<PoolWork>) {
        if state.closing && state.live() == 0 && !state.holds.is_empty() {
            work.push(PoolWork::Drained(std::mem::take(&mut state.holds)));
        }
    }

    fn run(self: &Arc<Self>, work: Vec<PoolWork>) {
        for item in work {
            match item {
                PoolWork::Deliver(waiter, result) => {
                    if let Err(undelivered) = waiter.complete(result) {
                        // The caller gave up waiting; dropping the lease
                        // returns the connection.
                        if undelivered.is_ok() {
                            debug!("acquisition abandoned; returning connection to pool");
                        }
                        drop(undelivered);
                    }
                }
                PoolWork::Connect => self.connect(),
                PoolWork::Close(connection, code) => {
                    debug!(connection = connection.id(), "closing pooled connection");
                    connection.shutdown(code);
                }
                PoolWork::ExpireIdle(timeout) => {
                    let pool = self.this.clone();
                    let scheduled = self.engine.schedule(
                        timeout,
                        Box::new(move || {
                            if let Some(pool) = pool.upgrade() {
                                pool.expire_idle(timeout);
                            }
                        }),
                    );
                    if !scheduled {
                        warn!("engine refused the idle expiry timer");
                    }
                }
                PoolWork::Drained(holds) => {
                    info!(host = self.options.host(), "connection manager shut down");
                    self.shutdown.signal();
                    drop(holds);
                }
            }
        }
    }

    fn connect(self: &Arc<Self>) {
        let pool = self.clone();
        debug!(host = self.options.host(), "opening pooled connection");
        self.engine.connect(
            self.options.connect_params(),
            OnceCallback::new(move |result| pool.on_connected(result), shutdown_failure),
        );
    }

    fn on_connected(self: &Arc<Self>, result: ConnectResult) {
        let mut work = Vec::new();
        {
            let mut state = lock_or_recover(&self.state);
            state.connecting = state.connecting.saturating_sub(1);

            match result {
                Ok(connection) => {
                    debug!(connection = connection.id(), "pooled connection established");
                    self.place(&mut state, connection, &mut work);
                }
                Err(failure) => {
                    warn!(
                        host = self.options.host(),
                        "connection attempt failed with {}",
                        failure
                    );
                    if let Some(waiter) = state.pending.pop_front() {
                        work.push(PoolWork::Deliver(
                            waiter,
                            Err(HttpError::acquisition(failure.code, failure.message)),
                        ));
                    }
                }
            }

            if !state.closing {
                self.balance(&mut state, &mut work);
            }
            Self::check_drained(&mut state, &mut work);
        }
        self.run(work);
    }

    /// Takes a connection back from a lease.
    pub(crate) fn reclaim(self: &Arc<Self>, connection: Arc<dyn EngineConnection>) {
        let mut work = Vec::new();
        {
            let mut state = lock_or_recover(&self.state);
            state.leased = state.leased.saturating_sub(1);
            debug!(connection = connection.id(), "connection released");

            self.place(&mut state, connection, &mut work);
            if !state.closing {
                self.balance(&mut state, &mut work);
            }
            Self::check_drained(&mut state, &mut work);
        }
        self.run(work);
    }

    fn expire_idle(self: &Arc<Self>, timeout: Duration) {
        let now = Instant::now();
        let mut work = Vec::new();
        {
            let mut state = lock_or_recover(&self.state);
            let mut kept = Vec::with_capacity(state.idle.len());
            for idle in state.idle.drain(..) {
                if now.duration_since(idle.since) >= timeout || !idle.connection.is_open() {
                    debug!(connection = idle.connection.id(), "idle connection expired");
                    work.push(PoolWork::Close(idle.connection, ErrorCode::CONNECTION_CLOSED));
                } else {
                    kept.push(idle);
                }
            }
            state.idle = kept;

            if !state.closing {
                self.balance(&mut state, &mut work);
            }
            Self::check_drained(&mut state, &mut work);
        }
        self.run(work);
    }

    fn close(self: &Arc<Self>) {
        let mut work = Vec::new();
        {
            let mut state = lock_or_recover(&self.state);
            if state.closing {
                return;
            }
            state.closing = true;
            info!(
                host = self.options.host(),
                leased = state.leased,
                pending = state.pending.len(),
                "closing connection manager"
            );

            for waiter in state.pending.drain(..) {
                work.push(PoolWork::Deliver(
                    waiter,
                    Err(HttpError::acquisition(
                        ErrorCode::MANAGER_SHUTTING_DOWN,
                        "connection manager is shutting down",
                    )),
                ));
            }
            for idle in state.idle.drain(..) {
                work.push(PoolWork::Close(
                    idle.connection,
                    ErrorCode::MANAGER_SHUTTING_DOWN,
                ));
            }
            Self::check_drained(&mut state, &mut work);
        }
        self.run(work);
    }
}

/// Point in time view of a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolMetrics {
    /// Idle connections ready to lease.
    pub available: usize,
    pub leased: usize,
    /// Acquisitions waiting for a connection.
    pub pending: usize,
    /// Connection attempts in flight.
    pub connecting: usize,
    /// `available + leased + connecting`; never above `max_connections`.
    pub live: usize,
}

/// Pending result of [`HttpClientConnectionManager::acquire_connection`].
///
/// Dropping it does not cancel the acquisition; a connection delivered to a
/// dropped handle goes straight back to the pool.
#[derive(Debug)]
pub struct ConnectionAcquisition {
    completion: Completion<HttpResult<HttpClientConnection>>,
}

fn flatten(
    result: Result<HttpResult<HttpClientConnection>, synca::CompletionError>,
) -> HttpResult<HttpClientConnection> {
    result.map_err(HttpError::Completion)?
}

impl ConnectionAcquisition {
    /// Blocks until a connection is leased or the acquisition fails.
    ///
    /// # Errors
    ///
    /// [`HttpError::ConnectionAcquisition`] carrying the engine code.
    pub fn wait(self) -> HttpResult<HttpClientConnection> {
        flatten(self.completion.wait())
    }

    /// # Errors
    ///
    /// As [`ConnectionAcquisition::wait`]; a timeout leaves the acquisition
    /// pending so it can be waited on again.
    pub fn wait_timeout(&mut self, timeout: Duration) -> HttpResult<HttpClientConnection> {
        flatten(self.completion.wait_timeout(timeout))
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.completion.is_ready()
    }
}

impl Future for ConnectionAcquisition {
    type Output = HttpResult<HttpClientConnection>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.completion).poll(cx).map(flatten)
    }
}

/// Pools HTTP/1.1 connections to the single endpoint named in its options.
///
/// At most `max_connections` connections are alive at once (idle, leased
/// or being established). Acquisitions beyond that queue in arrival order.
/// Dropping the manager closes it; leases still out keep the pool state
/// alive until they are released.
pub struct HttpClientConnectionManager {
    shared: Arc<PoolShared>,
}

impl std::fmt::Debug for HttpClientConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpClientConnectionManager")
            .field("uri", &self.shared.options.uri().as_str())
            .field("metrics", &self.metrics())
            .finish()
    }
}

impl HttpClientConnectionManager {
    /// Builds a manager on the bootstrap named in `options`.
    ///
    /// # Errors
    ///
    /// [`ConfigError::MissingBootstrap`] without a bootstrap, and
    /// [`HttpError::ResourceClosed`] when the bootstrap is already closing.
    pub fn new(options: ConnectionManagerOptions) -> HttpResult<Self> {
        let Some(bootstrap) = options.bootstrap().cloned() else {
            return Err(ConfigError::MissingBootstrap.into());
        };
        Self::with_engine(options, Arc::new(bootstrap))
    }

    /// Builds a manager on any [`TransportEngine`]; the bootstrap in
    /// `options`, if any, is ignored.
    ///
    /// # Errors
    ///
    /// [`HttpError::ResourceClosed`] when the engine or the TLS context is
    /// already closing.
    pub fn with_engine(
        options: ConnectionManagerOptions,
        engine: Arc<dyn TransportEngine>,
    ) -> HttpResult<Self> {
        let Some(hold) = engine.hold() else {
            return Err(HttpError::ResourceClosed("client bootstrap"));
        };
        let mut holds = vec![hold];
        if let Some(tls) = options.tls_context() {
            let Some(tls_hold) = tls.hold() else {
                return Err(HttpError::ResourceClosed("tls context"));
            };
            holds.push(tls_hold);
        }

        info!(
            uri = options.uri().as_str(),
            max_connections = options.max_connections(),
            "connection manager created"
        );

        let shared = Arc::new_cyclic(|this| PoolShared {
            options,
            engine,
            state: Mutex::new(PoolState {
                idle: Vec::new(),
                pending: VecDeque::new(),
                connecting: 0,
                leased: 0,
                closing: false,
                holds,
            }),
            shutdown: ShutdownSignal::new("connection manager"),
            this: this.clone(),
        });
        Ok(Self { shared })
    }

    /// Leases a connection: an idle one, a new one within capacity, or the
    /// next one freed up.
    pub fn acquire_connection(&self) -> ConnectionAcquisition {
        let (waiter, completion) = synca::channel();
        let mut work = Vec::new();
        {
            let mut state = lock_or_recover(&self.shared.state);
            if state.closing {
                work.push(PoolWork::Deliver(
                    waiter,
                    Err(HttpError::acquisition(
                        ErrorCode::MANAGER_SHUTTING_DOWN,
                        "connection manager is shutting down",
                    )),
                ));
            } else {
                state.pending.push_back(waiter);
                self.shared.balance(&mut state, &mut work);
            }
        }
        self.shared.run(work);
        ConnectionAcquisition { completion }
    }

    /// Returns a leased connection. Connections that were shut down, or
    /// released after [`HttpClientConnectionManager::close`], are closed
    /// instead of pooled.
    ///
    /// # Errors
    ///
    /// [`HttpError::Precondition`] for a connection from another manager,
    /// one already released, or one whose stream has not completed yet; the
    /// pool is left untouched.
    pub fn release_connection(&self, connection: &HttpClientConnection) -> HttpResult<()> {
        let lease = connection.lease();
        if !lease.belongs_to(&self.shared) {
            warn!(connection = connection.id(), "ignoring release of a foreign connection");
            return Err(HttpError::precondition(
                "connection was not leased from this manager",
            ));
        }
        if lease.is_released() {
            warn!(connection = connection.id(), "ignoring repeated release");
            return Err(HttpError::precondition("connection was already released"));
        }
        let streams = lease.active_streams();
        if streams > 0 {
            warn!(
                connection = connection.id(),
                streams, "ignoring release of a connection with an active stream"
            );
            return Err(HttpError::precondition(
                "connection still has an active stream",
            ));
        }
        if !lease.release() {
            warn!(connection = connection.id(), "ignoring repeated release");
            return Err(HttpError::precondition("connection was already released"));
        }
        Ok(())
    }

    /// Stops admitting acquisitions, fails the pending ones and closes idle
    /// connections. Shutdown completes once every leased connection was
    /// released. Idempotent.
    pub fn close(&self) {
        self.shared.close();
    }

    /// Safe to call before or after [`HttpClientConnectionManager::close`].
    #[must_use]
    pub fn wait_for_shutdown(&self) -> ShutdownWait {
        self.shared.shutdown.listen()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        lock_or_recover(&self.shared.state).closing
    }

    #[must_use]
    pub fn metrics(&self) -> PoolMetrics {
        lock_or_recover(&self.shared.state).metrics()
    }

    #[must_use]
    pub fn options(&self) -> &ConnectionManagerOptions {
        &self.shared.options
    }
}

impl Drop for HttpClientConnectionManager {
    fn drop(&mut self) {
        self.shared.close();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tracing_test::traced_test;

    use super::*;
    use crate::engine::testing::ManualEngine;

    fn manager(engine: &ManualEngine, max: usize) -> HttpClientConnectionManager {
        let options = ConnectionManagerOptions::builder("http://pool.test")
            .max_connections(max)
            .build()
            .expect("options");
        HttpClientConnectionManager::with_engine(options, Arc::new(engine.clone()))
            .expect("manager")
    }

    /// WHY: a closed engine must refuse new dependents.
    /// WHAT: building on a closed engine fails with `ResourceClosed`.
    #[test]
    fn refuses_closed_engine() {
        let engine = ManualEngine::new();
        engine.close();
        let options = ConnectionManagerOptions::builder("http://pool.test")
            .build()
            .expect("options");
        let result = HttpClientConnectionManager::with_engine(options, Arc::new(engine));
        assert!(matches!(result, Err(HttpError::ResourceClosed(_))));
    }

    #[test]
    fn new_requires_a_bootstrap() {
        let options = ConnectionManagerOptions::builder("http://pool.test")
            .build()
            .expect("options");
        assert!(matches!(
            HttpClientConnectionManager::new(options),
            Err(HttpError::Config(ConfigError::MissingBootstrap))
        ));
    }

    /// WHY: the pool must reuse idle connections instead of dialing again.
    /// WHAT: release then acquire hands back the same connection id.
    #[test]
    #[traced_test]
    fn released_connection_is_reused() {
        let engine = ManualEngine::new();
        let manager = manager(&engine, 2);

        let acquisition = manager.acquire_connection();
        assert!(engine.wait_for_connects(1, Duration::from_secs(1)));
        engine.succeed_next().expect("connection");
        let first = acquisition.wait().expect("leased");
        let id = first.id();

        manager.release_connection(&first).expect("released");
        assert_eq!(manager.metrics().available, 1);

        let second = manager.acquire_connection().wait().expect("leased again");
        assert_eq!(second.id(), id);
        assert_eq!(engine.pending_connects(), 0);
        assert_eq!(manager.metrics().leased, 1);
    }

    /// WHY: one engine failure must resolve exactly one waiter.
    /// WHAT: with two waiters, one failure fails the oldest and a fresh
    /// attempt covers the other.
    #[test]
    fn connect_failure_goes_to_the_oldest_waiter() {
        let engine = ManualEngine::new();
        let manager = manager(&engine, 1);

        let first = manager.acquire_connection();
        let mut second = manager.acquire_connection();
        assert!(engine.wait_for_connects(1, Duration::from_secs(1)));
        assert!(engine.fail_next(ErrorCode::CONNECTION_REFUSED));

        let err = first.wait().expect_err("first fails");
        assert_eq!(err.code(), Some(ErrorCode::CONNECTION_REFUSED));
        assert!(second.wait_timeout(Duration::from_millis(20)).is_err());

        assert!(engine.wait_for_connects(1, Duration::from_secs(1)));
        engine.succeed_next().expect("connection");
        assert!(second.wait_timeout(Duration::from_secs(1)).is_ok());
    }

    /// WHY: a TLS context closed under a running manager must stay usable
    /// until that manager shuts down.
    /// WHAT: the context's shutdown waits for the manager, and new managers
    /// on the closed context are refused.
    #[cfg(feature = "ssl-rustls")]
    #[test]
    fn tls_context_waits_for_its_managers() {
        use crate::engine::{TlsContext, TlsContextOptions};

        let engine = ManualEngine::new();
        let tls = TlsContext::new(TlsContextOptions::default_client()).expect("tls context");
        let options = ConnectionManagerOptions::builder("https://pool.test")
            .tls_context(tls.clone())
            .build()
            .expect("options");
        let manager =
            HttpClientConnectionManager::with_engine(options.clone(), Arc::new(engine.clone()))
                .expect("manager");

        tls.close();
        assert!(tls
            .wait_for_shutdown()
            .wait_timeout(Duration::from_millis(50))
            .is_none());
        assert!(matches!(
            HttpClientConnectionManager::with_engine(options, Arc::new(engine.clone())),
            Err(HttpError::ResourceClosed("tls context"))
        ));

        manager.close();
        assert!(tls
            .wait_for_shutdown()
            .wait_timeout(Duration::from_secs(1))
            .is_some());
        assert_eq!(engine.active_holds(), 0);
    }

    #[test]
    fn metrics_track_pending_and_connecting() {
        let engine = ManualEngine::new();
        let manager = manager(&engine, 1);

        let _a = manager.acquire_connection();
        let _b = manager.acquire_connection();
        let metrics = manager.metrics();
        assert_eq!(metrics.pending, 2);
        assert_eq!(metrics.connecting, 1);
        assert_eq!(metrics.live, 1);
    }
}
