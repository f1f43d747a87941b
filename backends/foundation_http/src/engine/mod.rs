//! The engine boundary and its one concrete adapter.
//!
//! The pool and stream layers above only ever talk to a [`TransportEngine`]
//! (to open connections and run timers) and to [`EngineConnection`]s (to
//! submit exchanges). Responses flow back through the [`ExchangeSink`] each
//! exchange carries, always on an engine thread.
//!
//! [`ClientBootstrap`] is the production engine: event loop threads, a caching
//! resolver, optional rustls, and an HTTP/1.1 channel per connection.
//! [`testing::ManualEngine`] is a scripted engine for exercising the pool
//! without sockets.

mod bootstrap;
mod channel;
mod event_loop;
mod h1;
mod monitor;
mod resolver;
mod socket;
pub mod testing;
mod tls;
mod transport;

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use crate::errors::ErrorCode;
use crate::http::{HeaderBlock, Headers, MonitoringOptions, ProxyOptions, Request};
use crate::synca::{Completer, RunOnDrop};

pub use bootstrap::ClientBootstrap;
pub use event_loop::{EventLoop, EventLoopGroup, Task};
pub use resolver::{
    AddressSource, HostResolver, HostResolverOptions, StaticAddressSource, SystemAddressSource,
};
pub use socket::SocketOptions;
pub use tls::{RootCertificates, TlsContext, TlsContextOptions};

pub type ConnectionId = u64;
pub type ExchangeId = u64;

/// A failure reported by the engine, tagged with its numeric code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineFailure {
    pub code: ErrorCode,
    pub message: String,
}

impl EngineFailure {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl std::error::Error for EngineFailure {}

impl core::fmt::Display for EngineFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

/// Callback surface of one exchange. Every method runs on an engine thread,
/// in response order, and nothing is called after `on_complete`.
pub trait ExchangeSink: Send + Sync {
    fn on_headers(&self, block: HeaderBlock, status: u16, headers: &Headers);

    fn on_headers_done(&self, block: HeaderBlock);

    /// Returns how many bytes the flow-control window grows by. Ignored when
    /// the exchange runs without a window.
    fn on_body(&self, data: &[u8]) -> u64;

    fn on_complete(&self, code: ErrorCode);
}

/// One request handed to an [`EngineConnection`].
pub struct Exchange {
    pub request: Request,
    pub sink: Arc<dyn ExchangeSink>,
    /// `Some(initial)` runs the exchange with a manual flow-control window.
    pub window: Option<u64>,
}

impl std::fmt::Debug for Exchange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Exchange")
            .field("request", &self.request)
            .field("window", &self.window)
            .finish()
    }
}

/// Resolved once a chunk was written to the transport.
pub type ChunkCompleter = Completer<Result<(), ErrorCode>>;

/// One live transport connection.
pub trait EngineConnection: Send + Sync {
    fn id(&self) -> ConnectionId;

    /// False once the connection was shut down, failed, or the peer asked to
    /// close it. Closed connections are never reused.
    fn is_open(&self) -> bool;

    /// Queues an exchange. Exchanges on one connection run one at a time in
    /// submission order.
    ///
    /// # Errors
    ///
    /// An [`EngineFailure`] when the connection can no longer admit work.
    fn submit(&self, exchange: Exchange) -> Result<ExchangeId, EngineFailure>;

    fn write_chunk(&self, exchange: ExchangeId, data: Bytes, is_final: bool, done: ChunkCompleter);

    fn update_window(&self, exchange: ExchangeId, increment: u64);

    /// Ends the exchange with `code`. An exchange already on the wire takes
    /// the connection down with it.
    fn cancel(&self, exchange: ExchangeId, code: ErrorCode);

    /// Closes the connection; every unfinished exchange completes with `code`.
    fn shutdown(&self, code: ErrorCode);
}

pub type ConnectResult = Result<Arc<dyn EngineConnection>, EngineFailure>;

/// A callback that runs exactly once. If it is dropped uncalled, for example
/// because the event loop that should have run it was closed, it runs with
/// the fallback value instead.
pub struct OnceCallback<T> {
    callback: Option<Box<dyn FnOnce(T) + Send>>,
    fallback: fn() -> T,
}

impl<T> std::fmt::Debug for OnceCallback<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OnceCallback")
            .field("pending", &self.callback.is_some())
            .finish()
    }
}

impl<T> OnceCallback<T> {
    pub fn new(callback: impl FnOnce(T) + Send + 'static, fallback: fn() -> T) -> Self {
        Self {
            callback: Some(Box::new(callback)),
            fallback,
        }
    }

    pub fn call(mut self, value: T) {
        if let Some(callback) = self.callback.take() {
            callback(value);
        }
    }
}

impl<T> Drop for OnceCallback<T> {
    fn drop(&mut self) {
        if let Some(callback) = self.callback.take() {
            callback((self.fallback)());
        }
    }
}

pub(crate) fn shutdown_failure() -> ConnectResult {
    Err(EngineFailure::new(
        ErrorCode::EVENT_LOOP_SHUTDOWN,
        "engine shut down before the connection attempt finished",
    ))
}

/// Keeps an engine from tearing down while held; dropping it releases the
/// hold.
pub type EngineHold = RunOnDrop<Box<dyn FnOnce() + Send>>;

/// What the pool needs from an engine.
pub trait TransportEngine: Send + Sync {
    /// Starts a connection attempt; `on_connected` runs on an engine thread.
    fn connect(&self, params: ConnectParams, on_connected: OnceCallback<ConnectResult>);

    /// Runs `task` after `delay` on an engine thread. False when the engine
    /// is shutting down and the task was dropped.
    fn schedule(&self, delay: Duration, task: Task) -> bool;

    /// Registers a dependent. Returns `None` once the engine is closing.
    fn hold(&self) -> Option<EngineHold>;
}

/// Everything needed to open one transport connection.
#[derive(Debug, Clone)]
pub struct ConnectParams {
    pub host: String,
    pub port: u16,
    pub tls: Option<TlsContext>,
    /// SNI and certificate name; defaults to `host`.
    pub tls_server_name: Option<String>,
    pub socket: SocketOptions,
    pub proxy: Option<ProxyOptions>,
    pub monitoring: Option<MonitoringOptions>,
}

impl ConnectParams {
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            tls: None,
            tls_server_name: None,
            socket: SocketOptions::default(),
            proxy: None,
            monitoring: None,
        }
    }

    /// True when traffic goes through a `CONNECT` tunnel: always for TLS
    /// targets behind a proxy, otherwise only when the proxy asks for it.
    #[must_use]
    pub fn tunnels(&self) -> bool {
        match &self.proxy {
            Some(proxy) => self.tls.is_some() || proxy.is_tunneling(),
            None => false,
        }
    }

    /// True when plain requests are forwarded to the proxy in absolute form.
    #[must_use]
    pub fn forwards(&self) -> bool {
        self.proxy.is_some() && !self.tunnels()
    }

    #[must_use]
    pub fn server_name(&self) -> String {
        self.tls_server_name
            .clone()
            .unwrap_or_else(|| self.host.clone())
    }

    /// `host[:port]` as used in the `Host` header; default ports are omitted.
    #[must_use]
    pub fn authority(&self) -> String {
        let default_port = if self.tls.is_some() { 443 } else { 80 };
        let host = if self.host.contains(':') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        };

        if self.port == default_port {
            host
        } else {
            format!("{host}:{}", self.port)
        }
    }

    pub(crate) fn scheme(&self) -> &'static str {
        if self.tls.is_some() {
            "https"
        } else {
            "http"
        }
    }
}
