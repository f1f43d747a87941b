use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crate::errors::{ErrorCode, HttpError};
use crate::synca::{lock_or_recover, Dependents, RunOnDrop, ShutdownSignal, ShutdownWait};

use super::channel::{H1Channel, READ_TICK};
use super::{
    transport, ConnectParams, ConnectResult, EngineConnection, EngineFailure, EngineHold,
    EventLoopGroup, HostResolver, HostResolverOptions, OnceCallback, Task, TransportEngine,
};

/// A child resource and whether the bootstrap is responsible for closing it.
#[derive(Debug, Clone)]
enum Held<T> {
    /// Created by the bootstrap; closed when the bootstrap tears down.
    Owned(T),
    /// Handed in by the caller; never closed by the bootstrap.
    Borrowed(T),
}

impl<T> Held<T> {
    fn get(&self) -> &T {
        match self {
            Self::Owned(value) | Self::Borrowed(value) => value,
        }
    }

    fn owned(&self) -> Option<&T> {
        match self {
            Self::Owned(value) => Some(value),
            Self::Borrowed(_) => None,
        }
    }
}

struct BootstrapInner {
    event_loops: Held<EventLoopGroup>,
    resolver: Held<HostResolver>,
    /// Keeps the resolver open until teardown.
    resolver_hold: Mutex<Option<EngineHold>>,
    dependents: Dependents,
    next_connection: AtomicU64,
    shutdown: ShutdownSignal,
}

impl BootstrapInner {
    fn release_hold(&self) {
        self.dependents.release(|| self.teardown());
    }

    fn teardown(&self) {
        lock_or_recover(&self.resolver_hold).take();
        if let Some(resolver) = self.resolver.owned() {
            resolver.close();
        }
        if let Some(group) = self.event_loops.owned() {
            group.close();
        }
        info!("client bootstrap torn down");
        self.shutdown.signal();
    }
}

impl Drop for BootstrapInner {
    fn drop(&mut self) {
        self.dependents.close(|| self.teardown());
    }
}

/// Binds an [`EventLoopGroup`] and a [`HostResolver`] into the engine that
/// opens connections.
///
/// Teardown waits for every dependent hold (connection managers, connect
/// attempts in flight) to be released, then closes only the children this
/// bootstrap created itself.
#[derive(Clone)]
pub struct ClientBootstrap {
    inner: Arc<BootstrapInner>,
}

impl std::fmt::Debug for ClientBootstrap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientBootstrap")
            .field("owns_event_loops", &self.inner.event_loops.owned().is_some())
            .field("owns_resolver", &self.inner.resolver.owned().is_some())
            .field("holds", &self.inner.dependents.count())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl ClientBootstrap {
    fn from_parts(
        event_loops: Held<EventLoopGroup>,
        resolver: Held<HostResolver>,
    ) -> Result<Self, HttpError> {
        let Some(resolver_hold) = resolver.get().hold() else {
            return Err(HttpError::ResourceClosed("host resolver"));
        };
        Ok(Self {
            inner: Arc::new(BootstrapInner {
                event_loops,
                resolver,
                resolver_hold: Mutex::new(Some(resolver_hold)),
                dependents: Dependents::new(),
                next_connection: AtomicU64::new(1),
                shutdown: ShutdownSignal::new("client bootstrap"),
            }),
        })
    }

    /// Uses caller-provided resources; the bootstrap never closes them.
    ///
    /// # Errors
    ///
    /// [`HttpError::ResourceClosed`] when either resource is already closed.
    pub fn new(group: &EventLoopGroup, resolver: &HostResolver) -> Result<Self, HttpError> {
        if group.is_closed() {
            return Err(HttpError::ResourceClosed("event loop group"));
        }
        if resolver.is_closed() {
            return Err(HttpError::ResourceClosed("host resolver"));
        }

        Self::from_parts(
            Held::Borrowed(group.clone()),
            Held::Borrowed(resolver.clone()),
        )
    }

    /// Creates and owns an event loop group of `threads` (0 = one per core)
    /// and a resolver with `resolver_options`.
    ///
    /// # Errors
    ///
    /// Whatever [`EventLoopGroup::new`] or [`HostResolver::new`] returns.
    pub fn create_owned(
        threads: usize,
        resolver_options: HostResolverOptions,
    ) -> Result<Self, HttpError> {
        let group = EventLoopGroup::new(threads)?;
        let resolver = match HostResolver::new(&group, resolver_options) {
            Ok(resolver) => resolver,
            Err(err) => {
                group.close();
                return Err(err);
            }
        };

        Self::from_parts(Held::Owned(group.clone()), Held::Owned(resolver)).inspect_err(|_| {
            group.close();
        })
    }

    /// Owned defaults: one loop per core, default resolver options.
    ///
    /// # Errors
    ///
    /// See [`ClientBootstrap::create_owned`].
    pub fn with_defaults() -> Result<Self, HttpError> {
        Self::create_owned(0, HostResolverOptions::default())
    }

    #[must_use]
    pub fn event_loop_group(&self) -> &EventLoopGroup {
        self.inner.event_loops.get()
    }

    #[must_use]
    pub fn host_resolver(&self) -> &HostResolver {
        self.inner.resolver.get()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.dependents.is_closing()
    }

    /// Stops admitting new work. Teardown happens once the last hold is
    /// released.
    pub fn close(&self) {
        let holds = self.inner.dependents.count();
        if self.inner.dependents.close(|| self.inner.teardown()) {
            debug!(holds, "closing client bootstrap");
        }
    }

    #[must_use]
    pub fn wait_for_shutdown(&self) -> ShutdownWait {
        self.inner.shutdown.listen()
    }
}

impl TransportEngine for ClientBootstrap {
    fn connect(&self, params: ConnectParams, on_connected: OnceCallback<ConnectResult>) {
        let Some(hold) = self.hold() else {
            on_connected.call(Err(EngineFailure::new(
                ErrorCode::EVENT_LOOP_SHUTDOWN,
                "client bootstrap is closed",
            )));
            return;
        };

        let event_loop = self.event_loop_group().next_loop();
        let resolver = self.host_resolver().clone();
        let id = self.inner.next_connection.fetch_add(1, Ordering::Relaxed);

        let spawned = thread::Builder::new()
            .name(format!("foundation-http-connect-{id}"))
            .spawn(move || {
                let _hold = hold;
                let outcome: ConnectResult = transport::connect(&params, &resolver)
                    .and_then(|transport| {
                        transport.set_read_timeout(Some(READ_TICK)).map_err(|err| {
                            EngineFailure::new(ErrorCode::from_io(&err), err.to_string())
                        })?;
                        Ok(transport)
                    })
                    .map(|transport| {
                        info!(connection = id, host = %params.host, port = params.port, "connection established");
                        H1Channel::new(id, event_loop.clone(), transport, &params)
                            as Arc<dyn EngineConnection>
                    });

                if let Err(failure) = &outcome {
                    warn!(connection = id, host = %params.host, "connection failed: {failure}");
                }

                // A closed loop drops the callback, which then reports the shutdown.
                let delivered = event_loop.execute(move || on_connected.call(outcome));
                if !delivered {
                    debug!(connection = id, "event loop closed before connect result delivery");
                }
            });

        if let Err(err) = spawned {
            error!("failed to spawn connect thread: {err}");
        }
    }

    fn schedule(&self, delay: Duration, task: Task) -> bool {
        self.event_loop_group().next_loop().schedule(delay, task)
    }

    fn hold(&self) -> Option<EngineHold> {
        if !self.inner.dependents.acquire(|| self.inner.teardown()) {
            return None;
        }

        let inner = self.inner.clone();
        Some(RunOnDrop::new(
            Box::new(move || inner.release_hold()) as Box<dyn FnOnce() + Send>
        ))
    }
}
