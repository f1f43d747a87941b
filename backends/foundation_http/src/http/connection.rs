use std::sync::{Arc, Mutex};

use crate::engine::{ConnectionId, EngineConnection};
use crate::errors::{ErrorCode, HttpError, HttpResult};
use crate::synca::{lock_or_recover, OneShotFlag};

use super::handler::HttpResponseHandler;
use super::manager::PoolShared;
use super::request::Request;
use super::stream::HttpStream;

/// Streams running on a lease, and whether a release is waiting for them.
#[derive(Default)]
struct LeaseActivity {
    streams: usize,
    parked: bool,
}

/// One lease of a pooled transport connection. The connection goes back to
/// its pool exactly once: on explicit release, on close, or when the last
/// handle (connection clones and streams) is dropped. A release while a
/// stream is still running is parked until that stream completes.
pub(crate) struct Lease {
    engine: Arc<dyn EngineConnection>,
    pool: Arc<PoolShared>,
    window: Option<u64>,
    released: OneShotFlag,
    activity: Mutex<LeaseActivity>,
}

impl Lease {
    pub(crate) fn engine(&self) -> &Arc<dyn EngineConnection> {
        &self.engine
    }

    pub(crate) fn id(&self) -> ConnectionId {
        self.engine.id()
    }

    pub(crate) fn initial_window(&self) -> Option<u64> {
        self.window
    }

    pub(crate) fn is_released(&self) -> bool {
        self.released.is_fired()
    }

    pub(crate) fn belongs_to(&self, pool: &Arc<PoolShared>) -> bool {
        Arc::ptr_eq(&self.pool, pool)
    }

    pub(crate) fn active_streams(&self) -> usize {
        lock_or_recover(&self.activity).streams
    }

    /// Registers an activated stream; false once the lease was released.
    pub(crate) fn begin_stream(&self) -> bool {
        let mut activity = lock_or_recover(&self.activity);
        if self.released.is_fired() {
            return false;
        }
        activity.streams += 1;
        true
    }

    /// Called once per stream registered with [`Lease::begin_stream`].
    pub(crate) fn end_stream(&self) {
        let reclaim = {
            let mut activity = lock_or_recover(&self.activity);
            activity.streams = activity.streams.saturating_sub(1);
            let reclaim = activity.streams == 0 && activity.parked;
            if reclaim {
                activity.parked = false;
            }
            reclaim
        };
        if reclaim {
            debug!(connection = self.engine.id(), "parked release completed");
            self.pool.reclaim(self.engine.clone());
        }
    }

    /// Returns the connection to the pool; false if that already happened.
    pub(crate) fn release(&self) -> bool {
        if !self.released.fire() {
            return false;
        }
        {
            let mut activity = lock_or_recover(&self.activity);
            if activity.streams > 0 {
                debug!(
                    connection = self.engine.id(),
                    streams = activity.streams,
                    "release parked until the active stream completes"
                );
                activity.parked = true;
                return true;
            }
        }
        self.pool.reclaim(self.engine.clone());
        true
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if self.release() {
            debug!(connection = self.engine.id(), "lease dropped without release");
        }
    }
}

/// A connection leased from an
/// [`HttpClientConnectionManager`](super::HttpClientConnectionManager).
///
/// Clones share the same lease.
#[derive(Clone)]
pub struct HttpClientConnection {
    lease: Arc<Lease>,
}

impl std::fmt::Debug for HttpClientConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpClientConnection")
            .field("id", &self.id())
            .field("open", &self.is_open())
            .field("released", &self.lease.is_released())
            .finish()
    }
}

impl HttpClientConnection {
    pub(crate) fn leased(
        engine: Arc<dyn EngineConnection>,
        pool: Arc<PoolShared>,
        window: Option<u64>,
    ) -> Self {
        Self {
            lease: Arc::new(Lease {
                engine,
                pool,
                window,
                released: OneShotFlag::new(),
                activity: Mutex::new(LeaseActivity::default()),
            }),
        }
    }

    pub(crate) fn lease(&self) -> &Arc<Lease> {
        &self.lease
    }

    /// Binds `request` and `handler` to a new stream. Nothing is sent until
    /// [`HttpStream::activate`].
    ///
    /// # Errors
    ///
    /// [`HttpError::ResourceClosed`] once this lease was released.
    pub fn make_request(
        &self,
        request: Request,
        handler: impl HttpResponseHandler,
    ) -> HttpResult<HttpStream> {
        if self.lease.is_released() {
            return Err(HttpError::ResourceClosed("connection"));
        }
        Ok(HttpStream::new(self.lease.clone(), request, Box::new(handler)))
    }

    /// Releases the lease back to the pool. Idempotent. With a stream still
    /// in flight the connection returns once that stream completes.
    pub fn close(&self) {
        self.lease.release();
    }

    /// Closes the transport; the pool discards the connection on release.
    pub fn shutdown(&self) {
        self.lease.engine.shutdown(ErrorCode::CONNECTION_CLOSED);
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        self.lease.engine.is_open()
    }

    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.lease.id()
    }
}
