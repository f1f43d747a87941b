use std::collections::HashMap;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::errors::{ErrorCode, HttpError};
use crate::synca::{lock_or_recover, Dependents, RunOnDrop, ShutdownSignal, ShutdownWait};

use super::{EngineFailure, EngineHold, EventLoopGroup};

const DEFAULT_TTL: Duration = Duration::from_secs(300);
const DEFAULT_MAX_ENTRIES: usize = 128;

/// Where addresses come from when the cache misses.
///
/// Allows pluggable lookups for tests and custom name services.
pub trait AddressSource: Send + Sync {
    /// # Errors
    ///
    /// Returns an [`EngineFailure`] carrying [`ErrorCode::DNS_FAILURE`] when
    /// the host cannot be resolved.
    fn lookup(&self, host: &str, port: u16) -> Result<Vec<SocketAddr>, EngineFailure>;
}

/// Lookups through the operating system resolver.
#[derive(Debug, Clone, Default)]
pub struct SystemAddressSource;

impl AddressSource for SystemAddressSource {
    fn lookup(&self, host: &str, port: u16) -> Result<Vec<SocketAddr>, EngineFailure> {
        if host.is_empty() {
            return Err(EngineFailure::new(ErrorCode::DNS_FAILURE, "empty host name"));
        }

        let addrs: Vec<SocketAddr> = (host, port)
            .to_socket_addrs()
            .map_err(|err| {
                EngineFailure::new(
                    ErrorCode::DNS_FAILURE,
                    format!("resolution failed for {host}: {err}"),
                )
            })?
            .collect();

        if addrs.is_empty() {
            return Err(EngineFailure::new(
                ErrorCode::DNS_FAILURE,
                format!("no addresses found for {host}"),
            ));
        }
        Ok(addrs)
    }
}

/// Fixed host to address table; hosts missing from it fail resolution.
#[derive(Debug, Clone, Default)]
pub struct StaticAddressSource {
    entries: HashMap<String, Vec<SocketAddr>>,
}

impl StaticAddressSource {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_host(mut self, host: &str, addrs: Vec<SocketAddr>) -> Self {
        self.entries.insert(host.to_ascii_lowercase(), addrs);
        self
    }
}

impl AddressSource for StaticAddressSource {
    fn lookup(&self, host: &str, port: u16) -> Result<Vec<SocketAddr>, EngineFailure> {
        self.entries
            .get(&host.to_ascii_lowercase())
            .map(|addrs| {
                addrs
                    .iter()
                    .map(|addr| SocketAddr::new(addr.ip(), port))
                    .collect()
            })
            .ok_or_else(|| {
                EngineFailure::new(ErrorCode::DNS_FAILURE, format!("unknown host {host}"))
            })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostResolverOptions {
    pub ttl: Duration,
    pub max_entries: usize,
}

impl Default for HostResolverOptions {
    fn default() -> Self {
        Self {
            ttl: DEFAULT_TTL,
            max_entries: DEFAULT_MAX_ENTRIES,
        }
    }
}

#[derive(Debug, Clone)]
struct CachedEntry {
    addresses: Vec<SocketAddr>,
    expires_at: Instant,
}

impl CachedEntry {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

struct ResolverInner {
    source: Box<dyn AddressSource>,
    cache: Mutex<HashMap<String, CachedEntry>>,
    options: HostResolverOptions,
    event_loops: Mutex<Option<EventLoopGroup>>,
    dependents: Dependents,
    shutdown: ShutdownSignal,
}

impl ResolverInner {
    fn close(&self) {
        let holds = self.dependents.count();
        if self.dependents.close(|| self.teardown()) && holds > 0 {
            debug!(holds, "host resolver closing once its dependents let go");
        }
    }

    fn teardown(&self) {
        lock_or_recover(&self.cache).clear();
        lock_or_recover(&self.event_loops).take();
        self.shutdown.signal();
    }
}

impl Drop for ResolverInner {
    fn drop(&mut self) {
        self.close();
    }
}

/// Caching host resolver bound to an [`EventLoopGroup`].
///
/// Results are cached per `host:port` for the configured TTL. When the cache
/// is full, expired entries are evicted first, then the entry closest to
/// expiry. Bootstraps using the resolver hold it open: after
/// [`HostResolver::close`] they keep resolving, and shutdown completes once
/// the last of them is gone.
#[derive(Clone)]
pub struct HostResolver {
    inner: Arc<ResolverInner>,
}

impl std::fmt::Debug for HostResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostResolver")
            .field("options", &self.inner.options)
            .field("cached", &self.cache_size())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl HostResolver {
    /// # Errors
    ///
    /// [`HttpError::ResourceClosed`] when `group` is already closed.
    pub fn new(group: &EventLoopGroup, options: HostResolverOptions) -> Result<Self, HttpError> {
        Self::with_source(group, options, SystemAddressSource)
    }

    /// # Errors
    ///
    /// [`HttpError::ResourceClosed`] when `group` is already closed.
    pub fn with_source(
        group: &EventLoopGroup,
        options: HostResolverOptions,
        source: impl AddressSource + 'static,
    ) -> Result<Self, HttpError> {
        if group.is_closed() {
            return Err(HttpError::ResourceClosed("event loop group"));
        }

        Ok(Self {
            inner: Arc::new(ResolverInner {
                source: Box::new(source),
                cache: Mutex::new(HashMap::new()),
                options,
                event_loops: Mutex::new(Some(group.clone())),
                dependents: Dependents::new(),
                shutdown: ShutdownSignal::new("host resolver"),
            }),
        })
    }

    /// Resolves `host:port`, consulting the cache first.
    ///
    /// # Errors
    ///
    /// [`ErrorCode::DNS_FAILURE`] when lookup fails, or
    /// [`ErrorCode::EVENT_LOOP_SHUTDOWN`] once the resolver shut down.
    pub fn resolve(&self, host: &str, port: u16) -> Result<Vec<SocketAddr>, EngineFailure> {
        if self.inner.dependents.is_torn_down() {
            return Err(EngineFailure::new(
                ErrorCode::EVENT_LOOP_SHUTDOWN,
                "host resolver is closed",
            ));
        }

        let key = format!("{}:{port}", host.to_ascii_lowercase());
        let now = Instant::now();

        if let Some(entry) = lock_or_recover(&self.inner.cache).get(&key) {
            if !entry.is_expired(now) {
                return Ok(rotated(&entry.addresses));
            }
        }

        let addresses = self.inner.source.lookup(host, port)?;
        debug!(host, port, count = addresses.len(), "resolved host");

        let mut cache = lock_or_recover(&self.inner.cache);
        if !cache.contains_key(&key) && cache.len() >= self.inner.options.max_entries {
            Self::evict(&mut cache, now);
        }
        if self.inner.options.max_entries > 0 {
            cache.insert(
                key,
                CachedEntry {
                    addresses: addresses.clone(),
                    expires_at: now + self.inner.options.ttl,
                },
            );
        }

        Ok(addresses)
    }

    fn evict(cache: &mut HashMap<String, CachedEntry>, now: Instant) {
        cache.retain(|_, entry| !entry.is_expired(now));
        if cache.is_empty() {
            return;
        }

        let oldest = cache
            .iter()
            .min_by_key(|(_, entry)| entry.expires_at)
            .map(|(key, _)| key.clone());
        if let Some(key) = oldest {
            cache.remove(&key);
        }
    }

    pub fn purge_cache(&self) {
        lock_or_recover(&self.inner.cache).clear();
    }

    #[must_use]
    pub fn cache_size(&self) -> usize {
        lock_or_recover(&self.inner.cache).len()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.dependents.is_closing()
    }

    /// Refuses new dependents. Once none are left the cache is cleared, the
    /// event loop group is let go and the shutdown signal fires.
    pub fn close(&self) {
        self.inner.close();
    }

    /// Keeps the resolver usable until the hold is dropped; `None` once
    /// closed.
    pub(crate) fn hold(&self) -> Option<EngineHold> {
        if !self.inner.dependents.acquire(|| self.inner.teardown()) {
            return None;
        }
        let inner = self.inner.clone();
        Some(RunOnDrop::new(Box::new(move || {
            inner.dependents.release(|| inner.teardown());
        }) as Box<dyn FnOnce() + Send>))
    }

    #[must_use]
    pub fn wait_for_shutdown(&self) -> ShutdownWait {
        self.inner.shutdown.listen()
    }
}

/// Cached hits start at a random address so connections spread across
/// every address a host resolved to.
fn rotated(addresses: &[SocketAddr]) -> Vec<SocketAddr> {
    let mut out = addresses.to_vec();
    if out.len() > 1 {
        let shift = fastrand::usize(..out.len());
        out.rotate_left(shift);
    }
    out
}
