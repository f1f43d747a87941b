use std::time::Duration;

use url::{Host, Url};
use zeroize::Zeroizing;

use crate::engine::{ClientBootstrap, ConnectParams, SocketOptions, TlsContext};
use crate::errors::ConfigError;

/// The window a stream starts with when nothing else is configured.
pub const DEFAULT_INITIAL_WINDOW_SIZE: u64 = 65_535;
pub const DEFAULT_MAX_CONNECTIONS: usize = 16;

/// An HTTP proxy every connection of a manager goes through.
///
/// Plain `http` targets are forwarded with absolute-form request targets;
/// `https` targets, or any target when [`ProxyOptions::tunneling`] is set, are
/// reached through a `CONNECT` tunnel.
#[derive(Clone)]
pub struct ProxyOptions {
    host: String,
    port: u16,
    tunneling: bool,
    credentials: Option<(String, Zeroizing<String>)>,
}

impl std::fmt::Debug for ProxyOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyOptions")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("tunneling", &self.tunneling)
            .field("username", &self.credentials.as_ref().map(|(user, _)| user))
            .finish()
    }
}

impl ProxyOptions {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            tunneling: false,
            credentials: None,
        }
    }

    #[must_use]
    pub fn basic_auth(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.credentials = Some((username.into(), Zeroizing::new(password.into())));
        self
    }

    /// Tunnels plain HTTP targets too instead of forwarding them.
    #[must_use]
    pub fn tunneling(mut self, enabled: bool) -> Self {
        self.tunneling = enabled;
        self
    }

    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }

    #[must_use]
    pub fn is_tunneling(&self) -> bool {
        self.tunneling
    }

    #[must_use]
    pub fn credentials(&self) -> Option<(&str, &str)> {
        self.credentials
            .as_ref()
            .map(|(user, pass)| (user.as_str(), pass.as_str()))
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.host.trim().is_empty() {
            return Err(ConfigError::InvalidProxy("proxy host is empty".into()));
        }
        if self.port == 0 {
            return Err(ConfigError::InvalidProxy("proxy port must be non-zero".into()));
        }
        if let Some((user, _)) = &self.credentials {
            if user.contains(':') {
                return Err(ConfigError::InvalidProxy(
                    "proxy username must not contain ':'".into(),
                ));
            }
        }
        Ok(())
    }
}

/// Throughput thresholds below which a connection counts as unhealthy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonitoringOptions {
    minimum_throughput_bytes_per_second: u64,
    allowable_throughput_failure_interval: Duration,
}

impl MonitoringOptions {
    /// # Errors
    ///
    /// [`ConfigError::InvalidMonitoring`] when the minimum is zero or the
    /// interval is shorter than one second.
    pub fn new(
        minimum_throughput_bytes_per_second: u64,
        allowable_throughput_failure_interval: Duration,
    ) -> Result<Self, ConfigError> {
        if minimum_throughput_bytes_per_second == 0 {
            return Err(ConfigError::InvalidMonitoring(
                "minimum throughput must be greater than 0".into(),
            ));
        }
        if allowable_throughput_failure_interval < Duration::from_secs(1) {
            return Err(ConfigError::InvalidMonitoring(
                "allowable failure interval must be at least one second".into(),
            ));
        }

        Ok(Self {
            minimum_throughput_bytes_per_second,
            allowable_throughput_failure_interval,
        })
    }

    #[must_use]
    pub fn minimum_throughput_bytes_per_second(&self) -> u64 {
        self.minimum_throughput_bytes_per_second
    }

    #[must_use]
    pub fn allowable_throughput_failure_interval(&self) -> Duration {
        self.allowable_throughput_failure_interval
    }
}

/// Validated, immutable configuration of a connection manager.
#[derive(Debug, Clone)]
pub struct ConnectionManagerOptions {
    uri: Url,
    host: String,
    port: u16,
    bootstrap: Option<ClientBootstrap>,
    tls: Option<TlsContext>,
    tls_server_name: Option<String>,
    socket: SocketOptions,
    initial_window_size: u64,
    max_connections: usize,
    manual_window_management: bool,
    proxy: Option<ProxyOptions>,
    monitoring: Option<MonitoringOptions>,
    idle_timeout: Option<Duration>,
}

impl ConnectionManagerOptions {
    pub fn builder(uri: impl Into<String>) -> ConnectionManagerOptionsBuilder {
        ConnectionManagerOptionsBuilder {
            uri: uri.into(),
            bootstrap: None,
            tls: None,
            tls_server_name: None,
            socket: SocketOptions::default(),
            initial_window_size: DEFAULT_INITIAL_WINDOW_SIZE,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            manual_window_management: false,
            proxy: None,
            monitoring: None,
            idle_timeout: None,
        }
    }

    #[must_use]
    pub fn uri(&self) -> &Url {
        &self.uri
    }

    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }

    #[must_use]
    pub fn bootstrap(&self) -> Option<&ClientBootstrap> {
        self.bootstrap.as_ref()
    }

    #[must_use]
    pub fn tls_context(&self) -> Option<&TlsContext> {
        self.tls.as_ref()
    }

    #[must_use]
    pub fn socket_options(&self) -> &SocketOptions {
        &self.socket
    }

    #[must_use]
    pub fn initial_window_size(&self) -> u64 {
        self.initial_window_size
    }

    #[must_use]
    pub fn max_connections(&self) -> usize {
        self.max_connections
    }

    #[must_use]
    pub fn manual_window_management(&self) -> bool {
        self.manual_window_management
    }

    #[must_use]
    pub fn proxy(&self) -> Option<&ProxyOptions> {
        self.proxy.as_ref()
    }

    #[must_use]
    pub fn monitoring(&self) -> Option<&MonitoringOptions> {
        self.monitoring.as_ref()
    }

    #[must_use]
    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout
    }

    pub(crate) fn connect_params(&self) -> ConnectParams {
        ConnectParams {
            host: self.host.clone(),
            port: self.port,
            tls: self.tls.clone(),
            tls_server_name: self.tls_server_name.clone(),
            socket: self.socket.clone(),
            proxy: self.proxy.clone(),
            monitoring: self.monitoring,
        }
    }
}

#[derive(Debug)]
pub struct ConnectionManagerOptionsBuilder {
    uri: String,
    bootstrap: Option<ClientBootstrap>,
    tls: Option<TlsContext>,
    tls_server_name: Option<String>,
    socket: SocketOptions,
    initial_window_size: u64,
    max_connections: usize,
    manual_window_management: bool,
    proxy: Option<ProxyOptions>,
    monitoring: Option<MonitoringOptions>,
    idle_timeout: Option<Duration>,
}

impl ConnectionManagerOptionsBuilder {
    #[must_use]
    pub fn bootstrap(mut self, bootstrap: ClientBootstrap) -> Self {
        self.bootstrap = Some(bootstrap);
        self
    }

    #[must_use]
    pub fn tls_context(mut self, tls: TlsContext) -> Self {
        self.tls = Some(tls);
        self
    }

    /// Overrides the name used for SNI and certificate checks.
    #[must_use]
    pub fn tls_server_name(mut self, name: impl Into<String>) -> Self {
        self.tls_server_name = Some(name.into());
        self
    }

    #[must_use]
    pub fn socket_options(mut self, socket: SocketOptions) -> Self {
        self.socket = socket;
        self
    }

    #[must_use]
    pub fn initial_window_size(mut self, size: u64) -> Self {
        self.initial_window_size = size;
        self
    }

    #[must_use]
    pub fn max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    #[must_use]
    pub fn manual_window_management(mut self, enabled: bool) -> Self {
        self.manual_window_management = enabled;
        self
    }

    #[must_use]
    pub fn proxy(mut self, proxy: ProxyOptions) -> Self {
        self.proxy = Some(proxy);
        self
    }

    #[must_use]
    pub fn monitoring(mut self, monitoring: MonitoringOptions) -> Self {
        self.monitoring = Some(monitoring);
        self
    }

    /// Closes connections that sat idle in the pool this long. Zero
    /// disables expiry.
    #[must_use]
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = Some(timeout);
        self
    }

    /// # Errors
    ///
    /// A [`ConfigError`] naming the first invalid setting.
    pub fn build(self) -> Result<ConnectionManagerOptions, ConfigError> {
        let uri = Url::parse(&self.uri)?;

        let secure = match uri.scheme() {
            "http" => false,
            "https" => true,
            other => return Err(ConfigError::UnsupportedScheme(other.to_string())),
        };

        let host = match uri.host() {
            Some(Host::Domain(domain)) if !domain.is_empty() => domain.to_string(),
            Some(Host::Ipv4(addr)) => addr.to_string(),
            Some(Host::Ipv6(addr)) => addr.to_string(),
            _ => return Err(ConfigError::MissingHost(self.uri)),
        };
        let port = uri
            .port_or_known_default()
            .ok_or_else(|| ConfigError::InvalidUri(self.uri.clone()))?;

        if secure && self.tls.is_none() {
            return Err(ConfigError::TlsRequired(self.uri));
        }
        if self.initial_window_size == 0 {
            return Err(ConfigError::InvalidWindowSize);
        }
        if self.max_connections == 0 {
            return Err(ConfigError::InvalidMaxConnections);
        }
        if let Some(proxy) = &self.proxy {
            proxy.validate()?;
        }

        Ok(ConnectionManagerOptions {
            uri,
            host,
            port,
            bootstrap: self.bootstrap,
            tls: if secure { self.tls } else { None },
            tls_server_name: self.tls_server_name,
            socket: self.socket,
            initial_window_size: self.initial_window_size,
            max_connections: self.max_connections,
            manual_window_management: self.manual_window_management,
            proxy: self.proxy,
            monitoring: self.monitoring,
            idle_timeout: self.idle_timeout.filter(|timeout| !timeout.is_zero()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_applied() {
        let options = ConnectionManagerOptions::builder("http://example.test")
            .build()
            .expect("options");
        assert_eq!(options.host(), "example.test");
        assert_eq!(options.port(), 80);
        assert_eq!(options.max_connections(), DEFAULT_MAX_CONNECTIONS);
        assert_eq!(options.initial_window_size(), DEFAULT_INITIAL_WINDOW_SIZE);
        assert!(!options.manual_window_management());
        assert!(options.idle_timeout().is_none());
    }

    #[test]
    fn rejects_invalid_combinations() {
        assert!(matches!(
            ConnectionManagerOptions::builder("not a uri").build(),
            Err(ConfigError::InvalidUri(_))
        ));
        assert!(matches!(
            ConnectionManagerOptions::builder("ftp://example.test").build(),
            Err(ConfigError::UnsupportedScheme(_))
        ));
        assert!(matches!(
            ConnectionManagerOptions::builder("https://example.test").build(),
            Err(ConfigError::TlsRequired(_))
        ));
        assert!(matches!(
            ConnectionManagerOptions::builder("http://example.test")
                .initial_window_size(0)
                .build(),
            Err(ConfigError::InvalidWindowSize)
        ));
        assert!(matches!(
            ConnectionManagerOptions::builder("http://example.test")
                .max_connections(0)
                .build(),
            Err(ConfigError::InvalidMaxConnections)
        ));
        assert!(matches!(
            ConnectionManagerOptions::builder("http://example.test")
                .proxy(ProxyOptions::new("", 3128))
                .build(),
            Err(ConfigError::InvalidProxy(_))
        ));
    }

    #[test]
    fn ipv6_hosts_lose_their_brackets() {
        let options = ConnectionManagerOptions::builder("http://[::1]:8080/")
            .build()
            .expect("options");
        assert_eq!(options.host(), "::1");
        assert_eq!(options.connect_params().authority(), "[::1]:8080");
    }

    #[test]
    fn zero_idle_timeout_disables_expiry() {
        let options = ConnectionManagerOptions::builder("http://example.test")
            .idle_timeout(Duration::ZERO)
            .build()
            .expect("options");
        assert!(options.idle_timeout().is_none());
    }

    #[test]
    fn monitoring_thresholds_are_validated() {
        assert!(MonitoringOptions::new(0, Duration::from_secs(2)).is_err());
        assert!(MonitoringOptions::new(10, Duration::from_millis(10)).is_err());
        assert!(MonitoringOptions::new(10, Duration::from_secs(2)).is_ok());
    }

    #[test]
    fn proxy_debug_hides_the_password() {
        let proxy = ProxyOptions::new("proxy.test", 3128).basic_auth("user", "hunter2");
        let printed = format!("{proxy:?}");
        assert!(printed.contains("user"));
        assert!(!printed.contains("hunter2"));
    }
}
