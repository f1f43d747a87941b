//! TOML description of a client: engine resources plus one pool.
//!
//! ```toml
//! uri = "https://api.example.test"
//!
//! [event_loop]
//! threads = 2
//!
//! [pool]
//! max_connections = 8
//! idle_timeout_ms = 30000
//!
//! [tls]
//! ca_file = "/etc/ssl/private-ca.pem"
//! ```

use std::path::PathBuf;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::engine::{ClientBootstrap, HostResolverOptions, SocketOptions, TlsContext, TlsContextOptions};
use crate::errors::{ConfigError, HttpResult};
use crate::http::{
    ConnectionManagerOptions, HttpClientConnectionManager, MonitoringOptions, ProxyOptions,
    DEFAULT_INITIAL_WINDOW_SIZE, DEFAULT_MAX_CONNECTIONS,
};

/// Reads and parses a TOML file into `T`.
///
/// # Errors
///
/// [`ConfigError::File`] when the file cannot be read and
/// [`ConfigError::Toml`] when it does not parse into `T`.
pub fn from_path<T, V>(target: V) -> Result<T, ConfigError>
where
    T: DeserializeOwned,
    V: Into<PathBuf>,
{
    let content = std::fs::read_to_string(target.into())?;
    from_str(&content)
}

/// # Errors
///
/// [`ConfigError::Toml`] when `content` does not parse into `T`.
pub fn from_str<T: DeserializeOwned>(content: &str) -> Result<T, ConfigError> {
    Ok(toml::from_str(content)?)
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct EventLoopSection {
    /// Zero means one loop per core.
    pub threads: usize,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct ResolverSection {
    pub ttl_secs: u64,
    pub max_entries: usize,
}

impl Default for ResolverSection {
    fn default() -> Self {
        let defaults = HostResolverOptions::default();
        Self {
            ttl_secs: defaults.ttl.as_secs(),
            max_entries: defaults.max_entries,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct PoolSection {
    pub max_connections: usize,
    pub initial_window_size: u64,
    pub manual_window_management: bool,
    /// Zero disables idle expiry.
    pub idle_timeout_ms: u64,
}

impl Default for PoolSection {
    fn default() -> Self {
        Self {
            max_connections: DEFAULT_MAX_CONNECTIONS,
            initial_window_size: DEFAULT_INITIAL_WINDOW_SIZE,
            manual_window_management: false,
            idle_timeout_ms: 0,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct SocketSection {
    pub connect_timeout_ms: Option<u64>,
    pub keep_alive_secs: Option<u64>,
    pub nodelay: Option<bool>,
    pub write_timeout_ms: Option<u64>,
}

impl SocketSection {
    fn options(&self) -> SocketOptions {
        let mut options = SocketOptions::new();
        if let Some(ms) = self.connect_timeout_ms {
            options = options.connect_timeout(Duration::from_millis(ms));
        }
        if let Some(secs) = self.keep_alive_secs {
            options = options.keep_alive(Duration::from_secs(secs));
        }
        if let Some(nodelay) = self.nodelay {
            options = options.nodelay(nodelay);
        }
        if let Some(ms) = self.write_timeout_ms {
            options = options.write_timeout(Duration::from_millis(ms));
        }
        options
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct TlsSection {
    /// PEM bundle replacing the built-in web PKI roots.
    pub ca_file: Option<PathBuf>,
    pub server_name: Option<String>,
    pub verify_peer: bool,
}

impl Default for TlsSection {
    fn default() -> Self {
        Self {
            ca_file: None,
            server_name: None,
            verify_peer: true,
        }
    }
}

impl TlsSection {
    fn context(&self) -> Result<TlsContext, ConfigError> {
        let mut options = TlsContextOptions::default_client().verify_peer(self.verify_peer);
        if let Some(path) = &self.ca_file {
            options = options.with_ca_file(path.clone());
        }
        TlsContext::new(options)
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ProxySection {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub tunneling: bool,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

impl ProxySection {
    fn options(&self) -> ProxyOptions {
        let mut proxy = ProxyOptions::new(self.host.clone(), self.port).tunneling(self.tunneling);
        if let Some(username) = &self.username {
            proxy = proxy.basic_auth(username.clone(), self.password.clone().unwrap_or_default());
        }
        proxy
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct MonitoringSection {
    pub minimum_throughput_bytes_per_second: u64,
    pub allowable_failure_interval_secs: u64,
}

/// A whole client configuration file.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct HttpClientConfig {
    pub uri: String,
    #[serde(default)]
    pub event_loop: EventLoopSection,
    #[serde(default)]
    pub resolver: ResolverSection,
    #[serde(default)]
    pub pool: PoolSection,
    #[serde(default)]
    pub socket: SocketSection,
    /// Required for `https` targets; a missing section then means default
    /// web PKI verification.
    pub tls: Option<TlsSection>,
    pub proxy: Option<ProxySection>,
    pub monitoring: Option<MonitoringSection>,
}

impl HttpClientConfig {
    /// # Errors
    ///
    /// See [`from_path`].
    pub fn from_path(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        from_path(path)
    }

    /// # Errors
    ///
    /// See [`from_str`].
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        from_str(content)
    }

    fn is_secure(&self) -> bool {
        self.uri.trim_start().to_ascii_lowercase().starts_with("https:")
    }

    /// Creates a bootstrap that owns its event loops and resolver.
    ///
    /// # Errors
    ///
    /// Whatever [`ClientBootstrap::create_owned`] returns.
    pub fn build_bootstrap(&self) -> HttpResult<ClientBootstrap> {
        ClientBootstrap::create_owned(
            self.event_loop.threads,
            HostResolverOptions {
                ttl: Duration::from_secs(self.resolver.ttl_secs),
                max_entries: self.resolver.max_entries,
            },
        )
    }

    /// Validated manager options on `bootstrap`.
    ///
    /// # Errors
    ///
    /// The first [`ConfigError`] any section produces.
    pub fn manager_options(
        &self,
        bootstrap: ClientBootstrap,
    ) -> Result<ConnectionManagerOptions, ConfigError> {
        let mut builder = ConnectionManagerOptions::builder(self.uri.clone())
            .bootstrap(bootstrap)
            .socket_options(self.socket.options())
            .initial_window_size(self.pool.initial_window_size)
            .max_connections(self.pool.max_connections)
            .manual_window_management(self.pool.manual_window_management)
            .idle_timeout(Duration::from_millis(self.pool.idle_timeout_ms));

        let tls = match (&self.tls, self.is_secure()) {
            (Some(section), _) => Some(section.clone()),
            (None, true) => Some(TlsSection::default()),
            (None, false) => None,
        };
        if let Some(section) = tls {
            builder = builder.tls_context(section.context()?);
            if let Some(name) = &section.server_name {
                builder = builder.tls_server_name(name.clone());
            }
        }
        if let Some(proxy) = &self.proxy {
            builder = builder.proxy(proxy.options());
        }
        if let Some(monitoring) = &self.monitoring {
            builder = builder.monitoring(MonitoringOptions::new(
                monitoring.minimum_throughput_bytes_per_second,
                Duration::from_secs(monitoring.allowable_failure_interval_secs),
            )?);
        }

        builder.build()
    }

    /// Builds the engine resources and the manager in one go. The bootstrap
    /// is reachable afterwards through
    /// [`ConnectionManagerOptions::bootstrap`].
    ///
    /// # Errors
    ///
    /// Any engine construction or option validation error.
    pub fn build_manager(&self) -> HttpResult<HttpClientConnectionManager> {
        let bootstrap = self.build_bootstrap()?;
        match self.manager_options(bootstrap.clone()) {
            Ok(options) => HttpClientConnectionManager::new(options),
            Err(err) => {
                bootstrap.close();
                Err(err.into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_file_uses_defaults() {
        let config = HttpClientConfig::from_toml(r#"uri = "http://127.0.0.1:9000""#)
            .expect("config");
        assert_eq!(config.pool, PoolSection::default());
        assert_eq!(config.event_loop.threads, 0);
        assert!(config.tls.is_none());
        assert!(config.proxy.is_none());
    }

    #[test]
    fn full_file_parses_every_section() {
        let config = HttpClientConfig::from_toml(
            r#"
            uri = "http://service.test:8080"

            [event_loop]
            threads = 2

            [resolver]
            ttl_secs = 5
            max_entries = 10

            [pool]
            max_connections = 3
            initial_window_size = 1024
            manual_window_management = true
            idle_timeout_ms = 250

            [socket]
            connect_timeout_ms = 500
            nodelay = true

            [proxy]
            host = "proxy.test"
            port = 3128
            username = "user"
            password = "pass"

            [monitoring]
            minimum_throughput_bytes_per_second = 100
            allowable_failure_interval_secs = 2
            "#,
        )
        .expect("config");

        assert_eq!(config.pool.max_connections, 3);
        assert!(config.pool.manual_window_management);
        assert_eq!(config.resolver.ttl_secs, 5);
        assert_eq!(config.socket.connect_timeout_ms, Some(500));
        assert_eq!(config.proxy.as_ref().map(|p| p.port), Some(3128));
        assert_eq!(
            config.monitoring.as_ref().map(|m| m.allowable_failure_interval_secs),
            Some(2)
        );
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = HttpClientConfig::from_toml(
            r#"
            uri = "http://x.test"
            [pool]
            max_conections = 3
            "#,
        )
        .expect_err("typo must fail");
        assert!(matches!(err, ConfigError::Toml(_)));
    }

    #[test]
    fn missing_file_is_a_file_error() {
        let err = HttpClientConfig::from_path("/definitely/not/here.toml").expect_err("missing");
        assert!(matches!(err, ConfigError::File(_)));
    }

    #[test]
    fn monitoring_section_is_validated() {
        crate::runtime::init();
        let config = HttpClientConfig::from_toml(
            r#"
            uri = "http://x.test"
            [event_loop]
            threads = 1
            [monitoring]
            minimum_throughput_bytes_per_second = 0
            allowable_failure_interval_secs = 1
            "#,
        )
        .expect("parses");

        let bootstrap = config.build_bootstrap().expect("bootstrap");
        let err = config
            .manager_options(bootstrap.clone())
            .expect_err("zero throughput is invalid");
        assert!(matches!(err, ConfigError::InvalidMonitoring(_)));
        bootstrap.close();
    }
}
