use derive_more::From;
use std::io;

use crate::synca::CompletionError;

/// Numeric engine error code carried by acquisition failures and by
/// `on_response_complete`. Zero means success.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ErrorCode(u32);

impl ErrorCode {
    pub const SUCCESS: Self = Self(0);

    pub const IO_ERROR: Self = Self(1001);
    pub const DNS_FAILURE: Self = Self(1002);
    pub const CONNECTION_REFUSED: Self = Self(1003);
    pub const SOCKET_TIMEOUT: Self = Self(1004);
    pub const SOCKET_CLOSED: Self = Self(1005);
    pub const TLS_NEGOTIATION_FAILURE: Self = Self(1006);
    pub const PROXY_CONNECT_FAILED: Self = Self(1007);

    pub const PROTOCOL_ERROR: Self = Self(2001);
    pub const CONNECTION_CLOSED: Self = Self(2002);
    pub const CONNECTION_UNHEALTHY: Self = Self(2003);
    pub const STREAM_ABANDONED: Self = Self(2004);
    pub const BODY_READ_FAILURE: Self = Self(2005);

    pub const MANAGER_SHUTTING_DOWN: Self = Self(3001);
    pub const EVENT_LOOP_SHUTDOWN: Self = Self(3002);

    #[must_use]
    pub const fn new(value: u32) -> Self {
        Self(value)
    }

    #[must_use]
    pub const fn value(self) -> u32 {
        self.0
    }

    #[must_use]
    pub const fn is_success(self) -> bool {
        self.0 == 0
    }

    /// Whether a fresh attempt could reasonably succeed. Transport level
    /// failures are retryable; protocol, configuration and shutdown failures
    /// are not.
    #[must_use]
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::IO_ERROR
                | Self::DNS_FAILURE
                | Self::CONNECTION_REFUSED
                | Self::SOCKET_TIMEOUT
                | Self::SOCKET_CLOSED
                | Self::CONNECTION_CLOSED
                | Self::CONNECTION_UNHEALTHY
        )
    }

    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::SUCCESS => "SUCCESS",
            Self::IO_ERROR => "IO_ERROR",
            Self::DNS_FAILURE => "DNS_FAILURE",
            Self::CONNECTION_REFUSED => "CONNECTION_REFUSED",
            Self::SOCKET_TIMEOUT => "SOCKET_TIMEOUT",
            Self::SOCKET_CLOSED => "SOCKET_CLOSED",
            Self::TLS_NEGOTIATION_FAILURE => "TLS_NEGOTIATION_FAILURE",
            Self::PROXY_CONNECT_FAILED => "PROXY_CONNECT_FAILED",
            Self::PROTOCOL_ERROR => "PROTOCOL_ERROR",
            Self::CONNECTION_CLOSED => "CONNECTION_CLOSED",
            Self::CONNECTION_UNHEALTHY => "CONNECTION_UNHEALTHY",
            Self::STREAM_ABANDONED => "STREAM_ABANDONED",
            Self::BODY_READ_FAILURE => "BODY_READ_FAILURE",
            Self::MANAGER_SHUTTING_DOWN => "MANAGER_SHUTTING_DOWN",
            Self::EVENT_LOOP_SHUTDOWN => "EVENT_LOOP_SHUTDOWN",
            _ => "UNKNOWN",
        }
    }

    /// Classifies a socket level error.
    #[must_use]
    pub fn from_io(err: &io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::ConnectionRefused => Self::CONNECTION_REFUSED,
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => Self::SOCKET_TIMEOUT,
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof => Self::SOCKET_CLOSED,
            _ => Self::IO_ERROR,
        }
    }
}

impl core::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.name(), self.0)
    }
}

/// Errors raised synchronously while building options, requests or
/// configuration.
#[derive(From, Debug)]
pub enum ConfigError {
    #[from(ignore)]
    InvalidUri(String),

    #[from(ignore)]
    UnsupportedScheme(String),

    #[from(ignore)]
    MissingHost(String),

    /// The scheme requires transport security but no TLS context was given.
    #[from(ignore)]
    TlsRequired(String),

    MissingBootstrap,
    InvalidWindowSize,
    InvalidMaxConnections,

    #[from(ignore)]
    InvalidProxy(String),

    #[from(ignore)]
    InvalidMonitoring(String),

    #[from(ignore)]
    InvalidHeader(String),

    #[from(ignore)]
    InvalidRequest(String),

    #[from(ignore)]
    Tls(String),

    #[from]
    File(io::Error),

    #[from]
    Toml(toml::de::Error),
}

impl From<url::ParseError> for ConfigError {
    fn from(err: url::ParseError) -> Self {
        ConfigError::InvalidUri(err.to_string())
    }
}

impl std::error::Error for ConfigError {}

impl core::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidUri(uri) => write!(f, "Invalid URI: {uri}"),
            Self::UnsupportedScheme(scheme) => {
                write!(f, "Unsupported scheme: {scheme} (expected http or https)")
            }
            Self::MissingHost(uri) => write!(f, "URI has no host: {uri}"),
            Self::TlsRequired(uri) => write!(f, "A TLS context is required for {uri}"),
            Self::MissingBootstrap => write!(f, "A client bootstrap is required"),
            Self::InvalidWindowSize => write!(f, "Initial window size must be greater than 0"),
            Self::InvalidMaxConnections => {
                write!(f, "Max connections must be greater than 0")
            }
            Self::InvalidProxy(reason) => write!(f, "Invalid proxy options: {reason}"),
            Self::InvalidMonitoring(reason) => {
                write!(f, "Invalid monitoring options: {reason}")
            }
            Self::InvalidHeader(reason) => write!(f, "Invalid header: {reason}"),
            Self::InvalidRequest(reason) => write!(f, "Invalid request: {reason}"),
            Self::Tls(reason) => write!(f, "TLS configuration failed: {reason}"),
            Self::File(err) => write!(f, "Failed to read configuration: {err}"),
            Self::Toml(err) => write!(f, "Failed to parse configuration: {err}"),
        }
    }
}

/// Errors surfaced by the pool, connections and streams.
#[derive(From, Debug)]
pub enum HttpError {
    #[from]
    Config(ConfigError),

    /// Establishing or leasing a connection failed.
    #[from(ignore)]
    ConnectionAcquisition { code: ErrorCode, message: String },

    /// The transport refused to admit a request.
    #[from(ignore)]
    StreamActivation { code: ErrorCode, message: String },

    /// An exchange ended with a non-zero code.
    #[from(ignore)]
    Stream { code: ErrorCode },

    /// An operation was called out of order; never retryable.
    #[from(ignore)]
    Precondition(String),

    /// The resource was already closed.
    #[from(ignore)]
    ResourceClosed(&'static str),

    /// `runtime::init()` has not been called.
    NotInitialized,

    #[from]
    Io(io::Error),

    #[from]
    Completion(CompletionError),
}

impl HttpError {
    pub(crate) fn acquisition(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::ConnectionAcquisition {
            code,
            message: message.into(),
        }
    }

    pub(crate) fn activation(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::StreamActivation {
            code,
            message: message.into(),
        }
    }

    pub(crate) fn precondition(message: impl Into<String>) -> Self {
        Self::Precondition(message.into())
    }

    /// The engine code behind this error, if there is one.
    #[must_use]
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            Self::ConnectionAcquisition { code, .. }
            | Self::StreamActivation { code, .. }
            | Self::Stream { code } => Some(*code),
            Self::Io(err) => Some(ErrorCode::from_io(err)),
            _ => None,
        }
    }

    /// Pure classification; nothing in this crate retries on its own.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::ConnectionAcquisition { code, .. }
            | Self::StreamActivation { code, .. }
            | Self::Stream { code } => code.is_retryable(),
            Self::Io(err) => ErrorCode::from_io(err).is_retryable(),
            _ => false,
        }
    }
}

impl std::error::Error for HttpError {}

impl core::fmt::Display for HttpError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(err) => write!(f, "{err}"),
            Self::ConnectionAcquisition { code, message } => {
                write!(f, "Connection acquisition failed with {code}: {message}")
            }
            Self::StreamActivation { code, message } => {
                write!(f, "Stream activation failed with {code}: {message}")
            }
            Self::Stream { code } => write!(f, "Stream completed with {code}"),
            Self::Precondition(reason) => write!(f, "Precondition violated: {reason}"),
            Self::ResourceClosed(resource) => write!(f, "The {resource} is closed"),
            Self::NotInitialized => {
                write!(f, "foundation_http::runtime::init() must be called first")
            }
            Self::Io(err) => write!(f, "I/O error: {err}"),
            Self::Completion(err) => write!(f, "{err}"),
        }
    }
}

pub type HttpResult<T> = std::result::Result<T, HttpError>;
