//! The caller facing HTTP layer: options, the connection pool, leased
//! connections, streams and their handlers.

mod body;
mod connection;
mod handler;
mod headers;
mod manager;
mod options;
mod request;
mod stream;
mod window;

pub use body::{ByteArrayBodyStream, HttpRequestBodyStream, ReaderBodyStream, SeekableBodyStream};
pub use connection::HttpClientConnection;
pub use handler::{CollectedResponse, CollectingHandler, HeaderBlock, HttpResponseHandler};
pub use headers::{Headers, HeadersBuilder, HttpHeader};
pub use manager::{ConnectionAcquisition, HttpClientConnectionManager, PoolMetrics};
pub use options::{
    ConnectionManagerOptions, ConnectionManagerOptionsBuilder, MonitoringOptions, ProxyOptions,
    DEFAULT_INITIAL_WINDOW_SIZE, DEFAULT_MAX_CONNECTIONS,
};
pub use request::{Method, Request, RequestBuilder, SharedBodyStream};
pub use stream::{ChunkWrite, HttpStream, HttpStreamRef, StreamState};
pub use window::FlowWindow;
