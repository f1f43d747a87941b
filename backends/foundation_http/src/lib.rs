//! Pooled HTTP/1.1 client connections with a callback driven stream lifecycle.
//!
//! The crate is layered from leaf to root:
//!
//! - [`engine::EventLoopGroup`] owns the threads that perform network work.
//! - [`engine::HostResolver`] caches resolved addresses.
//! - [`engine::ClientBootstrap`] binds both and establishes transport connections.
//! - [`engine::TlsContext`] carries reusable TLS configuration.
//! - [`http::HttpClientConnectionManager`] pools connections to one endpoint.
//! - [`http::HttpClientConnection`] is a single lease from that pool.
//! - [`http::HttpStream`] is a single request/response exchange on a lease.
//!
//! Engine callbacks (headers, body, completion) run on event loop threads.
//! Caller facing suspension points (`acquire_connection`, `wait_for_shutdown`,
//! `write_chunk`, `completion`) hand back one-shot handles that can either be
//! blocked on with `wait()` or polled as a [`Future`](std::future::Future).
//!
//! ```no_run
//! use foundation_http::engine::ClientBootstrap;
//! use foundation_http::http::{
//!     CollectingHandler, ConnectionManagerOptions, HttpClientConnectionManager, Request,
//! };
//!
//! foundation_http::runtime::init();
//!
//! let bootstrap = ClientBootstrap::with_defaults().expect("bootstrap");
//! let options = ConnectionManagerOptions::builder("http://127.0.0.1:8080")
//!     .bootstrap(bootstrap)
//!     .max_connections(4)
//!     .build()
//!     .expect("valid options");
//! let manager = HttpClientConnectionManager::new(options).expect("manager");
//!
//! let connection = manager.acquire_connection().wait().expect("connection");
//! let (handler, response) = CollectingHandler::new();
//! let stream = connection
//!     .make_request(Request::get("/health").build().expect("request"), handler)
//!     .expect("stream");
//! stream.activate().expect("activated");
//!
//! let response = response.wait().expect("response");
//! println!("{} {:?}", response.status, response.body_text());
//!
//! drop(stream);
//! manager.release_connection(&connection).expect("released");
//! manager.close();
//! manager.wait_for_shutdown().wait();
//! ```

#[macro_use]
mod macros;

pub mod auth;
pub mod config;
pub mod engine;
pub mod errors;
pub mod http;
pub mod io;
pub mod runtime;
pub mod synca;

pub use errors::{ConfigError, ErrorCode, HttpError, HttpResult};
