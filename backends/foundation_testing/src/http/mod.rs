//! HTTP test server utilities.
//!
//! WHY: Client tests need a real HTTP/1.1 peer without external services.
//!
//! WHAT: `TestHttpServer` plus the request/response types it scripts with.
//!
//! HOW: stdlib `TcpListener`, one thread per connection, hand-written
//! HTTP/1.1 framing.

mod server;

pub use server::{HttpRequest, HttpResponse, TestHttpServer};
