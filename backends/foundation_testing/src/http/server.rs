//! Test HTTP server implementation.
//!
//! WHY: Client integration tests need a real peer that speaks keep-alive
//! HTTP/1.1, streams chunked bodies and can misbehave on purpose.
//!
//! WHAT: `TestHttpServer` listens on localhost, serves any number of
//! requests per connection and answers each with an `HttpResponse` produced
//! by a caller supplied handler.
//!
//! HOW: stdlib `TcpListener`, one thread per connection, hand-written
//! request parsing and response rendering.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

type ResponseHandler = Arc<dyn Fn(&HttpRequest) -> HttpResponse + Send + Sync>;

/// How long a connection thread blocks in `read` before rechecking whether
/// the server is still running.
const POLL_INTERVAL: Duration = Duration::from_millis(50);
const MAX_HEAD: usize = 64 * 1024;

/// A request as received by the server.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    /// Method as sent, e.g. `GET`.
    pub method: String,
    /// Request target as sent, e.g. `/test?x=1`.
    pub target: String,
    /// Headers in arrival order.
    pub headers: Vec<(String, String)>,
    /// De-chunked body.
    pub body: Vec<u8>,
    /// Index of the connection the request arrived on, starting at 0.
    pub connection: usize,
}

impl HttpRequest {
    /// First header value with `name`, compared case-insensitively.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Path part of the target, without the query.
    #[must_use]
    pub fn path(&self) -> &str {
        self.target.split('?').next().unwrap_or(&self.target)
    }

    fn wants_close(&self) -> bool {
        self.header("connection")
            .is_some_and(|value| value.eq_ignore_ascii_case("close"))
    }
}

/// A scripted response.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    /// Status code (e.g., 200)
    pub status: u16,
    /// Status text (e.g., "OK")
    pub status_text: String,
    /// Response headers
    pub headers: Vec<(String, String)>,
    /// Response body; sent with `Content-Length` unless `chunks` is set.
    pub body: Vec<u8>,
    /// Sends these chunks with `Transfer-Encoding: chunked` instead of `body`.
    pub chunks: Option<Vec<Vec<u8>>>,
    /// Trailers sent after the last chunk.
    pub trailers: Vec<(String, String)>,
    /// `1xx` responses written before the final one.
    pub informational: Vec<u16>,
    /// Pause before anything is written.
    pub delay: Option<Duration>,
    /// Pause between chunks.
    pub chunk_delay: Option<Duration>,
    /// Closes the connection after this response.
    pub close: bool,
    /// Closes the connection after this response without announcing it.
    pub hang_up: bool,
}

impl HttpResponse {
    /// Create 200 OK response with body.
    #[must_use]
    pub fn ok(body: impl Into<Vec<u8>>) -> Self {
        Self::status(200, "OK").with_body(body)
    }

    /// Create custom status response with an empty body.
    #[must_use]
    pub fn status(code: u16, text: &str) -> Self {
        Self {
            status: code,
            status_text: text.to_string(),
            headers: Vec::new(),
            body: Vec::new(),
            chunks: None,
            trailers: Vec::new(),
            informational: Vec::new(),
            delay: None,
            chunk_delay: None,
            close: false,
            hang_up: false,
        }
    }

    /// Create 200 OK response streaming `chunks`.
    #[must_use]
    pub fn chunked(chunks: Vec<Vec<u8>>) -> Self {
        let mut response = Self::status(200, "OK");
        response.chunks = Some(chunks);
        response
    }

    /// Replaces the body.
    #[must_use]
    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    /// Adds a header.
    #[must_use]
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    /// Adds a trailer; only sent for chunked responses.
    #[must_use]
    pub fn with_trailer(mut self, name: &str, value: &str) -> Self {
        self.trailers.push((name.to_string(), value.to_string()));
        self
    }

    /// Sends a `code` interim response first.
    #[must_use]
    pub fn with_informational(mut self, code: u16) -> Self {
        self.informational.push(code);
        self
    }

    /// Waits `delay` before responding.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Waits `delay` between chunks.
    #[must_use]
    pub fn with_chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = Some(delay);
        self
    }

    /// Sends `Connection: close` and closes the connection afterwards.
    #[must_use]
    pub fn closing(mut self) -> Self {
        self.close = true;
        self
    }

    /// Drops the connection after responding while the response still
    /// advertises keep-alive.
    #[must_use]
    pub fn hanging_up(mut self) -> Self {
        self.hang_up = true;
        self
    }

    fn write_to(&self, stream: &mut TcpStream) -> std::io::Result<()> {
        if let Some(delay) = self.delay {
            thread::sleep(delay);
        }

        for code in &self.informational {
            write!(stream, "HTTP/1.1 {code} Continue\r\n\r\n")?;
        }

        let mut head = format!("HTTP/1.1 {} {}\r\n", self.status, self.status_text);
        for (key, value) in &self.headers {
            head.push_str(&format!("{key}: {value}\r\n"));
        }
        if self.close {
            head.push_str("Connection: close\r\n");
        }

        match &self.chunks {
            None => {
                head.push_str(&format!("Content-Length: {}\r\n\r\n", self.body.len()));
                stream.write_all(head.as_bytes())?;
                stream.write_all(&self.body)?;
            }
            Some(chunks) => {
                head.push_str("Transfer-Encoding: chunked\r\n\r\n");
                stream.write_all(head.as_bytes())?;
                stream.flush()?;
                for chunk in chunks.iter().filter(|chunk| !chunk.is_empty()) {
                    write!(stream, "{:x}\r\n", chunk.len())?;
                    stream.write_all(chunk)?;
                    stream.write_all(b"\r\n")?;
                    stream.flush()?;
                    if let Some(delay) = self.chunk_delay {
                        thread::sleep(delay);
                    }
                }
                stream.write_all(b"0\r\n")?;
                for (key, value) in &self.trailers {
                    write!(stream, "{key}: {value}\r\n")?;
                }
                stream.write_all(b"\r\n")?;
            }
        }
        stream.flush()
    }
}

#[derive(Default)]
struct ServerStats {
    accepted: AtomicUsize,
    open: AtomicUsize,
    served: AtomicUsize,
    requests: Mutex<Vec<HttpRequest>>,
}

/// Test HTTP server for integration testing.
///
/// # Purpose (WHY)
///
/// Gives client tests a real keep-alive peer on localhost whose behaviour
/// (status, chunking, trailers, interim responses, delays, closing) is
/// scripted per request, and whose connection counters let tests assert on
/// pooling.
///
/// # Examples
///
/// ```rust
/// use foundation_testing::http::{HttpResponse, TestHttpServer};
///
/// let server = TestHttpServer::with_response(|req| {
///     if req.path() == "/missing" {
///         HttpResponse::status(404, "Not Found")
///     } else {
///         HttpResponse::ok(b"Success")
///     }
/// });
/// assert!(server.url("/test").starts_with("http://127.0.0.1:"));
/// ```
pub struct TestHttpServer {
    addr: SocketAddr,
    running: Arc<AtomicBool>,
    stats: Arc<ServerStats>,
    handle: Option<thread::JoinHandle<()>>,
}

impl std::fmt::Debug for TestHttpServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestHttpServer")
            .field("addr", &self.addr)
            .field("accepted", &self.connections_accepted())
            .field("served", &self.requests_served())
            .finish()
    }
}

impl TestHttpServer {
    /// Start a server answering every request with `200 OK`.
    ///
    /// # Panics
    ///
    /// If no localhost port can be bound.
    #[must_use]
    pub fn start() -> Self {
        Self::with_response(|_req| HttpResponse::ok(b"OK"))
    }

    /// Start a server answering with `handler`.
    ///
    /// # Panics
    ///
    /// If no localhost port can be bound.
    #[must_use]
    pub fn with_response<F>(handler: F) -> Self
    where
        F: Fn(&HttpRequest) -> HttpResponse + Send + Sync + 'static,
    {
        let listener =
            TcpListener::bind("127.0.0.1:0").expect("Failed to bind test HTTP server to localhost");
        let addr = listener.local_addr().expect("bound listener has an address");
        listener
            .set_nonblocking(true)
            .expect("Failed to set non-blocking");

        let running = Arc::new(AtomicBool::new(true));
        let stats = Arc::new(ServerStats::default());
        let handler: ResponseHandler = Arc::new(handler);

        let handle = {
            let running = Arc::clone(&running);
            let stats = Arc::clone(&stats);
            thread::spawn(move || Self::accept_loop(&listener, &running, &stats, &handler))
        };

        Self {
            addr,
            running,
            stats,
            handle: Some(handle),
        }
    }

    fn accept_loop(
        listener: &TcpListener,
        running: &Arc<AtomicBool>,
        stats: &Arc<ServerStats>,
        handler: &ResponseHandler,
    ) {
        while running.load(Ordering::Acquire) {
            match listener.accept() {
                Ok((stream, peer)) => {
                    let index = stats.accepted.fetch_add(1, Ordering::SeqCst);
                    stats.open.fetch_add(1, Ordering::SeqCst);
                    tracing::debug!("test server accepted {peer:?} as connection {index}");

                    let running = Arc::clone(running);
                    let stats = Arc::clone(stats);
                    let handler = Arc::clone(handler);
                    thread::spawn(move || {
                        if let Err(err) =
                            Self::serve_connection(stream, index, &running, &stats, &handler)
                        {
                            tracing::debug!("test server connection {index} ended: {err}");
                        }
                        stats.open.fetch_sub(1, Ordering::SeqCst);
                    });
                }
                Err(ref err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                    thread::sleep(Duration::from_millis(5));
                }
                Err(err) => {
                    tracing::warn!("test server accept error: {err}");
                    break;
                }
            }
        }
    }

    fn serve_connection(
        mut stream: TcpStream,
        index: usize,
        running: &AtomicBool,
        stats: &ServerStats,
        handler: &ResponseHandler,
    ) -> std::io::Result<()> {
        stream.set_nonblocking(false)?;
        stream.set_read_timeout(Some(POLL_INTERVAL))?;
        let mut reader = Reader {
            buffer: Vec::new(),
            running,
        };

        loop {
            let Some(mut request) = reader.read_request(&mut stream)? else {
                return Ok(());
            };
            request.connection = index;

            let response = handler(&request);
            let close = response.close || response.hang_up || request.wants_close();
            stats
                .requests
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(request);

            response.write_to(&mut stream)?;
            stats.served.fetch_add(1, Ordering::SeqCst);

            if close {
                stream.shutdown(std::net::Shutdown::Both)?;
                return Ok(());
            }
        }
    }

    /// Full URL for `path` on this server.
    #[must_use]
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    /// Base URL without a path, e.g. `http://127.0.0.1:54321`.
    #[must_use]
    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Listening address.
    #[must_use]
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Connections accepted since start.
    #[must_use]
    pub fn connections_accepted(&self) -> usize {
        self.stats.accepted.load(Ordering::SeqCst)
    }

    /// Connections currently open.
    #[must_use]
    pub fn open_connections(&self) -> usize {
        self.stats.open.load(Ordering::SeqCst)
    }

    /// Responses fully written.
    #[must_use]
    pub fn requests_served(&self) -> usize {
        self.stats.served.load(Ordering::SeqCst)
    }

    /// Every request received so far, in arrival order.
    #[must_use]
    pub fn requests(&self) -> Vec<HttpRequest> {
        self.stats
            .requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Polls until `check` holds or `timeout` passes; returns the last result.
    pub fn wait_until(&self, timeout: Duration, check: impl Fn(&Self) -> bool) -> bool {
        let deadline = std::time::Instant::now() + timeout;
        loop {
            if check(self) {
                return true;
            }
            if std::time::Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(5));
        }
    }
}

impl Drop for TestHttpServer {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

struct Reader<'a> {
    buffer: Vec<u8>,
    running: &'a AtomicBool,
}

impl Reader<'_> {
    /// Reads more bytes; `Ok(false)` on EOF or server shutdown.
    fn fill(&mut self, stream: &mut TcpStream) -> std::io::Result<bool> {
        let mut chunk = [0u8; 4096];
        loop {
            if !self.running.load(Ordering::Acquire) {
                return Ok(false);
            }
            match stream.read(&mut chunk) {
                Ok(0) => return Ok(false),
                Ok(n) => {
                    self.buffer.extend_from_slice(&chunk[..n]);
                    return Ok(true);
                }
                Err(err)
                    if matches!(
                        err.kind(),
                        std::io::ErrorKind::WouldBlock
                            | std::io::ErrorKind::TimedOut
                            | std::io::ErrorKind::Interrupted
                    ) => {}
                Err(err) => return Err(err),
            }
        }
    }

    fn take_line(&mut self, stream: &mut TcpStream) -> std::io::Result<Option<String>> {
        loop {
            if let Some(pos) = self.buffer.windows(2).position(|w| w == b"\r\n") {
                let line: Vec<u8> = self.buffer.drain(..pos + 2).take(pos).collect();
                return Ok(Some(String::from_utf8_lossy(&line).into_owned()));
            }
            if self.buffer.len() > MAX_HEAD {
                return Err(invalid("request line too long"));
            }
            if !self.fill(stream)? {
                return Ok(None);
            }
        }
    }

    fn take_exact(&mut self, stream: &mut TcpStream, len: usize) -> std::io::Result<Option<Vec<u8>>> {
        while self.buffer.len() < len {
            if !self.fill(stream)? {
                return Ok(None);
            }
        }
        Ok(Some(self.buffer.drain(..len).collect()))
    }

    fn read_request(&mut self, stream: &mut TcpStream) -> std::io::Result<Option<HttpRequest>> {
        let Some(request_line) = self.take_line(stream)? else {
            return Ok(None);
        };
        let mut parts = request_line.split_whitespace();
        let (Some(method), Some(target)) = (parts.next(), parts.next()) else {
            return Err(invalid("malformed request line"));
        };
        let (method, target) = (method.to_string(), target.to_string());

        let mut headers = Vec::new();
        loop {
            let Some(line) = self.take_line(stream)? else {
                return Ok(None);
            };
            if line.is_empty() {
                break;
            }
            let Some((name, value)) = line.split_once(':') else {
                return Err(invalid("malformed header line"));
            };
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }

        let mut request = HttpRequest {
            method,
            target,
            headers,
            body: Vec::new(),
            connection: 0,
        };

        let chunked = request
            .header("transfer-encoding")
            .is_some_and(|value| value.to_ascii_lowercase().contains("chunked"));
        if chunked {
            loop {
                let Some(size_line) = self.take_line(stream)? else {
                    return Ok(None);
                };
                let size_text = size_line.split(';').next().unwrap_or("").trim();
                let size = usize::from_str_radix(size_text, 16)
                    .map_err(|_| invalid("bad chunk size"))?;
                if size == 0 {
                    // Trailers until the blank line.
                    loop {
                        match self.take_line(stream)? {
                            Some(line) if line.is_empty() => break,
                            Some(_) => {}
                            None => return Ok(None),
                        }
                    }
                    break;
                }
                let Some(data) = self.take_exact(stream, size + 2)? else {
                    return Ok(None);
                };
                request.body.extend_from_slice(&data[..size]);
            }
        } else if let Some(length) = request.header("content-length") {
            let length: usize = length.parse().map_err(|_| invalid("bad content length"))?;
            let Some(data) = self.take_exact(stream, length)? else {
                return Ok(None);
            };
            request.body = data;
        }

        Ok(Some(request))
    }
}

fn invalid(message: &str) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidData, message.to_string())
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};
    use std::net::TcpStream;

    use super::*;

    fn exchange(stream: &mut TcpStream, request: &str, expect_end: &str) -> String {
        stream.write_all(request.as_bytes()).expect("write");
        let mut received = Vec::new();
        let mut chunk = [0u8; 1024];
        while !String::from_utf8_lossy(&received).ends_with(expect_end) {
            let n = stream.read(&mut chunk).expect("read");
            assert!(n > 0, "server closed early");
            received.extend_from_slice(&chunk[..n]);
        }
        String::from_utf8_lossy(&received).into_owned()
    }

    /// WHY: pooling tests rely on several requests sharing one connection.
    /// WHAT: two requests on one socket are both answered and counted on a
    /// single accepted connection.
    #[test]
    fn serves_keep_alive_requests() {
        let server = TestHttpServer::with_response(|req| HttpResponse::ok(req.path().to_string()));
        let mut stream = TcpStream::connect(server.addr()).expect("connect");

        let first = exchange(&mut stream, "GET /one HTTP/1.1\r\nHost: x\r\n\r\n", "/one");
        assert!(first.starts_with("HTTP/1.1 200 OK"));
        let second = exchange(&mut stream, "GET /two HTTP/1.1\r\nHost: x\r\n\r\n", "/two");
        assert!(second.contains("Content-Length: 4"));

        assert!(server.wait_until(Duration::from_secs(1), |s| s.requests_served() == 2));
        assert_eq!(server.connections_accepted(), 1);
    }

    /// WHY: chunked uploads must arrive de-chunked for assertions.
    /// WHAT: a chunked request body is recorded as its plain bytes.
    #[test]
    fn decodes_chunked_request_bodies() {
        let server = TestHttpServer::start();
        let mut stream = TcpStream::connect(server.addr()).expect("connect");
        exchange(
            &mut stream,
            "POST /up HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n3\r\nabc\r\n2\r\nde\r\n0\r\n\r\n",
            "OK",
        );

        let requests = server.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].body, b"abcde");
        assert_eq!(requests[0].method, "POST");
    }

    #[test]
    fn renders_chunked_responses_with_trailers() {
        let server = TestHttpServer::with_response(|_| {
            HttpResponse::chunked(vec![b"ab".to_vec(), b"cd".to_vec()])
                .with_trailer("X-Checksum", "42")
                .with_informational(100)
        });
        let mut stream = TcpStream::connect(server.addr()).expect("connect");
        let text = exchange(&mut stream, "GET / HTTP/1.1\r\n\r\n", "X-Checksum: 42\r\n\r\n");

        assert!(text.starts_with("HTTP/1.1 100 Continue\r\n\r\nHTTP/1.1 200 OK"));
        assert!(text.contains("2\r\nab\r\n2\r\ncd\r\n0\r\n"));
    }

    /// WHY: clients must cope with peers that drop keep-alive connections
    /// without saying so.
    /// WHAT: a hanging-up response carries no `Connection: close` and the
    /// socket reaches EOF right after it.
    #[test]
    fn hanging_up_closes_without_announcing() {
        let server = TestHttpServer::with_response(|_| HttpResponse::ok(b"ok").hanging_up());
        let mut stream = TcpStream::connect(server.addr()).expect("connect");
        let text = exchange(&mut stream, "GET / HTTP/1.1\r\n\r\n", "ok");
        assert!(!text.contains("Connection: close"));

        let mut rest = [0u8; 16];
        assert_eq!(stream.read(&mut rest).expect("read"), 0);
        assert!(server.wait_until(Duration::from_secs(1), |s| s.open_connections() == 0));
    }

    #[test]
    fn response_builders_set_fields() {
        let response = HttpResponse::status(503, "Service Unavailable")
            .with_header("Retry-After", "1")
            .closing();
        assert_eq!(response.status, 503);
        assert!(response.close);
        assert!(response.headers.iter().any(|(k, v)| k == "Retry-After" && v == "1"));
    }
}
