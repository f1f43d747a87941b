//! Transport connection establishment.
//!
//! Resolves the target (or proxy), tries each resolved address with the
//! configured connect timeout, optionally tunnels through an HTTP proxy with
//! `CONNECT`, and finally negotiates TLS when the target needs it.

use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::time::Duration;

use base64::Engine as _;

use crate::errors::ErrorCode;
use crate::http::ProxyOptions;

use super::{ConnectParams, EngineFailure, HostResolver};

/// Largest proxy `CONNECT` response head we are willing to read.
const MAX_TUNNEL_RESPONSE: usize = 8 * 1024;

/// A connected byte stream, plain or TLS wrapped.
pub(crate) enum Transport {
    Plain(TcpStream),
    #[cfg(feature = "ssl-rustls")]
    Tls(Box<rustls::StreamOwned<rustls::ClientConnection, TcpStream>>),
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self {
            Self::Plain(_) => "plain",
            #[cfg(feature = "ssl-rustls")]
            Self::Tls(_) => "tls",
        };
        f.debug_struct("Transport")
            .field("kind", &kind)
            .field("peer", &self.tcp().peer_addr().ok())
            .finish()
    }
}

impl Transport {
    fn tcp(&self) -> &TcpStream {
        match self {
            Self::Plain(stream) => stream,
            #[cfg(feature = "ssl-rustls")]
            Self::Tls(stream) => &stream.sock,
        }
    }

    pub(crate) fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.tcp().set_read_timeout(timeout)
    }

    /// Checks an idle transport for a peer that hung up, without consuming
    /// anything. EOF, unsolicited bytes (a TLS `close_notify` or a server
    /// timeout response) and socket errors all mean the connection cannot
    /// carry another exchange.
    pub(crate) fn is_stale(&self) -> bool {
        let tcp = self.tcp();
        if tcp.set_nonblocking(true).is_err() {
            return true;
        }
        let mut peeked = [0u8; 1];
        let stale = match tcp.peek(&mut peeked) {
            Ok(_) => true,
            Err(err) => !matches!(
                err.kind(),
                io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
            ),
        };
        if tcp.set_nonblocking(false).is_err() {
            return true;
        }
        stale
    }

    /// Best effort close: TLS close_notify first, then a TCP shutdown.
    pub(crate) fn close(&mut self) {
        #[cfg(feature = "ssl-rustls")]
        if let Self::Tls(stream) = self {
            stream.conn.send_close_notify();
            let _ = stream.conn.complete_io(&mut stream.sock);
        }
        let _ = self.tcp().shutdown(Shutdown::Both);
    }
}

impl Read for Transport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::Plain(stream) => stream.read(buf),
            #[cfg(feature = "ssl-rustls")]
            Self::Tls(stream) => stream.read(buf),
        }
    }
}

impl Write for Transport {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::Plain(stream) => stream.write(buf),
            #[cfg(feature = "ssl-rustls")]
            Self::Tls(stream) => stream.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::Plain(stream) => stream.flush(),
            #[cfg(feature = "ssl-rustls")]
            Self::Tls(stream) => stream.flush(),
        }
    }
}

fn io_failure(err: &io::Error, context: &str) -> EngineFailure {
    EngineFailure::new(ErrorCode::from_io(err), format!("{context}: {err}"))
}

/// Opens a transport for `params`. Blocking; run it off the event loops.
pub(crate) fn connect(
    params: &ConnectParams,
    resolver: &HostResolver,
) -> Result<Transport, EngineFailure> {
    let (dial_host, dial_port) = match &params.proxy {
        Some(proxy) => (proxy.host(), proxy.port()),
        None => (params.host.as_str(), params.port),
    };

    let addrs = resolver.resolve(dial_host, dial_port)?;

    let mut last_error = None;
    let mut tcp = None;
    for addr in addrs {
        match TcpStream::connect_timeout(&addr, params.socket.get_connect_timeout()) {
            Ok(stream) => {
                tcp = Some(stream);
                break;
            }
            Err(err) => {
                debug!(%addr, "connect attempt failed: {err}");
                last_error = Some(err);
            }
        }
    }

    let tcp = match (tcp, last_error) {
        (Some(stream), _) => stream,
        (None, Some(err)) => {
            return Err(io_failure(
                &err,
                &format!("failed to connect to {dial_host}:{dial_port}"),
            ))
        }
        (None, None) => {
            return Err(EngineFailure::new(
                ErrorCode::DNS_FAILURE,
                format!("no addresses resolved for {dial_host}"),
            ))
        }
    };

    params
        .socket
        .apply(&tcp)
        .map_err(|err| io_failure(&err, "failed to apply socket options"))?;

    if let Some(proxy) = &params.proxy {
        if params.tunnels() {
            establish_tunnel(&tcp, proxy, &params.host, params.port)?;
        }
    }

    match &params.tls {
        Some(context) => negotiate_tls(context, &params.server_name(), tcp),
        None => Ok(Transport::Plain(tcp)),
    }
}

pub(crate) fn basic_auth_value(username: &str, password: &str) -> String {
    let token = base64::engine::general_purpose::STANDARD.encode(format!("{username}:{password}"));
    format!("Basic {token}")
}

fn establish_tunnel(
    mut tcp: &TcpStream,
    proxy: &ProxyOptions,
    host: &str,
    port: u16,
) -> Result<(), EngineFailure> {
    let mut request = format!("CONNECT {host}:{port} HTTP/1.1\r\nHost: {host}:{port}\r\n");
    if let Some((username, password)) = proxy.credentials() {
        request.push_str(&format!(
            "Proxy-Authorization: {}\r\n",
            basic_auth_value(username, password)
        ));
    }
    request.push_str("\r\n");

    tcp.write_all(request.as_bytes())
        .map_err(|err| io_failure(&err, "failed to send proxy CONNECT"))?;

    // Read byte-wise so nothing past the response head is consumed before
    // the TLS handshake starts.
    let mut head = Vec::with_capacity(256);
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        if head.len() >= MAX_TUNNEL_RESPONSE {
            return Err(EngineFailure::new(
                ErrorCode::PROXY_CONNECT_FAILED,
                "proxy CONNECT response too large",
            ));
        }
        match tcp.read(&mut byte) {
            Ok(0) => {
                return Err(EngineFailure::new(
                    ErrorCode::PROXY_CONNECT_FAILED,
                    "proxy closed the connection during CONNECT",
                ))
            }
            Ok(_) => head.push(byte[0]),
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => return Err(io_failure(&err, "failed to read proxy CONNECT response")),
        }
    }

    let status_line = head
        .split(|b| *b == b'\n')
        .next()
        .map(|line| String::from_utf8_lossy(line).trim().to_string())
        .unwrap_or_default();
    let status = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse::<u16>().ok());

    match status {
        Some(code) if (200..300).contains(&code) => {
            debug!(host, port, "proxy tunnel established");
            Ok(())
        }
        _ => Err(EngineFailure::new(
            ErrorCode::PROXY_CONNECT_FAILED,
            format!("proxy refused CONNECT: {status_line}"),
        )),
    }
}

#[cfg(feature = "ssl-rustls")]
fn negotiate_tls(
    context: &super::TlsContext,
    server_name: &str,
    mut tcp: TcpStream,
) -> Result<Transport, EngineFailure> {
    use rustls::pki_types::ServerName;

    let tls_failure =
        |message: String| EngineFailure::new(ErrorCode::TLS_NEGOTIATION_FAILURE, message);

    if context.is_shut_down() {
        return Err(tls_failure("tls context is shut down".into()));
    }

    let name = ServerName::try_from(server_name.to_string())
        .map_err(|err| tls_failure(format!("invalid server name {server_name}: {err}")))?;
    let mut conn = rustls::ClientConnection::new(context.client_config(), name)
        .map_err(|err| tls_failure(err.to_string()))?;

    while conn.is_handshaking() {
        conn.complete_io(&mut tcp)
            .map_err(|err| tls_failure(format!("handshake with {server_name} failed: {err}")))?;
    }

    Ok(Transport::Tls(Box::new(rustls::StreamOwned::new(conn, tcp))))
}

#[cfg(not(feature = "ssl-rustls"))]
fn negotiate_tls(
    _context: &super::TlsContext,
    _server_name: &str,
    _tcp: TcpStream,
) -> Result<Transport, EngineFailure> {
    Err(EngineFailure::new(
        ErrorCode::TLS_NEGOTIATION_FAILURE,
        "no TLS backend compiled in",
    ))
}

#[cfg(test)]
mod tests {
    use std::io::{BufRead, BufReader, Write};
    use std::net::TcpListener;
    use std::thread;

    use super::*;

    #[test]
    fn basic_auth_is_base64_encoded() {
        assert_eq!(basic_auth_value("user", "pass"), "Basic dXNlcjpwYXNz");
    }

    fn fake_proxy(reply: &'static str) -> (u16, thread::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let port = listener.local_addr().expect("addr").port();
        let handle = thread::spawn(move || {
            let (stream, _) = listener.accept().expect("accept");
            let mut reader = BufReader::new(stream.try_clone().expect("clone"));
            let mut request = String::new();
            loop {
                let mut line = String::new();
                reader.read_line(&mut line).expect("read");
                request.push_str(&line);
                if line == "\r\n" || line.is_empty() {
                    break;
                }
            }
            (&stream).write_all(reply.as_bytes()).expect("reply");
            request
        });
        (port, handle)
    }

    #[test]
    fn tunnel_sends_connect_with_credentials() {
        let (port, proxy) = fake_proxy("HTTP/1.1 200 Connection established\r\n\r\n");
        let tcp = TcpStream::connect(("127.0.0.1", port)).expect("connect");
        let options = ProxyOptions::new("127.0.0.1", port).basic_auth("user", "pass");

        establish_tunnel(&tcp, &options, "origin.test", 443).expect("tunnel");

        let request = proxy.join().expect("proxy thread");
        assert!(request.starts_with("CONNECT origin.test:443 HTTP/1.1\r\n"));
        assert!(request.contains("Proxy-Authorization: Basic dXNlcjpwYXNz\r\n"));
    }

    #[test]
    fn tunnel_refusal_is_reported() {
        let (port, proxy) = fake_proxy("HTTP/1.1 407 Proxy Authentication Required\r\n\r\n");
        let tcp = TcpStream::connect(("127.0.0.1", port)).expect("connect");
        let options = ProxyOptions::new("127.0.0.1", port);

        let err = establish_tunnel(&tcp, &options, "origin.test", 443).expect_err("refused");
        assert_eq!(err.code, ErrorCode::PROXY_CONNECT_FAILED);
        assert!(err.message.contains("407"));
        proxy.join().expect("proxy thread");
    }
}
