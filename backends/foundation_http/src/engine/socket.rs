use std::io;
use std::net::TcpStream;
use std::time::Duration;

use socket2::{SockRef, TcpKeepalive};

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

/// Socket level settings applied to every transport connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketOptions {
    connect_timeout: Duration,
    keep_alive: Option<Duration>,
    nodelay: bool,
    write_timeout: Option<Duration>,
}

impl Default for SocketOptions {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            keep_alive: None,
            nodelay: true,
            write_timeout: None,
        }
    }
}

impl SocketOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Enables TCP keep-alive probes after `idle` of silence.
    #[must_use]
    pub fn keep_alive(mut self, idle: Duration) -> Self {
        self.keep_alive = Some(idle);
        self
    }

    #[must_use]
    pub fn nodelay(mut self, enabled: bool) -> Self {
        self.nodelay = enabled;
        self
    }

    #[must_use]
    pub fn write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn get_connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    #[must_use]
    pub fn get_keep_alive(&self) -> Option<Duration> {
        self.keep_alive
    }

    #[must_use]
    pub fn get_nodelay(&self) -> bool {
        self.nodelay
    }

    #[must_use]
    pub fn get_write_timeout(&self) -> Option<Duration> {
        self.write_timeout
    }

    pub(crate) fn apply(&self, stream: &TcpStream) -> io::Result<()> {
        stream.set_nodelay(self.nodelay)?;
        stream.set_write_timeout(self.write_timeout)?;

        if let Some(idle) = self.keep_alive {
            let keepalive = TcpKeepalive::new().with_time(idle);
            SockRef::from(stream).set_tcp_keepalive(&keepalive)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::net::{TcpListener, TcpStream};
    use std::time::Duration;

    use super::SocketOptions;

    #[test]
    fn applies_to_a_live_socket() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let stream = TcpStream::connect(listener.local_addr().expect("addr")).expect("connect");

        let options = SocketOptions::new()
            .keep_alive(Duration::from_secs(30))
            .write_timeout(Duration::from_secs(2))
            .nodelay(true);
        options.apply(&stream).expect("options applied");

        assert!(stream.nodelay().expect("nodelay"));
        assert_eq!(
            stream.write_timeout().expect("write timeout"),
            Some(Duration::from_secs(2))
        );
    }
}
