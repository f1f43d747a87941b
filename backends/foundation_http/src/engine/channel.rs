//! HTTP/1.1 channel driving exchanges over one transport connection.
//!
//! A channel is pinned to one event loop. Callers only touch the control
//! mailbox (submissions, chunks, window updates, cancels, shutdown) and wake
//! the channel; every read, write and sink callback happens inside `drive`
//! on the loop thread. Sink callbacks never run with the mailbox locked.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, TryLockError, Weak};
use std::time::{Duration, Instant};

use bytes::{BufMut, Bytes, BytesMut};

use crate::errors::ErrorCode;
use crate::http::{HeaderBlock, Method, MonitoringOptions, Request};
use crate::io::MutableBuffer;
use crate::synca::lock_or_recover;

use super::h1::{self, BodyFraming, DecodeEvent, ResponseDecoder};
use super::monitor::ThroughputMonitor;
use super::transport::{self, Transport};
use super::{
    ChunkCompleter, ConnectParams, ConnectionId, EngineConnection, EngineFailure, EventLoop,
    Exchange, ExchangeId, ExchangeSink,
};

/// How long one socket read may block the loop thread.
pub(crate) const READ_TICK: Duration = Duration::from_millis(5);
const READ_CHUNK: usize = 16 * 1024;
const BODY_PULL: usize = 16 * 1024;
/// Steps per drive before yielding the loop to other channels.
const MAX_STEPS: usize = 64;

struct QueuedChunk {
    exchange: ExchangeId,
    data: Bytes,
    is_final: bool,
    done: ChunkCompleter,
}

#[derive(Default)]
struct Mailbox {
    queue: VecDeque<(ExchangeId, Exchange)>,
    chunks: VecDeque<QueuedChunk>,
    window_updates: Vec<(ExchangeId, u64)>,
    cancels: Vec<(ExchangeId, ErrorCode)>,
    shutdown: Option<ErrorCode>,
}

/// What one drive step picked up from the mailbox for the active exchange.
#[derive(Default)]
struct Inbox {
    shutdown: Option<ErrorCode>,
    cancel_active: Option<ErrorCode>,
    cancelled: Vec<(Exchange, ErrorCode)>,
    chunks: Vec<QueuedChunk>,
    stray_chunks: Vec<QueuedChunk>,
    window: u64,
}

#[derive(Debug, Clone)]
enum Phase {
    SendHead(Bytes),
    SendBody,
    AwaitChunks,
    Receive,
}

struct Active {
    id: ExchangeId,
    sink: Arc<dyn ExchangeSink>,
    request: Request,
    framing: BodyFraming,
    phase: Phase,
    decoder: ResponseDecoder,
    window: Option<u64>,
    pending_body: Option<Bytes>,
    status: u16,
    chunks: VecDeque<QueuedChunk>,
}

impl Active {
    fn phase_after_head(&self) -> Phase {
        if self.request.body().is_some() {
            Phase::SendBody
        } else if self.framing == BodyFraming::Chunked {
            Phase::AwaitChunks
        } else {
            Phase::Receive
        }
    }

    /// Hands pending body bytes to the sink as far as the window allows.
    /// Returns false while bytes remain blocked on the window.
    fn deliver_pending(&mut self) -> bool {
        let Some(mut data) = self.pending_body.take() else {
            return true;
        };

        match self.window {
            None => {
                self.sink.on_body(&data);
                true
            }
            Some(0) => {
                self.pending_body = Some(data);
                false
            }
            Some(window) => {
                let allowed = usize::try_from(window).unwrap_or(usize::MAX).min(data.len());
                let part = data.split_to(allowed);
                let increment = self.sink.on_body(&part);
                self.window = Some((window - allowed as u64).saturating_add(increment));

                if data.is_empty() {
                    true
                } else {
                    self.pending_body = Some(data);
                    false
                }
            }
        }
    }
}

struct Driver {
    transport: Option<Transport>,
    read_buf: BytesMut,
    scratch: Vec<u8>,
    active: Option<Active>,
    monitor: Option<ThroughputMonitor>,
    closed_with: ErrorCode,
}

enum Step {
    Progress,
    /// Waiting on the socket; drive again right away.
    Poll,
    /// Nothing to do until the mailbox changes.
    Wait,
}

enum Outcome {
    Progress,
    Poll,
    Wait,
    Finish(ErrorCode),
}

/// Request-line and header settings derived once from the connect params.
#[derive(Debug, Clone)]
struct ChannelSettings {
    authority: String,
    absolute_prefix: Option<String>,
    proxy_authorization: Option<String>,
}

pub(crate) struct H1Channel {
    id: ConnectionId,
    event_loop: Arc<EventLoop>,
    settings: ChannelSettings,
    this: Weak<H1Channel>,
    open: AtomicBool,
    scheduled: AtomicBool,
    next_exchange: AtomicU64,
    mailbox: Mutex<Mailbox>,
    driver: Mutex<Driver>,
}

impl std::fmt::Debug for H1Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("H1Channel")
            .field("id", &self.id)
            .field("event_loop", &self.event_loop.index())
            .field("open", &self.is_open())
            .finish()
    }
}

impl H1Channel {
    pub(crate) fn new(
        id: ConnectionId,
        event_loop: Arc<EventLoop>,
        transport: Transport,
        params: &ConnectParams,
    ) -> Arc<Self> {
        let forwards = params.forwards();
        let settings = ChannelSettings {
            authority: params.authority(),
            absolute_prefix: forwards
                .then(|| format!("{}://{}", params.scheme(), params.authority())),
            proxy_authorization: params
                .proxy
                .as_ref()
                .filter(|_| forwards)
                .and_then(|proxy| proxy.credentials())
                .map(|(user, pass)| transport::basic_auth_value(user, pass)),
        };
        let monitor = params
            .monitoring
            .as_ref()
            .map(|options: &MonitoringOptions| ThroughputMonitor::new(options, Instant::now()));

        Arc::new_cyclic(|this| Self {
            id,
            event_loop,
            settings,
            this: this.clone(),
            open: AtomicBool::new(true),
            scheduled: AtomicBool::new(false),
            next_exchange: AtomicU64::new(1),
            mailbox: Mutex::new(Mailbox::default()),
            driver: Mutex::new(Driver {
                transport: Some(transport),
                read_buf: BytesMut::with_capacity(READ_CHUNK),
                scratch: vec![0; BODY_PULL],
                active: None,
                monitor,
                closed_with: ErrorCode::CONNECTION_CLOSED,
            }),
        })
    }

    fn wake(&self) {
        if self.scheduled.swap(true, Ordering::AcqRel) {
            return;
        }
        let Some(this) = self.this.upgrade() else {
            return;
        };
        if !self.event_loop.execute(move || this.drive()) {
            self.scheduled.store(false, Ordering::Release);
            self.abandon();
        }
    }

    /// Fails everything when the event loop is gone and can no longer
    /// drive this channel.
    fn abandon(&self) {
        let code = ErrorCode::EVENT_LOOP_SHUTDOWN;
        {
            let mut mailbox = lock_or_recover(&self.mailbox);
            self.open.store(false, Ordering::Release);
            mailbox.shutdown.get_or_insert(code);
        }

        // A drive holding the driver will see the closed loop itself.
        let driver = match self.driver.try_lock() {
            Ok(guard) => Some(guard),
            Err(TryLockError::Poisoned(poisoned)) => Some(poisoned.into_inner()),
            Err(TryLockError::WouldBlock) => None,
        };
        if let Some(mut driver) = driver {
            self.terminate(&mut driver, code);
        }
    }

    fn drive(&self) {
        self.scheduled.store(false, Ordering::Release);

        let mut driver = lock_or_recover(&self.driver);
        let mut yielded = true;
        for _ in 0..MAX_STEPS {
            match self.step(&mut driver) {
                Step::Progress => {}
                Step::Poll => break,
                Step::Wait => {
                    yielded = false;
                    break;
                }
            }
        }
        drop(driver);

        if self.event_loop.is_closed() {
            self.abandon();
        } else if yielded {
            self.wake();
        }
    }

    fn take_inbox(&self, active: Option<ExchangeId>) -> Inbox {
        let mut mailbox = lock_or_recover(&self.mailbox);
        let mut inbox = Inbox {
            shutdown: mailbox.shutdown,
            ..Inbox::default()
        };

        for (id, code) in std::mem::take(&mut mailbox.cancels) {
            if Some(id) == active {
                inbox.cancel_active.get_or_insert(code);
            } else if let Some(index) = mailbox.queue.iter().position(|(queued, _)| *queued == id)
            {
                if let Some((_, exchange)) = mailbox.queue.remove(index) {
                    inbox.cancelled.push((exchange, code));
                }
            }
        }

        for (id, increment) in std::mem::take(&mut mailbox.window_updates) {
            if Some(id) == active {
                inbox.window = inbox.window.saturating_add(increment);
            }
        }

        let queued: Vec<ExchangeId> = mailbox.queue.iter().map(|(id, _)| *id).collect();
        for chunk in std::mem::take(&mut mailbox.chunks) {
            if Some(chunk.exchange) == active {
                inbox.chunks.push(chunk);
            } else if queued.contains(&chunk.exchange) {
                mailbox.chunks.push_back(chunk);
            } else {
                inbox.stray_chunks.push(chunk);
            }
        }

        inbox
    }

    fn step(&self, driver: &mut Driver) -> Step {
        let inbox = self.take_inbox(driver.active.as_ref().map(|a| a.id));

        let shutdown = inbox.shutdown.or_else(|| {
            self.event_loop
                .is_closed()
                .then_some(ErrorCode::EVENT_LOOP_SHUTDOWN)
        });
        if let Some(code) = shutdown {
            for chunk in inbox.chunks.into_iter().chain(inbox.stray_chunks) {
                let _ = chunk.done.complete(Err(code));
            }
            for (exchange, _) in inbox.cancelled {
                exchange.sink.on_complete(code);
            }
            self.terminate(driver, code);
            return Step::Wait;
        }

        for (exchange, code) in inbox.cancelled {
            debug!(connection = self.id, "queued exchange cancelled");
            exchange.sink.on_complete(code);
        }
        for chunk in inbox.stray_chunks {
            let _ = chunk.done.complete(Err(ErrorCode::CONNECTION_CLOSED));
        }

        if let Some(code) = inbox.cancel_active {
            for chunk in inbox.chunks {
                let _ = chunk.done.complete(Err(code));
            }
            self.finish(driver, code);
            return Step::Progress;
        }

        if let Some(active) = driver.active.as_mut() {
            active.chunks.extend(inbox.chunks);
            if inbox.window > 0 {
                if let Some(window) = active.window.as_mut() {
                    *window = window.saturating_add(inbox.window);
                }
            }
        }

        if driver.active.is_none() {
            let next = lock_or_recover(&self.mailbox).queue.pop_front();
            let Some((id, exchange)) = next else {
                return Step::Wait;
            };
            if driver.transport.is_none() {
                exchange.sink.on_complete(driver.closed_with);
                return Step::Progress;
            }
            self.begin(driver, id, exchange);
            return Step::Progress;
        }

        let outcome = match (driver.transport.as_mut(), driver.active.as_mut()) {
            (Some(transport), Some(active)) => Self::advance(
                transport,
                active,
                &mut driver.read_buf,
                &mut driver.scratch,
                driver.monitor.as_mut(),
            ),
            _ => Outcome::Finish(driver.closed_with),
        };

        match outcome {
            Outcome::Progress => Step::Progress,
            Outcome::Poll => Step::Poll,
            Outcome::Wait => Step::Wait,
            Outcome::Finish(code) => {
                self.finish(driver, code);
                Step::Progress
            }
        }
    }

    fn begin(&self, driver: &mut Driver, id: ExchangeId, exchange: Exchange) {
        let request = exchange.request;
        let (framing, framing_header) = h1::request_framing(&request);

        let target = match &self.settings.absolute_prefix {
            Some(prefix) => format!("{prefix}{}", request.path()),
            None => request.path().to_string(),
        };
        let mut extra = Vec::new();
        if let Some(header) = framing_header {
            extra.push(header);
        }
        if let Some(value) = &self.settings.proxy_authorization {
            extra.push(("Proxy-Authorization", value.clone()));
        }

        let mut head = BytesMut::with_capacity(256);
        h1::encode_head(&request, &target, &self.settings.authority, &extra, &mut head);

        debug!(
            connection = self.id,
            exchange = id,
            method = request.method().as_str(),
            path = request.path(),
            "exchange started"
        );

        if let Some(monitor) = driver.monitor.as_mut() {
            monitor.reset(Instant::now());
        }

        driver.active = Some(Active {
            id,
            sink: exchange.sink,
            decoder: ResponseDecoder::new(request.method() == Method::Head),
            request,
            framing,
            phase: Phase::SendHead(head.freeze()),
            window: exchange.window,
            pending_body: None,
            status: 0,
            chunks: VecDeque::new(),
        });
    }

    fn advance(
        transport: &mut Transport,
        active: &mut Active,
        read_buf: &mut BytesMut,
        scratch: &mut [u8],
        monitor: Option<&mut ThroughputMonitor>,
    ) -> Outcome {
        match active.phase.clone() {
            Phase::SendHead(head) => {
                if let Err(code) = write_out(transport, &head) {
                    return Outcome::Finish(code);
                }
                active.phase = active.phase_after_head();
                Outcome::Progress
            }
            Phase::SendBody => Self::send_body(transport, active, scratch),
            Phase::AwaitChunks => {
                let Some(chunk) = active.chunks.pop_front() else {
                    return Outcome::Wait;
                };

                let mut out = BytesMut::with_capacity(chunk.data.len() + 16);
                h1::encode_chunk(&chunk.data, &mut out);
                if chunk.is_final {
                    out.put_slice(h1::LAST_CHUNK);
                }

                if let Err(code) = write_out(transport, &out) {
                    let _ = chunk.done.complete(Err(code));
                    return Outcome::Finish(code);
                }
                let _ = chunk.done.complete(Ok(()));
                if chunk.is_final {
                    active.phase = Phase::Receive;
                }
                Outcome::Progress
            }
            Phase::Receive => Self::receive(transport, active, read_buf, monitor),
        }
    }

    fn send_body(transport: &mut Transport, active: &mut Active, scratch: &mut [u8]) -> Outcome {
        let Some(body) = active.request.body().cloned() else {
            active.phase = Phase::Receive;
            return Outcome::Progress;
        };

        let mut buffer = MutableBuffer::new(scratch);
        let done = match lock_or_recover(&body).send_request_body(&mut buffer) {
            Ok(done) => done,
            Err(err) => {
                warn!(exchange = active.id, "request body read failed: {err}");
                return Outcome::Finish(ErrorCode::BODY_READ_FAILURE);
            }
        };

        let mut out = BytesMut::with_capacity(buffer.len() + 16);
        match active.framing {
            BodyFraming::Chunked => {
                h1::encode_chunk(buffer.filled(), &mut out);
                if done {
                    out.put_slice(h1::LAST_CHUNK);
                }
            }
            BodyFraming::Length | BodyFraming::None => out.put_slice(buffer.filled()),
        }

        if let Err(code) = write_out(transport, &out) {
            return Outcome::Finish(code);
        }
        if done {
            active.phase = Phase::Receive;
        }
        Outcome::Progress
    }

    fn receive(
        transport: &mut Transport,
        active: &mut Active,
        read_buf: &mut BytesMut,
        mut monitor: Option<&mut ThroughputMonitor>,
    ) -> Outcome {
        if active.pending_body.is_some() {
            if active.deliver_pending() {
                return Outcome::Progress;
            }
            // The consumer holds delivery; a paused transfer is not slow.
            if let Some(monitor) = monitor.as_mut() {
                monitor.reset(Instant::now());
            }
            return if active.pending_body.is_some() && active.window == Some(0) {
                Outcome::Wait
            } else {
                Outcome::Progress
            };
        }

        let event = match active.decoder.decode(read_buf) {
            Ok(event) => event,
            Err(err) => {
                warn!(exchange = active.id, "malformed response: {err}");
                return Outcome::Finish(err.code());
            }
        };

        match event {
            DecodeEvent::Head {
                block,
                status,
                headers,
            } => {
                if block == HeaderBlock::Main {
                    active.status = status;
                }
                active.sink.on_headers(block, status, &headers);
                active.sink.on_headers_done(block);
                Outcome::Progress
            }
            DecodeEvent::Body(data) => {
                if !data.is_empty() {
                    active.pending_body = Some(data);
                    active.deliver_pending();
                }
                Outcome::Progress
            }
            DecodeEvent::Trailers(trailers) => {
                active
                    .sink
                    .on_headers(HeaderBlock::Trailing, active.status, &trailers);
                active.sink.on_headers_done(HeaderBlock::Trailing);
                Outcome::Progress
            }
            DecodeEvent::Complete => Outcome::Finish(ErrorCode::SUCCESS),
            DecodeEvent::NeedMore => Self::read_more(transport, active, read_buf, monitor),
        }
    }

    fn read_more(
        transport: &mut Transport,
        active: &mut Active,
        read_buf: &mut BytesMut,
        mut monitor: Option<&mut ThroughputMonitor>,
    ) -> Outcome {
        let start = read_buf.len();
        read_buf.resize(start + READ_CHUNK, 0);
        let result = transport.read(&mut read_buf[start..]);
        let read = match &result {
            Ok(n) => *n,
            Err(_) => 0,
        };
        read_buf.truncate(start + read);

        let unhealthy = |monitor: &mut Option<&mut ThroughputMonitor>| {
            monitor
                .as_mut()
                .is_some_and(|monitor| monitor.check(Instant::now()))
        };

        match result {
            Ok(0) => Self::peer_closed(active),
            Ok(n) => {
                if let Some(monitor) = monitor.as_mut() {
                    monitor.record(n);
                }
                if unhealthy(&mut monitor) {
                    return Outcome::Finish(ErrorCode::CONNECTION_UNHEALTHY);
                }
                Outcome::Progress
            }
            Err(err) => match err.kind() {
                io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => {
                    if unhealthy(&mut monitor) {
                        warn!(exchange = active.id, "throughput below minimum; closing");
                        return Outcome::Finish(ErrorCode::CONNECTION_UNHEALTHY);
                    }
                    Outcome::Poll
                }
                io::ErrorKind::Interrupted => Outcome::Progress,
                io::ErrorKind::UnexpectedEof => Self::peer_closed(active),
                _ => {
                    warn!(exchange = active.id, "socket read failed: {err}");
                    Outcome::Finish(ErrorCode::from_io(&err))
                }
            },
        }
    }

    fn peer_closed(active: &mut Active) -> Outcome {
        match active.decoder.finish_on_eof() {
            Ok(_) => Outcome::Finish(ErrorCode::SUCCESS),
            Err(err) => Outcome::Finish(err.code()),
        }
    }

    /// Ends the active exchange. The connection's fate is settled before the
    /// sink hears about it so a release from inside `on_complete` sees it.
    fn finish(&self, driver: &mut Driver, code: ErrorCode) {
        let Some(active) = driver.active.take() else {
            return;
        };

        let reusable =
            code.is_success() && active.decoder.is_finished() && active.decoder.keep_alive();
        if !reusable {
            let reason = if code.is_success() {
                ErrorCode::CONNECTION_CLOSED
            } else {
                code
            };
            self.close_transport(driver, reason);
        }

        for chunk in active.chunks {
            let _ = chunk.done.complete(Err(driver.closed_with));
        }

        if code.is_success() {
            debug!(
                connection = self.id,
                exchange = active.id,
                status = active.status,
                reusable,
                "exchange complete"
            );
        } else {
            info!(connection = self.id, exchange = active.id, %code, "exchange failed");
        }
        active.sink.on_complete(code);
    }

    fn close_transport(&self, driver: &mut Driver, reason: ErrorCode) {
        self.open.store(false, Ordering::Release);
        driver.closed_with = reason;
        driver.read_buf.clear();
        if let Some(mut transport) = driver.transport.take() {
            debug!(connection = self.id, %reason, "closing transport");
            transport.close();
        }
    }

    /// Closes the connection and completes every exchange it still owns.
    fn terminate(&self, driver: &mut Driver, code: ErrorCode) {
        self.close_transport(driver, code);

        if let Some(active) = driver.active.take() {
            for chunk in active.chunks {
                let _ = chunk.done.complete(Err(code));
            }
            active.sink.on_complete(code);
        }

        let (queued, chunks) = {
            let mut mailbox = lock_or_recover(&self.mailbox);
            (
                std::mem::take(&mut mailbox.queue),
                std::mem::take(&mut mailbox.chunks),
            )
        };
        for chunk in chunks {
            let _ = chunk.done.complete(Err(code));
        }
        for (_, exchange) in queued {
            exchange.sink.on_complete(code);
        }
    }

    /// Notices a peer close on a connection with no exchange in flight.
    /// A busy driver is left alone; the loop sees the close itself on the
    /// next read.
    fn idle_transport_alive(&self) -> bool {
        let mut driver = match self.driver.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => return true,
        };
        if driver.active.is_some() {
            return true;
        }
        match driver.transport.as_ref() {
            None => false,
            Some(transport) if transport.is_stale() => {
                debug!(connection = self.id, "peer closed idle connection");
                self.close_transport(&mut driver, ErrorCode::SOCKET_CLOSED);
                false
            }
            Some(_) => true,
        }
    }

    fn mailbox(&self) -> MutexGuard<'_, Mailbox> {
        lock_or_recover(&self.mailbox)
    }
}

fn write_out(transport: &mut Transport, bytes: &[u8]) -> Result<(), ErrorCode> {
    transport
        .write_all(bytes)
        .and_then(|()| transport.flush())
        .map_err(|err| {
            warn!("socket write failed: {err}");
            ErrorCode::from_io(&err)
        })
}

impl EngineConnection for H1Channel {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire) && self.idle_transport_alive()
    }

    fn submit(&self, exchange: Exchange) -> Result<ExchangeId, EngineFailure> {
        let id = {
            let mut mailbox = self.mailbox();
            if !self.is_open() || mailbox.shutdown.is_some() {
                return Err(EngineFailure::new(
                    ErrorCode::CONNECTION_CLOSED,
                    format!("connection {} is closed", self.id),
                ));
            }
            let id = self.next_exchange.fetch_add(1, Ordering::Relaxed);
            mailbox.queue.push_back((id, exchange));
            id
        };
        self.wake();
        Ok(id)
    }

    fn write_chunk(&self, exchange: ExchangeId, data: Bytes, is_final: bool, done: ChunkCompleter) {
        self.mailbox().chunks.push_back(QueuedChunk {
            exchange,
            data,
            is_final,
            done,
        });
        self.wake();
    }

    fn update_window(&self, exchange: ExchangeId, increment: u64) {
        if increment == 0 {
            return;
        }
        {
            let mut mailbox = self.mailbox();
            let queued = mailbox
                .queue
                .iter_mut()
                .find(|(id, _)| *id == exchange)
                .and_then(|(_, queued)| queued.window.as_mut());
            match queued {
                Some(window) => *window = window.saturating_add(increment),
                None => mailbox.window_updates.push((exchange, increment)),
            }
        }
        self.wake();
    }

    fn cancel(&self, exchange: ExchangeId, code: ErrorCode) {
        self.mailbox().cancels.push((exchange, code));
        self.wake();
    }

    fn shutdown(&self, code: ErrorCode) {
        {
            let mut mailbox = self.mailbox();
            self.open.store(false, Ordering::Release);
            mailbox.shutdown.get_or_insert(code);
        }
        self.wake();
    }
}

#[cfg(test)]
mod tests {
    use std::io::{BufRead, BufReader, Write};
    use std::net::{TcpListener, TcpStream};
    use std::sync::mpsc;
    use std::thread;
    use std::time::{Duration, Instant};

    use super::*;
    use crate::engine::EventLoopGroup;
    use crate::http::Headers;
    use crate::runtime;

    #[derive(Debug, PartialEq)]
    enum Seen {
        Headers(HeaderBlock, u16),
        Done(HeaderBlock),
        Body(Vec<u8>),
        Complete(ErrorCode),
    }

    struct RecordingSink {
        events: mpsc::Sender<Seen>,
        increment: u64,
    }

    impl ExchangeSink for RecordingSink {
        fn on_headers(&self, block: HeaderBlock, status: u16, _headers: &Headers) {
            let _ = self.events.send(Seen::Headers(block, status));
        }

        fn on_headers_done(&self, block: HeaderBlock) {
            let _ = self.events.send(Seen::Done(block));
        }

        fn on_body(&self, data: &[u8]) -> u64 {
            let _ = self.events.send(Seen::Body(data.to_vec()));
            self.increment
        }

        fn on_complete(&self, code: ErrorCode) {
            let _ = self.events.send(Seen::Complete(code));
        }
    }

    /// Accepts one connection, reads one request head, writes `reply`.
    fn one_shot_server(reply: &'static [u8]) -> (u16, thread::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let port = listener.local_addr().expect("addr").port();
        let handle = thread::spawn(move || {
            let (stream, _) = listener.accept().expect("accept");
            let mut reader = BufReader::new(stream.try_clone().expect("clone"));
            let mut head = String::new();
            loop {
                let mut line = String::new();
                if reader.read_line(&mut line).expect("read") == 0 || line == "\r\n" {
                    break;
                }
                head.push_str(&line);
            }
            (&stream).write_all(reply).expect("reply");
            thread::sleep(Duration::from_millis(200));
            head
        });
        (port, handle)
    }

    fn channel_to(port: u16, group: &EventLoopGroup) -> Arc<H1Channel> {
        let tcp = TcpStream::connect(("127.0.0.1", port)).expect("connect");
        let transport = Transport::Plain(tcp);
        transport.set_read_timeout(Some(READ_TICK)).expect("timeout");
        let params = ConnectParams::new("127.0.0.1", port);
        H1Channel::new(1, group.next_loop(), transport, &params)
    }

    fn collect(rx: &mpsc::Receiver<Seen>) -> Vec<Seen> {
        let mut seen = Vec::new();
        while let Ok(event) = rx.recv_timeout(Duration::from_secs(5)) {
            let done = matches!(event, Seen::Complete(_));
            seen.push(event);
            if done {
                break;
            }
        }
        seen
    }

    #[test]
    fn runs_an_exchange_in_callback_order() {
        runtime::init();
        let group = EventLoopGroup::new(1).expect("group");
        let (port, server) =
            one_shot_server(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello");
        let channel = channel_to(port, &group);

        let (tx, rx) = mpsc::channel();
        let request = Request::get("/ping").build().expect("request");
        channel
            .submit(Exchange {
                request,
                sink: Arc::new(RecordingSink {
                    events: tx,
                    increment: 0,
                }),
                window: None,
            })
            .expect("submitted");

        let seen = collect(&rx);
        assert_eq!(
            seen,
            vec![
                Seen::Headers(HeaderBlock::Main, 200),
                Seen::Done(HeaderBlock::Main),
                Seen::Body(b"hello".to_vec()),
                Seen::Complete(ErrorCode::SUCCESS),
            ]
        );
        assert!(channel.is_open());

        let head = server.join().expect("server");
        assert!(head.starts_with("GET /ping HTTP/1.1\r\n"));
        assert!(head.contains(&format!("Host: 127.0.0.1:{port}\r\n")));

        // The server thread dropped its socket; the idle channel notices.
        let deadline = Instant::now() + Duration::from_secs(2);
        while channel.is_open() {
            assert!(Instant::now() < deadline, "peer close never noticed");
            thread::sleep(Duration::from_millis(10));
        }
        group.close();
    }

    #[test]
    fn window_holds_body_until_updated() {
        runtime::init();
        let group = EventLoopGroup::new(1).expect("group");
        let (port, _server) =
            one_shot_server(b"HTTP/1.1 200 OK\r\nContent-Length: 8\r\n\r\nabcdefgh");
        let channel = channel_to(port, &group);

        let (tx, rx) = mpsc::channel();
        let id = channel
            .submit(Exchange {
                request: Request::get("/").build().expect("request"),
                sink: Arc::new(RecordingSink {
                    events: tx,
                    increment: 0,
                }),
                window: Some(3),
            })
            .expect("submitted");

        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).ok(), Some(Seen::Headers(HeaderBlock::Main, 200)));
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).ok(), Some(Seen::Done(HeaderBlock::Main)));
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).ok(), Some(Seen::Body(b"abc".to_vec())));
        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());

        channel.update_window(id, 100);
        let rest = collect(&rx);
        assert_eq!(
            rest,
            vec![Seen::Body(b"defgh".to_vec()), Seen::Complete(ErrorCode::SUCCESS)]
        );
        group.close();
    }

    #[test]
    fn shutdown_completes_queued_exchanges() {
        runtime::init();
        let group = EventLoopGroup::new(1).expect("group");
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let port = listener.local_addr().expect("addr").port();
        let channel = channel_to(port, &group);
        let _accepted = listener.accept().expect("accept");

        let (tx, rx) = mpsc::channel();
        channel
            .submit(Exchange {
                request: Request::get("/slow").build().expect("request"),
                sink: Arc::new(RecordingSink {
                    events: tx,
                    increment: 0,
                }),
                window: None,
            })
            .expect("submitted");

        channel.shutdown(ErrorCode::CONNECTION_CLOSED);
        assert!(!channel.is_open());
        assert_eq!(collect(&rx), vec![Seen::Complete(ErrorCode::CONNECTION_CLOSED)]);

        let err = channel
            .submit(Exchange {
                request: Request::get("/late").build().expect("request"),
                sink: Arc::new(RecordingSink {
                    events: mpsc::channel().0,
                    increment: 0,
                }),
                window: None,
            })
            .expect_err("closed");
        assert_eq!(err.code, ErrorCode::CONNECTION_CLOSED);
        group.close();
    }
}
