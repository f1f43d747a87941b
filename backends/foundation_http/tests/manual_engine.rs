//! Pool and stream behaviour driven by the scripted engine.
//!
//! WHY: Some paths (unhealthy completions, abandoned acquisitions, window
//! bookkeeping before submission) are timing dependent over real sockets.
//!
//! WHAT: Exercises those paths deterministically.
//!
//! HOW: `foundation_http::engine::testing::ManualEngine` resolves connects
//! and plays the response side of each exchange on the test thread.

use std::sync::Arc;
use std::time::Duration;

use foundation_http::engine::testing::{ManualConnection, ManualEngine};
use foundation_http::engine::{EngineConnection, TransportEngine};
use foundation_http::http::{
    CollectingHandler, ConnectionManagerOptions, ConnectionManagerOptionsBuilder, HeaderBlock,
    Headers, HttpClientConnectionManager, Request, StreamState,
};
use foundation_http::{ErrorCode, HttpError};
use ntest::timeout;
use tracing_test::traced_test;

fn manager(
    engine: &ManualEngine,
    configure: impl FnOnce(ConnectionManagerOptionsBuilder) -> ConnectionManagerOptionsBuilder,
) -> HttpClientConnectionManager {
    let options = configure(ConnectionManagerOptions::builder("http://pool.test:8080"))
        .build()
        .expect("options");
    HttpClientConnectionManager::with_engine(
        options,
        Arc::new(engine.clone()) as Arc<dyn TransportEngine>,
    )
    .expect("manager")
}

fn connect_one(engine: &ManualEngine) -> Arc<ManualConnection> {
    assert!(engine.wait_for_connects(1, Duration::from_secs(2)));
    engine.succeed_next().expect("pending connect")
}

// ========================================================================
// Connection health
// ========================================================================

/// WHY: a connection whose exchange failed must not be handed out again.
/// WHAT: after a `CONNECTION_UNHEALTHY` completion the released connection
/// is discarded and the next acquisition opens a new one.
#[test]
#[timeout(5000)]
#[traced_test]
fn unhealthy_connections_are_discarded() {
    let engine = ManualEngine::new();
    let pool = manager(&engine, |b| b.max_connections(1));

    let acquisition = pool.acquire_connection();
    let scripted = connect_one(&engine);
    let connection = acquisition.wait().expect("lease");

    let (handler, response) = CollectingHandler::new();
    let stream = connection
        .make_request(Request::get("/").build().expect("request"), handler)
        .expect("stream");
    stream.activate().expect("activate");
    let exchange = scripted
        .wait_for_exchange(1, Duration::from_secs(1))
        .expect("submitted");
    assert!(scripted.complete(exchange, ErrorCode::CONNECTION_UNHEALTHY));
    assert_eq!(
        response.wait().expect("response").error_code,
        ErrorCode::CONNECTION_UNHEALTHY
    );

    pool.release_connection(&connection).expect("release");
    assert_eq!(pool.metrics().live, 0);
    assert_eq!(scripted.shutdown_code(), Some(ErrorCode::CONNECTION_CLOSED));

    let next = pool.acquire_connection();
    assert!(engine.wait_for_connects(1, Duration::from_secs(1)));
    assert_eq!(pool.metrics().connecting, 1);
    drop(next);
    drop(stream);
}

/// WHY: an acquisition nobody waits for must not strand a connection.
/// WHAT: dropping the acquisition before the connect resolves returns the
/// new connection to the idle set.
#[test]
#[timeout(5000)]
fn dropped_acquisitions_return_their_connection() {
    let engine = ManualEngine::new();
    let pool = manager(&engine, |b| b.max_connections(1));

    let acquisition = pool.acquire_connection();
    assert!(engine.wait_for_connects(1, Duration::from_secs(1)));
    drop(acquisition);

    engine.succeed_next().expect("pending connect");
    let metrics = pool.metrics();
    assert_eq!(metrics.leased, 0);
    assert_eq!(metrics.available, 1);
    assert_eq!(metrics.live, 1);

    let again = pool.acquire_connection().wait().expect("idle lease");
    assert_eq!(again.id(), engine.connections()[0].id());
}

/// WHY: a peer closing an idle connection must be noticed on the next
/// acquisition.
/// WHAT: the dead idle connection is skipped and a fresh connect starts.
#[test]
#[timeout(5000)]
fn dead_idle_connections_are_skipped() {
    let engine = ManualEngine::new();
    let pool = manager(&engine, |b| b.max_connections(1));

    let acquisition = pool.acquire_connection();
    let scripted = connect_one(&engine);
    drop(acquisition.wait().expect("lease"));
    assert_eq!(pool.metrics().available, 1);

    scripted.close_remotely();
    let next = pool.acquire_connection();
    assert!(engine.wait_for_connects(1, Duration::from_secs(1)));
    let fresh = engine.succeed_next().expect("pending connect");
    let connection = next.wait().expect("fresh lease");
    assert_eq!(connection.id(), fresh.id());
    assert_eq!(pool.metrics().live, 1);
}

// ========================================================================
// Windows and chunks
// ========================================================================

/// WHY: manual windows must reach the engine no matter when the caller
/// widens them.
/// WHAT: the exchange is submitted with the configured window; an increment
/// requested before activation is flushed once the id is known, later ones
/// go straight through.
#[test]
#[timeout(5000)]
fn window_increments_reach_the_engine() {
    let engine = ManualEngine::new();
    let pool = manager(&engine, |b| {
        b.manual_window_management(true).initial_window_size(16)
    });

    let acquisition = pool.acquire_connection();
    let scripted = connect_one(&engine);
    let connection = acquisition.wait().expect("lease");

    let (handler, _response) = CollectingHandler::new();
    let stream = connection
        .make_request(Request::get("/").build().expect("request"), handler)
        .expect("stream");
    stream.increment_window(4);
    assert_eq!(stream.window_size(), Some(20));
    stream.activate().expect("activate");

    let exchange = stream.id().expect("exchange id");
    assert_eq!(scripted.initial_window(exchange), Some(16));
    assert_eq!(scripted.window_updates(), vec![(exchange, 4)]);

    assert!(scripted.send_headers(exchange, HeaderBlock::Main, 200, &Headers::default()));
    assert_eq!(scripted.send_body(exchange, b"abcdef"), Some(6));
    assert_eq!(stream.window_size(), Some(20));
    assert_eq!(stream.state(), StreamState::BodyReceiving);

    stream.increment_window(8);
    assert_eq!(scripted.window_updates(), vec![(exchange, 4), (exchange, 8)]);
    assert!(scripted.complete(exchange, ErrorCode::SUCCESS));
    stream.increment_window(8);
    assert_eq!(scripted.window_updates().len(), 2);
}

/// WHY: chunk writes are a thin pass-through the engine must see in order.
/// WHAT: both chunks are recorded with their final flag and each write
/// resolves.
#[test]
#[timeout(5000)]
fn chunk_writes_are_recorded_in_order() {
    let engine = ManualEngine::new();
    let pool = manager(&engine, |b| b);

    let acquisition = pool.acquire_connection();
    let scripted = connect_one(&engine);
    let connection = acquisition.wait().expect("lease");

    let (handler, _response) = CollectingHandler::new();
    let stream = connection
        .make_request(Request::post("/").chunked().build().expect("request"), handler)
        .expect("stream");
    stream.activate().expect("activate");

    stream.write_chunk(&b"one"[..], false).expect("write").wait().expect("first");
    stream.write_chunk(&b"two"[..], true).expect("write").wait().expect("second");

    let chunks = scripted.chunks();
    assert_eq!(chunks.len(), 2);
    assert_eq!(&chunks[0].data[..], b"one");
    assert!(!chunks[0].is_final);
    assert!(chunks[1].is_final);

    scripted.close_remotely();
    let err = stream
        .write_chunk(&b"late"[..], true)
        .and_then(|write| write.wait())
        .expect_err("closed");
    assert!(matches!(err, HttpError::Precondition(_) | HttpError::Stream { .. }));
}

/// WHY: activation must fail cleanly on a connection that died while
/// leased.
/// WHAT: the stream reports `CONNECTION_CLOSED`, moves to closed and its
/// completion resolves without calling the handler.
#[test]
#[timeout(5000)]
fn activation_on_a_closed_connection_fails() {
    let engine = ManualEngine::new();
    let pool = manager(&engine, |b| b);

    let acquisition = pool.acquire_connection();
    let scripted = connect_one(&engine);
    let connection = acquisition.wait().expect("lease");
    scripted.close_remotely();

    let (handler, response) = CollectingHandler::new();
    let stream = connection
        .make_request(Request::get("/").build().expect("request"), handler)
        .expect("stream");
    let err = stream.activate().expect_err("closed connection");
    assert_eq!(err.code(), Some(ErrorCode::CONNECTION_CLOSED));
    assert_eq!(stream.state(), StreamState::Closed);
    assert_eq!(stream.completion().wait(), ErrorCode::CONNECTION_CLOSED);

    drop(stream);
    assert!(response.wait().is_err());
}

// ========================================================================
// Idle expiry and shutdown
// ========================================================================

/// WHY: expiry must only close connections idle for the whole timeout.
/// WHAT: a connection reused before the timer fires survives it; once left
/// idle it is shut down.
#[test]
#[timeout(5000)]
fn idle_expiry_spares_reused_connections() {
    let engine = ManualEngine::new();
    let pool = manager(&engine, |b| b.idle_timeout(Duration::from_millis(150)));

    let acquisition = pool.acquire_connection();
    let scripted = connect_one(&engine);
    pool.release_connection(&acquisition.wait().expect("lease"))
        .expect("release");

    std::thread::sleep(Duration::from_millis(50));
    let reused = pool.acquire_connection().wait().expect("reused");
    std::thread::sleep(Duration::from_millis(200));
    assert!(scripted.shutdown_code().is_none());
    pool.release_connection(&reused).expect("release");

    std::thread::sleep(Duration::from_millis(400));
    assert!(scripted.shutdown_code().is_some());
    assert_eq!(pool.metrics().live, 0);
}

/// WHY: the manager must keep its engine alive until shutdown completes.
/// WHAT: the engine hold is released only after the last lease returns.
#[test]
#[timeout(5000)]
fn engine_hold_outlives_outstanding_leases() {
    let engine = ManualEngine::new();
    let pool = manager(&engine, |b| b);
    assert_eq!(engine.active_holds(), 1);

    let acquisition = pool.acquire_connection();
    connect_one(&engine);
    let connection = acquisition.wait().expect("lease");

    drop(pool);
    assert_eq!(engine.active_holds(), 1);
    drop(connection);
    assert_eq!(engine.active_holds(), 0);
    assert_eq!(
        engine.connections()[0].shutdown_code(),
        Some(ErrorCode::MANAGER_SHUTTING_DOWN)
    );
}

/// WHY: connect attempts in flight when the engine goes away must still
/// resolve their waiter.
/// WHAT: closing the engine fails the pending acquisition with an event
/// loop shutdown code.
#[test]
#[timeout(5000)]
fn engine_shutdown_fails_pending_connects() {
    let engine = ManualEngine::new();
    let pool = manager(&engine, |b| b);

    let acquisition = pool.acquire_connection();
    assert!(engine.wait_for_connects(1, Duration::from_secs(1)));
    engine.close();

    let err = acquisition.wait().expect_err("engine closed");
    assert_eq!(err.code(), Some(ErrorCode::EVENT_LOOP_SHUTDOWN));
    assert_eq!(pool.metrics().connecting, 0);
}
