//! Resource lifecycle across the whole stack.
//!
//! WHY: Event loops, resolver, bootstrap and manager shut down
//! asynchronously and in dependency order; a leak or early teardown only
//! shows when they are combined.
//!
//! WHAT: Bootstrap teardown waiting on a manager, borrowed versus owned
//! children, and a manager built from a TOML file.
//!
//! HOW: Real event loops against `TestHttpServer`; serial because every test
//! counts live engine resources.

use std::time::Duration;

use foundation_http::config::HttpClientConfig;
use foundation_http::engine::{ClientBootstrap, EventLoopGroup, HostResolver, HostResolverOptions};
use foundation_http::http::{
    CollectingHandler, ConnectionManagerOptions, HttpClientConnectionManager, Request,
};
use foundation_http::{ErrorCode, HttpError};
use foundation_testing::http::TestHttpServer;
use ntest::timeout;
use serial_test::serial;

const SHUTDOWN: Duration = Duration::from_secs(5);

fn roundtrip(manager: &HttpClientConnectionManager) -> String {
    let connection = manager.acquire_connection().wait().expect("lease");
    let (handler, response) = CollectingHandler::new();
    let stream = connection
        .make_request(Request::get("/ping").build().expect("request"), handler)
        .expect("stream");
    stream.activate().expect("activate");
    let response = response.wait().expect("response");
    manager.release_connection(&connection).expect("release");
    response.body_text()
}

/// WHY: a bootstrap must not tear down event loops a manager still uses.
/// WHAT: closing the bootstrap first keeps it alive until the manager shuts
/// down; the owned group then closes with it.
#[test]
#[serial]
#[timeout(15000)]
fn bootstrap_teardown_waits_for_the_manager() {
    foundation_http::runtime::init();
    let server = TestHttpServer::start();
    let bootstrap = ClientBootstrap::create_owned(1, HostResolverOptions::default())
        .expect("bootstrap");
    let group = bootstrap.event_loop_group().clone();
    let manager = HttpClientConnectionManager::new(
        ConnectionManagerOptions::builder(server.base_url())
            .bootstrap(bootstrap.clone())
            .build()
            .expect("options"),
    )
    .expect("manager");
    assert_eq!(roundtrip(&manager), "OK");

    bootstrap.close();
    assert!(bootstrap
        .wait_for_shutdown()
        .wait_timeout(Duration::from_millis(200))
        .is_none());
    assert!(!group.is_closed());
    assert_eq!(roundtrip(&manager), "OK");

    let late = HttpClientConnectionManager::new(
        ConnectionManagerOptions::builder(server.base_url())
            .bootstrap(bootstrap.clone())
            .build()
            .expect("options"),
    );
    assert!(matches!(late, Err(HttpError::ResourceClosed(_))));

    manager.close();
    assert!(manager.wait_for_shutdown().wait_timeout(SHUTDOWN).is_some());
    assert!(bootstrap.wait_for_shutdown().wait_timeout(SHUTDOWN).is_some());
    assert!(group.wait_for_shutdown().wait_timeout(SHUTDOWN).is_some());
    assert!(server.wait_until(SHUTDOWN, |s| s.open_connections() == 0));
}

/// WHY: callers sharing one event loop group between bootstraps keep
/// ownership of it.
/// WHAT: two bootstraps on a borrowed group shut down independently and
/// leave the group and resolver running.
#[test]
#[serial]
#[timeout(15000)]
fn borrowed_resources_outlive_their_bootstraps() {
    foundation_http::runtime::init();
    let server = TestHttpServer::start();
    let group = EventLoopGroup::new(2).expect("group");
    let resolver = HostResolver::new(&group, HostResolverOptions::default()).expect("resolver");

    for _ in 0..2 {
        let bootstrap = ClientBootstrap::new(&group, &resolver).expect("bootstrap");
        let manager = HttpClientConnectionManager::new(
            ConnectionManagerOptions::builder(server.base_url())
                .bootstrap(bootstrap.clone())
                .build()
                .expect("options"),
        )
        .expect("manager");
        assert_eq!(roundtrip(&manager), "OK");

        manager.close();
        assert!(manager.wait_for_shutdown().wait_timeout(SHUTDOWN).is_some());
        drop(manager);
        bootstrap.close();
        assert!(bootstrap.wait_for_shutdown().wait_timeout(SHUTDOWN).is_some());
        assert!(!group.is_closed());
        assert!(!resolver.is_closed());
    }

    resolver.close();
    group.close();
    assert!(group.wait_for_shutdown().wait_timeout(SHUTDOWN).is_some());
    assert!(matches!(
        ClientBootstrap::new(&group, &resolver),
        Err(HttpError::ResourceClosed(_))
    ));
}

/// WHY: dropping the last handle must be as good as closing.
/// WHAT: dropping manager and bootstrap without an explicit close still
/// closes the pooled socket.
#[test]
#[serial]
#[timeout(15000)]
fn dropping_handles_releases_everything() {
    foundation_http::runtime::init();
    let server = TestHttpServer::start();
    let bootstrap = ClientBootstrap::create_owned(1, HostResolverOptions::default())
        .expect("bootstrap");
    let group = bootstrap.event_loop_group().clone();
    let manager = HttpClientConnectionManager::new(
        ConnectionManagerOptions::builder(server.base_url())
            .bootstrap(bootstrap)
            .build()
            .expect("options"),
    )
    .expect("manager");
    assert_eq!(roundtrip(&manager), "OK");
    assert_eq!(server.open_connections(), 1);

    drop(manager);
    assert!(server.wait_until(SHUTDOWN, |s| s.open_connections() == 0));
    assert!(group.wait_for_shutdown().wait_timeout(SHUTDOWN).is_some());
}

/// WHY: the file based setup must produce the same working client.
/// WHAT: a manager built from TOML serves a request and honours the pool
/// section.
#[test]
#[serial]
#[timeout(15000)]
fn manager_from_config_file_serves_requests() {
    foundation_http::runtime::init();
    let server = TestHttpServer::start();
    let config = HttpClientConfig::from_toml(&format!(
        r#"
        uri = "{}"

        [event_loop]
        threads = 1

        [pool]
        max_connections = 1
        idle_timeout_ms = 60000

        [socket]
        connect_timeout_ms = 2000
        nodelay = true
        "#,
        server.base_url()
    ))
    .expect("config");

    let manager = config.build_manager().expect("manager");
    assert_eq!(manager.options().max_connections(), 1);
    assert_eq!(
        manager.options().idle_timeout(),
        Some(Duration::from_secs(60))
    );
    assert_eq!(roundtrip(&manager), "OK");

    let bootstrap = manager.options().bootstrap().cloned().expect("bootstrap");
    manager.close();
    assert!(manager.wait_for_shutdown().wait_timeout(SHUTDOWN).is_some());
    drop(manager);
    bootstrap.close();
    assert!(bootstrap.wait_for_shutdown().wait_timeout(SHUTDOWN).is_some());
}

/// WHY: a configuration with an unreachable target must still fail through
/// the acquisition, not at build time.
/// WHAT: the acquisition reports a connect failure code.
#[test]
#[serial]
#[timeout(15000)]
fn unreachable_target_from_config_fails_acquisition() {
    foundation_http::runtime::init();
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
        listener.local_addr().expect("addr").port()
    };
    let config = HttpClientConfig::from_toml(&format!(
        "uri = \"http://127.0.0.1:{port}\"\n[event_loop]\nthreads = 1\n"
    ))
    .expect("config");

    let manager = config.build_manager().expect("manager");
    let err = manager.acquire_connection().wait().expect_err("refused");
    assert_eq!(err.code(), Some(ErrorCode::CONNECTION_REFUSED));

    let bootstrap = manager.options().bootstrap().cloned().expect("bootstrap");
    drop(manager);
    bootstrap.close();
    assert!(bootstrap.wait_for_shutdown().wait_timeout(SHUTDOWN).is_some());
}
