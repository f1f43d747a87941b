//! Runtime initialisation gate.
//!
//! WHY: Engine resources built before `runtime::init` must be refused, and
//! the check is process wide, so it lives in its own test binary.
//!
//! WHAT: Construction fails with `NotInitialized` before init and after
//! shutdown, and succeeds in between.

use foundation_http::engine::{ClientBootstrap, EventLoopGroup};
use foundation_http::{runtime, HttpError};
use serial_test::serial;

/// WHY: nothing may spin up threads before the library is initialised.
/// WHAT: group and bootstrap creation follow the init/shutdown state, and
/// resources built while initialised keep working after shutdown.
#[test]
#[serial]
fn engine_resources_require_init() {
    assert!(!runtime::is_initialized());
    assert!(matches!(EventLoopGroup::new(1), Err(HttpError::NotInitialized)));
    assert!(matches!(
        ClientBootstrap::with_defaults(),
        Err(HttpError::NotInitialized)
    ));

    assert!(runtime::init());
    assert!(!runtime::init());
    let group = EventLoopGroup::new(1).expect("group after init");

    assert!(runtime::shutdown());
    assert!(!runtime::shutdown());
    assert!(matches!(EventLoopGroup::new(1), Err(HttpError::NotInitialized)));
    assert!(!group.is_closed());
    assert!(group.next_loop().execute(|| {}));

    group.close();
}
