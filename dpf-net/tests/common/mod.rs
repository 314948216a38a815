#![allow(dead_code)]

use std::sync::{Arc, Once};

use simplelog::{Config, LevelFilter, TestLogger};

use dpf_net::mock::MockEngine;
use dpf_net::Session;

static LOGGER: Once = Once::new();

pub fn init_logging() {
    LOGGER.call_once(|| {
        let _ = TestLogger::init(LevelFilter::Debug, Config::default());
    });
}

/// Session over the local transport.
pub fn local(engine: MockEngine) -> (Arc<MockEngine>, Session) {
    init_logging();
    let engine = Arc::new(engine);
    let session = Session::local(engine.clone()).unwrap();
    (engine, session)
}

/// Session over the remote transport, talking to the engine served on an
/// ephemeral local port.
pub fn remote(engine: MockEngine) -> (Arc<MockEngine>, Session) {
    init_logging();
    let engine = Arc::new(engine);
    let port = engine.clone().spawn_server().unwrap();
    let session = Session::connect("127.0.0.1", port).unwrap();
    (engine, session)
}

/// Runs `test` once over each transport, with a fresh engine each time.
pub fn on_both_transports<M, F>(make: M, test: F)
where
    M: Fn() -> MockEngine,
    F: Fn(&MockEngine, &Session),
{
    let (engine, session) = local(make());
    test(&engine, &session);
    let (engine, session) = remote(make());
    test(&engine, &session);
}
