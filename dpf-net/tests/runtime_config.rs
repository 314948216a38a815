//! Runs in its own test binary since it changes the process-wide runtime
//! configuration.

mod common;

use dpf_core::runtime_config;
use dpf_net::mock::MockEngine;
use dpf_net::Error;

use common::{local, on_both_transports};

#[test]
fn core_config_round_trip() {
    on_both_transports(MockEngine::new, |_, session| {
        let core = session.get_runtime_core_config().unwrap();
        assert_eq!(core.num_threads().unwrap(), Some(4));
        core.set_num_threads(8).unwrap();
        assert_eq!(core.num_threads().unwrap(), Some(8));
        core.set_license_timeout_in_seconds(2.5).unwrap();
        assert_eq!(core.license_timeout_in_seconds().unwrap(), Some(2.5));
    });
}

#[test]
fn client_config_updates_the_process_wide_options() {
    let (_, session) = local(MockEngine::new());
    let client = session.get_runtime_client_config().unwrap();
    assert_eq!(client.return_arrays().unwrap(), Some(true));

    client.set_streaming_buffer_size(1 << 16).unwrap();
    assert_eq!(client.streaming_buffer_size().unwrap(), Some(1 << 16));
    assert_eq!(runtime_config().streaming_buffer_size, 1 << 16);

    // rejected locally, nothing reaches the server
    let calls = session.stats().calls;
    assert!(matches!(
        client.set("streaming_buffer_size", "0"),
        Err(Error::InvalidArgument(_))
    ));
    assert!(client.set("no_such_option", "1").is_err());
    assert_eq!(session.stats().calls, calls);
    assert_eq!(runtime_config().streaming_buffer_size, 1 << 16);
}

#[test]
fn runtime_config_is_version_gated() {
    let (_, session) = local(MockEngine::new().with_version("3.2"));
    assert!(matches!(
        session.get_runtime_core_config(),
        Err(Error::VersionUnsupported { .. })
    ));
    assert!(matches!(
        session.get_runtime_client_config(),
        Err(Error::VersionUnsupported { .. })
    ));
}
