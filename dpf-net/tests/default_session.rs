//! Runs in its own test binary since it owns the process-wide default slot.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use dpf_net::mock::MockEngine;
use dpf_net::{default_session, reset_default_session, set_default_factory, Operator, Session};

static CREATED: AtomicUsize = AtomicUsize::new(0);

#[test]
fn default_session_is_created_once_and_replaceable() {
    common::init_logging();
    set_default_factory(|| {
        CREATED.fetch_add(1, Ordering::SeqCst);
        Session::local(Arc::new(MockEngine::new()))
    })
    .unwrap();

    let a = default_session().unwrap();
    let b = default_session().unwrap();
    assert!(a.ptr_eq(&b));
    assert_eq!(CREATED.load(Ordering::SeqCst), 1);
    Operator::new(&a, "forward").unwrap();

    // a shut down default is replaced on next use
    a.shutdown().unwrap();
    let c = default_session().unwrap();
    assert!(!c.ptr_eq(&a));
    assert_eq!(CREATED.load(Ordering::SeqCst), 2);

    let previous = reset_default_session().unwrap().unwrap();
    assert!(previous.ptr_eq(&c));
}
