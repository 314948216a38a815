//! Runs in its own test binary since it enables the process-wide cache.

mod common;

use dpf_core::{update_runtime_config, ValueType};
use dpf_net::mock::MockEngine;
use dpf_net::{Operator, Value};

use common::on_both_transports;

#[test]
fn pure_outputs_are_memoized_until_inputs_change() {
    update_runtime_config(|c| c.use_cache = true).unwrap();

    on_both_transports(MockEngine::new, |_, session| {
        let op = Operator::new(session, "min_max").unwrap();
        op.connect(0, vec![7.0, 3.0]).unwrap();

        let first = op.get_output(0, ValueType::Double).unwrap();
        let calls = session.stats().calls;
        let second = op.get_output(0, ValueType::Double).unwrap();
        assert_eq!(first, second);
        assert_eq!(session.stats().calls, calls);

        op.connect(0, vec![7.0, -3.0]).unwrap();
        assert_eq!(
            op.get_output(0, ValueType::Double).unwrap(),
            Value::Double(-3.0)
        );
    });
}

#[test]
fn impure_outputs_are_not_memoized() {
    update_runtime_config(|c| c.use_cache = true).unwrap();

    on_both_transports(MockEngine::new, |_, session| {
        let op = Operator::new(session, "make_string_field").unwrap();
        op.connect(0, vec!["a".to_string()]).unwrap();
        let calls = session.stats().calls;
        let a = op
            .get_output(0, ValueType::Object(dpf_core::ObjectKind::StringField))
            .unwrap();
        let b = op
            .get_output(0, ValueType::Object(dpf_core::ObjectKind::StringField))
            .unwrap();
        assert_ne!(a, b);
        assert!(session.stats().calls > calls + 1);
    });
}

#[test]
fn downstream_outputs_follow_upstream_inputs() {
    update_runtime_config(|c| c.use_cache = true).unwrap();

    on_both_transports(MockEngine::new, |_, session| {
        let upstream = Operator::new(session, "forward").unwrap();
        let downstream = Operator::new(session, "forward").unwrap();
        downstream.connect_output(0, &upstream, 0).unwrap();

        upstream.connect(0, 1.0).unwrap();
        assert_eq!(
            downstream.get_output(0, ValueType::Double).unwrap(),
            Value::Double(1.0)
        );

        upstream.connect(0, 2.0).unwrap();
        assert_eq!(
            downstream.get_output(0, ValueType::Double).unwrap(),
            Value::Double(2.0)
        );
    });
}
