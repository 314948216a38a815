mod common;

use dpf_core::{ObjectKind, ValueType};
use dpf_net::mock::{MockEngine, UNAVAILABLE_INCREMENT};
use dpf_net::{
    Error, LicenseCheckout, Operator, OperatorConfig, Scoping, StringField, Value,
    LOCATION_ELEMENTAL, LOCATION_NODAL,
};

use common::{local, on_both_transports, remote};

#[test]
fn unknown_operator() {
    on_both_transports(MockEngine::new, |_, session| {
        match Operator::new(session, "not_registered") {
            Err(Error::UnknownOperator { name, message }) => {
                assert_eq!(name, "not_registered");
                assert!(message.contains("not_registered"));
            }
            other => panic!("unexpected: {:?}", other),
        }
    });
}

#[test]
fn pin_type_is_checked_locally() {
    let (_, session) = local(MockEngine::new());
    let op = Operator::new(&session, "min_max").unwrap();
    op.spec().unwrap();
    let calls = session.stats().calls;
    match op.connect(0, "not a list") {
        Err(Error::TypeMismatch { pin, got, .. }) => {
            assert_eq!(pin, 0);
            assert_eq!(got, "string");
        }
        other => panic!("unexpected: {:?}", other),
    }
    assert_eq!(session.stats().calls, calls);
}

#[test]
fn operator_pins_config_and_description() {
    on_both_transports(MockEngine::new, |_, session| {
        let op = Operator::new(session, "min_max").unwrap();
        let spec = op.spec().unwrap();
        assert!(spec.is_pure());
        assert_eq!(spec.outputs.len(), 2);
        assert_eq!(spec.output_pin(1).unwrap().name, "field_max");

        assert_eq!(op.config().unwrap().get("mutex"), Some("false"));
        let mut config = OperatorConfig::new();
        config.set("mutex", true);
        op.set_config(&config).unwrap();
        assert_eq!(op.config().unwrap().get("mutex"), Some("true"));

        let configured = Operator::new_with_config(session, "forward", Some(&config)).unwrap();
        assert_eq!(configured.config().unwrap().get("mutex"), Some("true"));

        assert!(session.describe(op.handle()).unwrap().contains("min_max"));
    });
}

#[test]
fn eval_reads_every_output() {
    let (_, session) = local(MockEngine::new());
    let op = Operator::new(&session, "min_max").unwrap();
    op.connect(0, vec![2.0, 8.0, -4.0]).unwrap();
    let outputs = op.eval().unwrap();
    assert_eq!(
        outputs,
        vec![(0, Value::Double(-4.0)), (1, Value::Double(8.0))]
    );
}

#[test]
fn connected_operators_evaluate_upstream() {
    on_both_transports(MockEngine::new, |_, session| {
        let source = Operator::new(session, "forward").unwrap();
        source.connect(0, vec![1.5, 9.0, 4.0]).unwrap();
        let min_max = Operator::new(session, "min_max").unwrap();
        min_max.connect_output(0, &source, 0).unwrap();
        assert_eq!(
            min_max.get_output(1, ValueType::Double).unwrap(),
            Value::Double(9.0)
        );
    });
}

#[test]
fn large_lists_are_streamed() {
    on_both_transports(MockEngine::new, |_, session| {
        let values = (0..100_000).map(|i| i as f64 * 0.5).collect::<Vec<_>>();
        let op = Operator::new(session, "min_max").unwrap();
        op.spec().unwrap();
        let before = session.stats();
        op.connect(0, values).unwrap();
        let after = session.stats();
        // header followed by two payload frames
        assert_eq!(after.outbound_chunks - before.outbound_chunks, 3);
        assert_eq!(after.calls, before.calls);
        assert_eq!(
            op.get_output(1, ValueType::Double).unwrap(),
            Value::Double(49_999.5)
        );
    });
}

#[test]
fn progress_is_reported_when_available() {
    let (_, session) = local(MockEngine::new());
    let op = Operator::new(&session, "min_max").unwrap();
    op.connect(0, vec![1.0, 2.0]).unwrap();
    op.progress_bar(true);
    let before = session.stats();
    assert_eq!(op.get_output(0, ValueType::Double).unwrap(), Value::Double(1.0));
    let after = session.stats();
    assert_eq!(after.inbound_chunks - before.inbound_chunks, 5);
    assert_eq!(after.calls, before.calls);
}

#[test]
fn progress_falls_back_silently_on_old_servers() {
    let (_, session) = local(MockEngine::new().with_version("2.5"));
    let op = Operator::new(&session, "min_max").unwrap();
    op.connect(0, vec![1.0, 2.0]).unwrap();
    op.progress_bar(true);
    let before = session.stats();
    assert_eq!(op.get_output(1, ValueType::Double).unwrap(), Value::Double(2.0));
    let after = session.stats();
    assert_eq!(after.inbound_chunks, before.inbound_chunks);
    assert_eq!(after.calls, before.calls + 1);
}

#[test]
fn objects_flow_through_operators() {
    on_both_transports(MockEngine::new, |_, session| {
        let data = vec!["a".to_string(), "b".to_string()];
        let make = Operator::new(session, "make_string_field").unwrap();
        make.connect(0, data.clone()).unwrap();
        let field = make
            .get_output(0, ValueType::Object(ObjectKind::StringField))
            .unwrap();
        let field = StringField::from_object(field.into_object().unwrap()).unwrap();
        assert_eq!(field.data().unwrap(), data);

        // any object kind is accepted when asked for
        let any = make.get_output(0, ValueType::Object(ObjectKind::Any)).unwrap();
        assert_eq!(any.as_object().unwrap().kind(), ObjectKind::StringField);

        assert!(matches!(
            make.get_output(0, ValueType::Object(ObjectKind::Scoping)),
            Err(Error::TypeMismatch { .. })
        ));
    });
}

#[test]
fn objects_cannot_cross_sessions() {
    let (_, s1) = local(MockEngine::new());
    let (_, s2) = local(MockEngine::new());
    let field = StringField::new(&s1, LOCATION_NODAL, &["x".to_string()]).unwrap();
    let op = Operator::new(&s2, "identical_string_fields").unwrap();
    assert!(matches!(
        op.connect(0, field),
        Err(Error::InvalidArgument(_))
    ));
}

#[test]
fn borrowed_replies_are_duplicated() {
    on_both_transports(
        || MockEngine::new().borrowing_replies(true),
        |engine, session| {
            let refs = engine.live_references();
            let op = Operator::new(session, "min_max").unwrap();
            assert!(op.handle().is_owned());
            // the server kept its own reference, the client got a second one
            assert_eq!(engine.live_references(), refs + 2);
            drop(op);
            assert_eq!(engine.live_references(), refs + 1);
        },
    );
}

#[test]
fn scoping_ids() {
    on_both_transports(MockEngine::new, |_, session| {
        let scoping = Scoping::new(session, LOCATION_ELEMENTAL).unwrap();
        assert!(scoping.ids().unwrap().is_empty());
        scoping.set_ids(&[4, 8, 15, 16, 23, 42]).unwrap();
        assert_eq!(scoping.ids().unwrap(), vec![4, 8, 15, 16, 23, 42]);
    });
}

#[test]
fn large_scopings_are_streamed_on_recent_servers() {
    let ids = (0..2_200_000).collect::<Vec<i32>>();

    let (_, session) = local(MockEngine::new());
    let scoping = Scoping::new(&session, LOCATION_NODAL).unwrap();
    let before = session.stats();
    scoping.set_ids(&ids).unwrap();
    assert!(session.stats().outbound_chunks > before.outbound_chunks);
    assert_eq!(scoping.ids().unwrap().len(), ids.len());

    let (_, old) = local(MockEngine::new().with_version("2.0"));
    let scoping = Scoping::new(&old, LOCATION_NODAL).unwrap();
    assert!(matches!(
        scoping.set_ids(&ids),
        Err(Error::VersionUnsupported { .. })
    ));
    // small payloads are exempt from the gate
    scoping.set_ids(&ids[..1000]).unwrap();
    assert_eq!(scoping.ids().unwrap().len(), 1000);
}

#[test]
fn license_is_returned_on_drop() {
    on_both_transports(MockEngine::new, |engine, session| {
        let checkout = LicenseCheckout::acquire(session, Some("premium_increment")).unwrap();
        assert_eq!(checkout.increment(), Some("premium_increment"));
        assert_eq!(engine.licenses_in_use(), 1);
        drop(checkout);
        assert_eq!(engine.licenses_in_use(), 0);

        let any = LicenseCheckout::acquire(session, None).unwrap();
        assert_eq!(engine.licenses_in_use(), 1);
        any.release();
        assert_eq!(engine.licenses_in_use(), 0);
    });
}

#[test]
fn unavailable_license() {
    on_both_transports(MockEngine::new, |engine, session| {
        match LicenseCheckout::acquire(session, Some(UNAVAILABLE_INCREMENT)) {
            Err(Error::LicenseError(m)) => assert!(m.contains(UNAVAILABLE_INCREMENT)),
            other => panic!("unexpected: {:?}", other),
        }
        assert_eq!(engine.licenses_in_use(), 0);
    });
}

#[test]
fn shutdown_releases_everything() {
    let (engine, session) = local(MockEngine::new());
    let op = Operator::new(&session, "min_max").unwrap();
    let _field = StringField::new(&session, LOCATION_NODAL, &["x".to_string()]).unwrap();
    assert_eq!(session.owned_handles(), 2);
    assert_eq!(engine.live_references(), 2);

    session.shutdown().unwrap();
    assert!(session.is_shut_down());
    assert!(engine.shutdown_prepared());
    assert_eq!(engine.live_references(), 0);
    // a second shutdown has no effect
    session.shutdown().unwrap();

    let releases = engine.releases();
    drop(op);
    assert_eq!(engine.releases(), releases);
    assert!(matches!(
        Operator::new(&session, "forward"),
        Err(Error::TransportUnavailable(_))
    ));
}

#[test]
fn context_is_applied_at_startup() {
    let (engine, session) = remote(MockEngine::new());
    assert_eq!(engine.context().as_deref(), Some("ENTRY"));
    assert!(session.context().is_some());
    assert!(session.diagnostics().contains("version: 8.0.0"));

    // too old to take a context, the server keeps its default
    let (engine, session) = local(MockEngine::new().with_version("3.1"));
    assert_eq!(engine.context(), None);
    assert!(session.context().is_none());
}
