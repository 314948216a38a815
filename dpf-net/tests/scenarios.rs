mod common;

use dpf_core::{ObjectKind, ValueType};
use dpf_net::msg::RunRequest;
use dpf_net::{deep_copy, Error, Operator, Session, StringField, Value, Workflow, LOCATION_NODAL};

use common::{local, on_both_transports, remote};
use dpf_net::mock::MockEngine;

#[test]
fn min_max_evaluation() {
    on_both_transports(MockEngine::new, |_, session| {
        let op = Operator::new(session, "min_max").unwrap();
        op.connect(0, vec![3.0, 1.0, 2.0]).unwrap();
        assert_eq!(op.get_output(0, ValueType::Double).unwrap(), Value::Double(1.0));
        assert_eq!(op.get_output(1, ValueType::Double).unwrap(), Value::Double(3.0));
    });
}

/// Workflow exposing `in` and `out` around a single `forward` operator.
fn forward_workflow(session: &Session) -> Workflow {
    let op = Operator::new(session, "forward").unwrap();
    let mut wf = Workflow::new(session).unwrap();
    wf.set_input_name("in", &op, 0).unwrap();
    wf.set_output_name("out", &op, 0).unwrap();
    wf
}

#[test]
fn chained_workflows_forward_values() {
    on_both_transports(MockEngine::new, |_, session| {
        let w1 = forward_workflow(session);
        let w2 = forward_workflow(session);
        let w = w1.chain(&w2, &[("out", "in")]).unwrap();
        assert_eq!(w.input_names(), vec!["in".to_string()]);
        assert_eq!(w.output_names(), vec!["out".to_string()]);
        assert_eq!(w.operators().len(), 2);
        w.connect("in", "hello").unwrap();
        assert_eq!(
            w.get_output("out", ValueType::String).unwrap(),
            Value::String("hello".to_string())
        );
    });
}

#[test]
fn chaining_is_associative_modulo_naming() {
    let (_, session) = local(MockEngine::new());
    let left = forward_workflow(&session)
        .chain(&forward_workflow(&session), &[("out", "in")])
        .unwrap()
        .chain(&forward_workflow(&session), &[("out", "in")])
        .unwrap();
    let inner = forward_workflow(&session)
        .chain(&forward_workflow(&session), &[("out", "in")])
        .unwrap();
    let right = forward_workflow(&session)
        .chain(&inner, &[("out", "in")])
        .unwrap();
    assert_eq!(left.input_names(), right.input_names());
    assert_eq!(left.output_names(), right.output_names());
    assert_eq!(left.operators().len(), 3);
    assert_eq!(right.operators().len(), 3);

    for wf in &[left, right] {
        wf.connect("in", 4.5).unwrap();
        assert_eq!(
            wf.get_output("out", ValueType::Double).unwrap(),
            Value::Double(4.5)
        );
    }
}

#[test]
fn chaining_a_workflow_into_itself_is_a_cycle() {
    let (_, session) = local(MockEngine::new());
    let wf = forward_workflow(&session);
    match wf.chain(&wf, &[("out", "in")]) {
        Err(Error::Cycle(id)) => assert_eq!(id, wf.operators()[0].id()),
        other => panic!("unexpected: {:?}", other.map(|w| w.id())),
    }
}

#[test]
fn chain_rejects_unknown_names() {
    let (_, session) = local(MockEngine::new());
    let w1 = forward_workflow(&session);
    let w2 = forward_workflow(&session);
    assert!(matches!(
        w1.chain(&w2, &[("missing", "in")]),
        Err(Error::InvalidArgument(_))
    ));
}

fn identical(session: &Session, a: &StringField, b: &StringField) -> bool {
    let op = Operator::new(session, "identical_string_fields").unwrap();
    op.connect(0, a.clone()).unwrap();
    op.connect(1, b.clone()).unwrap();
    op.get_output(0, ValueType::Bool).unwrap().as_bool().unwrap()
}

#[test]
fn deep_copy_round_trip() {
    let data = vec!["one".to_string(), "two".to_string(), "three".to_string()];
    let check = |s1: &Session, s2: &Session| {
        let x = StringField::new(s1, LOCATION_NODAL, &data).unwrap();
        let y = deep_copy(x.as_object(), s2).unwrap();
        assert!(y.session().unwrap().ptr_eq(s2));
        assert_eq!(y.kind(), ObjectKind::StringField);
        let y = StringField::from_object(y).unwrap();
        assert_eq!(y.data().unwrap(), data);

        let z = StringField::from_object(deep_copy(y.as_object(), s1).unwrap()).unwrap();
        assert_ne!(z.id(), x.id());
        assert!(identical(s1, &x, &z));

        let other = StringField::new(s1, LOCATION_NODAL, &data[..2]).unwrap();
        assert!(!identical(s1, &x, &other));
    };

    // chunked serialization on both ends
    let (_, s1) = local(MockEngine::new());
    let (_, s2) = remote(MockEngine::new());
    check(&s1, &s2);

    // legacy string serialization as soon as one end is older
    let (_, s1) = local(MockEngine::new());
    let (_, s2) = local(MockEngine::new().with_version("7.1"));
    check(&s1, &s2);
}

#[test]
fn stream_type_is_negotiated() {
    use dpf_net::StreamType;
    let (_, new) = local(MockEngine::new());
    let (_, other_new) = local(MockEngine::new());
    let (_, old) = local(MockEngine::new().with_version("7.1"));
    let (_, advertised) = local(
        MockEngine::new()
            .with_version("7.1")
            .with_capabilities(&["chunked_serialization"]),
    );
    assert_eq!(StreamType::negotiate(&new, &other_new), StreamType::Chunked);
    assert_eq!(StreamType::negotiate(&new, &old), StreamType::Legacy);
    assert_eq!(StreamType::negotiate(&old, &new), StreamType::Legacy);
    assert_eq!(StreamType::negotiate(&advertised, &new), StreamType::Chunked);
}

#[test]
fn version_gate() {
    let (_, current) = local(MockEngine::new().with_version("3.0.0"));
    assert!(current.require("3.0").is_ok());
    let (_, older) = local(MockEngine::new().with_version("2.99.9"));
    match older.require("3.0") {
        Err(Error::VersionUnsupported { required, actual }) => {
            assert_eq!(required, "3.0");
            assert_eq!(actual, "2.99.9");
        }
        other => panic!("unexpected: {:?}", other),
    }
}

#[test]
fn handle_lifetime() {
    on_both_transports(MockEngine::new, |engine, session| {
        let op = Operator::new(session, "min_max").unwrap();
        op.connect(0, vec![5.0, -1.0]).unwrap();

        let duplicate = op.handle().duplicate_reference().unwrap();
        assert_ne!(duplicate.id(), op.id());
        drop(duplicate);
        assert_eq!(op.get_output(1, ValueType::Double).unwrap(), Value::Double(5.0));

        let id = op.id();
        let releases = engine.releases();
        drop(op);
        assert_eq!(engine.releases(), releases + 1);
        match session.rpc(&RunRequest { op: id }) {
            Err(Error::MissingObject(m)) => assert!(m.contains("object is null")),
            other => panic!("unexpected: {:?}", other),
        }
        let borrowed = session.borrow_handle(ObjectKind::Operator, id);
        assert!(matches!(
            session.describe(&borrowed),
            Err(Error::MissingObject(_))
        ));
    });
}
