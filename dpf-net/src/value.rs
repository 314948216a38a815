//! Client-side values and their marshalling to and from the wire.

use std::fmt;
use std::sync::Arc;

use serde::Serialize;

use dpf_core::{runtime_config, EntityId, LabelSpace, ObjectKind, Pin, PinSpecification, ValueType};

use crate::msg::{Array, EntityRef, Method, OperatorInput, WireValue};
use crate::operator::Operator;
use crate::registry::Handle;
use crate::transport::{Ownership, Reply};
use crate::{Error, Result, Session};

/// Server-side object held through a handle. Clones share the handle.
#[derive(Clone, Debug)]
pub struct Object {
    handle: Arc<Handle>,
}

impl Object {
    pub(crate) fn new(handle: Handle) -> Self {
        Self {
            handle: Arc::new(handle),
        }
    }

    pub fn kind(&self) -> ObjectKind {
        self.handle.kind()
    }

    pub fn id(&self) -> EntityId {
        self.handle.id()
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    pub fn session(&self) -> Result<Session> {
        self.handle.session()
    }

    /// New object with its own reference to the same server object.
    pub fn duplicate(&self) -> Result<Object> {
        Ok(Object::new(self.handle.duplicate_reference()?))
    }
}

/// Value placed on, or retrieved from, an operator pin.
#[derive(Clone, Debug)]
pub enum Value {
    Int(i32),
    Double(f64),
    Bool(bool),
    String(String),
    Bytes(Vec<u8>),
    IntList(Vec<i32>),
    DoubleList(Vec<f64>),
    StringList(Vec<String>),
    Object(Object),
    /// Output pin of another operator, connecting it creates a dataflow edge
    OperatorOutput(Operator, Pin),
    LabelSpace(LabelSpace),
}

impl Value {
    /// Type tag of the value. Operator outputs have none until evaluated.
    pub fn value_type(&self) -> Option<ValueType> {
        let t = match self {
            Value::Int(_) => ValueType::Int,
            Value::Double(_) => ValueType::Double,
            Value::Bool(_) => ValueType::Bool,
            Value::String(_) => ValueType::String,
            Value::Bytes(_) => ValueType::Bytes,
            Value::IntList(_) => ValueType::IntList,
            Value::DoubleList(_) => ValueType::DoubleList,
            Value::StringList(_) => ValueType::StringList,
            Value::Object(o) => ValueType::Object(o.kind()),
            Value::OperatorOutput(..) => return None,
            Value::LabelSpace(_) => ValueType::LabelSpace,
        };
        Some(t)
    }

    pub fn as_int(&self) -> Option<i32> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_double(&self) -> Option<f64> {
        match self {
            Value::Double(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_int_list(&self) -> Option<&[i32]> {
        match self {
            Value::IntList(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_double_list(&self) -> Option<&[f64]> {
        match self {
            Value::DoubleList(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_string_list(&self) -> Option<&[String]> {
        match self {
            Value::StringList(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&Object> {
        match self {
            Value::Object(o) => Some(o),
            _ => None,
        }
    }

    pub fn into_object(self) -> Option<Object> {
        match self {
            Value::Object(o) => Some(o),
            _ => None,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Double(a), Value::Double(b)) => a == b,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Bytes(a), Value::Bytes(b)) => a == b,
            (Value::IntList(a), Value::IntList(b)) => a == b,
            (Value::DoubleList(a), Value::DoubleList(b)) => a == b,
            (Value::StringList(a), Value::StringList(b)) => a == b,
            (Value::Object(a), Value::Object(b)) => a.id() == b.id() && a.kind() == b.kind(),
            (Value::OperatorOutput(a, pa), Value::OperatorOutput(b, pb)) => {
                a.id() == b.id() && pa == pb
            }
            (Value::LabelSpace(a), Value::LabelSpace(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(v) => write!(f, "{}", v),
            Value::Double(v) => write!(f, "{}", v),
            Value::Bool(v) => write!(f, "{}", v),
            Value::String(v) => write!(f, "{}", v),
            Value::Bytes(v) => write!(f, "<{} bytes>", v.len()),
            Value::IntList(v) => write!(f, "{:?}", v),
            Value::DoubleList(v) => write!(f, "{:?}", v),
            Value::StringList(v) => write!(f, "{:?}", v),
            Value::Object(o) => write!(f, "<{} {}>", o.kind(), o.id()),
            Value::OperatorOutput(op, pin) => write!(f, "<output {} of {}>", pin, op.name()),
            Value::LabelSpace(ls) => write!(f, "{:?}", ls.labels),
        }
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v)
    }
}
impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Double(v)
    }
}
impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}
impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}
impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}
impl From<Vec<i32>> for Value {
    fn from(v: Vec<i32>) -> Self {
        Value::IntList(v)
    }
}
impl From<Vec<f64>> for Value {
    fn from(v: Vec<f64>) -> Self {
        Value::DoubleList(v)
    }
}
impl From<Vec<String>> for Value {
    fn from(v: Vec<String>) -> Self {
        Value::StringList(v)
    }
}
impl From<LabelSpace> for Value {
    fn from(v: LabelSpace) -> Self {
        Value::LabelSpace(v)
    }
}
impl From<Object> for Value {
    fn from(v: Object) -> Self {
        Value::Object(v)
    }
}

/// What happens to the client's reference when an object is sent to the
/// server.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Transfer {
    /// The client keeps its reference, the server takes its own
    Borrow,
    /// A new reference is created and handed over to the server
    Duplicate,
    /// The client's reference is handed over to the server
    Move,
}

/// Value in the shape it goes over the wire.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Marshalled {
    Inline(WireValue),
    /// Numeric array too large for a single message
    Streamed(Array),
}

fn type_mismatch(pin: Pin, spec: &PinSpecification, got: &str) -> Error {
    Error::TypeMismatch {
        pin,
        expected: spec.type_names.join(", "),
        got: got.to_string(),
    }
}

/// Converts a value to its wire shape, checking it against the pin
/// specification first. Nothing is sent to the server if the check fails.
pub(crate) fn marshal(
    session: &Session,
    value: &Value,
    pin: Pin,
    spec: Option<&PinSpecification>,
    transfer: Transfer,
) -> Result<Marshalled> {
    if let (Some(spec), Some(value_type)) = (spec, value.value_type()) {
        if !spec.accepts(value_type) {
            return Err(type_mismatch(pin, spec, value_type.type_name()));
        }
    }
    let config = runtime_config();
    let wire = match value {
        Value::Int(v) => WireValue::Int(*v),
        Value::Double(v) => WireValue::Double(*v),
        Value::Bool(v) => WireValue::Bool(*v),
        Value::String(v) => WireValue::Str(v.clone()),
        Value::Bytes(v) => WireValue::Bytes(v.clone()),
        Value::IntList(v) => {
            let array = Array::from_i32s(v);
            if array.byte_len() as u64 > config.default_file_chunk_size {
                return Ok(Marshalled::Streamed(array));
            }
            WireValue::Array(array)
        }
        Value::DoubleList(v) => {
            if (v.len() * 8) as u64 > config.default_file_chunk_size {
                return Ok(Marshalled::Streamed(Array::from_f64s(
                    v,
                    config.stream_floats_instead_of_doubles,
                )));
            }
            WireValue::Array(Array::from_f64s(v, false))
        }
        Value::StringList(v) => WireValue::StringList(v.clone()),
        Value::LabelSpace(v) => WireValue::LabelSpace(v.clone()),
        Value::Object(object) => {
            if !object.handle().belongs_to(session) {
                return Err(Error::InvalidArgument(format!(
                    "{} {} belongs to another session",
                    object.kind(),
                    object.id()
                )));
            }
            let id = match transfer {
                Transfer::Borrow => object.id(),
                Transfer::Duplicate => object.handle().duplicate_reference()?.take_ownership(),
                Transfer::Move => object.handle().take_ownership(),
            };
            WireValue::Entity(EntityRef {
                id,
                kind: object.kind(),
            })
        }
        Value::OperatorOutput(op, pin_out) => {
            if !op.handle().belongs_to(session) {
                return Err(Error::InvalidArgument(format!(
                    "operator {} belongs to another session",
                    op.name()
                )));
            }
            WireValue::OperatorInput(OperatorInput {
                inputop: op.id(),
                pin_out: *pin_out,
            })
        }
    };
    Ok(Marshalled::Inline(wire))
}

/// Converts a wire value back to a client value of the expected type.
pub(crate) fn unmarshal(
    session: &Session,
    wire: WireValue,
    ownership: Ownership,
    expected: ValueType,
    pin: Pin,
) -> Result<Value> {
    let mismatch = |got: &str| Error::TypeMismatch {
        pin,
        expected: expected.type_name().to_string(),
        got: got.to_string(),
    };
    let value = match (expected, wire) {
        (ValueType::Int, WireValue::Int(v)) => Value::Int(v),
        (ValueType::Double, WireValue::Double(v)) => Value::Double(v),
        (ValueType::Bool, WireValue::Bool(v)) => Value::Bool(v),
        (ValueType::String, WireValue::Str(v)) => Value::String(v),
        (ValueType::Bytes, WireValue::Bytes(v)) => Value::Bytes(v),
        (ValueType::IntList, WireValue::Array(a)) => match a.to_i32s() {
            Ok(v) => Value::IntList(v),
            Err(_) => return Err(mismatch(WireValue::Array(a).variant_name())),
        },
        (ValueType::DoubleList, WireValue::Array(a)) => Value::DoubleList(a.to_f64s()?),
        (ValueType::StringList, WireValue::StringList(v)) => Value::StringList(v),
        (ValueType::LabelSpace, WireValue::LabelSpace(v)) => Value::LabelSpace(v),
        (ValueType::Object(kind), WireValue::Entity(entity))
            if kind == entity.kind || kind == ObjectKind::Any =>
        {
            Value::Object(Object::new(session.adopt(entity, ownership)?))
        }
        (_, other) => {
            let got = other.variant_name();
            // a handle we don't hand out still has to be released
            if let WireValue::Entity(entity) = other {
                if ownership == Ownership::Owned {
                    drop(session.adopt(entity, ownership));
                }
            }
            return Err(mismatch(got));
        }
    };
    Ok(value)
}

/// Sends `header` followed by `data` split into frames of at most
/// `chunk_size` bytes on a client stream.
pub(crate) fn stream_with_header<H: Serialize>(
    session: &Session,
    method: Method,
    header: &H,
    data: &[u8],
    chunk_size: usize,
) -> Result<Reply> {
    let header = session.encode(header)?;
    let chunk_size = chunk_size.max(1);
    let mut frames = std::iter::once(Ok(header)).chain(data.chunks(chunk_size).map(|c| Ok(c.to_vec())));
    session.client_stream(method, &mut frames)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockEngine;

    fn session() -> Session {
        Session::local(Arc::new(MockEngine::new())).unwrap()
    }

    #[test]
    fn pin_types_are_checked_before_sending() {
        let session = session();
        let spec = PinSpecification::new("field", &["vector<double>", "field"], false, "");
        let calls = session.stats().calls;
        let err = marshal(&session, &Value::from("x"), 0, Some(&spec), Transfer::Borrow).unwrap_err();
        match err {
            Error::TypeMismatch { pin, expected, got } => {
                assert_eq!(pin, 0);
                assert_eq!(expected, "vector<double>, field");
                assert_eq!(got, "string");
            }
            other => panic!("unexpected: {:?}", other),
        }
        assert_eq!(session.stats().calls, calls);
    }

    #[test]
    fn small_lists_are_inline() {
        let session = session();
        let m = marshal(&session, &Value::from(vec![1., 2.]), 0, None, Transfer::Borrow).unwrap();
        match m {
            Marshalled::Inline(WireValue::Array(a)) => assert_eq!(a.count, 2),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn wrong_response_type_is_a_mismatch() {
        let session = session();
        let err = unmarshal(&session, WireValue::Str("a".into()), Ownership::Owned, ValueType::Double, 3)
            .unwrap_err();
        assert!(matches!(err, Error::TypeMismatch { pin: 3, .. }));
        let v = unmarshal(&session, WireValue::Double(2.5), Ownership::Owned, ValueType::Double, 0).unwrap();
        assert_eq!(v, Value::Double(2.5));
    }
}
