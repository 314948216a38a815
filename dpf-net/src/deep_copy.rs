//! Moving objects between sessions by serializing them on the source server
//! and deserializing them on the destination one.

use dpf_core::{Pin, ValueType};

use crate::operator::Operator;
use crate::session::Capability;
use crate::value::{Object, Value};
use crate::{Error, Result, Session};

const SERIALIZER: &str = "serializer_to_string";
const DESERIALIZER: &str = "string_deserializer";

const STREAM_TYPE_PIN: Pin = -1;
const SERIALIZER_OBJECT_PIN: Pin = 1;
const SERIALIZER_OUTPUT_PIN: Pin = 0;
const DESERIALIZER_INPUT_PIN: Pin = 0;
const DESERIALIZER_OUTPUT_PIN: Pin = 1;

/// Encoding of the serialized object exchanged between the two servers.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum StreamType {
    /// Whole object as a single string
    Legacy = 0,
    /// Chunked binary serialization
    Chunked = 1,
}

impl StreamType {
    /// Chunked serialization is used only if both servers provide it.
    pub fn negotiate(source: &Session, dest: &Session) -> Self {
        if source.supports(Capability::ChunkedSerialization)
            && dest.supports(Capability::ChunkedSerialization)
        {
            StreamType::Chunked
        } else {
            StreamType::Legacy
        }
    }

    fn value_type(&self) -> ValueType {
        match self {
            StreamType::Legacy => ValueType::String,
            StreamType::Chunked => ValueType::Bytes,
        }
    }
}

/// Copies `object` into `dest`, returning the new object owned by `dest`.
pub fn deep_copy(object: &Object, dest: &Session) -> Result<Object> {
    let source = object.session()?;
    let stream_type = StreamType::negotiate(&source, dest);
    debug!(
        "deep copy of {} {} from {} to {} ({:?} stream)",
        object.kind(),
        object.id(),
        source,
        dest,
        stream_type
    );

    let serializer = Operator::new(&source, SERIALIZER)?;
    serializer.connect(STREAM_TYPE_PIN, stream_type as i32)?;
    serializer.connect(SERIALIZER_OBJECT_PIN, Value::Object(object.clone()))?;
    let serialized = serializer.get_output(SERIALIZER_OUTPUT_PIN, stream_type.value_type())?;

    let deserializer = Operator::new(dest, DESERIALIZER)?;
    deserializer.connect(STREAM_TYPE_PIN, stream_type as i32)?;
    deserializer.connect(DESERIALIZER_INPUT_PIN, serialized)?;
    let copy = deserializer.get_output(DESERIALIZER_OUTPUT_PIN, ValueType::Object(object.kind()))?;
    copy.into_object().ok_or_else(|| {
        Error::ServerError(format!(
            "deserializer returned no {} object",
            object.kind()
        ))
    })
}

/// Copies any value into `dest`. Objects are deep copied, plain values are
/// cloned. Operator outputs can't be copied.
pub fn deep_copy_value(value: &Value, dest: &Session) -> Result<Value> {
    match value {
        Value::Object(object) => Ok(Value::Object(deep_copy(object, dest)?)),
        Value::OperatorOutput(op, pin) => Err(Error::InvalidArgument(format!(
            "cannot copy output {} of operator {} across sessions",
            pin,
            op.name()
        ))),
        other => Ok(other.clone()),
    }
}
