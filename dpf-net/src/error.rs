use std::io;

use thiserror::Error;

use dpf_core::NULL_OBJECT_MARKER;

pub type Result<T> = core::result::Result<T, Error>;

/// Enumeration of errors that may occur while working with a server.
#[derive(Error, Debug)]
pub enum Error {
    #[error("feature requires server version {required} or higher, server is {actual}")]
    VersionUnsupported { required: String, actual: String },
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("type mismatch on pin {pin}: expected one of [{expected}], got {got}")]
    TypeMismatch {
        pin: i32,
        expected: String,
        got: String,
    },
    #[error("missing object: {0}")]
    MissingObject(String),
    #[error("server error: {0}")]
    ServerError(String),
    #[error("transport unavailable: {0}")]
    TransportUnavailable(String),
    #[error("timed out: {0}")]
    Timeout(String),
    #[error("server install not found, searched: {0}")]
    InstallNotFound(String),
    #[error("refusing to upload empty file: {0}")]
    EmptyFile(String),
    #[error("license error: {0}")]
    LicenseError(String),
    #[error("workflow composition would introduce a cycle through operator {0}")]
    Cycle(i64),
    #[error("parsing error: {0}")]
    ParseError(String),
    #[error("unknown operator `{name}`: {message}")]
    UnknownOperator { name: String, message: String },

    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("bincode error: {0}")]
    BincodeError(#[from] bincode::Error),

    #[cfg(feature = "msgpack_encoding")]
    #[error("rmp_serde decode error: {0}")]
    RmpsDecodeError(#[from] rmp_serde::decode::Error),
    #[cfg(feature = "msgpack_encoding")]
    #[error("rmp_serde encode error: {0}")]
    RmpsEncodeError(#[from] rmp_serde::encode::Error),

    #[cfg(feature = "json_encoding")]
    #[error("serde_json error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[cfg(feature = "in_process")]
    #[error("native library error: {0}")]
    LibLoadingError(#[from] libloading::Error),

    #[error("other: {0}")]
    Other(String),
}

impl Error {
    /// Classifies a fault message reported by the server.
    pub fn from_server_message(message: String) -> Self {
        if message.contains(NULL_OBJECT_MARKER) {
            Self::MissingObject(message)
        } else {
            Self::ServerError(message)
        }
    }

    /// Returns true for errors worth retrying while establishing a first
    /// connection.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::TransportUnavailable(_))
    }
}

impl From<dpf_core::Error> for Error {
    fn from(e: dpf_core::Error) -> Self {
        use dpf_core::Error as CoreError;
        match e {
            CoreError::VersionUnsupported { required, actual } => {
                Self::VersionUnsupported { required, actual }
            }
            CoreError::InvalidArgument(s) => Self::InvalidArgument(s),
            CoreError::TypeMismatch { pin, expected, got } => {
                Self::TypeMismatch { pin, expected, got }
            }
            CoreError::Cycle(id) => Self::Cycle(id),
            CoreError::IoError(s) => Self::Io(io::Error::new(io::ErrorKind::Other, s)),
            CoreError::ParseError(s) | CoreError::TomlDeserError(s) => Self::ParseError(s),
            CoreError::ParseIntError(e) => Self::ParseError(e.to_string()),
            CoreError::ParseFloatError(e) => Self::ParseError(e.to_string()),
            CoreError::ParseBoolError(e) => Self::ParseError(e.to_string()),
            CoreError::Other(s) => Self::Other(s),
        }
    }
}

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(e: std::sync::PoisonError<T>) -> Self {
        Self::Other(format!("lock poisoned: {}", e))
    }
}

/// Maps io errors coming out of a connection onto the transport failure
/// taxonomy.
pub(crate) fn classify_io(e: io::Error, context: &str) -> Error {
    match e.kind() {
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => {
            Error::Timeout(format!("{}: {}", context, e))
        }
        io::ErrorKind::ConnectionRefused
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::NotConnected
        | io::ErrorKind::BrokenPipe
        | io::ErrorKind::UnexpectedEof
        | io::ErrorKind::AddrNotAvailable => {
            Error::TransportUnavailable(format!("{}: {}", context, e))
        }
        _ => Error::Io(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_object_messages_are_classified() {
        let e = Error::from_server_message(
            "Operator: object is null in the dataBase (id 12)".to_string(),
        );
        assert!(matches!(e, Error::MissingObject(_)));
        let e = Error::from_server_message("bad things happened".to_string());
        match e {
            Error::ServerError(m) => assert_eq!(m, "bad things happened"),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn io_classification() {
        let e = classify_io(io::Error::new(io::ErrorKind::TimedOut, "x"), "call");
        assert!(matches!(e, Error::Timeout(_)));
        let e = classify_io(io::Error::new(io::ErrorKind::ConnectionRefused, "x"), "call");
        assert!(matches!(e, Error::TransportUnavailable(_)));
        assert!(e.is_retryable());
    }

    #[test]
    fn core_errors_map_kind_for_kind() {
        let e: Error = dpf_core::Error::Cycle(3).into();
        assert!(matches!(e, Error::Cycle(3)));
        let e: Error = dpf_core::version::require(&dpf_core::VersionTuple::new(1, 0, 0), "2.0")
            .unwrap_err()
            .into();
        assert!(matches!(e, Error::VersionUnsupported { .. }));
    }
}
