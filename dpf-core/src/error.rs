//! Error types.

use std::io;
use std::num::{ParseFloatError, ParseIntError};
use std::str::ParseBoolError;

pub type Result<T> = core::result::Result<T, Error>;

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Self::IoError(e.to_string())
    }
}

/// Crate-wide error type.
///
/// Only the error kinds that can be raised without talking to a server live
/// here. The networking layer maps each of them onto its own error type.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum Error {
    #[error("io error: {0}")]
    IoError(String),

    #[error("toml deserialization error: {0}")]
    TomlDeserError(String),

    #[error("parsing error: {0}")]
    ParseError(String),
    #[error("failed parsing int: {0}")]
    ParseIntError(#[from] ParseIntError),
    #[error("failed parsing float: {0}")]
    ParseFloatError(#[from] ParseFloatError),
    #[error("failed parsing bool: {0}")]
    ParseBoolError(#[from] ParseBoolError),

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

    #[error("workflow composition would introduce a cycle through operator {0}")]
    Cycle(i64),

    #[error("other error: {0}")]
    Other(String),
}

impl From<toml::de::Error> for Error {
    fn from(e: toml::de::Error) -> Self {
        Self::TomlDeserError(e.to_string())
    }
}
