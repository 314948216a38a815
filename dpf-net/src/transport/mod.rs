//! This module is the home of transport backends. Multiple variants are
//! available, each reaching the server through a different mechanism.
//!
//! A transport only moves encoded message bodies around. It knows nothing
//! about handles, operators or chunk sizes; callers decide how bulk payloads
//! are split into frames.

use std::fmt;
use std::sync::Arc;

use crate::msg::Method;
use crate::Result;

#[cfg(feature = "in_process")]
pub mod in_process;
pub mod local;
pub mod remote;

#[cfg(feature = "in_process")]
pub use in_process::InProcessTransport;
pub use local::{Engine, LocalTransport};
pub use remote::{RemoteConfig, RemoteTransport};

/// Server-to-client stream of encoded chunks. Blocks on `next`.
pub type ChunkStream = Box<dyn Iterator<Item = Result<Vec<u8>>> + Send>;

/// Client-to-server stream of encoded chunks.
pub type ChunkSource<'a> = &'a mut dyn Iterator<Item = Result<Vec<u8>>>;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TransportKind {
    /// Framed connection to a server process over tcp
    Remote,
    /// Native library loaded into this process
    InProcess,
    /// Engine object living in this process, no serialization boundary
    /// beyond the message encoding
    Local,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Remote => write!(f, "remote"),
            Self::InProcess => write!(f, "in-process"),
            Self::Local => write!(f, "local"),
        }
    }
}

/// Who is responsible for releasing a handle carried by a reply.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Ownership {
    /// The client received its own reference
    Owned,
    /// The server kept the reference, the client must not release it
    Borrowed,
}

/// Encoded reply body together with the ownership of any handle it carries.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub body: Vec<u8>,
    pub ownership: Ownership,
}

impl Reply {
    pub fn owned(body: Vec<u8>) -> Self {
        Self {
            body,
            ownership: Ownership::Owned,
        }
    }

    pub fn borrowed(body: Vec<u8>) -> Self {
        Self {
            body,
            ownership: Ownership::Borrowed,
        }
    }
}

/// Traffic counters kept by a transport.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct TransportStats {
    /// Unary calls issued
    pub calls: u64,
    /// Stream chunks received from the server
    pub inbound_chunks: u64,
    /// Stream chunks sent to the server
    pub outbound_chunks: u64,
}

/// Connection to a single server.
///
/// Implementations must be safe to share between threads; concurrent calls
/// are allowed and are not ordered with respect to each other.
pub trait Transport: Send + Sync {
    fn kind(&self) -> TransportKind;

    /// Unary call.
    fn call(&self, method: Method, body: Vec<u8>) -> Result<Reply>;

    /// Opens a server-to-client stream.
    fn server_stream(&self, method: Method, body: Vec<u8>) -> Result<ChunkStream>;

    /// Sends all the chunks produced by `chunks`, then waits for the reply.
    /// An error yielded by the source aborts the call.
    fn client_stream(&self, method: Method, chunks: ChunkSource<'_>) -> Result<Reply>;

    /// Closes the transport. Further calls fail with `TransportUnavailable`.
    fn close(&self) -> Result<()>;

    fn stats(&self) -> TransportStats {
        TransportStats::default()
    }
}

impl<T: Transport + ?Sized> Transport for Arc<T> {
    fn kind(&self) -> TransportKind {
        (**self).kind()
    }
    fn call(&self, method: Method, body: Vec<u8>) -> Result<Reply> {
        (**self).call(method, body)
    }
    fn server_stream(&self, method: Method, body: Vec<u8>) -> Result<ChunkStream> {
        (**self).server_stream(method, body)
    }
    fn client_stream(&self, method: Method, chunks: ChunkSource<'_>) -> Result<Reply> {
        (**self).client_stream(method, chunks)
    }
    fn close(&self) -> Result<()> {
        (**self).close()
    }
    fn stats(&self) -> TransportStats {
        (**self).stats()
    }
}
