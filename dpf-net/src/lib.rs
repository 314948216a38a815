//! This library implements the `dpf` client: sessions with a post-processing
//! server, server-side operators and workflows, and the transports carrying
//! them.
//!
//! Nearly everything a caller manipulates lives on the server. The client
//! holds [`Handle`]s to those objects and releases them when the last clone
//! is dropped. A [`Session`] owns the connection, probes the server version
//! once at startup and gates optional features on it.
//!
//!
//! # Transports
//!
//! Three ways of reaching a server are provided:
//!
//! - `remote`: framed rpc over tcp, to a server started by this process
//!   ([`Session::start_local`]) or an already running one
//!   ([`Session::connect`])
//! - `in_process`: the server library loaded into this process, enabled by
//!   the `in_process` feature
//! - `local`: any [`transport::Engine`] object living in this process, e.g.
//!   the [`mock::MockEngine`] used throughout the tests
//!
//! All of them move the same encoded message bodies. The body encoding
//! defaults to bincode; msgpack and json are available behind the
//! `msgpack_encoding` and `json_encoding` features.
//!
//!
//! # Building workflows
//!
//! ```ignore
//! let session = dpf_net::default_session()?;
//! let min_max = Operator::new(&session, "min_max")?;
//! min_max.connect(0, vec![1.0, -2.0, 3.5])?;
//! let max = min_max.get_output(1, ValueType::Double)?;
//! ```
//!
//! Operators can be grouped in a [`Workflow`] exposing named inputs and
//! outputs, and workflows can be chained into larger ones. Objects move
//! between servers with [`deep_copy`].

#[macro_use]
extern crate serde;
#[macro_use]
extern crate log;

pub use base::{RuntimeClientConfig, RuntimeCoreConfig, DEFAULT_LOADER_SYMBOL};
pub use deep_copy::{deep_copy, deep_copy_value, StreamType};
pub use default::{
    default_session, reset_default_session, set_default_factory, set_default_session,
    DefaultTarget,
};
pub use error::{Error, Result};
pub use license::LicenseCheckout;
pub use objects::{Scoping, StringField, LOCATION_ELEMENTAL, LOCATION_NODAL};
pub use operator::{Operator, OperatorConfig};
pub use registry::Handle;
pub use session::{Capability, CommunicationProtocol, ServerConfig, Session};
pub use socket::Encoding;
pub use starter::StartOptions;
pub use value::{Object, Transfer, Value};
pub use workflow::{Edge, Workflow};

pub mod base;
pub mod cache;
pub mod deep_copy;
pub mod default;
pub mod error;
pub mod license;
pub mod mock;
pub mod msg;
pub mod objects;
pub mod operator;
pub mod registry;
pub mod session;
pub mod socket;
pub mod starter;
pub mod transport;
pub mod value;
pub mod workflow;
