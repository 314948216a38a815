//! This library implements the I/O-free building blocks of the `dpf` client.
//!
//! The client talks to a separate post-processing server, builds workflows
//! out of server-side operators and retrieves typed results. Everything that
//! can be decided without a server lives here:
//!
//! - version parsing and per-feature version gating ([`version`])
//! - type tags for values crossing the wire ([`value`])
//! - operator pin specifications ([`spec`])
//! - process-wide runtime options and server contexts ([`config`])
//!
//! # Networking
//!
//! By itself this library does not talk to anything. Transports, sessions,
//! operators and workflows are implemented in `dpf-net`.
//!
//! # Using the library
//!
//! ```toml
//! dpf-core = "0.1.0"
//! ```

#[macro_use]
extern crate serde;
#[macro_use]
extern crate log;

pub use config::{runtime_config, update_runtime_config, RuntimeConfig, ServerContext};
pub use error::{Error, Result};
pub use spec::{PinSpecification, Specification};
pub use value::{LabelSpace, ObjectKind, ValueType};
pub use version::VersionTuple;

pub mod config;
pub mod error;
pub mod spec;
pub mod value;
pub mod version;

pub const VERSION: &'static str = env!("CARGO_PKG_VERSION");

/// Default TCP port of a local server.
pub const DEFAULT_PORT: u16 = 50054;
/// Default ip address of a local server.
pub const DEFAULT_IP: &str = "127.0.0.1";
/// Default bulk transfer quantum in bytes.
pub const DEFAULT_FILE_CHUNK_SIZE: u64 = 524_288;
/// Default time to wait for a freshly started server to accept connections.
pub const DEFAULT_START_TIMEOUT_SECS: f64 = 20.;

/// Stable substring the server embeds in errors about null object lookups.
pub const NULL_OBJECT_MARKER: &str = "object is null in the dataBase";

/// Overrides the install root of the server.
pub const ENV_DPF_PATH: &str = "ANSYS_DPF_PATH";
/// Prefix of the version-numbered install root variables, e.g. `AWP_ROOT242`.
pub const ENV_AWP_ROOT_PREFIX: &str = "AWP_ROOT";
/// Accepts the license agreement non-interactively.
pub const ENV_ACCEPT_LA: &str = "ANSYS_DPF_ACCEPT_LA";
/// If `false`, the default session attaches to an existing server.
pub const ENV_START_SERVER: &str = "DPF_START_SERVER";
/// Ip address used when attaching the default session.
pub const ENV_DPF_IP: &str = "DPF_IP";
/// Port used when attaching the default session.
pub const ENV_DPF_PORT: &str = "DPF_PORT";
/// Default licensing context, `PREMIUM` or `ENTRY`.
pub const ENV_SERVER_CONTEXT: &str = "ANSYS_DPF_SERVER_CONTEXT";
/// Build configuration tag recorded in diagnostics.
pub const ENV_CONFIGURATION: &str = "DPF_CONFIGURATION";

/// Handle identifier as assigned by the server.
pub type EntityId = i64;
/// Operator pin index. Negative indices are reserved for special pins.
pub type Pin = i32;
