//! Sessions with a single server: transport selection, startup handshake,
//! capability probing and teardown.

use std::env;
use std::fmt;
use std::fs;
use std::path::Path;
use std::process::Child;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;

use dpf_core::version::{self, VersionTuple};
use dpf_core::{runtime_config, ObjectKind, ServerContext, ENV_CONFIGURATION};

use crate::cache::OutputCache;
use crate::msg::{
    ApplyContextRequest, ContextMsg, EntityRef, InitializeRequest, Method,
    PrepareShutdownRequest, ReleaseRequest, Request, ServerInfo, ServerInfoRequest,
};
use crate::registry::{Handle, HandleRegistry};
use crate::socket::{pack, unpack, Encoding};
use crate::starter::{self, StartOptions};
use crate::transport::{
    ChunkSource, ChunkStream, Engine, LocalTransport, Ownership, RemoteConfig, RemoteTransport,
    Reply, Transport, TransportKind, TransportStats,
};
use crate::{Error, Result};

/// Time a server process is given to exit on its own after shutdown was
/// requested.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(3);

/// Protocol used to reach the server.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CommunicationProtocol {
    /// Framed rpc over tcp
    Grpc,
    /// Server library loaded into this process
    InProcess,
    /// Engine object living in this process
    Local,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub protocol: CommunicationProtocol,
    /// Server predates capability advertisement, probe by version only
    pub legacy: bool,
    /// Encoding of message bodies
    pub encoding: Encoding,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            protocol: CommunicationProtocol::Grpc,
            legacy: false,
            encoding: Encoding::Bincode,
        }
    }
}

impl ServerConfig {
    pub fn new(protocol: CommunicationProtocol) -> Self {
        Self {
            protocol,
            ..Self::default()
        }
    }
}

/// Optional server features.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Capability {
    ApplyContext,
    ProgressBar,
    StreamedScopingIds,
    RuntimeConfig,
    FolderTransfer,
    ChunkedSerialization,
}

impl Capability {
    /// Name under which servers advertise the capability.
    pub fn name(&self) -> &'static str {
        match self {
            Self::ApplyContext => "apply_context",
            Self::ProgressBar => "progress_bar",
            Self::StreamedScopingIds => "streamed_scoping_ids",
            Self::RuntimeConfig => "runtime_config",
            Self::FolderTransfer => "folder_transfer",
            Self::ChunkedSerialization => "chunked_serialization",
        }
    }

    /// Lowest server version known to provide the capability.
    pub fn min_version(&self) -> &'static str {
        match self {
            Self::ApplyContext => version::MIN_APPLY_CONTEXT,
            Self::ProgressBar => version::MIN_PROGRESS_BAR,
            Self::StreamedScopingIds => version::MIN_STREAMED_SCOPING_IDS,
            Self::RuntimeConfig => version::MIN_RUNTIME_CONFIG,
            Self::FolderTransfer => version::MIN_FOLDER_TRANSFER,
            Self::ChunkedSerialization => version::MIN_CHUNKED_SERIALIZATION,
        }
    }
}

pub(crate) struct SessionInner {
    transport: Box<dyn Transport>,
    pub(crate) registry: HandleRegistry,
    pub(crate) cache: OutputCache,
    info: ServerInfo,
    version: VersionTuple,
    config: ServerConfig,
    context: Mutex<Option<ServerContext>>,
    pub(crate) tmp_dir: Mutex<Option<String>>,
    child: Mutex<Option<Child>>,
    reserved_port: Option<u16>,
    shut_down: AtomicBool,
}

impl SessionInner {
    fn call_raw<S: Serialize>(&self, method: Method, body: &S) -> Result<Reply> {
        let bytes = pack(body, self.config.encoding)?;
        debug!("rpc {}", method);
        self.transport.call(method, bytes)
    }

    fn call<R: Request>(&self, req: &R) -> Result<R::Response> {
        let reply = self.call_raw(R::METHOD, req)?;
        unpack(&reply.body, self.config.encoding)
    }

    /// Fire-and-forget release of a server object.
    pub(crate) fn release(&self, id: i64) {
        match self.call(&ReleaseRequest { id }) {
            Ok(_) => debug!("released handle {}", id),
            Err(e) => warn!("failed releasing handle {}: {}", id, e),
        }
    }

    fn shutdown(&self) -> Result<()> {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let ids = self.registry.drain_newest_first();
        if !ids.is_empty() {
            debug!("releasing {} outstanding handles", ids.len());
        }
        for id in ids {
            self.release(id);
        }
        if let Err(e) = self.call(&PrepareShutdownRequest {}) {
            warn!("prepare shutdown failed: {}", e);
        }
        let closed = self.transport.close();
        let child = match self.child.lock() {
            Ok(mut c) => c.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(mut child) = child {
            starter::reap(&mut child, SHUTDOWN_GRACE);
        }
        if let Some(port) = self.reserved_port {
            starter::release_port(port);
        }
        info!(
            "session with server {}:{} shut down",
            self.info.ip, self.info.port
        );
        closed
    }
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            warn!("error during session teardown: {}", e);
        }
    }
}

/// Live association with exactly one server.
///
/// Cloning a session is cheap, all clones share the same transport and
/// handle registry. The server connection is torn down once the last clone
/// is dropped, or explicitly with [`Session::shutdown`].
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    /// Starts a server process on this machine and connects to it.
    pub fn start_local(options: StartOptions) -> Result<Self> {
        let launched = starter::launch(&options)?;
        let port = launched.port;
        let mut child = launched.child;
        let remote_config = RemoteConfig {
            buffer_size: runtime_config().streaming_buffer_size as usize,
            ..RemoteConfig::default()
        };
        let transport = match RemoteTransport::connect(&launched.ip, port, remote_config) {
            Ok(t) => t,
            Err(e) => {
                starter::reap(&mut child, Duration::from_secs(0));
                starter::release_port(port);
                return Err(e);
            }
        };
        Self::establish(
            Box::new(transport),
            ServerConfig::default(),
            options.context,
            Some(child),
            Some(port),
        )
    }

    /// Attaches to an already running server.
    pub fn connect(ip: &str, port: u16) -> Result<Self> {
        Self::connect_with_context(ip, port, None)
    }

    pub fn connect_with_context(
        ip: &str,
        port: u16,
        context: Option<ServerContext>,
    ) -> Result<Self> {
        let remote_config = RemoteConfig {
            buffer_size: runtime_config().streaming_buffer_size as usize,
            ..RemoteConfig::default()
        };
        let transport = starter::retry_with_doubled_timeout(
            remote_config.connect_timeout,
            |connect_timeout| {
                RemoteTransport::connect(
                    ip,
                    port,
                    RemoteConfig {
                        connect_timeout,
                        ..remote_config
                    },
                )
            },
        )?;
        Self::establish(
            Box::new(transport),
            ServerConfig::default(),
            context,
            None,
            None,
        )
    }

    /// Loads a server library into this process.
    #[cfg(feature = "in_process")]
    pub fn load_in_process(path: &Path, context: Option<ServerContext>) -> Result<Self> {
        let transport = crate::transport::InProcessTransport::load(path)?;
        Self::establish(
            Box::new(transport),
            ServerConfig::new(CommunicationProtocol::InProcess),
            context,
            None,
            None,
        )
    }

    /// Creates a session over an engine living in this process.
    pub fn local(engine: Arc<dyn Engine>) -> Result<Self> {
        Self::from_transport(
            Box::new(LocalTransport::new(engine)),
            ServerConfig::new(CommunicationProtocol::Local),
            None,
        )
    }

    /// Creates a session over an arbitrary transport.
    pub fn from_transport(
        transport: Box<dyn Transport>,
        config: ServerConfig,
        context: Option<ServerContext>,
    ) -> Result<Self> {
        Self::establish(transport, config, context, None, None)
    }

    fn establish(
        transport: Box<dyn Transport>,
        config: ServerConfig,
        context: Option<ServerContext>,
        child: Option<Child>,
        reserved_port: Option<u16>,
    ) -> Result<Self> {
        let mut inner = SessionInner {
            transport,
            registry: HandleRegistry::default(),
            cache: OutputCache::default(),
            info: ServerInfo::default(),
            version: VersionTuple::default(),
            config,
            context: Mutex::new(None),
            tmp_dir: Mutex::new(None),
            child: Mutex::new(child),
            reserved_port,
            shut_down: AtomicBool::new(false),
        };
        // dropping `inner` on failure reaps the child and frees the port
        let info = inner.call(&ServerInfoRequest {})?;
        inner.version = VersionTuple::parse(&info.version_string())?;
        inner.info = info;
        let session = Self {
            inner: Arc::new(inner),
        };
        info!(
            "connected to server {} over {} transport, client configuration {}",
            session,
            session.kind(),
            configuration_tag()
        );

        let context = match context {
            Some(c) => c,
            None => ServerContext::from_env()?,
        };
        session.apply_context(context)?;
        Ok(session)
    }

    pub(crate) fn inner(&self) -> &SessionInner {
        &self.inner
    }

    pub(crate) fn downgrade(&self) -> Weak<SessionInner> {
        Arc::downgrade(&self.inner)
    }

    pub(crate) fn upgrade(weak: &Weak<SessionInner>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }

    /// Returns true if both values refer to the same session.
    pub fn ptr_eq(&self, other: &Session) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn info(&self) -> &ServerInfo {
        &self.inner.info
    }

    pub fn version(&self) -> VersionTuple {
        self.inner.version
    }

    pub fn config(&self) -> ServerConfig {
        self.inner.config
    }

    pub fn encoding(&self) -> Encoding {
        self.inner.config.encoding
    }

    pub fn kind(&self) -> TransportKind {
        self.inner.transport.kind()
    }

    pub fn stats(&self) -> TransportStats {
        self.inner.transport.stats()
    }

    /// Number of handles the client currently owns on this server.
    pub fn owned_handles(&self) -> usize {
        self.inner.registry.len()
    }

    /// Checks whether the server version is at least `required`.
    pub fn meets_version(&self, required: &str) -> bool {
        version::require(&self.inner.version, required).is_ok()
    }

    /// Version gate, fails with `VersionUnsupported` if the server is older
    /// than `required`.
    pub fn require(&self, required: &str) -> Result<()> {
        Ok(version::require(&self.inner.version, required)?)
    }

    /// Checks whether the server provides an optional feature.
    pub fn supports(&self, capability: Capability) -> bool {
        if !self.inner.config.legacy
            && self
                .inner
                .info
                .capabilities
                .iter()
                .any(|c| c == capability.name())
        {
            return true;
        }
        self.meets_version(capability.min_version())
    }

    /// Context currently in effect, if any was applied.
    pub fn context(&self) -> Option<ServerContext> {
        match self.inner.context.lock() {
            Ok(c) => c.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Applies a licensing context to the server. Servers that cannot take
    /// a context keep their default one, which is recorded as a notice.
    pub fn apply_context(&self, context: ServerContext) -> Result<()> {
        let msg = ContextMsg {
            licensing: context.licensing.to_string(),
            xml: match &context.xml_path {
                Some(path) => Some(fs::read_to_string(path)?),
                None => None,
            },
        };
        if self.kind() == TransportKind::InProcess {
            self.rpc(&InitializeRequest { context: msg })?;
        } else if self.supports(Capability::ApplyContext) {
            self.rpc(&ApplyContextRequest { context: msg })?;
        } else {
            warn!(
                "server version {} cannot apply the {} context (requires {}), skipping",
                self.inner.version,
                context.licensing,
                Capability::ApplyContext.min_version()
            );
            return Ok(());
        }
        info!("applied {} context", context.licensing);
        *self.inner.context.lock()? = Some(context);
        Ok(())
    }

    /// Typed unary call.
    pub fn rpc<R: Request>(&self, req: &R) -> Result<R::Response> {
        self.inner.call(req)
    }

    /// Unary call returning a handle. Handles the server kept for itself
    /// are duplicated right away, so the returned handle is always owned.
    pub fn rpc_handle<R: Request<Response = EntityRef>>(&self, req: &R) -> Result<Handle> {
        let reply = self.inner.call_raw(R::METHOD, req)?;
        let entity: EntityRef = self.decode(&reply.body)?;
        self.adopt(entity, reply.ownership)
    }

    pub(crate) fn call_raw<S: Serialize>(&self, method: Method, body: &S) -> Result<Reply> {
        self.inner.call_raw(method, body)
    }

    /// Turns a handle received from the server into an owned handle.
    pub(crate) fn adopt(&self, entity: EntityRef, ownership: Ownership) -> Result<Handle> {
        match ownership {
            Ownership::Owned => Ok(Handle::register(self, entity.kind, entity.id)),
            Ownership::Borrowed => {
                let borrowed = Handle::wrap_borrowed(self, entity.kind, entity.id);
                borrowed.duplicate_reference()
            }
        }
    }

    /// Wraps an id obtained out of band without taking ownership of it.
    pub fn borrow_handle(&self, kind: ObjectKind, id: i64) -> Handle {
        Handle::wrap_borrowed(self, kind, id)
    }

    pub fn encode<S: Serialize>(&self, body: &S) -> Result<Vec<u8>> {
        pack(body, self.encoding())
    }

    pub fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T> {
        unpack(bytes, self.encoding())
    }

    pub(crate) fn server_stream<S: Serialize>(
        &self,
        method: Method,
        body: &S,
    ) -> Result<ChunkStream> {
        let bytes = self.encode(body)?;
        debug!("opening server stream {}", method);
        self.inner.transport.server_stream(method, bytes)
    }

    pub(crate) fn client_stream(&self, method: Method, chunks: ChunkSource<'_>) -> Result<Reply> {
        debug!("opening client stream {}", method);
        self.inner.transport.client_stream(method, chunks)
    }

    /// Releases every owned handle, newest first, tells the server to shut
    /// down, closes the transport and stops the server process if this
    /// session started it. Calling this more than once has no effect.
    pub fn shutdown(&self) -> Result<()> {
        self.inner.shutdown()
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shut_down.load(Ordering::SeqCst)
    }

    /// Multi-line description of the session, used in diagnostics.
    pub fn diagnostics(&self) -> String {
        let info = self.info();
        format!(
            "server: {}:{}\npid: {}\nversion: {}\nos: {}\ntransport: {}\ncontext: {}\ncapabilities: {}\nowned handles: {}\nclient configuration: {}",
            info.ip,
            info.port,
            info.pid,
            self.version(),
            info.os,
            self.kind(),
            self.context()
                .map(|c| c.licensing.to_string())
                .unwrap_or_else(|| "server default".to_string()),
            info.capabilities.join(", "),
            self.owned_handles(),
            configuration_tag(),
        )
    }
}

fn configuration_tag() -> String {
    env::var(ENV_CONFIGURATION).unwrap_or_else(|_| "release".to_string())
}

impl fmt::Display for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{} (version {})",
            self.inner.info.ip, self.inner.info.port, self.inner.version
        )
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("ip", &self.inner.info.ip)
            .field("port", &self.inner.info.port)
            .field("version", &self.inner.version)
            .field("transport", &self.kind())
            .finish()
    }
}
