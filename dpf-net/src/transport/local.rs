//! Transport dispatching straight into an engine object living in this
//! process.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crate::msg::Method;
use crate::transport::{ChunkSource, ChunkStream, Reply, Transport, TransportKind, TransportStats};
use crate::{Error, Result};

/// Server-side counterpart of a [`Transport`]: something that can answer
/// encoded requests.
pub trait Engine: Send + Sync {
    fn handle_call(&self, method: Method, body: &[u8]) -> Result<Reply>;
    fn handle_server_stream(&self, method: Method, body: &[u8]) -> Result<ChunkStream>;
    fn handle_client_stream(&self, method: Method, chunks: ChunkSource<'_>) -> Result<Reply>;
}

pub struct LocalTransport {
    engine: Arc<dyn Engine>,
    closed: AtomicBool,
    calls: AtomicU64,
    inbound: Arc<AtomicU64>,
    outbound: AtomicU64,
}

impl LocalTransport {
    pub fn new(engine: Arc<dyn Engine>) -> Self {
        Self {
            engine,
            closed: AtomicBool::new(false),
            calls: AtomicU64::new(0),
            inbound: Arc::new(AtomicU64::new(0)),
            outbound: AtomicU64::new(0),
        }
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(Error::TransportUnavailable(
                "local transport is closed".to_string(),
            ))
        } else {
            Ok(())
        }
    }
}

impl Transport for LocalTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Local
    }

    fn call(&self, method: Method, body: Vec<u8>) -> Result<Reply> {
        self.check_open()?;
        self.calls.fetch_add(1, Ordering::Relaxed);
        trace!("local call {}", method);
        self.engine.handle_call(method, &body)
    }

    fn server_stream(&self, method: Method, body: Vec<u8>) -> Result<ChunkStream> {
        self.check_open()?;
        trace!("local server stream {}", method);
        let stream = self.engine.handle_server_stream(method, &body)?;
        let counter = self.inbound.clone();
        Ok(Box::new(stream.inspect(move |chunk| {
            if chunk.is_ok() {
                counter.fetch_add(1, Ordering::Relaxed);
            }
        })))
    }

    fn client_stream(&self, method: Method, chunks: ChunkSource<'_>) -> Result<Reply> {
        self.check_open()?;
        trace!("local client stream {}", method);
        let outbound = &self.outbound;
        let mut counted = chunks.inspect(|chunk| {
            if chunk.is_ok() {
                outbound.fetch_add(1, Ordering::Relaxed);
            }
        });
        self.engine.handle_client_stream(method, &mut counted)
    }

    fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn stats(&self) -> TransportStats {
        TransportStats {
            calls: self.calls.load(Ordering::Relaxed),
            inbound_chunks: self.inbound.load(Ordering::Relaxed),
            outbound_chunks: self.outbound.load(Ordering::Relaxed),
        }
    }
}
