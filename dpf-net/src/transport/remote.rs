//! Framed request/reply transport over tcp.
//!
//! Connections are pooled. A unary call checks out an idle connection (or
//! dials a new one), writes the request frame and blocks on the reply frame.
//! Streams hold on to their connection until the stream is fully drained,
//! at which point it goes back to the pool. Connections in an unknown state,
//! e.g. after an abandoned stream or an io error, are dropped instead.

use std::io::{BufReader, BufWriter, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};

use crate::error::classify_io;
use crate::msg::Method;
use crate::socket::{read_frame, write_frame, Frame, FrameKind};
use crate::transport::{
    ChunkSource, ChunkStream, Ownership, Reply, Transport, TransportKind, TransportStats,
};
use crate::{Error, Result};

#[derive(Debug, Copy, Clone)]
pub struct RemoteConfig {
    pub connect_timeout: Duration,
    /// Maximum wait on a single read or write, `None` waits forever
    pub call_timeout: Option<Duration>,
    /// Size of the read and write buffers of each connection
    pub buffer_size: usize,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            call_timeout: None,
            buffer_size: 64 * 1024,
        }
    }
}

struct Connection {
    reader: BufReader<TcpStream>,
    writer: BufWriter<TcpStream>,
}

impl Connection {
    fn open(addr: &SocketAddr, config: &RemoteConfig) -> Result<Self> {
        let stream = TcpStream::connect_timeout(addr, config.connect_timeout)
            .map_err(|e| classify_io(e, &format!("connecting to {}", addr)))?;
        stream.set_nodelay(true)?;
        stream.set_read_timeout(config.call_timeout)?;
        stream.set_write_timeout(config.call_timeout)?;
        let read_half = stream.try_clone()?;
        Ok(Self {
            reader: BufReader::with_capacity(config.buffer_size, read_half),
            writer: BufWriter::with_capacity(config.buffer_size, stream),
        })
    }

    fn send(&mut self, frame: &Frame) -> Result<()> {
        write_frame(&mut self.writer, frame).map_err(io_context("sending frame"))
    }

    fn flush(&mut self) -> Result<()> {
        self.writer
            .flush()
            .map_err(|e| classify_io(e, "flushing connection"))
    }

    fn recv(&mut self) -> Result<Frame> {
        read_frame(&mut self.reader).map_err(io_context("reading frame"))
    }
}

fn io_context(context: &'static str) -> impl Fn(Error) -> Error {
    move |e| match e {
        Error::Io(io) => classify_io(io, context),
        other => other,
    }
}

struct Pool {
    addr: SocketAddr,
    config: RemoteConfig,
    idle_sender: Sender<Connection>,
    idle_receiver: Receiver<Connection>,
    closed: AtomicBool,
}

impl Pool {
    fn checkout(&self) -> Result<Connection> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::TransportUnavailable(format!(
                "transport to {} is closed",
                self.addr
            )));
        }
        match self.idle_receiver.try_recv() {
            Ok(conn) => Ok(conn),
            Err(_) => {
                debug!("dialing new connection to {}", self.addr);
                Connection::open(&self.addr, &self.config)
            }
        }
    }

    fn checkin(&self, conn: Connection) {
        if !self.closed.load(Ordering::SeqCst) {
            // unbounded channel, send only fails when disconnected
            let _ = self.idle_sender.send(conn);
        }
    }
}

/// Transport talking to a server process over tcp.
pub struct RemoteTransport {
    pool: Arc<Pool>,
    calls: AtomicU64,
    inbound: Arc<AtomicU64>,
    outbound: AtomicU64,
}

impl RemoteTransport {
    /// Connects to the server at the given address. A first connection is
    /// established right away so that an unreachable server is reported
    /// here rather than on the first call.
    pub fn connect(ip: &str, port: u16, config: RemoteConfig) -> Result<Self> {
        let addr = (ip, port)
            .to_socket_addrs()
            .map_err(|e| Error::InvalidArgument(format!("bad address {}:{}: {}", ip, port, e)))?
            .next()
            .ok_or_else(|| {
                Error::InvalidArgument(format!("address {}:{} did not resolve", ip, port))
            })?;
        let (idle_sender, idle_receiver) = crossbeam_channel::unbounded();
        let pool = Pool {
            addr,
            config,
            idle_sender,
            idle_receiver,
            closed: AtomicBool::new(false),
        };
        let first = Connection::open(&addr, &config)?;
        pool.checkin(first);
        info!("connected to server at {}", addr);
        Ok(Self {
            pool: Arc::new(pool),
            calls: AtomicU64::new(0),
            inbound: Arc::new(AtomicU64::new(0)),
            outbound: AtomicU64::new(0),
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.pool.addr
    }

    fn finish_reply(&self, mut conn: Connection) -> Result<Reply> {
        let frame = conn.recv()?;
        let reply = match frame.kind {
            FrameKind::Reply => Reply::owned(frame.bytes),
            FrameKind::BorrowedReply => Reply {
                body: frame.bytes,
                ownership: Ownership::Borrowed,
            },
            FrameKind::Fault => {
                // the exchange is complete, the connection is still usable
                self.pool.checkin(conn);
                return Err(Error::from_server_message(
                    String::from_utf8_lossy(&frame.bytes).into_owned(),
                ));
            }
            other => {
                return Err(Error::ParseError(format!(
                    "expected reply frame, got {:?}",
                    other
                )))
            }
        };
        self.pool.checkin(conn);
        Ok(reply)
    }
}

impl Transport for RemoteTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Remote
    }

    fn call(&self, method: Method, body: Vec<u8>) -> Result<Reply> {
        let mut conn = self.pool.checkout()?;
        self.calls.fetch_add(1, Ordering::Relaxed);
        conn.send(&Frame::new(FrameKind::Call, &method.full_name(), body))?;
        conn.flush()?;
        self.finish_reply(conn)
    }

    fn server_stream(&self, method: Method, body: Vec<u8>) -> Result<ChunkStream> {
        let mut conn = self.pool.checkout()?;
        conn.send(&Frame::new(
            FrameKind::ServerStreamCall,
            &method.full_name(),
            body,
        ))?;
        conn.flush()?;
        Ok(Box::new(RemoteChunkStream {
            conn: Some(conn),
            pool: self.pool.clone(),
            counter: self.inbound.clone(),
        }))
    }

    fn client_stream(&self, method: Method, chunks: ChunkSource<'_>) -> Result<Reply> {
        let mut conn = self.pool.checkout()?;
        conn.send(&Frame::new(
            FrameKind::ClientStreamOpen,
            &method.full_name(),
            Vec::new(),
        ))?;
        for chunk in chunks {
            // on a source error the connection is dropped mid-stream, which
            // the server observes as an aborted call
            let chunk = chunk?;
            conn.send(&Frame::chunk(chunk))?;
            self.outbound.fetch_add(1, Ordering::Relaxed);
        }
        conn.send(&Frame::end_of_stream())?;
        conn.flush()?;
        self.finish_reply(conn)
    }

    fn close(&self) -> Result<()> {
        self.pool.closed.store(true, Ordering::SeqCst);
        while let Ok(conn) = self.pool.idle_receiver.try_recv() {
            let _ = conn.writer.get_ref().shutdown(std::net::Shutdown::Both);
        }
        debug!("closed transport to {}", self.pool.addr);
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

/// Stream of chunks read off a checked-out connection.
struct RemoteChunkStream {
    conn: Option<Connection>,
    pool: Arc<Pool>,
    counter: Arc<AtomicU64>,
}

impl Iterator for RemoteChunkStream {
    type Item = Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        let conn = self.conn.as_mut()?;
        let frame = match conn.recv() {
            Ok(frame) => frame,
            Err(e) => {
                self.conn = None;
                return Some(Err(e));
            }
        };
        match frame.kind {
            FrameKind::Chunk => {
                self.counter.fetch_add(1, Ordering::Relaxed);
                Some(Ok(frame.bytes))
            }
            FrameKind::EndOfStream => {
                if let Some(conn) = self.conn.take() {
                    self.pool.checkin(conn);
                }
                None
            }
            FrameKind::Fault => {
                if let Some(conn) = self.conn.take() {
                    self.pool.checkin(conn);
                }
                Some(Err(Error::from_server_message(
                    String::from_utf8_lossy(&frame.bytes).into_owned(),
                )))
            }
            other => {
                self.conn = None;
                Some(Err(Error::ParseError(format!(
                    "unexpected {:?} frame in stream",
                    other
                ))))
            }
        }
    }
}
