//! Transport calling into a server library loaded into this process.
//!
//! The library exports a small C interface. Buffers handed out by the
//! library are returned to it through `DpfFree`. Status codes:
//!
//! - `DpfCall`, `DpfStreamAppend`, `DpfStreamFinish`: `0` owned reply,
//!   `1` borrowed reply, negative on error with a utf-8 message in the
//!   output buffer
//! - `DpfStreamNext`: `1` chunk, `0` end of stream, negative on error
//!
//! Server-to-client streams are pulled one chunk at a time. Client-to-server
//! streams are turned into repeated appends followed by a finishing call.

use std::ffi::CString;
use std::os::raw::{c_char, c_int, c_void};
use std::path::{Path, PathBuf};
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use libloading::Library;

use crate::msg::Method;
use crate::transport::{
    ChunkSource, ChunkStream, Ownership, Reply, Transport, TransportKind, TransportStats,
};
use crate::{Error, Result};

type CallFn = unsafe extern "C" fn(
    method: *const c_char,
    req: *const u8,
    req_len: usize,
    out: *mut *mut u8,
    out_len: *mut usize,
) -> c_int;
type OpenStreamFn = unsafe extern "C" fn(
    method: *const c_char,
    req: *const u8,
    req_len: usize,
    stream: *mut *mut c_void,
    out: *mut *mut u8,
    out_len: *mut usize,
) -> c_int;
type StreamNextFn =
    unsafe extern "C" fn(stream: *mut c_void, out: *mut *mut u8, out_len: *mut usize) -> c_int;
type StreamCloseFn = unsafe extern "C" fn(stream: *mut c_void);
type FinishFn =
    unsafe extern "C" fn(method: *const c_char, out: *mut *mut u8, out_len: *mut usize) -> c_int;
type FreeFn = unsafe extern "C" fn(ptr: *mut u8, len: usize);

/// Entry points resolved from the library. The function pointers stay
/// valid for as long as `_lib` is alive.
struct Api {
    call: CallFn,
    open_stream: OpenStreamFn,
    stream_next: StreamNextFn,
    stream_close: StreamCloseFn,
    append: CallFn,
    finish: FinishFn,
    free: FreeFn,
    _lib: Library,
}

// the library is required to be thread-safe
unsafe impl Send for Api {}
unsafe impl Sync for Api {}

impl Api {
    fn load(path: &Path) -> Result<Self> {
        unsafe {
            let lib = Library::new(path)?;
            let call = *lib.get::<CallFn>(b"DpfCall\0")?;
            let open_stream = *lib.get::<OpenStreamFn>(b"DpfOpenStream\0")?;
            let stream_next = *lib.get::<StreamNextFn>(b"DpfStreamNext\0")?;
            let stream_close = *lib.get::<StreamCloseFn>(b"DpfStreamClose\0")?;
            let append = *lib.get::<CallFn>(b"DpfStreamAppend\0")?;
            let finish = *lib.get::<FinishFn>(b"DpfStreamFinish\0")?;
            let free = *lib.get::<FreeFn>(b"DpfFree\0")?;
            Ok(Self {
                call,
                open_stream,
                stream_next,
                stream_close,
                append,
                finish,
                free,
                _lib: lib,
            })
        }
    }

    /// Copies a library-owned buffer and hands it back to the library.
    unsafe fn take_buffer(&self, out: *mut u8, out_len: usize) -> Vec<u8> {
        if out.is_null() {
            return Vec::new();
        }
        let bytes = std::slice::from_raw_parts(out, out_len).to_vec();
        (self.free)(out, out_len);
        bytes
    }

    fn status_to_reply(&self, status: c_int, body: Vec<u8>) -> Result<Reply> {
        match status {
            0 => Ok(Reply::owned(body)),
            1 => Ok(Reply {
                body,
                ownership: Ownership::Borrowed,
            }),
            s if s < 0 => Err(Error::from_server_message(
                String::from_utf8_lossy(&body).into_owned(),
            )),
            s => Err(Error::ParseError(format!("unexpected status code {}", s))),
        }
    }
}

fn method_cstring(method: Method) -> Result<CString> {
    CString::new(method.full_name())
        .map_err(|e| Error::InvalidArgument(format!("method name: {}", e)))
}

/// Transport backed by a native server library.
pub struct InProcessTransport {
    api: Arc<Api>,
    path: PathBuf,
    closed: AtomicBool,
    calls: AtomicU64,
    inbound: Arc<AtomicU64>,
    outbound: AtomicU64,
}

impl InProcessTransport {
    pub fn load(path: &Path) -> Result<Self> {
        let api = Api::load(path)?;
        info!("loaded server library {}", path.display());
        Ok(Self {
            api: Arc::new(api),
            path: path.to_path_buf(),
            closed: AtomicBool::new(false),
            calls: AtomicU64::new(0),
            inbound: Arc::new(AtomicU64::new(0)),
            outbound: AtomicU64::new(0),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(Error::TransportUnavailable(format!(
                "library {} was closed",
                self.path.display()
            )))
        } else {
            Ok(())
        }
    }

    fn invoke(&self, f: CallFn, method: Method, body: &[u8]) -> Result<Reply> {
        let name = method_cstring(method)?;
        let mut out: *mut u8 = ptr::null_mut();
        let mut out_len: usize = 0;
        let (status, bytes) = unsafe {
            let status = f(
                name.as_ptr(),
                body.as_ptr(),
                body.len(),
                &mut out,
                &mut out_len,
            );
            (status, self.api.take_buffer(out, out_len))
        };
        self.api.status_to_reply(status, bytes)
    }
}

impl Transport for InProcessTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::InProcess
    }

    fn call(&self, method: Method, body: Vec<u8>) -> Result<Reply> {
        self.check_open()?;
        self.calls.fetch_add(1, Ordering::Relaxed);
        self.invoke(self.api.call, method, &body)
    }

    fn server_stream(&self, method: Method, body: Vec<u8>) -> Result<ChunkStream> {
        self.check_open()?;
        let name = method_cstring(method)?;
        let mut stream: *mut c_void = ptr::null_mut();
        let mut out: *mut u8 = ptr::null_mut();
        let mut out_len: usize = 0;
        let status = unsafe {
            let status = (self.api.open_stream)(
                name.as_ptr(),
                body.as_ptr(),
                body.len(),
                &mut stream,
                &mut out,
                &mut out_len,
            );
            let message = self.api.take_buffer(out, out_len);
            if status < 0 {
                return Err(Error::from_server_message(
                    String::from_utf8_lossy(&message).into_owned(),
                ));
            }
            status
        };
        if stream.is_null() {
            return Err(Error::ServerError(format!(
                "library returned no stream for {} (status {})",
                method, status
            )));
        }
        Ok(Box::new(NativeChunkStream {
            api: self.api.clone(),
            stream,
            counter: self.inbound.clone(),
        }))
    }

    fn client_stream(&self, method: Method, chunks: ChunkSource<'_>) -> Result<Reply> {
        self.check_open()?;
        for chunk in chunks {
            let chunk = chunk?;
            self.invoke(self.api.append, method, &chunk)?;
            self.outbound.fetch_add(1, Ordering::Relaxed);
        }
        let name = method_cstring(method)?;
        let mut out: *mut u8 = ptr::null_mut();
        let mut out_len: usize = 0;
        let (status, bytes) = unsafe {
            let status = (self.api.finish)(name.as_ptr(), &mut out, &mut out_len);
            (status, self.api.take_buffer(out, out_len))
        };
        self.api.status_to_reply(status, bytes)
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

/// Pull-based stream over a native stream object.
struct NativeChunkStream {
    api: Arc<Api>,
    stream: *mut c_void,
    counter: Arc<AtomicU64>,
}

// the native stream is only ever touched by the thread owning the iterator
unsafe impl Send for NativeChunkStream {}

impl Iterator for NativeChunkStream {
    type Item = Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.stream.is_null() {
            return None;
        }
        let mut out: *mut u8 = ptr::null_mut();
        let mut out_len: usize = 0;
        let (status, bytes) = unsafe {
            let status = (self.api.stream_next)(self.stream, &mut out, &mut out_len);
            (status, self.api.take_buffer(out, out_len))
        };
        match status {
            1 => {
                self.counter.fetch_add(1, Ordering::Relaxed);
                Some(Ok(bytes))
            }
            0 => {
                self.close();
                None
            }
            s => {
                self.close();
                if s < 0 {
                    Some(Err(Error::from_server_message(
                        String::from_utf8_lossy(&bytes).into_owned(),
                    )))
                } else {
                    Some(Err(Error::ParseError(format!(
                        "unexpected stream status {}",
                        s
                    ))))
                }
            }
        }
    }
}

impl NativeChunkStream {
    fn close(&mut self) {
        if !self.stream.is_null() {
            unsafe { (self.api.stream_close)(self.stream) };
            self.stream = ptr::null_mut();
        }
    }
}

impl Drop for NativeChunkStream {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_library_is_an_error() {
        let result = InProcessTransport::load(Path::new("/nonexistent/libDPFClientAPI.so"));
        assert!(matches!(result, Err(Error::LibLoadingError(_))));
    }
}
