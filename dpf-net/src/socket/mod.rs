//! Framing and body encoding shared by the connection-based transports.
//!
//! Every frame on a stream connection is a little-endian `u32` length
//! followed by a bincode-encoded [`Frame`]. The frame carries the fully
//! qualified method name and an opaque body, encoded with the session's
//! [`Encoding`].

use std::fmt::{Display, Formatter};
use std::io::{Read, Write};
use std::str::FromStr;

use byteorder::{ByteOrder, LittleEndian};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_repr::{Deserialize_repr, Serialize_repr};

use crate::{Error, Result};

/// Upper bound on a single frame, guards against reading garbage lengths.
pub const MAX_FRAME_LEN: usize = 1 << 30;

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Frame {
    pub kind: FrameKind,
    /// Fully qualified method name, empty on continuation frames
    pub method: String,
    #[serde(with = "serde_bytes")]
    pub bytes: Vec<u8>,
}

impl Frame {
    pub fn new(kind: FrameKind, method: &str, bytes: Vec<u8>) -> Self {
        Self {
            kind,
            method: method.to_string(),
            bytes,
        }
    }

    pub fn chunk(bytes: Vec<u8>) -> Self {
        Self::new(FrameKind::Chunk, "", bytes)
    }

    pub fn end_of_stream() -> Self {
        Self::new(FrameKind::EndOfStream, "", Vec::new())
    }

    pub fn fault(message: &str) -> Self {
        Self::new(FrameKind::Fault, "", message.as_bytes().to_vec())
    }

    /// Turns a fault frame into the matching error, passing other frames
    /// through.
    pub fn into_result(self) -> Result<Self> {
        match self.kind {
            FrameKind::Fault => Err(Error::from_server_message(
                String::from_utf8_lossy(&self.bytes).into_owned(),
            )),
            _ => Ok(self),
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Deserialize_repr, Serialize_repr)]
#[repr(u8)]
pub enum FrameKind {
    /// Unary request
    Call,
    /// Request opening a server-to-client stream
    ServerStreamCall,
    /// Request opening a client-to-server stream
    ClientStreamOpen,
    /// Single piece of a stream, in either direction
    Chunk,
    EndOfStream,
    /// Reply carrying a handle the client now owns
    Reply,
    /// Reply carrying a handle still owned by the server
    BorrowedReply,
    /// Error reported by the server, body is a utf-8 message
    Fault,
}

/// Writes a single length-prefixed frame.
pub fn write_frame<W: Write>(writer: &mut W, frame: &Frame) -> Result<()> {
    let bytes = bincode::serialize(frame)?;
    let mut len_buf = [0; 4];
    LittleEndian::write_u32(&mut len_buf, bytes.len() as u32);
    writer.write_all(&len_buf)?;
    writer.write_all(&bytes)?;
    trace!(
        "wrote {:?} frame ({} bytes) {}",
        frame.kind,
        bytes.len(),
        frame.method
    );
    Ok(())
}

/// Reads a single length-prefixed frame, blocking until it's complete.
pub fn read_frame<R: Read>(reader: &mut R) -> Result<Frame> {
    let mut len_buf = [0; 4];
    reader.read_exact(&mut len_buf)?;
    let len = LittleEndian::read_u32(&len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(Error::ParseError(format!(
            "frame length {} exceeds maximum of {}",
            len, MAX_FRAME_LEN
        )));
    }
    let mut buf = vec![0; len];
    reader.read_exact(&mut buf)?;
    let frame: Frame = bincode::deserialize(&buf)?;
    trace!("read {:?} frame ({} bytes) {}", frame.kind, len, frame.method);
    Ok(frame)
}

/// List of possible formats for encoding message bodies.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Deserialize_repr, Serialize_repr)]
#[repr(u8)]
pub enum Encoding {
    /// Fast binary format, the default
    Bincode,
    /// Binary format with implementations in many different languages
    MsgPack,
    /// Very common but more verbose format, handy for debugging
    Json,
}

impl Default for Encoding {
    fn default() -> Self {
        Self::Bincode
    }
}

impl FromStr for Encoding {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        let e = match s.to_lowercase().as_str() {
            "bincode" | "bin" => Self::Bincode,
            #[cfg(feature = "msgpack_encoding")]
            "msgpack" | "messagepack" | "rmp" => Self::MsgPack,
            #[cfg(feature = "json_encoding")]
            "json" => Self::Json,
            _ => {
                return Err(Error::ParseError(format!(
                    "failed parsing encoding from string: {}",
                    s
                )))
            }
        };
        Ok(e)
    }
}

impl Display for Encoding {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bincode => write!(f, "bincode"),
            Self::MsgPack => write!(f, "msgpack"),
            Self::Json => write!(f, "json"),
        }
    }
}

/// Packs serializable object to bytes based on selected encoding.
pub fn pack<S: Serialize>(obj: &S, encoding: Encoding) -> Result<Vec<u8>> {
    let packed: Vec<u8> = match encoding {
        Encoding::Bincode => bincode::serialize(obj)?,
        Encoding::MsgPack => {
            #[cfg(not(feature = "msgpack_encoding"))]
            return Err(feature_disabled(encoding));
            #[cfg(feature = "msgpack_encoding")]
            {
                let mut buf = Vec::new();
                obj.serialize(&mut rmp_serde::Serializer::new(&mut buf))?;
                buf
            }
        }
        Encoding::Json => {
            #[cfg(not(feature = "json_encoding"))]
            return Err(feature_disabled(encoding));
            #[cfg(feature = "json_encoding")]
            {
                serde_json::to_vec(obj)?
            }
        }
    };
    Ok(packed)
}

/// Unpacks object from bytes based on selected encoding.
pub fn unpack<P: DeserializeOwned>(bytes: &[u8], encoding: Encoding) -> Result<P> {
    let unpacked = match encoding {
        Encoding::Bincode => bincode::deserialize(bytes)?,
        Encoding::MsgPack => {
            #[cfg(not(feature = "msgpack_encoding"))]
            return Err(feature_disabled(encoding));
            #[cfg(feature = "msgpack_encoding")]
            {
                let mut de = rmp_serde::Deserializer::new(bytes);
                serde::Deserialize::deserialize(&mut de)?
            }
        }
        Encoding::Json => {
            #[cfg(not(feature = "json_encoding"))]
            return Err(feature_disabled(encoding));
            #[cfg(feature = "json_encoding")]
            {
                serde_json::from_slice(bytes)?
            }
        }
    };
    Ok(unpacked)
}

#[allow(dead_code)]
fn feature_disabled(encoding: Encoding) -> Error {
    Error::InvalidArgument(format!(
        "{} encoding requested, but the matching crate feature is not enabled",
        encoding
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn frames_are_length_prefixed() {
        let mut buf = Vec::new();
        let frame = Frame::new(FrameKind::Call, "dpf.base.v0.BaseService/Describe", vec![1, 2, 3]);
        write_frame(&mut buf, &frame).unwrap();
        let len = LittleEndian::read_u32(&buf[0..4]) as usize;
        assert_eq!(len, buf.len() - 4);

        write_frame(&mut buf, &Frame::end_of_stream()).unwrap();
        let mut cursor = Cursor::new(buf);
        assert_eq!(read_frame(&mut cursor).unwrap(), frame);
        assert_eq!(read_frame(&mut cursor).unwrap().kind, FrameKind::EndOfStream);
        assert!(read_frame(&mut cursor).is_err());
    }

    #[test]
    fn fault_frames_become_errors() {
        let err = Frame::fault("object is null in the dataBase")
            .into_result()
            .unwrap_err();
        assert!(matches!(err, Error::MissingObject(_)));
        assert!(Frame::chunk(vec![0]).into_result().is_ok());
    }

    #[test]
    fn bincode_bodies_round_trip() {
        let body = crate::msg::DescribeRequest { id: 42 };
        let bytes = pack(&body, Encoding::Bincode).unwrap();
        let back: crate::msg::DescribeRequest = unpack(&bytes, Encoding::Bincode).unwrap();
        assert_eq!(back, body);
    }

    #[test]
    fn encoding_names() {
        assert_eq!("bin".parse::<Encoding>().unwrap(), Encoding::Bincode);
        assert!("yaml".parse::<Encoding>().is_err());
        assert_eq!(Encoding::default().to_string(), "bincode");
    }
}
