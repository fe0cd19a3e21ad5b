//! Frame type.
//!
//! Uses `bytes::Bytes` for zero-copy payload sharing.
//!
//! # Example
//!
//! ```
//! use proclink::protocol::{ControlCode, Frame};
//! use bytes::Bytes;
//!
//! let frame = Frame::Data(Bytes::from_static(b"hello"));
//! assert_eq!(frame.to_bytes().unwrap().len(), 9);
//!
//! let ping = Frame::Code(ControlCode::KeepAlive);
//! assert_eq!(&ping.to_bytes().unwrap()[..], &[0, 0, 0, 0]);
//! ```

use bytes::{BufMut, Bytes, BytesMut};

use super::wire_format::{encode_length, ControlCode, LENGTH_PREFIX_SIZE};
use crate::error::Result;

/// One unit read from or written to the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Length-prefixed payload (an encoded envelope, or preamble JSON).
    Data(Bytes),
    /// Control code.
    Code(ControlCode),
}

impl Frame {
    /// Prefix bytes for this frame.
    pub fn prefix(&self) -> Result<[u8; LENGTH_PREFIX_SIZE]> {
        match self {
            Frame::Data(payload) => encode_length(payload.len()),
            Frame::Code(code) => code.encode(),
        }
    }

    /// Encode into one contiguous buffer.
    pub fn to_bytes(&self) -> Result<Bytes> {
        let prefix = self.prefix()?;
        match self {
            Frame::Data(payload) => Ok(build_frame(prefix, payload)),
            Frame::Code(_) => Ok(Bytes::copy_from_slice(&prefix)),
        }
    }

    /// Payload of a data frame.
    pub fn payload(&self) -> Option<&Bytes> {
        match self {
            Frame::Data(payload) => Some(payload),
            Frame::Code(_) => None,
        }
    }

    /// Code of a code frame.
    pub fn code(&self) -> Option<ControlCode> {
        match self {
            Frame::Code(code) => Some(*code),
            Frame::Data(_) => None,
        }
    }
}

/// Concatenate a prefix and payload.
///
/// The writer task uses scatter/gather instead; this is for one-off writes.
pub fn build_frame(prefix: [u8; LENGTH_PREFIX_SIZE], payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(LENGTH_PREFIX_SIZE + payload.len());
    buf.put_slice(&prefix);
    buf.put_slice(payload);
    buf.freeze()
}
