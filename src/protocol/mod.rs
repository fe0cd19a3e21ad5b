//! Protocol module - wire format, framing, and frame types.
//!
//! - 4-byte little-endian prefix: positive length or non-positive code
//! - Frame buffer for accumulating partial reads
//! - Async frame reader over any `AsyncRead`

mod frame;
mod frame_buffer;
mod reader;
mod wire_format;

pub use frame::{build_frame, Frame};
pub use frame_buffer::FrameBuffer;
pub use reader::FrameReader;
pub use wire_format::{
    encode_length, ControlCode, Prefix, ABSOLUTE_MAX_FRAME_SIZE, DEFAULT_MAX_FRAME_SIZE,
    LENGTH_PREFIX_SIZE,
};
