//! Codec module - the object serializer used for envelopes and call payloads.
//!
//! The protocol core never picks a wire representation for user values on its
//! own; it goes through a [`Codec`]. Codecs are zero-sized marker types with
//! associated functions, so the choice is made at compile time and costs no
//! dynamic dispatch:
//!
//! - [`MsgPackCodec`] - MessagePack using `rmp-serde` (`to_vec_named`)
//!
//! # Example
//!
//! ```
//! use proclink::codec::{Codec, MsgPackCodec};
//!
//! let encoded = MsgPackCodec::encode(&"hello").unwrap();
//! let decoded: String = MsgPackCodec::decode(&encoded).unwrap();
//! assert_eq!(decoded, "hello");
//! ```

mod msgpack;

pub use msgpack::MsgPackCodec;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::Result;

/// Object graph serializer contract.
///
/// Implementations must be lossless for any type whose `Serialize` and
/// `Deserialize` impls agree.
pub trait Codec: Send + Sync + 'static {
    /// Serialize a value to bytes.
    fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>>;

    /// Deserialize a value from bytes.
    fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T>;
}

/// Codec used when none is named explicitly.
pub type DefaultCodec = MsgPackCodec;
