//! MessagePack codec backed by `rmp-serde`.
//!
//! Structs are written as maps keyed by field name (`to_vec_named`), so an
//! envelope or fault gaining an optional field stays readable by peers
//! built before the field existed.

use serde::de::DeserializeOwned;
use serde::Serialize;

use super::Codec;
use crate::error::Result;

/// The codec every envelope and payload uses unless a connection says otherwise.
#[derive(Debug, Clone, Copy, Default)]
pub struct MsgPackCodec;

impl Codec for MsgPackCodec {
    fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>> {
        rmp_serde::to_vec_named(value).map_err(Into::into)
    }

    fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
        rmp_serde::from_slice(bytes).map_err(Into::into)
    }
}
