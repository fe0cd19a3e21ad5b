//! Wire format encoding and decoding.
//!
//! Every unit on the stream starts with a 4-byte little-endian signed prefix:
//!
//! ```text
//! Data frame:  ┌──────────────┬──────────────────┐
//!              │ length > 0   │ payload (length) │
//!              │ int32 LE     │                  │
//!              └──────────────┴──────────────────┘
//!
//! Code frame:  ┌──────────────┐
//!              │ code <= 0    │
//!              │ int32 LE     │
//!              └──────────────┘
//! ```
//!
//! Keep-alive and the handshake/teardown phase codes share the code channel.

use crate::error::{Result, RpcError};

/// Prefix size in bytes (fixed, exactly 4).
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Default maximum data frame payload (64 MiB).
pub const DEFAULT_MAX_FRAME_SIZE: u32 = 64 * 1024 * 1024;

/// Absolute maximum payload size (max i32).
pub const ABSOLUTE_MAX_FRAME_SIZE: u32 = i32::MAX as u32;

/// Control codes carried by code frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControlCode {
    /// `0`: liveness only.
    KeepAlive,
    /// `-1`: initiator is alive.
    Handshake1,
    /// `-2`: responder initialized.
    Handshake2,
    /// `-3`: initiator initialized.
    Handshake3,
    /// `-4`: teardown requested.
    Teardown1,
    /// `-5`: teardown acknowledged.
    Teardown2,
    /// Any other non-positive value.
    Unknown(i32),
}

impl ControlCode {
    /// Interpret a non-positive prefix value.
    pub fn from_wire(value: i32) -> Self {
        match value {
            0 => ControlCode::KeepAlive,
            -1 => ControlCode::Handshake1,
            -2 => ControlCode::Handshake2,
            -3 => ControlCode::Handshake3,
            -4 => ControlCode::Teardown1,
            -5 => ControlCode::Teardown2,
            other => ControlCode::Unknown(other),
        }
    }

    /// Value written on the wire.
    pub fn to_wire(self) -> i32 {
        match self {
            ControlCode::KeepAlive => 0,
            ControlCode::Handshake1 => -1,
            ControlCode::Handshake2 => -2,
            ControlCode::Handshake3 => -3,
            ControlCode::Teardown1 => -4,
            ControlCode::Teardown2 => -5,
            ControlCode::Unknown(value) => value,
        }
    }

    /// Encode as a complete code frame.
    ///
    /// Fails for `Unknown` values that would read back as a data frame.
    pub fn encode(self) -> Result<[u8; LENGTH_PREFIX_SIZE]> {
        let value = self.to_wire();
        if value > 0 {
            return Err(RpcError::Framing(format!(
                "code {value} is positive and would read as a data frame"
            )));
        }
        Ok(value.to_le_bytes())
    }
}

/// Decoded 4-byte prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Prefix {
    /// A data frame of this many payload bytes follows.
    Data(u32),
    /// A complete code frame.
    Code(ControlCode),
}

impl Prefix {
    /// Decode a prefix (little-endian i32).
    pub fn decode(buf: [u8; LENGTH_PREFIX_SIZE]) -> Self {
        let value = i32::from_le_bytes(buf);
        if value > 0 {
            Prefix::Data(value as u32)
        } else {
            Prefix::Code(ControlCode::from_wire(value))
        }
    }
}

/// Encode the length prefix of a data frame.
///
/// Empty payloads cannot be expressed (a zero prefix is a keep-alive).
pub fn encode_length(len: usize) -> Result<[u8; LENGTH_PREFIX_SIZE]> {
    if len == 0 {
        return Err(RpcError::Framing("data frame payload is empty".to_string()));
    }
    if len > ABSOLUTE_MAX_FRAME_SIZE as usize {
        return Err(RpcError::FrameTooLarge {
            size: u32::try_from(len).unwrap_or(u32::MAX),
            max: ABSOLUTE_MAX_FRAME_SIZE,
        });
    }
    Ok((len as i32).to_le_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_length_is_little_endian() {
        assert_eq!(encode_length(1).unwrap(), [1, 0, 0, 0]);
        assert_eq!(encode_length(0x0102_0304).unwrap(), [4, 3, 2, 1]);
    }

    #[test]
    fn test_zero_length_rejected() {
        assert!(encode_length(0).is_err());
    }

    #[test]
    fn test_codes_roundtrip() {
        for code in [
            ControlCode::KeepAlive,
            ControlCode::Handshake1,
            ControlCode::Handshake2,
            ControlCode::Handshake3,
            ControlCode::Teardown1,
            ControlCode::Teardown2,
            ControlCode::Unknown(-99),
        ] {
            let bytes = code.encode().unwrap();
            assert_eq!(Prefix::decode(bytes), Prefix::Code(code));
        }
    }

    #[test]
    fn test_code_wire_values() {
        assert_eq!(ControlCode::KeepAlive.encode().unwrap(), [0, 0, 0, 0]);
        assert_eq!(ControlCode::Handshake1.encode().unwrap(), (-1i32).to_le_bytes());
        assert_eq!(ControlCode::Teardown2.to_wire(), -5);
    }

    #[test]
    fn test_positive_unknown_code_rejected() {
        assert!(ControlCode::Unknown(5).encode().is_err());
    }

    #[test]
    fn test_prefix_sign_branch() {
        assert_eq!(Prefix::decode(42i32.to_le_bytes()), Prefix::Data(42));
        assert_eq!(
            Prefix::decode(i32::MIN.to_le_bytes()),
            Prefix::Code(ControlCode::Unknown(i32::MIN))
        );
    }
}
