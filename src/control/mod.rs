//! Control plane: the plaintext preamble exchanged before framed traffic.
//!
//! The preamble lets a listener reject foreign or mismatched clients early,
//! and tell a TLS client hitting a plaintext endpoint apart from garbage.
//!
//! # Example
//!
//! ```no_run
//! use proclink::control::{client_handshake, ClientInfo};
//! use proclink::Connection;
//!
//! # async fn example(stream: tokio::net::UnixStream) -> proclink::Result<()> {
//! let (mut reader, mut writer) = stream.into_split();
//! client_handshake(&mut reader, &mut writer, &ClientInfo::new("dashboard")).await?;
//! let connection = Connection::builder().spawn(reader, writer);
//! # Ok(())
//! # }
//! ```

mod preamble;

pub use preamble::{
    client_handshake, server_handshake, ClientInfo, PreambleResponse, MAGIC, MAX_PREAMBLE_SIZE,
    PROTOCOL_VERSION,
};
