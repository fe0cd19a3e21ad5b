//! Connection preamble.
//!
//! ```text
//! client                                 server
//!   │ ── "PLNK" ─────────────────────────► │  magic, checked before anything else
//!   │ ── [len][JSON ClientInfo] ─────────► │
//!   │ ◄───────── [len][JSON PreambleResponse]
//! ```
//!
//! Reads here are exact: nothing past the preamble is consumed, so the same
//! stream can be handed to the framed connection afterwards.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Result, RpcError};
use crate::protocol::{encode_length, Prefix, LENGTH_PREFIX_SIZE};

/// Magic bytes opening every connection.
pub const MAGIC: &[u8; 4] = b"PLNK";

/// Version spoken by this crate.
pub const PROTOCOL_VERSION: u32 = 1;

/// Largest accepted preamble JSON document.
pub const MAX_PREAMBLE_SIZE: u32 = 64 * 1024;

/// Identifies the connecting side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientInfo {
    pub protocol_version: u32,
    pub client_name: String,
    pub process_id: u32,
}

impl ClientInfo {
    /// Info for the current process.
    pub fn new(client_name: impl Into<String>) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            client_name: client_name.into(),
            process_id: std::process::id(),
        }
    }
}

/// Server's verdict on a preamble.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreambleResponse {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Send the magic and `info`, then wait for the server's verdict.
pub async fn client_handshake<R, W>(reader: &mut R, writer: &mut W, info: &ClientInfo) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    writer.write_all(MAGIC).await?;
    write_json(writer, info).await?;

    let response: PreambleResponse = read_json(reader).await?;
    if response.ok {
        Ok(())
    } else {
        Err(RpcError::Handshake(
            response
                .error
                .unwrap_or_else(|| "preamble rejected".to_string()),
        ))
    }
}

/// Check the magic, read the client's info and answer it.
///
/// Foreign traffic is rejected without a response. A version mismatch gets a
/// negative response before the error is returned.
pub async fn server_handshake<R, W>(reader: &mut R, writer: &mut W) -> Result<ClientInfo>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut magic = [0u8; 4];
    reader.read_exact(&mut magic).await.map_err(|e| {
        RpcError::Handshake(format!("stream ended before the preamble: {e}"))
    })?;
    if &magic != MAGIC {
        return Err(classify_foreign(&magic));
    }

    let info: ClientInfo = read_json(reader).await?;
    if info.protocol_version != PROTOCOL_VERSION {
        let reason = format!(
            "unsupported protocol version {} (expected {PROTOCOL_VERSION})",
            info.protocol_version
        );
        let refusal = PreambleResponse {
            ok: false,
            error: Some(reason.clone()),
        };
        let _ = write_json(writer, &refusal).await;
        return Err(RpcError::Handshake(reason));
    }

    write_json(writer, &PreambleResponse { ok: true, error: None }).await?;
    tracing::debug!(
        client = %info.client_name,
        pid = info.process_id,
        "Preamble accepted"
    );
    Ok(info)
}

fn classify_foreign(magic: &[u8; 4]) -> RpcError {
    if magic[0] == 0x16 && magic[1] == 0x03 {
        RpcError::Handshake("TLS ClientHello received on a plaintext endpoint".to_string())
    } else {
        RpcError::Handshake(format!("foreign protocol preamble {magic:02x?}"))
    }
}

async fn write_json<W, T>(writer: &mut W, value: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let json = serde_json::to_vec(value)?;
    writer.write_all(&encode_length(json.len())?).await?;
    writer.write_all(&json).await?;
    writer.flush().await?;
    Ok(())
}

async fn read_json<R, T>(reader: &mut R) -> Result<T>
where
    R: AsyncRead + Unpin,
    T: for<'de> Deserialize<'de>,
{
    let mut prefix = [0u8; LENGTH_PREFIX_SIZE];
    reader.read_exact(&mut prefix).await?;
    let len = match Prefix::decode(prefix) {
        Prefix::Data(len) if len <= MAX_PREAMBLE_SIZE => len,
        Prefix::Data(len) => {
            return Err(RpcError::Handshake(format!(
                "preamble of {len} bytes exceeds {MAX_PREAMBLE_SIZE}"
            )))
        }
        Prefix::Code(code) => {
            return Err(RpcError::Handshake(format!(
                "expected a preamble frame, got {code:?}"
            )))
        }
    };

    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload).await?;
    serde_json::from_slice(&payload)
        .map_err(|e| RpcError::Handshake(format!("malformed preamble: {e}")))
}
