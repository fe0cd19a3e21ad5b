//! Three-phase handshake over a fresh pipe.
//!
//! ```text
//! Initiator (child)                 Responder (parent)
//!    │ ── H1 ───────────────────────► │
//!    │                                │ complete_initialization()
//!    │ ◄─────────────────────── H2 ── │
//!    │ complete_initialization()      │
//!    │ ── H3 ───────────────────────► │
//!  Ready                            Ready
//! ```
//!
//! The parent initializes first, so by the time the child runs its own
//! initialization the parent is known to be listening.
//!
//! Keep-alives may arrive at any point and are skipped. Anything else out of
//! order fails the handshake.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

use super::phases::{ConnectorState, Phases};
use crate::connection::{Connection, ConnectionBuilder};
use crate::error::{Result, RpcError};
use crate::protocol::{ControlCode, Frame, FrameReader};

/// Default bound on the whole handshake.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Default wait for the peer's teardown acknowledgement.
pub const DEFAULT_TEARDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Which side of the handshake this process plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Sends H1 and H3 (the spawned child).
    Initiator,
    /// Sends H2 (the parent that spawned the child).
    Responder,
}

/// Runs the handshake on a pipe and yields a [`Connection`].
///
/// # Example
///
/// ```no_run
/// use proclink::ipc::{IpcConnector, Role};
///
/// # async fn example(
/// #     reader: tokio::net::unix::OwnedReadHalf,
/// #     writer: tokio::net::unix::OwnedWriteHalf,
/// # ) -> proclink::Result<()> {
/// let connector = IpcConnector::new(Role::Initiator);
/// let connection = connector
///     .connect(reader, writer, || async {
///         // the parent has answered H1; register endpoints before H3
///         Ok(())
///     })
///     .await?;
/// connection.teardown().await?;
/// # Ok(())
/// # }
/// ```
pub struct IpcConnector {
    role: Role,
    handshake_timeout: Duration,
    builder: ConnectionBuilder,
    phases: Arc<Phases>,
}

impl fmt::Debug for IpcConnector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IpcConnector")
            .field("role", &self.role)
            .field("state", &self.state())
            .finish()
    }
}

impl IpcConnector {
    pub fn new(role: Role) -> Self {
        Self {
            role,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            builder: ConnectionBuilder::default(),
            phases: Arc::new(Phases::new(DEFAULT_TEARDOWN_TIMEOUT)),
        }
    }

    /// Bound on the whole handshake, including initialization.
    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Wait for the peer's T2 before closing anyway.
    pub fn teardown_timeout(mut self, timeout: Duration) -> Self {
        self.phases = Arc::new(Phases::new(timeout));
        self
    }

    /// Settings for the connection produced after the handshake.
    pub fn connection(mut self, builder: ConnectionBuilder) -> Self {
        self.builder = builder;
        self
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> ConnectorState {
        self.phases.state()
    }

    /// Run the handshake, calling `complete_initialization` exactly once at
    /// this side's point in the sequence, then start the connection.
    ///
    /// On failure the write half is shut down and the connector is `Closed`.
    pub async fn connect<R, W, F, Fut>(
        &self,
        reader: R,
        mut writer: W,
        complete_initialization: F,
    ) -> Result<Connection>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        if self.state() != ConnectorState::Created {
            return Err(RpcError::Handshake(format!(
                "connector already used (state {:?})",
                self.state()
            )));
        }

        let mut reader = FrameReader::new(reader, self.builder.max_frame_size());
        let handshake = self.run(&mut reader, &mut writer, complete_initialization);
        let outcome = match tokio::time::timeout(self.handshake_timeout, handshake).await {
            Ok(outcome) => outcome,
            Err(_) => Err(RpcError::Handshake(format!(
                "timed out after {:?} in state {:?}",
                self.handshake_timeout,
                self.state()
            ))),
        };

        if let Err(e) = outcome {
            tracing::warn!(role = ?self.role, state = ?self.state(), error = %e, "Handshake failed");
            self.phases.closed();
            let _ = writer.shutdown().await;
            return Err(e);
        }

        self.phases.set(ConnectorState::Ready);
        tracing::debug!(role = ?self.role, "Handshake complete");
        Ok(self
            .builder
            .clone()
            .spawn_framed(reader, writer, Some(self.phases.clone())))
    }

    async fn run<R, W, F, Fut>(
        &self,
        reader: &mut FrameReader<R>,
        writer: &mut W,
        complete_initialization: F,
    ) -> Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        match self.role {
            Role::Initiator => {
                send_code(writer, ControlCode::Handshake1).await?;
                self.phases.set(ConnectorState::Handshake1);
                expect(reader, ControlCode::Handshake2).await?;
                self.phases.set(ConnectorState::Handshake2);
                complete_initialization().await?;
                send_code(writer, ControlCode::Handshake3).await?;
                self.phases.set(ConnectorState::Handshake3);
            }
            Role::Responder => {
                expect(reader, ControlCode::Handshake1).await?;
                self.phases.set(ConnectorState::Handshake1);
                complete_initialization().await?;
                send_code(writer, ControlCode::Handshake2).await?;
                self.phases.set(ConnectorState::Handshake2);
                expect(reader, ControlCode::Handshake3).await?;
                self.phases.set(ConnectorState::Handshake3);
            }
        }
        Ok(())
    }
}

async fn send_code<W>(writer: &mut W, code: ControlCode) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let frame = code.encode()?;
    writer
        .write_all(&frame)
        .await
        .map_err(|e| RpcError::Handshake(format!("failed to send {code:?}: {e}")))?;
    writer
        .flush()
        .await
        .map_err(|e| RpcError::Handshake(format!("failed to send {code:?}: {e}")))
}

async fn expect<R>(reader: &mut FrameReader<R>, expected: ControlCode) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    loop {
        match reader.next_frame().await {
            Ok(Some(Frame::Code(ControlCode::KeepAlive))) => continue,
            Ok(Some(Frame::Code(code))) if code == expected => return Ok(()),
            Ok(Some(Frame::Code(code))) => {
                return Err(RpcError::Handshake(format!(
                    "expected {expected:?}, got {code:?}"
                )))
            }
            Ok(Some(Frame::Data(_))) => {
                return Err(RpcError::Handshake(format!(
                    "expected {expected:?}, got a data frame"
                )))
            }
            Ok(None) => {
                return Err(RpcError::Handshake(format!(
                    "stream closed while waiting for {expected:?}"
                )))
            }
            Err(e) => {
                return Err(RpcError::Handshake(format!(
                    "read failed while waiting for {expected:?}: {e}"
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn test_both_sides_reach_ready() {
        let (a, b) = duplex(1024);
        let (a_read, a_write) = tokio::io::split(a);
        let (b_read, b_write) = tokio::io::split(b);

        let initiator = IpcConnector::new(Role::Initiator);
        let responder = IpcConnector::new(Role::Responder);

        let (left, right) = tokio::join!(
            initiator.connect(a_read, a_write, || async { Ok(()) }),
            responder.connect(b_read, b_write, || async { Ok(()) }),
        );
        let left = left.unwrap();
        let right = right.unwrap();
        assert_eq!(initiator.state(), ConnectorState::Ready);
        assert_eq!(left.connector_state(), Some(ConnectorState::Ready));
        assert_eq!(right.connector_state(), Some(ConnectorState::Ready));
    }

    #[tokio::test]
    async fn test_unexpected_code_fails() {
        let (a, mut b) = duplex(1024);
        let (a_read, a_write) = tokio::io::split(a);
        b.write_all(&ControlCode::Handshake3.encode().unwrap())
            .await
            .unwrap();

        let responder = IpcConnector::new(Role::Responder);
        let err = responder
            .connect(a_read, a_write, || async { Ok(()) })
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::Handshake(_)));
        assert_eq!(responder.state(), ConnectorState::Closed);
    }

    #[tokio::test]
    async fn test_connector_is_single_use() {
        let (a, b) = duplex(1024);
        drop(b);
        let (a_read, a_write) = tokio::io::split(a);
        let connector = IpcConnector::new(Role::Responder);
        assert!(connector.connect(a_read, a_write, || async { Ok(()) }).await.is_err());

        let (c, _d) = duplex(1024);
        let (c_read, c_write) = tokio::io::split(c);
        let err = connector
            .connect(c_read, c_write, || async { Ok(()) })
            .await
            .unwrap_err();
        assert!(err.to_string().contains("already used"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_peer_times_out() {
        let (a, _b) = duplex(1024);
        let (a_read, a_write) = tokio::io::split(a);
        let connector =
            IpcConnector::new(Role::Initiator).handshake_timeout(Duration::from_millis(50));
        let err = connector
            .connect(a_read, a_write, || async { Ok(()) })
            .await
            .unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }
}
