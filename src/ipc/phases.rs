//! Handshake and teardown phase machine shared by a connector and the
//! connection it produces.

use std::time::Duration;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::connection::Connection;
use crate::error::Result;
use crate::protocol::ControlCode;
use crate::writer::OutboundFrame;

/// Observable phase of an IPC connector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectorState {
    Created,
    Handshake1,
    Handshake2,
    Handshake3,
    Ready,
    Teardown1,
    Teardown2,
    Closed,
}

#[derive(Debug)]
pub(crate) struct Phases {
    state: Mutex<ConnectorState>,
    teardown_ack: CancellationToken,
    teardown_timeout: Duration,
}

impl Phases {
    pub(crate) fn new(teardown_timeout: Duration) -> Self {
        Self {
            state: Mutex::new(ConnectorState::Created),
            teardown_ack: CancellationToken::new(),
            teardown_timeout,
        }
    }

    pub(crate) fn state(&self) -> ConnectorState {
        *self.state.lock()
    }

    pub(crate) fn set(&self, state: ConnectorState) {
        let mut current = self.state.lock();
        if *current != state {
            tracing::debug!(from = ?*current, to = ?state, "Connector state");
            *current = state;
        }
    }

    pub(crate) fn is_tearing_down(&self) -> bool {
        matches!(
            self.state(),
            ConnectorState::Teardown1 | ConnectorState::Teardown2
        )
    }

    pub(crate) fn closed(&self) {
        self.set(ConnectorState::Closed);
        self.teardown_ack.cancel();
    }

    /// Teardown code received by the read loop.
    pub(crate) fn on_code(&self, connection: &Connection, code: ControlCode) {
        match code {
            ControlCode::Teardown1 => {
                let we_started = {
                    let mut state = self.state.lock();
                    let we_started = *state == ConnectorState::Teardown1;
                    if !we_started {
                        *state = ConnectorState::Teardown2;
                    }
                    we_started
                };
                tracing::debug!(connection_id = connection.id(), we_started, "Peer requested teardown");

                let connection = connection.clone();
                if we_started {
                    // Both sides sent T1: theirs acknowledges ours, ours still
                    // gets a T2.
                    self.teardown_ack.cancel();
                    tokio::spawn(async move {
                        let _ = send_code(&connection, ControlCode::Teardown2).await;
                    });
                } else {
                    tokio::spawn(async move {
                        if let Err(e) = send_code(&connection, ControlCode::Teardown2).await {
                            tracing::debug!(error = %e, "Teardown acknowledgement not sent");
                        }
                        connection.close().await;
                    });
                }
            }
            ControlCode::Teardown2 => self.teardown_ack.cancel(),
            other => tracing::warn!(code = ?other, "Unexpected code in teardown handling"),
        }
    }

    /// Send T1, wait for T2 (bounded), then close.
    pub(crate) async fn teardown(&self, connection: &Connection) -> Result<()> {
        let begin = {
            let mut state = self.state.lock();
            let begin = *state == ConnectorState::Ready;
            if begin {
                *state = ConnectorState::Teardown1;
            }
            begin
        };
        if !begin {
            connection.close().await;
            return Ok(());
        }

        if let Err(e) = connection
            .writer()
            .send_and_flush(OutboundFrame::code(ControlCode::Teardown1)?)
            .await
        {
            connection.close().await;
            return Err(e);
        }

        if tokio::time::timeout(self.teardown_timeout, self.teardown_ack.cancelled())
            .await
            .is_err()
        {
            tracing::warn!(
                connection_id = connection.id(),
                timeout = ?self.teardown_timeout,
                "No teardown acknowledgement, closing anyway"
            );
        }
        connection.close().await;
        Ok(())
    }
}

async fn send_code(connection: &Connection, code: ControlCode) -> Result<()> {
    connection.writer().send(OutboundFrame::code(code)?).await
}
