//! Local-process connections: handshake, teardown and parent-side routing.

mod handshake;
mod phases;
mod router;

pub use handshake::{IpcConnector, Role, DEFAULT_HANDSHAKE_TIMEOUT, DEFAULT_TEARDOWN_TIMEOUT};
pub use phases::ConnectorState;
pub use router::ProcessRouter;

pub(crate) use phases::Phases;
