//! # proclink
//!
//! Interprocess RPC protocol core: framed, multiplexed calls, cancellation,
//! event subscriptions and endpoint-loss notification between cooperating
//! processes over any byte stream.
//!
//! ## Architecture
//!
//! - **Wire** ([`protocol`]): length-prefixed frames; non-positive prefixes
//!   carry control codes (keep-alive, handshake, teardown)
//! - **Envelope** ([`message`]): every data frame is a [`WrappedMessage`]
//!   encoded with the [`DefaultCodec`]
//! - **Connection** ([`connection`]): one reader task, one writer task, a
//!   table of pending calls, a subscription tree
//! - **Dispatch** ([`dispatch`]): typed proxies on the caller, hosted
//!   endpoints on the receiver
//! - **IPC** ([`ipc`]): three-way handshake, two-phase teardown and a
//!   per-process router multiplexing clients onto one child connection
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use proclink::dispatch::{Endpoint, EndpointHost, Proxy, RemoteProxy};
//! use proclink::{Address, Connection};
//!
//! # async fn example() -> proclink::Result<()> {
//! let (a, b) = tokio::io::duplex(64 * 1024);
//! let (a_read, a_write) = tokio::io::split(a);
//! let (b_read, b_write) = tokio::io::split(b);
//!
//! let host = Arc::new(EndpointHost::new());
//! host.add_endpoint(
//!     Endpoint::new("calc").method("Add", |(x, y): (i64, i64), _ctx| async move { Ok(x + y) }),
//! );
//! let _server = Connection::builder().handler(host).spawn(b_read, b_write);
//! let client = Connection::builder().spawn(a_read, a_write);
//!
//! let calc: RemoteProxy = RemoteProxy::bind(client, Address::parse("/worker/calc")?);
//! let sum: i64 = calc.call("Add", (2i64, 3i64)).await?;
//! assert_eq!(sum, 5);
//! # Ok(())
//! # }
//! ```

pub mod address;
pub mod codec;
pub mod connection;
pub mod control;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod ipc;
pub mod message;
pub mod protocol;
pub mod transport;
pub mod writer;

mod backpressure;

pub use address::Address;
pub use codec::{Codec, DefaultCodec};
pub use connection::{Connection, ConnectionBuilder, ConnectionConfig};
pub use error::{RemoteFault, Result, RpcError};
pub use message::{Message, WrappedMessage};
