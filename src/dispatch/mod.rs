//! Call dispatch on both sides of a connection.
//!
//! - Caller side: [`RemoteProxy`] builds requests for one remote endpoint and
//!   decodes outcomes; [`Proxy`] is the binding contract for stubs.
//! - Receiver side: [`EndpointHost`] implements
//!   [`RequestHandler`](crate::connection::RequestHandler), runs each call of
//!   an [`Endpoint`] on its own task with a [`CallContext`], and answers with
//!   a success, failure or cancelled response.

mod context;
mod endpoint;
mod host;
mod proxy;

pub use context::CallContext;
pub use endpoint::{BoxFuture, Endpoint, MethodHandler};
pub use host::EndpointHost;
pub use proxy::{CallOptions, Proxy, RemoteProxy};
