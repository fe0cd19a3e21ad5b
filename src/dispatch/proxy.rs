//! Caller side: typed access to a remote endpoint.

use std::fmt;
use std::marker::PhantomData;
use std::time::Duration;

use serde::de::{DeserializeOwned, IgnoredAny};
use tokio_util::sync::CancellationToken;

use crate::address::Address;
use crate::codec::{Codec, DefaultCodec};
use crate::connection::{decode_outcome, Connection};
use crate::error::Result;
use crate::events::{LostNotification, LostToken, SubscriptionToken};
use crate::message::{EventRaisedMessage, IntoArguments, Message, RemoteCallRequest};

/// A stub bound to one remote endpoint over one connection.
///
/// Generated or hand-written stubs implement this and forward their methods to
/// a [`RemoteProxy`].
pub trait Proxy: Sized {
    fn bind(connection: Connection, address: Address) -> Self;
}

/// Per-call options.
#[derive(Debug, Clone)]
pub struct CallOptions {
    /// Firing this forwards a cancellation to the peer.
    pub cancellation: CancellationToken,
    /// Deadline relative to now, carried to the peer.
    pub timeout: Option<Duration>,
    /// Whether local cancellation is forwarded at all.
    pub cancellable: bool,
}

impl Default for CallOptions {
    fn default() -> Self {
        Self {
            cancellation: CancellationToken::new(),
            timeout: None,
            cancellable: true,
        }
    }
}

impl CallOptions {
    pub fn cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn cancellable(mut self, cancellable: bool) -> Self {
        self.cancellable = cancellable;
        self
    }
}

/// Untyped-by-method proxy: arguments and results are typed per call.
///
/// # Example
///
/// ```no_run
/// use proclink::dispatch::{Proxy, RemoteProxy};
/// use proclink::{Address, Connection};
///
/// # async fn example(connection: Connection) -> proclink::Result<()> {
/// let calc: RemoteProxy = RemoteProxy::bind(connection, Address::parse("/worker/calc")?);
/// let sum: i64 = calc.call("Add", (2i64, 3i64)).await?;
/// assert_eq!(sum, 5);
/// # Ok(())
/// # }
/// ```
pub struct RemoteProxy<C: Codec = DefaultCodec> {
    connection: Connection,
    address: Address,
    _codec: PhantomData<fn() -> C>,
}

impl<C: Codec> Clone for RemoteProxy<C> {
    fn clone(&self) -> Self {
        Self {
            connection: self.connection.clone(),
            address: self.address.clone(),
            _codec: PhantomData,
        }
    }
}

impl<C: Codec> fmt::Debug for RemoteProxy<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteProxy")
            .field("address", &self.address)
            .field("connection", &self.connection.id())
            .finish()
    }
}

impl<C: Codec> Proxy for RemoteProxy<C> {
    fn bind(connection: Connection, address: Address) -> Self {
        Self {
            connection,
            address,
            _codec: PhantomData,
        }
    }
}

impl<C: Codec> RemoteProxy<C> {
    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    /// Call `method` and decode its result.
    pub async fn call<A, R>(&self, method: &str, args: A) -> Result<R>
    where
        A: IntoArguments,
        R: DeserializeOwned,
    {
        self.call_with(method, args, CallOptions::default()).await
    }

    /// Call `method` and discard its result.
    pub async fn call_void<A: IntoArguments>(&self, method: &str, args: A) -> Result<()> {
        self.call_with::<A, IgnoredAny>(method, args, CallOptions::default())
            .await
            .map(|_| ())
    }

    /// Call `method` with explicit cancellation, deadline and cancellability.
    pub async fn call_with<A, R>(&self, method: &str, args: A, options: CallOptions) -> Result<R>
    where
        A: IntoArguments,
        R: DeserializeOwned,
    {
        let arguments = args.into_arguments::<C>()?;
        let mut request = RemoteCallRequest::new(self.address.clone(), method, arguments)
            .cancellable(options.cancellable);
        if let Some(timeout) = options.timeout {
            request = request.with_timeout(timeout);
        }

        let reply = self
            .connection
            .send_request(Message::CallRequest(request), options.cancellation)
            .await?;
        decode_outcome::<C, R>(reply)
    }

    /// Subscribe to `event`, decoding its payload as `T`.
    ///
    /// Only the first local handler for an event registers it with the peer.
    pub async fn subscribe<T, F>(&self, event: &str, handler: F) -> Result<SubscriptionToken>
    where
        T: DeserializeOwned,
        F: Fn(T) + Send + Sync + 'static,
    {
        let mut batch = self.connection.subscriptions().batch();
        let token = batch.add(
            self.address.clone(),
            event,
            move |message: &EventRaisedMessage| match message.decode_args::<C, T>() {
                Ok(args) => handler(args),
                Err(e) => tracing::warn!(
                    endpoint = %message.endpoint,
                    event = %message.event_name,
                    error = %e,
                    "Undecodable event payload"
                ),
            },
        );
        self.connection.change_subscriptions(batch).await?;
        Ok(token)
    }

    /// Remove a handler added by [`subscribe`](Self::subscribe).
    pub async fn unsubscribe(&self, event: &str, token: SubscriptionToken) -> Result<()> {
        let mut batch = self.connection.subscriptions().batch();
        batch.remove(self.address.clone(), event, token);
        self.connection.change_subscriptions(batch).await
    }

    /// Register a callback for loss of this endpoint (or its process).
    pub fn on_lost<F>(&self, callback: F) -> LostToken
    where
        F: Fn(&LostNotification) + Send + Sync + 'static,
    {
        self.connection
            .subscriptions()
            .subscribe_endpoint_lost(&self.address, callback)
    }
}
