//! Endpoint definitions: a named set of typed methods.
//!
//! # Example
//!
//! ```
//! use proclink::dispatch::{CallContext, Endpoint};
//!
//! let calc = Endpoint::new("calc")
//!     .method("Add", |(a, b): (i64, i64), _ctx: CallContext| async move { Ok(a + b) })
//!     .method("Ping", |(): (), _ctx: CallContext| async move { Ok(()) });
//!
//! assert!(calc.has_method("Add"));
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;

use serde::Serialize;

use super::CallContext;
use crate::codec::{Codec, DefaultCodec};
use crate::error::Result;
use crate::message::{Arguments, FromArguments};

/// Boxed future returned by erased methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A method with its argument decoding and result encoding erased.
pub trait MethodHandler: Send + Sync + 'static {
    /// Decode `args`, run the method and encode its result.
    fn call(&self, args: &Arguments, ctx: CallContext) -> BoxFuture<'static, Result<Vec<u8>>>;
}

/// Adapts a typed async function to [`MethodHandler`].
struct TypedMethod<C, F, A, R, Fut> {
    handler: F,
    _phantom: PhantomData<fn(A) -> (C, R, Fut)>,
}

impl<C, F, A, R, Fut> MethodHandler for TypedMethod<C, F, A, R, Fut>
where
    C: Codec,
    F: Fn(A, CallContext) -> Fut + Send + Sync + 'static,
    A: FromArguments + Send + 'static,
    R: Serialize + Send + 'static,
    Fut: Future<Output = Result<R>> + Send + 'static,
{
    fn call(&self, args: &Arguments, ctx: CallContext) -> BoxFuture<'static, Result<Vec<u8>>> {
        let parsed = match A::from_arguments::<C>(args) {
            Ok(parsed) => parsed,
            Err(e) => return Box::pin(async move { Err(e) }),
        };

        let fut = (self.handler)(parsed, ctx);
        Box::pin(async move {
            let value = fut.await?;
            C::encode(&value)
        })
    }
}

/// Erased endpoint, as stored by a host.
pub(crate) trait Dispatch: Send + Sync + 'static {
    fn id(&self) -> &str;
    fn method(&self, name: &str) -> Option<&dyn MethodHandler>;
}

/// A named group of methods served by an [`EndpointHost`](super::EndpointHost).
///
/// `C` encodes arguments and results; callers must use the same codec.
pub struct Endpoint<C: Codec = DefaultCodec> {
    id: String,
    methods: HashMap<String, Box<dyn MethodHandler>>,
    _codec: PhantomData<fn() -> C>,
}

impl Endpoint<DefaultCodec> {
    /// Endpoint using the default codec.
    pub fn new(id: impl Into<String>) -> Self {
        Self::with_codec(id)
    }
}

impl<C: Codec> Endpoint<C> {
    /// Endpoint using codec `C`.
    pub fn with_codec(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            methods: HashMap::new(),
            _codec: PhantomData,
        }
    }

    /// Add a method. A later method with the same name replaces the earlier.
    pub fn method<F, A, R, Fut>(mut self, name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(A, CallContext) -> Fut + Send + Sync + 'static,
        A: FromArguments + Send + 'static,
        R: Serialize + Send + 'static,
        Fut: Future<Output = Result<R>> + Send + 'static,
    {
        let typed: TypedMethod<C, F, A, R, Fut> = TypedMethod {
            handler,
            _phantom: PhantomData,
        };
        self.methods.insert(name.into(), Box::new(typed));
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn has_method(&self, name: &str) -> bool {
        self.methods.contains_key(name)
    }

    /// Method names, sorted.
    pub fn method_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.methods.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl<C: Codec> Dispatch for Endpoint<C> {
    fn id(&self) -> &str {
        &self.id
    }

    fn method(&self, name: &str) -> Option<&dyn MethodHandler> {
        self.methods.get(name).map(|m| m.as_ref())
    }
}
