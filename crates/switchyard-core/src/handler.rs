//! Handler traits for the three handler kinds.
//!
//! Handlers are untyped at registration: they take and produce
//! [`serde_json::Value`]. Payload typing is the adapter's (or a validator's)
//! responsibility; the framework crate offers serde-based typed adapters on
//! top of these traits.
//!
//! Each trait has a blanket implementation for plain async closures, in the
//! spirit of axum-style handlers:
//!
//! ```rust,ignore
//! router.register_procedure("echo", |payload: Value, _ctx: Context| async move {
//!     Ok(payload)
//! }, HandlerMeta::default())?;
//! ```

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::stream::BoxStream;
use futures::{Stream, StreamExt};
use serde_json::Value;

use crate::context::Context;
use crate::error::RpcResult;

/// A type alias for a boxed, pinned future that is `Send`.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

// ============================================================================
// Procedure
// ============================================================================

/// A unary handler: payload in, payload out.
pub trait ProcedureHandler: Send + Sync + 'static {
    fn call(&self, payload: Value, ctx: Context) -> BoxFuture<'static, RpcResult<Value>>;
}

impl<F, Fut> ProcedureHandler for F
where
    F: Fn(Value, Context) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = RpcResult<Value>> + Send + 'static,
{
    fn call(&self, payload: Value, ctx: Context) -> BoxFuture<'static, RpcResult<Value>> {
        Box::pin((self)(payload, ctx))
    }
}

// ============================================================================
// Stream
// ============================================================================

/// A streaming handler: payload in, lazy sequence of values out.
///
/// The returned sequence may be finite or infinite. It is polled by a pump
/// task owned by the router and dropped as soon as the consumer cancels, so
/// producers that only suspend inside the sequence are cancelled for free.
pub trait StreamHandler: Send + Sync + 'static {
    fn open(&self, payload: Value, ctx: Context) -> BoxStream<'static, RpcResult<Value>>;
}

impl<F, S> StreamHandler for F
where
    F: Fn(Value, Context) -> S + Send + Sync + 'static,
    S: Stream<Item = RpcResult<Value>> + Send + 'static,
{
    fn open(&self, payload: Value, ctx: Context) -> BoxStream<'static, RpcResult<Value>> {
        (self)(payload, ctx).boxed()
    }
}

// ============================================================================
// Event
// ============================================================================

/// An event handler: payload in, no reply, explicit acknowledgement.
pub trait EventHandler: Send + Sync + 'static {
    fn call(&self, payload: Value, ctx: Context, ack: Ack) -> BoxFuture<'static, RpcResult<()>>;
}

impl<F, Fut> EventHandler for F
where
    F: Fn(Value, Context, Ack) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = RpcResult<()>> + Send + 'static,
{
    fn call(&self, payload: Value, ctx: Context, ack: Ack) -> BoxFuture<'static, RpcResult<()>> {
        Box::pin((self)(payload, ctx, ack))
    }
}

/// Acknowledgement handle for a single delivery attempt.
///
/// Calling [`ack`](Self::ack) signals that this attempt succeeded. Calling it
/// again is harmless. Clones share the same flag.
#[derive(Debug, Clone)]
pub struct Ack {
    attempt: u32,
    acked: Arc<AtomicBool>,
}

impl Ack {
    /// Creates an unacknowledged handle for the given (1-based) attempt.
    pub fn new(attempt: u32) -> Self {
        Self {
            attempt,
            acked: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Acknowledges the attempt.
    pub fn ack(&self) {
        self.acked.store(true, Ordering::SeqCst);
    }

    /// Returns `true` once acknowledged.
    pub fn is_acked(&self) -> bool {
        self.acked.load(Ordering::SeqCst)
    }

    /// The 1-based attempt number.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

pub type BoxedProcedureHandler = Arc<dyn ProcedureHandler>;
pub type BoxedStreamHandler = Arc<dyn StreamHandler>;
pub type BoxedEventHandler = Arc<dyn EventHandler>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RpcError;
    use serde_json::json;

    #[tokio::test]
    async fn test_closure_procedure() {
        let handler: BoxedProcedureHandler = Arc::new(|payload: Value, _ctx: Context| async move {
            Ok::<_, RpcError>(json!({"echo": payload}))
        });
        let out = handler.call(json!(1), Context::new()).await.unwrap();
        assert_eq!(out, json!({"echo": 1}));
    }

    #[tokio::test]
    async fn test_closure_stream() {
        let handler: BoxedStreamHandler = Arc::new(|_payload: Value, _ctx: Context| {
            futures::stream::iter(vec![Ok::<_, RpcError>(json!(1)), Ok(json!(2))])
        });
        let values: Vec<_> = handler.open(Value::Null, Context::new()).collect().await;
        assert_eq!(values.len(), 2);
    }

    #[tokio::test]
    async fn test_ack_shared_between_clones() {
        let handler: BoxedEventHandler =
            Arc::new(|_payload: Value, _ctx: Context, ack: Ack| async move {
                ack.ack();
                Ok::<_, RpcError>(())
            });
        let ack = Ack::new(1);
        handler.call(Value::Null, Context::new(), ack.clone()).await.unwrap();
        assert!(ack.is_acked());
        assert_eq!(ack.attempt(), 1);
    }
}
