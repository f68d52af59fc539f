//! Serde-typed handler adapters.
//!
//! Core handlers speak [`Value`]. These adapters let handler authors work
//! with their own types instead: the payload is deserialized before the
//! handler runs and the result is serialized afterwards.
//!
//! A payload that does not deserialize fails with an `INVALID_ARGUMENT`
//! application error, so callers see a 400-style error envelope rather than
//! an internal one.
//!
//! ```rust,ignore
//! #[derive(Deserialize)]
//! struct AddRequest { a: i64, b: i64 }
//!
//! #[derive(Serialize)]
//! struct AddResponse { result: i64 }
//!
//! router.register_procedure(
//!     "math.add",
//!     typed::procedure(|req: AddRequest, _ctx| async move {
//!         Ok(AddResponse { result: req.a + req.b })
//!     }),
//!     HandlerMeta::default(),
//! )?;
//! ```

use std::future::Future;
use std::marker::PhantomData;

use futures::stream::BoxStream;
use futures::{Stream, StreamExt};
use serde::Serialize;
use serde::de::DeserializeOwned;
use switchyard_core::{
    Ack, BoxFuture, Context, EventHandler, ProcedureHandler, RpcError, RpcResult, StreamHandler,
    Value,
};

fn encode<T: Serialize>(value: T) -> RpcResult<Value> {
    serde_json::to_value(value).map_err(|err| RpcError::internal(format!("failed to encode result: {err}")))
}

// ============================================================================
// Procedure
// ============================================================================

pub struct TypedProcedure<F, Req, Res> {
    f: F,
    _marker: PhantomData<fn(Req) -> Res>,
}

/// Adapts a typed async function into a [`ProcedureHandler`].
pub fn procedure<F, Fut, Req, Res>(f: F) -> TypedProcedure<F, Req, Res>
where
    F: Fn(Req, Context) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = RpcResult<Res>> + Send + 'static,
    Req: DeserializeOwned + Send + 'static,
    Res: Serialize + Send + 'static,
{
    TypedProcedure {
        f,
        _marker: PhantomData,
    }
}

impl<F, Fut, Req, Res> ProcedureHandler for TypedProcedure<F, Req, Res>
where
    F: Fn(Req, Context) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = RpcResult<Res>> + Send + 'static,
    Req: DeserializeOwned + Send + 'static,
    Res: Serialize + Send + 'static,
{
    fn call(&self, payload: Value, ctx: Context) -> BoxFuture<'static, RpcResult<Value>> {
        let request = match serde_json::from_value::<Req>(payload) {
            Ok(request) => request,
            Err(err) => return Box::pin(futures::future::ready(Err::<Value, _>(RpcError::from(err)))),
        };
        let fut = (self.f)(request, ctx);
        Box::pin(async move { encode(fut.await?) })
    }
}

// ============================================================================
// Stream
// ============================================================================

pub struct TypedStream<F, Req, Item> {
    f: F,
    _marker: PhantomData<fn(Req) -> Item>,
}

/// Adapts a function returning a typed sequence into a [`StreamHandler`].
///
/// An item that fails to encode terminates the stream with an internal error.
pub fn stream<F, S, Req, Item>(f: F) -> TypedStream<F, Req, Item>
where
    F: Fn(Req, Context) -> S + Send + Sync + 'static,
    S: Stream<Item = RpcResult<Item>> + Send + 'static,
    Req: DeserializeOwned + Send + 'static,
    Item: Serialize + Send + 'static,
{
    TypedStream {
        f,
        _marker: PhantomData,
    }
}

impl<F, S, Req, Item> StreamHandler for TypedStream<F, Req, Item>
where
    F: Fn(Req, Context) -> S + Send + Sync + 'static,
    S: Stream<Item = RpcResult<Item>> + Send + 'static,
    Req: DeserializeOwned + Send + 'static,
    Item: Serialize + Send + 'static,
{
    fn open(&self, payload: Value, ctx: Context) -> BoxStream<'static, RpcResult<Value>> {
        match serde_json::from_value::<Req>(payload) {
            Ok(request) => (self.f)(request, ctx)
                .map(|item| item.and_then(encode))
                .boxed(),
            Err(err) => futures::stream::once(futures::future::ready(Err::<Value, _>(RpcError::from(err)))).boxed(),
        }
    }
}

// ============================================================================
// Event
// ============================================================================

pub struct TypedEvent<F, Req> {
    f: F,
    _marker: PhantomData<fn(Req)>,
}

/// Adapts a typed async event function into an [`EventHandler`].
pub fn event<F, Fut, Req>(f: F) -> TypedEvent<F, Req>
where
    F: Fn(Req, Context, Ack) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = RpcResult<()>> + Send + 'static,
    Req: DeserializeOwned + Send + 'static,
{
    TypedEvent {
        f,
        _marker: PhantomData,
    }
}

impl<F, Fut, Req> EventHandler for TypedEvent<F, Req>
where
    F: Fn(Req, Context, Ack) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = RpcResult<()>> + Send + 'static,
    Req: DeserializeOwned + Send + 'static,
{
    fn call(&self, payload: Value, ctx: Context, ack: Ack) -> BoxFuture<'static, RpcResult<()>> {
        match serde_json::from_value::<Req>(payload) {
            Ok(request) => Box::pin((self.f)(request, ctx, ack)),
            Err(err) => Box::pin(futures::future::ready(Err::<(), _>(RpcError::from(err)))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;
    use switchyard_core::error::INVALID_ARGUMENT;
    use tokio_test::{assert_err, assert_ok};

    #[derive(Deserialize)]
    struct Add {
        a: i64,
        b: i64,
    }

    #[derive(Serialize)]
    struct Sum {
        result: i64,
    }

    #[tokio::test]
    async fn test_typed_procedure() {
        let handler = procedure(|req: Add, _ctx: Context| async move {
            Ok::<_, RpcError>(Sum { result: req.a + req.b })
        });

        let out = assert_ok!(handler.call(json!({"a": 5, "b": 3}), Context::new()).await);
        assert_eq!(out, json!({"result": 8}));

        let err = assert_err!(handler.call(json!({"a": "five"}), Context::new()).await);
        assert_eq!(err.to_payload().code, INVALID_ARGUMENT);
        assert_eq!(err.to_payload().status, 400);
    }

    #[tokio::test]
    async fn test_typed_stream() {
        #[derive(Deserialize)]
        struct Count {
            count: u32,
        }

        let handler = stream(|req: Count, _ctx: Context| {
            futures::stream::iter((0..req.count).map(Ok::<_, RpcError>))
        });
        let values: Vec<_> = handler
            .open(json!({"count": 3}), Context::new())
            .map(|item| item.unwrap())
            .collect()
            .await;
        assert_eq!(values, vec![json!(0), json!(1), json!(2)]);

        let mut bad = handler.open(json!(null), Context::new());
        assert!(bad.next().await.unwrap().is_err());
        assert!(bad.next().await.is_none());
    }

    #[tokio::test]
    async fn test_typed_event() {
        let handler = event(|req: Add, _ctx: Context, ack: Ack| async move {
            if req.a + req.b > 0 {
                ack.ack();
            }
            Ok::<_, RpcError>(())
        });
        let ack = Ack::new(1);
        assert_ok!(handler.call(json!({"a": 1, "b": 1}), Context::new(), ack.clone()).await);
        assert!(ack.is_acked());
    }
}
