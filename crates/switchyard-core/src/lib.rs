//! # Switchyard Core
//!
//! The protocol-agnostic dispatch core of the Switchyard RPC runtime.
//!
//! Handlers are registered once against logical names and become reachable
//! over any wire protocol through adapters that only speak this crate's
//! public contracts: [`Envelope`], [`Context`], the [`Router`] and the
//! [`Interceptor`] chain.
//!
//! ## Building Blocks
//!
//! - **Envelope**: immutable message with kebab-case wire type names ([`Envelope`], [`EnvelopeType`])
//! - **Context**: correlation, tracing, auth, cancellation and deadline ([`Context`])
//! - **Registry**: lock-free handler lookup ([`Registry`], [`HandlerEntry`])
//! - **Streams**: backpressured, cancellable value channels ([`Stream`], [`StreamSet`])
//! - **Interceptors**: onion-style middleware ([`Interceptor`], [`Next`])
//! - **Delivery**: best-effort / at-least-once / at-most-once events ([`DeliveryEngine`])
//!
//! ## Data Flow
//!
//! ```text
//! ┌─────────┐  Envelope  ┌────────┐     ┌──────────────┐     ┌──────────┐
//! │ Adapter │───────────▶│ Router │────▶│ Interceptors │────▶│ Registry │
//! └─────────┘            └────────┘     └──────────────┘     └────┬─────┘
//!      ▲                                                          │
//!      │   response / error envelope, stream handle, accepted     ▼
//!      └──────────────────────────────────────────────────── handler / DeliveryEngine
//! ```
//!
//! ## Example
//!
//! ```rust,ignore
//! use switchyard_core::{Context, Envelope, HandlerMeta, Router, RpcError};
//! use serde_json::{Value, json};
//!
//! #[tokio::main]
//! async fn main() {
//!     let router = Router::default();
//!     router
//!         .register_procedure(
//!             "math.add",
//!             |p: Value, _ctx: Context| async move {
//!                 Ok::<_, RpcError>(json!({ "result": p["a"].as_i64() + p["b"].as_i64() }))
//!             },
//!             HandlerMeta::default(),
//!         )
//!         .unwrap();
//!
//!     let outcome = router
//!         .dispatch(Envelope::request("math.add", json!({ "a": 5, "b": 3 })))
//!         .await;
//!     println!("{:?}", outcome.into_response());
//! }
//! ```

pub mod context;
pub mod delivery;
pub mod envelope;
pub mod error;
pub mod handler;
pub mod interceptor;
pub mod registry;
pub mod router;
pub mod stream;

pub use context::{AuthInfo, Context, ExtensionKey, TraceContext};
pub use delivery::{
    DeliveryDefaults, DeliveryEngine, DeliveryMode, DeliveryOutcome, DeliveryRequest,
    DeliveryStore, MemoryDeliveryStore, RetryPolicy, RetryState,
};
pub use envelope::{Envelope, EnvelopeType};
pub use error::{
    ApplicationError, ErrorPayload, RpcError, RpcResult, StoreError, StoreResult,
};
pub use handler::{
    Ack, BoxFuture, BoxedEventHandler, BoxedProcedureHandler, BoxedStreamHandler, EventHandler,
    ProcedureHandler, StreamHandler,
};
pub use interceptor::{BoxedInterceptor, Interceptor, InterceptorFn, Next, Outcome, Terminal, from_fn};
pub use registry::{
    EventMeta, HandlerEntry, HandlerKind, HandlerMeta, Registry, RegistryMode, RegistryStats,
};
pub use router::{Router, RouterConfig};
pub use stream::{Stream, StreamChunk, StreamHandle, StreamId, StreamOptions, StreamSet};

// Re-export for handler authors
pub use async_trait::async_trait;
pub use serde_json::Value;
pub use tokio_util::sync::CancellationToken;
