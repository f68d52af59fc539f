//! # Switchyard
//!
//! A protocol-agnostic RPC, event and streaming runtime for Rust.
//!
//! ## Overview
//!
//! Switchyard is the dispatch core that sits between transport adapters
//! (HTTP, WebSocket, message queues, ...) and application handlers. Adapters
//! turn wire messages into [`Envelope`](core::Envelope)s; the router runs them
//! through the interceptor chain and the registered handler and hands back a
//! response envelope, a live stream, or an acceptance for events.
//!
//! ```text
//! ┌───────────┐    ┌──────────────────────────────┐    ┌──────────────────────┐
//! │ Transport │───▶│ Router                       │───▶│ procedure  → response│
//! │ adapter   │    │  interceptor → interceptor → │───▶│ stream     → stream  │
//! └───────────┘    │  terminal dispatch           │───▶│ event      → delivery│
//!                  └──────────────────────────────┘    └──────────────────────┘
//! ```
//!
//! - **core**: envelopes, contexts, the registry, streams, the interceptor
//!   chain, the router and the event delivery engine
//! - **framework**: interceptor composition, built-in interceptors, typed
//!   handlers and a tower service over the router
//! - **runtime**: configuration, logging and process lifecycle
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use switchyard::prelude::*;
//!
//! #[derive(Deserialize)]
//! struct Add { a: i64, b: i64 }
//!
//! #[tokio::main]
//! async fn main() -> RuntimeResult<()> {
//!     let runtime = SwitchyardRuntime::new();
//!     runtime.router().register_procedure(
//!         "math.add",
//!         typed::procedure(|req: Add, _ctx| async move { Ok(req.a + req.b) }),
//!         HandlerMeta::described("Adds two integers"),
//!     )?;
//!
//!     runtime.run().await
//! }
//! ```
//!
//! ## Features
//!
//! - `toml-config`: `switchyard.toml` configuration files (default)
//! - `yaml-config`: `switchyard.yaml` configuration files
//! - `json-log`: JSON log output

pub use switchyard_core as core;
pub use switchyard_framework as framework;
pub use switchyard_runtime as runtime;

/// Commonly used types for building services.
///
/// ```rust,ignore
/// use switchyard::prelude::*;
/// ```
pub mod prelude {
    // Runtime
    pub use switchyard_runtime::{
        RuntimeBuilder, RuntimeError, RuntimeResult, SwitchyardConfig, SwitchyardRuntime,
    };

    // Dispatch core
    pub use switchyard_core::{
        Ack, ApplicationError, AuthInfo, Context, DeliveryMode, Envelope, EnvelopeType, EventMeta,
        ExtensionKey, HandlerMeta, Interceptor, Next, Outcome, RegistryMode, RetryPolicy, Router,
        RouterConfig, RpcError, RpcResult, StreamChunk, StreamHandle, StreamOptions, Value,
        async_trait, from_fn,
    };

    // Framework helpers
    pub use switchyard_framework::{
        RouterService, compose, except, for_pattern, for_procedures, timeout, trace, typed, when,
    };

    // Logging macros
    pub use switchyard_runtime::prelude::*;
}
