//! # Switchyard Framework
//!
//! Higher-level building blocks on top of the dispatch core:
//! - Interceptor composition (`compose`, `when`, `for_procedures`, `for_pattern`, `except`, `branch`)
//! - Built-in interceptors (`timeout`, `trace`)
//! - Serde-typed handler adapters
//! - A tower [`Service`](tower::Service) over the router
//!
//! Everything here uses only the core's public contracts; none of it is
//! required to dispatch envelopes.

pub mod compose;
pub mod interceptors;
pub mod service;
pub mod typed;

pub use compose::{
    Composed, Conditional, ProcedurePattern, branch, compose, except, for_pattern, for_procedures,
    when,
};
pub use interceptors::{Timeout, Trace, timeout, trace};
pub use service::{BoxedRouterService, RouterService};
pub use typed::{TypedEvent, TypedProcedure, TypedStream};
