//! Switchyard Runtime - process orchestration for the Switchyard RPC runtime.
//!
//! This crate provides:
//! - Layered configuration (`switchyard.toml` / `switchyard.yaml`, `SWITCHYARD_*` env vars)
//! - Logging setup driven by that configuration
//! - [`SwitchyardRuntime`], which builds the router and handles graceful shutdown
//!
//! ```ignore
//! use switchyard_runtime::SwitchyardRuntime;
//!
//! #[tokio::main]
//! async fn main() -> switchyard_runtime::RuntimeResult<()> {
//!     let runtime = SwitchyardRuntime::new();
//!     runtime.router().register_procedure("ping", ping, HandlerMeta::default())?;
//!
//!     // Run until Ctrl+C
//!     runtime.run().await
//! }
//! ```

pub mod config;
pub mod error;
pub mod logging;
pub mod runtime;

pub use config::{ConfigError, ConfigLoader, ConfigResult, SwitchyardConfig};
pub use error::{RuntimeError, RuntimeResult};
pub use logging::{LoggingBuilder, SpanEvents};
pub use runtime::{RuntimeBuilder, SwitchyardRuntime};

pub use tracing;
pub use tracing_subscriber;

/// Commonly used logging macros.
pub mod prelude {
    pub use tracing::{Level, debug, error, info, instrument, span, trace, warn};
}
