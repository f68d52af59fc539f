//! Configuration for the Switchyard runtime.
//!
//! Layered loading (defaults, files, environment, programmatic overrides)
//! is done with figment; see [`loader`] for the resolution order.

pub mod error;
pub mod loader;
pub mod schema;
pub mod validation;

pub use error::{ConfigError, ConfigResult};
pub use loader::{ConfigLoader, Profile, load_config, load_config_from_file};
pub use schema::{
    DeliveryConfig, LogFormat, LogLevel, LogOutput, LogRotation, LoggingConfig, RegistryConfig,
    RetryConfig, SpanEventConfig, StreamConfig, SwitchyardConfig,
};
pub use validation::validate_config;
