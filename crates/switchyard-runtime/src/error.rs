//! Runtime error types.

use thiserror::Error;

use crate::config::ConfigError;
use switchyard_core::RpcError;

/// Errors that can occur during runtime operations.
#[derive(Error, Debug)]
pub enum RuntimeError {
    /// Configuration could not be loaded or is invalid.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// A handler registration was rejected by the registry.
    #[error("Handler registration failed: {0}")]
    Registration(#[from] RpcError),

    /// Installing a shutdown signal listener failed.
    #[error("Failed to listen for shutdown signal: {0}")]
    Signal(#[from] std::io::Error),
}

/// Result type for runtime operations.
pub type RuntimeResult<T> = Result<T, RuntimeError>;
