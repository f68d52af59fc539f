//! Unified error types for the Switchyard dispatch core.
//!
//! [`RpcError`] is the single error type that flows through interceptors,
//! handlers, streams and the router. Adapters only ever see it in its
//! normalized form, an [`ErrorPayload`] carried by an error envelope.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::registry::HandlerKind;

// =============================================================================
// Error Codes
// =============================================================================

/// Code used for every error that is not explicitly classified.
pub const INTERNAL: &str = "INTERNAL";
/// Code used when no handler is registered under the requested name.
pub const NOT_FOUND: &str = "NOT_FOUND";
/// Code used when the caller cancelled the operation.
pub const CANCELLED: &str = "CANCELLED";
/// Code used when a deadline introduced by an interceptor expired.
pub const DEADLINE_EXCEEDED: &str = "DEADLINE_EXCEEDED";
/// Code used when an envelope cannot be dispatched as given.
pub const INVALID_ARGUMENT: &str = "INVALID_ARGUMENT";

// =============================================================================
// Application Errors
// =============================================================================

/// A structured error raised explicitly by handler code.
///
/// Application errors are passed through the router verbatim; adapters map
/// `code` and `status` to their protocol's representation (HTTP status,
/// gRPC status, JSON-RPC error object, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationError {
    /// Machine-readable error code, e.g. `"VALIDATION_FAILED"`.
    pub code: String,
    /// Numeric status, HTTP flavoured by convention.
    pub status: u16,
    /// Human-readable message.
    pub message: String,
    /// Optional structured details.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl ApplicationError {
    /// Creates an application error with the given code, status and message.
    pub fn new(code: impl Into<String>, status: u16, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            status,
            message: message.into(),
            details: None,
        }
    }

    /// Attaches structured details.
    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }
}

impl fmt::Display for ApplicationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}): {}", self.code, self.status, self.message)
    }
}

impl std::error::Error for ApplicationError {}

// =============================================================================
// RpcError
// =============================================================================

/// Errors produced anywhere in the dispatch pipeline.
#[derive(Debug, Clone, Error)]
pub enum RpcError {
    /// Dispatch against a name with no registered handler of that kind.
    #[error("{kind} '{name}' not found")]
    ProcedureNotFound {
        /// The kind implied by the envelope type.
        kind: HandlerKind,
        /// The requested name.
        name: String,
    },

    /// A strict registry refused to replace an existing entry.
    #[error("{kind} '{name}' is already registered")]
    DuplicateNotAllowed {
        /// The kind of the rejected registration.
        kind: HandlerKind,
        /// The duplicated name.
        name: String,
    },

    /// An interceptor ran its continuation more than once.
    #[error("interceptor chain misuse: {0}")]
    ChainMisuse(String),

    /// A structured error raised by handler code.
    #[error(transparent)]
    Application(#[from] ApplicationError),

    /// Anything unclassified.
    #[error("internal error: {0}")]
    Internal(String),

    /// A read or write was attempted after the stream terminated.
    #[error("stream terminated")]
    StreamTerminated,

    /// The operation was aborted through the context's cancellation signal.
    #[error("cancelled: {0}")]
    Cancelled(String),

    /// The deadline attached by a timeout interceptor elapsed.
    #[error("deadline exceeded")]
    DeadlineExceeded,

    /// The envelope cannot be dispatched (e.g. a `response` sent inbound).
    #[error("invalid envelope: {0}")]
    InvalidEnvelope(String),
}

impl RpcError {
    /// Creates an internal error.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Creates a cancellation error.
    pub fn cancelled(reason: impl Into<String>) -> Self {
        Self::Cancelled(reason.into())
    }

    /// Creates an application error.
    pub fn application(code: impl Into<String>, status: u16, message: impl Into<String>) -> Self {
        Self::Application(ApplicationError::new(code, status, message))
    }

    /// Returns `true` for caller-driven termination.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled(_))
    }

    /// Normalizes the error into the payload carried by an error envelope.
    ///
    /// Unclassified errors collapse to a generic `INTERNAL` payload so that
    /// internal details never leak to the wire.
    pub fn to_payload(&self) -> ErrorPayload {
        match self {
            Self::Application(err) => ErrorPayload {
                code: err.code.clone(),
                status: err.status,
                message: err.message.clone(),
                details: err.details.clone(),
            },
            Self::ProcedureNotFound { .. } => ErrorPayload::new(NOT_FOUND, 404, self.to_string()),
            Self::Cancelled(_) => ErrorPayload::new(CANCELLED, 499, self.to_string()),
            Self::DeadlineExceeded => ErrorPayload::new(DEADLINE_EXCEEDED, 504, self.to_string()),
            Self::InvalidEnvelope(_) => ErrorPayload::new(INVALID_ARGUMENT, 400, self.to_string()),
            Self::DuplicateNotAllowed { .. }
            | Self::ChainMisuse(_)
            | Self::Internal(_)
            | Self::StreamTerminated => ErrorPayload::new(INTERNAL, 500, "internal error"),
        }
    }
}

impl From<serde_json::Error> for RpcError {
    fn from(err: serde_json::Error) -> Self {
        Self::Application(ApplicationError::new(INVALID_ARGUMENT, 400, err.to_string()))
    }
}

// =============================================================================
// Wire Payload
// =============================================================================

/// The payload of an `error` envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    /// Error code.
    pub code: String,
    /// Numeric status.
    pub status: u16,
    /// Message.
    pub message: String,
    /// Optional details.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl ErrorPayload {
    fn new(code: &str, status: u16, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            status,
            message: message.into(),
            details: None,
        }
    }
}

// =============================================================================
// Store Errors
// =============================================================================

/// Errors reported by a delivery store backend.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// The backend could not be reached.
    #[error("delivery store unavailable: {0}")]
    Unavailable(String),

    /// Stored state could not be decoded.
    #[error("corrupt delivery state for '{event_id}': {reason}")]
    Corrupt {
        /// The affected event id.
        event_id: String,
        /// Reason for failure.
        reason: String,
    },
}

// =============================================================================
// Result Type Aliases
// =============================================================================

/// Result type for dispatch operations.
pub type RpcResult<T> = Result<T, RpcError>;

/// Result type for delivery store operations.
pub type StoreResult<T> = Result<T, StoreError>;
