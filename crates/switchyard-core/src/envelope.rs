//! The message envelope shared by every adapter.
//!
//! An [`Envelope`] is the only bit-exact contract between the core and the
//! outside world. Adapters translate wire frames into envelopes and back; the
//! core never sees wire bytes. On the wire an envelope is:
//!
//! ```json
//! {
//!   "id": "9b2c...",
//!   "procedure": "math.add",
//!   "type": "request",
//!   "payload": { "a": 5, "b": 3 },
//!   "metadata": { "authorization": "Bearer ..." }
//! }
//! ```
//!
//! The [`Context`] travels with the envelope in-process but is never
//! serialized.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::context::Context;
use crate::error::RpcError;
use crate::registry::HandlerKind;

/// The nine message kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EnvelopeType {
    Request,
    Response,
    StreamStart,
    StreamData,
    StreamEnd,
    StreamError,
    StreamCancel,
    Event,
    Error,
}

impl EnvelopeType {
    /// Returns the wire name, e.g. `"stream-start"`.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Request => "request",
            Self::Response => "response",
            Self::StreamStart => "stream-start",
            Self::StreamData => "stream-data",
            Self::StreamEnd => "stream-end",
            Self::StreamError => "stream-error",
            Self::StreamCancel => "stream-cancel",
            Self::Event => "event",
            Self::Error => "error",
        }
    }

    /// The handler kind an inbound envelope of this type dispatches to.
    ///
    /// Outbound-only types return `None`.
    pub fn handler_kind(&self) -> Option<HandlerKind> {
        match self {
            Self::Request => Some(HandlerKind::Procedure),
            Self::StreamStart => Some(HandlerKind::Stream),
            Self::Event => Some(HandlerKind::Event),
            _ => None,
        }
    }
}

impl fmt::Display for EnvelopeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An immutable message.
///
/// Construction methods consume and return the envelope so that an adapter
/// can finish building it before handing it to the router; there are no
/// setters afterwards.
#[derive(Clone, Serialize, Deserialize)]
pub struct Envelope<T = Value> {
    id: String,
    procedure: String,
    #[serde(rename = "type")]
    kind: EnvelopeType,
    payload: T,
    #[serde(default)]
    metadata: HashMap<String, String>,
    #[serde(skip)]
    context: Context,
}

impl<T> Envelope<T> {
    /// Creates an envelope with a generated id and a fresh root context.
    pub fn new(procedure: impl Into<String>, kind: EnvelopeType, payload: T) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            procedure: procedure.into(),
            kind,
            payload,
            metadata: HashMap::new(),
            context: Context::new(),
        }
    }

    /// A `request` envelope.
    pub fn request(procedure: impl Into<String>, payload: T) -> Self {
        Self::new(procedure, EnvelopeType::Request, payload)
    }

    /// A `stream-start` envelope.
    pub fn stream_start(procedure: impl Into<String>, payload: T) -> Self {
        Self::new(procedure, EnvelopeType::StreamStart, payload)
    }

    /// An `event` envelope.
    pub fn event(procedure: impl Into<String>, payload: T) -> Self {
        Self::new(procedure, EnvelopeType::Event, payload)
    }

    /// Replaces the id with a caller-assigned one.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Adds a metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Replaces the context. Interceptors use this to pass a derived context
    /// down the chain.
    pub fn with_context(mut self, context: Context) -> Self {
        self.context = context;
        self
    }

    // ─── Accessors ────────────────────────────────────────────────────────────

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn procedure(&self) -> &str {
        &self.procedure
    }

    pub fn kind(&self) -> EnvelopeType {
        self.kind
    }

    pub fn payload(&self) -> &T {
        &self.payload
    }

    pub fn metadata(&self) -> &HashMap<String, String> {
        &self.metadata
    }

    /// Looks up a single metadata entry.
    pub fn header(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    /// Consumes the envelope, returning its payload.
    pub fn into_payload(self) -> T {
        self.payload
    }

    /// Splits the envelope into payload and context.
    pub fn into_parts(self) -> (T, Context) {
        (self.payload, self.context)
    }

    /// Transforms the payload, keeping everything else.
    pub fn map_payload<U>(self, f: impl FnOnce(T) -> U) -> Envelope<U> {
        Envelope {
            id: self.id,
            procedure: self.procedure,
            kind: self.kind,
            payload: f(self.payload),
            metadata: self.metadata,
            context: self.context,
        }
    }

    // ─── Derived envelopes ────────────────────────────────────────────────────

    /// Derives an envelope answering this one.
    ///
    /// The derived envelope keeps the id and procedure for correlation,
    /// shares this envelope's context and starts with empty metadata.
    pub fn derive<U>(&self, kind: EnvelopeType, payload: U) -> Envelope<U> {
        Envelope {
            id: self.id.clone(),
            procedure: self.procedure.clone(),
            kind,
            payload,
            metadata: HashMap::new(),
            context: self.context.clone(),
        }
    }

    /// A `response` envelope carrying `payload`.
    pub fn response<U>(&self, payload: U) -> Envelope<U> {
        self.derive(EnvelopeType::Response, payload)
    }

    /// An `error` envelope carrying the normalized form of `err`.
    pub fn error(&self, err: &RpcError) -> Envelope {
        self.derive(EnvelopeType::Error, error_value(err))
    }

    /// A `stream-data` envelope carrying one stream value.
    pub fn stream_data<U>(&self, value: U) -> Envelope<U> {
        self.derive(EnvelopeType::StreamData, value)
    }

    /// A `stream-end` envelope.
    pub fn stream_end(&self) -> Envelope {
        self.derive(EnvelopeType::StreamEnd, Value::Null)
    }

    /// A `stream-error` envelope carrying the normalized form of `err`.
    pub fn stream_error(&self, err: &RpcError) -> Envelope {
        self.derive(EnvelopeType::StreamError, error_value(err))
    }

    /// A payload-less copy used to answer this envelope after its payload
    /// has been moved into a handler.
    pub fn reply_target(&self) -> Envelope<()> {
        self.derive(self.kind, ())
    }
}

fn error_value(err: &RpcError) -> Value {
    serde_json::to_value(err.to_payload()).unwrap_or(Value::Null)
}

impl<T: fmt::Debug> fmt::Debug for Envelope<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Envelope")
            .field("id", &self.id)
            .field("procedure", &self.procedure)
            .field("type", &self.kind)
            .field("payload", &self.payload)
            .field("metadata", &self.metadata)
            .field("request_id", &self.context.request_id())
            .finish()
    }
}
