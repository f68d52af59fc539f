//! Per-call context for the Switchyard dispatch core.
//!
//! A [`Context`] is created once per inbound message by an adapter and flows
//! through the interceptor chain, the handler and any stream the handler
//! produces. It is immutable: every `with_*` method returns a new context.
//!
//! Only the cancellation signal is shared between a context and everything
//! derived from it, so cancelling the root cancels every derived context and
//! every stream bound to one. The extension map is cloned on each derivation
//! (copy-on-derive): a derived context never observes extensions added to a
//! sibling.
//!
//! # Example
//!
//! ```rust,ignore
//! use switchyard_core::{Context, ExtensionKey};
//!
//! static TENANT: ExtensionKey<String> = ExtensionKey::new("tenant");
//!
//! let ctx = Context::new().with_extension(&TENANT, "acme".to_string());
//! assert_eq!(ctx.extension(&TENANT).map(String::as_str), Some("acme"));
//! ```

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::Instant;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

// =============================================================================
// Auth & Tracing
// =============================================================================

/// The result of authentication, attached by whichever interceptor performed it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuthInfo {
    /// Whether the caller was authenticated.
    pub authenticated: bool,
    /// The authenticated principal, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub principal: Option<String>,
    /// Arbitrary claims.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub claims: HashMap<String, Value>,
}

impl AuthInfo {
    /// An authenticated result for `principal`.
    pub fn authenticated(principal: impl Into<String>) -> Self {
        Self {
            authenticated: true,
            principal: Some(principal.into()),
            claims: HashMap::new(),
        }
    }

    /// An explicit unauthenticated result.
    pub fn anonymous() -> Self {
        Self::default()
    }

    /// Adds a claim.
    pub fn with_claim(mut self, key: impl Into<String>, value: Value) -> Self {
        self.claims.insert(key.into(), value);
        self
    }
}

/// Distributed tracing identifiers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceContext {
    /// Trace identifier shared by every span of one logical request.
    pub trace_id: String,
    /// Identifier of the current span.
    pub span_id: String,
    /// Identifier of the parent span, if this is not a root span.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_span_id: Option<String>,
}

impl TraceContext {
    /// Starts a new root trace.
    pub fn new() -> Self {
        Self {
            trace_id: uuid::Uuid::new_v4().simple().to_string(),
            span_id: new_span_id(),
            parent_span_id: None,
        }
    }

    /// Creates a child span in the same trace.
    pub fn child(&self) -> Self {
        Self {
            trace_id: self.trace_id.clone(),
            span_id: new_span_id(),
            parent_span_id: Some(self.span_id.clone()),
        }
    }
}

impl Default for TraceContext {
    fn default() -> Self {
        Self::new()
    }
}

fn new_span_id() -> String {
    let mut id = uuid::Uuid::new_v4().simple().to_string();
    id.truncate(16);
    id
}

// =============================================================================
// Extensions
// =============================================================================

/// A typed token identifying a context extension.
///
/// Keys are usually declared as statics. Two keys are the same slot when they
/// share both the value type and the name.
pub struct ExtensionKey<T> {
    name: &'static str,
    _marker: PhantomData<fn() -> T>,
}

impl<T> ExtensionKey<T> {
    /// Creates a key with the given name.
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            _marker: PhantomData,
        }
    }

    /// Returns the key's name.
    pub const fn name(&self) -> &'static str {
        self.name
    }
}

impl<T: 'static> ExtensionKey<T> {
    fn slot(&self) -> ExtensionSlot {
        (TypeId::of::<T>(), self.name)
    }
}

impl<T> Clone for ExtensionKey<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for ExtensionKey<T> {}

impl<T> fmt::Debug for ExtensionKey<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtensionKey")
            .field("name", &self.name)
            .field("type", &std::any::type_name::<T>())
            .finish()
    }
}

type ExtensionSlot = (TypeId, &'static str);
type Extensions = HashMap<ExtensionSlot, Arc<dyn Any + Send + Sync>>;

// =============================================================================
// Context
// =============================================================================

#[derive(Clone)]
struct ContextInner {
    request_id: String,
    auth: Option<AuthInfo>,
    tracing: TraceContext,
    signal: CancellationToken,
    deadline: Option<Instant>,
    extensions: Extensions,
}

/// Cross-cutting state for one call.
///
/// Cloning a `Context` is cheap and yields the *same* context (shared by
/// reference). Use the `with_*` methods to derive a different one.
#[derive(Clone)]
pub struct Context {
    inner: Arc<ContextInner>,
}

impl Context {
    /// Creates a root context with a generated request id and a fresh trace.
    pub fn new() -> Self {
        Self::root(uuid::Uuid::new_v4().to_string(), CancellationToken::new())
    }

    /// Creates a root context observing an existing cancellation signal.
    ///
    /// Adapters use this to tie a call to the lifetime of its connection.
    /// The context gets a child of `signal`: cancelling the connection
    /// cancels the call, cancelling the call leaves the connection and its
    /// other calls running.
    pub fn with_signal(request_id: impl Into<String>, signal: &CancellationToken) -> Self {
        Self::root(request_id, signal.child_token())
    }

    fn root(request_id: impl Into<String>, signal: CancellationToken) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                request_id: request_id.into(),
                auth: None,
                tracing: TraceContext::new(),
                signal,
                deadline: None,
                extensions: HashMap::new(),
            }),
        }
    }

    fn derive(&self, f: impl FnOnce(&mut ContextInner)) -> Self {
        let mut inner = (*self.inner).clone();
        f(&mut inner);
        Self {
            inner: Arc::new(inner),
        }
    }

    // ─── Accessors ────────────────────────────────────────────────────────────

    /// The correlation id of this call.
    pub fn request_id(&self) -> &str {
        &self.inner.request_id
    }

    /// The authentication result, if an interceptor attached one.
    pub fn auth(&self) -> Option<&AuthInfo> {
        self.inner.auth.as_ref()
    }

    /// The tracing identifiers.
    pub fn tracing(&self) -> &TraceContext {
        &self.inner.tracing
    }

    /// The shared cancellation signal. Downstream code observes it; only the
    /// owner of the call should cancel it.
    pub fn signal(&self) -> &CancellationToken {
        &self.inner.signal
    }

    /// The advisory deadline, if one was introduced.
    pub fn deadline(&self) -> Option<Instant> {
        self.inner.deadline
    }

    /// Time left until the deadline. `None` when no deadline applies.
    pub fn remaining(&self) -> Option<Duration> {
        self.inner
            .deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    /// Returns `true` once the deadline has passed.
    pub fn is_expired(&self) -> bool {
        self.inner
            .deadline
            .is_some_and(|deadline| Instant::now() >= deadline)
    }

    /// Returns `true` once the shared signal has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.inner.signal.is_cancelled()
    }

    /// Resolves when the shared signal is cancelled.
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.inner.signal.cancelled()
    }

    /// Cancels the shared signal, and with it every derived context.
    pub fn cancel(&self) {
        self.inner.signal.cancel();
    }

    /// Looks up an extension value.
    pub fn extension<T: Send + Sync + 'static>(&self, key: &ExtensionKey<T>) -> Option<&T> {
        self.inner
            .extensions
            .get(&key.slot())
            .and_then(|value| value.downcast_ref::<T>())
    }

    /// Returns `true` if the extension is present.
    pub fn has_extension<T: Send + Sync + 'static>(&self, key: &ExtensionKey<T>) -> bool {
        self.inner.extensions.contains_key(&key.slot())
    }

    // ─── Derivation ───────────────────────────────────────────────────────────

    /// Derives a context with the given absolute deadline.
    pub fn with_deadline(&self, deadline: Instant) -> Self {
        self.derive(|inner| inner.deadline = Some(deadline))
    }

    /// Derives a context whose deadline is `timeout` from now, keeping an
    /// existing earlier deadline.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        let candidate = Instant::now() + timeout;
        let deadline = match self.inner.deadline {
            Some(existing) if existing < candidate => existing,
            _ => candidate,
        };
        self.with_deadline(deadline)
    }

    /// Derives a context carrying an authentication result.
    pub fn with_auth(&self, auth: AuthInfo) -> Self {
        self.derive(|inner| inner.auth = Some(auth))
    }

    /// Derives a context with different tracing identifiers.
    pub fn with_tracing(&self, tracing: TraceContext) -> Self {
        self.derive(|inner| inner.tracing = tracing)
    }

    /// Derives a context with a different request id.
    pub fn with_request_id(&self, request_id: impl Into<String>) -> Self {
        let request_id = request_id.into();
        self.derive(|inner| inner.request_id = request_id)
    }

    /// Derives a context with an extension value set.
    pub fn with_extension<T: Send + Sync + 'static>(&self, key: &ExtensionKey<T>, value: T) -> Self {
        let slot = key.slot();
        self.derive(|inner| {
            inner.extensions.insert(slot, Arc::new(value));
        })
    }

    /// Returns `true` if both handles refer to the very same context.
    pub fn ptr_eq(&self, other: &Context) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("request_id", &self.inner.request_id)
            .field("auth", &self.inner.auth)
            .field("tracing", &self.inner.tracing)
            .field("cancelled", &self.is_cancelled())
            .field("deadline", &self.inner.deadline)
            .field("extensions", &self.inner.extensions.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    static TENANT: ExtensionKey<String> = ExtensionKey::new("tenant");
    static LIMIT: ExtensionKey<u32> = ExtensionKey::new("limit");

    #[test]
    fn test_derivation_shares_signal() {
        let root = Context::new();
        let derived = root
            .with_auth(AuthInfo::authenticated("alice"))
            .with_timeout(Duration::from_secs(5));

        assert!(!derived.ptr_eq(&root));
        assert!(root.auth().is_none());
        assert_eq!(derived.auth().and_then(|a| a.principal.as_deref()), Some("alice"));

        root.cancel();
        assert!(derived.is_cancelled());
    }

    #[test]
    fn test_call_cancellation_stays_below_connection() {
        let connection = CancellationToken::new();
        let first = Context::with_signal("req-1", &connection);
        let second = Context::with_signal("req-2", &connection);

        first.with_timeout(Duration::from_secs(1)).cancel();
        assert!(first.is_cancelled());
        assert!(!second.is_cancelled());
        assert!(!connection.is_cancelled());

        connection.cancel();
        assert!(second.is_cancelled());
    }

    #[test]
    fn test_extensions_copy_on_derive() {
        let base = Context::new().with_extension(&TENANT, "acme".to_string());
        let a = base.with_extension(&LIMIT, 10);
        let b = base.with_extension(&TENANT, "globex".to_string());

        assert_eq!(base.extension(&TENANT).map(String::as_str), Some("acme"));
        assert!(!base.has_extension(&LIMIT));
        assert_eq!(a.extension(&LIMIT), Some(&10));
        assert_eq!(a.extension(&TENANT).map(String::as_str), Some("acme"));
        assert_eq!(b.extension(&TENANT).map(String::as_str), Some("globex"));
        assert!(!b.has_extension(&LIMIT));
    }

    #[test]
    fn test_same_name_different_type_is_different_slot() {
        static AS_U64: ExtensionKey<u64> = ExtensionKey::new("limit");
        let ctx = Context::new().with_extension(&LIMIT, 7);
        assert!(ctx.extension(&AS_U64).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_tracking() {
        let ctx = Context::new();
        assert!(ctx.remaining().is_none());
        assert!(!ctx.is_expired());

        let ctx = ctx.with_timeout(Duration::from_millis(100));
        assert_eq!(ctx.remaining(), Some(Duration::from_millis(100)));

        // A later timeout does not extend an earlier deadline.
        let same = ctx.with_timeout(Duration::from_secs(10));
        assert_eq!(same.deadline(), ctx.deadline());

        tokio::time::advance(Duration::from_millis(150)).await;
        assert!(ctx.is_expired());
        assert_eq!(ctx.remaining(), Some(Duration::ZERO));
    }

    #[test]
    fn test_child_trace() {
        let root = TraceContext::new();
        let child = root.child();
        assert_eq!(child.trace_id, root.trace_id);
        assert_eq!(child.parent_span_id.as_deref(), Some(root.span_id.as_str()));
        assert_eq!(child.span_id.len(), 16);
    }
}
