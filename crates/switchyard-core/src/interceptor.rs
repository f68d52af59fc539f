//! Interceptor chain.
//!
//! Interceptors wrap the terminal handler invocation. The first interceptor
//! registered is the outermost one:
//!
//! ```text
//! dispatch ──▶ auth ──▶ trace ──▶ timeout ──▶ terminal (handler)
//!          ◀──      ◀──       ◀──         ◀──
//! ```
//!
//! Each interceptor receives the envelope and a [`Next`] continuation.
//! Running `next` passes control inward; not running it short-circuits the
//! chain with whatever the interceptor returns. Running it twice fails with
//! [`RpcError::ChainMisuse`].
//!
//! The context travels inside the envelope: an interceptor that derives a
//! new context passes it inward with [`Envelope::with_context`].

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;

use crate::envelope::Envelope;
use crate::error::{RpcError, RpcResult};
use crate::handler::BoxFuture;
use crate::stream::StreamHandle;

/// The result of dispatching one envelope.
#[derive(Debug, Clone)]
pub enum Outcome {
    /// A `response` or `error` envelope.
    Response(Envelope),
    /// A live stream opened by a `stream-start` envelope.
    Stream(StreamHandle),
    /// An event was accepted by the delivery engine.
    Accepted,
}

impl Outcome {
    pub fn as_response(&self) -> Option<&Envelope> {
        match self {
            Self::Response(envelope) => Some(envelope),
            _ => None,
        }
    }

    pub fn into_response(self) -> Option<Envelope> {
        match self {
            Self::Response(envelope) => Some(envelope),
            _ => None,
        }
    }

    pub fn into_stream(self) -> Option<StreamHandle> {
        match self {
            Self::Stream(stream) => Some(stream),
            _ => None,
        }
    }

    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted)
    }
}

// =============================================================================
// Interceptor
// =============================================================================

/// Middleware around handler invocation.
#[async_trait]
pub trait Interceptor: Send + Sync + 'static {
    async fn intercept(&self, envelope: Envelope, next: Next) -> RpcResult<Outcome>;
}

pub type BoxedInterceptor = Arc<dyn Interceptor>;

#[async_trait]
impl Interceptor for BoxedInterceptor {
    async fn intercept(&self, envelope: Envelope, next: Next) -> RpcResult<Outcome> {
        (**self).intercept(envelope, next).await
    }
}

/// Adapts an async closure into an [`Interceptor`].
pub struct InterceptorFn<F> {
    f: F,
}

/// Creates an interceptor from an async closure.
///
/// ```rust,ignore
/// router.use_interceptor(from_fn(|envelope: Envelope, next: Next| async move {
///     tracing::info!(procedure = envelope.procedure(), "inbound");
///     next.run(envelope).await
/// }));
/// ```
pub fn from_fn<F, Fut>(f: F) -> InterceptorFn<F>
where
    F: Fn(Envelope, Next) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = RpcResult<Outcome>> + Send + 'static,
{
    InterceptorFn { f }
}

#[async_trait]
impl<F, Fut> Interceptor for InterceptorFn<F>
where
    F: Fn(Envelope, Next) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = RpcResult<Outcome>> + Send + 'static,
{
    async fn intercept(&self, envelope: Envelope, next: Next) -> RpcResult<Outcome> {
        (self.f)(envelope, next).await
    }
}

impl<F> fmt::Debug for InterceptorFn<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InterceptorFn").finish_non_exhaustive()
    }
}

// =============================================================================
// Next
// =============================================================================

/// The innermost step of a chain.
pub trait Terminal: Send + Sync + 'static {
    fn call(&self, envelope: Envelope) -> BoxFuture<'static, RpcResult<Outcome>>;
}

impl<F, Fut> Terminal for F
where
    F: Fn(Envelope) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = RpcResult<Outcome>> + Send + 'static,
{
    fn call(&self, envelope: Envelope) -> BoxFuture<'static, RpcResult<Outcome>> {
        Box::pin((self)(envelope))
    }
}

/// The continuation handed to an interceptor.
///
/// Clones share the "already run" flag, so a continuation can be run at
/// most once no matter how many copies exist.
#[derive(Clone)]
pub struct Next {
    chain: Arc<[BoxedInterceptor]>,
    index: usize,
    terminal: Arc<dyn Terminal>,
    invoked: Arc<AtomicBool>,
}

impl Next {
    /// Builds the entry point of a chain.
    ///
    /// Composition helpers use this to run a sub-chain whose terminal
    /// continues an outer `Next`.
    pub fn new(chain: Arc<[BoxedInterceptor]>, terminal: Arc<dyn Terminal>) -> Self {
        Self::at(chain, 0, terminal)
    }

    fn at(chain: Arc<[BoxedInterceptor]>, index: usize, terminal: Arc<dyn Terminal>) -> Self {
        Self {
            chain,
            index,
            terminal,
            invoked: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Number of interceptors still ahead of the terminal.
    pub fn remaining(&self) -> usize {
        self.chain.len().saturating_sub(self.index)
    }

    /// Returns `true` once this continuation has been run.
    pub fn is_invoked(&self) -> bool {
        self.invoked.load(Ordering::SeqCst)
    }

    /// Passes control to the next interceptor, or the terminal step.
    pub async fn run(self, envelope: Envelope) -> RpcResult<Outcome> {
        if self.invoked.swap(true, Ordering::SeqCst) {
            return Err(RpcError::ChainMisuse(format!(
                "next() called more than once at position {}",
                self.index
            )));
        }

        match self.chain.get(self.index) {
            Some(interceptor) => {
                let interceptor = Arc::clone(interceptor);
                let next = Self::at(Arc::clone(&self.chain), self.index + 1, Arc::clone(&self.terminal));
                interceptor.intercept(envelope, next).await
            }
            None => self.terminal.call(envelope).await,
        }
    }
}

impl fmt::Debug for Next {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Next")
            .field("index", &self.index)
            .field("len", &self.chain.len())
            .field("invoked", &self.is_invoked())
            .finish()
    }
}
