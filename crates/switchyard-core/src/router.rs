//! The router: registration, interceptor chain and dispatch.
//!
//! ```text
//! Envelope ─▶ Router::dispatch ─▶ interceptors ─▶ terminal
//!                                                  ├─ request      ─▶ procedure ─▶ response
//!                                                  ├─ stream-start ─▶ stream    ─▶ StreamHandle (pumped)
//!                                                  └─ event        ─▶ DeliveryEngine ─▶ Accepted
//! ```
//!
//! [`Router::call`] returns the raw result and is meant for embedding;
//! [`Router::dispatch`] is the adapter boundary and never fails: errors and
//! handler panics become `error` envelopes there.

use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::stream::BoxStream;
use futures::{FutureExt, StreamExt};
use parking_lot::RwLock;
use serde_json::Value;
use tokio_util::task::TaskTracker;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::delivery::{DeliveryDefaults, DeliveryEngine, DeliveryRequest, DeliveryStore, MemoryDeliveryStore};
use crate::envelope::Envelope;
use crate::error::{RpcError, RpcResult};
use crate::handler::{BoxFuture, EventHandler, ProcedureHandler, StreamHandler};
use crate::interceptor::{BoxedInterceptor, Interceptor, Next, Outcome, Terminal};
use crate::registry::{
    EventMeta, HandlerEntry, HandlerKind, HandlerMeta, Registry, RegistryMode, RegistryStats,
};
use crate::stream::{Stream, StreamHandle, StreamId, StreamOptions, StreamSet};

/// Metadata header carrying a stream's priority hint.
pub const PRIORITY_HEADER: &str = "priority";

/// Router construction options.
#[derive(Debug, Clone, Default)]
pub struct RouterConfig {
    pub registry_mode: RegistryMode,
    /// Defaults for streams opened by `stream-start` envelopes.
    pub streams: StreamOptions,
    pub delivery: DeliveryDefaults,
}

struct RouterInner {
    registry: Registry,
    interceptors: RwLock<Arc<[BoxedInterceptor]>>,
    delivery: DeliveryEngine,
    stream_options: StreamOptions,
    streams: StreamSet,
    pumps: TaskTracker,
    next_stream_id: AtomicU64,
}

/// Dispatches envelopes to registered handlers.
///
/// Cloning a router yields another handle to the same router.
#[derive(Clone)]
pub struct Router {
    inner: Arc<RouterInner>,
}

impl Router {
    /// Creates a router with an in-memory delivery store.
    pub fn new(config: RouterConfig) -> Self {
        Self::with_store(config, Arc::new(MemoryDeliveryStore::new()))
    }

    /// Creates a router whose delivery engine uses `store`.
    pub fn with_store(config: RouterConfig, store: Arc<dyn DeliveryStore>) -> Self {
        Self {
            inner: Arc::new(RouterInner {
                registry: Registry::new(config.registry_mode),
                interceptors: RwLock::new(Arc::from(Vec::new())),
                delivery: DeliveryEngine::new(store, config.delivery),
                stream_options: config.streams,
                streams: StreamSet::new(),
                pumps: TaskTracker::new(),
                next_stream_id: AtomicU64::new(1),
            }),
        }
    }

    // ─── Registration ─────────────────────────────────────────────────────────

    /// Registers a unary handler under `name`.
    pub fn register_procedure<H>(&self, name: impl Into<String>, handler: H, meta: HandlerMeta) -> RpcResult<()>
    where
        H: ProcedureHandler,
    {
        self.register(HandlerEntry::Procedure {
            name: name.into(),
            handler: Arc::new(handler),
            meta,
        })
    }

    /// Registers a streaming handler under `name`.
    pub fn register_stream<H>(&self, name: impl Into<String>, handler: H, meta: HandlerMeta) -> RpcResult<()>
    where
        H: StreamHandler,
    {
        self.register(HandlerEntry::Stream {
            name: name.into(),
            handler: Arc::new(handler),
            meta,
        })
    }

    /// Registers an event handler under `name` with its delivery contract.
    pub fn register_event<H>(&self, name: impl Into<String>, handler: H, meta: EventMeta) -> RpcResult<()>
    where
        H: EventHandler,
    {
        self.register(HandlerEntry::Event {
            name: name.into(),
            handler: Arc::new(handler),
            meta,
        })
    }

    /// Registers a prebuilt entry.
    pub fn register(&self, entry: HandlerEntry) -> RpcResult<()> {
        self.inner.registry.register(entry).map(|_| ())
    }

    pub fn unregister(&self, kind: HandlerKind, name: &str) -> bool {
        self.inner.registry.unregister(kind, name).is_some()
    }

    pub fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    pub fn stats(&self) -> RegistryStats {
        self.inner.registry.stats()
    }

    /// Appends an interceptor. Interceptors added first run outermost.
    ///
    /// Calls already in flight keep the chain they started with.
    pub fn use_interceptor<I: Interceptor>(&self, interceptor: I) -> &Self {
        self.use_boxed(Arc::new(interceptor))
    }

    pub fn use_boxed(&self, interceptor: BoxedInterceptor) -> &Self {
        let mut chain = self.inner.interceptors.write();
        let mut next: Vec<BoxedInterceptor> = chain.iter().cloned().collect();
        next.push(interceptor);
        *chain = Arc::from(next);
        self
    }

    pub fn interceptor_count(&self) -> usize {
        self.inner.interceptors.read().len()
    }

    // ─── Dispatch ─────────────────────────────────────────────────────────────

    /// Runs the envelope through the interceptor chain and its handler.
    pub async fn call(&self, envelope: Envelope) -> RpcResult<Outcome> {
        let chain = Arc::clone(&*self.inner.interceptors.read());
        let terminal: Arc<dyn Terminal> = Arc::new(Dispatch(Arc::clone(&self.inner)));
        Next::new(chain, terminal).run(envelope).await
    }

    /// Dispatches an envelope, converting every failure into an `error`
    /// envelope addressed to the caller.
    pub async fn dispatch(&self, envelope: Envelope) -> Outcome {
        let reply = envelope.reply_target();
        let span = info_span!(
            "dispatch",
            id = %envelope.id(),
            procedure = %envelope.procedure(),
            kind = %envelope.kind(),
        );

        let result = AssertUnwindSafe(self.call(envelope))
            .catch_unwind()
            .instrument(span.clone())
            .await;

        let err = match result {
            Ok(Ok(outcome)) => return outcome,
            Ok(Err(err)) => err,
            Err(panic) => RpcError::internal(format!("handler panicked: {}", panic_message(&*panic))),
        };

        let _enter = span.enter();
        match &err {
            RpcError::Application(_) | RpcError::ProcedureNotFound { .. } | RpcError::InvalidEnvelope(_) => {
                debug!(error = %err, "Dispatch failed")
            }
            RpcError::Cancelled(_) | RpcError::DeadlineExceeded => debug!(error = %err, "Call terminated early"),
            _ => error!(error = %err, "Internal error during dispatch"),
        }
        Outcome::Response(reply.error(&err))
    }

    // ─── Resources ────────────────────────────────────────────────────────────

    /// The engine governing event delivery.
    pub fn delivery(&self) -> &DeliveryEngine {
        &self.inner.delivery
    }

    /// Number of streams whose producer is still running.
    pub fn active_streams(&self) -> usize {
        self.inner.streams.len()
    }

    /// Looks up a live stream by id, e.g. to route a `stream-cancel`.
    pub fn stream(&self, id: StreamId) -> Option<StreamHandle> {
        self.inner.streams.get(id)
    }

    /// Cancels live streams, waits for their producers and stops the
    /// delivery engine.
    pub async fn shutdown(&self) {
        info!(
            streams = self.inner.streams.len(),
            retries = self.inner.delivery.pending_retries(),
            "Shutting down router"
        );
        self.inner.streams.cancel_all("router shutting down");
        self.inner.pumps.close();
        self.inner.pumps.wait().await;
        self.inner.delivery.stop().await;
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::new(RouterConfig::default())
    }
}

impl fmt::Debug for Router {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Router")
            .field("registry", &self.inner.registry)
            .field("interceptors", &self.interceptor_count())
            .field("active_streams", &self.active_streams())
            .field("delivery", &self.inner.delivery)
            .finish()
    }
}

// =============================================================================
// Terminal Step
// =============================================================================

struct Dispatch(Arc<RouterInner>);

impl Terminal for Dispatch {
    fn call(&self, envelope: Envelope) -> BoxFuture<'static, RpcResult<Outcome>> {
        Box::pin(Arc::clone(&self.0).invoke(envelope))
    }
}

impl RouterInner {
    async fn invoke(self: Arc<Self>, envelope: Envelope) -> RpcResult<Outcome> {
        let Some(kind) = envelope.kind().handler_kind() else {
            return Err(RpcError::InvalidEnvelope(format!(
                "'{}' envelopes cannot be dispatched",
                envelope.kind()
            )));
        };
        if envelope.context().is_cancelled() {
            return Err(RpcError::cancelled("cancelled before dispatch"));
        }

        let entry = self
            .registry
            .lookup(kind, envelope.procedure())
            .ok_or_else(|| RpcError::ProcedureNotFound {
                kind,
                name: envelope.procedure().to_string(),
            })?;

        match &*entry {
            HandlerEntry::Procedure { handler, .. } => {
                let reply = envelope.reply_target();
                let (payload, ctx) = envelope.into_parts();
                let value = tokio::select! {
                    biased;
                    _ = ctx.cancelled() => return Err(RpcError::cancelled("request cancelled")),
                    result = handler.call(payload, ctx.clone()) => result?,
                };
                Ok(Outcome::Response(reply.response(value)))
            }
            HandlerEntry::Stream { handler, .. } => {
                let options = self.stream_options_for(&envelope);
                let id = self.next_stream_id.fetch_add(1, Ordering::Relaxed);
                let (payload, ctx) = envelope.into_parts();

                let stream = Arc::new(Stream::new(id, options, ctx.signal()));
                let source = handler.open(payload, ctx);
                self.streams.insert(Arc::clone(&stream));

                let span = info_span!("stream", id, priority = options.priority);
                self.pumps
                    .spawn(Arc::clone(&self).pump(Arc::clone(&stream), source).instrument(span));
                Ok(Outcome::Stream(stream))
            }
            HandlerEntry::Event { handler, meta, .. } => {
                let event_id = envelope.id().to_string();
                let (payload, ctx) = envelope.into_parts();
                let handler = Arc::clone(handler);

                let request = DeliveryRequest::new(event_id, meta.delivery, move |ack| {
                    handler.call(payload.clone(), ctx.clone(), ack)
                })
                .with_retry_policy(meta.retry_policy.clone())
                .with_deduplication_window(meta.deduplication_window);

                // Detached: the engine's task set owns the delivery.
                drop(self.delivery.submit(request));
                debug!("Event handed to delivery engine");
                Ok(Outcome::Accepted)
            }
        }
    }

    fn stream_options_for(&self, envelope: &Envelope) -> StreamOptions {
        let priority = envelope
            .header(PRIORITY_HEADER)
            .and_then(|raw| raw.trim().parse::<u8>().ok())
            .unwrap_or(self.stream_options.priority);
        self.stream_options.with_priority(priority)
    }

    /// Moves values from the handler's sequence into the stream until either
    /// side terminates.
    async fn pump(self: Arc<Self>, stream: StreamHandle, mut source: BoxStream<'static, RpcResult<Value>>) {
        loop {
            let item = tokio::select! {
                biased;
                _ = stream.signal().cancelled() => break,
                item = AssertUnwindSafe(source.next()).catch_unwind() => item,
            };

            match item {
                Ok(Some(Ok(value))) => {
                    if let Err(err) = stream.write(value).await {
                        debug!(error = %err, "Stream consumer went away");
                        break;
                    }
                }
                Ok(Some(Err(err))) => {
                    warn!(error = %err, "Stream producer failed");
                    stream.error(err);
                    break;
                }
                Ok(None) => {
                    if let Err(err) = stream.end() {
                        debug!(error = %err, "Stream already terminated at end of producer");
                    }
                    break;
                }
                Err(panic) => {
                    error!("Stream producer panicked: {}", panic_message(&*panic));
                    stream.error(RpcError::internal("stream producer panicked"));
                    break;
                }
            }
        }
        self.streams.remove(stream.id());
        debug!("Stream producer finished");
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}
