//! Event delivery engine.
//!
//! The [`DeliveryEngine`] wraps event handler execution in one of three
//! delivery contracts:
//!
//! | mode            | behaviour                                                          |
//! |-----------------|--------------------------------------------------------------------|
//! | `best-effort`   | run once; failures are logged, never retried                       |
//! | `at-most-once`  | skip ids already seen within the deduplication window, else run once |
//! | `at-least-once` | retry with exponential backoff until acknowledged or exhausted     |
//!
//! Bookkeeping lives in a pluggable [`DeliveryStore`]; the in-process
//! [`MemoryDeliveryStore`] is the default. Handler failures never reach the
//! caller of [`DeliveryEngine::deliver`]: they only influence the delivery
//! decision.
//!
//! Every delivery, first attempt included, runs on the engine's task set.
//! [`DeliveryEngine::submit`] returns at once and the caller's future owns
//! nothing, so a caller that times out or goes away cannot lose an event.
//!
//! # Retry scheduling
//!
//! Retries are spawned on a [`TaskTracker`] owned by the engine and race
//! their backoff sleep against a shutdown token, so [`DeliveryEngine::stop`]
//! cancels every pending retry deterministically.
//!
//! ```text
//! attempt 1 ──fail──▶ sleep(initial) ──▶ attempt 2 ──fail──▶ sleep(initial × m) ──▶ ...
//!     │                                      │
//!     └── ack ──▶ clear state                └── attempts == max ──▶ clear state (give up)
//! ```

use std::collections::HashMap;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{Instrument, debug, info_span, warn};

use crate::error::{RpcResult, StoreResult};
use crate::handler::{Ack, BoxFuture};

/// Default deduplication window for at-most-once delivery.
pub const DEFAULT_DEDUPLICATION_WINDOW: Duration = Duration::from_secs(60);

// =============================================================================
// Delivery Contract
// =============================================================================

/// Delivery guarantee for an event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeliveryMode {
    #[default]
    BestEffort,
    AtLeastOnce,
    AtMostOnce,
}

impl fmt::Display for DeliveryMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::BestEffort => "best-effort",
            Self::AtLeastOnce => "at-least-once",
            Self::AtMostOnce => "at-most-once",
        })
    }
}

/// Exponential backoff policy for at-least-once delivery.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub initial_delay: Duration,
    /// Upper bound for any delay.
    pub max_delay: Duration,
    /// Growth factor between consecutive delays.
    pub backoff_multiplier: f64,
}

impl RetryPolicy {
    /// Delay to wait after the given (1-based) failed attempt:
    /// `min(max_delay, initial_delay × multiplier^(attempt-1))`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let scaled = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        if !scaled.is_finite() || scaled >= self.max_delay.as_secs_f64() {
            self.max_delay
        } else {
            Duration::from_secs_f64(scaled.max(0.0))
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(30_000),
            backoff_multiplier: 2.0,
        }
    }
}

/// Retry bookkeeping for one event id.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryState {
    pub attempts: u32,
}

// =============================================================================
// Store
// =============================================================================

/// Persistence for retry and deduplication state.
///
/// Every operation must be atomic per key from the caller's point of view.
/// External backends (Redis, SQL, ...) implement this trait; the engine only
/// ever has one attempt per event id in flight.
#[async_trait]
pub trait DeliveryStore: Send + Sync + 'static {
    async fn get_retry_state(&self, event_id: &str) -> StoreResult<Option<RetryState>>;

    async fn set_retry_state(&self, event_id: &str, state: RetryState) -> StoreResult<()>;

    async fn delete_retry_state(&self, event_id: &str) -> StoreResult<()>;

    /// Returns `true` if the id was marked and its mark has not expired.
    async fn is_duplicate(&self, event_id: &str) -> StoreResult<bool>;

    /// Marks the id as seen for `ttl`.
    async fn mark_duplicate(&self, event_id: &str, ttl: Duration) -> StoreResult<()>;
}

/// In-process delivery store with per-key last-write-wins semantics.
#[derive(Debug, Default)]
pub struct MemoryDeliveryStore {
    retries: Mutex<HashMap<String, RetryState>>,
    /// Event id to expiry instant.
    seen: Mutex<HashMap<String, Instant>>,
}

impl MemoryDeliveryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of event ids with outstanding retry state.
    pub fn retry_count(&self) -> usize {
        self.retries.lock().len()
    }
}

#[async_trait]
impl DeliveryStore for MemoryDeliveryStore {
    async fn get_retry_state(&self, event_id: &str) -> StoreResult<Option<RetryState>> {
        Ok(self.retries.lock().get(event_id).copied())
    }

    async fn set_retry_state(&self, event_id: &str, state: RetryState) -> StoreResult<()> {
        self.retries.lock().insert(event_id.to_string(), state);
        Ok(())
    }

    async fn delete_retry_state(&self, event_id: &str) -> StoreResult<()> {
        self.retries.lock().remove(event_id);
        Ok(())
    }

    async fn is_duplicate(&self, event_id: &str) -> StoreResult<bool> {
        let mut seen = self.seen.lock();
        match seen.get(event_id) {
            Some(expiry) if *expiry > Instant::now() => Ok(true),
            Some(_) => {
                seen.remove(event_id);
                Ok(false)
            }
            None => Ok(false),
        }
    }

    async fn mark_duplicate(&self, event_id: &str, ttl: Duration) -> StoreResult<()> {
        let now = Instant::now();
        let mut seen = self.seen.lock();
        seen.retain(|_, expiry| *expiry > now);
        seen.insert(event_id.to_string(), now + ttl);
        Ok(())
    }
}

// =============================================================================
// Requests & Outcomes
// =============================================================================

/// The unit of work executed on every attempt. It receives the attempt's
/// acknowledgement handle.
pub type ExecuteFn = Arc<dyn Fn(Ack) -> BoxFuture<'static, RpcResult<()>> + Send + Sync>;

/// One event to deliver.
#[derive(Clone)]
pub struct DeliveryRequest {
    pub event_id: String,
    pub mode: DeliveryMode,
    pub retry_policy: Option<RetryPolicy>,
    pub deduplication_window: Option<Duration>,
    pub execute: ExecuteFn,
}

impl DeliveryRequest {
    pub fn new<F>(event_id: impl Into<String>, mode: DeliveryMode, execute: F) -> Self
    where
        F: Fn(Ack) -> BoxFuture<'static, RpcResult<()>> + Send + Sync + 'static,
    {
        Self {
            event_id: event_id.into(),
            mode,
            retry_policy: None,
            deduplication_window: None,
            execute: Arc::new(execute),
        }
    }

    pub fn with_retry_policy(mut self, policy: Option<RetryPolicy>) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn with_deduplication_window(mut self, window: Option<Duration>) -> Self {
        self.deduplication_window = window;
        self
    }
}

impl fmt::Debug for DeliveryRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeliveryRequest")
            .field("event_id", &self.event_id)
            .field("mode", &self.mode)
            .field("retry_policy", &self.retry_policy)
            .field("deduplication_window", &self.deduplication_window)
            .finish_non_exhaustive()
    }
}

/// The delivery decision taken for one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Best-effort or at-most-once execution happened (successfully or not).
    Executed,
    /// At-most-once delivery skipped a duplicate.
    Duplicate,
    /// At-least-once attempt was acknowledged.
    Acknowledged { attempt: u32 },
    /// At-least-once attempt was not acknowledged; another one is scheduled.
    RetryScheduled { attempt: u32, delay: Duration },
    /// At-least-once delivery gave up after `attempts`.
    Exhausted { attempts: u32 },
    /// The engine is stopped; no retry was scheduled. `attempt` is 0 when
    /// the delivery task itself was torn down by the runtime.
    Stopped { attempt: u32 },
}

/// Defaults applied when a request leaves policy fields unset.
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryDefaults {
    pub retry_policy: RetryPolicy,
    pub deduplication_window: Duration,
}

impl Default for DeliveryDefaults {
    fn default() -> Self {
        Self {
            retry_policy: RetryPolicy::default(),
            deduplication_window: DEFAULT_DEDUPLICATION_WINDOW,
        }
    }
}

// =============================================================================
// Engine
// =============================================================================

struct EngineInner {
    store: Arc<dyn DeliveryStore>,
    defaults: DeliveryDefaults,
    tracker: TaskTracker,
    shutdown: CancellationToken,
}

/// Executes events under their delivery contract.
///
/// Cloning the engine yields another handle to the same engine.
#[derive(Clone)]
pub struct DeliveryEngine {
    inner: Arc<EngineInner>,
}

impl DeliveryEngine {
    /// Creates an engine over the given store.
    pub fn new(store: Arc<dyn DeliveryStore>, defaults: DeliveryDefaults) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                store,
                defaults,
                tracker: TaskTracker::new(),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Creates an engine backed by a [`MemoryDeliveryStore`].
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryDeliveryStore::new()), DeliveryDefaults::default())
    }

    pub fn defaults(&self) -> &DeliveryDefaults {
        &self.inner.defaults
    }

    /// Hands an event to the engine without waiting for it.
    ///
    /// The delivery runs on the engine's own task set: dropping the returned
    /// handle, or the future of whoever submitted the event, never cuts an
    /// attempt short.
    pub fn submit(&self, request: DeliveryRequest) -> JoinHandle<DeliveryOutcome> {
        let span = info_span!("deliver", event_id = %request.event_id, mode = %request.mode);
        let inner = Arc::clone(&self.inner);
        self.inner.tracker.spawn(inner.run(request).instrument(span))
    }

    /// Delivers an event and waits for the decision of its first attempt.
    ///
    /// For at-least-once delivery later attempts run in the background.
    /// Never fails: handler errors are logged and only affect the decision
    /// returned.
    pub async fn deliver(&self, request: DeliveryRequest) -> DeliveryOutcome {
        match self.submit(request).await {
            Ok(outcome) => outcome,
            Err(err) => {
                warn!(error = %err, "Delivery task did not complete");
                DeliveryOutcome::Stopped { attempt: 0 }
            }
        }
    }

    /// Number of deliveries and retries currently running or scheduled.
    pub fn pending_retries(&self) -> usize {
        self.inner.tracker.len()
    }

    /// Returns `true` once [`stop`](Self::stop) has been called.
    pub fn is_stopped(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Cancels every scheduled retry and waits for in-flight ones to finish.
    ///
    /// Retry state of cancelled retries stays in the store.
    pub async fn stop(&self) {
        self.inner.shutdown.cancel();
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
        debug!("Delivery engine stopped");
    }
}

impl Default for DeliveryEngine {
    fn default() -> Self {
        Self::in_memory()
    }
}

impl fmt::Debug for DeliveryEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeliveryEngine")
            .field("defaults", &self.inner.defaults)
            .field("pending_retries", &self.pending_retries())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

impl EngineInner {
    async fn run(self: Arc<Self>, request: DeliveryRequest) -> DeliveryOutcome {
        match request.mode {
            DeliveryMode::BestEffort => {
                self.execute(&request, Ack::new(1)).await;
                DeliveryOutcome::Executed
            }
            DeliveryMode::AtMostOnce => self.deliver_at_most_once(request).await,
            DeliveryMode::AtLeastOnce => self.attempt_at_least_once(Arc::new(request), 0).await,
        }
    }

    /// Runs one attempt, swallowing errors and panics. Returns `true` if the
    /// attempt was acknowledged.
    async fn execute(&self, request: &DeliveryRequest, ack: Ack) -> bool {
        let attempt = ack.attempt();
        let result = AssertUnwindSafe((request.execute)(ack.clone()))
            .catch_unwind()
            .await;

        match result {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!(attempt, error = %err, "Event handler failed"),
            Err(_) => warn!(attempt, "Event handler panicked"),
        }
        ack.is_acked()
    }

    async fn deliver_at_most_once(&self, request: DeliveryRequest) -> DeliveryOutcome {
        let event_id = request.event_id.as_str();
        match self.store.is_duplicate(event_id).await {
            Ok(false) => {}
            Ok(true) => {
                debug!("Skipping duplicate event");
                return DeliveryOutcome::Duplicate;
            }
            Err(err) => {
                // Without a reliable answer, skipping keeps the at-most-once promise.
                warn!(error = %err, "Duplicate check failed, skipping event");
                return DeliveryOutcome::Duplicate;
            }
        }

        let window = request
            .deduplication_window
            .unwrap_or(self.defaults.deduplication_window);
        if let Err(err) = self.store.mark_duplicate(event_id, window).await {
            warn!(error = %err, "Failed to mark event as seen");
        }

        self.execute(&request, Ack::new(1)).await;
        DeliveryOutcome::Executed
    }

    /// `fallback_prior` is the attempt count known to the scheduler, used
    /// when the store cannot be read.
    fn attempt_at_least_once(
        self: Arc<Self>,
        request: Arc<DeliveryRequest>,
        fallback_prior: u32,
    ) -> BoxFuture<'static, DeliveryOutcome> {
        Box::pin(async move {
            let event_id = request.event_id.as_str();
            let policy = request
                .retry_policy
                .clone()
                .unwrap_or_else(|| self.defaults.retry_policy.clone());

            let prior = match self.store.get_retry_state(event_id).await {
                Ok(state) => state.map_or(0, |s| s.attempts),
                Err(err) => {
                    warn!(error = %err, "Failed to read retry state");
                    fallback_prior
                }
            };
            let attempt = prior + 1;

            if self.execute(&request, Ack::new(attempt)).await {
                self.clear(event_id).await;
                debug!(attempt, "Event acknowledged");
                return DeliveryOutcome::Acknowledged { attempt };
            }

            if attempt >= policy.max_attempts {
                self.clear(event_id).await;
                warn!(attempts = attempt, "Giving up on event after exhausting retries");
                return DeliveryOutcome::Exhausted { attempts: attempt };
            }

            if let Err(err) = self
                .store
                .set_retry_state(event_id, RetryState { attempts: attempt })
                .await
            {
                warn!(error = %err, "Failed to persist retry state");
            }

            let delay = policy.delay_for(attempt);
            if self.schedule_retry(Arc::clone(&request), attempt, delay) {
                debug!(attempt, ?delay, "Scheduled retry");
                DeliveryOutcome::RetryScheduled { attempt, delay }
            } else {
                debug!(attempt, "Engine stopped, retry not scheduled");
                DeliveryOutcome::Stopped { attempt }
            }
        })
    }

    fn schedule_retry(self: &Arc<Self>, request: Arc<DeliveryRequest>, prior: u32, delay: Duration) -> bool {
        if self.shutdown.is_cancelled() || self.tracker.is_closed() {
            return false;
        }

        let inner = Arc::clone(self);
        let span = info_span!("retry", event_id = %request.event_id, attempt = prior + 1);
        self.tracker.spawn(
            async move {
                tokio::select! {
                    _ = inner.shutdown.cancelled() => {
                        debug!("Retry cancelled by shutdown");
                    }
                    _ = tokio::time::sleep(delay) => {
                        let outcome = Arc::clone(&inner).attempt_at_least_once(request, prior).await;
                        debug!(?outcome, "Retry finished");
                    }
                }
            }
            .instrument(span),
        );
        true
    }

    async fn clear(&self, event_id: &str) {
        if let Err(err) = self.store.delete_retry_state(event_id).await {
            warn!(error = %err, "Failed to clear retry state");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{RpcError, StoreError};
    use std::sync::atomic::{AtomicU32, Ordering};

    fn counting(counter: Arc<AtomicU32>, ack_on: Option<u32>) -> DeliveryRequest {
        DeliveryRequest::new("evt-1", DeliveryMode::AtLeastOnce, move |ack: Ack| {
            let counter = Arc::clone(&counter);
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                if Some(ack.attempt()) == ack_on {
                    ack.ack();
                }
                Err(RpcError::internal("not yet"))
            })
        })
    }

    #[test]
    fn test_backoff_delays() {
        let policy = RetryPolicy {
            max_attempts: 10,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_millis(5000),
            backoff_multiplier: 2.0,
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(500));
        assert_eq!(policy.delay_for(2), Duration::from_millis(1000));
        assert_eq!(policy.delay_for(4), Duration::from_millis(4000));
        assert_eq!(policy.delay_for(5), Duration::from_millis(5000));
        assert_eq!(policy.delay_for(60), Duration::from_millis(5000));
    }

    #[tokio::test]
    async fn test_best_effort_swallows_errors() {
        let engine = DeliveryEngine::in_memory();
        let runs = Arc::new(AtomicU32::new(0));
        let runs_clone = Arc::clone(&runs);
        let request = DeliveryRequest::new("e", DeliveryMode::BestEffort, move |_ack| {
            let runs = Arc::clone(&runs_clone);
            Box::pin(async move {
                runs.fetch_add(1, Ordering::SeqCst);
                Err(RpcError::internal("boom"))
            })
        });

        assert_eq!(engine.deliver(request).await, DeliveryOutcome::Executed);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(engine.pending_retries(), 0);
    }

    #[tokio::test]
    async fn test_panicking_handler_is_contained() {
        let engine = DeliveryEngine::in_memory();
        let request = DeliveryRequest::new("e", DeliveryMode::BestEffort, |_ack| {
            Box::pin(async move { panic!("handler bug") })
        });
        assert_eq!(engine.deliver(request).await, DeliveryOutcome::Executed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_at_least_once_exhausts_with_backoff() {
        let store = Arc::new(MemoryDeliveryStore::new());
        let engine = DeliveryEngine::new(store.clone(), DeliveryDefaults::default());
        let times = Arc::new(Mutex::new(Vec::new()));
        let times_clone = Arc::clone(&times);
        let start = Instant::now();

        let request = DeliveryRequest::new("evt", DeliveryMode::AtLeastOnce, move |_ack| {
            let times = Arc::clone(&times_clone);
            Box::pin(async move {
                times.lock().push(start.elapsed());
                Ok(())
            })
        })
        .with_retry_policy(Some(RetryPolicy {
            max_attempts: 3,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_millis(5000),
            backoff_multiplier: 2.0,
        }));

        let first = engine.deliver(request).await;
        assert_eq!(
            first,
            DeliveryOutcome::RetryScheduled {
                attempt: 1,
                delay: Duration::from_millis(500)
            }
        );
        assert_eq!(store.retry_count(), 1);

        tokio::time::sleep(Duration::from_secs(30)).await;

        assert_eq!(
            *times.lock(),
            vec![
                Duration::ZERO,
                Duration::from_millis(500),
                Duration::from_millis(1500)
            ]
        );
        assert_eq!(store.retry_count(), 0);
        assert_eq!(engine.pending_retries(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_at_least_once_stops_on_ack() {
        let store = Arc::new(MemoryDeliveryStore::new());
        let engine = DeliveryEngine::new(store.clone(), DeliveryDefaults::default());
        let runs = Arc::new(AtomicU32::new(0));

        let request = counting(Arc::clone(&runs), Some(2))
            .with_retry_policy(Some(RetryPolicy {
                max_attempts: 5,
                ..RetryPolicy::default()
            }));
        engine.deliver(request).await;
        tokio::time::sleep(Duration::from_secs(120)).await;

        // Errors after ack do not cause further retries.
        assert_eq!(runs.load(Ordering::SeqCst), 2);
        assert_eq!(store.retry_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_caller_does_not_lose_event() {
        let engine = DeliveryEngine::in_memory();
        let runs = Arc::new(AtomicU32::new(0));
        let runs_clone = Arc::clone(&runs);
        let request = DeliveryRequest::new("slow", DeliveryMode::AtLeastOnce, move |ack: Ack| {
            let runs = Arc::clone(&runs_clone);
            Box::pin(async move {
                if runs.fetch_add(1, Ordering::SeqCst) == 0 {
                    tokio::time::sleep(Duration::from_millis(200)).await;
                } else {
                    ack.ack();
                }
                Ok(())
            })
        })
        .with_retry_policy(Some(RetryPolicy {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            backoff_multiplier: 2.0,
        }));

        let abandoned = tokio::time::timeout(Duration::from_millis(50), engine.deliver(request)).await;
        assert!(abandoned.is_err());

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 2);
        assert_eq!(engine.pending_retries(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_at_most_once_window() {
        let engine = DeliveryEngine::in_memory();
        let runs = Arc::new(AtomicU32::new(0));
        let make = |runs: Arc<AtomicU32>| {
            DeliveryRequest::new("dup", DeliveryMode::AtMostOnce, move |_ack| {
                let runs = Arc::clone(&runs);
                Box::pin(async move {
                    runs.fetch_add(1, Ordering::SeqCst);
                    Err(RpcError::internal("failure does not matter"))
                })
            })
            .with_deduplication_window(Some(Duration::from_millis(1000)))
        };

        assert_eq!(engine.deliver(make(runs.clone())).await, DeliveryOutcome::Executed);
        tokio::time::advance(Duration::from_millis(400)).await;
        assert_eq!(engine.deliver(make(runs.clone())).await, DeliveryOutcome::Duplicate);
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        tokio::time::advance(Duration::from_millis(700)).await;
        assert_eq!(engine.deliver(make(runs.clone())).await, DeliveryOutcome::Executed);
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_cancels_pending_retries() {
        let store = Arc::new(MemoryDeliveryStore::new());
        let engine = DeliveryEngine::new(store.clone(), DeliveryDefaults::default());
        let runs = Arc::new(AtomicU32::new(0));

        engine.deliver(counting(Arc::clone(&runs), None)).await;
        assert_eq!(engine.pending_retries(), 1);

        engine.stop().await;
        assert!(engine.is_stopped());
        assert_eq!(engine.pending_retries(), 0);

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        // The state of the cancelled retry survives for a persistent store to resume.
        assert_eq!(store.retry_count(), 1);
    }

    struct BrokenStore;

    #[async_trait]
    impl DeliveryStore for BrokenStore {
        async fn get_retry_state(&self, _: &str) -> StoreResult<Option<RetryState>> {
            Err(StoreError::Unavailable("down".into()))
        }
        async fn set_retry_state(&self, _: &str, _: RetryState) -> StoreResult<()> {
            Err(StoreError::Unavailable("down".into()))
        }
        async fn delete_retry_state(&self, _: &str) -> StoreResult<()> {
            Err(StoreError::Unavailable("down".into()))
        }
        async fn is_duplicate(&self, _: &str) -> StoreResult<bool> {
            Err(StoreError::Unavailable("down".into()))
        }
        async fn mark_duplicate(&self, _: &str, _: Duration) -> StoreResult<()> {
            Err(StoreError::Unavailable("down".into()))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_store_failures_degrade_gracefully() {
        let engine = DeliveryEngine::new(Arc::new(BrokenStore), DeliveryDefaults::default());
        let runs = Arc::new(AtomicU32::new(0));

        // At-least-once still terminates by carrying the attempt count itself.
        engine.deliver(counting(Arc::clone(&runs), None)).await;
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 3);

        let request = DeliveryRequest::new("x", DeliveryMode::AtMostOnce, |_ack| {
            Box::pin(async { Ok(()) })
        });
        assert_eq!(engine.deliver(request).await, DeliveryOutcome::Duplicate);
    }
}
