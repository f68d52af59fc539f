//! Built-in interceptors.

use std::time::Duration;

use switchyard_core::{Envelope, Interceptor, Next, Outcome, RpcError, RpcResult, async_trait};
use tokio::time::Instant;
use tracing::{Instrument, debug, info_span, warn};

// ============================================================================
// Timeout
// ============================================================================

/// Enforces a deadline on everything inward of it.
///
/// The interceptor derives a context with the deadline, races the rest of
/// the chain against it and, on expiry, cancels the call's signal and fails
/// with [`RpcError::DeadlineExceeded`]. An earlier deadline already present
/// on the context wins.
#[derive(Debug, Clone, Copy)]
pub struct Timeout {
    duration: Duration,
}

pub fn timeout(duration: Duration) -> Timeout {
    Timeout { duration }
}

#[async_trait]
impl Interceptor for Timeout {
    async fn intercept(&self, envelope: Envelope, next: Next) -> RpcResult<Outcome> {
        let ctx = envelope.context().with_timeout(self.duration);
        let Some(deadline) = ctx.deadline() else {
            return next.run(envelope).await;
        };

        let run = next.run(envelope.with_context(ctx.clone()));
        tokio::select! {
            result = run => result,
            _ = tokio::time::sleep_until(deadline) => {
                debug!(request_id = ctx.request_id(), "Deadline exceeded, cancelling");
                ctx.cancel();
                Err(RpcError::DeadlineExceeded)
            }
        }
    }
}

// ============================================================================
// Trace
// ============================================================================

/// Opens a child trace span for the call and logs its outcome.
#[derive(Debug, Clone, Copy, Default)]
pub struct Trace;

pub fn trace() -> Trace {
    Trace
}

#[async_trait]
impl Interceptor for Trace {
    async fn intercept(&self, envelope: Envelope, next: Next) -> RpcResult<Outcome> {
        let tracing = envelope.context().tracing().child();
        let span = info_span!(
            "call",
            procedure = %envelope.procedure(),
            kind = %envelope.kind(),
            request_id = %envelope.context().request_id(),
            trace_id = %tracing.trace_id,
            span_id = %tracing.span_id,
        );
        let ctx = envelope.context().with_tracing(tracing);
        let start = Instant::now();

        let result = next.run(envelope.with_context(ctx)).instrument(span.clone()).await;

        let elapsed = start.elapsed();
        let _enter = span.enter();
        match &result {
            Ok(_) => debug!(?elapsed, "Call completed"),
            Err(err) if err.is_cancelled() => debug!(?elapsed, error = %err, "Call cancelled"),
            Err(err) => warn!(?elapsed, error = %err, "Call failed"),
        }
        result
    }
}
