//! End-to-end dispatch scenarios through the public facade.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use switchyard::core::error::{CANCELLED, DEADLINE_EXCEEDED, INVALID_ARGUMENT, NOT_FOUND};
use switchyard::prelude::*;
use tokio::time::Instant;
use tower::ServiceExt;

#[derive(Deserialize)]
struct AddRequest {
    a: i64,
    b: i64,
}

#[derive(Serialize)]
struct AddResponse {
    result: i64,
}

fn math_router() -> Router {
    let router = Router::default();
    router
        .register_procedure(
            "math.add",
            typed::procedure(|req: AddRequest, _ctx: Context| async move {
                Ok::<_, RpcError>(AddResponse { result: req.a + req.b })
            }),
            HandlerMeta::described("Adds two integers"),
        )
        .unwrap();
    router
}

#[tokio::test]
async fn unary_call_returns_response_with_request_id() {
    let router = math_router();
    let request = Envelope::request("math.add", json!({"a": 5, "b": 3}));
    let id = request.id().to_string();

    let response = router.dispatch(request).await.into_response().unwrap();

    assert_eq!(response.kind(), EnvelopeType::Response);
    assert_eq!(response.id(), id);
    assert_eq!(response.procedure(), "math.add");
    assert_eq!(response.payload(), &json!({"result": 8}));
}

#[tokio::test]
async fn typed_payload_mismatch_is_invalid_argument() {
    let router = math_router();
    let response = router
        .dispatch(Envelope::request("math.add", json!({"a": "five"})))
        .await
        .into_response()
        .unwrap();

    assert_eq!(response.kind(), EnvelopeType::Error);
    assert_eq!(response.payload()["code"], INVALID_ARGUMENT);
    assert_eq!(response.payload()["status"], 400);
}

#[tokio::test]
async fn unknown_procedure_is_not_found() {
    let router = math_router();
    let response = router
        .dispatch(Envelope::request("math.mul", json!({"a": 2, "b": 2})))
        .await
        .into_response()
        .unwrap();

    assert_eq!(response.kind(), EnvelopeType::Error);
    assert_eq!(response.payload()["code"], NOT_FOUND);
    assert_eq!(response.payload()["status"], 404);
}

#[tokio::test]
async fn reregistration_replaces_handler_and_strict_mode_rejects_it() {
    let router = Router::default();
    let greet = |greeting: &'static str| {
        move |payload: Value, _ctx: Context| async move {
            Ok::<_, RpcError>(json!(format!("{greeting}, {}", payload.as_str().unwrap_or("?"))))
        }
    };

    router.register_procedure("greet", greet("Hello"), HandlerMeta::default()).unwrap();
    router.register_procedure("greet", greet("Howdy"), HandlerMeta::default()).unwrap();
    let response = router
        .dispatch(Envelope::request("greet", json!("Ada")))
        .await
        .into_response()
        .unwrap();
    assert_eq!(response.payload(), &json!("Howdy, Ada"));
    assert_eq!(router.stats().procedures, 1);

    let strict = Router::new(RouterConfig {
        registry_mode: RegistryMode::Strict,
        ..RouterConfig::default()
    });
    strict.register_procedure("greet", greet("Hello"), HandlerMeta::default()).unwrap();
    assert!(strict.register_procedure("greet", greet("Howdy"), HandlerMeta::default()).is_err());
}

#[tokio::test]
async fn counter_stream_yields_values_then_done() {
    let router = Router::default();
    router
        .register_stream(
            "counter",
            |payload: Value, _ctx: Context| {
                let count = payload["count"].as_u64().unwrap_or_default();
                futures::stream::iter(
                    (1..=count).map(move |i| Ok::<_, RpcError>(json!({ "value": i, "total": count }))),
                )
            },
            HandlerMeta::default(),
        )
        .unwrap();

    let stream = router
        .dispatch(Envelope::stream_start("counter", json!({"count": 3})))
        .await
        .into_stream()
        .unwrap();

    for expected in [
        json!({"value": 1, "total": 3}),
        json!({"value": 2, "total": 3}),
        json!({"value": 3, "total": 3}),
    ] {
        let chunk = stream.read().await.unwrap();
        assert!(!chunk.done);
        assert_eq!(chunk.value, Some(expected));
    }
    assert!(stream.read().await.unwrap().done);
    assert!(stream.read().await.unwrap().done);

    router.shutdown().await;
    assert_eq!(router.active_streams(), 0);
}

#[tokio::test]
async fn cancelling_a_stream_stops_the_producer() {
    let router = Router::default();
    let produced = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&produced);
    router
        .register_stream(
            "ticks",
            move |_payload: Value, _ctx: Context| {
                let counter = Arc::clone(&counter);
                futures::stream::unfold(0u64, move |i| {
                    let counter = Arc::clone(&counter);
                    async move {
                        tokio::time::sleep(Duration::from_millis(5)).await;
                        counter.fetch_add(1, Ordering::SeqCst);
                        Some((Ok::<_, RpcError>(json!(i)), i + 1))
                    }
                })
            },
            HandlerMeta::default(),
        )
        .unwrap();

    let stream = router
        .dispatch(Envelope::stream_start("ticks", Value::Null).with_metadata("priority", "3"))
        .await
        .into_stream()
        .unwrap();
    assert_eq!(stream.priority(), 3);
    assert_eq!(stream.read().await.unwrap().value, Some(json!(0)));

    router.stream(stream.id()).unwrap().cancel("client went away");
    let err = stream.read().await.unwrap_err();
    assert_eq!(err.to_payload().code, CANCELLED);

    router.shutdown().await;
    let after_shutdown = produced.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(produced.load(Ordering::SeqCst), after_shutdown);
}

#[tokio::test]
async fn interceptors_run_outermost_first() {
    let router = math_router();
    let log = Arc::new(Mutex::new(Vec::new()));
    for name in ["auth", "metrics", "audit"] {
        let log = Arc::clone(&log);
        router.use_interceptor(from_fn(move |envelope: Envelope, next: Next| {
            let log = Arc::clone(&log);
            async move {
                log.lock().push(format!("{name}:before"));
                let outcome = next.run(envelope).await;
                log.lock().push(format!("{name}:after"));
                outcome
            }
        }));
    }

    router.dispatch(Envelope::request("math.add", json!({"a": 1, "b": 2}))).await;
    assert_eq!(
        *log.lock(),
        vec![
            "auth:before",
            "metrics:before",
            "audit:before",
            "audit:after",
            "metrics:after",
            "auth:after",
        ]
    );
}

#[tokio::test]
async fn pattern_scoped_interceptor_short_circuits_matching_procedures() {
    let router = math_router();
    router
        .register_procedure(
            "admin.reset",
            |_payload: Value, _ctx: Context| async move { Ok::<_, RpcError>(json!("reset")) },
            HandlerMeta::default(),
        )
        .unwrap();
    router.use_interceptor(for_pattern(
        "admin.*",
        from_fn(|_envelope: Envelope, _next: Next| async move {
            Err::<Outcome, _>(RpcError::Application(ApplicationError::new(
                "UNAUTHENTICATED",
                401,
                "admin access required",
            )))
        }),
    ));

    let denied = router
        .dispatch(Envelope::request("admin.reset", Value::Null))
        .await
        .into_response()
        .unwrap();
    assert_eq!(denied.payload()["code"], "UNAUTHENTICATED");

    let allowed = router
        .dispatch(Envelope::request("math.add", json!({"a": 2, "b": 2})))
        .await
        .into_response()
        .unwrap();
    assert_eq!(allowed.payload(), &json!({"result": 4}));
}

#[tokio::test(start_paused = true)]
async fn timeout_interceptor_cancels_slow_handlers() {
    let router = Router::default();
    router
        .register_procedure(
            "slow",
            |_payload: Value, ctx: Context| async move {
                ctx.cancelled().await;
                Err::<Value, _>(RpcError::cancelled("observed cancellation"))
            },
            HandlerMeta::default(),
        )
        .unwrap();
    router.use_interceptor(timeout(Duration::from_millis(250)));

    let started = Instant::now();
    let response = router
        .dispatch(Envelope::request("slow", Value::Null))
        .await
        .into_response()
        .unwrap();
    assert_eq!(response.payload()["code"], DEADLINE_EXCEEDED);
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(250) && elapsed < Duration::from_millis(300));
}

#[tokio::test(start_paused = true)]
async fn at_most_once_skips_duplicate_event_ids() {
    let router = Router::default();
    let runs = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&runs);
    router
        .register_event(
            "user.created",
            move |_payload: Value, _ctx: Context, _ack: Ack| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, RpcError>(())
                }
            },
            EventMeta::new(DeliveryMode::AtMostOnce),
        )
        .unwrap();

    for _ in 0..3 {
        let outcome = router
            .dispatch(Envelope::event("user.created", json!({"id": 7})).with_id("evt-7"))
            .await;
        assert!(outcome.is_accepted());
    }
    router
        .dispatch(Envelope::event("user.created", json!({"id": 8})).with_id("evt-8"))
        .await;

    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(runs.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn at_least_once_retries_with_exponential_backoff() {
    let router = Router::default();
    let attempts = Arc::new(Mutex::new(Vec::new()));
    let log = Arc::clone(&attempts);
    let origin = Instant::now();
    router
        .register_event(
            "invoice.due",
            move |_payload: Value, _ctx: Context, ack: Ack| {
                let log = Arc::clone(&log);
                async move {
                    log.lock().push((ack.attempt(), origin.elapsed()));
                    Err::<(), _>(RpcError::internal("mailer offline"))
                }
            },
            EventMeta::new(DeliveryMode::AtLeastOnce).with_retry_policy(RetryPolicy {
                max_attempts: 3,
                initial_delay: Duration::from_millis(1000),
                max_delay: Duration::from_secs(30),
                backoff_multiplier: 2.0,
            }),
        )
        .unwrap();

    let outcome = router.dispatch(Envelope::event("invoice.due", json!({"invoice": 42}))).await;
    assert!(outcome.is_accepted());

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(
        *attempts.lock(),
        vec![
            (1, Duration::ZERO),
            (2, Duration::from_millis(1000)),
            (3, Duration::from_millis(3000)),
        ]
    );
    assert_eq!(router.delivery().pending_retries(), 0);
}

#[tokio::test]
async fn router_service_dispatches_through_tower() {
    let svc = RouterService::new(math_router()).boxed();

    let outcome = svc
        .clone()
        .oneshot(Envelope::request("math.add", json!({"a": 20, "b": 22})))
        .await
        .unwrap();
    assert_eq!(outcome.into_response().unwrap().payload(), &json!({"result": 42}));

    let missing = svc.oneshot(Envelope::request("nope", Value::Null)).await.unwrap();
    assert_eq!(missing.into_response().unwrap().payload()["code"], NOT_FOUND);
}
