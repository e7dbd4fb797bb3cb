//! Integration tests for the worker's HTTP endpoints and service wiring.

use std::sync::Arc;
use std::sync::OnceLock;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use messaging::{EventEnvelope, InMemoryBroker};
use metrics_exporter_prometheus::PrometheusHandle;
use saga_store::{
    InMemorySagaStore, SagaInstance, SagaKey, SagaStatus, SagaStore, StepOutcome, StepPhase,
    StepRecord,
};
use tokio::sync::watch;
use tower::ServiceExt;
use worker::config::Config;
use worker::routes::sagas::AppState;

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

fn get_metrics_handle() -> PrometheusHandle {
    METRICS_HANDLE
        .get_or_init(|| {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            builder
                .install_recorder()
                .expect("failed to install Prometheus recorder")
        })
        .clone()
}

fn setup() -> (axum::Router, InMemorySagaStore) {
    let store = InMemorySagaStore::new();
    let app = worker::create_app(Arc::new(AppState::new(store.clone())), get_metrics_handle());
    (app, store)
}

async fn get_json(app: &axum::Router, uri: &str) -> (StatusCode, serde_json::Value) {
    let response = app
        .clone()
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json = serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null);
    (status, json)
}

/// Stores a saga that ended in `Failed` after its compensation gave up.
async fn seed_failed(store: &InMemorySagaStore, key: &str) {
    let mut saga = SagaInstance::new(SagaKey::new(key), "booking-confirmation", serde_json::json!({}));
    saga.status = SagaStatus::Failed;
    saga.failure_reason = Some("compensation of reserve_seats failed after 3 attempt(s)".into());

    let mut reserve = StepRecord::started(0, "reserve_seats", StepPhase::Forward);
    reserve.outcome = Some(StepOutcome::Success);
    let mut capture = StepRecord::started(1, "capture_payment", StepPhase::Forward);
    capture.outcome = Some(StepOutcome::TimedOut);
    capture.attempts = 4;
    let mut release = StepRecord::started(0, "reserve_seats", StepPhase::Compensation);
    release.outcome = Some(StepOutcome::Failed);
    release.attempts = 3;
    saga.step_outcomes = vec![reserve, capture, release];

    store.create(saga).await.unwrap();
}

#[tokio::test]
async fn test_health_check() {
    let (app, _) = setup();

    let (status, json) = get_json(&app, "/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "ok");
    assert_eq!(json["store"], "up");
}

#[tokio::test]
async fn test_metrics_endpoint() {
    let (app, _) = setup();

    let response = app
        .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let content_type = response.headers()["content-type"].to_str().unwrap();
    assert!(content_type.starts_with("text/plain"));
}

#[tokio::test]
async fn test_get_saga_shows_step_history() {
    let (app, store) = setup();
    seed_failed(&store, "booking-7").await;

    let (status, json) = get_json(&app, "/sagas/booking-7").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["saga_id"], "booking-7");
    assert_eq!(json["status"], "FAILED");
    assert_eq!(json["version"], 1);
    assert!(json["failure_reason"].as_str().unwrap().contains("reserve_seats"));

    let steps = json["steps"].as_array().unwrap();
    assert_eq!(steps.len(), 3);
    assert_eq!(steps[1]["outcome"], "TIMED_OUT");
    assert_eq!(steps[1]["attempts"], 4);
    assert_eq!(steps[2]["phase"], "compensation");
    assert_eq!(steps[2]["dispatched"], false);
    assert!(json["deadline_at"].is_null());
}

#[tokio::test]
async fn test_get_unknown_saga_is_404() {
    let (app, _) = setup();

    let (status, json) = get_json(&app, "/sagas/nope").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(json["error"].as_str().unwrap().contains("nope"));
}

#[tokio::test]
async fn test_list_sagas_by_status() {
    let (app, store) = setup();
    seed_failed(&store, "booking-1").await;
    seed_failed(&store, "booking-2").await;
    store
        .create(SagaInstance::new(
            SagaKey::new("booking-3"),
            "booking-confirmation",
            serde_json::json!({}),
        ))
        .await
        .unwrap();

    let (status, json) = get_json(&app, "/sagas?status=failed").await;
    assert_eq!(status, StatusCode::OK);
    let mut ids: Vec<&str> = json
        .as_array()
        .unwrap()
        .iter()
        .map(|s| s["saga_id"].as_str().unwrap())
        .collect();
    ids.sort();
    assert_eq!(ids, vec!["booking-1", "booking-2"]);

    let (_, all) = get_json(&app, "/sagas?limit=2").await;
    assert_eq!(all.as_array().unwrap().len(), 2);

    let (_, none) = get_json(&app, "/sagas?definition=booking-expiry").await;
    assert!(none.as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_list_sagas_rejects_unknown_status() {
    let (app, _) = setup();

    let (status, json) = get_json(&app, "/sagas?status=sleeping").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(json["error"].as_str().unwrap().contains("sleeping"));
}

#[tokio::test]
async fn test_services_complete_a_booking_in_memory() {
    let store = InMemorySagaStore::new();
    let broker = InMemoryBroker::new();
    let config = Config {
        partition_workers: 2,
        ..Config::default()
    };
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let services = worker::runtime::spawn_services(
        &config,
        store.clone(),
        Arc::new(broker.clone()),
        broker.clone(),
        &shutdown_rx,
    )
    .unwrap();
    assert!(services.simulated_executor().is_some());

    let trigger = EventEnvelope::new(
        "payment.succeeded",
        serde_json::json!({"booking_id": "booking-42", "amount_cents": 5000}),
    );
    broker
        .inject("booking.payment.succeeded", &trigger)
        .await
        .unwrap();

    let app = worker::create_app(Arc::new(AppState::new(store.clone())), get_metrics_handle());
    let mut last = serde_json::Value::Null;
    for _ in 0..300 {
        let (status, json) = get_json(&app, "/sagas/booking-42").await;
        if status == StatusCode::OK && json["status"] == "COMPLETED" {
            last = json;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(last["definition_name"], "booking-confirmation");
    assert_eq!(last["steps"].as_array().unwrap().len(), 3);
    assert!(last["deadline_at"].is_null());

    let executed = services
        .simulated_executor()
        .unwrap()
        .executed_steps("booking.confirm")
        .await;
    assert_eq!(executed, vec![("confirm_booking".to_string(), 1)]);

    shutdown_tx.send(true).unwrap();
    services.join().await;
}
