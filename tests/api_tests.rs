//! HTTP surface tests using in-process router dispatch.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use tempfile::TempDir;
use tower::ServiceExt;

use telsink::api::{create_router, AppState};
use telsink::metrics::SinkMetrics;
use telsink::partition::PartitionTemplate;
use telsink::queue::IntakeQueue;
use telsink::session::{SessionConfig, SessionManager};
use telsink::store::ParquetStore;

fn app_state() -> (Arc<AppState<ParquetStore>>, TempDir) {
    let dir = TempDir::new().unwrap();
    let metrics = Arc::new(SinkMetrics::new());
    let store = Arc::new(ParquetStore::new(dir.path()));
    let queue = Arc::new(IntakeQueue::new(Arc::clone(&metrics.intake)));
    let sessions = Arc::new(SessionManager::new(
        store,
        PartitionTemplate::parse("").unwrap(),
        SessionConfig {
            output_path: "out".into(),
            file_prefix: "telemetry".into(),
            file_extension: "parquet".into(),
            force_immediate_flush: false,
        },
        Arc::clone(&metrics),
    ));
    (
        Arc::new(AppState {
            queue,
            sessions,
            metrics,
        }),
        dir,
    )
}

#[tokio::test]
async fn health_returns_ok() {
    let (state, _dir) = app_state();
    let router = create_router(state);

    let response = router
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn ingest_enqueues_and_is_always_accepted() {
    let (state, _dir) = app_state();
    let router = create_router(Arc::clone(&state));

    let response = router
        .clone()
        .oneshot(
            Request::post("/ingest")
                .body(Body::from(r#"{"vehicle_id":123,"g_force":2.5}"#))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);

    // Even a non-JSON body is accepted; partition fallback handles it later.
    let response = router
        .oneshot(Request::post("/ingest").body(Body::from("not json")).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);

    assert_eq!(state.queue.len(), 2);
    assert_eq!(state.metrics.snapshot().records_received, 2);
}

#[tokio::test]
async fn metrics_exposes_prometheus_counters() {
    let (state, _dir) = app_state();
    state.queue.enqueue(bytes::Bytes::from_static(b"{}"));
    let router = create_router(Arc::clone(&state));

    let response = router
        .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let text = String::from_utf8(body.to_vec()).unwrap();
    assert!(text.contains("telsink_records_received_total 1"));
    assert!(text.contains("telsink_queue_depth 1"));
    assert!(text.contains("telsink_enqueue_latency_us_bucket"));
}

#[tokio::test]
async fn stats_reports_counters_and_session() {
    let (state, _dir) = app_state();
    state.queue.enqueue(bytes::Bytes::from_static(b"{}"));
    let router = create_router(Arc::clone(&state));

    let response = router
        .oneshot(Request::get("/stats").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["records_received"], 1);
    assert_eq!(json["queue_depth"], 1);
    assert!(json["session"].is_null());
}
