use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use serde::Serialize;

use crate::contracts::SegmentStore;
use crate::metrics::{MetricsSnapshot, SinkMetrics};
use crate::queue::IntakeQueue;
use crate::session::{SessionInfo, SessionManager};

/// Application state shared across handlers.
pub struct AppState<S: SegmentStore> {
    pub queue: Arc<IntakeQueue>,
    pub sessions: Arc<SessionManager<S>>,
    pub metrics: Arc<SinkMetrics>,
}

/// Stats payload: headline counters plus the open session, if any.
#[derive(Debug, Clone, Serialize)]
pub struct StatsResponse {
    #[serde(flatten)]
    pub counters: MetricsSnapshot,
    pub session: Option<SessionInfo>,
}

/// GET /health
pub async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

/// POST /ingest — one raw JSON record per request body.
///
/// Always accepted: enqueue has no failure mode visible to producers.
pub async fn ingest<S: SegmentStore>(
    State(state): State<Arc<AppState<S>>>,
    body: Bytes,
) -> impl IntoResponse {
    state.queue.enqueue(body);
    StatusCode::ACCEPTED
}

/// GET /metrics — Prometheus exposition format.
pub async fn metrics<S: SegmentStore>(State(state): State<Arc<AppState<S>>>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.format_prometheus(),
    )
}

/// GET /stats — JSON counters plus the open session.
pub async fn stats<S: SegmentStore>(State(state): State<Arc<AppState<S>>>) -> impl IntoResponse {
    let response = StatsResponse {
        counters: state.metrics.snapshot(),
        session: state.sessions.current().await,
    };
    Json(response)
}
