//! Health endpoint
//!
//! `GET /health` reports whether the last discovery succeeded; `GET /stats`
//! returns every pipeline counter.

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde_json::json;
use std::sync::Arc;
use tower_http::{
    classify::{ServerErrorsAsFailures, SharedClassifier},
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};
use tokio_util::sync::CancellationToken;
use tracing::{info, Level};

use crate::stats::Stats;

#[derive(Clone)]
struct HealthState {
    stats: Arc<Stats>,
    source: &'static str,
}

pub fn router(stats: Arc<Stats>, source: &'static str) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/stats", get(get_stats))
        .with_state(HealthState { stats, source })
        .layer(tracing_layer())
}

/// Request logging for the health endpoint
pub fn tracing_layer() -> TraceLayer<SharedClassifier<ServerErrorsAsFailures>> {
    TraceLayer::new_for_http()
        .make_span_with(DefaultMakeSpan::new().level(Level::DEBUG))
        .on_response(
            DefaultOnResponse::new()
                .level(Level::DEBUG)
                .latency_unit(tower_http::LatencyUnit::Micros),
        )
}

/// Serve `router` on `listener` until `shutdown` is cancelled.
pub async fn serve(
    listener: tokio::net::TcpListener,
    router: Router,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!("Health endpoint listening on {}", addr);
    }
    axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}

async fn health_check(State(state): State<HealthState>) -> Response {
    let snapshot = state.stats.snapshot();
    let body = |status: &str| {
        Json(json!({
            "status": status,
            "source": state.source,
            "files_in_flight": snapshot.fetcher.files_in_flight,
            "queue_depth": snapshot.shipper.queue_depth,
        }))
    };

    if snapshot.fetcher.source_healthy {
        (StatusCode::OK, body("healthy")).into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, body("unhealthy")).into_response()
    }
}

async fn get_stats(State(state): State<HealthState>) -> Response {
    (StatusCode::OK, Json(state.stats.snapshot())).into_response()
}
