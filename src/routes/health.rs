use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use chrono::Utc;
use serde_json::json;

use crate::{
    shortcode::GenerateShortcode,
    state::AppState,
    storage::{LinkStore, RealtimeCache},
};

/// GET /health - liveness only, no dependency checks.
pub async fn health() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "timestamp": Utc::now().to_rfc3339(),
    }))
}

/// GET /ready - readiness including store and KV connectivity.
pub async fn readiness<Gen, Store, Kv>(
    State(state): State<AppState<Gen, Store, Kv>>,
) -> impl IntoResponse
where
    Gen: GenerateShortcode + Clone + Send + Sync + 'static,
    Store: LinkStore + Clone + Send + Sync + 'static,
    Kv: RealtimeCache + Clone + Send + Sync + 'static,
{
    let database = state.store.ping().await.is_ok();
    let kv = state.kv.ping().await.is_ok();

    let status = if database && kv {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(json!({
            "status": { "database": database, "redis": kv },
            "ready": database && kv,
            "timestamp": Utc::now().to_rfc3339(),
        })),
    )
}

/// GET /metrics - application counters and subsystem gauges.
pub async fn metrics<Gen, Store, Kv>(
    State(state): State<AppState<Gen, Store, Kv>>,
) -> impl IntoResponse
where
    Gen: GenerateShortcode + Clone + Send + Sync + 'static,
    Store: LinkStore + Clone + Send + Sync + 'static,
    Kv: RealtimeCache + Clone + Send + Sync + 'static,
{
    let snapshot = state.metrics.snapshot();

    Json(json!({
        "uptime_seconds": snapshot.uptime_seconds,
        "requests": {
            "total": snapshot.requests_total,
            "errors": snapshot.errors_total,
            "error_rate_percent": snapshot.error_rate_percent,
        },
        "queue": {
            "depth": state.click_queue.len(),
            "capacity": state.click_queue.capacity(),
            "dropped": state.click_queue.dropped_count(),
        },
        "cache": {
            "l1_size": state.resolver.cache().len(),
        },
        "broker": {
            "channels": state.broker.channel_count(),
            "subscribers": state.broker.subscriber_count(),
        },
    }))
}
