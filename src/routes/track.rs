use std::net::SocketAddr;

use axum::{
    Json,
    extract::{ConnectInfo, Path, State},
    http::{HeaderMap, header},
    response::IntoResponse,
};
use serde_json::json;

use crate::{
    analytics::ClickEvent,
    error::ApiError,
    resolver::ResolveError,
    routes::redirect::extract_client_ip,
    shortcode::GenerateShortcode,
    state::AppState,
    storage::{LinkStore, RealtimeCache, redis::realtime_counter_key},
};

/// POST /api/track/{code}
///
/// Alternate ingestion path used by the frontend before it performs the
/// redirect itself. Unlike the hot path this endpoint confirms the link
/// exists, so the caller learns about dead codes.
pub async fn track_click<Gen, Store, Kv>(
    Path(code): Path<String>,
    State(state): State<AppState<Gen, Store, Kv>>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError>
where
    Gen: GenerateShortcode + Clone + Send + Sync + 'static,
    Store: LinkStore + Clone + Send + Sync + 'static,
    Kv: RealtimeCache + Clone + Send + Sync + 'static,
{
    state.metrics.record_request();

    match state.resolver.resolve(&code).await {
        Ok(_) => {}
        Err(ResolveError::NotFound) => return Err(ApiError::NotFound),
        Err(ResolveError::Unavailable(e)) => {
            state.metrics.record_error();
            return Err(ApiError::Internal(e));
        }
    }

    let ip_address = extract_client_ip(&headers, remote);
    let user_agent = headers
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    let referer = headers
        .get(header::REFERER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();

    state
        .click_queue
        .offer(ClickEvent::new(code.clone(), ip_address, user_agent, referer));

    if let Err(e) = state.kv.incr(&realtime_counter_key(&code)).await {
        tracing::warn!(error = %e, short_code = %code, "Failed to bump realtime counter");
    }

    Ok(Json(json!({ "status": "tracked" })))
}
