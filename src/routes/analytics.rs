use std::{convert::Infallible, time::Duration};

use axum::{
    Json,
    extract::{Path, Query, State},
    response::{
        IntoResponse,
        sse::{Event, KeepAlive, Sse},
    },
};
use chrono::Utc;
use futures::{Stream, StreamExt, future, stream};
use serde::{Deserialize, Serialize};

use crate::{
    broker::StatsUpdate,
    error::ApiError,
    resolver::ResolveError,
    shortcode::GenerateShortcode,
    state::AppState,
    storage::{
        LinkStats, LinkStore, RealtimeCache, ReferrerCount, StatsPeriod, TimePoint,
        redis::realtime_counter_key,
    },
};

/// How many referrers the aggregate endpoint returns.
const TOP_REFERRERS_LIMIT: i64 = 10;
/// Interval between `: heartbeat` comment frames on the stream.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Deserialize)]
pub struct AnalyticsQuery {
    pub period: Option<String>,
}

#[derive(Serialize)]
pub struct AnalyticsResponse {
    pub short_code: String,
    pub total_clicks: i64,
    pub unique_visitors: i64,
    pub clicks_over_time: Vec<TimePoint>,
    pub top_referrers: Vec<ReferrerCount>,
    pub click_rate: f64,
    pub peak_hour: Option<TimePoint>,
}

/// GET /api/analytics/{code}?period=24h|7d|30d
pub async fn get_analytics<Gen, Store, Kv>(
    Path(code): Path<String>,
    Query(query): Query<AnalyticsQuery>,
    State(state): State<AppState<Gen, Store, Kv>>,
) -> Result<impl IntoResponse, ApiError>
where
    Gen: GenerateShortcode + Clone + Send + Sync + 'static,
    Store: LinkStore + Clone + Send + Sync + 'static,
    Kv: RealtimeCache + Clone + Send + Sync + 'static,
{
    state.metrics.record_request();

    let period = match query.period.as_deref() {
        None => StatsPeriod::Last24Hours,
        Some(s) => StatsPeriod::parse(s)
            .ok_or(ApiError::BadRequest("Invalid period. Use 24h, 7d, or 30d"))?,
    };

    match state.resolver.resolve(&code).await {
        Ok(_) => {}
        Err(ResolveError::NotFound) => return Err(ApiError::NotFound),
        Err(ResolveError::Unavailable(e)) => {
            state.metrics.record_error();
            return Err(ApiError::Internal(e));
        }
    }

    let mut stats = match state.store.get_stats(&code).await {
        Ok(Some(stats)) => stats,
        Ok(None) => LinkStats::empty(&code),
        Err(e) => {
            tracing::warn!(short_code = %code, error = %e, "Failed to read stats");
            LinkStats::empty(&code)
        }
    };

    // The worker recounts at batch cadence; recount here too so the read is
    // accurate even between flushes.
    if stats.total_clicks > 0 {
        match state.store.recount_uniques(&code).await {
            Ok(count) => stats.unique_visitors = count,
            Err(e) => {
                tracing::warn!(short_code = %code, error = %e, "Failed to recount unique visitors")
            }
        }
    }

    let clicks_over_time = state
        .store
        .clicks_over_time(&code, period)
        .await
        .unwrap_or_else(|e| {
            tracing::warn!(short_code = %code, error = %e, "Failed to read clicks over time");
            Vec::new()
        });

    let top_referrers = state
        .store
        .top_referrers(&code, TOP_REFERRERS_LIMIT)
        .await
        .unwrap_or_else(|e| {
            tracing::warn!(short_code = %code, error = %e, "Failed to read top referrers");
            Vec::new()
        });

    let click_rate = click_rate(stats.total_clicks, period, &clicks_over_time);
    let peak_hour = peak_point(&clicks_over_time);

    Ok(Json(AnalyticsResponse {
        short_code: code,
        total_clicks: stats.total_clicks,
        unique_visitors: stats.unique_visitors,
        clicks_over_time,
        top_referrers,
        click_rate,
        peak_hour,
    }))
}

/// Clicks per hour for the 24h window, per day otherwise; zero when the
/// window holds no data points.
fn click_rate(total_clicks: i64, period: StatsPeriod, points: &[TimePoint]) -> f64 {
    if points.is_empty() {
        return 0.0;
    }

    match period {
        StatsPeriod::Last24Hours => total_clicks as f64 / 24.0,
        StatsPeriod::Last7Days => total_clicks as f64 / 7.0,
        StatsPeriod::Last30Days => total_clicks as f64 / 30.0,
    }
}

/// Bucket with the highest count; the earliest wins a tie because buckets
/// arrive in ascending time order and only strictly greater counts replace
/// the current peak.
fn peak_point(points: &[TimePoint]) -> Option<TimePoint> {
    let mut peak: Option<&TimePoint> = None;
    for point in points {
        if peak.is_none_or(|p| point.count > p.count) {
            peak = Some(point);
        }
    }
    peak.cloned()
}

/// GET /api/analytics/{code}/stream
///
/// Long-lived SSE stream: one initial snapshot frame, then every broker
/// broadcast for the code, with comment heartbeats to keep intermediaries
/// from closing the connection. The subscription guard rides inside the
/// stream closure, so client disconnects deregister the mailbox.
pub async fn stream_analytics<Gen, Store, Kv>(
    Path(code): Path<String>,
    State(state): State<AppState<Gen, Store, Kv>>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError>
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

    // Initial snapshot: authoritative stats, falling back to the realtime
    // counter for links the workers have not aggregated yet.
    let total_clicks = match state.store.get_stats(&code).await {
        Ok(Some(stats)) => stats.total_clicks,
        Ok(None) | Err(_) => state
            .kv
            .get_int(&realtime_counter_key(&code))
            .await
            .unwrap_or(0),
    };

    let initial = StatsUpdate {
        short_code: code.clone(),
        timestamp: Utc::now(),
        total_clicks,
    };
    let initial_payload =
        serde_json::to_string(&initial).map_err(crate::error::ServiceError::from)?;

    let subscription = state.broker.subscribe(&code);
    let (mut receiver, guard) = subscription.into_parts();

    let updates = stream::poll_fn(move |cx| {
        // The guard lives inside this closure; dropping the stream
        // deregisters the mailbox.
        let _ = &guard;
        receiver.poll_recv(cx)
    })
    .map(|payload| Ok(Event::default().data(payload)));

    let frames = stream::once(future::ready(Ok(Event::default().data(initial_payload))))
        .chain(updates);

    Ok(Sse::new(frames).keep_alive(
        KeepAlive::new()
            .interval(HEARTBEAT_INTERVAL)
            .text("heartbeat"),
    ))
}
