use axum::{
    Router,
    routing::{get, post},
};

use crate::config::AppConfig;
use crate::cors;
use crate::error::ServiceError;
use crate::shortcode::GenerateShortcode;
use crate::state::AppState;
use crate::storage::{LinkStore, RealtimeCache};

pub mod analytics;
pub mod health;
pub mod links;
pub mod redirect;
pub mod track;

/// Build the full router.
///
/// API routes live in a sub-router that carries the CORS layer; the redirect
/// hot path is the fallback, so it matches every non-API path with no
/// middleware in front of it.
pub fn build_router<Gen, Store, Kv>(
    state: AppState<Gen, Store, Kv>,
    config: &AppConfig,
) -> Result<Router, ServiceError>
where
    Gen: GenerateShortcode + Clone + Send + Sync + 'static,
    Store: LinkStore + Clone + Send + Sync + 'static,
    Kv: RealtimeCache + Clone + Send + Sync + 'static,
{
    let api = Router::new()
        .route(
            "/api/links",
            post(links::create_link::<Gen, Store, Kv>).get(links::list_links::<Gen, Store, Kv>),
        )
        .route("/api/links/{code}", get(links::get_link::<Gen, Store, Kv>))
        .route("/api/track/{code}", post(track::track_click::<Gen, Store, Kv>))
        .route(
            "/api/analytics/{code}",
            get(analytics::get_analytics::<Gen, Store, Kv>),
        )
        .route(
            "/api/analytics/{code}/stream",
            get(analytics::stream_analytics::<Gen, Store, Kv>),
        );
    let api = cors::apply_cors(api, config)?;

    Ok(Router::new()
        .route("/health", get(health::health))
        .route("/ready", get(health::readiness::<Gen, Store, Kv>))
        .route("/metrics", get(health::metrics::<Gen, Store, Kv>))
        .merge(api)
        .fallback(redirect::redirect::<Gen, Store, Kv>)
        .with_state(state))
}
