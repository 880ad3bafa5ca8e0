use axum::{
    Json,
    extract::{FromRequest, Path, Query, Request, State},
    http::StatusCode,
    response::IntoResponse,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::{
    error::ApiError,
    resolver::KV_LINK_TTL,
    shortcode::GenerateShortcode,
    state::AppState,
    storage::{LinkStats, LinkStore, RealtimeCache, redis::link_cache_key},
};

#[derive(Deserialize)]
pub struct CreateLinkRequest {
    pub url: String,
    #[serde(default)]
    pub user_id: String,
}

pub struct ValidatedCreateLink {
    url: Url,
    user_id: String,
}

#[derive(Serialize)]
pub struct CreateLinkResponse {
    pub short_code: String,
    pub short_url: String,
    pub original_url: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Serialize)]
pub struct LinkResponse {
    pub short_code: String,
    pub original_url: String,
    pub created_at: DateTime<Utc>,
    pub stats: LinkStats,
}

#[derive(Serialize)]
pub struct ListLinksResponse {
    pub links: Vec<LinkInfo>,
}

#[derive(Serialize)]
pub struct LinkInfo {
    pub short_code: String,
    pub original_url: String,
    pub created_at: DateTime<Utc>,
    pub total_clicks: i64,
}

#[derive(Deserialize)]
pub struct ListLinksQuery {
    #[serde(default)]
    pub user_id: String,
}

/// POST /api/links
pub async fn create_link<Gen, Store, Kv>(
    State(state): State<AppState<Gen, Store, Kv>>,
    request: ValidatedCreateLink,
) -> Result<impl IntoResponse, ApiError>
where
    Gen: GenerateShortcode + Clone + Send + Sync + 'static,
    Store: LinkStore + Clone + Send + Sync + 'static,
    Kv: RealtimeCache + Clone + Send + Sync + 'static,
{
    state.metrics.record_request();

    let link = {
        let mut attempts = 0;
        loop {
            let code = state.shortcode_generator.generate_shortcode();

            match state
                .store
                .insert_link(&code, request.url.as_str(), &request.user_id)
                .await
            {
                Ok(link) => break link,
                Err(e) if e.is_unique_violation() => {
                    attempts += 1;
                    if attempts >= state.shortcode_max_retries {
                        state.metrics.record_error();
                        return Err(ApiError::Internal(
                            crate::error::ServiceError::ExcessiveCollisions,
                        ));
                    }
                }
                Err(e) => {
                    state.metrics.record_error();
                    return Err(ApiError::from(e));
                }
            }
        }
    };

    // The link is durable: publish to L1 immediately and warm the remote KV
    // off the request path.
    state
        .resolver
        .cache()
        .insert(&link.short_code, &link.original_url);
    {
        let kv = state.kv.clone();
        let key = link_cache_key(&link.short_code);
        let url = link.original_url.clone();
        tokio::spawn(async move {
            if let Err(e) = kv.set_with_ttl(&key, &url, KV_LINK_TTL).await {
                tracing::debug!(error = %e, key = %key, "KV write-through failed on create");
            }
        });
    }

    // Short links point at the frontend, which owns the redirect page.
    let short_url = state.frontend_url.join(&link.short_code)?;

    let body = Json(CreateLinkResponse {
        short_code: link.short_code,
        short_url: short_url.to_string(),
        original_url: link.original_url,
        created_at: link.created_at,
    });

    Ok((StatusCode::CREATED, body))
}

/// GET /api/links/{code}
pub async fn get_link<Gen, Store, Kv>(
    Path(code): Path<String>,
    State(state): State<AppState<Gen, Store, Kv>>,
) -> Result<impl IntoResponse, ApiError>
where
    Gen: GenerateShortcode + Clone + Send + Sync + 'static,
    Store: LinkStore + Clone + Send + Sync + 'static,
    Kv: RealtimeCache + Clone + Send + Sync + 'static,
{
    state.metrics.record_request();

    let link = state
        .store
        .get_by_code(&code)
        .await
        .map_err(ApiError::from)?
        .ok_or(ApiError::NotFound)?;

    let stats = state
        .store
        .get_stats(&code)
        .await
        .unwrap_or_else(|e| {
            tracing::warn!(short_code = %code, error = %e, "Failed to read stats");
            None
        })
        .unwrap_or_else(|| LinkStats::empty(&code));

    Ok(Json(LinkResponse {
        short_code: link.short_code,
        original_url: link.original_url,
        created_at: link.created_at,
        stats,
    }))
}

/// GET /api/links?user_id=...
pub async fn list_links<Gen, Store, Kv>(
    Query(query): Query<ListLinksQuery>,
    State(state): State<AppState<Gen, Store, Kv>>,
) -> Result<impl IntoResponse, ApiError>
where
    Gen: GenerateShortcode + Clone + Send + Sync + 'static,
    Store: LinkStore + Clone + Send + Sync + 'static,
    Kv: RealtimeCache + Clone + Send + Sync + 'static,
{
    state.metrics.record_request();

    if query.user_id.is_empty() {
        return Err(ApiError::BadRequest("user_id parameter required"));
    }

    let links = state
        .store
        .get_by_user(&query.user_id)
        .await
        .map_err(ApiError::from)?;

    let mut infos = Vec::with_capacity(links.len());
    for link in links {
        let total_clicks = match state.store.get_stats(&link.short_code).await {
            Ok(Some(stats)) => stats.total_clicks,
            Ok(None) => 0,
            Err(e) => {
                tracing::warn!(short_code = %link.short_code, error = %e, "Failed to read stats");
                0
            }
        };

        infos.push(LinkInfo {
            short_code: link.short_code,
            original_url: link.original_url,
            created_at: link.created_at,
            total_clicks,
        });
    }

    Ok(Json(ListLinksResponse { links: infos }))
}

impl<S> FromRequest<S> for ValidatedCreateLink
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Json(body) = Json::<CreateLinkRequest>::from_request(req, state).await?;

        let url =
            Url::parse(body.url.trim()).map_err(|_| ApiError::BadRequest("Invalid URL format"))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(ApiError::BadRequest("Only http and https URLs are allowed"));
        }

        let user_id = body.user_id.trim().to_string();
        if user_id.is_empty() {
            return Err(ApiError::BadRequest("user_id is required"));
        }

        Ok(ValidatedCreateLink { url, user_id })
    }
}
