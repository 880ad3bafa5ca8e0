use axum::{
    Router,
    http::{HeaderValue, Method, header::CONTENT_TYPE},
};
use tower_http::cors::{AllowOrigin, CorsLayer};

use crate::config::AppConfig;
use crate::error::ServiceError;

/// Apply CORS to the API sub-router.
///
/// With no explicit origins configured, the frontend URL is the single
/// allowed origin. A `*` entry switches to wildcard mode (credentials
/// disabled). The redirect hot path never passes through this layer.
pub fn apply_cors<S>(router: Router<S>, config: &AppConfig) -> Result<Router<S>, ServiceError>
where
    S: Clone + Send + Sync + 'static,
{
    if !config.cors_enabled {
        tracing::info!("CORS disabled via configuration");
        return Ok(router);
    }

    let cors_layer = build_cors_layer(config)?;

    Ok(router.layer(cors_layer))
}

fn build_cors_layer(config: &AppConfig) -> Result<CorsLayer, ServiceError> {
    let mut cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([CONTENT_TYPE]);

    let use_wildcard = config.cors_allowed_origins.contains(&"*".to_string());

    if use_wildcard {
        tracing::warn!(
            "CORS configured with wildcard (*) - credentials are disabled. \
             For authenticated requests, specify explicit origins instead."
        );
        cors = cors.allow_origin(AllowOrigin::any());
    } else {
        let mut origins = vec![origin_header_value(config.frontend_url.as_str())?];
        for origin in &config.cors_allowed_origins {
            origins.push(origin_header_value(origin)?);
        }

        tracing::info!(origins = ?origins, "CORS enabled");

        cors = cors
            .allow_origin(AllowOrigin::list(origins))
            .allow_credentials(true);
    }

    Ok(cors)
}

fn origin_header_value(origin: &str) -> Result<HeaderValue, ServiceError> {
    // Origins compare without a trailing slash, which Url rendering adds.
    origin
        .trim_end_matches('/')
        .parse::<HeaderValue>()
        .map_err(|e| ServiceError::Internal(format!("Invalid CORS origin '{origin}': {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{Request, StatusCode};
    use axum::{Router, routing::get};
    use tower::ServiceExt;
    use url::Url;

    fn test_config(origins: Vec<String>) -> AppConfig {
        AppConfig {
            port: 8080,
            base_url: Url::parse("http://localhost:8080").unwrap(),
            frontend_url: Url::parse("https://app.example.com").unwrap(),
            env: "test".into(),
            database_url: Url::parse("postgres://example@localhost/db").unwrap(),
            db_pool_size: 10,
            db_pool_min_idle: 1,
            redis_url: "localhost:6379".into(),
            kv_pool_size: 10,
            shortcode_max_retries: 5,
            cors_enabled: true,
            cors_allowed_origins: origins,
            log_format: crate::config::LogFormat::Json,
            rust_log: "info".into(),
        }
    }

    #[tokio::test]
    async fn cors_disabled_skips_middleware() {
        let mut config = test_config(vec![]);
        config.cors_enabled = false;
        let router = Router::new().route("/", get(|| async { "ok" }));
        let app = apply_cors(router, &config).unwrap();

        let request = Request::builder()
            .uri("/")
            .header("Origin", "https://app.example.com")
            .body(axum::body::Body::empty())
            .unwrap();

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(
            !response
                .headers()
                .contains_key("access-control-allow-origin")
        );
    }

    #[tokio::test]
    async fn frontend_url_is_default_origin() {
        let config = test_config(vec![]);
        let router = Router::new().route("/", get(|| async { "ok" }));
        let app = apply_cors(router, &config).unwrap();

        let request = Request::builder()
            .uri("/")
            .header("Origin", "https://app.example.com")
            .body(axum::body::Body::empty())
            .unwrap();

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response
                .headers()
                .get("access-control-allow-origin")
                .unwrap(),
            "https://app.example.com"
        );
    }

    #[tokio::test]
    async fn extra_origins_are_allowed() {
        let config = test_config(vec!["https://other.example.com".to_string()]);
        let router = Router::new().route("/", get(|| async { "ok" }));
        let app = apply_cors(router, &config).unwrap();

        let request = Request::builder()
            .uri("/")
            .header("Origin", "https://other.example.com")
            .body(axum::body::Body::empty())
            .unwrap();

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(
            response
                .headers()
                .get("access-control-allow-origin")
                .unwrap(),
            "https://other.example.com"
        );
    }

    #[tokio::test]
    async fn wildcard_allows_any_origin() {
        let config = test_config(vec!["*".to_string()]);
        let router = Router::new().route("/", get(|| async { "ok" }));
        let app = apply_cors(router, &config).unwrap();

        let request = Request::builder()
            .uri("/")
            .header("Origin", "https://random-origin.com")
            .body(axum::body::Body::empty())
            .unwrap();

        let response = app.oneshot(request).await.unwrap();
        assert!(
            response
                .headers()
                .contains_key("access-control-allow-origin")
        );
    }

    #[tokio::test]
    async fn preflight_options_request_is_answered() {
        let config = test_config(vec![]);
        let router = Router::new().route("/", get(|| async { "ok" }));
        let app = apply_cors(router, &config).unwrap();

        let request = Request::builder()
            .method("OPTIONS")
            .uri("/")
            .header("Origin", "https://app.example.com")
            .header("Access-Control-Request-Method", "POST")
            .body(axum::body::Body::empty())
            .unwrap();

        let response = app.oneshot(request).await.unwrap();
        assert!(response.status().is_success() || response.status() == StatusCode::NO_CONTENT);
        assert!(
            response
                .headers()
                .contains_key("access-control-allow-methods")
        );
    }
}
