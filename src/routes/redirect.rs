use std::net::SocketAddr;

use axum::{
    extract::{ConnectInfo, State},
    http::{HeaderMap, HeaderValue, Method, StatusCode, Uri, header},
    response::{IntoResponse, Response},
};

use crate::{
    analytics::ClickEvent,
    error::ApiError,
    resolver::ResolveError,
    shortcode::GenerateShortcode,
    state::AppState,
    storage::{LinkStore, RealtimeCache, redis::realtime_counter_key},
};

/// Redirect hot path, mounted as the router fallback.
///
/// Everything before the response is the minimum: parse the code, resolve,
/// write `Location`. Analytics runs in a detached task with all
/// request-scoped values captured up front, so neither a full queue nor a
/// slow KV can delay the redirect.
pub async fn redirect<Gen, Store, Kv>(
    State(state): State<AppState<Gen, Store, Kv>>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
) -> Result<Response, ApiError>
where
    Gen: GenerateShortcode + Clone + Send + Sync + 'static,
    Store: LinkStore + Clone + Send + Sync + 'static,
    Kv: RealtimeCache + Clone + Send + Sync + 'static,
{
    state.metrics.record_request();

    if method != Method::GET {
        return Err(ApiError::NotFound);
    }

    let short_code = extract_short_code(uri.path());
    if short_code.is_empty() {
        return Err(ApiError::NotFound);
    }

    let original_url = match state.resolver.resolve(short_code).await {
        Ok(url) => url,
        Err(ResolveError::NotFound) => return Err(ApiError::NotFound),
        Err(ResolveError::Unavailable(e)) => {
            state.metrics.record_error();
            return Err(ApiError::Internal(e));
        }
    };

    let response = (
        StatusCode::FOUND,
        [(header::LOCATION, HeaderValue::from_str(&original_url)?)],
    )
        .into_response();

    // Capture request-scoped values before spawning; the request buffers may
    // be reused by the server once the handler returns.
    let short_code = short_code.to_string();
    let ip_address = extract_client_ip(&headers, remote);
    let user_agent = header_str(&headers, header::USER_AGENT);
    let referer = header_str(&headers, header::REFERER);
    let queue = state.click_queue.clone();
    let kv = state.kv.clone();

    tokio::spawn(async move {
        // Hashing happens here rather than on the request task.
        let event = ClickEvent::new(
            short_code.clone(),
            ip_address,
            user_agent,
            referer,
        );
        queue.offer(event);

        if let Err(e) = kv.incr(&realtime_counter_key(&short_code)).await {
            tracing::warn!(error = %e, short_code = %short_code, "Failed to bump realtime counter");
        }
    });

    Ok(response)
}

/// Extract the short code from a request path: strip one leading `/`,
/// truncate at the next `/`.
pub fn extract_short_code(path: &str) -> &str {
    let path = path.strip_prefix('/').unwrap_or(path);
    match path.find('/') {
        Some(idx) => &path[..idx],
        None => path,
    }
}

/// Client IP: `X-Forwarded-For` (first entry) over `X-Real-IP` over the
/// socket address.
pub fn extract_client_ip(headers: &HeaderMap, remote: SocketAddr) -> String {
    if let Some(forwarded) = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
    {
        if let Some(first) = forwarded.split(',').next() {
            let first = first.trim();
            if !first.is_empty() {
                return first.to_string();
            }
        }
    }

    if let Some(real_ip) = headers.get("x-real-ip").and_then(|v| v.to_str().ok()) {
        if !real_ip.is_empty() {
            return real_ip.to_string();
        }
    }

    remote.ip().to_string()
}

fn header_str(headers: &HeaderMap, name: header::HeaderName) -> String {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_short_code_table() {
        assert_eq!(extract_short_code("/abc"), "abc");
        assert_eq!(extract_short_code("/abc/"), "abc");
        assert_eq!(extract_short_code("/abc/def"), "abc");
        assert_eq!(extract_short_code("/"), "");
        assert_eq!(extract_short_code(""), "");
        assert_eq!(extract_short_code("/Xy9aBc"), "Xy9aBc");
    }

    fn remote() -> SocketAddr {
        SocketAddr::from(([198, 51, 100, 4], 50123))
    }

    #[test]
    fn client_ip_prefers_forwarded_for() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("203.0.113.7, 10.0.0.1"),
        );
        headers.insert("x-real-ip", HeaderValue::from_static("192.0.2.9"));

        assert_eq!(extract_client_ip(&headers, remote()), "203.0.113.7");
    }

    #[test]
    fn client_ip_falls_back_to_real_ip() {
        let mut headers = HeaderMap::new();
        headers.insert("x-real-ip", HeaderValue::from_static("192.0.2.9"));

        assert_eq!(extract_client_ip(&headers, remote()), "192.0.2.9");
    }

    #[test]
    fn client_ip_falls_back_to_socket_address() {
        let headers = HeaderMap::new();
        assert_eq!(extract_client_ip(&headers, remote()), "198.51.100.4");
    }
}
