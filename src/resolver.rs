use std::time::Duration;

use thiserror::Error;
use tokio::time::timeout;

use crate::cache::LinkCache;
use crate::error::ServiceError;
use crate::storage::{LinkStore, RealtimeCache, redis::link_cache_key};

/// Hard deadline for the primary-store lookup on an L1 miss. The redirect
/// path must fail fast rather than hold a request hostage to a slow store.
pub const STORE_QUERY_TIMEOUT: Duration = Duration::from_millis(500);
/// TTL for the warm write-through entries on the remote KV.
pub const KV_LINK_TTL: Duration = Duration::from_secs(3600);
/// Budget for iterating all links into L1 at startup.
pub const PREPOPULATE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("short code not found")]
    NotFound,
    #[error(transparent)]
    Unavailable(ServiceError),
}

/// Short-code resolution: L1 first, then the primary store under a bounded
/// deadline. The remote KV is never consulted on the read path; it is kept
/// warm by an async write-through so other instances with a cold L1 can use
/// it. Startup pre-population turns the steady state into pure L1 hits.
#[derive(Clone)]
pub struct Resolver<S, K> {
    cache: LinkCache,
    store: S,
    kv: K,
}

impl<S, K> Resolver<S, K>
where
    S: LinkStore + Clone + Send + Sync + 'static,
    K: RealtimeCache + Clone + Send + Sync + 'static,
{
    pub fn new(cache: LinkCache, store: S, kv: K) -> Self {
        Self { cache, store, kv }
    }

    pub fn cache(&self) -> &LinkCache {
        &self.cache
    }

    pub async fn resolve(&self, short_code: &str) -> Result<String, ResolveError> {
        if let Some(url) = self.cache.get(short_code) {
            return Ok(url);
        }

        let link = match timeout(STORE_QUERY_TIMEOUT, self.store.get_by_code(short_code)).await {
            Ok(Ok(Some(link))) => link,
            Ok(Ok(None)) => return Err(ResolveError::NotFound),
            Ok(Err(e)) => return Err(ResolveError::Unavailable(e)),
            Err(_) => return Err(ResolveError::Unavailable(ServiceError::StoreTimeout)),
        };

        // Populate L1 before returning so the next request hits it, then
        // warm the remote KV off the request path.
        self.cache.insert(short_code, &link.original_url);

        let kv = self.kv.clone();
        let key = link_cache_key(short_code);
        let url = link.original_url.clone();
        tokio::spawn(async move {
            if let Err(e) = kv.set_with_ttl(&key, &url, KV_LINK_TTL).await {
                tracing::debug!(error = %e, key = %key, "KV write-through failed");
            }
        });

        Ok(link.original_url)
    }

    /// Load every known link into L1. Called once at startup, before the
    /// server accepts traffic.
    pub async fn prepopulate(&self) -> Result<usize, ServiceError> {
        let links = match timeout(PREPOPULATE_TIMEOUT, self.store.get_all_links()).await {
            Ok(result) => result?,
            Err(_) => return Err(ServiceError::StoreTimeout),
        };

        for link in &links {
            self.cache.insert(&link.short_code, &link.original_url);
        }

        Ok(links.len())
    }
}
