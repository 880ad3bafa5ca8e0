use std::future::Future;
use std::time::Duration;

use deadpool_redis::{Config as RedisConfig, Connection, Pool, PoolConfig, Runtime, redis};
use deadpool_redis::redis::AsyncCommands;

use crate::error::ServiceError;
use crate::storage::RealtimeCache;

/// Per-operation deadline. The KV sits on the hot path's async side; a slow
/// Redis must fail fast rather than pile up tasks.
const OP_TIMEOUT: Duration = Duration::from_millis(200);
/// How long a caller may wait for a pooled connection.
const POOL_WAIT_TIMEOUT: Duration = Duration::from_millis(50);
/// Realtime click counters expire on their own shortly after traffic stops.
const REALTIME_COUNTER_TTL_SECS: i64 = 60;

/// Warm write-through cache key for a short code.
pub fn link_cache_key(short_code: &str) -> String {
    format!("link:{short_code}")
}

/// Realtime click counter key for a short code.
pub fn realtime_counter_key(short_code: &str) -> String {
    format!("clicks:realtime:{short_code}")
}

/// Redis-backed [`RealtimeCache`] on a deadpool connection pool.
#[derive(Clone)]
pub struct RedisCache {
    pool: Pool,
}

impl RedisCache {
    pub fn connect(redis_url: &str, pool_size: usize) -> Result<Self, ServiceError> {
        let mut cfg = RedisConfig::from_url(redis_url);
        let mut pool_cfg = PoolConfig::new(pool_size);
        pool_cfg.timeouts.wait = Some(POOL_WAIT_TIMEOUT);
        pool_cfg.timeouts.create = Some(Duration::from_secs(5));
        cfg.pool = Some(pool_cfg);

        let pool = cfg
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| ServiceError::Cache(format!("Failed to create Redis pool: {e}")))?;

        Ok(Self { pool })
    }

    async fn conn(&self) -> Result<Connection, ServiceError> {
        self.pool.get().await.map_err(|e| {
            tracing::warn!(error = %e, "Failed to get Redis connection");
            ServiceError::Cache(format!("Redis pool error: {e}"))
        })
    }
}

/// Run a Redis command future under the per-operation deadline.
async fn bounded<T>(
    op: &'static str,
    fut: impl Future<Output = Result<T, redis::RedisError>> + Send,
) -> Result<T, ServiceError> {
    match tokio::time::timeout(OP_TIMEOUT, fut).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(ServiceError::Cache(format!("Redis {op} failed: {e}"))),
        Err(_) => Err(ServiceError::Cache(format!("Redis {op} timed out"))),
    }
}

impl RealtimeCache for RedisCache {
    async fn get(&self, key: &str) -> Result<Option<String>, ServiceError> {
        let mut conn = self.conn().await?;
        let value: Option<String> = bounded("GET", conn.get(key)).await?;
        Ok(value)
    }

    async fn set_with_ttl(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<(), ServiceError> {
        let mut conn = self.conn().await?;
        let _: () = bounded("SETEX", conn.set_ex(key, value, ttl.as_secs())).await?;
        Ok(())
    }

    async fn incr(&self, key: &str) -> Result<i64, ServiceError> {
        let mut conn = self.conn().await?;
        let value: i64 = bounded("INCR", conn.incr(key, 1)).await?;

        // First bump: schedule the TTL off the request path so stale
        // counters expire without delaying the caller.
        if value == 1 {
            let pool = self.pool.clone();
            let key = key.to_string();
            tokio::spawn(async move {
                let Ok(mut conn) = pool.get().await else {
                    return;
                };
                let result: Result<(), ServiceError> =
                    bounded("EXPIRE", conn.expire(&key, REALTIME_COUNTER_TTL_SECS)).await;
                if let Err(e) = result {
                    tracing::debug!(error = %e, key = %key, "Failed to set counter TTL");
                }
            });
        }

        Ok(value)
    }

    async fn get_int(&self, key: &str) -> Result<i64, ServiceError> {
        let mut conn = self.conn().await?;
        let value: Option<i64> = bounded("GET", conn.get(key)).await?;
        Ok(value.unwrap_or(0))
    }

    async fn ping(&self) -> Result<(), ServiceError> {
        let mut conn = self.conn().await?;
        let _: String = bounded("PING", async move {
            redis::cmd("PING").query_async(&mut conn).await
        })
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_helpers_compose_namespaced_keys() {
        assert_eq!(link_cache_key("abc123"), "link:abc123");
        assert_eq!(realtime_counter_key("abc123"), "clicks:realtime:abc123");
    }

    #[test]
    fn pool_creation_does_not_require_a_server() {
        // deadpool connects lazily; constructing the pool must succeed with
        // nothing listening.
        let cache = RedisCache::connect("redis://localhost:1", 4);
        assert!(cache.is_ok());
    }

    #[tokio::test]
    #[ignore] // Requires Redis
    async fn counter_roundtrip() {
        let cache = RedisCache::connect("redis://localhost:6379", 4).unwrap();
        let key = realtime_counter_key("redis_test_counter");

        let first = cache.incr(&key).await.unwrap();
        let second = cache.incr(&key).await.unwrap();
        assert_eq!(second, first + 1);
        assert_eq!(cache.get_int(&key).await.unwrap(), second);
    }

    #[tokio::test]
    #[ignore] // Requires Redis
    async fn set_with_ttl_then_get() {
        let cache = RedisCache::connect("redis://localhost:6379", 4).unwrap();
        cache
            .set_with_ttl(
                &link_cache_key("redis_test_link"),
                "https://example.com",
                Duration::from_secs(60),
            )
            .await
            .unwrap();

        let value = cache.get(&link_cache_key("redis_test_link")).await.unwrap();
        assert_eq!(value.as_deref(), Some("https://example.com"));
    }
}
