use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::{Arc, Mutex},
    time::Duration,
};

use chrono::{DurationRound, Utc};

use crate::analytics::ClickEvent;
use crate::error::ServiceError;
use crate::storage::{
    Link, LinkStats, LinkStore, RealtimeCache, ReferrerCount, StatsPeriod, TimePoint,
};

/// In-memory [`LinkStore`] with the same observable semantics as the
/// PostgreSQL backend. Backs the integration tests and local experiments;
/// nothing here survives a restart.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<StoreInner>>,
}

#[derive(Default)]
struct StoreInner {
    links: Vec<Link>,
    next_id: i64,
    clicks: Vec<ClickEvent>,
    stats: HashMap<String, LinkStats>,
    referrers: HashMap<(String, String), i64>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LinkStore for MemoryStore {
    async fn insert_link(
        &self,
        short_code: &str,
        original_url: &str,
        user_id: &str,
    ) -> Result<Link, ServiceError> {
        let mut inner = self.inner.lock().expect("store lock poisoned");
        if inner.links.iter().any(|l| l.short_code == short_code) {
            return Err(ServiceError::DuplicateShortCode);
        }

        inner.next_id += 1;
        let link = Link {
            id: inner.next_id,
            short_code: short_code.to_string(),
            original_url: original_url.to_string(),
            user_id: user_id.to_string(),
            created_at: Utc::now(),
        };
        inner.links.push(link.clone());
        Ok(link)
    }

    async fn get_by_code(&self, short_code: &str) -> Result<Option<Link>, ServiceError> {
        let inner = self.inner.lock().expect("store lock poisoned");
        Ok(inner
            .links
            .iter()
            .find(|l| l.short_code == short_code)
            .cloned())
    }

    async fn get_by_user(&self, user_id: &str) -> Result<Vec<Link>, ServiceError> {
        let inner = self.inner.lock().expect("store lock poisoned");
        let mut links: Vec<Link> = inner
            .links
            .iter()
            .filter(|l| l.user_id == user_id)
            .cloned()
            .collect();
        links.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(links)
    }

    async fn get_all_links(&self) -> Result<Vec<Link>, ServiceError> {
        let inner = self.inner.lock().expect("store lock poisoned");
        let mut links = inner.links.clone();
        links.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(links)
    }

    async fn batch_insert_clicks(&self, events: &[ClickEvent]) -> Result<(), ServiceError> {
        let mut inner = self.inner.lock().expect("store lock poisoned");
        inner.clicks.extend_from_slice(events);
        Ok(())
    }

    async fn get_stats(&self, short_code: &str) -> Result<Option<LinkStats>, ServiceError> {
        let inner = self.inner.lock().expect("store lock poisoned");
        Ok(inner.stats.get(short_code).cloned())
    }

    async fn upsert_stats(
        &self,
        short_code: &str,
        delta_total: i64,
        unique_visitors: i64,
    ) -> Result<(), ServiceError> {
        let mut inner = self.inner.lock().expect("store lock poisoned");
        let stats = inner
            .stats
            .entry(short_code.to_string())
            .or_insert_with(|| LinkStats::empty(short_code));
        stats.total_clicks += delta_total;
        stats.unique_visitors = unique_visitors;
        stats.last_updated = Utc::now();
        Ok(())
    }

    async fn upsert_referrer(
        &self,
        short_code: &str,
        referer: &str,
        delta: i64,
    ) -> Result<(), ServiceError> {
        let mut inner = self.inner.lock().expect("store lock poisoned");
        *inner
            .referrers
            .entry((short_code.to_string(), referer.to_string()))
            .or_insert(0) += delta;
        Ok(())
    }

    async fn recount_uniques(&self, short_code: &str) -> Result<i64, ServiceError> {
        let inner = self.inner.lock().expect("store lock poisoned");
        let distinct: HashSet<&str> = inner
            .clicks
            .iter()
            .filter(|c| c.short_code == short_code)
            .map(|c| c.visitor_hash.as_str())
            .collect();
        Ok(distinct.len() as i64)
    }

    async fn clicks_over_time(
        &self,
        short_code: &str,
        period: StatsPeriod,
    ) -> Result<Vec<TimePoint>, ServiceError> {
        let start = Utc::now() - period.duration();
        let bucket = if period.bucketed_by_hour() {
            chrono::Duration::hours(1)
        } else {
            chrono::Duration::days(1)
        };

        let inner = self.inner.lock().expect("store lock poisoned");
        let mut buckets = BTreeMap::new();
        for click in inner
            .clicks
            .iter()
            .filter(|c| c.short_code == short_code && c.timestamp >= start)
        {
            let truncated = click
                .timestamp
                .duration_trunc(bucket)
                .map_err(|e| ServiceError::Internal(format!("bucket truncation: {e}")))?;
            *buckets.entry(truncated).or_insert(0i64) += 1;
        }

        Ok(buckets
            .into_iter()
            .map(|(timestamp, count)| TimePoint { timestamp, count })
            .collect())
    }

    async fn top_referrers(
        &self,
        short_code: &str,
        limit: i64,
    ) -> Result<Vec<ReferrerCount>, ServiceError> {
        let inner = self.inner.lock().expect("store lock poisoned");
        let mut counts: Vec<ReferrerCount> = inner
            .referrers
            .iter()
            .filter(|((code, _), _)| code == short_code)
            .map(|((_, referer), count)| ReferrerCount {
                referer: referer.clone(),
                click_count: *count,
            })
            .collect();
        counts.sort_by(|a, b| {
            b.click_count
                .cmp(&a.click_count)
                .then_with(|| a.referer.cmp(&b.referer))
        });
        counts.truncate(limit.max(0) as usize);
        Ok(counts)
    }

    async fn ping(&self) -> Result<(), ServiceError> {
        Ok(())
    }
}

/// In-memory [`RealtimeCache`]. TTLs are accepted and ignored; tests do not
/// depend on expiry.
#[derive(Clone, Default)]
pub struct MemoryCache {
    entries: Arc<Mutex<HashMap<String, String>>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RealtimeCache for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>, ServiceError> {
        let entries = self.entries.lock().expect("cache lock poisoned");
        Ok(entries.get(key).cloned())
    }

    async fn set_with_ttl(
        &self,
        key: &str,
        value: &str,
        _ttl: Duration,
    ) -> Result<(), ServiceError> {
        let mut entries = self.entries.lock().expect("cache lock poisoned");
        entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn incr(&self, key: &str) -> Result<i64, ServiceError> {
        let mut entries = self.entries.lock().expect("cache lock poisoned");
        let value = entries
            .get(key)
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(0)
            + 1;
        entries.insert(key.to_string(), value.to_string());
        Ok(value)
    }

    async fn get_int(&self, key: &str) -> Result<i64, ServiceError> {
        let entries = self.entries.lock().expect("cache lock poisoned");
        Ok(entries
            .get(key)
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(0))
    }

    async fn ping(&self) -> Result<(), ServiceError> {
        Ok(())
    }
}
