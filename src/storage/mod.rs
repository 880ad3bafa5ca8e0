pub mod memory;
pub mod postgres;
pub mod redis;

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::analytics::ClickEvent;
use crate::error::ServiceError;

/// Narrow behavior set the core needs from the primary store. Implemented by
/// [`postgres::PgStore`] for production and [`memory::MemoryStore`] for tests
/// and local experiments.
#[trait_variant::make(Send)]
pub trait LinkStore {
    /// Insert a new link; fails with [`ServiceError::DuplicateShortCode`] on
    /// a short-code collision.
    async fn insert_link(
        &self,
        short_code: &str,
        original_url: &str,
        user_id: &str,
    ) -> Result<Link, ServiceError>;

    async fn get_by_code(&self, short_code: &str) -> Result<Option<Link>, ServiceError>;

    async fn get_by_user(&self, user_id: &str) -> Result<Vec<Link>, ServiceError>;

    /// All links, used for L1 cache pre-population at startup.
    async fn get_all_links(&self) -> Result<Vec<Link>, ServiceError>;

    /// Insert a batch of raw click events inside a single transaction.
    async fn batch_insert_clicks(&self, events: &[ClickEvent]) -> Result<(), ServiceError>;

    async fn get_stats(&self, short_code: &str) -> Result<Option<LinkStats>, ServiceError>;

    /// Add `delta_total` to the click total and set the unique-visitor count
    /// absolutely, creating the row when absent.
    async fn upsert_stats(
        &self,
        short_code: &str,
        delta_total: i64,
        unique_visitors: i64,
    ) -> Result<(), ServiceError>;

    /// Add `delta` clicks to the `(short_code, referer)` counter, creating
    /// the row when absent.
    async fn upsert_referrer(
        &self,
        short_code: &str,
        referer: &str,
        delta: i64,
    ) -> Result<(), ServiceError>;

    /// Authoritative `COUNT(DISTINCT visitor_hash)` over the persisted
    /// clicks for one short code.
    async fn recount_uniques(&self, short_code: &str) -> Result<i64, ServiceError>;

    async fn clicks_over_time(
        &self,
        short_code: &str,
        period: StatsPeriod,
    ) -> Result<Vec<TimePoint>, ServiceError>;

    async fn top_referrers(
        &self,
        short_code: &str,
        limit: i64,
    ) -> Result<Vec<ReferrerCount>, ServiceError>;

    async fn ping(&self) -> Result<(), ServiceError>;
}

/// Narrow behavior set the core needs from the remote KV: warm write-through
/// link cache plus realtime counters.
#[trait_variant::make(Send)]
pub trait RealtimeCache {
    async fn get(&self, key: &str) -> Result<Option<String>, ServiceError>;

    async fn set_with_ttl(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<(), ServiceError>;

    /// Increment a counter; the first bump schedules an asynchronous TTL so
    /// stale counters expire on their own.
    async fn incr(&self, key: &str) -> Result<i64, ServiceError>;

    /// Read a counter, treating a missing key as zero.
    async fn get_int(&self, key: &str) -> Result<i64, ServiceError>;

    async fn ping(&self) -> Result<(), ServiceError>;
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Link {
    pub id: i64,
    pub short_code: String,
    pub original_url: String,
    pub user_id: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct LinkStats {
    pub short_code: String,
    pub total_clicks: i64,
    pub unique_visitors: i64,
    pub last_updated: DateTime<Utc>,
}

impl LinkStats {
    /// Zero-valued stats for links that have never been clicked.
    pub fn empty(short_code: &str) -> Self {
        Self {
            short_code: short_code.to_string(),
            total_clicks: 0,
            unique_visitors: 0,
            last_updated: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct TimePoint {
    pub timestamp: DateTime<Utc>,
    pub count: i64,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct ReferrerCount {
    pub referer: String,
    #[serde(rename = "count")]
    pub click_count: i64,
}

/// Analytics query window. Buckets are hourly for the 24h window and daily
/// for the longer ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatsPeriod {
    Last24Hours,
    Last7Days,
    Last30Days,
}

impl StatsPeriod {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "24h" => Some(StatsPeriod::Last24Hours),
            "7d" => Some(StatsPeriod::Last7Days),
            "30d" => Some(StatsPeriod::Last30Days),
            _ => None,
        }
    }

    pub fn duration(self) -> chrono::Duration {
        match self {
            StatsPeriod::Last24Hours => chrono::Duration::hours(24),
            StatsPeriod::Last7Days => chrono::Duration::days(7),
            StatsPeriod::Last30Days => chrono::Duration::days(30),
        }
    }

    pub fn bucketed_by_hour(self) -> bool {
        matches!(self, StatsPeriod::Last24Hours)
    }
}
