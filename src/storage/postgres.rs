use chrono::Utc;
use sqlx::{PgPool, QueryBuilder, postgres::PgPoolOptions};

use crate::analytics::ClickEvent;
use crate::error::ServiceError;
use crate::storage::{Link, LinkStats, LinkStore, ReferrerCount, StatsPeriod, TimePoint};

/// PostgreSQL-backed [`LinkStore`].
///
/// Queries are runtime-bound rather than macro-checked so the crate builds
/// without a live database; the statements mirror the persisted-state layout
/// exactly (links, clicks, link_stats, top_referrers).
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(
        database_url: &str,
        pool_size: u32,
        min_idle: u32,
    ) -> Result<Self, ServiceError> {
        let pool = PgPoolOptions::new()
            .max_connections(pool_size)
            .min_connections(min_idle)
            .acquire_timeout(std::time::Duration::from_secs(2))
            .connect(database_url)
            .await?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

impl LinkStore for PgStore {
    async fn insert_link(
        &self,
        short_code: &str,
        original_url: &str,
        user_id: &str,
    ) -> Result<Link, ServiceError> {
        let link = sqlx::query_as::<_, Link>(
            r#"
            INSERT INTO links (short_code, original_url, user_id, created_at)
            VALUES ($1, $2, $3, $4)
            RETURNING id, short_code, original_url, user_id, created_at
            "#,
        )
        .bind(short_code)
        .bind(original_url)
        .bind(user_id)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| match &e {
            sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
                ServiceError::DuplicateShortCode
            }
            _ => ServiceError::Database(e),
        })?;

        Ok(link)
    }

    async fn get_by_code(&self, short_code: &str) -> Result<Option<Link>, ServiceError> {
        let link = sqlx::query_as::<_, Link>(
            r#"
            SELECT id, short_code, original_url, user_id, created_at
            FROM links
            WHERE short_code = $1
            "#,
        )
        .bind(short_code)
        .fetch_optional(&self.pool)
        .await?;

        Ok(link)
    }

    async fn get_by_user(&self, user_id: &str) -> Result<Vec<Link>, ServiceError> {
        let links = sqlx::query_as::<_, Link>(
            r#"
            SELECT id, short_code, original_url, user_id, created_at
            FROM links
            WHERE user_id = $1
            ORDER BY created_at DESC
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(links)
    }

    async fn get_all_links(&self) -> Result<Vec<Link>, ServiceError> {
        let links = sqlx::query_as::<_, Link>(
            r#"
            SELECT id, short_code, original_url, user_id, created_at
            FROM links
            ORDER BY created_at DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(links)
    }

    async fn batch_insert_clicks(&self, events: &[ClickEvent]) -> Result<(), ServiceError> {
        if events.is_empty() {
            return Ok(());
        }

        let mut builder: QueryBuilder<sqlx::Postgres> = QueryBuilder::new(
            "INSERT INTO clicks (short_code, clicked_at, ip_address, user_agent, referer, visitor_hash) ",
        );
        builder.push_values(events, |mut row, event| {
            row.push_bind(&event.short_code)
                .push_bind(event.timestamp)
                .push_bind(&event.ip_address)
                .push_bind(&event.user_agent)
                .push_bind(&event.referer)
                .push_bind(&event.visitor_hash);
        });

        let mut tx = self.pool.begin().await?;
        builder.build().execute(&mut *tx).await?;
        tx.commit().await?;

        Ok(())
    }

    async fn get_stats(&self, short_code: &str) -> Result<Option<LinkStats>, ServiceError> {
        let stats = sqlx::query_as::<_, LinkStats>(
            r#"
            SELECT short_code, total_clicks, unique_visitors, last_updated
            FROM link_stats
            WHERE short_code = $1
            "#,
        )
        .bind(short_code)
        .fetch_optional(&self.pool)
        .await?;

        Ok(stats)
    }

    async fn upsert_stats(
        &self,
        short_code: &str,
        delta_total: i64,
        unique_visitors: i64,
    ) -> Result<(), ServiceError> {
        sqlx::query(
            r#"
            INSERT INTO link_stats (short_code, total_clicks, unique_visitors, last_updated)
            VALUES ($1, $2, $3, NOW())
            ON CONFLICT (short_code)
            DO UPDATE SET
                total_clicks = link_stats.total_clicks + $2,
                unique_visitors = $3,
                last_updated = NOW()
            "#,
        )
        .bind(short_code)
        .bind(delta_total)
        .bind(unique_visitors)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn upsert_referrer(
        &self,
        short_code: &str,
        referer: &str,
        delta: i64,
    ) -> Result<(), ServiceError> {
        sqlx::query(
            r#"
            INSERT INTO top_referrers (short_code, referer, click_count)
            VALUES ($1, $2, $3)
            ON CONFLICT (short_code, referer)
            DO UPDATE SET click_count = top_referrers.click_count + $3
            "#,
        )
        .bind(short_code)
        .bind(referer)
        .bind(delta)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn recount_uniques(&self, short_code: &str) -> Result<i64, ServiceError> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(DISTINCT visitor_hash)
            FROM clicks
            WHERE short_code = $1
            "#,
        )
        .bind(short_code)
        .fetch_one(&self.pool)
        .await?;

        Ok(count)
    }

    async fn clicks_over_time(
        &self,
        short_code: &str,
        period: StatsPeriod,
    ) -> Result<Vec<TimePoint>, ServiceError> {
        let start = Utc::now() - period.duration();
        let query = if period.bucketed_by_hour() {
            r#"
            SELECT DATE_TRUNC('hour', clicked_at) AS "timestamp", COUNT(*) AS "count"
            FROM clicks
            WHERE short_code = $1 AND clicked_at >= $2
            GROUP BY 1
            ORDER BY 1 ASC
            "#
        } else {
            r#"
            SELECT DATE_TRUNC('day', clicked_at) AS "timestamp", COUNT(*) AS "count"
            FROM clicks
            WHERE short_code = $1 AND clicked_at >= $2
            GROUP BY 1
            ORDER BY 1 ASC
            "#
        };

        let points = sqlx::query_as::<_, TimePoint>(query)
            .bind(short_code)
            .bind(start)
            .fetch_all(&self.pool)
            .await?;

        Ok(points)
    }

    async fn top_referrers(
        &self,
        short_code: &str,
        limit: i64,
    ) -> Result<Vec<ReferrerCount>, ServiceError> {
        let referrers = sqlx::query_as::<_, ReferrerCount>(
            r#"
            SELECT referer, click_count
            FROM top_referrers
            WHERE short_code = $1
            ORDER BY click_count DESC, referer ASC
            LIMIT $2
            "#,
        )
        .bind(short_code)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(referrers)
    }

    async fn ping(&self) -> Result<(), ServiceError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::Executor;
    use std::{
        env,
        time::{SystemTime, UNIX_EPOCH},
    };
    use url::Url;

    // Build a unique DB name from the clock to avoid collisions between runs.
    fn unique_db_name(prefix: &str) -> String {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        format!("{}_{:x}", prefix, nanos)
    }

    // Create a fresh temporary database with the service schema.
    async fn setup_db() -> PgPool {
        let base = env::var("TEST_DATABASE_URL")
            .or_else(|_| env::var("DATABASE_URL"))
            .expect("Set TEST_DATABASE_URL or DATABASE_URL to a Postgres URL with create DB privileges");

        let mut server_url = Url::parse(&base).expect("Invalid Postgres URL");
        server_url.set_path("postgres");

        let admin_pool = PgPoolOptions::new()
            .max_connections(1)
            .connect(server_url.as_str())
            .await
            .expect("Failed to connect to Postgres (admin)");

        let db_name = unique_db_name("linkpulse_test");
        let create_stmt = format!(r#"CREATE DATABASE "{}""#, db_name);
        admin_pool
            .execute(create_stmt.as_str())
            .await
            .expect("Failed to create test database");

        let mut db_url = server_url.clone();
        db_url.set_path(&db_name);

        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(db_url.as_str())
            .await
            .expect("Failed to connect to test database");

        pool.execute(
            r#"
            CREATE TABLE IF NOT EXISTS links (
                id BIGSERIAL PRIMARY KEY,
                short_code VARCHAR(16) UNIQUE NOT NULL,
                original_url TEXT NOT NULL,
                user_id TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now()
            );
            CREATE INDEX IF NOT EXISTS idx_links_user_created
                ON links (user_id, created_at DESC);

            CREATE TABLE IF NOT EXISTS clicks (
                id BIGSERIAL PRIMARY KEY,
                short_code VARCHAR(16) NOT NULL,
                clicked_at TIMESTAMPTZ NOT NULL,
                ip_address TEXT NOT NULL,
                user_agent TEXT NOT NULL,
                referer TEXT NOT NULL DEFAULT '',
                visitor_hash CHAR(64) NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_clicks_code_time
                ON clicks (short_code, clicked_at DESC);
            CREATE INDEX IF NOT EXISTS idx_clicks_time ON clicks (clicked_at);

            CREATE TABLE IF NOT EXISTS link_stats (
                short_code VARCHAR(16) PRIMARY KEY,
                total_clicks BIGINT NOT NULL DEFAULT 0,
                unique_visitors BIGINT NOT NULL DEFAULT 0,
                last_updated TIMESTAMPTZ NOT NULL DEFAULT now()
            );

            CREATE TABLE IF NOT EXISTS top_referrers (
                short_code VARCHAR(16) NOT NULL,
                referer TEXT NOT NULL,
                click_count BIGINT NOT NULL DEFAULT 0,
                PRIMARY KEY (short_code, referer)
            );
            CREATE INDEX IF NOT EXISTS idx_top_referrers_count
                ON top_referrers (short_code, click_count DESC);
            "#,
        )
        .await
        .expect("Failed to create schema");

        pool
    }

    fn click(code: &str, ip: &str, referer: &str) -> ClickEvent {
        ClickEvent::new(
            code.to_string(),
            ip.to_string(),
            "Mozilla/5.0".to_string(),
            referer.to_string(),
        )
    }

    #[tokio::test]
    #[ignore] // Requires database
    async fn insert_and_get_link_roundtrip() {
        let store = PgStore::new(setup_db().await);

        let created = store
            .insert_link("abc123", "https://example.com/path?x=1", "u1")
            .await
            .unwrap();
        assert_eq!(created.short_code, "abc123");

        let fetched = store.get_by_code("abc123").await.unwrap().unwrap();
        assert_eq!(fetched.original_url, "https://example.com/path?x=1");
        assert_eq!(fetched.user_id, "u1");

        assert!(store.get_by_code("zzzzzz").await.unwrap().is_none());
    }

    #[tokio::test]
    #[ignore] // Requires database
    async fn duplicate_short_code_maps_to_domain_error() {
        let store = PgStore::new(setup_db().await);

        store
            .insert_link("dup", "https://a.example", "u1")
            .await
            .unwrap();
        let err = store
            .insert_link("dup", "https://b.example", "u1")
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::DuplicateShortCode));
    }

    #[tokio::test]
    #[ignore] // Requires database
    async fn batch_insert_then_recount_and_aggregates() {
        let store = PgStore::new(setup_db().await);

        store
            .batch_insert_clicks(&[
                click("aaa", "1.1.1.1", "https://t.co"),
                click("aaa", "1.1.1.1", ""),
                click("aaa", "2.2.2.2", "https://t.co"),
            ])
            .await
            .unwrap();

        assert_eq!(store.recount_uniques("aaa").await.unwrap(), 2);

        store.upsert_stats("aaa", 3, 2).await.unwrap();
        store.upsert_stats("aaa", 1, 3).await.unwrap();
        let stats = store.get_stats("aaa").await.unwrap().unwrap();
        assert_eq!(stats.total_clicks, 4);
        assert_eq!(stats.unique_visitors, 3);

        store.upsert_referrer("aaa", "https://t.co", 2).await.unwrap();
        store.upsert_referrer("aaa", "https://t.co", 1).await.unwrap();
        store.upsert_referrer("aaa", "https://a.example", 3).await.unwrap();
        let refs = store.top_referrers("aaa", 10).await.unwrap();
        assert_eq!(refs.len(), 2);
        // Tie on 3 broken by ascending referer.
        assert_eq!(refs[0].referer, "https://a.example");
        assert_eq!(refs[1].referer, "https://t.co");

        let points = store
            .clicks_over_time("aaa", StatsPeriod::Last24Hours)
            .await
            .unwrap();
        assert_eq!(points.iter().map(|p| p.count).sum::<i64>(), 3);
    }

    #[tokio::test]
    #[ignore] // Requires database
    async fn list_by_user_is_newest_first() {
        let store = PgStore::new(setup_db().await);

        store.insert_link("one111", "https://a.example", "u1").await.unwrap();
        store.insert_link("two222", "https://b.example", "u1").await.unwrap();
        store.insert_link("oth333", "https://c.example", "u2").await.unwrap();

        let links = store.get_by_user("u1").await.unwrap();
        assert_eq!(links.len(), 2);
        assert!(links[0].created_at >= links[1].created_at);

        let all = store.get_all_links().await.unwrap();
        assert_eq!(all.len(), 3);
    }
}
