use std::{collections::{HashMap, HashSet}, sync::Arc, time::Duration};

use async_channel::Receiver;
use chrono::Utc;
use tokio::{
    task::JoinHandle,
    time::{Instant, timeout_at},
};

use crate::{
    analytics::queue::{ClickEvent, ClickQueue},
    broker::{StatsBroker, StatsUpdate},
    storage::{LinkStats, LinkStore},
};

pub const NUM_WORKERS: usize = 10;
pub const BATCH_SIZE: usize = 100;
pub const BATCH_TIMEOUT: Duration = Duration::from_secs(5);

/// Worker pool sizing and batching knobs. Production uses the defaults;
/// tests shrink them to keep flushes fast.
#[derive(Debug, Clone, Copy)]
pub struct FlushConfig {
    pub workers: usize,
    pub batch_size: usize,
    pub batch_timeout: Duration,
}

impl Default for FlushConfig {
    fn default() -> Self {
        Self {
            workers: NUM_WORKERS,
            batch_size: BATCH_SIZE,
            batch_timeout: BATCH_TIMEOUT,
        }
    }
}

/// Spawn the analytics worker pool. Each worker independently batches
/// events from the shared queue and flushes them; closing the queue drains
/// the buffered tail and stops every worker.
pub fn spawn_workers<S>(
    config: FlushConfig,
    queue: &ClickQueue,
    store: S,
    broker: Arc<StatsBroker>,
) -> Vec<JoinHandle<()>>
where
    S: LinkStore + Clone + Send + Sync + 'static,
{
    let handles = (0..config.workers)
        .map(|id| {
            let worker = FlushWorker {
                id,
                events: queue.subscribe(),
                store: store.clone(),
                broker: Arc::clone(&broker),
                batch_size: config.batch_size,
                batch_timeout: config.batch_timeout,
            };
            tokio::spawn(worker.run())
        })
        .collect();

    tracing::info!(
        workers = config.workers,
        batch_size = config.batch_size,
        batch_timeout_ms = config.batch_timeout.as_millis() as u64,
        "Started analytics workers"
    );

    handles
}

struct FlushWorker<S> {
    id: usize,
    events: Receiver<ClickEvent>,
    store: S,
    broker: Arc<StatsBroker>,
    batch_size: usize,
    batch_timeout: Duration,
}

impl<S> FlushWorker<S>
where
    S: LinkStore + Clone + Send + Sync + 'static,
{
    async fn run(self) {
        tracing::debug!(worker_id = self.id, "Analytics worker started");
        let mut batch: Vec<ClickEvent> = Vec::with_capacity(self.batch_size);

        loop {
            // Wait for the first event of the next batch; an error means the
            // queue is closed and fully drained.
            let first = match self.events.recv().await {
                Ok(event) => event,
                Err(_) => break,
            };
            batch.push(first);

            // The timeout runs from the first buffered event, not per event.
            let deadline = Instant::now() + self.batch_timeout;
            let mut queue_closed = false;
            while batch.len() < self.batch_size {
                match timeout_at(deadline, self.events.recv()).await {
                    Ok(Ok(event)) => batch.push(event),
                    Ok(Err(_)) => {
                        queue_closed = true;
                        break;
                    }
                    Err(_) => break,
                }
            }

            self.flush(&mut batch).await;

            if queue_closed {
                break;
            }
        }

        tracing::debug!(worker_id = self.id, "Analytics worker stopped");
    }

    /// Persist one batch and recompute aggregates.
    ///
    /// Raw-insert failure abandons the whole batch; any later sub-step
    /// failure is logged and skipped for that short code only, because the
    /// raw events are already durable and the next flush touching the same
    /// code converges totals and uniques.
    async fn flush(&self, batch: &mut Vec<ClickEvent>) {
        if batch.is_empty() {
            return;
        }

        if let Err(e) = self.store.batch_insert_clicks(batch).await {
            tracing::error!(
                worker_id = self.id,
                error = %e,
                events = batch.len(),
                "Failed to insert click events, abandoning batch"
            );
            batch.clear();
            return;
        }

        let groups = aggregate_by_code(batch);
        let flushed = batch.len();
        batch.clear();

        for (short_code, agg) in groups {
            self.apply_aggregate(&short_code, &agg).await;
        }

        tracing::debug!(worker_id = self.id, events = flushed, "Flushed click events");
    }

    async fn apply_aggregate(&self, short_code: &str, agg: &CodeAggregate) {
        let current = match self.store.get_stats(short_code).await {
            Ok(Some(stats)) => stats,
            Ok(None) => LinkStats::empty(short_code),
            Err(e) => {
                tracing::warn!(short_code, error = %e, "Failed to read current stats");
                LinkStats::empty(short_code)
            }
        };

        // Unique visitors cannot be maintained additively without a
        // per-link membership structure, so recount from the durable
        // clicks. On failure the stored value is carried forward unchanged
        // and the next successful recount corrects it.
        let unique_visitors = match self.store.recount_uniques(short_code).await {
            Ok(count) => count,
            Err(e) => {
                tracing::warn!(
                    short_code,
                    error = %e,
                    "Failed to recount unique visitors, leaving count unchanged"
                );
                current.unique_visitors
            }
        };

        if let Err(e) = self
            .store
            .upsert_stats(short_code, agg.total_clicks, unique_visitors)
            .await
        {
            tracing::warn!(short_code, error = %e, "Failed to update link stats");
        }

        for (referer, delta) in &agg.referrers {
            if let Err(e) = self.store.upsert_referrer(short_code, referer, *delta).await {
                tracing::warn!(short_code, referer, error = %e, "Failed to update referrer count");
            }
        }

        // Broadcast the stored running total, not the delta, so subscribers
        // observe non-decreasing counts even when updates are lost.
        match self.store.get_stats(short_code).await {
            Ok(Some(stats)) => {
                let update = StatsUpdate {
                    short_code: short_code.to_string(),
                    timestamp: Utc::now(),
                    total_clicks: stats.total_clicks,
                };
                match serde_json::to_string(&update) {
                    Ok(payload) => self.broker.broadcast(short_code, &payload),
                    Err(e) => {
                        tracing::warn!(short_code, error = %e, "Failed to serialize stats update")
                    }
                }
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(short_code, error = %e, "Failed to read stats for broadcast");
            }
        }
    }
}

struct CodeAggregate {
    total_clicks: i64,
    batch_uniques: HashSet<String>,
    referrers: HashMap<String, i64>,
}

/// Group a batch by short code, computing the per-code click delta,
/// distinct visitor hashes, and per-referer increments. Empty referers are
/// not counted as referrers.
fn aggregate_by_code(events: &[ClickEvent]) -> HashMap<String, CodeAggregate> {
    let mut groups: HashMap<String, CodeAggregate> = HashMap::new();

    for event in events {
        let agg = groups
            .entry(event.short_code.clone())
            .or_insert_with(|| CodeAggregate {
                total_clicks: 0,
                batch_uniques: HashSet::new(),
                referrers: HashMap::new(),
            });

        agg.total_clicks += 1;
        agg.batch_uniques.insert(event.visitor_hash.clone());

        if !event.referer.is_empty() {
            *agg.referrers.entry(event.referer.clone()).or_insert(0) += 1;
        }
    }

    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        error::ServiceError,
        storage::{Link, ReferrerCount, StatsPeriod, TimePoint, memory::MemoryStore},
    };

    fn click(code: &str, ip: &str, referer: &str) -> ClickEvent {
        ClickEvent::new(
            code.to_string(),
            ip.to_string(),
            "Mozilla/5.0".to_string(),
            referer.to_string(),
        )
    }

    #[test]
    fn aggregate_groups_by_code_and_skips_empty_referer() {
        let events = vec![
            click("aaa", "1.1.1.1", "https://t.co"),
            click("aaa", "1.1.1.1", ""),
            click("aaa", "2.2.2.2", "https://t.co"),
            click("bbb", "1.1.1.1", "https://news.ycombinator.com"),
        ];

        let groups = aggregate_by_code(&events);
        assert_eq!(groups.len(), 2);

        let aaa = &groups["aaa"];
        assert_eq!(aaa.total_clicks, 3);
        assert_eq!(aaa.batch_uniques.len(), 2);
        assert_eq!(aaa.referrers.len(), 1);
        assert_eq!(aaa.referrers["https://t.co"], 2);

        let bbb = &groups["bbb"];
        assert_eq!(bbb.total_clicks, 1);
        assert_eq!(bbb.referrers["https://news.ycombinator.com"], 1);
    }

    fn test_worker<S>(store: S, broker: Arc<StatsBroker>) -> FlushWorker<S>
    where
        S: LinkStore + Clone + Send + Sync + 'static,
    {
        let queue = ClickQueue::with_capacity(16);
        FlushWorker {
            id: 0,
            events: queue.subscribe(),
            store,
            broker,
            batch_size: BATCH_SIZE,
            batch_timeout: BATCH_TIMEOUT,
        }
    }

    #[tokio::test]
    async fn flush_persists_events_and_aggregates() {
        let store = MemoryStore::new();
        let broker = StatsBroker::new();
        let worker = test_worker(store.clone(), Arc::clone(&broker));

        let mut batch = vec![
            click("aaa", "1.1.1.1", "https://t.co"),
            click("aaa", "1.1.1.1", ""),
            click("aaa", "2.2.2.2", "https://t.co"),
        ];
        worker.flush(&mut batch).await;
        assert!(batch.is_empty());

        let stats = store.get_stats("aaa").await.unwrap().unwrap();
        assert_eq!(stats.total_clicks, 3);
        assert_eq!(stats.unique_visitors, 2);

        let refs = store.top_referrers("aaa", 10).await.unwrap();
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].referer, "https://t.co");
        assert_eq!(refs[0].click_count, 2);
    }

    #[tokio::test]
    async fn flush_accumulates_across_batches() {
        let store = MemoryStore::new();
        let broker = StatsBroker::new();
        let worker = test_worker(store.clone(), Arc::clone(&broker));

        let mut first = vec![click("aaa", "1.1.1.1", "")];
        worker.flush(&mut first).await;
        let mut second = vec![click("aaa", "1.1.1.1", ""), click("aaa", "3.3.3.3", "")];
        worker.flush(&mut second).await;

        let stats = store.get_stats("aaa").await.unwrap().unwrap();
        assert_eq!(stats.total_clicks, 3);
        // Same IP+UA across batches stays one visitor; recount is
        // authoritative over the whole click history.
        assert_eq!(stats.unique_visitors, 2);
    }

    #[tokio::test]
    async fn flush_broadcasts_stored_totals() {
        let store = MemoryStore::new();
        let broker = StatsBroker::new();
        let mut sub = broker.subscribe("aaa");
        let worker = test_worker(store.clone(), Arc::clone(&broker));

        let mut batch = vec![click("aaa", "1.1.1.1", "")];
        worker.flush(&mut batch).await;

        let payload = sub.receiver.recv().await.unwrap();
        let frame: serde_json::Value = serde_json::from_str(&payload).unwrap();
        assert_eq!(frame["short_code"], "aaa");
        assert_eq!(frame["total_clicks"], 1);
        assert!(frame["timestamp"].is_string());
    }

    #[tokio::test]
    async fn empty_flush_is_a_noop() {
        let store = MemoryStore::new();
        let broker = StatsBroker::new();
        let worker = test_worker(store.clone(), Arc::clone(&broker));

        let mut batch = Vec::new();
        worker.flush(&mut batch).await;

        assert!(store.get_stats("aaa").await.unwrap().is_none());
    }

    /// Store wrapper whose unique recount always fails, to exercise the
    /// leave-unchanged fallback.
    #[derive(Clone)]
    struct FailingRecountStore {
        inner: MemoryStore,
    }

    impl LinkStore for FailingRecountStore {
        async fn insert_link(
            &self,
            short_code: &str,
            original_url: &str,
            user_id: &str,
        ) -> Result<Link, ServiceError> {
            self.inner.insert_link(short_code, original_url, user_id).await
        }

        async fn get_by_code(&self, short_code: &str) -> Result<Option<Link>, ServiceError> {
            self.inner.get_by_code(short_code).await
        }

        async fn get_by_user(&self, user_id: &str) -> Result<Vec<Link>, ServiceError> {
            self.inner.get_by_user(user_id).await
        }

        async fn get_all_links(&self) -> Result<Vec<Link>, ServiceError> {
            self.inner.get_all_links().await
        }

        async fn batch_insert_clicks(&self, events: &[ClickEvent]) -> Result<(), ServiceError> {
            self.inner.batch_insert_clicks(events).await
        }

        async fn get_stats(&self, short_code: &str) -> Result<Option<LinkStats>, ServiceError> {
            self.inner.get_stats(short_code).await
        }

        async fn upsert_stats(
            &self,
            short_code: &str,
            delta_total: i64,
            unique_visitors: i64,
        ) -> Result<(), ServiceError> {
            self.inner
                .upsert_stats(short_code, delta_total, unique_visitors)
                .await
        }

        async fn upsert_referrer(
            &self,
            short_code: &str,
            referer: &str,
            delta: i64,
        ) -> Result<(), ServiceError> {
            self.inner.upsert_referrer(short_code, referer, delta).await
        }

        async fn recount_uniques(&self, _short_code: &str) -> Result<i64, ServiceError> {
            Err(ServiceError::Internal("recount unavailable".to_string()))
        }

        async fn clicks_over_time(
            &self,
            short_code: &str,
            period: StatsPeriod,
        ) -> Result<Vec<TimePoint>, ServiceError> {
            self.inner.clicks_over_time(short_code, period).await
        }

        async fn top_referrers(
            &self,
            short_code: &str,
            limit: i64,
        ) -> Result<Vec<ReferrerCount>, ServiceError> {
            self.inner.top_referrers(short_code, limit).await
        }

        async fn ping(&self) -> Result<(), ServiceError> {
            self.inner.ping().await
        }
    }

    #[tokio::test]
    async fn recount_failure_leaves_uniques_unchanged_but_advances_totals() {
        let inner = MemoryStore::new();
        // Seed stats as if an earlier flush had recounted 2 uniques.
        inner.upsert_stats("aaa", 5, 2).await.unwrap();

        let store = FailingRecountStore { inner: inner.clone() };
        let broker = StatsBroker::new();
        let worker = test_worker(store, Arc::clone(&broker));

        let mut batch = vec![click("aaa", "9.9.9.9", ""), click("aaa", "8.8.8.8", "")];
        worker.flush(&mut batch).await;

        let stats = inner.get_stats("aaa").await.unwrap().unwrap();
        assert_eq!(stats.total_clicks, 7);
        assert_eq!(stats.unique_visitors, 2, "failed recount must not inflate uniques");
    }

    #[tokio::test]
    async fn workers_flush_on_batch_size_and_drain_on_close() {
        let store = MemoryStore::new();
        let broker = StatsBroker::new();
        let queue = ClickQueue::with_capacity(64);

        let config = FlushConfig {
            workers: 2,
            batch_size: 4,
            batch_timeout: Duration::from_secs(30),
        };
        let handles = spawn_workers(config, &queue, store.clone(), Arc::clone(&broker));

        // 4 events hit the batch-size trigger; the 5th sits buffered until
        // close() drains it through a tail flush.
        for i in 0..5 {
            assert!(queue.offer(click("aaa", &format!("1.1.1.{i}"), "")));
        }
        queue.close();
        for handle in handles {
            handle.await.unwrap();
        }

        let stats = store.get_stats("aaa").await.unwrap().unwrap();
        assert_eq!(stats.total_clicks, 5);
        assert_eq!(stats.unique_visitors, 5);
    }
}
