use std::sync::Arc;

use url::Url;

use crate::{
    analytics::ClickQueue,
    broker::StatsBroker,
    metrics::Metrics,
    resolver::Resolver,
    shortcode::AlphanumericShortcode,
    storage::{LinkStore, RealtimeCache, postgres::PgStore, redis::RedisCache},
};

/// Application state shared across all request handlers.
///
/// Holds the four process-wide singletons (L1 cache via the resolver, ingest
/// queue, broker, metrics) plus the store handles. Everything is constructed
/// once at startup and passed down explicitly; nothing is rediscovered by
/// global lookup, which keeps tests able to build isolated instances.
///
/// Generic over the short-code generator and both store seams so tests can
/// run the full router against in-memory backends.
#[derive(Clone)]
pub struct AppState<Gen = AlphanumericShortcode, Store = PgStore, Kv = RedisCache> {
    /// External base URL of this service.
    pub base_url: Url,

    /// Frontend origin; short links returned by the create endpoint are
    /// built on it because the frontend owns the redirect landing page.
    pub frontend_url: Url,

    /// Primary store (links, clicks, aggregates).
    pub store: Store,

    /// Remote KV (warm link cache + realtime counters).
    pub kv: Kv,

    /// Short-code resolution with the process-local L1 cache.
    pub resolver: Resolver<Store, Kv>,

    /// Short-code generator.
    pub shortcode_generator: Gen,

    /// Maximum attempts to find an unused short code before giving up.
    pub shortcode_max_retries: u32,

    /// Ingest queue feeding the analytics worker pool.
    pub click_queue: ClickQueue,

    /// Live-stats subscription broker.
    pub broker: Arc<StatsBroker>,

    /// Process-wide request counters.
    pub metrics: Metrics,
}

impl<Gen, Store, Kv> AppState<Gen, Store, Kv>
where
    Gen: Clone,
    Store: LinkStore + Clone + Send + Sync + 'static,
    Kv: RealtimeCache + Clone + Send + Sync + 'static,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        base_url: Url,
        frontend_url: Url,
        store: Store,
        kv: Kv,
        resolver: Resolver<Store, Kv>,
        shortcode_generator: Gen,
        shortcode_max_retries: u32,
        click_queue: ClickQueue,
        broker: Arc<StatsBroker>,
    ) -> Self {
        Self {
            base_url,
            frontend_url,
            store,
            kv,
            resolver,
            shortcode_generator,
            shortcode_max_retries,
            click_queue,
            broker,
            metrics: Metrics::new(),
        }
    }
}
