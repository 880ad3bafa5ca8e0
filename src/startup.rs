use std::{net::SocketAddr, sync::Arc, time::Duration};

use axum::Router;
use tokio::task::JoinHandle;
use tracing_appender::non_blocking::WorkerGuard;

use crate::{
    analytics::{ClickQueue, FlushConfig, spawn_workers},
    broker::StatsBroker,
    cache::LinkCache,
    config::{AppConfig, LogFormat},
    error::ServiceError,
    logging::try_init_subscriber,
    resolver::Resolver,
    routes,
    shortcode::GenerateShortcode,
    state::AppState,
    storage::{LinkStore, RealtimeCache, postgres::PgStore, redis::RedisCache},
};

/// Grace period between the shutdown signal and force-closing subscriber
/// streams, so short in-flight requests drain first.
const SHUTDOWN_DRAIN_GRACE: Duration = Duration::from_secs(2);
/// Upper bound on waiting for workers to flush their tail batches.
const WORKER_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Everything the serving loop needs besides the router.
pub struct Runtime<Gen, Store, Kv> {
    pub state: AppState<Gen, Store, Kv>,
    pub worker_handles: Vec<JoinHandle<()>>,
}

/// Initialize logging subsystem.
pub fn init_logging(config: &AppConfig) -> Result<WorkerGuard, ServiceError> {
    let (stdout, guard) = tracing_appender::non_blocking(std::io::stdout());

    match config.log_format {
        LogFormat::Json => {
            let subscriber =
                crate::logging::build_json_subscriber("linkpulse", &config.rust_log, stdout);
            try_init_subscriber(subscriber)?;
        }
        LogFormat::Plain => {
            let subscriber = crate::logging::build_plain_subscriber(&config.rust_log, stdout);
            try_init_subscriber(subscriber)?;
        }
    }

    Ok(guard)
}

/// Connect to the primary store.
pub async fn init_store(config: &AppConfig) -> Result<PgStore, ServiceError> {
    let store = PgStore::connect(
        config.database_url_str(),
        config.db_pool_size,
        config.db_pool_min_idle,
    )
    .await?;
    tracing::info!("Connected to PostgreSQL");
    Ok(store)
}

/// Build the Redis pool and verify connectivity.
pub async fn init_kv(config: &AppConfig) -> Result<RedisCache, ServiceError> {
    let kv = RedisCache::connect(&config.redis_connection_url(), config.kv_pool_size)?;
    kv.ping().await?;
    tracing::info!("Connected to Redis");
    Ok(kv)
}

/// Wire the process singletons, pre-populate L1, and start the worker pool.
pub async fn build_runtime<Gen, Store, Kv>(
    config: &AppConfig,
    store: Store,
    kv: Kv,
    generator: Gen,
) -> Runtime<Gen, Store, Kv>
where
    Gen: GenerateShortcode + Clone + Send + Sync + 'static,
    Store: LinkStore + Clone + Send + Sync + 'static,
    Kv: RealtimeCache + Clone + Send + Sync + 'static,
{
    let resolver = Resolver::new(LinkCache::new(), store.clone(), kv.clone());

    // Pre-populate before serving so steady-state redirects are L1 hits.
    // A failure here degrades the first requests to store lookups, it does
    // not prevent startup.
    match resolver.prepopulate().await {
        Ok(count) => tracing::info!(links = count, "Pre-populated L1 cache"),
        Err(e) => tracing::warn!(error = %e, "Failed to pre-populate L1 cache"),
    }

    let queue = ClickQueue::new();
    let broker = StatsBroker::new();

    let worker_handles = spawn_workers(
        FlushConfig::default(),
        &queue,
        store.clone(),
        Arc::clone(&broker),
    );

    let state = AppState::new(
        config.base_url.clone(),
        config.frontend_url.clone(),
        store,
        kv,
        resolver,
        generator,
        config.shortcode_max_retries,
        queue,
        broker,
    );

    Runtime {
        state,
        worker_handles,
    }
}

/// Start the HTTP server with graceful shutdown.
///
/// When `shutdown_signal` fires, axum stops accepting and drains in-flight
/// requests; after a short grace the broker force-closes subscriber streams,
/// which would otherwise keep the drain waiting forever.
pub async fn start_server<F>(
    router: Router,
    addr: SocketAddr,
    broker: Arc<StatsBroker>,
    shutdown_signal: F,
) -> Result<(), ServiceError>
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    tracing::info!(%addr, "Starting server");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| ServiceError::Internal(format!("Failed to bind to {addr}: {e}")))?;

    let shutdown = async move {
        shutdown_signal.await;
        tokio::spawn(async move {
            tokio::time::sleep(SHUTDOWN_DRAIN_GRACE).await;
            broker.shutdown();
        });
    };

    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
    .map_err(|e| ServiceError::Internal(format!("Server error: {e}")))?;

    Ok(())
}

/// Stop the worker pool: close the queue so workers drain buffered events
/// and flush their tail batches, then wait for them with an upper bound.
pub async fn shutdown_workers(queue: &ClickQueue, handles: Vec<JoinHandle<()>>) {
    tracing::info!(
        buffered = queue.len(),
        dropped = queue.dropped_count(),
        "Shutting down analytics workers"
    );

    queue.close();

    let join_all = async {
        for handle in handles {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Analytics worker panicked during shutdown");
            }
        }
    };

    match tokio::time::timeout(WORKER_SHUTDOWN_TIMEOUT, join_all).await {
        Ok(()) => {
            if queue.is_empty() {
                tracing::info!("Analytics workers stopped, all buffered events flushed");
            } else {
                tracing::warn!(
                    remaining = queue.len(),
                    "Analytics workers stopped with events still buffered"
                );
            }
        }
        Err(_) => {
            tracing::error!(
                remaining = queue.len(),
                "Analytics worker shutdown timed out, buffered events may be lost"
            );
        }
    }
}

/// Build the router for the given runtime.
pub fn build_router<Gen, Store, Kv>(
    runtime: &Runtime<Gen, Store, Kv>,
    config: &AppConfig,
) -> Result<Router, ServiceError>
where
    Gen: GenerateShortcode + Clone + Send + Sync + 'static,
    Store: LinkStore + Clone + Send + Sync + 'static,
    Kv: RealtimeCache + Clone + Send + Sync + 'static,
{
    routes::build_router(runtime.state.clone(), config)
}
