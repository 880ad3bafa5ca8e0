use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use async_channel::{Receiver, Sender, TrySendError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Capacity of the in-process ingest queue. Chosen so a multi-second worker
/// stall at ~1000 RPS is absorbed without blocking the redirect path.
pub const QUEUE_CAPACITY: usize = 10_000;

/// A single click on a short link, captured on the redirect path and
/// persisted by the worker pool. The event carries everything the
/// aggregation step needs so workers never touch request state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClickEvent {
    pub short_code: String,
    pub timestamp: DateTime<Utc>,
    pub ip_address: String,
    pub user_agent: String,
    /// Empty when the request carried no Referer header.
    pub referer: String,
    pub visitor_hash: String,
}

impl ClickEvent {
    pub fn new(short_code: String, ip_address: String, user_agent: String, referer: String) -> Self {
        let visitor_hash = visitor_hash(&ip_address, &user_agent);
        Self {
            short_code,
            timestamp: Utc::now(),
            ip_address,
            user_agent,
            referer,
            visitor_hash,
        }
    }
}

/// Weak unique-visitor key: lowercase hex SHA-256 of `ip || user_agent`.
pub fn visitor_hash(ip: &str, user_agent: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(ip.as_bytes());
    hasher.update(user_agent.as_bytes());
    hex::encode(hasher.finalize())
}

/// Bounded multi-producer multi-consumer FIFO of click events.
///
/// The producer side is strictly non-blocking: [`ClickQueue::offer`] either
/// enqueues immediately or drops the event, so backpressure can never reach
/// the redirect path. Consumers (the worker pool) receive asynchronously;
/// closing the queue lets them drain what is buffered and then stop.
#[derive(Clone)]
pub struct ClickQueue {
    tx: Sender<ClickEvent>,
    rx: Receiver<ClickEvent>,
    dropped: Arc<AtomicU64>,
}

impl ClickQueue {
    pub fn new() -> Self {
        Self::with_capacity(QUEUE_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, rx) = async_channel::bounded(capacity);
        Self {
            tx,
            rx,
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Non-blocking enqueue. Returns `false` when the event was dropped
    /// because the queue is full or already closed.
    pub fn offer(&self, event: ClickEvent) -> bool {
        match self.tx.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(event)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    short_code = %event.short_code,
                    "Analytics queue full, dropping click event"
                );
                false
            }
            Err(TrySendError::Closed(event)) => {
                tracing::debug!(
                    short_code = %event.short_code,
                    "Analytics queue closed, discarding click event"
                );
                false
            }
        }
    }

    /// Consumer handle for a worker. Receivers share the FIFO: each event is
    /// delivered to exactly one worker.
    pub fn subscribe(&self) -> Receiver<ClickEvent> {
        self.rx.clone()
    }

    /// Stop accepting events. Buffered events remain receivable until the
    /// queue is drained, after which `recv` reports closure.
    pub fn close(&self) {
        self.tx.close();
    }

    pub fn len(&self) -> usize {
        self.tx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tx.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.tx.capacity().unwrap_or(usize::MAX)
    }

    /// Events discarded because the queue was full.
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Default for ClickQueue {
    fn default() -> Self {
        Self::new()
    }
}
