use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;

/// Mailbox depth per subscriber. A slow client loses updates rather than
/// stalling the worker that broadcasts them.
pub const MAILBOX_CAPACITY: usize = 10;

/// Stats update pushed to subscribers after each flush that touched the
/// short code. Carries the stored running total, not a delta, so receivers
/// see non-decreasing totals even across lossy delivery.
#[derive(Debug, Clone, Serialize)]
pub struct StatsUpdate {
    pub short_code: String,
    pub timestamp: DateTime<Utc>,
    pub total_clicks: i64,
}

/// Per-short-code registry of live subscriber mailboxes.
///
/// Broadcast is fire-and-forget: a full or closed mailbox is skipped for
/// that subscriber only. Subscribers deregister through the RAII guard
/// handed out by [`StatsBroker::subscribe`], so a dropped stream always
/// cleans up its entry.
pub struct StatsBroker {
    inner: Mutex<BrokerInner>,
}

struct BrokerInner {
    channels: HashMap<String, HashMap<u64, mpsc::Sender<String>>>,
    next_id: u64,
    closed: bool,
}

pub struct Subscription {
    pub receiver: mpsc::Receiver<String>,
    pub guard: SubscriptionGuard,
}

impl Subscription {
    pub fn into_parts(self) -> (mpsc::Receiver<String>, SubscriptionGuard) {
        (self.receiver, self.guard)
    }
}

/// Removes the mailbox from the broker when dropped.
pub struct SubscriptionGuard {
    broker: Arc<StatsBroker>,
    short_code: String,
    id: u64,
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        self.broker.remove(&self.short_code, self.id);
    }
}

impl StatsBroker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(BrokerInner {
                channels: HashMap::new(),
                next_id: 0,
                closed: false,
            }),
        })
    }

    /// Register a new mailbox for `short_code`.
    ///
    /// After [`StatsBroker::shutdown`] the mailbox is created but not
    /// registered, so the subscriber's stream ends immediately.
    pub fn subscribe(self: &Arc<Self>, short_code: &str) -> Subscription {
        let (tx, rx) = mpsc::channel(MAILBOX_CAPACITY);

        let id = {
            let mut inner = self.inner.lock().expect("broker lock poisoned");
            let id = inner.next_id;
            inner.next_id += 1;
            if !inner.closed {
                inner
                    .channels
                    .entry(short_code.to_string())
                    .or_default()
                    .insert(id, tx);
            }
            id
        };

        tracing::debug!(short_code = %short_code, subscriber_id = id, "Subscriber registered");

        Subscription {
            receiver: rx,
            guard: SubscriptionGuard {
                broker: Arc::clone(self),
                short_code: short_code.to_string(),
                id,
            },
        }
    }

    fn remove(&self, short_code: &str, id: u64) {
        let mut inner = self.inner.lock().expect("broker lock poisoned");
        if let Some(mailboxes) = inner.channels.get_mut(short_code) {
            mailboxes.remove(&id);
            if mailboxes.is_empty() {
                inner.channels.remove(short_code);
            }
        }
    }

    /// Deliver `payload` to every mailbox registered for `short_code`.
    /// Non-blocking: full and closed mailboxes are skipped.
    pub fn broadcast(&self, short_code: &str, payload: &str) {
        let inner = self.inner.lock().expect("broker lock poisoned");
        let Some(mailboxes) = inner.channels.get(short_code) else {
            return;
        };

        for (id, tx) in mailboxes {
            match tx.try_send(payload.to_string()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::debug!(
                        short_code = %short_code,
                        subscriber_id = id,
                        "Subscriber mailbox full, skipping update"
                    );
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
        }
    }

    /// Drop every registered mailbox so subscriber streams terminate, and
    /// refuse new registrations. Used during graceful shutdown.
    pub fn shutdown(&self) {
        let mut inner = self.inner.lock().expect("broker lock poisoned");
        inner.closed = true;
        inner.channels.clear();
        tracing::info!("Stats broker shut down, all subscriber streams closed");
    }

    /// Number of short codes with at least one subscriber.
    pub fn channel_count(&self) -> usize {
        self.inner.lock().expect("broker lock poisoned").channels.len()
    }

    /// Total registered mailboxes across all short codes.
    pub fn subscriber_count(&self) -> usize {
        self.inner
            .lock()
            .expect("broker lock poisoned")
            .channels
            .values()
            .map(|m| m.len())
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn broadcast_reaches_all_subscribers_for_code() {
        let broker = StatsBroker::new();
        let mut sub1 = broker.subscribe("abc123");
        let mut sub2 = broker.subscribe("abc123");
        let mut other = broker.subscribe("zzz999");

        broker.broadcast("abc123", "{\"total_clicks\":1}");

        assert_eq!(sub1.receiver.recv().await.unwrap(), "{\"total_clicks\":1}");
        assert_eq!(sub2.receiver.recv().await.unwrap(), "{\"total_clicks\":1}");
        assert!(other.receiver.try_recv().is_err());
    }

    #[tokio::test]
    async fn broadcast_to_unknown_code_is_noop() {
        let broker = StatsBroker::new();
        broker.broadcast("nobody", "payload");
        assert_eq!(broker.channel_count(), 0);
    }

    #[tokio::test]
    async fn full_mailbox_skips_that_subscriber_only() {
        let broker = StatsBroker::new();
        let mut slow = broker.subscribe("abc123");
        let mut fast = broker.subscribe("abc123");

        // Fill the slow subscriber's mailbox without draining it.
        for i in 0..MAILBOX_CAPACITY + 1 {
            broker.broadcast("abc123", &format!("update-{i}"));
            // Keep the fast subscriber drained so only `slow` fills up.
            assert_eq!(fast.receiver.recv().await.unwrap(), format!("update-{i}"));
        }

        // The slow mailbox holds exactly MAILBOX_CAPACITY messages; the
        // overflowing broadcast was skipped for it.
        let mut received = 0;
        while slow.receiver.try_recv().is_ok() {
            received += 1;
        }
        assert_eq!(received, MAILBOX_CAPACITY);
    }

    #[tokio::test]
    async fn per_mailbox_delivery_preserves_order() {
        let broker = StatsBroker::new();
        let mut sub = broker.subscribe("abc123");

        for i in 0..5 {
            broker.broadcast("abc123", &format!("update-{i}"));
        }
        for i in 0..5 {
            assert_eq!(sub.receiver.recv().await.unwrap(), format!("update-{i}"));
        }
    }

    #[tokio::test]
    async fn dropping_guard_deregisters_and_removes_empty_entry() {
        let broker = StatsBroker::new();
        let sub = broker.subscribe("abc123");
        assert_eq!(broker.channel_count(), 1);
        assert_eq!(broker.subscriber_count(), 1);

        drop(sub);
        assert_eq!(broker.channel_count(), 0);
        assert_eq!(broker.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn shutdown_closes_streams_and_blocks_new_registrations() {
        let broker = StatsBroker::new();
        let mut sub = broker.subscribe("abc123");

        broker.shutdown();

        // Sender side dropped: the mailbox reports closure.
        assert!(sub.receiver.recv().await.is_none());

        // New subscriptions terminate immediately.
        let mut late = broker.subscribe("abc123");
        assert!(late.receiver.recv().await.is_none());
        assert_eq!(broker.subscriber_count(), 0);
    }
}
