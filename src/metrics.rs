use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Instant,
};

/// Process-wide request counters.
///
/// Constructed once at startup and passed down by handle; handlers bump the
/// counters with relaxed atomics so the hot path pays a single uncontended
/// add.
#[derive(Clone)]
pub struct Metrics {
    inner: Arc<MetricsInner>,
}

struct MetricsInner {
    started_at: Instant,
    requests_total: AtomicU64,
    errors_total: AtomicU64,
}

#[derive(Debug, Clone, Copy)]
pub struct MetricsSnapshot {
    pub uptime_seconds: u64,
    pub requests_total: u64,
    pub errors_total: u64,
    pub error_rate_percent: f64,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner {
                started_at: Instant::now(),
                requests_total: AtomicU64::new(0),
                errors_total: AtomicU64::new(0),
            }),
        }
    }

    pub fn record_request(&self) {
        self.inner.requests_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.inner.errors_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let requests = self.inner.requests_total.load(Ordering::Relaxed);
        let errors = self.inner.errors_total.load(Ordering::Relaxed);
        let error_rate = if requests > 0 {
            errors as f64 / requests as f64 * 100.0
        } else {
            0.0
        };

        MetricsSnapshot {
            uptime_seconds: self.inner.started_at.elapsed().as_secs(),
            requests_total: requests,
            errors_total: errors,
            error_rate_percent: error_rate,
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
