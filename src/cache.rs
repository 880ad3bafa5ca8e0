use std::sync::Arc;

use dashmap::DashMap;

/// Process-local L1 cache mapping short code -> original URL.
///
/// Pre-populated with every known link at startup, so steady-state redirects
/// resolve without touching the database. Entries have no TTL and are never
/// evicted: links are immutable and the only writers either read the value
/// from the store or inserted it there first, so last-writer-wins publishing
/// is safe.
#[derive(Clone, Default)]
pub struct LinkCache {
    entries: Arc<DashMap<String, String>>,
}

impl LinkCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, short_code: &str) -> Option<String> {
        self.entries.get(short_code).map(|url| url.value().clone())
    }

    pub fn insert(&self, short_code: &str, original_url: &str) {
        self.entries
            .insert(short_code.to_string(), original_url.to_string());
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
