//! Process-local dedup window. The durable `webhook_events` row (keyed by
//! `delivery_id`) is the real linearization point; this cache exists so a
//! burst of retried deliveries within the window short-circuits before
//! ever touching the store.

use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

pub struct DedupCache {
    window: Duration,
    seen: Mutex<HashMap<String, Instant>>,
}

impl DedupCache {
    pub fn new(window: Duration) -> Self {
        Self { window, seen: Mutex::new(HashMap::new()) }
    }

    /// Returns `true` if `key` was already seen within the window (and
    /// records it either way, refreshing its timestamp).
    pub async fn check_and_record(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut seen = self.seen.lock().await;

        let is_duplicate = match seen.get(key) {
            Some(seen_at) => now.duration_since(*seen_at) < self.window,
            None => false,
        };

        seen.insert(key.to_string(), now);
        is_duplicate
    }

    pub async fn sweep(&self) {
        let now = Instant::now();
        let window = self.window;
        let mut seen = self.seen.lock().await;
        seen.retain(|_, seen_at| now.duration_since(*seen_at) < window);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn second_call_within_window_is_a_duplicate() {
        let cache = DedupCache::new(Duration::from_secs(60));
        assert!(!cache.check_and_record("k1").await);
        assert!(cache.check_and_record("k1").await);
    }

    #[tokio::test]
    async fn distinct_keys_do_not_collide() {
        let cache = DedupCache::new(Duration::from_secs(60));
        assert!(!cache.check_and_record("k1").await);
        assert!(!cache.check_and_record("k2").await);
    }

    #[tokio::test]
    async fn sweep_evicts_stale_entries() {
        let cache = DedupCache::new(Duration::from_millis(10));
        cache.check_and_record("k1").await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        cache.sweep().await;
        assert!(!cache.check_and_record("k1").await);
    }
}
