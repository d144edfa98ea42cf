//! In-process response cache with per-resource TTL and tag-based
//! invalidation. Tags are derived from the endpoint (`repo:<o/r>`,
//! `org:<o>`, `type:<resource>`) so a mutating call can drop everything
//! touching a repository without tracking individual keys.

use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

#[derive(Clone)]
struct CacheEntry {
    value: serde_json::Value,
    expires_at: Instant,
    tags: Vec<String>,
}

pub struct ResponseCache {
    entries: RwLock<HashMap<String, CacheEntry>>,
}

impl ResponseCache {
    pub fn new() -> Self {
        Self { entries: RwLock::new(HashMap::new()) }
    }

    pub async fn get(&self, key: &str) -> Option<serde_json::Value> {
        let entries = self.entries.read().await;
        entries.get(key).filter(|e| e.expires_at > Instant::now()).map(|e| e.value.clone())
    }

    pub async fn set(&self, key: impl Into<String>, value: serde_json::Value, ttl: Duration, tags: Vec<String>) {
        let mut entries = self.entries.write().await;
        entries.insert(key.into(), CacheEntry { value, expires_at: Instant::now() + ttl, tags });
    }

    pub async fn invalidate_tag(&self, tag: &str) {
        let mut entries = self.entries.write().await;
        entries.retain(|_, e| !e.tags.iter().any(|t| t == tag));
    }

    pub async fn sweep(&self) {
        let mut entries = self.entries.write().await;
        let now = Instant::now();
        entries.retain(|_, e| e.expires_at > now);
    }
}

impl Default for ResponseCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-resource-kind TTLs named in the contract: static entities 1h,
/// dynamic 1-5min, realtime 1min.
#[derive(Debug, Clone, Copy)]
pub enum TtlClass {
    Static,
    Dynamic,
    Realtime,
}

impl TtlClass {
    pub fn duration(self) -> Duration {
        match self {
            TtlClass::Static => Duration::from_secs(3600),
            TtlClass::Dynamic => Duration::from_secs(120),
            TtlClass::Realtime => Duration::from_secs(60),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_then_get_round_trips() {
        let cache = ResponseCache::new();
        cache
            .set("repo:o/r:runners", serde_json::json!([1, 2]), Duration::from_secs(60), vec!["repo:o/r".into()])
            .await;
        assert_eq!(cache.get("repo:o/r:runners").await, Some(serde_json::json!([1, 2])));
    }

    #[tokio::test]
    async fn invalidate_tag_drops_matching_entries_only() {
        let cache = ResponseCache::new();
        cache.set("a", serde_json::json!(1), Duration::from_secs(60), vec!["repo:o/r".into()]).await;
        cache.set("b", serde_json::json!(2), Duration::from_secs(60), vec!["org:o".into()]).await;

        cache.invalidate_tag("repo:o/r").await;

        assert!(cache.get("a").await.is_none());
        assert!(cache.get("b").await.is_some());
    }

    #[tokio::test]
    async fn expired_entries_are_not_returned() {
        let cache = ResponseCache::new();
        cache.set("a", serde_json::json!(1), Duration::from_millis(1), vec![]).await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(cache.get("a").await.is_none());
    }
}
