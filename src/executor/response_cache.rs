// src/executor/response_cache.rs
//! In-memory response cache
//!
//! Keyed by the signal fingerprint (`type:sha256(data):priority`). Entries
//! expire `ttl` after insertion and are evicted lazily on lookup. When full,
//! the oldest-inserted entry goes first.

use crate::executor::result::ClassificationResult;
use crate::signal::Signal;
use crate::utils::config::CacheConfig;
use indexmap::IndexMap;
use serde::Serialize;
use std::time::Duration;
use tokio::time::Instant;
use tracing::trace;

#[derive(Debug, Clone)]
struct CacheEntry {
    result: ClassificationResult,
    created_at: Instant,
}

/// Bounded TTL cache of classification results
#[derive(Debug)]
pub struct ResponseCache {
    /// Insertion-ordered entries
    entries: IndexMap<String, CacheEntry>,

    ttl: Duration,

    max_entries: usize,

    enabled: bool,

    hits: u64,
    misses: u64,
    evictions: u64,
    expirations: u64,
}

impl ResponseCache {
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            entries: IndexMap::new(),
            ttl: config.ttl(),
            max_entries: config.max_entries.max(1),
            enabled: config.enabled,
            hits: 0,
            misses: 0,
            evictions: 0,
            expirations: 0,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Look up a live entry; an expired one is evicted and reported as a miss
    pub fn get(&mut self, signal: &Signal) -> Option<ClassificationResult> {
        if !self.enabled {
            return None;
        }

        let key = signal.fingerprint();
        let fresh = match self.entries.get(&key) {
            Some(entry) => entry.created_at.elapsed() < self.ttl,
            None => {
                self.misses += 1;
                return None;
            }
        };

        if !fresh {
            trace!("Cache entry for {} expired", signal.id);
            self.entries.shift_remove(&key);
            self.expirations += 1;
            self.misses += 1;
            return None;
        }

        self.hits += 1;
        self.entries.get(&key).map(|entry| entry.result.clone())
    }

    pub fn put(&mut self, signal: &Signal, result: ClassificationResult) {
        if !self.enabled {
            return;
        }

        let key = signal.fingerprint();
        // Re-insertion counts as newest
        self.entries.shift_remove(&key);

        while self.entries.len() >= self.max_entries {
            if self.entries.shift_remove_index(0).is_none() {
                break;
            }
            self.evictions += 1;
        }

        self.entries.insert(
            key,
            CacheEntry {
                result,
                created_at: Instant::now(),
            },
        );
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        let lookups = self.hits + self.misses;
        CacheStats {
            enabled: self.enabled,
            entries: self.entries.len(),
            max_entries: self.max_entries,
            hits: self.hits,
            misses: self.misses,
            evictions: self.evictions,
            expirations: self.expirations,
            hit_rate: if lookups == 0 {
                0.0
            } else {
                self.hits as f64 / lookups as f64
            },
        }
    }
}

/// Cache counters
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CacheStats {
    pub enabled: bool,
    pub entries: usize,
    pub max_entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub hit_rate: f64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::budget::SectionSizes;
    use crate::provider::TokenUsage;
    use serde_json::json;

    fn signal(id: &str, text: &str) -> Signal {
        Signal::new(id, "todo", "notes.md", json!({ "text": text }))
    }

    fn result(id: &str) -> ClassificationResult {
        ClassificationResult {
            signal_id: id.to_string(),
            classification: json!({"urgency": "low"}),
            recommendations: vec![],
            token_usage: TokenUsage::default(),
            confidence: 0.5,
            processing_time_ms: 3,
            cache_hit: false,
            retry_count: 0,
            fallback: false,
            error: None,
            sections: SectionSizes::default(),
        }
    }

    fn cache(ttl_ms: u64, max_entries: usize) -> ResponseCache {
        ResponseCache::new(&CacheConfig {
            enabled: true,
            ttl_ms,
            max_entries,
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_hit_within_ttl() {
        let mut cache = cache(1_000, 10);
        let s = signal("sig_1", "fix the build");
        cache.put(&s, result("sig_1"));

        tokio::time::advance(Duration::from_millis(999)).await;
        assert_eq!(cache.get(&s).unwrap().signal_id, "sig_1");
        assert_eq!(cache.stats().hits, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_entry_is_evicted() {
        let mut cache = cache(1_000, 10);
        let s = signal("sig_1", "fix the build");
        cache.put(&s, result("sig_1"));

        tokio::time::advance(Duration::from_millis(1_000)).await;
        assert!(cache.get(&s).is_none());
        assert!(cache.is_empty());

        let stats = cache.stats();
        assert_eq!(stats.expirations, 1);
        assert_eq!(stats.misses, 1);
    }

    #[tokio::test]
    async fn test_same_payload_different_id_shares_entry() {
        let mut cache = cache(60_000, 10);
        cache.put(&signal("sig_1", "same"), result("sig_1"));
        assert!(cache.get(&signal("sig_2", "same")).is_some());
        assert!(cache.get(&signal("sig_3", "different")).is_none());
    }

    #[tokio::test]
    async fn test_oldest_inserted_evicted_when_full() {
        let mut cache = cache(60_000, 2);
        let a = signal("a", "a");
        let b = signal("b", "b");
        let c = signal("c", "c");

        cache.put(&a, result("a"));
        cache.put(&b, result("b"));
        // A lookup does not refresh insertion order
        assert!(cache.get(&a).is_some());
        cache.put(&c, result("c"));

        assert!(cache.get(&a).is_none());
        assert!(cache.get(&b).is_some());
        assert!(cache.get(&c).is_some());
        assert_eq!(cache.stats().evictions, 1);
    }

    #[tokio::test]
    async fn test_disabled_cache_stores_nothing() {
        let mut cache = ResponseCache::new(&CacheConfig {
            enabled: false,
            ..Default::default()
        });
        let s = signal("sig_1", "x");
        cache.put(&s, result("sig_1"));
        assert!(cache.get(&s).is_none());
        assert_eq!(cache.len(), 0);
    }

    #[tokio::test]
    async fn test_clear() {
        let mut cache = cache(60_000, 10);
        cache.put(&signal("a", "a"), result("a"));
        cache.clear();
        assert!(cache.is_empty());
    }
}
