//! Bounded frequency/recency cache in front of the persistence layer
//!
//! The cache owns no source-of-truth data: clearing it at any time loses
//! nothing, the next read simply goes to persistence.

use blockgrid_monitoring::StoreMetrics;
use blockgrid_storage::Clock;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Default maximum size of the cache (50MB)
pub const DEFAULT_MAX_CACHE_SIZE_BYTES: usize = 50 * 1024 * 1024;

/// Cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Enable caching
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Hard ceiling on the estimated size of all cached values, in bytes
    #[serde(default = "default_max_size_bytes")]
    pub max_size_bytes: usize,
}

fn default_enabled() -> bool {
    true
}

fn default_max_size_bytes() -> usize {
    DEFAULT_MAX_CACHE_SIZE_BYTES
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            max_size_bytes: default_max_size_bytes(),
        }
    }
}

/// Cache entry with size and usage tracking
#[derive(Debug, Clone)]
struct CacheEntry<V> {
    value: V,
    /// Last touch (insert or read)
    timestamp: DateTime<Utc>,
    access_count: u64,
    /// Estimated size in bytes
    size: usize,
    /// Value of the global touch counter at the last touch
    recency_order: u64,
}

impl<V> CacheEntry<V> {
    /// `access_count * 1000 - age_ms / 1000 + recency_order`; lower is evicted first
    fn score(&self, now: DateTime<Utc>) -> f64 {
        let age_ms = (now - self.timestamp).num_milliseconds().max(0) as f64;
        self.access_count as f64 * 1000.0 - age_ms / 1000.0 + self.recency_order as f64
    }
}

/// Cache metrics
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CacheMetrics {
    /// Number of items in the cache
    pub item_count: usize,
    /// Total estimated size of cached items in bytes
    pub total_size_bytes: usize,
    /// Maximum capacity in bytes
    pub capacity_bytes: usize,
    /// Number of cache hits
    pub hits: u64,
    /// Number of cache misses
    pub misses: u64,
    /// Number of items evicted to make room
    pub evictions: u64,
    /// Number of values too large to ever fit
    pub rejected: u64,
    /// Hit ratio (hits / (hits + misses))
    pub hit_ratio: f64,
    /// Cache utilization (total_size_bytes / capacity_bytes)
    pub utilization: f64,
}

/// Size-bounded cache evicting by a frequency + recency score
pub struct CacheManager<V> {
    entries: HashMap<String, CacheEntry<V>>,
    config: CacheConfig,
    current_size: usize,
    hits: u64,
    misses: u64,
    evictions: u64,
    rejected: u64,
    /// Global touch counter, strictly increasing
    touch_counter: u64,
    clock: Arc<dyn Clock>,
}

impl<V> fmt::Debug for CacheManager<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheManager")
            .field("items", &self.entries.len())
            .field("current_size", &self.current_size)
            .field("max_size", &self.config.max_size_bytes)
            .field("hits", &self.hits)
            .field("misses", &self.misses)
            .field("evictions", &self.evictions)
            .finish()
    }
}

impl<V: Serialize + Clone> CacheManager<V> {
    /// Create a new cache with the given configuration
    pub fn new(config: CacheConfig, clock: Arc<dyn Clock>) -> Self {
        debug!(
            "Creating new CacheManager with max_size={} bytes, enabled={}",
            config.max_size_bytes, config.enabled
        );
        Self {
            entries: HashMap::new(),
            config,
            current_size: 0,
            hits: 0,
            misses: 0,
            evictions: 0,
            rejected: 0,
            touch_counter: 0,
            clock,
        }
    }

    /// Estimated size of a value: its serialized JSON length
    pub fn estimate_size(value: &V) -> usize {
        serde_json::to_vec(value)
            .map(|bytes| bytes.len())
            .unwrap_or_else(|_| std::mem::size_of::<V>())
    }

    fn next_touch(&mut self) -> u64 {
        self.touch_counter += 1;
        self.touch_counter
    }

    /// Insert or replace a value. Returns whether the value is now cached.
    ///
    /// Replacing a key keeps its access count. A value larger than the whole
    /// cache is rejected and any older value under the key is dropped.
    pub fn set(&mut self, key: impl Into<String>, value: V) -> bool {
        if !self.config.enabled {
            return false;
        }

        let key = key.into();
        let size = Self::estimate_size(&value);

        // Release the old entry first to avoid counting its size twice
        let previous_count = match self.entries.remove(&key) {
            Some(old) => {
                self.current_size = self.current_size.saturating_sub(old.size);
                old.access_count
            }
            None => 0,
        };

        if size > self.config.max_size_bytes {
            self.rejected += 1;
            debug!(
                "Value for {} too large to cache: {} bytes, max: {} bytes",
                key, size, self.config.max_size_bytes
            );
            return false;
        }

        if self.current_size + size > self.config.max_size_bytes {
            let needed = self.current_size + size - self.config.max_size_bytes;
            self.evict(needed);
        }

        let recency_order = self.next_touch();
        self.entries.insert(
            key.clone(),
            CacheEntry {
                value,
                timestamp: self.clock.now(),
                access_count: previous_count,
                size,
                recency_order,
            },
        );
        self.current_size += size;

        debug!(
            "Cached {} ({} bytes), cache size: {} items, {} bytes",
            key,
            size,
            self.entries.len(),
            self.current_size
        );
        true
    }

    /// Look up a value, counting a hit or a miss. A hit refreshes the
    /// entry's recency and bumps its access count.
    pub fn get(&mut self, key: &str) -> Option<V> {
        if !self.config.enabled {
            self.misses += 1;
            return None;
        }

        let now = self.clock.now();
        let recency_order = self.touch_counter + 1;

        match self.entries.get_mut(key) {
            Some(entry) => {
                entry.access_count += 1;
                entry.timestamp = now;
                entry.recency_order = recency_order;
                let value = entry.value.clone();
                self.touch_counter = recency_order;
                self.hits += 1;
                debug!("Cache hit for {}", key);
                Some(value)
            }
            None => {
                self.misses += 1;
                debug!("Cache miss for {}", key);
                None
            }
        }
    }

    /// Look up a value without touching statistics or recency
    pub fn peek(&self, key: &str) -> Option<&V> {
        self.entries.get(key).map(|entry| &entry.value)
    }

    /// Evict lowest-scoring entries until at least `needed` bytes are
    /// freed. Returns the number of entries removed.
    fn evict(&mut self, needed: usize) -> usize {
        let now = self.clock.now();
        let mut ranked: Vec<(f64, String, usize)> = self
            .entries
            .iter()
            .map(|(key, entry)| (entry.score(now), key.clone(), entry.size))
            .collect();
        ranked.sort_by(|a, b| a.0.total_cmp(&b.0).then_with(|| a.1.cmp(&b.1)));

        let mut freed = 0;
        let mut evicted = 0;
        for (score, key, size) in ranked {
            if freed >= needed {
                break;
            }
            self.entries.remove(&key);
            self.current_size = self.current_size.saturating_sub(size);
            self.evictions += 1;
            freed += size;
            evicted += 1;
            debug!("Evicted {} from cache (score {:.3}, {} bytes)", key, score, size);
        }

        if evicted > 0 {
            StoreMetrics::record_cache_evictions(evicted, freed, self.current_size);
        }
        evicted
    }

    /// Current eviction score of an entry
    pub fn eviction_score(&self, key: &str) -> Option<f64> {
        let now = self.clock.now();
        self.entries.get(key).map(|entry| entry.score(now))
    }

    /// Remove a single entry
    pub fn remove(&mut self, key: &str) -> Option<V> {
        let entry = self.entries.remove(key)?;
        self.current_size = self.current_size.saturating_sub(entry.size);
        debug!("Removed {} from cache", key);
        Some(entry.value)
    }

    /// Drop every entry. Hit/miss totals are kept.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.current_size = 0;
        debug!("Cache cleared");
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Total estimated size of cached values
    pub fn current_size(&self) -> usize {
        self.current_size
    }

    pub fn max_size(&self) -> usize {
        self.config.max_size_bytes
    }

    pub fn evictions(&self) -> u64 {
        self.evictions
    }

    /// `hits / (hits + misses)`, or 0 before any lookup
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }

    /// Get cache metrics
    pub fn metrics(&self) -> CacheMetrics {
        let capacity = self.config.max_size_bytes;
        CacheMetrics {
            item_count: self.entries.len(),
            total_size_bytes: self.current_size,
            capacity_bytes: capacity,
            hits: self.hits,
            misses: self.misses,
            evictions: self.evictions,
            rejected: self.rejected,
            hit_ratio: self.hit_rate(),
            utilization: if capacity > 0 {
                self.current_size as f64 / capacity as f64
            } else {
                0.0
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use blockgrid_storage::ManualClock;

    fn cache_with(max_size_bytes: usize) -> (CacheManager<String>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::starting_now());
        let config = CacheConfig {
            enabled: true,
            max_size_bytes,
        };
        (CacheManager::new(config, clock.clone()), clock)
    }

    /// A string whose JSON encoding is exactly `len` bytes
    fn value_of_len(len: usize) -> String {
        "x".repeat(len - 2)
    }

    #[test]
    fn test_set_and_get() {
        let (mut cache, _) = cache_with(1024);
        assert!(cache.set("0,0", "block".to_string()));

        assert_eq!(cache.get("0,0"), Some("block".to_string()));
        assert_eq!(cache.get("1,1"), None);
        assert_eq!(cache.current_size(), 7);
        assert_eq!(cache.hit_rate(), 0.5);
    }

    #[test]
    fn test_hit_rate_zero_without_requests() {
        let (cache, _) = cache_with(1024);
        assert_eq!(cache.hit_rate(), 0.0);
    }

    #[test]
    fn test_replace_does_not_double_count() {
        let (mut cache, _) = cache_with(1024);
        cache.set("k", value_of_len(10));
        cache.get("k");
        cache.set("k", value_of_len(20));

        assert_eq!(cache.len(), 1);
        assert_eq!(cache.current_size(), 20);
        // Access count carried over: 1 * 1000 + recency 3
        assert_eq!(cache.eviction_score("k"), Some(1003.0));
    }

    #[test]
    fn test_lowest_score_evicted_first() {
        let (mut cache, clock) = cache_with(30);
        cache.set("hot", value_of_len(10));
        cache.set("cold", value_of_len(10));
        cache.get("hot");
        cache.get("hot");
        clock.advance(chrono::Duration::seconds(5));

        let hot = cache.eviction_score("hot").unwrap();
        let cold = cache.eviction_score("cold").unwrap();
        assert!(cold < hot);

        // Needs 10 bytes back: exactly one eviction
        cache.set("new", value_of_len(20));
        assert!(cache.contains("hot"));
        assert!(!cache.contains("cold"));
        assert!(cache.contains("new"));
        assert_eq!(cache.evictions(), 1);
        assert!(cache.current_size() <= cache.max_size());
    }

    #[test]
    fn test_recency_breaks_ties() {
        let (mut cache, _) = cache_with(20);
        cache.set("older", value_of_len(10));
        cache.set("newer", value_of_len(10));

        cache.set("incoming", value_of_len(10));
        assert!(!cache.contains("older"));
        assert!(cache.contains("newer"));
    }

    #[test]
    fn test_size_never_exceeds_max() {
        let (mut cache, clock) = cache_with(100);
        for i in 0..50 {
            cache.set(format!("key-{}", i), value_of_len(7 + (i % 13)));
            if i % 3 == 0 {
                cache.get(&format!("key-{}", i / 2));
            }
            clock.advance(chrono::Duration::milliseconds(250));
            assert!(cache.current_size() <= 100);
        }
        assert!(cache.evictions() > 0);
    }

    #[test]
    fn test_oversized_value_rejected() {
        let (mut cache, _) = cache_with(16);
        cache.set("k", value_of_len(8));
        assert!(!cache.set("k", value_of_len(32)));

        // The stale value is gone too
        assert!(!cache.contains("k"));
        assert_eq!(cache.current_size(), 0);
        assert_eq!(cache.metrics().rejected, 1);
    }

    #[test]
    fn test_disabled_cache_stores_nothing() {
        let clock = Arc::new(ManualClock::starting_now());
        let config = CacheConfig {
            enabled: false,
            max_size_bytes: 1024,
        };
        let mut cache: CacheManager<String> = CacheManager::new(config, clock);
        assert!(!cache.set("k", "v".to_string()));
        assert_eq!(cache.get("k"), None);
        assert_eq!(cache.metrics().misses, 1);
    }

    #[test]
    fn test_clear_and_metrics() {
        let (mut cache, _) = cache_with(1000);
        cache.set("a", value_of_len(100));
        cache.set("b", value_of_len(150));
        cache.get("a");

        let metrics = cache.metrics();
        assert_eq!(metrics.item_count, 2);
        assert_eq!(metrics.total_size_bytes, 250);
        assert_eq!(metrics.utilization, 0.25);
        assert_eq!(metrics.hits, 1);

        assert_eq!(cache.remove("b"), Some(value_of_len(150)));
        cache.clear();
        assert!(cache.is_empty());
        assert_eq!(cache.current_size(), 0);
        assert_eq!(cache.metrics().hits, 1);
    }
}
