//! Cache pool - LRU + TTL + memory-bounded container for one data class
//!
//! A pool is generic over key and value. Each pool has its own entry limit,
//! byte budget and default TTL; pressure in one pool never evicts from
//! another.
//!
//! # Eviction
//!
//! - `set` evicts least-recently-used entries until both
//!   `current_bytes + size <= max_memory_bytes` and `len < max_entries`
//! - `get` on an entry older than its TTL deletes it and reports a miss,
//!   even if it was read a moment ago
//! - `sweep_expired` removes dead entries without waiting for a read
//!
//! # Example
//!
//! ```rust
//! use kuba_sampling::cache::{CachePool, PoolConfig, PoolName};
//! use kuba_sampling::Point;
//! use std::sync::Arc;
//!
//! let pool: CachePool<u64, Arc<Vec<Point>>> =
//!     CachePool::new(PoolName::Raw, PoolConfig::default().with_max_entries(2));
//! pool.set(1, Arc::new(vec![Point::new(0, 0.0); 16]));
//! assert!(pool.get(&1).is_some());
//! ```

use crate::metrics;
use crate::sampling::{SampleResult, SampledSet};
use crate::types::{Point, SeriesMap};
use lru::LruCache;
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Size charged for a value whose estimate failed
pub const FALLBACK_ENTRY_SIZE: usize = 64 * 1024;

/// Cap on any single estimate
const MAX_ESTIMATED_SIZE: usize = 1024 * 1024 * 1024; // 1GB

// ============================================================================
// Size Estimation
// ============================================================================

/// Structural size approximation of a cached value
///
/// Returns `None` when the estimate cannot be computed (overflow); the pool
/// then charges [`PoolConfig::fallback_entry_size`] instead of failing.
pub trait EstimateSize {
    /// Approximate heap + inline size in bytes
    fn estimated_size(&self) -> Option<usize>;
}

fn points_size(points: &[Point]) -> Option<usize> {
    points.len().checked_mul(std::mem::size_of::<Point>())
}

impl EstimateSize for Vec<Point> {
    fn estimated_size(&self) -> Option<usize> {
        points_size(self)?.checked_add(std::mem::size_of::<Vec<Point>>())
    }
}

impl EstimateSize for SampleResult {
    fn estimated_size(&self) -> Option<usize> {
        points_size(&self.points)?.checked_add(std::mem::size_of::<SampleResult>())
    }
}

impl EstimateSize for SampledSet {
    fn estimated_size(&self) -> Option<usize> {
        let mut size = std::mem::size_of::<SampledSet>();
        size = size.checked_add(self.merged.estimated_size()?)?;
        for result in self.per_series.values() {
            // Key + tree node overhead
            size = size.checked_add(result.estimated_size()?)?.checked_add(32)?;
        }
        Some(size)
    }
}

impl EstimateSize for SeriesMap {
    fn estimated_size(&self) -> Option<usize> {
        let mut size = std::mem::size_of::<SeriesMap>();
        for series in self.values() {
            size = size.checked_add(series.estimated_size()?)?.checked_add(32)?;
        }
        Some(size)
    }
}

impl<T: EstimateSize + ?Sized> EstimateSize for Arc<T> {
    fn estimated_size(&self) -> Option<usize> {
        self.as_ref().estimated_size()
    }
}

// ============================================================================
// Pool Configuration
// ============================================================================

/// Name of a pool (one per data class)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PoolName {
    /// Series as fetched from the provider
    Raw,
    /// Series after rank pre-filtering
    Transformed,
    /// Sampled results
    Sampled,
}

impl PoolName {
    /// All pools in a fixed order
    pub const ALL: [PoolName; 3] = [PoolName::Raw, PoolName::Transformed, PoolName::Sampled];

    /// Lowercase name (used as a metric label)
    pub fn as_str(&self) -> &'static str {
        match self {
            PoolName::Raw => "raw",
            PoolName::Transformed => "transformed",
            PoolName::Sampled => "sampled",
        }
    }
}

impl fmt::Display for PoolName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Limits for one pool
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum number of entries (default: 1,000)
    pub max_entries: usize,

    /// Maximum total estimated size (default: 64 MB)
    pub max_memory_bytes: usize,

    /// TTL applied when `set` is called without one (default: 5 minutes)
    pub default_ttl: Duration,

    /// Entries estimated above this are not cached (default: 16 MB)
    pub max_entry_size_bytes: usize,

    /// Size charged when estimation fails
    pub fallback_entry_size: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_entries: 1_000,
            max_memory_bytes: 64 * 1024 * 1024,
            default_ttl: Duration::from_secs(300),
            max_entry_size_bytes: 16 * 1024 * 1024,
            fallback_entry_size: FALLBACK_ENTRY_SIZE,
        }
    }
}

impl PoolConfig {
    /// Set maximum entries
    pub fn with_max_entries(mut self, entries: usize) -> Self {
        self.max_entries = entries.max(1);
        self
    }

    /// Set the byte budget
    pub fn with_max_memory(mut self, bytes: usize) -> Self {
        self.max_memory_bytes = bytes;
        self
    }

    /// Set default TTL
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    /// Set maximum entry size in bytes
    pub fn with_max_entry_size(mut self, bytes: usize) -> Self {
        self.max_entry_size_bytes = bytes;
        self
    }
}

// ============================================================================
// Entries and Statistics
// ============================================================================

/// Cached value with accounting metadata
struct PoolEntry<V> {
    value: V,
    size_bytes: usize,
    created_at: Instant,
    last_accessed: Instant,
    ttl: Duration,
}

impl<V> PoolEntry<V> {
    fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.created_at) > self.ttl
    }
}

/// Hit/miss/eviction counters
#[derive(Debug, Default)]
struct PoolCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
}

/// Point-in-time statistics for one pool
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    /// Pool name
    pub name: PoolName,
    /// Current number of entries
    pub size: usize,
    /// Current estimated size in bytes
    pub memory_bytes: usize,
    /// Entry limit
    pub max_entries: usize,
    /// Byte budget
    pub max_memory_bytes: usize,
    /// Total hits
    pub hits: u64,
    /// Total misses (including expired reads)
    pub misses: u64,
    /// Entries removed to make room or by mass eviction
    pub evictions: u64,
    /// Entries removed because their TTL elapsed
    pub expirations: u64,
    /// Hit rate (0.0 to 1.0)
    pub hit_rate: f64,
}

struct PoolState<K: Hash + Eq, V> {
    entries: LruCache<K, PoolEntry<V>>,
    current_bytes: usize,
}

impl<K: Hash + Eq, V> PoolState<K, V> {
    fn release(&mut self, size: usize) {
        self.current_bytes = self.current_bytes.saturating_sub(size);
    }
}

// ============================================================================
// Cache Pool
// ============================================================================

/// LRU + TTL + memory-bounded cache for one data class
///
/// All mutation (insert, promote, evict) happens under one lock that is
/// never held across an await or a computation.
pub struct CachePool<K: Hash + Eq, V> {
    name: PoolName,
    config: PoolConfig,
    state: Mutex<PoolState<K, V>>,
    counters: PoolCounters,
}

impl<K, V> CachePool<K, V>
where
    K: Hash + Eq + Clone + fmt::Debug,
    V: Clone + EstimateSize,
{
    /// Create an empty pool
    pub fn new(name: PoolName, config: PoolConfig) -> Self {
        Self {
            name,
            config,
            state: Mutex::new(PoolState {
                entries: LruCache::unbounded(),
                current_bytes: 0,
            }),
            counters: PoolCounters::default(),
        }
    }

    /// Pool name
    pub fn name(&self) -> PoolName {
        self.name
    }

    /// Pool limits
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Insert with the pool's default TTL
    pub fn set(&self, key: K, value: V) -> bool {
        self.set_with_ttl(key, value, self.config.default_ttl)
    }

    /// Insert with an explicit TTL
    ///
    /// Returns `false` when the value is too large to ever fit (larger than
    /// `max_entry_size_bytes` or the whole byte budget); nothing is evicted
    /// in that case.
    pub fn set_with_ttl(&self, key: K, value: V, ttl: Duration) -> bool {
        let size_bytes = self.estimate(&value);

        if size_bytes > self.config.max_entry_size_bytes || size_bytes > self.config.max_memory_bytes {
            debug!(pool = %self.name, ?key, size_bytes, "Entry too large, not cached");
            return false;
        }

        let now = Instant::now();
        let mut state = self.state.lock();

        // Replacing an existing key releases its bytes first
        if let Some(old) = state.entries.pop(&key) {
            state.release(old.size_bytes);
        }

        let mut evicted = 0u64;
        while state.current_bytes.saturating_add(size_bytes) > self.config.max_memory_bytes
            || state.entries.len() >= self.config.max_entries
        {
            match state.entries.pop_lru() {
                Some((old_key, old)) => {
                    state.release(old.size_bytes);
                    evicted += 1;
                    debug!(pool = %self.name, key = ?old_key, size = old.size_bytes, "Evicted LRU entry");
                },
                None => break,
            }
        }

        state.entries.push(
            key,
            PoolEntry {
                value,
                size_bytes,
                created_at: now,
                last_accessed: now,
                ttl,
            },
        );
        state.current_bytes = state.current_bytes.saturating_add(size_bytes);
        let current = state.current_bytes;
        drop(state);

        if evicted > 0 {
            self.counters.evictions.fetch_add(evicted, Ordering::Relaxed);
            metrics::record_cache_eviction(self.name.as_str(), "lru", evicted);
        }
        metrics::update_cache_bytes(self.name.as_str(), current);
        true
    }

    /// Look up a value, promoting it to most-recently-used
    ///
    /// Expired entries are deleted and reported as a miss.
    pub fn get(&self, key: &K) -> Option<V> {
        let now = Instant::now();
        let mut state = self.state.lock();

        let expired = match state.entries.get_mut(key) {
            None => false,
            Some(entry) if entry.is_expired(now) => true,
            Some(entry) => {
                entry.last_accessed = now;
                let value = entry.value.clone();
                drop(state);
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                metrics::record_cache_request(self.name.as_str(), "hit");
                return Some(value);
            },
        };

        if expired {
            if let Some(entry) = state.entries.pop(key) {
                state.release(entry.size_bytes);
            }
            let current = state.current_bytes;
            drop(state);
            self.counters.expirations.fetch_add(1, Ordering::Relaxed);
            metrics::record_cache_eviction(self.name.as_str(), "ttl", 1);
            metrics::update_cache_bytes(self.name.as_str(), current);
            debug!(pool = %self.name, ?key, "Entry expired on read");
        } else {
            drop(state);
        }
        self.record_miss();
        None
    }

    /// Check for a live entry without promoting it or touching statistics
    pub fn contains(&self, key: &K) -> bool {
        let now = Instant::now();
        self.state
            .lock()
            .entries
            .peek(key)
            .is_some_and(|entry| !entry.is_expired(now))
    }

    /// Look up a live value without promoting it or touching statistics
    pub fn peek(&self, key: &K) -> Option<V> {
        let now = Instant::now();
        self.state
            .lock()
            .entries
            .peek(key)
            .filter(|entry| !entry.is_expired(now))
            .map(|entry| entry.value.clone())
    }

    /// Time since the entry was last read or written
    pub fn idle_time(&self, key: &K) -> Option<Duration> {
        self.state
            .lock()
            .entries
            .peek(key)
            .map(|entry| entry.last_accessed.elapsed())
    }

    /// Remove an entry
    pub fn remove(&self, key: &K) -> Option<V> {
        let mut state = self.state.lock();
        let entry = state.entries.pop(key)?;
        state.release(entry.size_bytes);
        let current = state.current_bytes;
        drop(state);
        metrics::update_cache_bytes(self.name.as_str(), current);
        Some(entry.value)
    }

    /// Remove every entry whose key matches `predicate`
    pub fn remove_where(&self, mut predicate: impl FnMut(&K) -> bool) -> usize {
        let mut state = self.state.lock();
        let keys: Vec<K> = state
            .entries
            .iter()
            .filter(|(k, _)| predicate(k))
            .map(|(k, _)| k.clone())
            .collect();

        for key in &keys {
            if let Some(entry) = state.entries.pop(key) {
                state.release(entry.size_bytes);
            }
        }
        let current = state.current_bytes;
        drop(state);
        metrics::update_cache_bytes(self.name.as_str(), current);
        keys.len()
    }

    /// Drop every entry
    pub fn clear(&self) -> usize {
        let mut state = self.state.lock();
        let removed = state.entries.len();
        state.entries.clear();
        state.current_bytes = 0;
        drop(state);

        self.counters
            .evictions
            .fetch_add(removed as u64, Ordering::Relaxed);
        metrics::record_cache_eviction(self.name.as_str(), "clear", removed as u64);
        metrics::update_cache_bytes(self.name.as_str(), 0);
        removed
    }

    /// Drop the least-recently-used half of the entries (rounded up)
    pub fn evict_half(&self) -> usize {
        let mut state = self.state.lock();
        let target = state.entries.len().div_ceil(2);
        let mut removed = 0;
        while removed < target {
            match state.entries.pop_lru() {
                Some((_, entry)) => {
                    state.release(entry.size_bytes);
                    removed += 1;
                },
                None => break,
            }
        }
        let current = state.current_bytes;
        drop(state);

        self.counters
            .evictions
            .fetch_add(removed as u64, Ordering::Relaxed);
        metrics::record_cache_eviction(self.name.as_str(), "pressure", removed as u64);
        metrics::update_cache_bytes(self.name.as_str(), current);
        removed
    }

    /// Remove every expired entry
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let mut state = self.state.lock();
        let expired: Vec<K> = state
            .entries
            .iter()
            .filter(|(_, e)| e.is_expired(now))
            .map(|(k, _)| k.clone())
            .collect();

        for key in &expired {
            if let Some(entry) = state.entries.pop(key) {
                state.release(entry.size_bytes);
            }
        }
        let current = state.current_bytes;
        drop(state);

        if !expired.is_empty() {
            self.counters
                .expirations
                .fetch_add(expired.len() as u64, Ordering::Relaxed);
            metrics::record_cache_eviction(self.name.as_str(), "ttl", expired.len() as u64);
            metrics::update_cache_bytes(self.name.as_str(), current);
        }
        expired.len()
    }

    /// Keys from least to most recently used
    pub fn keys_lru_order(&self) -> Vec<K> {
        let state = self.state.lock();
        // lru iterates most recent first
        let mut keys: Vec<K> = state.entries.iter().map(|(k, _)| k.clone()).collect();
        keys.reverse();
        keys
    }

    /// Number of entries (expired entries count until swept or read)
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    /// Check if the pool is empty
    pub fn is_empty(&self) -> bool {
        self.state.lock().entries.is_empty()
    }

    /// Current estimated size in bytes
    pub fn memory_bytes(&self) -> usize {
        self.state.lock().current_bytes
    }

    /// Snapshot of statistics
    pub fn stats(&self) -> PoolStats {
        let (size, memory_bytes) = {
            let state = self.state.lock();
            (state.entries.len(), state.current_bytes)
        };
        let hits = self.counters.hits.load(Ordering::Relaxed);
        let misses = self.counters.misses.load(Ordering::Relaxed);
        let total = hits + misses;

        PoolStats {
            name: self.name,
            size,
            memory_bytes,
            max_entries: self.config.max_entries,
            max_memory_bytes: self.config.max_memory_bytes,
            hits,
            misses,
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            expirations: self.counters.expirations.load(Ordering::Relaxed),
            hit_rate: if total == 0 {
                0.0
            } else {
                hits as f64 / total as f64
            },
        }
    }

    fn estimate(&self, value: &V) -> usize {
        match value.estimated_size() {
            Some(size) => size.min(MAX_ESTIMATED_SIZE),
            None => {
                debug!(pool = %self.name, "Size estimation failed, using fallback");
                self.config.fallback_entry_size
            },
        }
    }

    fn record_miss(&self) {
        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        metrics::record_cache_request(self.name.as_str(), "miss");
    }
}

/// Pool operations that do not depend on key or value type
///
/// Lets the tiered cache and the pressure responder treat all pools alike.
pub trait PoolControl: Send + Sync {
    /// Pool name
    fn pool_name(&self) -> PoolName;
    /// Drop every entry
    fn clear_all(&self) -> usize;
    /// Drop the least-recently-used half
    fn evict_lru_half(&self) -> usize;
    /// Remove expired entries
    fn sweep(&self) -> usize;
    /// Statistics snapshot
    fn snapshot(&self) -> PoolStats;
}

impl<K, V> PoolControl for CachePool<K, V>
where
    K: Hash + Eq + Clone + fmt::Debug + Send,
    V: Clone + EstimateSize + Send,
{
    fn pool_name(&self) -> PoolName {
        self.name
    }

    fn clear_all(&self) -> usize {
        self.clear()
    }

    fn evict_lru_half(&self) -> usize {
        self.evict_half()
    }

    fn sweep(&self) -> usize {
        self.sweep_expired()
    }

    fn snapshot(&self) -> PoolStats {
        self.stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Value with a fixed, known size
    #[derive(Debug, Clone, PartialEq)]
    struct Blob(usize);

    impl EstimateSize for Blob {
        fn estimated_size(&self) -> Option<usize> {
            Some(self.0)
        }
    }

    /// Value whose estimate always fails
    #[derive(Debug, Clone)]
    struct Opaque;

    impl EstimateSize for Opaque {
        fn estimated_size(&self) -> Option<usize> {
            None
        }
    }

    fn pool(max_entries: usize, max_bytes: usize) -> CachePool<u32, Blob> {
        CachePool::new(
            PoolName::Sampled,
            PoolConfig::default()
                .with_max_entries(max_entries)
                .with_max_memory(max_bytes),
        )
    }

    #[test]
    fn test_set_then_get() {
        let pool = pool(10, 1000);
        assert!(pool.get(&1).is_none());
        assert!(pool.set(1, Blob(10)));
        assert_eq!(pool.get(&1), Some(Blob(10)));
        assert_eq!(pool.memory_bytes(), 10);

        let stats = pool.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hit_rate, 0.5);
    }

    #[test]
    fn test_ttl_expiry_beats_recent_access() {
        let pool = pool(10, 1000);
        pool.set_with_ttl(1, Blob(10), Duration::from_millis(30));
        assert!(pool.get(&1).is_some());
        std::thread::sleep(Duration::from_millis(50));
        assert!(pool.get(&1).is_none());
        assert_eq!(pool.memory_bytes(), 0);
        assert_eq!(pool.stats().expirations, 1);
    }

    #[test]
    fn test_memory_eviction_removes_oldest_only() {
        let pool = pool(100, 100);
        pool.set(1, Blob(40));
        pool.set(2, Blob(40));
        // Touch 1 so that 2 becomes least recently used
        pool.get(&1);
        pool.set(3, Blob(40));

        assert!(pool.contains(&1));
        assert!(!pool.contains(&2));
        assert!(pool.contains(&3));
        assert_eq!(pool.memory_bytes(), 80);
        assert_eq!(pool.stats().evictions, 1);
    }

    #[test]
    fn test_entry_limit_eviction() {
        let pool = pool(2, 10_000);
        pool.set(1, Blob(1));
        pool.set(2, Blob(1));
        pool.set(3, Blob(1));
        assert_eq!(pool.len(), 2);
        assert!(!pool.contains(&1));
    }

    #[test]
    fn test_oversize_entry_rejected() {
        let pool = pool(10, 100);
        pool.set(1, Blob(50));
        assert!(!pool.set(2, Blob(101)));
        // Nothing was evicted for the rejected entry
        assert!(pool.contains(&1));
        assert_eq!(pool.memory_bytes(), 50);
    }

    #[test]
    fn test_replace_releases_old_bytes() {
        let pool = pool(10, 100);
        pool.set(1, Blob(60));
        pool.set(1, Blob(30));
        assert_eq!(pool.memory_bytes(), 30);
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn test_failed_estimate_uses_fallback() {
        let pool: CachePool<u32, Opaque> = CachePool::new(PoolName::Raw, PoolConfig::default());
        assert!(pool.set(1, Opaque));
        assert_eq!(pool.memory_bytes(), FALLBACK_ENTRY_SIZE);
    }

    #[test]
    fn test_sweep_expired() {
        let pool = pool(10, 1000);
        pool.set_with_ttl(1, Blob(10), Duration::from_millis(10));
        pool.set_with_ttl(2, Blob(10), Duration::from_secs(60));
        std::thread::sleep(Duration::from_millis(30));

        assert_eq!(pool.sweep_expired(), 1);
        assert_eq!(pool.len(), 1);
        assert_eq!(pool.memory_bytes(), 10);
    }

    #[test]
    fn test_evict_half_takes_least_recent() {
        let pool = pool(10, 1000);
        for k in 0..5 {
            pool.set(k, Blob(1));
        }
        pool.get(&0);
        assert_eq!(pool.evict_half(), 3);
        // LRU order was 1, 2, 3, 4, 0; the oldest three go
        assert_eq!(pool.keys_lru_order(), vec![4, 0]);
        assert!(!pool.contains(&3));
    }

    #[test]
    fn test_remove_where_and_clear() {
        let pool = pool(10, 1000);
        for k in 0..6 {
            pool.set(k, Blob(2));
        }
        assert_eq!(pool.remove_where(|k| k % 2 == 0), 3);
        assert_eq!(pool.memory_bytes(), 6);
        assert_eq!(pool.clear(), 3);
        assert!(pool.is_empty());
        assert_eq!(pool.memory_bytes(), 0);
    }

    #[test]
    fn test_estimate_sizes() {
        let points: Vec<Point> = (0..10).map(|i| Point::new(i, 0.0)).collect();
        let size = points.estimated_size().unwrap();
        assert!(size >= 10 * std::mem::size_of::<Point>());

        let result = SampleResult::unchanged(&points);
        assert!(Arc::new(result).estimated_size().unwrap() >= size - std::mem::size_of::<Vec<Point>>());
    }
}
