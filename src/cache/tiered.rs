//! Tiered cache - one pool per data class
//!
//! | Pool          | Key          | Value                 |
//! |---------------|--------------|-----------------------|
//! | `raw`         | `SeriesSet`  | fetched series        |
//! | `transformed` | `SeriesSet`  | rank-prefiltered data |
//! | `sampled`     | `SampleKey`  | sampled result set    |
//!
//! Pools are independent: filling `sampled` never evicts `raw`. A background
//! sweeper removes expired entries on an interval.

use super::pool::{CachePool, PoolConfig, PoolControl, PoolName, PoolStats};
use crate::sampling::{SampledSet, SamplingConfig};
use crate::types::{SeriesId, SeriesMap, SeriesSet};
use parking_lot::RwLock;
use serde::Serialize;
use std::fmt;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

// ============================================================================
// Sample Key
// ============================================================================

/// Key of a sampled result: hash of the series set and the normalized config
///
/// Configs that differ only in fields a disabled config ignores produce the
/// same key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct SampleKey(u64);

impl SampleKey {
    /// Derive the key for `series` sampled with `config`
    pub fn new(series: &SeriesSet, config: &SamplingConfig) -> Self {
        let mut hasher = DefaultHasher::new();
        series.hash(&mut hasher);
        config.normalized().hash(&mut hasher);
        SampleKey(hasher.finish())
    }

    /// Raw hash value
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SampleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

// ============================================================================
// Configuration
// ============================================================================

/// Limits for all three pools
#[derive(Debug, Clone)]
pub struct TieredCacheConfig {
    /// Raw series pool
    pub raw: PoolConfig,
    /// Pre-filtered series pool
    pub transformed: PoolConfig,
    /// Sampled result pool
    pub sampled: PoolConfig,
    /// How often the sweeper removes expired entries
    pub sweep_interval: Duration,
}

impl Default for TieredCacheConfig {
    fn default() -> Self {
        Self {
            raw: PoolConfig::default().with_max_memory(256 * 1024 * 1024),
            transformed: PoolConfig::default().with_max_memory(128 * 1024 * 1024),
            sampled: PoolConfig::default(),
            sweep_interval: Duration::from_secs(30),
        }
    }
}

/// Statistics for the whole cache
#[derive(Debug, Clone, Serialize)]
pub struct TieredCacheStats {
    /// Per-pool statistics in `raw`, `transformed`, `sampled` order
    pub pools: Vec<PoolStats>,
    /// Sum of estimated bytes across pools
    pub total_memory_bytes: usize,
    /// Sum of entries across pools
    pub total_entries: usize,
    /// Hits over requests across all pools
    pub overall_hit_rate: f64,
}

impl TieredCacheStats {
    /// Statistics for one pool
    pub fn pool(&self, name: PoolName) -> Option<&PoolStats> {
        self.pools.iter().find(|p| p.name == name)
    }
}

// ============================================================================
// Tiered Cache
// ============================================================================

/// Three independent pools plus a background expiry sweeper
pub struct TieredCache {
    raw: Arc<CachePool<SeriesSet, Arc<SeriesMap>>>,
    transformed: Arc<CachePool<SeriesSet, Arc<SeriesMap>>>,
    sampled: Arc<CachePool<SampleKey, Arc<SampledSet>>>,
    sweep_interval: Duration,

    /// Sweeper task handle
    sweeper_handle: RwLock<Option<JoinHandle<()>>>,

    /// Sweeper shutdown signal
    shutdown_tx: RwLock<Option<mpsc::Sender<()>>>,
}

impl TieredCache {
    /// Create a cache with the given limits
    pub fn new(config: TieredCacheConfig) -> Self {
        Self {
            raw: Arc::new(CachePool::new(PoolName::Raw, config.raw)),
            transformed: Arc::new(CachePool::new(PoolName::Transformed, config.transformed)),
            sampled: Arc::new(CachePool::new(PoolName::Sampled, config.sampled)),
            sweep_interval: config.sweep_interval,
            sweeper_handle: RwLock::new(None),
            shutdown_tx: RwLock::new(None),
        }
    }

    /// Raw series pool
    pub fn raw(&self) -> &CachePool<SeriesSet, Arc<SeriesMap>> {
        &self.raw
    }

    /// Pre-filtered series pool
    pub fn transformed(&self) -> &CachePool<SeriesSet, Arc<SeriesMap>> {
        &self.transformed
    }

    /// Sampled result pool
    pub fn sampled(&self) -> &CachePool<SampleKey, Arc<SampledSet>> {
        &self.sampled
    }

    fn pools(&self) -> [&dyn PoolControl; 3] {
        [
            self.raw.as_ref(),
            self.transformed.as_ref(),
            self.sampled.as_ref(),
        ]
    }

    /// Clear one pool, or every pool when `pool` is `None`
    pub fn clear(&self, pool: Option<PoolName>) -> usize {
        let removed: usize = self
            .pools()
            .into_iter()
            .filter(|p| pool.map_or(true, |name| p.pool_name() == name))
            .map(|p| p.clear_all())
            .sum();
        info!(pool = ?pool, removed, "Cache cleared");
        removed
    }

    /// Evict the least-recently-used half of every pool
    pub fn evict_half(&self) -> usize {
        let removed: usize = self.pools().into_iter().map(|p| p.evict_lru_half()).sum();
        info!(removed, "Evicted half of every cache pool");
        removed
    }

    /// Remove expired entries from every pool
    pub fn sweep_expired(&self) -> usize {
        let removed: usize = self.pools().into_iter().map(|p| p.sweep()).sum();
        if removed > 0 {
            debug!(removed, "Swept expired cache entries");
        }
        removed
    }

    /// Drop raw and transformed entries whose series set contains `id`
    pub fn invalidate_series(&self, id: SeriesId) -> usize {
        self.raw.remove_where(|set| set.contains(id))
            + self.transformed.remove_where(|set| set.contains(id))
    }

    /// Statistics snapshot for every pool
    pub fn stats(&self) -> TieredCacheStats {
        let pools: Vec<PoolStats> = self.pools().into_iter().map(|p| p.snapshot()).collect();
        let hits: u64 = pools.iter().map(|p| p.hits).sum();
        let requests: u64 = pools.iter().map(|p| p.hits + p.misses).sum();

        TieredCacheStats {
            total_memory_bytes: pools.iter().map(|p| p.memory_bytes).sum(),
            total_entries: pools.iter().map(|p| p.size).sum(),
            overall_hit_rate: if requests == 0 {
                0.0
            } else {
                hits as f64 / requests as f64
            },
            pools,
        }
    }

    /// Start the expiry sweeper
    ///
    /// Calling it while a sweeper is running is a no-op. Must be called from
    /// within a tokio runtime.
    pub fn start_sweeper(&self) {
        if self.sweeper_handle.read().is_some() {
            return;
        }

        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        let raw = Arc::clone(&self.raw);
        let transformed = Arc::clone(&self.transformed);
        let sampled = Arc::clone(&self.sampled);
        let period = self.sweep_interval;

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            // First tick completes immediately
            interval.tick().await;

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let removed = raw.sweep_expired()
                            + transformed.sweep_expired()
                            + sampled.sweep_expired();
                        if removed > 0 {
                            debug!(removed, "Sweeper removed expired entries");
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        break;
                    }
                }
            }
        });

        *self.sweeper_handle.write() = Some(handle);
        *self.shutdown_tx.write() = Some(shutdown_tx);
        debug!(interval_ms = period.as_millis() as u64, "Cache sweeper started");
    }

    /// Stop the expiry sweeper and wait for it to exit
    pub async fn stop_sweeper(&self) {
        // Take both out of their locks before awaiting
        let tx = self.shutdown_tx.write().take();
        if let Some(tx) = tx {
            let _ = tx.send(()).await;
        }

        let handle = self.sweeper_handle.write().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    /// Check whether the sweeper is running
    pub fn sweeper_running(&self) -> bool {
        self.sweeper_handle
            .read()
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }
}

impl Default for TieredCache {
    fn default() -> Self {
        Self::new(TieredCacheConfig::default())
    }
}

impl Drop for TieredCache {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.write().take() {
            let _ = tx.try_send(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sampling::{SampleResult, SamplingMethod};
    use crate::types::Point;
    use std::collections::BTreeMap;

    fn series_map(id: SeriesId, n: i64) -> Arc<SeriesMap> {
        Arc::new(SeriesMap::from([(
            id,
            (0..n).map(|i| Point::new(i, i as f64)).collect(),
        )]))
    }

    fn sampled_set(n: i64) -> Arc<SampledSet> {
        let points: Vec<Point> = (0..n).map(|i| Point::new(i, 0.0)).collect();
        Arc::new(SampledSet::from_parts(
            BTreeMap::from([(1, SampleResult::unchanged(&points))]),
            SamplingConfig::default(),
        ))
    }

    #[test]
    fn test_sample_key_normalizes_disabled_configs() {
        let set = SeriesSet::from_ids([1, 2]);
        let a = SamplingConfig::default().disabled();
        let b = SamplingConfig::default().disabled().with_target_points(5);
        assert_eq!(SampleKey::new(&set, &a), SampleKey::new(&set, &b));

        let lttb = SamplingConfig::default();
        let nth = SamplingConfig::new(SamplingMethod::Nth, 1000).unwrap();
        assert_ne!(SampleKey::new(&set, &lttb), SampleKey::new(&set, &nth));
    }

    #[test]
    fn test_sample_key_ignores_id_order() {
        let config = SamplingConfig::default();
        assert_eq!(
            SampleKey::new(&SeriesSet::from_ids([3, 1, 2]), &config),
            SampleKey::new(&SeriesSet::from_ids([1, 2, 3]), &config)
        );
    }

    #[test]
    fn test_pools_are_independent() {
        let config = TieredCacheConfig {
            sampled: PoolConfig::default().with_max_entries(1),
            ..Default::default()
        };
        let cache = TieredCache::new(config);
        let set = SeriesSet::single(1);
        cache.raw().set(set.clone(), series_map(1, 10));

        cache.sampled().set(SampleKey(1), sampled_set(5));
        cache.sampled().set(SampleKey(2), sampled_set(5));

        assert_eq!(cache.sampled().len(), 1);
        assert!(cache.raw().contains(&set));
    }

    #[test]
    fn test_clear_single_pool_and_all() {
        let cache = TieredCache::default();
        cache.raw().set(SeriesSet::single(1), series_map(1, 10));
        cache.transformed().set(SeriesSet::single(1), series_map(1, 5));
        cache.sampled().set(SampleKey(7), sampled_set(5));

        assert_eq!(cache.clear(Some(PoolName::Sampled)), 1);
        assert!(cache.sampled().is_empty());
        assert_eq!(cache.raw().len(), 1);

        assert_eq!(cache.clear(None), 2);
        let stats = cache.stats();
        assert_eq!(stats.total_entries, 0);
        assert_eq!(stats.total_memory_bytes, 0);
    }

    #[test]
    fn test_stats_report_every_pool() {
        let cache = TieredCache::default();
        cache.raw().set(SeriesSet::single(1), series_map(1, 10));
        cache.raw().get(&SeriesSet::single(1));
        cache.raw().get(&SeriesSet::single(2));

        let stats = cache.stats();
        assert_eq!(stats.pools.len(), 3);
        let raw = stats.pool(PoolName::Raw).unwrap();
        assert_eq!(raw.size, 1);
        assert!(raw.memory_bytes > 0);
        assert_eq!(stats.overall_hit_rate, 0.5);
    }

    #[test]
    fn test_invalidate_series() {
        let cache = TieredCache::default();
        cache.raw().set(SeriesSet::from_ids([1, 2]), series_map(1, 3));
        cache.raw().set(SeriesSet::single(3), series_map(3, 3));
        assert_eq!(cache.invalidate_series(2), 1);
        assert!(cache.raw().contains(&SeriesSet::single(3)));
    }

    #[tokio::test]
    async fn test_sweeper_removes_expired() {
        let config = TieredCacheConfig {
            sweep_interval: Duration::from_millis(20),
            ..Default::default()
        };
        let cache = TieredCache::new(config);
        cache
            .raw()
            .set_with_ttl(SeriesSet::single(1), series_map(1, 4), Duration::from_millis(10));

        cache.start_sweeper();
        assert!(cache.sweeper_running());
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(cache.raw().is_empty());

        cache.stop_sweeper().await;
        assert!(!cache.sweeper_running());
    }
}
