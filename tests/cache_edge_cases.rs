//! Edge cases for cache pools and the tiered cache
//!
//! Memory accounting, LRU order under the byte bound, TTL expiry, concurrent
//! access and the background sweeper.

use kuba_sampling::cache::{CachePool, PoolConfig, PoolName, TieredCache, TieredCacheConfig};
use kuba_sampling::types::{Point, SeriesMap, SeriesSet};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Estimated bytes of a `Vec<Point>` with `n` points
fn entry_bytes(n: usize) -> usize {
    n * std::mem::size_of::<Point>() + std::mem::size_of::<Vec<Point>>()
}

fn points(n: usize) -> Vec<Point> {
    (0..n as i64).map(|i| Point::new(i, i as f64)).collect()
}

fn raw_map(ids: &[u128], n: usize) -> Arc<SeriesMap> {
    Arc::new(ids.iter().map(|id| (*id, points(n))).collect())
}

// ============================================================================
// Pool Accounting
// ============================================================================

#[test]
fn test_memory_bound_evicts_least_recent() {
    let config = PoolConfig::default()
        .with_max_memory(entry_bytes(100) * 3)
        .with_max_entries(100);
    let pool: CachePool<u64, Vec<Point>> = CachePool::new(PoolName::Raw, config);

    for key in 0..3 {
        assert!(pool.set(key, points(100)));
    }
    assert_eq!(pool.memory_bytes(), entry_bytes(100) * 3);

    // Touch 0 so 1 becomes the eviction candidate
    assert!(pool.get(&0).is_some());
    assert!(pool.set(3, points(100)));

    assert!(!pool.contains(&1));
    assert_eq!(pool.keys_lru_order(), vec![2, 0, 3]);
    assert_eq!(pool.stats().evictions, 1);
    assert!(pool.memory_bytes() <= pool.config().max_memory_bytes);
}

#[test]
fn test_large_entry_evicts_several() {
    let config = PoolConfig::default()
        .with_max_memory(entry_bytes(100) * 4)
        .with_max_entries(100);
    let pool: CachePool<u64, Vec<Point>> = CachePool::new(PoolName::Raw, config);

    for key in 0..4 {
        pool.set(key, points(100));
    }
    assert!(pool.set(9, points(250)));

    assert_eq!(pool.keys_lru_order(), vec![3, 9]);
    assert_eq!(pool.memory_bytes(), entry_bytes(100) + entry_bytes(250));
}

#[test]
fn test_oversize_entry_refused_without_eviction() {
    let config = PoolConfig::default()
        .with_max_memory(entry_bytes(100) * 10)
        .with_max_entry_size(entry_bytes(50));
    let pool: CachePool<u64, Vec<Point>> = CachePool::new(PoolName::Sampled, config);

    pool.set(1, points(10));
    assert!(!pool.set(2, points(100)));

    assert_eq!(pool.len(), 1);
    assert!(pool.contains(&1));
    assert_eq!(pool.stats().evictions, 0);
}

#[test]
fn test_replacement_releases_previous_bytes() {
    let pool: CachePool<&'static str, Vec<Point>> = CachePool::new(PoolName::Transformed, PoolConfig::default());

    pool.set("cpu", points(1_000));
    pool.set("cpu", points(10));

    assert_eq!(pool.len(), 1);
    assert_eq!(pool.memory_bytes(), entry_bytes(10));
    assert_eq!(pool.get(&"cpu").map(|p| p.len()), Some(10));
}

#[test]
fn test_expired_entry_is_a_miss() {
    let pool: CachePool<u64, Vec<Point>> = CachePool::new(PoolName::Sampled, PoolConfig::default());

    pool.set_with_ttl(1, points(5), Duration::from_millis(20));
    pool.set(2, points(5));
    thread::sleep(Duration::from_millis(40));

    assert!(!pool.contains(&1));
    assert!(pool.peek(&1).is_none());
    assert!(pool.get(&1).is_none());
    assert!(pool.get(&2).is_some());

    let stats = pool.stats();
    assert_eq!(stats.size, 1);
    assert_eq!(stats.misses, 1);
    assert_eq!(stats.hits, 1);
    assert_eq!(stats.expirations, 1);
    assert_eq!(stats.memory_bytes, entry_bytes(5));
}

#[test]
fn test_evict_half_of_odd_pool() {
    let pool: CachePool<u64, Vec<Point>> = CachePool::new(PoolName::Raw, PoolConfig::default());
    for key in 0..5 {
        pool.set(key, points(1));
    }

    assert_eq!(pool.evict_half(), 3);
    assert_eq!(pool.keys_lru_order(), vec![3, 4]);
    assert_eq!(pool.evict_half(), 1);
    assert_eq!(pool.evict_half(), 1);
    assert_eq!(pool.evict_half(), 0);
    assert_eq!(pool.memory_bytes(), 0);
}

#[test]
fn test_concurrent_writers_respect_bounds() {
    let config = PoolConfig::default()
        .with_max_memory(entry_bytes(50) * 20)
        .with_max_entries(32);
    let pool: Arc<CachePool<u64, Vec<Point>>> = Arc::new(CachePool::new(PoolName::Raw, config));

    let handles: Vec<_> = (0..8u64)
        .map(|t| {
            let pool = Arc::clone(&pool);
            thread::spawn(move || {
                for i in 0..200u64 {
                    let key = t * 1_000 + i;
                    pool.set(key, points(50));
                    let _ = pool.get(&(key / 2));
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert!(pool.len() <= 20);
    assert_eq!(pool.memory_bytes(), pool.len() * entry_bytes(50));
}

// ============================================================================
// Tiered Cache
// ============================================================================

#[test]
fn test_pools_are_independent() {
    let cache = TieredCache::default();
    let set = SeriesSet::from_ids([1, 2]);

    cache.raw().set(set.clone(), raw_map(&[1, 2], 100));
    cache.transformed().set(set.clone(), raw_map(&[1, 2], 10));

    assert_eq!(cache.clear(Some(PoolName::Transformed)), 1);
    assert!(cache.raw().contains(&set));
    assert!(cache.transformed().is_empty());
}

#[test]
fn test_invalidate_series_matches_any_member() {
    let cache = TieredCache::default();
    cache.raw().set(SeriesSet::from_ids([1, 2]), raw_map(&[1, 2], 10));
    cache.raw().set(SeriesSet::single(3), raw_map(&[3], 10));
    cache.transformed().set(SeriesSet::single(2), raw_map(&[2], 5));

    assert_eq!(cache.invalidate_series(2), 2);
    assert_eq!(cache.raw().len(), 1);
    assert!(cache.transformed().is_empty());
    assert_eq!(cache.invalidate_series(42), 0);
}

#[test]
fn test_stats_serialize_to_json() {
    let cache = TieredCache::default();
    let set = SeriesSet::single(7);
    cache.raw().set(set.clone(), raw_map(&[7], 64));
    let _ = cache.raw().get(&set);
    let _ = cache.raw().get(&SeriesSet::single(8));

    let stats = cache.stats();
    assert_eq!(stats.total_entries, 1);
    assert!((stats.overall_hit_rate - 0.5).abs() < f64::EPSILON);

    let json = serde_json::to_value(&stats).unwrap();
    let pools = json["pools"].as_array().unwrap();
    let names: Vec<&str> = pools.iter().filter_map(|p| p["name"].as_str()).collect();
    assert_eq!(names, vec!["raw", "transformed", "sampled"]);
    assert_eq!(pools[0]["size"], 1);
    assert_eq!(pools[0]["hits"], 1);
    assert_eq!(pools[0]["misses"], 1);
}

#[tokio::test]
async fn test_sweeper_removes_expired_entries() {
    let cache = TieredCache::new(TieredCacheConfig {
        raw: PoolConfig::default().with_ttl(Duration::from_millis(20)),
        sweep_interval: Duration::from_millis(10),
        ..Default::default()
    });
    cache.raw().set(SeriesSet::single(1), raw_map(&[1], 10));
    cache
        .raw()
        .set_with_ttl(SeriesSet::single(2), raw_map(&[2], 10), Duration::from_secs(60));

    cache.start_sweeper();
    assert!(cache.sweeper_running());

    for _ in 0..50 {
        if cache.raw().len() == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(cache.raw().len(), 1);
    assert!(cache.raw().contains(&SeriesSet::single(2)));
    assert!(cache.stats().pool(PoolName::Raw).unwrap().expirations >= 1);

    cache.stop_sweeper().await;
    assert!(!cache.sweeper_running());
}
