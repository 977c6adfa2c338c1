//! Sampling coordinator
//!
//! Owns the tiered cache and turns `(series set, config)` requests into
//! cached [`SampledSet`]s. Each key moves through
//! `Absent -> Computing -> Ready`, and back to `Absent` on expiry, eviction
//! or failure. While a key is `Computing`, every caller for that key awaits
//! one shared handle; the computation runs in its own task, so callers that
//! give up do not cancel it.

use super::executor::{ExecutorConfig, SamplingExecutor, SamplingTask};
use crate::cache::{PoolName, PressureResponder, PressureSensor, SampleKey, TieredCache, TieredCacheConfig, TieredCacheStats};
use crate::error::{Error, Result};
use crate::metrics;
use crate::sampling::{
    reduce, PerSeriesSampler, ProgressiveConfig, ProgressiveResolutionManager, SampleResult, SampledSet,
    SamplingConfig,
};
use crate::source::{fetch_set, RankPrefilter, SeriesProvider};
use crate::types::{total_points, SeriesId, SeriesMap, SeriesSet};
use futures::future::{try_join_all, BoxFuture, FutureExt, Shared};
use parking_lot::{Mutex, RwLock};
use rayon::prelude::*;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinHandle;
use tracing::{debug, info};

type SharedSample = Shared<BoxFuture<'static, Result<Arc<SampledSet>>>>;

// ============================================================================
// Configuration
// ============================================================================

/// Coordinator settings
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Pool limits
    pub cache: TieredCacheConfig,
    /// Lower bound on each series' share of the point budget
    pub min_floor: usize,
    /// Progressive upgrade tuning
    pub progressive: ProgressiveConfig,
    /// Executor to run reductions on
    pub executor: ExecutorConfig,
    /// Series longer than this are rank-prefiltered (0 = never)
    pub prefilter_threshold: usize,
    /// Rows kept by the rank prefilter
    pub prefilter_rows: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            cache: TieredCacheConfig::default(),
            min_floor: PerSeriesSampler::DEFAULT_MIN_FLOOR,
            progressive: ProgressiveConfig::default(),
            executor: ExecutorConfig::default(),
            prefilter_threshold: 0,
            prefilter_rows: 100_000,
        }
    }
}

/// Coordinator statistics
#[derive(Debug, Clone, Serialize)]
pub struct CoordinatorStats {
    /// Cache pools
    pub cache: TieredCacheStats,
    /// Keys currently being computed
    pub in_flight: usize,
    /// Computations started (cache misses that were not coalesced)
    pub computations: u64,
    /// Requests that attached to an in-flight computation
    pub coalesced: u64,
    /// Upgrades served from a cached lower- or higher-resolution entry
    pub progressive_upgrades: u64,
}

// ============================================================================
// Builder
// ============================================================================

/// Builder for [`SamplingCoordinator`]
pub struct SamplingCoordinatorBuilder {
    config: CoordinatorConfig,
    cache: Option<Arc<TieredCache>>,
    executor: Option<Arc<dyn SamplingExecutor>>,
    prefilter: Option<Arc<dyn RankPrefilter>>,
}

impl SamplingCoordinatorBuilder {
    /// Start from default settings
    pub fn new() -> Self {
        Self {
            config: CoordinatorConfig::default(),
            cache: None,
            executor: None,
            prefilter: None,
        }
    }

    /// Replace the settings
    pub fn with_config(mut self, config: CoordinatorConfig) -> Self {
        self.config = config;
        self
    }

    /// Share an existing cache instead of building one from the settings
    pub fn with_cache(mut self, cache: Arc<TieredCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Use a specific executor instead of building one from the settings
    pub fn with_executor<E>(mut self, executor: E) -> Self
    where
        E: SamplingExecutor + 'static,
    {
        self.executor = Some(Arc::new(executor));
        self
    }

    /// Use a specific executor from an existing Arc
    pub fn with_executor_arc(mut self, executor: Arc<dyn SamplingExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Enable rank prefiltering of long series
    pub fn with_prefilter<P>(mut self, prefilter: P) -> Self
    where
        P: RankPrefilter + 'static,
    {
        self.prefilter = Some(Arc::new(prefilter));
        self
    }

    /// Build the coordinator
    pub fn build(self) -> Result<SamplingCoordinator> {
        let executor = match self.executor {
            Some(executor) => executor,
            None => self.config.executor.build()?,
        };
        let cache = self
            .cache
            .unwrap_or_else(|| Arc::new(TieredCache::new(self.config.cache.clone())));

        info!(
            executor = executor.name(),
            min_floor = self.config.min_floor,
            prefilter = self.prefilter.is_some(),
            "Sampling coordinator created"
        );

        Ok(SamplingCoordinator {
            inner: Arc::new(Inner {
                cache,
                executor,
                sampler: PerSeriesSampler::new(self.config.min_floor),
                progressive: ProgressiveResolutionManager::new(self.config.progressive),
                prefilter: self.prefilter,
                prefilter_threshold: self.config.prefilter_threshold,
                prefilter_rows: self.config.prefilter_rows.max(2),
                in_flight: Mutex::new(HashMap::new()),
                resolution_index: RwLock::new(HashMap::new()),
                next_task_id: AtomicU64::new(0),
                computations: AtomicU64::new(0),
                coalesced: AtomicU64::new(0),
                progressive_upgrades: AtomicU64::new(0),
            }),
        })
    }
}

impl Default for SamplingCoordinatorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Coordinator
// ============================================================================

struct Inner {
    cache: Arc<TieredCache>,
    executor: Arc<dyn SamplingExecutor>,
    sampler: PerSeriesSampler,
    progressive: ProgressiveResolutionManager,
    prefilter: Option<Arc<dyn RankPrefilter>>,
    prefilter_threshold: usize,
    prefilter_rows: usize,

    /// Shared handles of keys being computed
    in_flight: Mutex<HashMap<SampleKey, SharedSample>>,

    /// Series set -> normalized configs stored in the sampled pool
    /// Entries can outlive the cached value; lookups verify and prune.
    resolution_index: RwLock<HashMap<SeriesSet, Vec<SamplingConfig>>>,

    next_task_id: AtomicU64,
    computations: AtomicU64,
    coalesced: AtomicU64,
    progressive_upgrades: AtomicU64,
}

/// Clears a key's in-flight slot when the computing task ends, including by
/// panic
struct InFlightGuard {
    inner: Arc<Inner>,
    key: SampleKey,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.inner.in_flight.lock().remove(&self.key);
    }
}

/// Cached, coalescing front end for sampling
///
/// Cheap to clone; clones share the cache and in-flight state.
#[derive(Clone)]
pub struct SamplingCoordinator {
    inner: Arc<Inner>,
}

impl SamplingCoordinator {
    /// Coordinator with default settings
    pub fn new() -> Result<Self> {
        SamplingCoordinatorBuilder::new().build()
    }

    /// Start building a coordinator
    pub fn builder() -> SamplingCoordinatorBuilder {
        SamplingCoordinatorBuilder::new()
    }

    /// Cache owned by this coordinator
    pub fn cache(&self) -> &Arc<TieredCache> {
        &self.inner.cache
    }

    /// Sample `series` with `config`, reusing a cached or in-flight result
    ///
    /// The config is validated before any state changes. Failures are not
    /// cached: the next call for the same key computes again.
    pub async fn sample_by_key(
        &self,
        series: &SeriesSet,
        provider: Arc<dyn SeriesProvider>,
        config: &SamplingConfig,
    ) -> Result<Arc<SampledSet>> {
        let config = Self::prepare(series, config)?;
        let key = SampleKey::new(series, &config);

        if let Some(hit) = self.inner.cache.sampled().get(&key) {
            debug!(%key, series = %series, "Sampled cache hit");
            return Ok(hit);
        }

        let inner = Arc::clone(&self.inner);
        let owned_series = series.clone();
        self.join_or_start(key, move || {
            async move { inner.compute(&owned_series, provider.as_ref(), config).await }.boxed()
        })
        .await
    }

    /// Sample `series` at `new_config`, starting from a cached entry of the
    /// same series set and method when one exists
    ///
    /// A lower-resolution entry is upgraded by filling its low-density gaps;
    /// failing that, a higher-resolution entry is reduced. The result is
    /// stored under `new_config`'s key and the source entry stays cached.
    /// The provider is used when the original points are no longer cached.
    pub async fn upgrade_resolution(
        &self,
        series: &SeriesSet,
        provider: Arc<dyn SeriesProvider>,
        new_config: &SamplingConfig,
    ) -> Result<Arc<SampledSet>> {
        let config = Self::prepare(series, new_config)?;
        let key = SampleKey::new(series, &config);

        if let Some(hit) = self.inner.cache.sampled().get(&key) {
            return Ok(hit);
        }

        let inner = Arc::clone(&self.inner);
        let owned_series = series.clone();
        self.join_or_start(key, move || {
            async move { inner.compute_upgrade(&owned_series, provider.as_ref(), config).await }.boxed()
        })
        .await
    }

    /// Drop every cached entry that depends on `id`
    pub fn invalidate_series(&self, id: SeriesId) -> usize {
        let sets: Vec<(SeriesSet, Vec<SamplingConfig>)> = {
            let mut index = self.inner.resolution_index.write();
            let affected: Vec<SeriesSet> = index.keys().filter(|set| set.contains(id)).cloned().collect();
            affected
                .into_iter()
                .filter_map(|set| index.remove(&set).map(|configs| (set, configs)))
                .collect()
        };

        let mut removed = 0;
        for (set, configs) in &sets {
            for config in configs {
                if self.inner.cache.sampled().remove(&SampleKey::new(set, config)).is_some() {
                    removed += 1;
                }
            }
        }
        removed += self.inner.cache.invalidate_series(id);

        info!(series_id = %id, removed, "Invalidated cached entries for series");
        removed
    }

    /// Clear one pool, or all of them
    pub fn clear_cache(&self, pool: Option<PoolName>) -> usize {
        if matches!(pool, None | Some(PoolName::Sampled)) {
            self.inner.resolution_index.write().clear();
        }
        self.inner.cache.clear(pool)
    }

    /// Keys currently being computed
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.lock().len()
    }

    /// Statistics snapshot
    pub fn stats(&self) -> CoordinatorStats {
        CoordinatorStats {
            cache: self.inner.cache.stats(),
            in_flight: self.in_flight(),
            computations: self.inner.computations.load(Ordering::Relaxed),
            coalesced: self.inner.coalesced.load(Ordering::Relaxed),
            progressive_upgrades: self.inner.progressive_upgrades.load(Ordering::Relaxed),
        }
    }

    /// Evict from the cache as `sensor` reports rising memory pressure
    ///
    /// Must be called from within a tokio runtime. The task ends when the
    /// sensor's channel closes.
    pub fn watch_pressure(&self, sensor: &dyn PressureSensor) -> JoinHandle<()> {
        let responder = Arc::new(PressureResponder::new(Arc::clone(&self.inner.cache)));
        responder.spawn(sensor)
    }

    fn prepare(series: &SeriesSet, config: &SamplingConfig) -> Result<SamplingConfig> {
        config.validate()?;
        if series.is_empty() {
            return Err(Error::InvalidConfig("series set is empty".into()));
        }
        Ok(config.normalized())
    }

    /// Attach to the in-flight computation for `key`, or start one
    fn join_or_start<F>(&self, key: SampleKey, start: F) -> SharedSample
    where
        F: FnOnce() -> BoxFuture<'static, Result<Arc<SampledSet>>>,
    {
        let mut in_flight = self.inner.in_flight.lock();

        if let Some(pending) = in_flight.get(&key) {
            self.inner.coalesced.fetch_add(1, Ordering::Relaxed);
            metrics::record_coalesced_request();
            debug!(%key, "Attached to in-flight computation");
            return pending.clone();
        }

        // A computation may have finished between the first lookup and taking
        // the lock; it stores its result before releasing its slot.
        if let Some(ready) = self.inner.cache.sampled().peek(&key) {
            return futures::future::ready(Ok(ready)).boxed().shared();
        }

        self.inner.computations.fetch_add(1, Ordering::Relaxed);
        let guard = InFlightGuard {
            inner: Arc::clone(&self.inner),
            key,
        };
        let work = start();
        let handle = tokio::spawn(async move {
            let _guard = guard;
            work.await
        });

        let shared = async move {
            match handle.await {
                Ok(result) => result,
                Err(e) => Err(Error::Internal(format!("sampling task aborted: {}", e))),
            }
        }
        .boxed()
        .shared();

        in_flight.insert(key, shared.clone());
        shared
    }
}

/// Series ready for sampling plus the point counts the provider returned
struct LoadedSeries {
    data: Arc<SeriesMap>,
    source_lengths: BTreeMap<SeriesId, usize>,
}

/// Report `original_count` against the provider's series, not the
/// prefiltered copy that was sampled
fn restore_source_counts(
    per_series: &mut BTreeMap<SeriesId, SampleResult>,
    source_lengths: &BTreeMap<SeriesId, usize>,
) {
    for (id, result) in per_series.iter_mut() {
        if let Some(len) = source_lengths.get(id) {
            result.original_count = *len;
        }
    }
}

impl Inner {
    /// Full computation for a miss
    async fn compute(
        &self,
        series: &SeriesSet,
        provider: &dyn SeriesProvider,
        config: SamplingConfig,
    ) -> Result<Arc<SampledSet>> {
        let start = Instant::now();
        let LoadedSeries { data, source_lengths } = self.load_series(series, provider).await?;

        let lengths: BTreeMap<SeriesId, usize> = data.iter().map(|(id, p)| (*id, p.len())).collect();
        let budgets = self.sampler.budgets(&lengths, config.target_points);

        let tasks = data.iter().map(|(id, points)| {
            let task = Arc::new(SamplingTask {
                id: self.next_task_id.fetch_add(1, Ordering::Relaxed),
                series_id: *id,
                points: points.clone(),
                target_points: budgets.get(id).copied().unwrap_or(self.sampler.min_floor()),
                config,
            });
            let executor = Arc::clone(&self.executor);
            async move { executor.execute(task).await.map(|result| (*id, result)) }
        });
        let mut per_series: BTreeMap<SeriesId, SampleResult> = try_join_all(tasks).await?.into_iter().collect();
        restore_source_counts(&mut per_series, &source_lengths);

        let set = Arc::new(SampledSet::from_parts(per_series, config));
        debug!(
            series = %series,
            method = %config.method,
            original = set.merged.original_count,
            sampled = set.merged.sampled_count,
            duration_ms = start.elapsed().as_millis() as u64,
            "Sampled series set"
        );
        self.store(series, config, Arc::clone(&set));
        Ok(set)
    }

    /// Progressive computation from a cached neighbour, or a full one
    async fn compute_upgrade(
        &self,
        series: &SeriesSet,
        provider: &dyn SeriesProvider,
        config: SamplingConfig,
    ) -> Result<Arc<SampledSet>> {
        let Some(base) = self.find_base(series, &config) else {
            debug!(series = %series, "No cached resolution to upgrade from");
            return self.compute(series, provider, config).await;
        };

        let LoadedSeries { data, source_lengths } = self.load_series(series, provider).await?;
        let lengths: BTreeMap<SeriesId, usize> = data.iter().map(|(id, p)| (*id, p.len())).collect();
        let old_budgets = self.sampler.budgets(&lengths, base.config.target_points);
        let new_budgets = self.sampler.budgets(&lengths, config.target_points);
        let manager = self.progressive.clone();
        let min_floor = self.sampler.min_floor();

        let mut per_series = tokio::task::spawn_blocking(move || {
            data.par_iter()
                .map(|(id, original)| -> Result<(SeriesId, SampleResult)> {
                    let target = config.with_target_points(new_budgets.get(id).copied().unwrap_or(min_floor));
                    let result = match base.per_series.get(id) {
                        Some(existing) => {
                            let from = base
                                .config
                                .with_target_points(old_budgets.get(id).copied().unwrap_or(min_floor));
                            manager.upgrade(original, existing, &from, &target)?
                        },
                        None => reduce(original, &target)?,
                    };
                    Ok((*id, result))
                })
                .collect::<Result<BTreeMap<SeriesId, SampleResult>>>()
        })
        .await
        .map_err(|e| Error::Internal(format!("upgrade task aborted: {}", e)))??;
        restore_source_counts(&mut per_series, &source_lengths);

        self.progressive_upgrades.fetch_add(1, Ordering::Relaxed);
        let set = Arc::new(SampledSet::from_parts(per_series, config));
        debug!(
            series = %series,
            target = config.target_points,
            sampled = set.merged.sampled_count,
            "Progressive resolution change"
        );
        self.store(series, config, Arc::clone(&set));
        Ok(set)
    }

    /// Points to sample: raw pool, provider, then optional prefilter
    async fn load_series(&self, series: &SeriesSet, provider: &dyn SeriesProvider) -> Result<LoadedSeries> {
        let raw = match self.cache.raw().get(series) {
            Some(raw) => raw,
            None => {
                let fetched = Arc::new(fetch_set(provider, series).await?);
                self.cache.raw().set(series.clone(), Arc::clone(&fetched));
                fetched
            },
        };
        let source_lengths: BTreeMap<SeriesId, usize> = raw.iter().map(|(id, p)| (*id, p.len())).collect();

        let Some(prefilter) = &self.prefilter else {
            return Ok(LoadedSeries {
                data: raw,
                source_lengths,
            });
        };
        if self.prefilter_threshold == 0 || raw.values().all(|p| p.len() <= self.prefilter_threshold) {
            return Ok(LoadedSeries {
                data: raw,
                source_lengths,
            });
        }

        if let Some(filtered) = self.cache.transformed().get(series) {
            return Ok(LoadedSeries {
                data: filtered,
                source_lengths,
            });
        }

        let mut filtered = SeriesMap::new();
        for (id, points) in raw.iter() {
            let reduced = if points.len() > self.prefilter_threshold {
                prefilter.prefilter(points, self.prefilter_rows)?
            } else {
                points.clone()
            };
            filtered.insert(*id, reduced);
        }
        debug!(
            series = %series,
            before = total_points(&raw),
            after = total_points(&filtered),
            "Rank prefilter applied"
        );
        let filtered = Arc::new(filtered);
        self.cache.transformed().set(series.clone(), Arc::clone(&filtered));
        Ok(LoadedSeries {
            data: filtered,
            source_lengths,
        })
    }

    /// Store a result and record it in the resolution index
    fn store(&self, series: &SeriesSet, config: SamplingConfig, set: Arc<SampledSet>) {
        if !self.cache.sampled().set(SampleKey::new(series, &config), set) {
            return;
        }
        let mut index = self.resolution_index.write();
        let configs = index.entry(series.clone()).or_default();
        if !configs.contains(&config) {
            configs.push(config);
        }
    }

    /// Cached entry to derive `target` from
    ///
    /// Prefers the highest resolution below the target, then the lowest
    /// above it. Only entries with the same method qualify.
    fn find_base(&self, series: &SeriesSet, target: &SamplingConfig) -> Option<Arc<SampledSet>> {
        if !target.enabled {
            return None;
        }

        let mut candidates: Vec<SamplingConfig> = self
            .resolution_index
            .read()
            .get(series)?
            .iter()
            .filter(|c| c.enabled && c.method == target.method && c.target_points != target.target_points)
            .copied()
            .collect();

        // Lower entries first (highest first), then higher entries (lowest first)
        candidates.sort_by_key(|c| {
            if c.target_points < target.target_points {
                (0, usize::MAX - c.target_points)
            } else {
                (1, c.target_points)
            }
        });

        let mut stale = Vec::new();
        let mut found = None;
        for candidate in candidates {
            match self.cache.sampled().get(&SampleKey::new(series, &candidate)) {
                Some(set) => {
                    found = Some(set);
                    break;
                },
                None => stale.push(candidate),
            }
        }

        if !stale.is_empty() {
            if let Some(configs) = self.resolution_index.write().get_mut(series) {
                configs.retain(|c| !stale.contains(c));
            }
        }
        found
    }
}
