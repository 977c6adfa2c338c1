//! Configuration management
//!
//! TOML file support with `KUBA_SAMPLING_*` environment overrides and
//! defaults for every field, so an empty file is a valid config.
//!
//! ```toml
//! [sampling]
//! min_floor = 100
//!
//! [sampling.defaults]
//! target_points = 1000
//! method = { kind = "lttb" }
//!
//! [cache.sampled]
//! max_entries = 1000
//! ttl_secs = 300
//! ```

use crate::cache::{PoolConfig, TieredCacheConfig, Watermarks, FALLBACK_ENTRY_SIZE};
use crate::coordinator::{CoordinatorConfig, ExecutorConfig, ExecutorKind};
use crate::error::{Error, Result};
use crate::sampling::{ProgressiveConfig, SamplingConfig, SamplingMethod};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct Config {
    /// Cache pools and pressure watermarks
    #[serde(default)]
    pub cache: CacheSettings,

    /// Default sampling request and budgeting
    #[serde(default)]
    pub sampling: SamplingSettings,

    /// Progressive upgrade tuning
    #[serde(default)]
    pub progressive: ProgressiveSettings,

    /// Where reductions run
    #[serde(default)]
    pub executor: ExecutorSettings,
}

/// Limits of one cache pool
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct PoolSettings {
    /// Maximum number of entries
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,

    /// Byte budget in megabytes
    #[serde(default = "default_pool_mb")]
    pub max_memory_mb: usize,

    /// Default TTL in seconds
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,

    /// Largest cacheable entry in megabytes
    #[serde(default = "default_max_entry_mb")]
    pub max_entry_size_mb: usize,
}

/// Cache configuration
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct CacheSettings {
    /// Fetched series
    #[serde(default = "default_raw_pool")]
    pub raw: PoolSettings,

    /// Rank-prefiltered series
    #[serde(default = "default_transformed_pool")]
    pub transformed: PoolSettings,

    /// Sampled results
    #[serde(default)]
    pub sampled: PoolSettings,

    /// Expiry sweep interval in seconds
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,

    /// Memory pressure watermarks
    #[serde(default)]
    pub watermarks: Watermarks,
}

/// Sampling configuration
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct SamplingSettings {
    /// Request used when the caller does not pass one
    #[serde(default)]
    pub defaults: SamplingConfig,

    /// Lower bound on each series' budget
    #[serde(default = "default_min_floor")]
    pub min_floor: usize,

    /// Series longer than this are rank-prefiltered (0 = never)
    #[serde(default)]
    pub prefilter_threshold: usize,

    /// Rows kept by the rank prefilter
    #[serde(default = "default_prefilter_rows")]
    pub prefilter_rows: usize,
}

/// Progressive upgrade configuration
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ProgressiveSettings {
    /// Gap size, in expected points, above which a gap is filled
    #[serde(default = "default_density_threshold")]
    pub density_threshold: f64,
}

/// Executor configuration
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ExecutorSettings {
    /// `inline` or `rayon`
    #[serde(default)]
    pub kind: ExecutorKind,

    /// Worker threads (0 = one per core)
    #[serde(default)]
    pub threads: usize,

    /// Per-task timeout in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

// Default value functions
fn default_max_entries() -> usize { 1_000 }
fn default_pool_mb() -> usize { 64 }
fn default_ttl_secs() -> u64 { 300 }
fn default_max_entry_mb() -> usize { 16 }
fn default_sweep_interval_secs() -> u64 { 30 }
fn default_min_floor() -> usize { 100 }
fn default_prefilter_rows() -> usize { 100_000 }
fn default_density_threshold() -> f64 { 1.5 }
fn default_timeout_ms() -> u64 { 30_000 }

fn default_raw_pool() -> PoolSettings {
    PoolSettings {
        max_memory_mb: 256,
        ..Default::default()
    }
}

fn default_transformed_pool() -> PoolSettings {
    PoolSettings {
        max_memory_mb: 128,
        ..Default::default()
    }
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_entries: default_max_entries(),
            max_memory_mb: default_pool_mb(),
            ttl_secs: default_ttl_secs(),
            max_entry_size_mb: default_max_entry_mb(),
        }
    }
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            raw: default_raw_pool(),
            transformed: default_transformed_pool(),
            sampled: PoolSettings::default(),
            sweep_interval_secs: default_sweep_interval_secs(),
            watermarks: Watermarks::default(),
        }
    }
}

impl Default for SamplingSettings {
    fn default() -> Self {
        Self {
            defaults: SamplingConfig::default(),
            min_floor: default_min_floor(),
            prefilter_threshold: 0,
            prefilter_rows: default_prefilter_rows(),
        }
    }
}

impl Default for ProgressiveSettings {
    fn default() -> Self {
        Self {
            density_threshold: default_density_threshold(),
        }
    }
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            kind: ExecutorKind::default(),
            threads: 0,
            timeout_ms: default_timeout_ms(),
        }
    }
}

impl PoolSettings {
    /// Pool limits in bytes and durations
    pub fn to_pool_config(&self) -> PoolConfig {
        PoolConfig {
            max_entries: self.max_entries.max(1),
            max_memory_bytes: self.max_memory_mb.saturating_mul(1024 * 1024),
            default_ttl: Duration::from_secs(self.ttl_secs),
            max_entry_size_bytes: self.max_entry_size_mb.saturating_mul(1024 * 1024),
            fallback_entry_size: FALLBACK_ENTRY_SIZE,
        }
    }

    fn validate(&self, pool: &str) -> Result<()> {
        if self.max_entries == 0 {
            return Err(Error::Configuration(format!("cache.{}.max_entries must be > 0", pool)));
        }
        if self.max_memory_mb == 0 {
            return Err(Error::Configuration(format!("cache.{}.max_memory_mb must be > 0", pool)));
        }
        if self.ttl_secs == 0 {
            return Err(Error::Configuration(format!("cache.{}.ttl_secs must be > 0", pool)));
        }
        Ok(())
    }
}

impl Config {
    /// Load configuration from TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .map_err(|e| Error::Configuration(format!("Failed to read config file {}: {}", path.display(), e)))?;

        toml::from_str(&contents)
            .map_err(|e| Error::Configuration(format!("Failed to parse config file {}: {}", path.display(), e)))
    }

    /// Load configuration with environment variable overrides
    pub fn from_file_with_env(path: impl AsRef<Path>) -> Result<Self> {
        let mut config = Self::from_file(path)?;
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Load from environment variables only
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Apply `KUBA_SAMPLING_*` environment variable overrides
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides(|name| std::env::var(name).ok())
    }

    /// Apply overrides from any variable lookup
    ///
    /// | Variable                             | Field                          |
    /// |--------------------------------------|--------------------------------|
    /// | `KUBA_SAMPLING_METHOD`               | `sampling.defaults.method`     |
    /// | `KUBA_SAMPLING_TARGET_POINTS`        | `sampling.defaults.target_points` |
    /// | `KUBA_SAMPLING_THRESHOLD`            | `sampling.defaults.sampling_threshold` |
    /// | `KUBA_SAMPLING_MIN_FLOOR`            | `sampling.min_floor`           |
    /// | `KUBA_SAMPLING_DENSITY_THRESHOLD`    | `progressive.density_threshold`|
    /// | `KUBA_SAMPLING_EXECUTOR`             | `executor.kind`                |
    /// | `KUBA_SAMPLING_EXECUTOR_THREADS`     | `executor.threads`             |
    /// | `KUBA_SAMPLING_CACHE_TTL_SECS`       | `cache.sampled.ttl_secs`       |
    /// | `KUBA_SAMPLING_CACHE_MAX_MB`         | `cache.sampled.max_memory_mb`  |
    ///
    /// A variable that is set but does not parse is an error.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(method) = lookup("KUBA_SAMPLING_METHOD") {
            self.sampling.defaults.method = method.parse::<SamplingMethod>()?;
        }
        if let Some(v) = lookup("KUBA_SAMPLING_TARGET_POINTS") {
            self.sampling.defaults.target_points = parse_var("KUBA_SAMPLING_TARGET_POINTS", &v)?;
        }
        if let Some(v) = lookup("KUBA_SAMPLING_THRESHOLD") {
            self.sampling.defaults.sampling_threshold = parse_var("KUBA_SAMPLING_THRESHOLD", &v)?;
        }
        if let Some(v) = lookup("KUBA_SAMPLING_MIN_FLOOR") {
            self.sampling.min_floor = parse_var("KUBA_SAMPLING_MIN_FLOOR", &v)?;
        }
        if let Some(v) = lookup("KUBA_SAMPLING_DENSITY_THRESHOLD") {
            self.progressive.density_threshold = parse_var("KUBA_SAMPLING_DENSITY_THRESHOLD", &v)?;
        }
        if let Some(v) = lookup("KUBA_SAMPLING_EXECUTOR") {
            self.executor.kind = match v.trim().to_ascii_lowercase().as_str() {
                "inline" => ExecutorKind::Inline,
                "rayon" => ExecutorKind::Rayon,
                other => {
                    return Err(Error::Configuration(format!(
                        "KUBA_SAMPLING_EXECUTOR: unknown executor '{}'",
                        other
                    )))
                },
            };
        }
        if let Some(v) = lookup("KUBA_SAMPLING_EXECUTOR_THREADS") {
            self.executor.threads = parse_var("KUBA_SAMPLING_EXECUTOR_THREADS", &v)?;
        }
        if let Some(v) = lookup("KUBA_SAMPLING_CACHE_TTL_SECS") {
            self.cache.sampled.ttl_secs = parse_var("KUBA_SAMPLING_CACHE_TTL_SECS", &v)?;
        }
        if let Some(v) = lookup("KUBA_SAMPLING_CACHE_MAX_MB") {
            self.cache.sampled.max_memory_mb = parse_var("KUBA_SAMPLING_CACHE_MAX_MB", &v)?;
        }
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        self.cache.raw.validate("raw")?;
        self.cache.transformed.validate("transformed")?;
        self.cache.sampled.validate("sampled")?;
        if self.cache.sweep_interval_secs == 0 {
            return Err(Error::Configuration("cache.sweep_interval_secs must be > 0".into()));
        }
        self.cache.watermarks.validate()?;

        self.sampling.defaults.validate()?;
        if self.sampling.min_floor == 0 {
            return Err(Error::Configuration("sampling.min_floor must be > 0".into()));
        }
        if self.sampling.prefilter_threshold > 0 && self.sampling.prefilter_rows < 2 {
            return Err(Error::Configuration("sampling.prefilter_rows must be >= 2".into()));
        }

        let threshold = self.progressive.density_threshold;
        if !threshold.is_finite() || threshold <= 0.0 {
            return Err(Error::Configuration(
                "progressive.density_threshold must be a positive number".into(),
            ));
        }

        if self.executor.timeout_ms == 0 {
            return Err(Error::Configuration("executor.timeout_ms must be > 0".into()));
        }
        Ok(())
    }

    /// Save configuration to TOML file
    pub fn save_to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let contents = toml::to_string_pretty(self)
            .map_err(|e| Error::Configuration(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, contents)
            .map_err(|e| Error::Configuration(format!("Failed to write config file {}: {}", path.display(), e)))
    }

    /// Limits for the tiered cache
    pub fn tiered_cache_config(&self) -> TieredCacheConfig {
        TieredCacheConfig {
            raw: self.cache.raw.to_pool_config(),
            transformed: self.cache.transformed.to_pool_config(),
            sampled: self.cache.sampled.to_pool_config(),
            sweep_interval: Duration::from_secs(self.cache.sweep_interval_secs),
        }
    }

    /// Settings for [`crate::coordinator::SamplingCoordinator`]
    pub fn coordinator_config(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            cache: self.tiered_cache_config(),
            min_floor: self.sampling.min_floor,
            progressive: ProgressiveConfig::default().with_density_threshold(self.progressive.density_threshold),
            executor: ExecutorConfig {
                kind: self.executor.kind,
                threads: self.executor.threads,
                timeout: Duration::from_millis(self.executor.timeout_ms),
            },
            prefilter_threshold: self.sampling.prefilter_threshold,
            prefilter_rows: self.sampling.prefilter_rows,
        }
    }
}

fn parse_var<T: std::str::FromStr>(name: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::Configuration(format!("{}: cannot parse '{}'", name, value)))
}
