//! Caching for fetched, pre-filtered and sampled series
//!
//! - [`pool`]: generic LRU + TTL + memory-bounded pool
//! - [`tiered`]: the three pools used by the coordinator, plus the sweeper
//! - [`pressure`]: memory pressure readings and the eviction responder

pub mod pool;
pub mod pressure;
pub mod tiered;

pub use pool::{CachePool, EstimateSize, PoolConfig, PoolControl, PoolName, PoolStats, FALLBACK_ENTRY_SIZE};
pub use pressure::{
    ManualPressureSensor, PressureAction, PressureLevel, PressureResponder, PressureSensor, PressureSnapshot,
    Watermarks,
};
pub use tiered::{SampleKey, TieredCache, TieredCacheConfig, TieredCacheStats};
