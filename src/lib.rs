//! Kuba Sampling - chart-oriented downsampling with a tiered result cache
//!
//! This library reduces large time series to a renderable number of points:
//! - Four reduction algorithms (`nth`, `minmax`, `lttb`, `adaptive`)
//! - Shared point budgets across several series with a per-series floor
//! - Progressive resolution changes that reuse previously selected points
//! - LRU + TTL + memory-bounded cache pools with pressure-driven eviction
//! - A coordinator that coalesces concurrent identical requests
//!
//! # Example
//!
//! ```rust
//! use kuba_sampling::sampling::{reduce, SamplingConfig, SamplingMethod};
//! use kuba_sampling::types::Point;
//!
//! let series: Vec<Point> = (0..10_000).map(|i| Point::new(i, (i % 100) as f64)).collect();
//! let config = SamplingConfig::new(SamplingMethod::Lttb, 500).unwrap();
//! let result = reduce(&series, &config).unwrap();
//! assert_eq!(result.sampled_count, 500);
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod types;

/// Reduction algorithms, per-series budgeting and progressive resolution
pub mod sampling;

/// Cache pools, tiered cache and memory pressure handling
pub mod cache;

/// Series providers, chunk sources and rank prefiltering
pub mod source;

/// Coalescing request coordinator and sampling executors
pub mod coordinator;

/// Prometheus metrics and telemetry
pub mod metrics;

/// Configuration management with TOML support
pub mod config;

// Re-export main types
pub use cache::{PoolName, TieredCache};
pub use config::Config;
pub use coordinator::{SamplingCoordinator, SamplingCoordinatorBuilder};
pub use error::{Error, Result};
pub use sampling::{reduce, SampleResult, SampledSet, SamplingConfig, SamplingMethod};
pub use types::{Point, SeriesId, SeriesSet, Viewport};
