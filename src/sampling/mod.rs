//! Sampling - data reduction for chart rendering
//!
//! - [`engine`]: single-series reduction (`nth`, `minmax`, `lttb`, `adaptive`)
//! - [`per_series`]: shared budget across several series, merged by x
//! - [`progressive`]: move an existing sample to a new resolution, reusing work
//! - [`config`]: validated configuration and result types

pub mod config;
pub mod engine;
pub mod per_series;
pub mod progressive;

pub use config::{MethodTag, SampleResult, SamplingConfig, SamplingMethod, MIN_LTTB_TARGET};
pub use engine::reduce;
pub use per_series::{PerSeriesSampler, SampledSet};
pub use progressive::{LowDensityRegion, ProgressiveConfig, ProgressiveResolutionManager};
