//! Request coordination
//!
//! - [`service`]: [`SamplingCoordinator`], the cached and coalescing entry
//!   point for sampling a series set
//! - [`executor`]: where the per-series reductions run

pub mod executor;
pub mod service;

pub use crate::cache::SampleKey;
pub use crate::sampling::SampledSet;
pub use executor::{
    ExecutorConfig, ExecutorKind, FallbackExecutor, InlineExecutor, RayonExecutor, SamplingExecutor, SamplingTask,
};
pub use service::{CoordinatorConfig, CoordinatorStats, SamplingCoordinator, SamplingCoordinatorBuilder};
