//! Per-series sampling with a shared point budget
//!
//! Several series drawn on one chart share a single `target_points` budget.
//! Each series gets a share proportional to its length, but never less than
//! `min_floor`, so a dense series cannot starve a sparse one. Series are
//! reduced independently (in parallel on the rayon pool) and merged by x.

use super::config::{MethodTag, SampleResult, SamplingConfig};
use super::engine::reduce;
use crate::error::Result;
use crate::types::{SeriesId, SeriesMap};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Sampled output for a set of series
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampledSet {
    /// Result for each series, reduced with its own budget
    pub per_series: BTreeMap<SeriesId, SampleResult>,
    /// All series merged in ascending x
    pub merged: SampleResult,
    /// Normalized config the set was produced with
    pub config: SamplingConfig,
}

impl SampledSet {
    /// Assemble a set from per-series results
    pub fn from_parts(per_series: BTreeMap<SeriesId, SampleResult>, config: SamplingConfig) -> Self {
        let merged = PerSeriesSampler::merge(&per_series);
        Self {
            per_series,
            merged,
            config,
        }
    }
}

/// Splits a point budget across series and samples each one
#[derive(Debug, Clone, Copy)]
pub struct PerSeriesSampler {
    min_floor: usize,
}

impl Default for PerSeriesSampler {
    fn default() -> Self {
        Self::new(Self::DEFAULT_MIN_FLOOR)
    }
}

impl PerSeriesSampler {
    /// Default lower bound on a series budget
    pub const DEFAULT_MIN_FLOOR: usize = 100;

    /// Create a sampler with the given per-series minimum (at least 1)
    pub fn new(min_floor: usize) -> Self {
        Self {
            min_floor: min_floor.max(1),
        }
    }

    /// Configured minimum budget
    pub fn min_floor(&self) -> usize {
        self.min_floor
    }

    /// Compute the point budget of every series
    ///
    /// Each series gets `floor(target * n_i / Σ n_j)`. Series whose share is
    /// below the floor are pinned at the floor, and what is left of the budget
    /// is re-split across the remaining series until no more series fall
    /// below the floor.
    pub fn budgets(&self, lengths: &BTreeMap<SeriesId, usize>, target: usize) -> BTreeMap<SeriesId, usize> {
        let mut budgets = BTreeMap::new();
        let mut free: Vec<(SeriesId, usize)> = lengths.iter().map(|(id, n)| (*id, *n)).collect();

        loop {
            let pinned_total = budgets.len().saturating_mul(self.min_floor);
            let remaining = target.saturating_sub(pinned_total) as u128;
            let total: u128 = free.iter().map(|(_, n)| *n as u128).sum();

            let share = |n: usize| -> usize {
                if total == 0 {
                    0
                } else {
                    (remaining * n as u128 / total) as usize
                }
            };

            let before = free.len();
            free.retain(|(id, n)| {
                if share(*n) < self.min_floor {
                    budgets.insert(*id, self.min_floor);
                    false
                } else {
                    true
                }
            });

            if free.len() == before {
                for (id, n) in &free {
                    budgets.insert(*id, share(*n));
                }
                return budgets;
            }
        }
    }

    /// Sample every series with its own budget and merge the results
    pub fn sample(&self, series: &SeriesMap, config: &SamplingConfig) -> Result<SampledSet> {
        config.validate()?;
        let config = config.normalized();

        let lengths: BTreeMap<SeriesId, usize> =
            series.iter().map(|(id, points)| (*id, points.len())).collect();
        let budgets = self.budgets(&lengths, config.target_points);

        let per_series: BTreeMap<SeriesId, SampleResult> = series
            .par_iter()
            .map(|(id, points)| {
                let budget = budgets.get(id).copied().unwrap_or(self.min_floor);
                let series_config = config.with_target_points(budget);
                reduce(points, &series_config).map(|result| (*id, result))
            })
            .collect::<Result<_>>()?;

        Ok(SampledSet::from_parts(per_series, config))
    }

    /// Concatenate per-series results and sort by x
    ///
    /// The sort is stable, so points sharing an x keep ascending series-id
    /// order.
    pub fn merge(per_series: &BTreeMap<SeriesId, SampleResult>) -> SampleResult {
        let original_count = per_series.values().map(|r| r.original_count).sum();
        let mut points: Vec<_> = per_series
            .values()
            .flat_map(|r| r.points.iter().copied())
            .collect();
        points.sort_by_key(|p| p.x);

        let method = per_series
            .values()
            .map(|r| r.method)
            .find(|m| *m != MethodTag::None)
            .unwrap_or(MethodTag::None);

        SampleResult::new(points, original_count, method)
    }
}
