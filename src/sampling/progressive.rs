//! Progressive resolution - re-sample at a new target without starting over
//!
//! Three paths:
//!
//! - **Downgrade** (`target <= existing target`): reduce the existing sample,
//!   which is far smaller than the original.
//! - **Method change**: full reduction of the original.
//! - **Upgrade, same method**: find gaps in the existing sample where the
//!   ideal density implies missing points, spend the extra budget on those
//!   gaps in proportion to their duration, and merge the new picks into the
//!   existing sample. Existing points are never moved or dropped.

use super::config::{SampleResult, SamplingConfig, SamplingMethod};
use super::engine::{reduce, visible_window};
use crate::error::Result;
use crate::types::Point;
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use tracing::debug;

/// Tuning for the upgrade path
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProgressiveConfig {
    /// A gap is a low-density region when `gap * ideal_density` exceeds this
    #[serde(default = "default_density_threshold")]
    pub density_threshold: f64,
}

fn default_density_threshold() -> f64 {
    1.5
}

impl Default for ProgressiveConfig {
    fn default() -> Self {
        Self {
            density_threshold: default_density_threshold(),
        }
    }
}

impl ProgressiveConfig {
    /// Set the density threshold
    pub fn with_density_threshold(mut self, threshold: f64) -> Self {
        self.density_threshold = threshold;
        self
    }
}

/// Gap between two adjacent points of an existing sample
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LowDensityRegion {
    /// Left boundary (an existing sample point)
    pub start_x: i64,
    /// Right boundary (an existing sample point)
    pub end_x: i64,
    /// `end_x - start_x`
    pub gap: u64,
    /// Points the ideal density says should be in the gap
    pub expected_points: f64,
}

/// Upgrades and downgrades sampled results
#[derive(Debug, Clone, Default)]
pub struct ProgressiveResolutionManager {
    config: ProgressiveConfig,
}

impl ProgressiveResolutionManager {
    /// Create a manager with the given tuning
    pub fn new(config: ProgressiveConfig) -> Self {
        Self { config }
    }

    /// Current tuning
    pub fn config(&self) -> &ProgressiveConfig {
        &self.config
    }

    /// Re-sample `existing` (produced from `original` with `existing_config`)
    /// at `target_config`
    pub fn upgrade(
        &self,
        original: &[Point],
        existing: &SampleResult,
        existing_config: &SamplingConfig,
        target_config: &SamplingConfig,
    ) -> Result<SampleResult> {
        existing_config.validate()?;
        target_config.validate()?;

        let from = existing_config.normalized();
        let to = target_config.normalized();

        if !to.enabled || !from.enabled || from.method != to.method {
            debug!(from = %from.method, to = %to.method, "Method changed, full reduction");
            return reduce(original, &to);
        }

        // The pass-through threshold applies to the original series, never to
        // the smaller existing sample
        if original.len() <= to.sampling_threshold {
            return reduce(original, &to);
        }

        if to.target_points <= from.target_points {
            debug!(
                from = from.target_points,
                to = to.target_points,
                "Downgrading from existing sample"
            );
            let mut result = reduce(&existing.points, &to.with_threshold(0))?;
            result.original_count = original.len();
            return Ok(result);
        }

        self.fill_low_density(original, existing, &to)
    }

    /// Same-method upgrade
    fn fill_low_density(
        &self,
        original: &[Point],
        existing: &SampleResult,
        to: &SamplingConfig,
    ) -> Result<SampleResult> {
        let scope = match to.method {
            SamplingMethod::Adaptive {
                viewport: Some(viewport),
            } => &original[visible_window(original, &viewport)],
            _ => original,
        };

        let (Some(first), Some(last)) = (scope.first(), scope.last()) else {
            return reduce(original, to);
        };
        let span = last.x.saturating_sub(first.x);
        if span <= 0 || existing.points.len() < 2 {
            return reduce(original, to);
        }

        let extra = to.target_points.saturating_sub(existing.points.len());
        if extra == 0 {
            let mut result = existing.clone();
            result.method = to.method.tag();
            result.original_count = original.len();
            return Ok(result);
        }

        let in_scope: Vec<Point> = existing
            .points
            .iter()
            .copied()
            .filter(|p| p.x >= first.x && p.x <= last.x)
            .collect();
        let density = to.target_points as f64 / span as f64;
        let regions = self.find_low_density_regions(&in_scope, density);

        // Original points strictly inside each gap
        let candidates: Vec<&[Point]> = regions
            .iter()
            .map(|r| {
                let lo = scope.partition_point(|p| p.x <= r.start_x);
                let hi = scope.partition_point(|p| p.x < r.end_x);
                &scope[lo..hi.max(lo)]
            })
            .collect();
        let capacities: Vec<usize> = candidates.iter().map(|c| c.len()).collect();
        let allocations = allocate_budget(&regions, &capacities, extra);

        let region_method = match to.method {
            SamplingMethod::Adaptive { .. } => SamplingMethod::Lttb,
            other => other,
        };

        let mut added: Vec<Point> = Vec::with_capacity(extra);
        for (points, budget) in candidates.iter().zip(&allocations) {
            if *budget == 0 {
                continue;
            }
            if points.len() <= *budget {
                added.extend_from_slice(points);
                continue;
            }
            let region_config = SamplingConfig {
                enabled: true,
                method: region_method,
                target_points: *budget,
                preserve_extremes: false,
                sampling_threshold: 0,
            };
            let mut picked = reduce(points, &region_config)?.points;
            picked.truncate(*budget);
            added.extend(picked);
        }

        debug!(
            regions = regions.len(),
            existing = existing.points.len(),
            added = added.len(),
            target = to.target_points,
            "Filled low-density regions"
        );

        let mut merged = merge_preferring_existing(&existing.points, added);
        if to.preserve_extremes {
            if let (Some(f), Some(l)) = (original.first(), original.last()) {
                if merged.first().map(|p| p.x) != Some(f.x) {
                    merged.insert(0, *f);
                }
                if merged.last().map(|p| p.x) != Some(l.x) {
                    merged.push(*l);
                }
            }
        }

        Ok(SampleResult::new(merged, original.len(), to.method.tag()))
    }

    /// Gaps whose expected point count exceeds the density threshold,
    /// largest gap first
    pub fn find_low_density_regions(&self, sample: &[Point], density: f64) -> Vec<LowDensityRegion> {
        let mut regions: Vec<LowDensityRegion> = sample
            .windows(2)
            .filter_map(|pair| {
                let gap = pair[1].x.abs_diff(pair[0].x);
                let expected_points = gap as f64 * density;
                (expected_points > self.config.density_threshold).then_some(LowDensityRegion {
                    start_x: pair[0].x,
                    end_x: pair[1].x,
                    gap,
                    expected_points,
                })
            })
            .collect();

        // Stable: equal gaps keep left-to-right order
        regions.sort_by_key(|r| Reverse(r.gap));
        regions
    }
}

/// Split `extra` points over ranked regions
///
/// Each region first gets `floor(extra * gap / total_gap)` capped at its
/// capacity. The remainder is handed out one point at a time in rank order
/// to regions that still have spare candidates.
fn allocate_budget(regions: &[LowDensityRegion], capacities: &[usize], extra: usize) -> Vec<usize> {
    let total_gap: u128 = regions.iter().map(|r| r.gap as u128).sum();
    if total_gap == 0 {
        return vec![0; regions.len()];
    }

    let mut allocations: Vec<usize> = regions
        .iter()
        .zip(capacities)
        .map(|(r, cap)| {
            let share = (extra as u128 * r.gap as u128 / total_gap) as usize;
            share.min(*cap)
        })
        .collect();

    let mut remaining = extra.saturating_sub(allocations.iter().sum());
    while remaining > 0 {
        let mut progressed = false;
        for (alloc, cap) in allocations.iter_mut().zip(capacities) {
            if remaining == 0 {
                break;
            }
            if *alloc < *cap {
                *alloc += 1;
                remaining -= 1;
                progressed = true;
            }
        }
        if !progressed {
            break;
        }
    }

    allocations
}

/// Merge new points into an existing sample, sorted by x
///
/// On equal x the existing point wins.
fn merge_preferring_existing(existing: &[Point], added: Vec<Point>) -> Vec<Point> {
    let mut tagged: Vec<(Point, u8)> = existing.iter().map(|p| (*p, 0)).collect();
    tagged.extend(added.into_iter().map(|p| (p, 1)));
    tagged.sort_by_key(|(p, source)| (p.x, *source));
    tagged.dedup_by_key(|(p, _)| p.x);
    tagged.into_iter().map(|(p, _)| p).collect()
}
