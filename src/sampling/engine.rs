//! Sampling engine - point reduction for visualization
//!
//! Reduces one ordered series to a bounded number of points while keeping its
//! visual shape:
//!
//! - **nth**: every stride-th point, last point forced (fastest)
//! - **minmax**: min and max of each bucket (keeps spikes)
//! - **lttb** (Largest Triangle Three Buckets): picks, per bucket, the point
//!   forming the largest triangle with the previous pick and the next
//!   bucket's average
//! - **adaptive**: lttb over the visible viewport plus one neighbour on each side
//!
//! Every algorithm returns a subsequence of its input, so output order always
//! matches the original chronological order.

use super::config::{MethodTag, SampleResult, SamplingConfig, SamplingMethod};
use crate::error::Result;
use crate::metrics;
use crate::types::{Point, Viewport};
use std::ops::Range;
use std::time::Instant;
use tracing::debug;

/// Reduce a series according to `config`
///
/// Pure function: no shared state, no I/O. The config is validated before
/// anything else runs.
pub fn reduce(series: &[Point], config: &SamplingConfig) -> Result<SampleResult> {
    config.validate()?;

    if !config.enabled || series.len() <= config.sampling_threshold {
        return Ok(SampleResult::unchanged(series));
    }

    let config = config.normalized();
    let target = config.target_points;
    let start = Instant::now();

    let mut points = match config.method {
        SamplingMethod::Nth => nth(series, target),
        SamplingMethod::MinMax => min_max(series, target),
        SamplingMethod::Lttb => lttb(series, target),
        SamplingMethod::Adaptive { viewport } => adaptive(series, target, viewport),
    };

    if config.preserve_extremes {
        preserve_extremes(series, &mut points);
    }

    let tag = config.method.tag();
    let elapsed = start.elapsed();
    metrics::record_reduction(tag.as_str(), elapsed.as_secs_f64());
    debug!(
        method = %tag,
        input = series.len(),
        output = points.len(),
        target,
        elapsed_us = elapsed.as_micros() as u64,
        "Reduced series"
    );

    Ok(SampleResult::new(points, series.len(), tag))
}

/// Every stride-th point with the last point forced in
///
/// `stride = ceil(n / target)`. If forcing the last point would push the
/// output past `target`, the final strided point is replaced instead.
pub fn nth(series: &[Point], target: usize) -> Vec<Point> {
    let n = series.len();
    if n == 0 {
        return Vec::new();
    }

    let target = target.max(1);
    let stride = n.div_ceil(target);
    let mut result: Vec<Point> = series.iter().step_by(stride).copied().collect();

    let last = series[n - 1];
    if result.last().map(|p| p.x) != Some(last.x) {
        if result.len() >= target && result.len() >= 2 {
            if let Some(tail) = result.last_mut() {
                *tail = last;
            }
        } else {
            result.push(last);
        }
    }

    result
}

/// Min and max of each bucket, emitted in original order
///
/// Buckets hold `ceil(n / (target / 2))` points. When min and max are the
/// same point it is emitted once. Ties keep the first occurrence.
pub fn min_max(series: &[Point], target: usize) -> Vec<Point> {
    let n = series.len();
    if n == 0 {
        return Vec::new();
    }

    let num_buckets = (target / 2).max(1);
    let bucket_size = n.div_ceil(num_buckets);
    let mut result = Vec::with_capacity(num_buckets * 2);

    for bucket in series.chunks(bucket_size) {
        let mut min_idx = 0;
        let mut max_idx = 0;

        for (i, p) in bucket.iter().enumerate().skip(1) {
            if p.y < bucket[min_idx].y {
                min_idx = i;
            }
            if p.y > bucket[max_idx].y {
                max_idx = i;
            }
        }

        match min_idx.cmp(&max_idx) {
            std::cmp::Ordering::Equal => result.push(bucket[min_idx]),
            std::cmp::Ordering::Less => {
                result.push(bucket[min_idx]);
                result.push(bucket[max_idx]);
            },
            std::cmp::Ordering::Greater => {
                result.push(bucket[max_idx]);
                result.push(bucket[min_idx]);
            },
        }
    }

    result
}

/// LTTB (Largest Triangle Three Buckets)
///
/// First and last points are always kept. The interior is split into
/// `target - 2` buckets of `(n - 2) / (target - 2)` points. Within a bucket the
/// scan runs left to right and only a strictly larger area replaces the
/// current pick, so on ties the earliest point wins.
pub fn lttb(series: &[Point], target: usize) -> Vec<Point> {
    let n = series.len();

    if n == 0 {
        return Vec::new();
    }

    if n <= 2 || n <= target {
        return series.to_vec();
    }

    if target <= 2 {
        // Return first and last points only
        return if target == 1 {
            vec![series[0]]
        } else {
            vec![series[0], series[n - 1]]
        };
    }

    let mut result = Vec::with_capacity(target);
    result.push(series[0]);

    // Bucket size (excluding first and last points)
    let bucket_size = (n - 2) as f64 / (target - 2) as f64;

    let mut a = 0; // Previous selected point index

    for i in 0..(target - 2) {
        let bucket_start = ((i as f64 * bucket_size) + 1.0).floor() as usize;
        let bucket_end = (((i + 1) as f64 * bucket_size) + 1.0).floor() as usize;
        let bucket_end = bucket_end.min(n - 1);

        // Average of the next bucket is the third triangle vertex
        let next_bucket_start = bucket_end;
        let next_bucket_end = (((i + 2) as f64 * bucket_size) + 1.0).floor() as usize;
        let next_bucket_end = next_bucket_end.min(n);

        let (avg_x, avg_y) = if next_bucket_end > next_bucket_start {
            let next = &series[next_bucket_start..next_bucket_end];
            let count = next.len() as f64;
            let sum_x: f64 = next.iter().map(|p| p.x as f64).sum();
            let sum_y: f64 = next.iter().map(|p| p.y).sum();
            (sum_x / count, sum_y / count)
        } else {
            let last = series[n - 1];
            (last.x as f64, last.y)
        };

        let (a_x, a_y) = (series[a].x as f64, series[a].y);
        let mut max_area = -1.0;
        let mut max_idx = bucket_start;

        for (j, p) in series
            .iter()
            .enumerate()
            .take(bucket_end)
            .skip(bucket_start)
        {
            let (p_x, p_y) = (p.x as f64, p.y);

            // Twice the triangle area; only relative order matters
            let area = ((a_x - avg_x) * (p_y - a_y) - (a_x - p_x) * (avg_y - a_y)).abs();

            if area > max_area {
                max_area = area;
                max_idx = j;
            }
        }

        result.push(series[max_idx]);
        a = max_idx;
    }

    result.push(series[n - 1]);

    result
}

/// LTTB restricted to a viewport
///
/// Without a viewport this is plain [`lttb`].
pub fn adaptive(series: &[Point], target: usize, viewport: Option<Viewport>) -> Vec<Point> {
    match viewport {
        Some(viewport) => {
            let window = visible_window(series, &viewport);
            lttb(&series[window], target)
        },
        None => lttb(series, target),
    }
}

/// Index range of the points inside `viewport` plus one neighbour on each side
pub fn visible_window(series: &[Point], viewport: &Viewport) -> Range<usize> {
    let first_inside = series.partition_point(|p| p.x < viewport.x_min);
    let past_inside = series.partition_point(|p| p.x <= viewport.x_max);

    let start = first_inside.saturating_sub(1);
    let end = (past_inside + 1).min(series.len());
    start..end.max(start)
}

/// Prepend/append the original first/last point when the output lacks them
fn preserve_extremes(series: &[Point], points: &mut Vec<Point>) {
    let (Some(first), Some(last)) = (series.first(), series.last()) else {
        return;
    };

    if points.first().map(|p| p.x) != Some(first.x) {
        points.insert(0, *first);
    }
    if points.last().map(|p| p.x) != Some(last.x) {
        points.push(*last);
    }
}

/// Method tag a config would record, without running it
pub fn effective_method(series_len: usize, config: &SamplingConfig) -> MethodTag {
    if !config.enabled || series_len <= config.sampling_threshold {
        MethodTag::None
    } else {
        config.normalized().method.tag()
    }
}

// ============================================================================
// Tests
// ============================================================================
