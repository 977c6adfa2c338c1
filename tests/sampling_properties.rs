//! Property tests for the sampling engine, per-series budgeting and
//! progressive upgrades
//!
//! Uses proptest to check the output-size and ordering guarantees over
//! randomly shaped series.

use kuba_sampling::sampling::{
    reduce, MethodTag, PerSeriesSampler, ProgressiveResolutionManager, SamplingConfig, SamplingMethod,
};
use kuba_sampling::types::{Point, SeriesMap, Viewport};
use proptest::prelude::*;
use std::collections::{BTreeMap, HashSet};

// =============================================================================
// Test Data Strategies
// =============================================================================

/// Finite y values, including flat runs and spikes
fn finite_f64() -> impl Strategy<Value = f64> {
    prop_oneof![
        (-1e6..1e6f64),
        Just(0.0),
        (-100i32..100).prop_map(|i| i as f64),
    ]
}

/// Series with strictly increasing x and irregular spacing
fn series(max_len: usize) -> impl Strategy<Value = Vec<Point>> {
    prop::collection::vec((1i64..1_000, finite_f64()), 0..max_len).prop_map(|steps| {
        let mut x = -50_000i64;
        steps
            .into_iter()
            .map(|(dx, y)| {
                x += dx;
                Point::new(x, y)
            })
            .collect()
    })
}

fn method() -> impl Strategy<Value = SamplingMethod> {
    prop_oneof![
        Just(SamplingMethod::Nth),
        Just(SamplingMethod::MinMax),
        Just(SamplingMethod::Lttb),
        Just(SamplingMethod::Adaptive { viewport: None }),
        (-60_000i64..0, 0i64..60_000).prop_map(|(lo, hi)| SamplingMethod::Adaptive {
            viewport: Some(Viewport { x_min: lo, x_max: hi }),
        }),
    ]
}

fn is_subsequence(sub: &[Point], of: &[Point]) -> bool {
    let mut it = of.iter();
    sub.iter().all(|p| it.any(|q| q == p))
}

// =============================================================================
// Engine Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    #[test]
    fn prop_bypass_returns_input(s in series(300), target in 1usize..50, enabled in any::<bool>()) {
        let mut config = SamplingConfig::new(SamplingMethod::Lttb, target).unwrap();
        if enabled {
            // Enabled but under threshold
            config = config.with_threshold(s.len());
        } else {
            config = config.disabled();
        }
        let result = reduce(&s, &config).unwrap();
        prop_assert_eq!(&result.points, &s);
        prop_assert_eq!(result.method, MethodTag::None);
    }

    #[test]
    fn prop_nth_bounds_and_endpoints(s in series(2_000), target in 1usize..400) {
        prop_assume!(!s.is_empty());
        let config = SamplingConfig::new(SamplingMethod::Nth, target).unwrap().with_threshold(0);
        let out = reduce(&s, &config).unwrap().points;

        let stride = s.len().div_ceil(target);
        prop_assert!(!out.is_empty());
        prop_assert!(out.len() <= s.len().div_ceil(stride) + 1);
        prop_assert_eq!(out[0], s[0]);
        prop_assert_eq!(out[out.len() - 1], s[s.len() - 1]);
    }

    #[test]
    fn prop_lttb_exact_size(s in series(2_000), target in 3usize..300) {
        prop_assume!(s.len() > target);
        let config = SamplingConfig::new(SamplingMethod::Lttb, target).unwrap().with_threshold(0);
        let out = reduce(&s, &config).unwrap().points;

        prop_assert_eq!(out.len(), target);
        prop_assert_eq!(out[0], s[0]);
        prop_assert_eq!(out[target - 1], s[s.len() - 1]);
    }

    #[test]
    fn prop_output_is_ordered_subsequence(s in series(1_500), m in method(), target in 1usize..300) {
        let config = SamplingConfig::new(m, target).unwrap().with_threshold(0);
        let out = reduce(&s, &config).unwrap().points;

        prop_assert!(out.windows(2).all(|w| w[0].x < w[1].x));
        prop_assert!(is_subsequence(&out, &s));
    }

    #[test]
    fn prop_repeated_reduction_never_grows(
        s in series(1_500),
        m in method(),
        first in 1usize..300,
        shrink in 0usize..300,
    ) {
        let second = first.saturating_sub(shrink).max(1);
        let a = SamplingConfig::new(m, first).unwrap().with_threshold(0);
        let b = SamplingConfig::new(m, second).unwrap().with_threshold(0);

        let once = reduce(&s, &a).unwrap();
        let twice = reduce(&once.points, &b).unwrap();
        prop_assert!(twice.sampled_count <= once.sampled_count);
    }

    #[test]
    fn prop_invalid_target_always_rejected(s in series(50), m in method()) {
        let config = SamplingConfig::new(m, 10).unwrap().with_target_points(0);
        prop_assert!(reduce(&s, &config).is_err());
    }
}

// =============================================================================
// Budget and Progressive Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    #[test]
    fn prop_budgets_respect_floor(
        lengths in prop::collection::vec(1usize..10_000, 1..8),
        target in 1usize..5_000,
        floor in 1usize..200,
    ) {
        let sampler = PerSeriesSampler::new(floor);
        let lengths: BTreeMap<u128, usize> =
            lengths.into_iter().enumerate().map(|(i, n)| (i as u128, n)).collect();
        let budgets = sampler.budgets(&lengths, target);

        prop_assert_eq!(budgets.len(), lengths.len());
        prop_assert!(budgets.values().all(|b| *b >= floor));

        // Unpinned budgets never exceed the shared target
        let unpinned: usize = budgets.values().filter(|b| **b > floor).sum();
        prop_assert!(unpinned <= target);
    }

    #[test]
    fn prop_merged_output_is_sorted(a in series(800), b in series(800), target in 10usize..400) {
        let map: SeriesMap = [(1u128, a), (2u128, b)].into_iter().collect();
        let config = SamplingConfig::new(SamplingMethod::MinMax, target).unwrap().with_threshold(0);
        let set = PerSeriesSampler::new(5).sample(&map, &config).unwrap();

        prop_assert!(set.merged.points.windows(2).all(|w| w[0].x <= w[1].x));
        let per_series: usize = set.per_series.values().map(|r| r.sampled_count).sum();
        prop_assert_eq!(set.merged.sampled_count, per_series);
    }

    #[test]
    fn prop_upgrade_keeps_existing_points(
        s in series(3_000),
        low in 3usize..100,
        extra in 1usize..400,
        triangle in any::<bool>(),
    ) {
        let high = low + extra;
        prop_assume!(s.len() > high);
        let method = if triangle { SamplingMethod::Lttb } else { SamplingMethod::Nth };
        let from = SamplingConfig::new(method, low).unwrap().with_threshold(0);
        let to = SamplingConfig::new(method, high).unwrap().with_threshold(0);

        let existing = reduce(&s, &from).unwrap();
        let upgraded = ProgressiveResolutionManager::default()
            .upgrade(&s, &existing, &from, &to)
            .unwrap();

        let xs: HashSet<i64> = upgraded.points.iter().map(|p| p.x).collect();
        prop_assert!(existing.points.iter().all(|p| xs.contains(&p.x)));
        prop_assert!(upgraded.sampled_count >= existing.sampled_count);
        prop_assert!(upgraded.sampled_count <= high);
        prop_assert!(upgraded.points.windows(2).all(|w| w[0].x < w[1].x));
        prop_assert!(is_subsequence(&upgraded.points, &s));
    }
}
