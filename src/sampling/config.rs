//! Sampling configuration and result types
//!
//! [`SamplingMethod`] is a closed set of algorithms. A [`SamplingConfig`] is
//! validated before any computation runs; [`SamplingConfig::normalized`]
//! collapses equivalent configs so they share a cache key.

use crate::error::{Error, Result};
use crate::types::{Point, Series, Viewport};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Minimum target for the triangle-based algorithms
pub const MIN_LTTB_TARGET: usize = 3;

/// Downsampling algorithm
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum SamplingMethod {
    /// Every n-th point, last point forced
    Nth,
    /// Min and max of each bucket, in original order
    #[serde(rename = "minmax")]
    MinMax,
    /// Largest-Triangle-Three-Buckets
    #[default]
    Lttb,
    /// LTTB restricted to an optional visible window
    Adaptive {
        /// Visible x window; `None` samples the whole series
        #[serde(default)]
        viewport: Option<Viewport>,
    },
}

impl SamplingMethod {
    /// Algorithm tag without parameters
    pub fn tag(&self) -> MethodTag {
        match self {
            SamplingMethod::Nth => MethodTag::Nth,
            SamplingMethod::MinMax => MethodTag::MinMax,
            SamplingMethod::Lttb => MethodTag::Lttb,
            SamplingMethod::Adaptive { .. } => MethodTag::Adaptive,
        }
    }

    /// Whether the method needs at least [`MIN_LTTB_TARGET`] points
    pub fn is_triangle_based(&self) -> bool {
        matches!(self, SamplingMethod::Lttb | SamplingMethod::Adaptive { .. })
    }
}

impl FromStr for SamplingMethod {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "nth" => Ok(SamplingMethod::Nth),
            "minmax" => Ok(SamplingMethod::MinMax),
            "lttb" => Ok(SamplingMethod::Lttb),
            "adaptive" => Ok(SamplingMethod::Adaptive { viewport: None }),
            other => Err(Error::InvalidConfig(format!(
                "unknown sampling method '{}'",
                other
            ))),
        }
    }
}

impl fmt::Display for SamplingMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.tag())
    }
}

/// Which algorithm produced a [`SampleResult`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MethodTag {
    /// Sampling was bypassed (disabled or under threshold)
    None,
    /// Every n-th point
    Nth,
    /// Bucket min/max
    #[serde(rename = "minmax")]
    MinMax,
    /// Largest-Triangle-Three-Buckets
    Lttb,
    /// Viewport-restricted LTTB
    Adaptive,
}

impl MethodTag {
    /// Stable lowercase name (used as a metric label)
    pub fn as_str(&self) -> &'static str {
        match self {
            MethodTag::None => "none",
            MethodTag::Nth => "nth",
            MethodTag::MinMax => "minmax",
            MethodTag::Lttb => "lttb",
            MethodTag::Adaptive => "adaptive",
        }
    }
}

impl fmt::Display for MethodTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Configuration for one sampling request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SamplingConfig {
    /// Sampling on/off
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Algorithm
    #[serde(default)]
    pub method: SamplingMethod,

    /// Output size target (must be >= 1)
    #[serde(default = "default_target_points")]
    pub target_points: usize,

    /// Force the first and last original points into the output
    #[serde(default = "default_true")]
    pub preserve_extremes: bool,

    /// Series at or below this length are returned unchanged
    #[serde(default = "default_sampling_threshold")]
    pub sampling_threshold: usize,
}

fn default_true() -> bool {
    true
}
fn default_target_points() -> usize {
    1000
}
fn default_sampling_threshold() -> usize {
    1000
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            method: SamplingMethod::default(),
            target_points: default_target_points(),
            preserve_extremes: true,
            sampling_threshold: default_sampling_threshold(),
        }
    }
}

impl SamplingConfig {
    /// Create a validated config with default threshold and extremes handling
    pub fn new(method: SamplingMethod, target_points: usize) -> Result<Self> {
        let config = Self {
            method,
            target_points,
            ..Default::default()
        };
        config.validate()?;
        Ok(config)
    }

    /// Set the pass-through threshold
    pub fn with_threshold(mut self, threshold: usize) -> Self {
        self.sampling_threshold = threshold;
        self
    }

    /// Set extremes preservation
    pub fn with_preserve_extremes(mut self, preserve: bool) -> Self {
        self.preserve_extremes = preserve;
        self
    }

    /// Set the target point count
    pub fn with_target_points(mut self, target_points: usize) -> Self {
        self.target_points = target_points;
        self
    }

    /// Set the viewport (switches the method to adaptive)
    pub fn with_viewport(mut self, viewport: Viewport) -> Self {
        self.method = SamplingMethod::Adaptive {
            viewport: Some(viewport),
        };
        self
    }

    /// Disable sampling
    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.target_points == 0 {
            return Err(Error::InvalidConfig("target_points must be > 0".into()));
        }
        if let SamplingMethod::Adaptive {
            viewport: Some(viewport),
        } = &self.method
        {
            viewport.validate()?;
        }
        Ok(())
    }

    /// Canonical form of this config
    ///
    /// Disabled configs all collapse to one value, and triangle-based methods
    /// with fewer than [`MIN_LTTB_TARGET`] points degrade to `Nth`.
    pub fn normalized(&self) -> Self {
        if !self.enabled {
            return Self {
                enabled: false,
                ..Default::default()
            };
        }
        let mut config = *self;
        if config.method.is_triangle_based() && config.target_points < MIN_LTTB_TARGET {
            config.method = SamplingMethod::Nth;
        }
        config
    }
}

/// Output of one reduction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleResult {
    /// Selected points in original order
    pub points: Series,
    /// Number of points in the input
    pub original_count: usize,
    /// Number of points in the output
    pub sampled_count: usize,
    /// Algorithm that produced the output
    pub method: MethodTag,
}

impl SampleResult {
    /// Build a result, deriving `sampled_count` from the points
    pub fn new(points: Series, original_count: usize, method: MethodTag) -> Self {
        let sampled_count = points.len();
        Self {
            points,
            original_count,
            sampled_count,
            method,
        }
    }

    /// Pass-through result (sampling bypassed)
    pub fn unchanged(points: &[Point]) -> Self {
        Self::new(points.to_vec(), points.len(), MethodTag::None)
    }

    /// Fraction of points kept (1.0 for empty input)
    pub fn reduction_ratio(&self) -> f64 {
        if self.original_count == 0 {
            1.0
        } else {
            self.sampled_count as f64 / self.original_count as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_method_from_str() {
        assert_eq!("nth".parse::<SamplingMethod>().unwrap(), SamplingMethod::Nth);
        assert_eq!(
            "MinMax".parse::<SamplingMethod>().unwrap(),
            SamplingMethod::MinMax
        );
        assert_eq!(
            "adaptive".parse::<SamplingMethod>().unwrap(),
            SamplingMethod::Adaptive { viewport: None }
        );
        assert!(matches!(
            "m4".parse::<SamplingMethod>(),
            Err(Error::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_validate_rejects_zero_target() {
        assert!(SamplingConfig::new(SamplingMethod::Nth, 0).is_err());
        let config = SamplingConfig::default().with_target_points(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_inverted_viewport() {
        let config = SamplingConfig {
            method: SamplingMethod::Adaptive {
                viewport: Some(Viewport {
                    x_min: 10,
                    x_max: 0,
                }),
            },
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_normalized_degrades_small_lttb() {
        let config = SamplingConfig::new(SamplingMethod::Lttb, 2).unwrap();
        assert_eq!(config.normalized().method, SamplingMethod::Nth);

        let config = SamplingConfig::new(SamplingMethod::Lttb, 3).unwrap();
        assert_eq!(config.normalized().method, SamplingMethod::Lttb);
    }

    #[test]
    fn test_normalized_collapses_disabled() {
        let a = SamplingConfig::new(SamplingMethod::Nth, 10).unwrap().disabled();
        let b = SamplingConfig::new(SamplingMethod::MinMax, 500)
            .unwrap()
            .disabled();
        assert_eq!(a.normalized(), b.normalized());
    }

    #[test]
    fn test_config_deserializes_from_toml() {
        let config: SamplingConfig = toml::from_str(
            r#"
            target_points = 200
            sampling_threshold = 0
            [method]
            kind = "adaptive"
            viewport = { x_min = 0, x_max = 100 }
            "#,
        )
        .unwrap();
        assert_eq!(config.target_points, 200);
        assert!(config.enabled);
        assert_eq!(config.method.tag(), MethodTag::Adaptive);
    }

    #[test]
    fn test_unknown_method_rejected_by_serde() {
        let parsed: std::result::Result<SamplingConfig, _> = toml::from_str(
            r#"
            [method]
            kind = "m4"
            "#,
        );
        assert!(parsed.is_err());
    }
}
