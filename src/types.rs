//! Core data types shared by the sampling engine, caches and coordinator
//!
//! # Key Types
//!
//! - **`Point`**: A single chart point (ordinal x + value y)
//! - **`Series`**: Ordered sequence of points, non-decreasing in x, no duplicate x
//! - **`SeriesId`**: Unique identifier for a time-series (128-bit integer)
//! - **`SeriesSet`**: Sorted, de-duplicated set of series ids identifying a request
//! - **`Viewport`**: Visible x window used by adaptive sampling
//!
//! # Example
//!
//! ```rust
//! use kuba_sampling::types::{Point, SeriesSet, Viewport};
//!
//! let p = Point::new(1_000, 42.5);
//! assert_eq!(p.x, 1_000);
//!
//! let set = SeriesSet::from_ids([3, 1, 3, 2]);
//! assert_eq!(set.ids(), &[1, 2, 3]);
//!
//! let vp = Viewport::new(0, 100).unwrap();
//! assert!(vp.contains(50));
//! ```

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Unique identifier for a time-series
///
/// Same width as the storage engine's series id so ids can be passed through
/// unchanged.
pub type SeriesId = u128;

/// A single point of a series
///
/// `x` is a numeric ordinal: a timestamp (any unit) or a row index.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    /// Ordinal position (timestamp or index)
    pub x: i64,
    /// Value
    pub y: f64,
}

impl Point {
    /// Create a new point
    pub fn new(x: i64, y: f64) -> Self {
        Self { x, y }
    }
}

impl From<(i64, f64)> for Point {
    fn from((x, y): (i64, f64)) -> Self {
        Self { x, y }
    }
}

/// Ordered sequence of points
///
/// Callers guarantee that x is strictly increasing. [`validate_series`]
/// checks this when data enters the crate through a provider.
pub type Series = Vec<Point>;

/// Series keyed by id, iterated in ascending id order
pub type SeriesMap = BTreeMap<SeriesId, Series>;

/// Check that a series is strictly increasing in x
///
/// Returns the index of the first offending point on failure.
pub fn validate_series(series: &[Point]) -> Result<()> {
    for (i, pair) in series.windows(2).enumerate() {
        if pair[1].x <= pair[0].x {
            return Err(Error::InvalidSeries(format!(
                "x must be strictly increasing: index {} has x={} after x={}",
                i + 1,
                pair[1].x,
                pair[0].x
            )));
        }
    }
    Ok(())
}

/// Total number of points across all series of a map
pub fn total_points(map: &SeriesMap) -> usize {
    map.values().map(Vec::len).sum()
}

/// Sorted, de-duplicated set of series ids
///
/// Two requests naming the same series in any order map to the same set,
/// which is what makes it usable as a cache identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SeriesSet(Vec<SeriesId>);

impl SeriesSet {
    /// Build a set from any collection of ids
    pub fn from_ids(ids: impl IntoIterator<Item = SeriesId>) -> Self {
        let mut ids: Vec<SeriesId> = ids.into_iter().collect();
        ids.sort_unstable();
        ids.dedup();
        Self(ids)
    }

    /// Set containing a single series
    pub fn single(id: SeriesId) -> Self {
        Self(vec![id])
    }

    /// Ids in ascending order
    pub fn ids(&self) -> &[SeriesId] {
        &self.0
    }

    /// Number of series in the set
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Check if the set is empty
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Check membership
    pub fn contains(&self, id: SeriesId) -> bool {
        self.0.binary_search(&id).is_ok()
    }
}

impl fmt::Display for SeriesSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, id) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{}", id)?;
        }
        write!(f, "}}")
    }
}

/// Visible x window for adaptive sampling (inclusive on both ends)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Viewport {
    /// Lower bound (inclusive)
    pub x_min: i64,
    /// Upper bound (inclusive)
    pub x_max: i64,
}

impl Viewport {
    /// Create a viewport, rejecting inverted bounds
    pub fn new(x_min: i64, x_max: i64) -> Result<Self> {
        let viewport = Self { x_min, x_max };
        viewport.validate()?;
        Ok(viewport)
    }

    /// Validate the bounds
    pub fn validate(&self) -> Result<()> {
        if self.x_min > self.x_max {
            return Err(Error::InvalidConfig(format!(
                "viewport x_min {} > x_max {}",
                self.x_min, self.x_max
            )));
        }
        Ok(())
    }

    /// Check if x falls inside the window
    pub fn contains(&self, x: i64) -> bool {
        x >= self.x_min && x <= self.x_max
    }
}
