//! Memory pressure signal and cache response
//!
//! A [`PressureSensor`] publishes [`PressureSnapshot`]s on a watch channel.
//! The [`PressureResponder`] reacts to level increases only:
//!
//! - rising to `High`: evict the least-recently-used half of every pool
//! - rising to `Critical`: clear every pool
//!
//! Staying at a level, or falling, does nothing.

use super::tiered::TieredCache;
use crate::error::{Error, Result};
use crate::metrics;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Memory pressure level, ordered from least to most severe
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PressureLevel {
    /// Below the medium watermark
    Low,
    /// Above the medium watermark
    Medium,
    /// Above the high watermark
    High,
    /// Above the critical watermark
    Critical,
}

impl PressureLevel {
    /// Lowercase name (used as a metric label)
    pub fn as_str(&self) -> &'static str {
        match self {
            PressureLevel::Low => "low",
            PressureLevel::Medium => "medium",
            PressureLevel::High => "high",
            PressureLevel::Critical => "critical",
        }
    }
}

impl fmt::Display for PressureLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Usage ratios at which each level begins
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Watermarks {
    /// Medium pressure (default 0.70)
    pub medium: f64,
    /// High pressure (default 0.90)
    pub high: f64,
    /// Critical pressure (default 0.95)
    pub critical: f64,
}

impl Default for Watermarks {
    fn default() -> Self {
        Self {
            medium: 0.70,
            high: 0.90,
            critical: 0.95,
        }
    }
}

impl Watermarks {
    /// Create validated watermarks
    pub fn new(medium: f64, high: f64, critical: f64) -> Result<Self> {
        let marks = Self {
            medium,
            high,
            critical,
        };
        marks.validate()?;
        Ok(marks)
    }

    /// Check `0 < medium < high < critical <= 1`
    pub fn validate(&self) -> Result<()> {
        let ordered = self.medium > 0.0
            && self.medium < self.high
            && self.high < self.critical
            && self.critical <= 1.0;
        if !ordered {
            return Err(Error::InvalidConfig(format!(
                "watermarks must satisfy 0 < medium < high < critical <= 1, got {}/{}/{}",
                self.medium, self.high, self.critical
            )));
        }
        Ok(())
    }

    /// Level for a usage ratio
    pub fn classify(&self, ratio: f64) -> PressureLevel {
        if !ratio.is_finite() || ratio < self.medium {
            PressureLevel::Low
        } else if ratio < self.high {
            PressureLevel::Medium
        } else if ratio < self.critical {
            PressureLevel::High
        } else {
            PressureLevel::Critical
        }
    }
}

/// One memory reading
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PressureSnapshot {
    /// Memory in use
    pub used_mb: f64,
    /// Memory available in total
    pub total_mb: f64,
    /// Classified level
    pub level: PressureLevel,
}

impl PressureSnapshot {
    /// Classify a reading
    ///
    /// A non-positive total classifies as `Low`.
    pub fn new(used_mb: f64, total_mb: f64, watermarks: &Watermarks) -> Self {
        let ratio = if total_mb > 0.0 { used_mb / total_mb } else { 0.0 };
        Self {
            used_mb,
            total_mb,
            level: watermarks.classify(ratio),
        }
    }

    /// Reading with nothing in use
    pub fn idle() -> Self {
        Self {
            used_mb: 0.0,
            total_mb: 0.0,
            level: PressureLevel::Low,
        }
    }
}

/// Source of memory pressure readings
pub trait PressureSensor: Send + Sync {
    /// Latest reading
    fn current(&self) -> PressureSnapshot;

    /// Receiver that observes every new reading
    fn subscribe(&self) -> watch::Receiver<PressureSnapshot>;
}

/// Sensor fed explicitly by the host process
pub struct ManualPressureSensor {
    watermarks: Watermarks,
    tx: watch::Sender<PressureSnapshot>,
}

impl ManualPressureSensor {
    /// Create a sensor that starts at `Low`
    pub fn new(watermarks: Watermarks) -> Self {
        let (tx, _) = watch::channel(PressureSnapshot::idle());
        Self { watermarks, tx }
    }

    /// Publish a reading and return its classification
    pub fn report(&self, used_mb: f64, total_mb: f64) -> PressureSnapshot {
        let snapshot = PressureSnapshot::new(used_mb, total_mb, &self.watermarks);
        self.tx.send_replace(snapshot);
        snapshot
    }
}

impl Default for ManualPressureSensor {
    fn default() -> Self {
        Self::new(Watermarks::default())
    }
}

impl PressureSensor for ManualPressureSensor {
    fn current(&self) -> PressureSnapshot {
        *self.tx.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<PressureSnapshot> {
        self.tx.subscribe()
    }
}

/// What the responder did for a snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PressureAction {
    /// Level did not rise into `High` or `Critical`
    None,
    /// Half of every pool evicted
    EvictedHalf(usize),
    /// Every pool cleared
    Cleared(usize),
}

/// Edge-triggered cache eviction on rising pressure
pub struct PressureResponder {
    cache: Arc<TieredCache>,
    last_level: Mutex<PressureLevel>,
}

impl PressureResponder {
    /// Create a responder for `cache`, starting at `Low`
    pub fn new(cache: Arc<TieredCache>) -> Self {
        Self {
            cache,
            last_level: Mutex::new(PressureLevel::Low),
        }
    }

    /// Last level seen
    pub fn last_level(&self) -> PressureLevel {
        *self.last_level.lock()
    }

    /// React to one snapshot
    pub fn handle(&self, snapshot: PressureSnapshot) -> PressureAction {
        let previous = {
            let mut last = self.last_level.lock();
            std::mem::replace(&mut *last, snapshot.level)
        };

        if snapshot.level <= previous {
            return PressureAction::None;
        }

        metrics::record_pressure_event(snapshot.level.as_str());
        match snapshot.level {
            PressureLevel::Critical => {
                let removed = self.cache.clear(None);
                warn!(
                    used_mb = snapshot.used_mb,
                    total_mb = snapshot.total_mb,
                    removed,
                    "Critical memory pressure, cleared all cache pools"
                );
                PressureAction::Cleared(removed)
            },
            PressureLevel::High => {
                let removed = self.cache.evict_half();
                info!(
                    used_mb = snapshot.used_mb,
                    total_mb = snapshot.total_mb,
                    removed,
                    "High memory pressure, evicted half of each cache pool"
                );
                PressureAction::EvictedHalf(removed)
            },
            PressureLevel::Low | PressureLevel::Medium => PressureAction::None,
        }
    }

    /// Respond to every reading from `sensor` until the sensor is dropped
    pub fn spawn(self: Arc<Self>, sensor: &dyn PressureSensor) -> JoinHandle<()> {
        let mut rx = sensor.subscribe();
        tokio::spawn(async move {
            let initial = *rx.borrow_and_update();
            self.handle(initial);
            while rx.changed().await.is_ok() {
                let snapshot = *rx.borrow_and_update();
                self.handle(snapshot);
            }
        })
    }
}
