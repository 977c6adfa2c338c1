//! Data sources consumed by the coordinator
//!
//! - [`ChunkSource`]: pull-based chunk stream for one series. Finite,
//!   forward-only, not restartable: once `next_chunk` returns `Ok(None)` the
//!   source is exhausted, and a new one must be fetched to read again.
//! - [`SeriesProvider`]: async capability that opens a [`ChunkSource`] per
//!   series id.
//! - [`RankPrefilter`]: picks approximately evenly spaced rows by rank, used
//!   to shrink very large series before the sampling algorithms run.

use crate::error::{Error, Result};
use crate::types::{validate_series, Point, Series, SeriesId, SeriesMap, SeriesSet};
use async_trait::async_trait;
use futures::future::try_join_all;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

// ============================================================================
// Chunk Source
// ============================================================================

/// Pull-based stream of point chunks for one series
pub trait ChunkSource: Send {
    /// Pull the next chunk
    ///
    /// Returns:
    /// - `Ok(Some(chunk))` - more data
    /// - `Ok(None)` - end of stream (every later call also returns `Ok(None)`)
    /// - `Err(e)` - the source failed
    fn next_chunk(&mut self) -> Result<Option<Vec<Point>>>;

    /// Total points the source expects to yield, if known
    fn size_hint(&self) -> Option<usize> {
        None
    }
}

/// Chunk source over an owned vector
pub struct VecChunkSource {
    points: Arc<[Point]>,
    offset: usize,
    chunk_size: usize,
}

impl VecChunkSource {
    /// Default number of points per chunk
    pub const DEFAULT_CHUNK_SIZE: usize = 8192;

    /// Yield `points` in chunks of `chunk_size` (at least 1)
    pub fn new(points: impl Into<Arc<[Point]>>, chunk_size: usize) -> Self {
        Self {
            points: points.into(),
            offset: 0,
            chunk_size: chunk_size.max(1),
        }
    }
}

impl ChunkSource for VecChunkSource {
    fn next_chunk(&mut self) -> Result<Option<Vec<Point>>> {
        if self.offset >= self.points.len() {
            return Ok(None);
        }
        let end = (self.offset + self.chunk_size).min(self.points.len());
        let chunk = self.points[self.offset..end].to_vec();
        self.offset = end;
        Ok(Some(chunk))
    }

    fn size_hint(&self) -> Option<usize> {
        Some(self.points.len())
    }
}

/// Drain a source into one series and check it is strictly increasing in x
pub fn collect_series(source: &mut dyn ChunkSource) -> Result<Series> {
    let mut series = Vec::with_capacity(source.size_hint().unwrap_or(0));
    while let Some(chunk) = source.next_chunk()? {
        series.extend(chunk);
    }
    validate_series(&series)?;
    Ok(series)
}

// ============================================================================
// Series Provider
// ============================================================================

/// Opens chunk sources for series
#[async_trait]
pub trait SeriesProvider: Send + Sync {
    /// Open a fresh source for `id`
    async fn fetch(&self, id: SeriesId) -> Result<Box<dyn ChunkSource>>;
}

/// Fetch and collect every series in `set`
///
/// Series are fetched concurrently; the first failure aborts the whole set.
pub async fn fetch_set(provider: &dyn SeriesProvider, set: &SeriesSet) -> Result<SeriesMap> {
    let fetches = set.ids().iter().map(|&id| async move {
        let mut source = provider.fetch(id).await?;
        let series = collect_series(source.as_mut()).map_err(|e| match e {
            Error::InvalidSeries(msg) => Error::InvalidSeries(format!("series {}: {}", id, msg)),
            other => other,
        })?;
        Ok::<_, Error>((id, series))
    });

    let map: SeriesMap = try_join_all(fetches).await?.into_iter().collect();
    debug!(series = %set, points = crate::types::total_points(&map), "Fetched series set");
    Ok(map)
}

/// Provider over series held in memory
pub struct InMemoryProvider {
    series: RwLock<SeriesMap>,
    chunk_size: usize,
    fetches: AtomicU64,
}

impl InMemoryProvider {
    /// Create an empty provider
    pub fn new() -> Self {
        Self {
            series: RwLock::new(SeriesMap::new()),
            chunk_size: VecChunkSource::DEFAULT_CHUNK_SIZE,
            fetches: AtomicU64::new(0),
        }
    }

    /// Create a provider holding `series`
    pub fn with_series(series: SeriesMap) -> Self {
        let provider = Self::new();
        *provider.series.write() = series;
        provider
    }

    /// Set the chunk size of opened sources
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// Add or replace a series
    pub fn insert(&self, id: SeriesId, points: Series) {
        self.series.write().insert(id, points);
    }

    /// Remove a series
    pub fn remove(&self, id: SeriesId) -> Option<Series> {
        self.series.write().remove(&id)
    }

    /// Number of `fetch` calls served so far
    pub fn fetch_count(&self) -> u64 {
        self.fetches.load(Ordering::Relaxed)
    }
}

impl Default for InMemoryProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SeriesProvider for InMemoryProvider {
    async fn fetch(&self, id: SeriesId) -> Result<Box<dyn ChunkSource>> {
        self.fetches.fetch_add(1, Ordering::Relaxed);
        let points = self
            .series
            .read()
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("series {}", id)))?;
        Ok(Box::new(VecChunkSource::new(points, self.chunk_size)))
    }
}

// ============================================================================
// Rank Prefilter
// ============================================================================

/// Approximate even-by-rank row selection
///
/// Implementations may be backed by an analytical store; they need not match
/// the sampling algorithms exactly.
pub trait RankPrefilter: Send + Sync {
    /// Reduce `series` to at most `max_rows` points spread evenly by rank
    fn prefilter(&self, series: &[Point], max_rows: usize) -> Result<Series>;
}

/// In-process rank prefilter
///
/// Picks ranks `round(i * (n - 1) / (k - 1))`, so the first and last points
/// are always kept.
#[derive(Debug, Clone, Copy, Default)]
pub struct EvenRankPrefilter;

impl RankPrefilter for EvenRankPrefilter {
    fn prefilter(&self, series: &[Point], max_rows: usize) -> Result<Series> {
        let n = series.len();
        if n <= max_rows {
            return Ok(series.to_vec());
        }
        match max_rows {
            0 => return Ok(Vec::new()),
            1 => return Ok(vec![series[0]]),
            _ => {},
        }

        let last = (n - 1) as u128;
        let steps = (max_rows - 1) as u128;
        let mut out: Series = Vec::with_capacity(max_rows);
        for i in 0..max_rows as u128 {
            // Rounded integer division keeps ranks exact for huge series
            let rank = ((i * last * 2 + steps) / (steps * 2)) as usize;
            out.push(series[rank]);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(n: i64) -> Series {
        (0..n).map(|i| Point::new(i, (i % 7) as f64)).collect()
    }

    #[test]
    fn test_vec_source_chunks_then_exhausts() {
        let mut source = VecChunkSource::new(ramp(10), 4);
        assert_eq!(source.next_chunk().unwrap().unwrap().len(), 4);
        assert_eq!(source.next_chunk().unwrap().unwrap().len(), 4);
        assert_eq!(source.next_chunk().unwrap().unwrap().len(), 2);
        assert!(source.next_chunk().unwrap().is_none());
        // Not restartable
        assert!(source.next_chunk().unwrap().is_none());
    }

    #[test]
    fn test_collect_rejects_unordered() {
        let points = vec![Point::new(0, 0.0), Point::new(5, 0.0), Point::new(3, 0.0)];
        let mut source = VecChunkSource::new(points, 2);
        assert!(matches!(
            collect_series(&mut source),
            Err(Error::InvalidSeries(_))
        ));
    }

    #[tokio::test]
    async fn test_fetch_set() {
        let provider = InMemoryProvider::with_series(SeriesMap::from([(1, ramp(5)), (2, ramp(3))]))
            .with_chunk_size(2);
        let map = fetch_set(&provider, &SeriesSet::from_ids([2, 1])).await.unwrap();
        assert_eq!(map[&1].len(), 5);
        assert_eq!(map[&2].len(), 3);
        assert_eq!(provider.fetch_count(), 2);
    }

    #[tokio::test]
    async fn test_fetch_set_missing_series() {
        let provider = InMemoryProvider::new();
        let err = fetch_set(&provider, &SeriesSet::single(9)).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[test]
    fn test_even_rank_prefilter() {
        let series = ramp(101);
        let out = EvenRankPrefilter.prefilter(&series, 11).unwrap();
        assert_eq!(out.len(), 11);
        assert_eq!(out[0], series[0]);
        assert_eq!(out[10], series[100]);
        assert!(out.iter().all(|p| p.x % 10 == 0));

        assert_eq!(EvenRankPrefilter.prefilter(&series, 500).unwrap().len(), 101);
        assert_eq!(EvenRankPrefilter.prefilter(&series, 1).unwrap(), vec![series[0]]);
    }
}
