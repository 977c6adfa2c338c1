//! Sampling task execution
//!
//! Reductions run behind the [`SamplingExecutor`] capability:
//!
//! - [`InlineExecutor`] reduces in-process on tokio's blocking pool
//! - [`RayonExecutor`] hands the task to a dedicated rayon pool and awaits the
//!   result on a oneshot channel, bounded by a timeout
//! - [`FallbackExecutor`] wraps any executor and retries failed tasks inline
//!
//! All three take the same [`SamplingTask`], so callers never need to know
//! which one they hold.

use crate::error::{Error, Result};
use crate::metrics;
use crate::sampling::{reduce, SampleResult, SamplingConfig};
use crate::types::{Series, SeriesId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// One series to reduce
#[derive(Debug, Clone)]
pub struct SamplingTask {
    /// Task identifier (for logs)
    pub id: u64,
    /// Series the points belong to
    pub series_id: SeriesId,
    /// Points to reduce
    pub points: Series,
    /// Budget for this series
    pub target_points: usize,
    /// Sampling configuration; its own `target_points` is replaced by the
    /// task budget
    pub config: SamplingConfig,
}

impl SamplingTask {
    /// Run the reduction on the current thread
    pub fn run(&self) -> Result<SampleResult> {
        reduce(&self.points, &self.config.with_target_points(self.target_points))
    }
}

/// Something that can run sampling tasks
#[async_trait]
pub trait SamplingExecutor: Send + Sync {
    /// Executor name (for logs)
    fn name(&self) -> &'static str;

    /// Reduce the task's points
    async fn execute(&self, task: Arc<SamplingTask>) -> Result<SampleResult>;
}

// ============================================================================
// Inline
// ============================================================================

/// Runs tasks in-process on tokio's blocking pool
///
/// The async worker that awaits the result is never blocked by the
/// reduction itself.
#[derive(Debug, Clone, Copy, Default)]
pub struct InlineExecutor;

#[async_trait]
impl SamplingExecutor for InlineExecutor {
    fn name(&self) -> &'static str {
        "inline"
    }

    async fn execute(&self, task: Arc<SamplingTask>) -> Result<SampleResult> {
        let task_id = task.id;
        tokio::task::spawn_blocking(move || task.run())
            .await
            .map_err(|e| Error::Executor(format!("inline task {} aborted: {}", task_id, e)))?
    }
}

// ============================================================================
// Rayon
// ============================================================================

/// Runs tasks on a dedicated rayon thread pool
pub struct RayonExecutor {
    pool: rayon::ThreadPool,
    timeout: Duration,
}

impl RayonExecutor {
    /// Build a pool with `threads` workers (0 = one per core)
    pub fn new(threads: usize, timeout: Duration) -> Result<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("sampling-worker-{}", i))
            .panic_handler(|_| warn!("Sampling worker panicked"))
            .build()
            .map_err(|e| Error::Executor(format!("failed to build worker pool: {}", e)))?;
        Ok(Self { pool, timeout })
    }

    /// Per-task timeout
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Worker count
    pub fn threads(&self) -> usize {
        self.pool.current_num_threads()
    }
}

#[async_trait]
impl SamplingExecutor for RayonExecutor {
    fn name(&self) -> &'static str {
        "rayon"
    }

    async fn execute(&self, task: Arc<SamplingTask>) -> Result<SampleResult> {
        let (result_tx, result_rx) = oneshot::channel();
        let worker_task = Arc::clone(&task);
        let start = Instant::now();

        self.pool.spawn(move || {
            // Receiver may be gone after a timeout
            let _ = result_tx.send(worker_task.run());
        });

        match tokio::time::timeout(self.timeout, result_rx).await {
            Ok(Ok(result)) => {
                debug!(
                    task_id = task.id,
                    series_id = %task.series_id,
                    duration_us = start.elapsed().as_micros() as u64,
                    "Worker task completed"
                );
                result
            },
            // Sender dropped without a result: the worker panicked
            Ok(Err(_)) => Err(Error::Executor(format!(
                "worker dropped task {} without a result",
                task.id
            ))),
            Err(_) => Err(Error::Timeout {
                millis: self.timeout.as_millis() as u64,
            }),
        }
    }
}

// ============================================================================
// Fallback
// ============================================================================

/// Retries failed tasks on [`InlineExecutor`]
///
/// Only when the inline retry also fails is the error returned.
pub struct FallbackExecutor<E> {
    primary: E,
    fallback: InlineExecutor,
}

impl<E: SamplingExecutor> FallbackExecutor<E> {
    /// Wrap `primary`
    pub fn new(primary: E) -> Self {
        Self {
            primary,
            fallback: InlineExecutor,
        }
    }

    /// Wrapped executor
    pub fn primary(&self) -> &E {
        &self.primary
    }
}

#[async_trait]
impl<E: SamplingExecutor> SamplingExecutor for FallbackExecutor<E> {
    fn name(&self) -> &'static str {
        self.primary.name()
    }

    async fn execute(&self, task: Arc<SamplingTask>) -> Result<SampleResult> {
        match self.primary.execute(Arc::clone(&task)).await {
            Ok(result) => Ok(result),
            Err(e) => {
                warn!(
                    executor = self.primary.name(),
                    task_id = task.id,
                    error = %e,
                    "Sampling task failed, retrying inline"
                );
                metrics::record_executor_fallback();
                self.fallback.execute(task).await
            },
        }
    }
}

// ============================================================================
// Configuration
// ============================================================================

/// Which executor the coordinator uses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutorKind {
    /// Synchronous in-process execution
    Inline,
    /// Dedicated rayon pool with inline fallback
    #[default]
    Rayon,
}

/// Executor settings
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutorConfig {
    /// Executor to build
    pub kind: ExecutorKind,
    /// Rayon worker count (0 = one per core)
    pub threads: usize,
    /// Per-task timeout for pooled execution
    pub timeout: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            kind: ExecutorKind::Rayon,
            threads: 0,
            timeout: Duration::from_secs(30),
        }
    }
}

impl ExecutorConfig {
    /// Build the configured executor
    pub fn build(&self) -> Result<Arc<dyn SamplingExecutor>> {
        Ok(match self.kind {
            ExecutorKind::Inline => Arc::new(InlineExecutor),
            ExecutorKind::Rayon => Arc::new(FallbackExecutor::new(RayonExecutor::new(
                self.threads,
                self.timeout,
            )?)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sampling::{MethodTag, SamplingMethod};
    use crate::types::Point;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn task(n: i64, target: usize) -> Arc<SamplingTask> {
        Arc::new(SamplingTask {
            id: 1,
            series_id: 7,
            points: (0..n).map(|i| Point::new(i, (i * i % 13) as f64)).collect(),
            target_points: target,
            config: SamplingConfig::new(SamplingMethod::Lttb, 1000)
                .unwrap()
                .with_threshold(0),
        })
    }

    /// Executor that always fails
    struct Broken {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl SamplingExecutor for Broken {
        fn name(&self) -> &'static str {
            "broken"
        }

        async fn execute(&self, _task: Arc<SamplingTask>) -> Result<SampleResult> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            Err(Error::Executor("worker unavailable".into()))
        }
    }

    #[tokio::test]
    async fn test_inline_uses_task_budget() {
        let result = InlineExecutor.execute(task(500, 50)).await.unwrap();
        assert_eq!(result.sampled_count, 50);
        assert_eq!(result.method, MethodTag::Lttb);
    }

    #[tokio::test]
    async fn test_inline_keeps_runtime_responsive() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let ticker = {
            let ticks = Arc::clone(&ticks);
            tokio::spawn(async move {
                loop {
                    ticks.fetch_add(1, Ordering::Relaxed);
                    tokio::task::yield_now().await;
                }
            })
        };

        // Single-threaded runtime: the ticker only advances while the
        // reduction runs elsewhere
        let result = InlineExecutor.execute(task(1_000_000, 500)).await.unwrap();
        assert_eq!(result.sampled_count, 500);
        assert!(ticks.load(Ordering::Relaxed) > 0);
        ticker.abort();
    }

    #[tokio::test]
    async fn test_rayon_matches_inline() {
        let executor = RayonExecutor::new(2, Duration::from_secs(5)).unwrap();
        assert_eq!(executor.threads(), 2);
        let pooled = executor.execute(task(2000, 100)).await.unwrap();
        let inline = InlineExecutor.execute(task(2000, 100)).await.unwrap();
        assert_eq!(pooled, inline);
    }

    #[tokio::test]
    async fn test_fallback_retries_inline() {
        let executor = FallbackExecutor::new(Broken {
            calls: AtomicUsize::new(0),
        });
        let result = executor.execute(task(300, 30)).await.unwrap();
        assert_eq!(result.sampled_count, 30);
        assert_eq!(executor.primary().calls.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_fallback_surfaces_second_failure() {
        let executor = FallbackExecutor::new(Broken {
            calls: AtomicUsize::new(0),
        });
        // Zero budget fails validation on the inline retry too
        let err = executor.execute(task(300, 0)).await.unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
    }

    #[tokio::test]
    async fn test_build_from_config() {
        let inline = ExecutorConfig {
            kind: ExecutorKind::Inline,
            ..Default::default()
        };
        assert_eq!(inline.build().unwrap().name(), "inline");
        let pooled = ExecutorConfig {
            threads: 1,
            ..Default::default()
        };
        assert_eq!(pooled.build().unwrap().name(), "rayon");
    }
}
