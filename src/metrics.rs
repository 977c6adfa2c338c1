//! Prometheus metrics for sampling, caching and coordination
//!
//! All metrics register in the default registry on first use;
//! [`gather_metrics`] renders them in the text exposition format.

use crate::error::{Error, Result};
use lazy_static::lazy_static;
use prometheus::{
    register_counter, register_counter_vec, register_gauge_vec, register_histogram_vec, Counter, CounterVec,
    Encoder, GaugeVec, HistogramVec, TextEncoder,
};

lazy_static! {
    // === Sampling ===

    /// Reductions by method ("none" when sampling was bypassed)
    pub static ref REDUCTIONS_TOTAL: CounterVec = register_counter_vec!(
        "sampling_reductions_total",
        "Total reductions by method",
        &["method"]
    ).expect("sampling_reductions_total registers once");

    /// Reduction latency by method
    pub static ref REDUCTION_DURATION: HistogramVec = register_histogram_vec!(
        "sampling_duration_seconds",
        "Reduction latency in seconds",
        &["method"],
        vec![0.0001, 0.001, 0.01, 0.1, 0.5, 1.0]
    ).expect("sampling_duration_seconds registers once");

    // === Cache ===

    /// Cache lookups by pool and outcome (hit/miss)
    pub static ref CACHE_REQUESTS_TOTAL: CounterVec = register_counter_vec!(
        "sampling_cache_requests_total",
        "Cache lookups by pool and outcome",
        &["pool", "outcome"]
    ).expect("sampling_cache_requests_total registers once");

    /// Entries removed by pool and reason (lru/ttl/clear/pressure)
    pub static ref CACHE_EVICTIONS_TOTAL: CounterVec = register_counter_vec!(
        "sampling_cache_evictions_total",
        "Cache entries removed by pool and reason",
        &["pool", "reason"]
    ).expect("sampling_cache_evictions_total registers once");

    /// Estimated bytes held per pool
    pub static ref CACHE_BYTES: GaugeVec = register_gauge_vec!(
        "sampling_cache_bytes",
        "Estimated bytes held per cache pool",
        &["pool"]
    ).expect("sampling_cache_bytes registers once");

    // === Coordination ===

    /// Requests that attached to an in-flight computation
    pub static ref COALESCED_REQUESTS_TOTAL: Counter = register_counter!(
        "sampling_coalesced_requests_total",
        "Requests served by an already running computation"
    ).expect("sampling_coalesced_requests_total registers once");

    /// Tasks retried inline after the primary executor failed
    pub static ref EXECUTOR_FALLBACKS_TOTAL: Counter = register_counter!(
        "sampling_executor_fallbacks_total",
        "Sampling tasks retried on the inline executor"
    ).expect("sampling_executor_fallbacks_total registers once");

    /// Pressure transitions acted on, by level
    pub static ref PRESSURE_EVENTS_TOTAL: CounterVec = register_counter_vec!(
        "sampling_pressure_events_total",
        "Memory pressure increases handled, by new level",
        &["level"]
    ).expect("sampling_pressure_events_total registers once");
}

/// Get metrics in Prometheus text format
pub fn gather_metrics() -> Result<String> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = vec![];

    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| Error::Internal(format!("Failed to encode metrics: {}", e)))?;

    String::from_utf8(buffer).map_err(|e| Error::Internal(format!("Metrics contain invalid UTF-8: {}", e)))
}

/// Record one reduction
#[inline]
pub fn record_reduction(method: &str, duration_secs: f64) {
    REDUCTIONS_TOTAL.with_label_values(&[method]).inc();
    REDUCTION_DURATION.with_label_values(&[method]).observe(duration_secs);
}

/// Record a cache lookup
#[inline]
pub fn record_cache_request(pool: &str, outcome: &str) {
    CACHE_REQUESTS_TOTAL.with_label_values(&[pool, outcome]).inc();
}

/// Record removed cache entries
#[inline]
pub fn record_cache_eviction(pool: &str, reason: &str, count: u64) {
    if count > 0 {
        CACHE_EVICTIONS_TOTAL
            .with_label_values(&[pool, reason])
            .inc_by(count as f64);
    }
}

/// Update a pool's byte gauge
#[inline]
pub fn update_cache_bytes(pool: &str, bytes: usize) {
    CACHE_BYTES.with_label_values(&[pool]).set(bytes as f64);
}

/// Record a coalesced request
#[inline]
pub fn record_coalesced_request() {
    COALESCED_REQUESTS_TOTAL.inc();
}

/// Record an executor fallback
#[inline]
pub fn record_executor_fallback() {
    EXECUTOR_FALLBACKS_TOTAL.inc();
}

/// Record a pressure increase
#[inline]
pub fn record_pressure_event(level: &str) {
    PRESSURE_EVENTS_TOTAL.with_label_values(&[level]).inc();
}
