//! Percentile latency tracking using HDR Histogram.
//!
//! Accurate percentile calculation for request latencies using HdrHistogram,
//! the industry standard for latency measurement. `aggregator::StageBucket`
//! wraps one `PercentileTracker` per stage (and, behind the per-path LRU, one
//! per `api_path`) to build the `StageMetricRecord`s in a `TerminalSummary`.
//!
//! # Features
//! - P50 (median), P90, P95, P99, P99.9 percentile tracking
//! - Thread-safe concurrent updates
//! - Memory-efficient histogram storage

use hdrhistogram::Histogram;
use std::sync::{Arc, Mutex};
use tracing::warn;

/// Percentile statistics for a set of latency measurements.
#[derive(Debug, Clone)]
pub struct PercentileStats {
    /// Number of samples
    pub count: u64,

    /// Minimum value (microseconds)
    pub min: u64,

    /// Maximum value (microseconds)
    pub max: u64,

    /// Mean/average value (microseconds)
    pub mean: f64,

    /// 50th percentile - median (microseconds)
    pub p50: u64,

    /// 90th percentile (microseconds)
    pub p90: u64,

    /// 95th percentile (microseconds)
    pub p95: u64,

    /// 99th percentile (microseconds)
    pub p99: u64,

    /// 99.9th percentile (microseconds)
    pub p99_9: u64,
}

impl PercentileStats {
    /// Format statistics as a human-readable string.
    pub fn format(&self) -> String {
        format!(
            "count={}, min={:.2}ms, max={:.2}ms, mean={:.2}ms, p50={:.2}ms, p90={:.2}ms, p95={:.2}ms, p99={:.2}ms, p99.9={:.2}ms",
            self.count,
            self.min as f64 / 1000.0,
            self.max as f64 / 1000.0,
            self.mean / 1000.0,
            self.p50 as f64 / 1000.0,
            self.p90 as f64 / 1000.0,
            self.p95 as f64 / 1000.0,
            self.p99 as f64 / 1000.0,
            self.p99_9 as f64 / 1000.0,
        )
    }

    /// Format statistics as a compact table row.
    pub fn format_table_row(&self, label: &str) -> String {
        format!(
            "{:<30} {:>8} {:>8.2} {:>8.2} {:>8.2} {:>8.2} {:>8.2} {:>8.2} {:>8.2}",
            label,
            self.count,
            self.p50 as f64 / 1000.0,
            self.p90 as f64 / 1000.0,
            self.p95 as f64 / 1000.0,
            self.p99 as f64 / 1000.0,
            self.p99_9 as f64 / 1000.0,
            self.mean / 1000.0,
            self.max as f64 / 1000.0,
        )
    }
}

/// Thread-safe percentile tracker.
///
/// Uses HdrHistogram internally for efficient percentile calculation.
/// All latencies are stored in microseconds.
pub struct PercentileTracker {
    /// HDR Histogram for efficient percentile calculation
    /// Tracks latencies from 1 microsecond to 60 seconds with 3 significant digits
    histogram: Arc<Mutex<Histogram<u64>>>,
}

impl PercentileTracker {
    /// Create a new percentile tracker.
    ///
    /// Configures histogram to track latencies from 1μs to 60 seconds
    /// with 3 significant digits of precision.
    pub fn new() -> Self {
        // Create histogram that can track 1μs to 60s with 3 significant digits
        let histogram =
            Histogram::new_with_bounds(1, 60_000_000, 3).expect("Failed to create histogram");

        Self {
            histogram: Arc::new(Mutex::new(histogram)),
        }
    }

    /// Record a latency measurement in milliseconds.
    ///
    /// # Arguments
    /// * `latency_ms` - Latency in milliseconds
    pub fn record_ms(&self, latency_ms: u64) {
        let latency_us = latency_ms * 1000; // Convert to microseconds
        self.record_us(latency_us);
    }

    /// Record a latency measurement in microseconds.
    ///
    /// # Arguments
    /// * `latency_us` - Latency in microseconds
    pub fn record_us(&self, latency_us: u64) {
        let mut hist = self.histogram.lock().unwrap();

        // Clamp to valid range (1μs to 60s)
        let clamped = latency_us.clamp(1, 60_000_000);

        if let Err(e) = hist.record(clamped) {
            warn!(
                latency_us = latency_us,
                error = %e,
                "Failed to record latency in histogram"
            );
        }
    }

    /// Get current percentile statistics.
    ///
    /// Returns None if no samples have been recorded.
    pub fn stats(&self) -> Option<PercentileStats> {
        let hist = self.histogram.lock().unwrap();

        if hist.is_empty() {
            return None;
        }

        Some(PercentileStats {
            count: hist.len(),
            min: hist.min(),
            max: hist.max(),
            mean: hist.mean(),
            p50: hist.value_at_quantile(0.50),
            p90: hist.value_at_quantile(0.90),
            p95: hist.value_at_quantile(0.95),
            p99: hist.value_at_quantile(0.99),
            p99_9: hist.value_at_quantile(0.999),
        })
    }

    /// Reset all recorded samples.
    pub fn reset(&self) {
        let mut hist = self.histogram.lock().unwrap();
        hist.clear();
    }
}

impl Default for PercentileTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percentile_tracker_basic() {
        let tracker = PercentileTracker::new();

        // Record some values: 10ms, 20ms, 30ms, 40ms, 50ms
        for i in 1..=5 {
            tracker.record_ms(i * 10);
        }

        let stats = tracker.stats().expect("Should have stats");
        assert_eq!(stats.count, 5);
        assert_eq!(stats.min, 10_000); // 10ms in microseconds

        // HDR histogram has precision limits - use tolerance for max value
        // Expected 50_000 but histogram may round to ~50_015 due to bucketing
        let expected_max = 50_000;
        let tolerance = 100; // 0.2% tolerance for histogram precision
        assert!(
            stats.max >= expected_max && stats.max <= expected_max + tolerance,
            "max should be ~{} but was {}",
            expected_max,
            stats.max
        );
    }

    #[test]
    fn test_percentile_tracker_empty() {
        let tracker = PercentileTracker::new();
        assert!(tracker.stats().is_none());
    }

    #[test]
    fn test_percentile_tracker_single_value() {
        let tracker = PercentileTracker::new();
        tracker.record_ms(100);

        let stats = tracker.stats().unwrap();
        assert_eq!(stats.count, 1);

        // HDR histogram has precision limits due to bucketing
        // Expected 100_000 but may round to ~100_031 (0.03% error)
        let expected = 100_000;
        let tolerance = 100; // 0.1% tolerance
        assert!(
            stats.p50 >= expected && stats.p50 <= expected + tolerance,
            "p50 should be ~{} but was {}",
            expected,
            stats.p50
        );
        assert!(
            stats.p99 >= expected && stats.p99 <= expected + tolerance,
            "p99 should be ~{} but was {}",
            expected,
            stats.p99
        );
    }

    #[test]
    fn test_percentile_tracker_reset() {
        let tracker = PercentileTracker::new();
        tracker.record_ms(100);
        assert!(tracker.stats().is_some());

        tracker.reset();
        assert!(tracker.stats().is_none());
    }
}
