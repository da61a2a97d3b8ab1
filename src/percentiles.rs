//! Streaming statistics and bounded-memory percentile estimation.
//!
//! Every latency metric keeps integer running sums (count, sum,
//! sum-of-squares, min, max) plus two quantile paths: exact retained samples
//! while the sample count stays under a configured limit, and an
//! HdrHistogram covering 1µs to 60s at 3 significant digits (~0.1% value
//! error) once it does not. Integer accumulation makes the finalized
//! statistics independent of the order records arrived in.

use hdrhistogram::Histogram;
use serde::{Deserialize, Serialize};
use tracing::debug;

const HISTOGRAM_MIN_US: u64 = 1;
const HISTOGRAM_MAX_US: u64 = 60_000_000;

/// Running moments of one metric, in nanoseconds.
#[derive(Debug, Clone, Default)]
pub struct StreamingStats {
    count: u64,
    sum_ns: u128,
    sum_sq_ns: u128,
    min_ns: u64,
    max_ns: u64,
}

impl StreamingStats {
    pub fn record(&mut self, value_ns: u64) {
        if self.count == 0 {
            self.min_ns = value_ns;
            self.max_ns = value_ns;
        } else {
            self.min_ns = self.min_ns.min(value_ns);
            self.max_ns = self.max_ns.max(value_ns);
        }
        self.count += 1;
        self.sum_ns += value_ns as u128;
        self.sum_sq_ns += (value_ns as u128) * (value_ns as u128);
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn min_ns(&self) -> Option<u64> {
        (self.count > 0).then_some(self.min_ns)
    }

    pub fn max_ns(&self) -> Option<u64> {
        (self.count > 0).then_some(self.max_ns)
    }

    pub fn mean_ns(&self) -> Option<f64> {
        (self.count > 0).then(|| self.sum_ns as f64 / self.count as f64)
    }

    /// Sample standard deviation; zero below two samples.
    pub fn stddev_ns(&self) -> Option<f64> {
        if self.count == 0 {
            return None;
        }
        if self.count < 2 {
            return Some(0.0);
        }
        let n = self.count as f64;
        let sum = self.sum_ns as f64;
        let sum_sq = self.sum_sq_ns as f64;
        let variance = ((sum_sq - sum * sum / n) / (n - 1.0)).max(0.0);
        Some(variance.sqrt())
    }
}

/// Summary of one latency metric, in milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSummary {
    pub count: u64,
    pub mean_ms: f64,
    pub stddev_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
    pub p50_ms: f64,
    pub p75_ms: f64,
    pub p90_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
}

impl MetricSummary {
    /// Compact one-line rendering for logs and the stdout table.
    pub fn format(&self) -> String {
        format!(
            "count={}, mean={:.2}ms, stddev={:.2}ms, min={:.2}ms, max={:.2}ms, p50={:.2}ms, p90={:.2}ms, p99={:.2}ms",
            self.count,
            self.mean_ms,
            self.stddev_ms,
            self.min_ms,
            self.max_ms,
            self.p50_ms,
            self.p90_ms,
            self.p99_ms,
        )
    }
}

/// Percentile tracker for one metric.
pub struct LatencyTracker {
    stats: StreamingStats,
    histogram: Histogram<u64>,
    exact_ns: Option<Vec<u64>>,
    exact_limit: usize,
}

impl LatencyTracker {
    /// `exact_limit` bounds the exact-sample memory; past it the tracker
    /// answers quantiles from the histogram alone.
    pub fn new(exact_limit: usize) -> Self {
        let histogram = Histogram::new_with_bounds(HISTOGRAM_MIN_US, HISTOGRAM_MAX_US, 3)
            .expect("static histogram bounds are valid");
        Self {
            stats: StreamingStats::default(),
            histogram,
            exact_ns: if exact_limit > 0 { Some(Vec::new()) } else { None },
            exact_limit,
        }
    }

    pub fn record_ns(&mut self, value_ns: u64) {
        self.stats.record(value_ns);

        let value_us = (value_ns / 1_000).clamp(HISTOGRAM_MIN_US, HISTOGRAM_MAX_US);
        // Saturation only loses resolution beyond the 60s ceiling.
        let _ = self.histogram.record(value_us);

        if let Some(samples) = &mut self.exact_ns {
            if samples.len() < self.exact_limit {
                samples.push(value_ns);
            } else {
                debug!(
                    limit = self.exact_limit,
                    "Exact-sample limit reached, switching to histogram quantiles"
                );
                self.exact_ns = None;
            }
        }
    }

    pub fn count(&self) -> u64 {
        self.stats.count()
    }

    /// Finalizes the metric. `None` when nothing was recorded.
    pub fn summarize(mut self) -> Option<MetricSummary> {
        if self.stats.count() == 0 {
            return None;
        }
        if let Some(samples) = &mut self.exact_ns {
            samples.sort_unstable();
        }

        let quantile = |tracker: &Self, q: f64| -> f64 {
            let ns = match &tracker.exact_ns {
                Some(samples) => {
                    let n = samples.len();
                    let rank = ((q * n as f64).ceil() as usize).clamp(1, n);
                    samples[rank - 1]
                }
                None => tracker.histogram.value_at_quantile(q) * 1_000,
            };
            ns as f64 / 1e6
        };

        Some(MetricSummary {
            count: self.stats.count(),
            mean_ms: self.stats.mean_ns().unwrap_or(0.0) / 1e6,
            stddev_ms: self.stats.stddev_ns().unwrap_or(0.0) / 1e6,
            min_ms: self.stats.min_ns().unwrap_or(0) as f64 / 1e6,
            max_ms: self.stats.max_ns().unwrap_or(0) as f64 / 1e6,
            p50_ms: quantile(&self, 0.50),
            p75_ms: quantile(&self, 0.75),
            p90_ms: quantile(&self, 0.90),
            p95_ms: quantile(&self, 0.95),
            p99_ms: quantile(&self, 0.99),
        })
    }
}
