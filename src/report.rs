//! Benchmark report value objects and their serialization.
//!
//! A `BenchmarkReport` is the immutable result of one run; a
//! `BenchmarkSuite` collects the runs of one invocation (a sweep is several
//! runs). Field names are stable across the JSON and YAML formats, and a
//! saved report reloads into an identical value.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::config::ConfigSnapshot;
use crate::errors::BenchError;
use crate::percentiles::MetricSummary;
use crate::request::{RequestOutcome, RequestRecord};

pub const REPORT_SCHEMA_VERSION: u32 = 1;

/// Terminal-outcome counts for one phase.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OutcomeCounts {
    pub completed: u64,
    pub cancelled: u64,
    pub timeout: u64,
    /// Error counts keyed by `RequestErrorKind` label.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub errors: BTreeMap<String, u64>,
}

impl OutcomeCounts {
    pub fn record(&mut self, outcome: &RequestOutcome) {
        match outcome {
            RequestOutcome::Completed => self.completed += 1,
            RequestOutcome::Cancelled => self.cancelled += 1,
            RequestOutcome::Timeout => self.timeout += 1,
            RequestOutcome::Error { kind } => {
                *self.errors.entry(kind.label().to_string()).or_insert(0) += 1;
            }
        }
    }

    pub fn errored(&self) -> u64 {
        self.errors.values().sum()
    }

    pub fn total(&self) -> u64 {
        self.completed + self.cancelled + self.timeout + self.errored()
    }
}

/// Outcome counts split by phase.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PhaseTotals {
    pub warmup: OutcomeCounts,
    pub measured: OutcomeCounts,
    pub cooldown: OutcomeCounts,
}

impl PhaseTotals {
    pub fn total(&self) -> u64 {
        self.warmup.total() + self.measured.total() + self.cooldown.total()
    }
}

/// Immutable result of one benchmark run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BenchmarkReport {
    pub schema_version: u32,

    /// Strategy label, e.g. `constant(20)`.
    pub strategy: String,

    /// Wall-clock start, RFC 3339. Human context only; every measurement in
    /// the report is monotonic.
    pub started_at: String,

    pub wall_duration_s: f64,

    /// Why the run stopped dispatching.
    pub stop_reason: String,

    pub config: ConfigSnapshot,

    pub phases: PhaseTotals,

    /// False when the measured phase completed zero requests; the metric
    /// summaries are then absent and the rates meaningless.
    pub statistics_defined: bool,

    /// End-to-end latency over measured completed requests.
    pub latency: Option<MetricSummary>,
    /// Time to first token over measured completed requests.
    pub ttft: Option<MetricSummary>,
    /// Inter-token gaps pooled across measured completed requests.
    pub itl: Option<MetricSummary>,

    pub request_rate_per_s: Option<f64>,
    pub output_token_rate_per_s: Option<f64>,

    pub measured_prompt_tokens: u64,
    pub measured_output_tokens: u64,

    /// Error counts by kind across every phase.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub error_breakdown: BTreeMap<String, u64>,

    /// Retained records: measured phase only, or every phase when the run
    /// was configured for full retention.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub records: Vec<RequestRecord>,
}

/// Provenance of a derived sweep: which extremes were observed and which
/// constant rates were chosen from them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepProvenance {
    pub synchronous_rate_per_s: f64,
    pub throughput_rate_per_s: f64,
    pub constant_rates: Vec<f64>,
}

/// Every run of one benchmarker invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BenchmarkSuite {
    pub schema_version: u32,
    pub started_at: String,
    pub sweep: Option<SweepProvenance>,
    pub reports: Vec<BenchmarkReport>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Format {
    Json,
    Yaml,
}

fn format_for(path: &Path) -> Result<Format, BenchError> {
    match path.extension().and_then(|e| e.to_str()) {
        Some("json") => Ok(Format::Json),
        Some("yaml") | Some("yml") => Ok(Format::Yaml),
        other => Err(BenchError::ConfigInvalid(format!(
            "unsupported report extension {:?} for {}",
            other,
            path.display()
        ))),
    }
}

/// Writes a suite to disk, format chosen by extension.
pub fn save_suite(suite: &BenchmarkSuite, path: &Path) -> Result<(), BenchError> {
    let text = match format_for(path)? {
        Format::Json => {
            let mut s = serde_json::to_string_pretty(suite)?;
            s.push('\n');
            s
        }
        Format::Yaml => serde_yaml::to_string(suite)?,
    };
    fs::write(path, text)?;
    Ok(())
}

/// Reads a suite back, format chosen by extension.
pub fn load_suite(path: &Path) -> Result<BenchmarkSuite, BenchError> {
    let text = fs::read_to_string(path)?;
    match format_for(path)? {
        Format::Json => Ok(serde_json::from_str(&text)?),
        Format::Yaml => Ok(serde_yaml::from_str(&text)?),
    }
}

/// Renders the end-of-run summary table printed to stdout.
pub fn format_suite_summary(suite: &BenchmarkSuite) -> String {
    let mut output = String::new();
    output.push_str(&format!(
        "\n{:<18} {:>9} {:>9} {:>10} {:>10} {:>10} {:>10} {:>11}\n",
        "Strategy", "Requests", "Errors", "Mean (ms)", "p99 (ms)", "TTFT (ms)", "ITL (ms)", "Rate (r/s)"
    ));
    output.push_str(&"-".repeat(94));
    output.push('\n');

    for report in &suite.reports {
        let measured = &report.phases.measured;
        let failures = measured.errored() + measured.timeout + measured.cancelled;
        let fmt_mean = |m: &Option<MetricSummary>| match m {
            Some(s) => format!("{:.2}", s.mean_ms),
            None => "-".to_string(),
        };
        let fmt_p99 = |m: &Option<MetricSummary>| match m {
            Some(s) => format!("{:.2}", s.p99_ms),
            None => "-".to_string(),
        };
        output.push_str(&format!(
            "{:<18} {:>9} {:>9} {:>10} {:>10} {:>10} {:>10} {:>11}\n",
            report.strategy,
            measured.completed,
            failures,
            fmt_mean(&report.latency),
            fmt_p99(&report.latency),
            fmt_mean(&report.ttft),
            fmt_mean(&report.itl),
            report
                .request_rate_per_s
                .map(|r| format!("{:.2}", r))
                .unwrap_or_else(|| "-".to_string()),
        ));
    }
    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BenchmarkConfig;
    use crate::errors::RequestErrorKind;

    fn sample_report() -> BenchmarkReport {
        let config: BenchmarkConfig = serde_yaml::from_str(
            "target: http://x\nmodel: m\nmax_requests: 10",
        )
        .unwrap();
        let mut measured = OutcomeCounts::default();
        measured.record(&RequestOutcome::Completed);
        measured.record(&RequestOutcome::Error {
            kind: RequestErrorKind::HttpStatus,
        });
        BenchmarkReport {
            schema_version: REPORT_SCHEMA_VERSION,
            strategy: "constant(20)".into(),
            started_at: "2026-01-01T00:00:00Z".into(),
            wall_duration_s: 5.0,
            stop_reason: "max_requests".into(),
            config: config.snapshot(),
            phases: PhaseTotals {
                measured,
                ..PhaseTotals::default()
            },
            statistics_defined: true,
            latency: Some(MetricSummary {
                count: 1,
                mean_ms: 100.0,
                stddev_ms: 0.0,
                min_ms: 100.0,
                max_ms: 100.0,
                p50_ms: 100.0,
                p75_ms: 100.0,
                p90_ms: 100.0,
                p95_ms: 100.0,
                p99_ms: 100.0,
            }),
            ttft: None,
            itl: None,
            request_rate_per_s: Some(0.2),
            output_token_rate_per_s: None,
            measured_prompt_tokens: 12,
            measured_output_tokens: 34,
            error_breakdown: BTreeMap::from([("http_status".to_string(), 1)]),
            records: Vec::new(),
        }
    }

    fn sample_suite() -> BenchmarkSuite {
        BenchmarkSuite {
            schema_version: REPORT_SCHEMA_VERSION,
            started_at: "2026-01-01T00:00:00Z".into(),
            sweep: None,
            reports: vec![sample_report()],
        }
    }

    #[test]
    fn outcome_counts_accumulate_by_kind() {
        let mut counts = OutcomeCounts::default();
        counts.record(&RequestOutcome::Completed);
        counts.record(&RequestOutcome::Timeout);
        counts.record(&RequestOutcome::Error {
            kind: RequestErrorKind::Connect,
        });
        counts.record(&RequestOutcome::Error {
            kind: RequestErrorKind::Connect,
        });
        assert_eq!(counts.completed, 1);
        assert_eq!(counts.timeout, 1);
        assert_eq!(counts.errored(), 2);
        assert_eq!(counts.total(), 4);
        assert_eq!(counts.errors.get("connect"), Some(&2));
    }

    #[test]
    fn json_round_trip_is_byte_identical() {
        let suite = sample_suite();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.json");

        save_suite(&suite, &path).unwrap();
        let first = fs::read(&path).unwrap();
        let loaded = load_suite(&path).unwrap();
        assert_eq!(loaded, suite);

        save_suite(&loaded, &path).unwrap();
        let second = fs::read(&path).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn yaml_round_trip_preserves_the_value() {
        let suite = sample_suite();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.yaml");
        save_suite(&suite, &path).unwrap();
        assert_eq!(load_suite(&path).unwrap(), suite);
    }

    #[test]
    fn unknown_extension_is_rejected() {
        let suite = sample_suite();
        assert!(save_suite(&suite, Path::new("report.txt")).is_err());
    }

    #[test]
    fn summary_table_lists_each_run() {
        let table = format_suite_summary(&sample_suite());
        assert!(table.contains("constant(20)"));
        assert!(table.contains("Rate (r/s)"));
        assert!(table.contains("100.00"));
    }
}
