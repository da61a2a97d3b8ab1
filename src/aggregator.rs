//! Single-consumer aggregation of completed request records.
//!
//! The aggregator owns every record after its terminal outcome and maintains
//! per-phase outcome counts plus streaming statistics for the measured
//! phase. Statistics never depend on the order completions arrive in:
//! accumulation uses integer sums and the retained records are ordered by
//! sequence index at finalization.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tracing::{debug, error};

use crate::config::ConfigSnapshot;
use crate::percentiles::LatencyTracker;
use crate::report::{BenchmarkReport, BenchmarkSuite, PhaseTotals, REPORT_SCHEMA_VERSION};
use crate::request::{Phase, RequestOutcome, RequestRecord};

/// Run context the aggregator cannot know on its own, supplied at
/// finalization by the benchmarker.
#[derive(Debug, Clone)]
pub struct RunMeta {
    pub strategy: String,
    pub started_at: DateTime<Utc>,
    pub wall_duration_s: f64,
    pub stop_reason: String,
    pub config: ConfigSnapshot,
}

/// Per-run accumulator of terminal records.
pub struct Aggregator {
    retain_all: bool,

    phases: PhaseTotals,
    error_breakdown: BTreeMap<String, u64>,

    latency: LatencyTracker,
    ttft: LatencyTracker,
    itl: LatencyTracker,

    measured_prompt_tokens: u64,
    measured_output_tokens: u64,

    /// Measured-phase wall window: first actual dispatch to last completion.
    window_start_ns: Option<u64>,
    window_end_ns: Option<u64>,

    records: Vec<RequestRecord>,
    nonterminal_dropped: u64,
}

impl Aggregator {
    pub fn new(retain_all: bool, max_exact_samples: usize) -> Self {
        Self {
            retain_all,
            phases: PhaseTotals::default(),
            error_breakdown: BTreeMap::new(),
            latency: LatencyTracker::new(max_exact_samples),
            ttft: LatencyTracker::new(max_exact_samples),
            itl: LatencyTracker::new(max_exact_samples),
            measured_prompt_tokens: 0,
            measured_output_tokens: 0,
            window_start_ns: None,
            window_end_ns: None,
            records: Vec::new(),
            nonterminal_dropped: 0,
        }
    }

    /// Consumes the channel until the scheduler drops its sender, then
    /// returns the accumulator for finalization.
    pub async fn run(mut self, mut completions: mpsc::UnboundedReceiver<RequestRecord>) -> Self {
        while let Some(record) = completions.recv().await {
            self.consume(record);
        }
        self
    }

    /// Folds one terminal record into the running state.
    pub fn consume(&mut self, record: RequestRecord) {
        let outcome = match record.outcome {
            Some(outcome) => outcome,
            None => {
                // Terminal outcomes are the scheduler/worker contract; a
                // record without one cannot be attributed and is dropped.
                error!(
                    sequence_index = record.sequence_index,
                    "Record arrived without a terminal outcome"
                );
                self.nonterminal_dropped += 1;
                return;
            }
        };

        let counts = match record.phase {
            Phase::Warmup => &mut self.phases.warmup,
            Phase::Measured => &mut self.phases.measured,
            Phase::Cooldown => &mut self.phases.cooldown,
        };
        counts.record(&outcome);
        if let Some(kind) = outcome.error_kind() {
            *self
                .error_breakdown
                .entry(kind.label().to_string())
                .or_insert(0) += 1;
        }

        if record.phase == Phase::Measured {
            if let Some(start) = record.actual_dispatch {
                self.window_start_ns = Some(match self.window_start_ns {
                    Some(existing) => existing.min(start),
                    None => start,
                });
            }
            if let Some(end) = record.completion {
                self.window_end_ns = Some(match self.window_end_ns {
                    Some(existing) => existing.max(end),
                    None => end,
                });
            }

            if outcome == RequestOutcome::Completed {
                if let Some(latency) = record.latency_ns() {
                    self.latency.record_ns(latency);
                }
                if let Some(ttft) = record.ttft_ns() {
                    self.ttft.record_ns(ttft);
                }
                for gap in record.token_gaps_ns() {
                    self.itl.record_ns(gap);
                }
                self.measured_prompt_tokens += record.prompt_tokens.unwrap_or(0);
                self.measured_output_tokens += record.output_tokens;
            }
        }

        if record.phase == Phase::Measured || self.retain_all {
            self.records.push(record);
        }
    }

    /// Terminal records seen so far, across phases.
    pub fn total_consumed(&self) -> u64 {
        self.phases.total()
    }

    /// Finalizes the run into its immutable report.
    pub fn finalize(mut self, meta: RunMeta) -> BenchmarkReport {
        // Report order is dispatch order regardless of completion order.
        self.records.sort_by_key(|r| r.sequence_index);

        let completed = self.phases.measured.completed;
        let window_s = match (self.window_start_ns, self.window_end_ns) {
            (Some(start), Some(end)) if end > start => Some((end - start) as f64 / 1e9),
            _ => None,
        };
        let request_rate_per_s = match (window_s, completed) {
            (Some(w), c) if c > 0 => Some(c as f64 / w),
            _ => None,
        };
        let output_token_rate_per_s = match (window_s, self.measured_output_tokens) {
            (Some(w), t) if t > 0 => Some(t as f64 / w),
            _ => None,
        };

        if self.nonterminal_dropped > 0 {
            error!(
                dropped = self.nonterminal_dropped,
                "Run finished with non-terminal records dropped"
            );
        }
        debug!(
            strategy = %meta.strategy,
            measured_completed = completed,
            total = self.phases.total(),
            "Finalizing benchmark report"
        );

        BenchmarkReport {
            schema_version: REPORT_SCHEMA_VERSION,
            strategy: meta.strategy,
            started_at: meta.started_at.to_rfc3339(),
            wall_duration_s: meta.wall_duration_s,
            stop_reason: meta.stop_reason,
            config: meta.config,
            statistics_defined: completed > 0,
            latency: self.latency.summarize(),
            ttft: self.ttft.summarize(),
            itl: self.itl.summarize(),
            request_rate_per_s,
            output_token_rate_per_s,
            measured_prompt_tokens: self.measured_prompt_tokens,
            measured_output_tokens: self.measured_output_tokens,
            error_breakdown: self.error_breakdown,
            phases: self.phases,
            records: self.records,
        }
    }
}

/// Assembles the suite wrapper around a set of finalized reports.
pub fn assemble_suite(
    started_at: DateTime<Utc>,
    sweep: Option<crate::report::SweepProvenance>,
    reports: Vec<BenchmarkReport>,
) -> BenchmarkSuite {
    BenchmarkSuite {
        schema_version: REPORT_SCHEMA_VERSION,
        started_at: started_at.to_rfc3339(),
        sweep,
        reports,
    }
}
