//! Run lifecycle: one benchmark per strategy, a sweep being several.
//!
//! The benchmarker probes the backend once, then executes each run with a
//! fresh scheduler, worker pool and aggregator over the shared clock and the
//! reset request source. A sweep runs synchronous and throughput first,
//! derives constant rates from their achieved request rates, and runs each
//! derived rate as its own benchmark.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::aggregator::{assemble_suite, Aggregator, RunMeta};
use crate::backend::Backend;
use crate::clock::Clock;
use crate::config::{BenchmarkConfig, RateType};
use crate::errors::BenchError;
use crate::progress::spawn_progress_reporter;
use crate::report::{BenchmarkReport, BenchmarkSuite, SweepProvenance};
use crate::scheduler::{Scheduler, SchedulerLimits};
use crate::source::RequestSource;
use crate::strategy::RateStrategy;
use crate::worker::WorkerPool;

/// Geometrically spaced rates strictly between `lo` and `hi`.
///
/// With `count = 3` between 2 and 16 this yields 2·2, 2·4, 2·8: even
/// multiplicative steps, which suit throughput ranges spanning an order of
/// magnitude better than linear spacing.
pub fn interior_rates(lo: f64, hi: f64, count: usize) -> Vec<f64> {
    if count == 0 || lo <= 0.0 || hi <= lo {
        return Vec::new();
    }
    let ratio = hi / lo;
    (1..=count)
        .map(|i| lo * ratio.powf(i as f64 / (count + 1) as f64))
        .collect()
}

pub struct Benchmarker {
    config: BenchmarkConfig,
    backend: Arc<dyn Backend>,
    source: Option<Box<dyn RequestSource>>,
    clock: Clock,
    cancel: CancellationToken,
}

impl Benchmarker {
    pub fn new(
        config: BenchmarkConfig,
        backend: Arc<dyn Backend>,
        source: Box<dyn RequestSource>,
        clock: Clock,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            backend,
            source: Some(source),
            clock,
            cancel,
        }
    }

    /// Probes the backend, executes every planned run, and assembles the
    /// suite. Cancellation between runs stops the plan early with the
    /// reports collected so far.
    pub async fn run(mut self) -> Result<BenchmarkSuite, BenchError> {
        self.backend.probe().await?;
        let started_at = Utc::now();
        let seed = self.config.random_seed;

        let mut reports: Vec<BenchmarkReport> = Vec::new();
        let mut sweep: Option<SweepProvenance> = None;

        match self.config.rate_type {
            RateType::Sweep => {
                let sync_report = self
                    .run_once(RateStrategy::new(RateType::Synchronous, None, seed)?)
                    .await?;
                let sync_rate = sync_report.request_rate_per_s;
                reports.push(sync_report);

                if !self.cancel.is_cancelled() {
                    let throughput_report = self
                        .run_once(RateStrategy::new(RateType::Throughput, None, seed)?)
                        .await?;
                    let throughput_rate = throughput_report.request_rate_per_s;
                    reports.push(throughput_report);

                    let rates = match &self.config.sweep_rates {
                        Some(rates) => rates.clone(),
                        None => {
                            let lo = sync_rate.ok_or_else(|| {
                                BenchError::Internal(
                                    "sweep needs an achieved synchronous rate; the run completed no requests"
                                        .to_string(),
                                )
                            })?;
                            let hi = throughput_rate.ok_or_else(|| {
                                BenchError::Internal(
                                    "sweep needs an achieved throughput rate; the run completed no requests"
                                        .to_string(),
                                )
                            })?;
                            let rates = interior_rates(lo, hi, self.config.sweep_steps - 2);
                            if rates.is_empty() {
                                warn!(
                                    lo = lo,
                                    hi = hi,
                                    "Sweep extremes leave no interior rates"
                                );
                            }
                            rates
                        }
                    };
                    sweep = Some(SweepProvenance {
                        synchronous_rate_per_s: sync_rate.unwrap_or(0.0),
                        throughput_rate_per_s: throughput_rate.unwrap_or(0.0),
                        constant_rates: rates.clone(),
                    });

                    for rate in rates {
                        if self.cancel.is_cancelled() {
                            warn!("Sweep stopped early by cancellation");
                            break;
                        }
                        let report = self
                            .run_once(RateStrategy::new(RateType::Constant, Some(rate), seed)?)
                            .await?;
                        reports.push(report);
                    }
                }
            }
            rate_type => {
                let strategy = RateStrategy::new(rate_type, self.config.rate, seed)?;
                reports.push(self.run_once(strategy).await?);
            }
        }

        Ok(assemble_suite(started_at, sweep, reports))
    }

    /// Executes one benchmark run: fresh scheduler, pool and aggregator over
    /// the reset source.
    async fn run_once(&mut self, strategy: RateStrategy) -> Result<BenchmarkReport, BenchError> {
        let label = strategy.label();
        info!(strategy = %label, "Starting benchmark run");

        let run_started_wall = Utc::now();
        let run_started_ns = self.clock.now_ns();

        let mut source = self
            .source
            .take()
            .ok_or_else(|| BenchError::Internal("request source is missing".to_string()))?;
        source.reset();

        let workers_cancel = self.cancel.child_token();
        let (completions_tx, completions_rx) = mpsc::unbounded_channel();
        let (aggregator_tx, aggregator_rx) = mpsc::unbounded_channel();

        let aggregator = Aggregator::new(
            self.config.retain_all_records,
            self.config.max_exact_samples,
        );
        let aggregator_task = tokio::spawn(aggregator.run(aggregator_rx));

        let pool = WorkerPool::new(
            self.backend.clone(),
            self.clock,
            self.config.max_concurrency,
            self.config.request_timeout_duration().as_nanos() as u64,
            workers_cancel.clone(),
            completions_tx,
        );
        let scheduler = Scheduler::new(
            SchedulerLimits::from_config(&self.config),
            self.clock,
            strategy,
            source,
            pool,
            completions_rx,
            aggregator_tx,
            self.cancel.clone(),
            workers_cancel,
        );

        let progress = spawn_progress_reporter(label.clone(), self.config.progress_interval_duration());
        let outcome = scheduler.run().await;
        progress.abort();

        let (summary, source) = outcome?;
        self.source = Some(source);

        // The scheduler dropped its aggregator sender; the task finishes
        // with whatever arrived.
        let aggregator = aggregator_task
            .await
            .map_err(|e| BenchError::Internal(format!("aggregator task failed: {}", e)))?;

        if summary.leaked_in_flight > 0 {
            // The report is still emitted, with the leak already logged; a
            // leak means a worker died without delivering its record.
            error!(
                leaked = summary.leaked_in_flight,
                strategy = %label,
                "Run finished with leaked in-flight records; report is partial"
            );
        }

        let report = aggregator.finalize(RunMeta {
            strategy: label.clone(),
            started_at: run_started_wall,
            wall_duration_s: (self.clock.now_ns() - run_started_ns) as f64 / 1e9,
            stop_reason: summary.stop_reason.label().to_string(),
            config: self.config.snapshot(),
        });
        info!(
            strategy = %label,
            dispatched = summary.dispatched,
            completed = report.phases.measured.completed,
            rate_per_s = report.request_rate_per_s.unwrap_or(0.0),
            "Benchmark run finished"
        );
        Ok(report)
    }
}
