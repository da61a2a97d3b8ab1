//! Dispatch loop: strategy-paced release of requests into the worker pool.
//!
//! The scheduler runs in one logical task. It owns the rate strategy, the
//! request source, the in-flight table and the sequence counter; workers
//! feed terminal records back over a message channel and the scheduler
//! applies them to the strategy single-threadedly before forwarding each
//! record to the aggregator. Warmup/cooldown tagging, termination limits and
//! the drain protocol all live here.

use std::collections::HashSet;

use tokio::sync::mpsc;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::config::{BenchmarkConfig, PhaseBounds};
use crate::errors::BenchError;
use crate::metrics::REQUESTS_DISPATCHED_TOTAL;
use crate::request::{DispatchTicket, Phase, RequestRecord};
use crate::source::RequestSource;
use crate::strategy::{Decision, RateStrategy};
use crate::worker::WorkerPool;

/// Termination and phase limits for one run.
#[derive(Debug, Clone, Copy, Default)]
pub struct SchedulerLimits {
    pub max_requests: Option<u64>,
    pub max_duration_ns: Option<u64>,
    pub warmup: PhaseBounds,
    pub cooldown: PhaseBounds,
    pub drain_timeout_ns: u64,
}

impl SchedulerLimits {
    pub fn from_config(config: &BenchmarkConfig) -> Self {
        Self {
            max_requests: config.max_requests,
            max_duration_ns: config.max_duration().map(|d| d.as_nanos() as u64),
            warmup: config.warmup_bounds(),
            cooldown: config.cooldown_bounds(),
            drain_timeout_ns: config.drain_timeout_duration().as_nanos() as u64,
        }
    }
}

/// Why the scheduler stopped issuing dispatches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    MaxRequests,
    MaxDuration,
    SourceExhausted,
    Cancelled,
}

impl StopReason {
    pub fn label(&self) -> &'static str {
        match self {
            StopReason::MaxRequests => "max_requests",
            StopReason::MaxDuration => "max_duration",
            StopReason::SourceExhausted => "source_exhausted",
            StopReason::Cancelled => "cancelled",
        }
    }
}

/// Final accounting of one dispatch loop.
#[derive(Debug, Clone, Copy)]
pub struct SchedulerSummary {
    pub stop_reason: StopReason,
    pub dispatched: u64,
    pub completed: u64,
    /// Records still unaccounted for after the drain; zero on a clean run.
    pub leaked_in_flight: usize,
}

/// Per-run accumulator owned by the scheduler.
#[derive(Debug, Default)]
struct BenchmarkState {
    started_ns: u64,
    next_sequence: u64,
    in_flight: HashSet<u64>,
    completed: u64,
    last_dispatch_ns: Option<u64>,
}

/// Classifies a dispatch into its phase. Either bound (count or wall time)
/// puts a ticket into warmup; either trailing bound puts it into cooldown.
/// Trailing bounds need the matching cap to anchor against.
fn classify_phase(
    limits: &SchedulerLimits,
    started_ns: u64,
    now_ns: u64,
    sequence_index: u64,
) -> Phase {
    let elapsed = now_ns.saturating_sub(started_ns);
    if limits.warmup.requests.is_some_and(|r| sequence_index < r)
        || limits.warmup.duration_ns.is_some_and(|d| elapsed < d)
    {
        return Phase::Warmup;
    }
    if let (Some(count), Some(max)) = (limits.cooldown.requests, limits.max_requests) {
        if sequence_index >= max.saturating_sub(count) {
            return Phase::Cooldown;
        }
    }
    if let (Some(window), Some(max_ns)) = (limits.cooldown.duration_ns, limits.max_duration_ns) {
        if elapsed >= max_ns.saturating_sub(window) {
            return Phase::Cooldown;
        }
    }
    Phase::Measured
}

/// Sleeps until an optional epoch offset; pends forever when absent.
async fn sleep_until_opt(clock: Clock, deadline_ns: Option<u64>) {
    match deadline_ns {
        Some(t) => clock.sleep_until(t).await,
        None => std::future::pending().await,
    }
}

pub struct Scheduler {
    limits: SchedulerLimits,
    clock: Clock,
    strategy: RateStrategy,
    source: Box<dyn RequestSource>,
    pool: WorkerPool,
    completions: mpsc::UnboundedReceiver<RequestRecord>,
    aggregator: mpsc::UnboundedSender<RequestRecord>,
    cancel: CancellationToken,
    workers_cancel: CancellationToken,
    state: BenchmarkState,
}

impl Scheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        limits: SchedulerLimits,
        clock: Clock,
        strategy: RateStrategy,
        source: Box<dyn RequestSource>,
        pool: WorkerPool,
        completions: mpsc::UnboundedReceiver<RequestRecord>,
        aggregator: mpsc::UnboundedSender<RequestRecord>,
        cancel: CancellationToken,
        workers_cancel: CancellationToken,
    ) -> Self {
        Self {
            limits,
            clock,
            strategy,
            source,
            pool,
            completions,
            aggregator,
            cancel,
            workers_cancel,
            state: BenchmarkState::default(),
        }
    }

    /// Runs the dispatch loop to completion, drains, and returns the source
    /// for reuse by the next run of a sweep.
    pub async fn run(mut self) -> Result<(SchedulerSummary, Box<dyn RequestSource>), BenchError> {
        self.state.started_ns = self.clock.now_ns();
        info!(strategy = %self.strategy.label(), "Dispatch loop starting");

        let stop_reason = loop {
            let now = self.clock.now_ns();
            if let Some(reason) = self.check_limits(now) {
                break reason;
            }

            let targeted = match self.strategy.next_dispatch(now) {
                Decision::Immediate => now,
                Decision::At(t) => {
                    if t > now && !self.wait_until(t).await {
                        // Interrupted by a completion, cancellation or the
                        // duration limit: re-evaluate from the top.
                        continue;
                    }
                    t
                }
                Decision::AwaitCompletion => {
                    self.wait_for_completion().await;
                    continue;
                }
            };

            // The wait may have ended exactly at a limit boundary; never
            // dispatch past it.
            if self.check_limits(self.clock.now_ns()).is_some() {
                continue;
            }

            let Some(payload) = self.source.next() else {
                break StopReason::SourceExhausted;
            };
            self.dispatch_one(payload, targeted).await;
        };

        self.drain(stop_reason).await;

        let leaked = self.state.in_flight.len();
        if leaked > 0 {
            error!(
                leaked = leaked,
                "In-flight records unaccounted for after drain"
            );
        }
        let summary = SchedulerSummary {
            stop_reason,
            dispatched: self.state.next_sequence,
            completed: self.state.completed,
            leaked_in_flight: leaked,
        };
        info!(
            reason = stop_reason.label(),
            dispatched = summary.dispatched,
            completed = summary.completed,
            "Dispatch loop finished"
        );
        Ok((summary, self.source))
    }

    fn check_limits(&self, now_ns: u64) -> Option<StopReason> {
        if self.cancel.is_cancelled() {
            return Some(StopReason::Cancelled);
        }
        if let Some(max) = self.limits.max_requests {
            if self.state.next_sequence >= max {
                return Some(StopReason::MaxRequests);
            }
        }
        if let Some(max_ns) = self.limits.max_duration_ns {
            if now_ns.saturating_sub(self.state.started_ns) >= max_ns {
                return Some(StopReason::MaxDuration);
            }
        }
        None
    }

    fn duration_deadline(&self) -> Option<u64> {
        self.limits
            .max_duration_ns
            .map(|max| self.state.started_ns + max)
    }

    /// Waits for the targeted dispatch time. Returns true when the target
    /// was reached, false when interrupted.
    async fn wait_until(&mut self, target_ns: u64) -> bool {
        let clock = self.clock;
        let deadline = self.duration_deadline();
        let interrupted_by = tokio::select! {
            _ = clock.sleep_until(target_ns) => return true,
            record = self.completions.recv() => record,
            _ = self.cancel.cancelled() => None,
            _ = sleep_until_opt(clock, deadline) => None,
        };
        if let Some(record) = interrupted_by {
            self.handle_completion(record);
        }
        false
    }

    /// Waits for one completion to free a strategy slot.
    async fn wait_for_completion(&mut self) {
        let clock = self.clock;
        let deadline = self.duration_deadline();
        let received = tokio::select! {
            record = self.completions.recv() => record,
            _ = self.cancel.cancelled() => None,
            _ = sleep_until_opt(clock, deadline) => None,
        };
        if let Some(record) = received {
            self.handle_completion(record);
        }
    }

    async fn dispatch_one(&mut self, payload: crate::request::RequestPayload, targeted_ns: u64) {
        let now = self.clock.now_ns();
        let sequence_index = self.state.next_sequence;
        let phase = classify_phase(&self.limits, self.state.started_ns, now, sequence_index);

        let record = RequestRecord::new(sequence_index, phase, targeted_ns);
        let ticket = DispatchTicket {
            payload,
            sequence_index,
            targeted_dispatch_ns: targeted_ns,
            phase,
        };

        self.state.next_sequence += 1;
        self.state.in_flight.insert(sequence_index);
        self.state.last_dispatch_ns = Some(now);
        self.strategy.on_dispatch(now);
        REQUESTS_DISPATCHED_TOTAL.inc();
        debug!(
            sequence_index,
            phase = phase.label(),
            targeted_ns,
            "Dispatching request"
        );

        // Blocks at the pool's parallelism cap; queued completions are
        // applied on the next loop iteration.
        self.pool.dispatch(ticket, record).await;
    }

    fn handle_completion(&mut self, record: RequestRecord) {
        if !self.state.in_flight.remove(&record.sequence_index) {
            warn!(
                sequence_index = record.sequence_index,
                "Completion for a request not in the in-flight table"
            );
        }
        self.state.completed += 1;
        self.strategy.on_completion(&record);
        if self.aggregator.send(record).is_err() {
            warn!("Aggregator channel closed; dropping record");
        }
    }

    /// Ceases dispatch and awaits outstanding records up to the drain
    /// timeout; whatever is still in flight then gets cancelled and awaited.
    async fn drain(&mut self, reason: StopReason) {
        info!(
            reason = reason.label(),
            in_flight = self.state.in_flight.len(),
            last_dispatch_ns = self.state.last_dispatch_ns,
            "Dispatch stopped, draining"
        );
        if reason == StopReason::Cancelled {
            self.workers_cancel.cancel();
        }

        enum DrainEvent {
            Record(Option<RequestRecord>),
            RunCancelled,
            TimedOut,
        }

        let clock = self.clock;
        let deadline_ns = clock.now_ns() + self.limits.drain_timeout_ns;
        while !self.state.in_flight.is_empty() {
            let workers_already_cancelled = self.workers_cancel.is_cancelled();
            let event = tokio::select! {
                record = self.completions.recv() => DrainEvent::Record(record),
                _ = self.cancel.cancelled(), if !workers_already_cancelled => DrainEvent::RunCancelled,
                _ = clock.sleep_until(deadline_ns) => DrainEvent::TimedOut,
            };
            match event {
                DrainEvent::Record(Some(record)) => self.handle_completion(record),
                DrainEvent::Record(None) => break,
                DrainEvent::RunCancelled => self.workers_cancel.cancel(),
                DrainEvent::TimedOut => {
                    warn!(
                        remaining = self.state.in_flight.len(),
                        "Drain timeout expired, cancelling in-flight requests"
                    );
                    self.workers_cancel.cancel();
                    break;
                }
            }
        }

        // Cancelled workers still deliver a terminal record each; give them
        // a short grace period to do so.
        while !self.state.in_flight.is_empty() {
            let next = tokio::time::timeout(Duration::from_secs(5), self.completions.recv()).await;
            match next {
                Ok(Some(record)) => self.handle_completion(record),
                Ok(None) | Err(_) => {
                    error!(
                        remaining = self.state.in_flight.len(),
                        "Gave up waiting for cancelled workers"
                    );
                    break;
                }
            }
        }
    }
}
