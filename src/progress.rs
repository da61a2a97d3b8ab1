//! Periodic progress reporting during a run.
//!
//! Reads the Prometheus counters the scheduler and workers already maintain,
//! so progress lines always agree with the scrape endpoint. One reporter
//! task per run; the benchmarker aborts it when the run finishes.

use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};
use tracing::info;

use crate::metrics::{IN_FLIGHT_REQUESTS, REQUESTS_COMPLETED_TOTAL, REQUESTS_DISPATCHED_TOTAL};

/// Counter values at run start. The global counters are monotonic across
/// runs, so progress is computed from deltas against this baseline.
#[derive(Debug, Clone, Copy)]
struct Baseline {
    dispatched: u64,
    completed: u64,
    errored: u64,
    cancelled: u64,
    timeout: u64,
}

fn snapshot() -> Baseline {
    Baseline {
        dispatched: REQUESTS_DISPATCHED_TOTAL.get(),
        completed: REQUESTS_COMPLETED_TOTAL.with_label_values(&["completed"]).get(),
        errored: REQUESTS_COMPLETED_TOTAL.with_label_values(&["error"]).get(),
        cancelled: REQUESTS_COMPLETED_TOTAL.with_label_values(&["cancelled"]).get(),
        timeout: REQUESTS_COMPLETED_TOTAL.with_label_values(&["timeout"]).get(),
    }
}

/// Spawns a task that logs one progress line per interval until aborted.
pub fn spawn_progress_reporter(strategy: String, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let baseline = snapshot();
        let started = Instant::now();
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ticker.tick().await; // first tick is immediate

        loop {
            ticker.tick().await;
            let now = snapshot();
            let elapsed = started.elapsed().as_secs_f64();
            let completed = now.completed - baseline.completed;
            let rate = if elapsed > 0.0 {
                completed as f64 / elapsed
            } else {
                0.0
            };
            info!(
                strategy = %strategy,
                elapsed_s = format_args!("{:.1}", elapsed),
                in_flight = IN_FLIGHT_REQUESTS.get() as i64,
                dispatched = now.dispatched - baseline.dispatched,
                completed = completed,
                errored = now.errored - baseline.errored,
                cancelled = now.cancelled - baseline.cancelled,
                timeout = now.timeout - baseline.timeout,
                rate_per_s = format_args!("{:.2}", rate),
                "Benchmark progress"
            );
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn reporter_runs_until_aborted() {
        let handle = spawn_progress_reporter("synchronous".into(), Duration::from_secs(1));
        tokio::time::sleep(Duration::from_secs(3)).await;
        handle.abort();
        assert!(handle.await.unwrap_err().is_cancelled());
    }
}
