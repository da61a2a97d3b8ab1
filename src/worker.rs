//! Worker pool: parallel request executors.
//!
//! The pool accepts dispatch tickets from the scheduler and drives the
//! backend adapter for each, streaming events into the ticket's record. A
//! semaphore caps parallelism; acquiring a permit inside `dispatch` is the
//! scheduler's only backpressure path. Workers communicate exclusively by
//! sending the finished record back over the completion channel; they never
//! touch scheduler state.

use std::sync::Arc;

use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::backend::Backend;
use crate::clock::Clock;
use crate::errors::RequestErrorKind;
use crate::metrics::{IN_FLIGHT_REQUESTS, OUTPUT_TOKENS_TOTAL, REQUESTS_COMPLETED_TOTAL};
use crate::request::{DispatchTicket, RequestOutcome, RequestRecord};

pub struct WorkerPool {
    backend: Arc<dyn Backend>,
    clock: Clock,
    semaphore: Arc<Semaphore>,
    completions: mpsc::UnboundedSender<RequestRecord>,
    cancel: CancellationToken,
    request_timeout_ns: u64,
}

impl WorkerPool {
    pub fn new(
        backend: Arc<dyn Backend>,
        clock: Clock,
        max_concurrency: usize,
        request_timeout_ns: u64,
        cancel: CancellationToken,
        completions: mpsc::UnboundedSender<RequestRecord>,
    ) -> Self {
        Self {
            backend,
            clock,
            semaphore: Arc::new(Semaphore::new(max_concurrency)),
            completions,
            cancel,
            request_timeout_ns,
        }
    }

    /// Hands one ticket to a worker. Blocks while the pool is at its
    /// parallelism cap; this is the only place the scheduler waits on the
    /// pool.
    pub async fn dispatch(&self, ticket: DispatchTicket, mut record: RequestRecord) {
        let permit = tokio::select! {
            permit = self.semaphore.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => {
                    record.finalize_cancelled(self.clock.now_ns());
                    self.send(record);
                    return;
                }
            },
            _ = self.cancel.cancelled() => {
                // Run-level cancellation while queued for a worker: the
                // request was never issued.
                record.finalize_cancelled(self.clock.now_ns());
                self.send(record);
                return;
            }
        };

        let backend = self.backend.clone();
        let clock = self.clock;
        let cancel = self.cancel.clone();
        let completions = self.completions.clone();
        // The deadline anchors at the targeted dispatch time, so a request
        // delayed by backpressure does not get extra budget.
        let deadline_ns = ticket.targeted_dispatch_ns + self.request_timeout_ns;

        tokio::spawn(async move {
            run_request(backend, clock, ticket, record, deadline_ns, cancel, &completions).await;
            drop(permit);
        });
    }

    fn send(&self, record: RequestRecord) {
        record_terminal_metrics(&record);
        if self.completions.send(record).is_err() {
            warn!("Completion channel closed before record hand-off");
        }
    }
}

/// Drives one request to its terminal outcome, filling the record.
async fn run_request(
    backend: Arc<dyn Backend>,
    clock: Clock,
    ticket: DispatchTicket,
    mut record: RequestRecord,
    deadline_ns: u64,
    cancel: CancellationToken,
    completions: &mpsc::UnboundedSender<RequestRecord>,
) {
    record.mark_dispatched(clock.now_ns());
    IN_FLIGHT_REQUESTS.inc();

    let mut events = backend.execute(ticket.payload, deadline_ns);
    let deadline_sleep = tokio::time::sleep_until(clock.instant_at(deadline_ns));
    tokio::pin!(deadline_sleep);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                record.finalize_cancelled(clock.now_ns());
                break;
            }
            _ = &mut deadline_sleep => {
                record.finalize_timeout(clock.now_ns());
                break;
            }
            event = futures_util::StreamExt::next(&mut events) => match event {
                Some(event) => {
                    let terminal = event.is_terminal();
                    record.apply_event(event);
                    if terminal {
                        break;
                    }
                }
                None => {
                    record.finalize_error(
                        RequestErrorKind::Decode,
                        "event stream ended without a terminal event",
                        clock.now_ns(),
                    );
                    break;
                }
            }
        }
    }
    // Dropping the stream aborts the adapter's request if it is still live.
    drop(events);

    IN_FLIGHT_REQUESTS.dec();
    record_terminal_metrics(&record);
    debug!(
        sequence_index = record.sequence_index,
        outcome = record.outcome.map(|o| o.label()).unwrap_or("none"),
        output_tokens = record.output_tokens,
        "Request finished"
    );
    if completions.send(record).is_err() {
        warn!("Completion channel closed before record hand-off");
    }
}

fn record_terminal_metrics(record: &RequestRecord) {
    let label = record.outcome.map(|o| o.label()).unwrap_or("none");
    REQUESTS_COMPLETED_TOTAL.with_label_values(&[label]).inc();
    if record.outcome == Some(RequestOutcome::Completed) {
        OUTPUT_TOKENS_TOTAL.inc_by(record.output_tokens);
    }
}
