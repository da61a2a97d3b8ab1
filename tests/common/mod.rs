//! Shared test harness: a deterministic in-process backend and helpers to
//! drive full benchmark runs under tokio's paused clock.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_stream::stream;
use async_trait::async_trait;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;

use inferbench::backend::{Backend, EventStream, StreamEvent};
use inferbench::benchmarker::Benchmarker;
use inferbench::clock::Clock;
use inferbench::config::BenchmarkConfig;
use inferbench::errors::{BenchError, RequestErrorKind};
use inferbench::report::{BenchmarkReport, BenchmarkSuite};
use inferbench::request::{RequestPayload, RequestRecord};
use inferbench::source::build_source;

/// Deterministic backend: fixed time to first byte, then an optional token
/// stream at a fixed cadence. Optionally fails every Nth request with an
/// HTTP-status error after the same latency.
pub struct MockBackend {
    clock: Clock,
    first_byte_after: Duration,
    tokens: u64,
    token_interval: Duration,
    fail_every: Option<u64>,
    issued: AtomicU64,
}

impl MockBackend {
    /// Non-streaming backend answering after `latency`.
    pub fn fixed_latency(clock: Clock, latency: Duration) -> Self {
        Self {
            clock,
            first_byte_after: latency,
            tokens: 0,
            token_interval: Duration::ZERO,
            fail_every: None,
            issued: AtomicU64::new(0),
        }
    }

    /// Streaming backend yielding `tokens` tokens, one per `interval`; the
    /// first byte arrives immediately and the first token after one
    /// interval.
    pub fn streaming(clock: Clock, tokens: u64, interval: Duration) -> Self {
        Self {
            clock,
            first_byte_after: Duration::ZERO,
            tokens,
            token_interval: interval,
            fail_every: None,
            issued: AtomicU64::new(0),
        }
    }

    /// Every `n`-th issued request fails with an HTTP-status error.
    pub fn fail_every(mut self, n: u64) -> Self {
        self.fail_every = Some(n);
        self
    }
}

#[async_trait]
impl Backend for MockBackend {
    async fn probe(&self) -> Result<(), BenchError> {
        Ok(())
    }

    fn execute(&self, payload: RequestPayload, _deadline_ns: u64) -> EventStream {
        let clock = self.clock;
        let first_byte_after = self.first_byte_after;
        let tokens = self.tokens;
        let token_interval = self.token_interval;
        let issued = self.issued.fetch_add(1, Ordering::Relaxed) + 1;
        let fail = self.fail_every.is_some_and(|n| issued % n == 0);
        let prompt_tokens = payload.prompt_tokens_hint;

        Box::pin(stream! {
            tokio::time::sleep(first_byte_after).await;
            if fail {
                yield StreamEvent::Error {
                    at_ns: clock.now_ns(),
                    kind: RequestErrorKind::HttpStatus,
                    message: "HTTP 500: injected failure".to_string(),
                };
                return;
            }
            yield StreamEvent::FirstByte { at_ns: clock.now_ns() };
            for _ in 0..tokens {
                tokio::time::sleep(token_interval).await;
                yield StreamEvent::Token {
                    at_ns: clock.now_ns(),
                    text: "tok".to_string(),
                    token_delta: 1,
                };
            }
            yield StreamEvent::Done {
                at_ns: clock.now_ns(),
                prompt_tokens,
                output_tokens: None,
            };
        })
    }
}

/// Parses and validates a YAML config for a test run.
pub fn test_config(yaml: &str) -> BenchmarkConfig {
    let config: BenchmarkConfig = serde_yaml::from_str(yaml).expect("test config must parse");
    config.validate().expect("test config must validate");
    config
}

/// Runs a full benchmark against the given backend and returns the suite.
pub async fn run_suite(
    config: BenchmarkConfig,
    backend: Arc<dyn Backend>,
    clock: Clock,
    cancel: CancellationToken,
) -> BenchmarkSuite {
    let source = build_source(
        &config.data,
        config.endpoint,
        config.sample_order,
        config.random_seed,
    )
    .expect("source must build");
    Benchmarker::new(config, backend, source, clock, cancel)
        .run()
        .await
        .expect("benchmark must run")
}

/// Convenience wrapper for single-run configurations.
pub async fn run_single(config: BenchmarkConfig, backend: Arc<dyn Backend>) -> BenchmarkReport {
    let clock = Clock::start();
    let mut suite = run_suite(config, backend, clock, CancellationToken::new()).await;
    assert_eq!(suite.reports.len(), 1, "expected a single run");
    suite.reports.remove(0)
}

/// Maximum number of records simultaneously between actual dispatch and
/// completion, from the retained records.
pub fn peak_in_flight(records: &[RequestRecord]) -> usize {
    let mut edges: Vec<(u64, i64)> = Vec::new();
    for record in records {
        if let (Some(start), Some(end)) = (record.actual_dispatch, record.completion) {
            edges.push((start, 1));
            edges.push((end, -1));
        }
    }
    // Completions at the same instant as a dispatch count as finished first.
    edges.sort_by_key(|(t, delta)| (*t, *delta));
    let mut live = 0i64;
    let mut peak = 0i64;
    for (_, delta) in edges {
        live += delta;
        peak = peak.max(live);
    }
    peak as usize
}
