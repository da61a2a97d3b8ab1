//! Rate strategies: when the next request may be dispatched.
//!
//! Strategies are a closed enum with a small dispatch surface (`next_dispatch`,
//! `on_dispatch`, `on_completion`); adding a strategy touches this file only.
//! A strategy never sees warmup/cooldown phases and never observes worker-pool
//! backpressure; it only shapes the targeted dispatch times. The sweep
//! meta-strategy is expanded into a run list by the benchmarker and never
//! reaches this type.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::RateType;
use crate::errors::BenchError;
use crate::request::RequestRecord;

/// What the scheduler should do before the next dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Dispatch at the given epoch offset; a time in the past means
    /// dispatch immediately, one per loop iteration, without batching.
    At(u64),
    /// Dispatch now.
    Immediate,
    /// Hold until a completion frees a slot.
    AwaitCompletion,
}

/// Stateful dispatch-time policy.
#[derive(Debug)]
pub enum RateStrategy {
    /// One request at a time; each completion releases the next.
    Synchronous { busy: bool },

    /// As fast as the source and worker pool accept.
    Throughput,

    /// Exactly `limit` requests in flight.
    Concurrent { limit: u64, in_flight: u64 },

    /// Fixed schedule `t_k = t_0 + k/rate`, never adjusted for overrun; when
    /// dispatch falls behind it catches up one request per loop iteration.
    Constant {
        rate: f64,
        start_ns: Option<u64>,
        dispatched: u64,
    },

    /// Exponentially distributed inter-dispatch gaps from a seeded RNG, so a
    /// given seed always produces the same targeted schedule.
    Poisson {
        rate: f64,
        rng: StdRng,
        next_ns: Option<u64>,
    },
}

impl RateStrategy {
    /// Builds the strategy for a single run. `Sweep` is rejected here: the
    /// benchmarker expands it into a sequence of concrete strategies first.
    pub fn new(rate_type: RateType, rate: Option<f64>, seed: u64) -> Result<Self, BenchError> {
        let need_rate = || {
            rate.ok_or_else(|| {
                BenchError::ConfigInvalid(format!(
                    "rate_type '{}' requires a rate",
                    rate_type.label()
                ))
            })
        };
        match rate_type {
            RateType::Synchronous => Ok(RateStrategy::Synchronous { busy: false }),
            RateType::Throughput => Ok(RateStrategy::Throughput),
            RateType::Concurrent => Ok(RateStrategy::Concurrent {
                limit: need_rate()? as u64,
                in_flight: 0,
            }),
            RateType::Constant => Ok(RateStrategy::Constant {
                rate: need_rate()?,
                start_ns: None,
                dispatched: 0,
            }),
            RateType::Poisson => Ok(RateStrategy::Poisson {
                rate: need_rate()?,
                rng: StdRng::seed_from_u64(seed),
                next_ns: None,
            }),
            RateType::Sweep => Err(BenchError::Internal(
                "sweep must be expanded before a scheduler is built".to_string(),
            )),
        }
    }

    /// Human-readable label for logs and reports, e.g. `constant(20)`.
    pub fn label(&self) -> String {
        match self {
            RateStrategy::Synchronous { .. } => "synchronous".to_string(),
            RateStrategy::Throughput => "throughput".to_string(),
            RateStrategy::Concurrent { limit, .. } => format!("concurrent({})", limit),
            RateStrategy::Constant { rate, .. } => format!("constant({})", rate),
            RateStrategy::Poisson { rate, .. } => format!("poisson({})", rate),
        }
    }

    /// Consulted once per dispatch-loop iteration. The first call anchors
    /// time-based schedules at `now_ns`.
    pub fn next_dispatch(&mut self, now_ns: u64) -> Decision {
        match self {
            RateStrategy::Synchronous { busy } => {
                if *busy {
                    Decision::AwaitCompletion
                } else {
                    Decision::Immediate
                }
            }
            RateStrategy::Throughput => Decision::Immediate,
            RateStrategy::Concurrent { limit, in_flight } => {
                if *in_flight < *limit {
                    Decision::Immediate
                } else {
                    Decision::AwaitCompletion
                }
            }
            RateStrategy::Constant {
                rate,
                start_ns,
                dispatched,
            } => {
                let start = *start_ns.get_or_insert(now_ns);
                let offset = (*dispatched as f64 * 1_000_000_000.0 / *rate).round() as u64;
                Decision::At(start + offset)
            }
            RateStrategy::Poisson { next_ns, .. } => Decision::At(*next_ns.get_or_insert(now_ns)),
        }
    }

    /// Called exactly once per dispatched request, after the decision above
    /// resolved into an actual dispatch.
    pub fn on_dispatch(&mut self, _now_ns: u64) {
        match self {
            RateStrategy::Synchronous { busy } => *busy = true,
            RateStrategy::Throughput => {}
            RateStrategy::Concurrent { in_flight, .. } => *in_flight += 1,
            RateStrategy::Constant { dispatched, .. } => *dispatched += 1,
            RateStrategy::Poisson { rate, rng, next_ns } => {
                let current = next_ns.expect("on_dispatch follows next_dispatch");
                *next_ns = Some(current + exponential_interval_ns(rng, *rate));
            }
        }
    }

    /// Called for every terminal record; releases slots for the
    /// completion-bounded strategies.
    pub fn on_completion(&mut self, _record: &RequestRecord) {
        match self {
            RateStrategy::Synchronous { busy } => *busy = false,
            RateStrategy::Concurrent { in_flight, .. } => {
                *in_flight = in_flight.saturating_sub(1);
            }
            _ => {}
        }
    }
}

/// Draws one Exp(rate) inter-arrival gap in nanoseconds.
fn exponential_interval_ns(rng: &mut StdRng, rate: f64) -> u64 {
    let u: f64 = rng.gen();
    // 1 - u is in (0, 1], keeping ln() finite.
    ((-(1.0 - u).ln()) / rate * 1_000_000_000.0) as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{Phase, RequestRecord};

    fn record() -> RequestRecord {
        RequestRecord::new(0, Phase::Measured, 0)
    }

    #[test]
    fn synchronous_holds_until_completion() {
        let mut s = RateStrategy::new(RateType::Synchronous, None, 0).unwrap();
        assert_eq!(s.next_dispatch(0), Decision::Immediate);
        s.on_dispatch(0);
        assert_eq!(s.next_dispatch(10), Decision::AwaitCompletion);
        s.on_completion(&record());
        assert_eq!(s.next_dispatch(20), Decision::Immediate);
    }

    #[test]
    fn concurrent_keeps_exactly_n_slots() {
        let mut s = RateStrategy::new(RateType::Concurrent, Some(3.0), 0).unwrap();
        for _ in 0..3 {
            assert_eq!(s.next_dispatch(0), Decision::Immediate);
            s.on_dispatch(0);
        }
        assert_eq!(s.next_dispatch(0), Decision::AwaitCompletion);
        s.on_completion(&record());
        assert_eq!(s.next_dispatch(0), Decision::Immediate);
    }

    #[test]
    fn throughput_is_always_immediate() {
        let mut s = RateStrategy::new(RateType::Throughput, None, 0).unwrap();
        for _ in 0..100 {
            assert_eq!(s.next_dispatch(5), Decision::Immediate);
            s.on_dispatch(5);
        }
    }

    #[test]
    fn constant_schedule_is_exact_and_anchored_at_first_call() {
        let mut s = RateStrategy::new(RateType::Constant, Some(20.0), 0).unwrap();
        let anchor = 1_000_000;
        for k in 0..50u64 {
            match s.next_dispatch(anchor) {
                Decision::At(t) => assert_eq!(t, anchor + k * 50_000_000),
                other => panic!("expected At, got {:?}", other),
            }
            s.on_dispatch(anchor);
        }
    }

    #[test]
    fn constant_schedule_ignores_overrun() {
        let mut s = RateStrategy::new(RateType::Constant, Some(10.0), 0).unwrap();
        assert_eq!(s.next_dispatch(0), Decision::At(0));
        s.on_dispatch(0);
        // Even when consulted far behind schedule, the target stays k/rate.
        assert_eq!(s.next_dispatch(5_000_000_000), Decision::At(100_000_000));
    }

    #[test]
    fn poisson_schedule_replays_for_a_fixed_seed() {
        let mut a = RateStrategy::new(RateType::Poisson, Some(50.0), 42).unwrap();
        let mut b = RateStrategy::new(RateType::Poisson, Some(50.0), 42).unwrap();
        let targets = |s: &mut RateStrategy| -> Vec<u64> {
            (0..200)
                .map(|_| {
                    let t = match s.next_dispatch(0) {
                        Decision::At(t) => t,
                        other => panic!("expected At, got {:?}", other),
                    };
                    s.on_dispatch(0);
                    t
                })
                .collect()
        };
        assert_eq!(targets(&mut a), targets(&mut b));
    }

    #[test]
    fn poisson_intervals_match_the_requested_rate() {
        let mut s = RateStrategy::new(RateType::Poisson, Some(50.0), 42).unwrap();
        let mut previous = 0u64;
        let mut total_ns = 0u64;
        let n = 2_000;
        for _ in 0..n {
            let t = match s.next_dispatch(0) {
                Decision::At(t) => t,
                other => panic!("expected At, got {:?}", other),
            };
            s.on_dispatch(0);
            total_ns += t - previous;
            previous = t;
        }
        let mean_s = total_ns as f64 / n as f64 / 1e9;
        // Exp(50) has mean 20ms; 2000 samples keep the estimate within ~10%.
        assert!(
            (mean_s - 0.02).abs() < 0.002,
            "mean interval {}s should be near 0.02s",
            mean_s
        );
    }

    #[test]
    fn different_seeds_differ() {
        let mut a = RateStrategy::new(RateType::Poisson, Some(50.0), 1).unwrap();
        let mut b = RateStrategy::new(RateType::Poisson, Some(50.0), 2).unwrap();
        a.next_dispatch(0);
        a.on_dispatch(0);
        b.next_dispatch(0);
        b.on_dispatch(0);
        let t_a = match a.next_dispatch(0) {
            Decision::At(t) => t,
            _ => unreachable!(),
        };
        let t_b = match b.next_dispatch(0) {
            Decision::At(t) => t,
            _ => unreachable!(),
        };
        assert_ne!(t_a, t_b);
    }

    #[test]
    fn sweep_cannot_be_instantiated_directly() {
        assert!(RateStrategy::new(RateType::Sweep, None, 0).is_err());
    }
}
