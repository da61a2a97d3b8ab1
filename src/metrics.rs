//! Prometheus metrics for live benchmark observation.
//!
//! The counters are updated unconditionally by the scheduler and workers;
//! registration and the scrape endpoint are only wired up when a metrics
//! port is configured. The progress reporter reads these same counters.

use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response, Server};
use prometheus::{Encoder, Gauge, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};
use std::sync::{Arc, Mutex};
use tracing::{error, info};

const NAMESPACE: &str = "inferbench";

lazy_static::lazy_static! {
    pub static ref REQUESTS_DISPATCHED_TOTAL: IntCounter =
        IntCounter::with_opts(
            Opts::new("requests_dispatched_total", "Total number of requests handed to the worker pool")
                .namespace(NAMESPACE)
        ).unwrap();

    pub static ref REQUESTS_COMPLETED_TOTAL: IntCounterVec =
        IntCounterVec::new(
            Opts::new("requests_completed_total", "Terminal request records by outcome")
                .namespace(NAMESPACE),
            &["outcome"]
        ).unwrap();

    pub static ref IN_FLIGHT_REQUESTS: Gauge =
        Gauge::with_opts(
            Opts::new("in_flight_requests", "Requests currently being driven by a worker")
                .namespace(NAMESPACE)
        ).unwrap();

    pub static ref OUTPUT_TOKENS_TOTAL: IntCounter =
        IntCounter::with_opts(
            Opts::new("output_tokens_total", "Total streamed output tokens across all requests")
                .namespace(NAMESPACE)
        ).unwrap();
}

/// Registers all metrics with the default Prometheus registry.
pub fn register_metrics() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    prometheus::default_registry().register(Box::new(REQUESTS_DISPATCHED_TOTAL.clone()))?;
    prometheus::default_registry().register(Box::new(REQUESTS_COMPLETED_TOTAL.clone()))?;
    prometheus::default_registry().register(Box::new(IN_FLIGHT_REQUESTS.clone()))?;
    prometheus::default_registry().register(Box::new(OUTPUT_TOKENS_TOTAL.clone()))?;
    Ok(())
}

/// HTTP handler for the Prometheus metrics endpoint.
pub async fn metrics_handler(
    _req: Request<Body>,
    registry: Arc<Mutex<Registry>>,
) -> Result<Response<Body>, hyper::Error> {
    let encoder = TextEncoder::new();
    let metric_families = registry.lock().unwrap().gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer).unwrap();

    let response = Response::builder()
        .status(200)
        .header("Content-Type", encoder.format_type())
        .body(Body::from(buffer))
        .unwrap();

    Ok(response)
}

/// Starts the Prometheus metrics HTTP server.
pub async fn start_metrics_server(port: u16, registry: Arc<Mutex<Registry>>) {
    let addr = ([0, 0, 0, 0], port).into();

    let make_svc = make_service_fn(move |_conn| {
        let registry_clone = registry.clone();
        async move {
            Ok::<_, hyper::Error>(service_fn(move |req| {
                let registry_clone_inner = registry_clone.clone();
                async move { metrics_handler(req, registry_clone_inner).await }
            }))
        }
    });

    let server = Server::bind(&addr).serve(make_svc);
    info!(
        port = port,
        addr = %addr,
        "Metrics server listening"
    );

    if let Err(e) = server.await {
        error!(error = %e, "Metrics server error");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_update_without_registration() {
        let before = REQUESTS_DISPATCHED_TOTAL.get();
        REQUESTS_DISPATCHED_TOTAL.inc();
        assert_eq!(REQUESTS_DISPATCHED_TOTAL.get(), before + 1);

        IN_FLIGHT_REQUESTS.inc();
        IN_FLIGHT_REQUESTS.dec();

        let before = REQUESTS_COMPLETED_TOTAL.with_label_values(&["completed"]).get();
        REQUESTS_COMPLETED_TOTAL
            .with_label_values(&["completed"])
            .inc();
        assert_eq!(
            REQUESTS_COMPLETED_TOTAL.with_label_values(&["completed"]).get(),
            before + 1
        );
    }
}
