use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use inferbench::benchmarker::Benchmarker;
use inferbench::clock::Clock;
use inferbench::config::BenchmarkConfig;
use inferbench::metrics::{register_metrics, start_metrics_server};
use inferbench::openai::OpenAiBackend;
use inferbench::report::{format_suite_summary, save_suite};
use inferbench::source::build_source;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("inferbench=info")),
        )
        .init();

    // Configuration is folded once, here; nothing downstream re-reads the
    // environment.
    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = BenchmarkConfig::load(config_path.as_deref())?;
    info!(
        target = %config.target,
        model = %config.model,
        rate_type = config.rate_type.label(),
        rate = config.rate,
        max_concurrency = config.max_concurrency,
        seed = config.random_seed,
        "Starting benchmark"
    );

    register_metrics()?;
    if let Some(port) = config.metrics_port {
        let registry = Arc::new(Mutex::new(prometheus::default_registry().clone()));
        tokio::spawn(start_metrics_server(port, registry));
    }

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupt received, draining in-flight requests");
                cancel.cancel();
            }
        });
    }

    let clock = Clock::start();
    let source = build_source(
        &config.data,
        config.endpoint,
        config.sample_order,
        config.random_seed,
    )?;
    let backend = Arc::new(OpenAiBackend::from_config(&config, clock)?);

    let benchmarker = Benchmarker::new(config.clone(), backend, source, clock, cancel);
    let suite = benchmarker.run().await?;

    save_suite(&suite, &config.output_path)?;
    println!("{}", format_suite_summary(&suite));
    info!(path = %config.output_path.display(), runs = suite.reports.len(), "Report written");

    Ok(())
}
