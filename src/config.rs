//! Benchmark configuration.
//!
//! Configuration is loaded once at startup: a YAML file (optional), then
//! environment overrides, folded into one immutable value that is validated
//! before any component is constructed. No component re-reads the
//! environment afterwards.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tokio::time::Duration;

use crate::errors::BenchError;
use crate::request::EndpointKind;
use crate::utils::parse_duration_string;

/// Rate strategy selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RateType {
    Synchronous,
    Throughput,
    Concurrent,
    Constant,
    Poisson,
    Sweep,
}

impl RateType {
    pub fn label(&self) -> &'static str {
        match self {
            RateType::Synchronous => "synchronous",
            RateType::Throughput => "throughput",
            RateType::Concurrent => "concurrent",
            RateType::Constant => "constant",
            RateType::Poisson => "poisson",
            RateType::Sweep => "sweep",
        }
    }

    /// Whether the numeric `rate` option is required.
    pub fn needs_rate(&self) -> bool {
        matches!(
            self,
            RateType::Concurrent | RateType::Constant | RateType::Poisson
        )
    }
}

impl FromStr for RateType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "synchronous" => Ok(RateType::Synchronous),
            "throughput" => Ok(RateType::Throughput),
            "concurrent" => Ok(RateType::Concurrent),
            "constant" => Ok(RateType::Constant),
            "poisson" => Ok(RateType::Poisson),
            "sweep" => Ok(RateType::Sweep),
            _ => Err(format!(
                "Invalid rate_type: '{}'. Use 'synchronous', 'throughput', 'concurrent', 'constant', 'poisson', or 'sweep'.",
                s
            )),
        }
    }
}

/// Iteration order of a finite request source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SampleOrder {
    Sequential,
    Shuffled,
}

/// Where request payloads come from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataSpec {
    /// Infinite source of fixed-shape synthetic prompts.
    Synthetic {
        prompt_tokens: u64,
        max_tokens: u64,
    },
    /// Finite source backed by a `.jsonl` or `.csv` prompt file.
    File { path: PathBuf },
}

impl Default for DataSpec {
    fn default() -> Self {
        DataSpec::Synthetic {
            prompt_tokens: 128,
            max_tokens: 64,
        }
    }
}

/// Duration format accepting either seconds or strings like "30s", "5m".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DurationField {
    Seconds(f64),
    Text(String),
}

impl DurationField {
    pub fn to_duration(&self) -> Result<Duration, BenchError> {
        match self {
            DurationField::Seconds(s) => {
                // The upper bound keeps from_secs_f64 from panicking.
                if !s.is_finite() || *s < 0.0 || *s > 1.0e12 {
                    return Err(BenchError::ConfigInvalid(format!(
                        "duration must be a non-negative number of seconds, got {}",
                        s
                    )));
                }
                Ok(Duration::from_secs_f64(*s))
            }
            DurationField::Text(s) => parse_duration_string(s)
                .map_err(|e| BenchError::ConfigInvalid(format!("invalid duration '{}': {}", s, e))),
        }
    }
}

fn default_endpoint() -> EndpointKind {
    EndpointKind::Chat
}

fn default_rate_type() -> RateType {
    RateType::Synchronous
}

fn default_sweep_steps() -> usize {
    10
}

fn default_max_concurrency() -> usize {
    256
}

fn default_request_timeout() -> DurationField {
    DurationField::Text("120s".to_string())
}

fn default_drain_timeout() -> DurationField {
    DurationField::Text("30s".to_string())
}

fn default_progress_interval() -> DurationField {
    DurationField::Text("5s".to_string())
}

fn default_seed() -> u64 {
    42
}

fn default_sample_order() -> SampleOrder {
    SampleOrder::Sequential
}

fn default_stream() -> bool {
    true
}

fn default_max_exact_samples() -> usize {
    100_000
}

fn default_output_path() -> PathBuf {
    PathBuf::from("benchmark-report.json")
}

/// The full configuration surface. See the repository README for the YAML
/// shape; every field has an equivalent environment override where noted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BenchmarkConfig {
    /// Backend base URL (`TARGET_URL`).
    #[serde(default)]
    pub target: String,

    /// Model identifier passed to the backend (`MODEL`).
    #[serde(default)]
    pub model: String,

    /// `text` or `chat` (`ENDPOINT_KIND`).
    #[serde(default = "default_endpoint")]
    pub endpoint: EndpointKind,

    /// Bearer token (`API_KEY`). Redacted from report snapshots.
    #[serde(default)]
    pub api_key: Option<String>,

    /// Extra default headers, comma-separated `Name:Value` pairs with `\,`
    /// escapes (`EXTRA_HEADERS`).
    #[serde(default)]
    pub extra_headers: Option<String>,

    #[serde(default)]
    pub skip_tls_verify: bool,

    /// Request streaming responses from the backend.
    #[serde(default = "default_stream")]
    pub stream: bool,

    /// Strategy selector (`RATE_TYPE`).
    #[serde(default = "default_rate_type")]
    pub rate_type: RateType,

    /// Numeric parameter for constant/poisson/concurrent (`RATE`).
    #[serde(default)]
    pub rate: Option<f64>,

    /// Total number of runs in a sweep, extremes included.
    #[serde(default = "default_sweep_steps")]
    pub sweep_steps: usize,

    /// Explicit constant rates for the sweep, replacing the derived spacing.
    #[serde(default)]
    pub sweep_rates: Option<Vec<f64>>,

    /// Overall duration cap (`MAX_SECONDS`).
    #[serde(default)]
    pub max_seconds: Option<DurationField>,

    /// Overall request cap (`MAX_REQUESTS`).
    #[serde(default)]
    pub max_requests: Option<u64>,

    #[serde(default)]
    pub warmup_percent: Option<f64>,
    #[serde(default)]
    pub warmup_requests: Option<u64>,
    #[serde(default)]
    pub cooldown_percent: Option<f64>,
    #[serde(default)]
    pub cooldown_requests: Option<u64>,

    /// Worker-pool parallelism cap (`MAX_CONCURRENCY`).
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    /// Per-request deadline (`REQUEST_TIMEOUT`).
    #[serde(default = "default_request_timeout")]
    pub request_timeout: DurationField,

    /// How long to await in-flight requests after dispatch stops.
    #[serde(default = "default_drain_timeout")]
    pub drain_timeout: DurationField,

    /// Strategy and shuffle RNG seed (`RANDOM_SEED`).
    #[serde(default = "default_seed")]
    pub random_seed: u64,

    #[serde(default)]
    pub data: DataSpec,

    #[serde(default = "default_sample_order")]
    pub sample_order: SampleOrder,

    /// Keep warmup/cooldown records in the report alongside measured ones.
    #[serde(default)]
    pub retain_all_records: bool,

    /// Exact-quantile sample cap before falling back to the histogram
    /// estimator.
    #[serde(default = "default_max_exact_samples")]
    pub max_exact_samples: usize,

    /// Prometheus scrape port; metrics endpoint is off when unset
    /// (`METRICS_PORT`).
    #[serde(default)]
    pub metrics_port: Option<u16>,

    /// Report destination, `.json` or `.yaml` (`OUTPUT_PATH`).
    #[serde(default = "default_output_path")]
    pub output_path: PathBuf,

    /// Interval between progress log lines.
    #[serde(default = "default_progress_interval")]
    pub progress_interval: DurationField,
}

impl Default for BenchmarkConfig {
    fn default() -> Self {
        serde_yaml::from_str("{}").expect("empty config must deserialize")
    }
}

/// Request-count and wall-time bounds of a warmup or cooldown phase. Either
/// bound marks a ticket as belonging to the phase.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PhaseBounds {
    pub requests: Option<u64>,
    pub duration_ns: Option<u64>,
}

impl BenchmarkConfig {
    /// Loads the configuration: YAML file if given, then environment
    /// overrides, then validation.
    pub fn load(path: Option<&Path>) -> Result<Self, BenchError> {
        let mut config = match path {
            Some(p) => {
                let text = fs::read_to_string(p)?;
                serde_yaml::from_str(&text)?
            }
            None => BenchmarkConfig::default(),
        };
        config.apply_overrides_from(|name| env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Folds overrides from a lookup into the config. Production passes
    /// `env::var`; tests pass a map.
    pub fn apply_overrides_from<F>(&mut self, get: F) -> Result<(), BenchError>
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parsed<T: FromStr>(name: &str, value: String) -> Result<T, BenchError>
        where
            T::Err: std::fmt::Display,
        {
            value.parse::<T>().map_err(|e| {
                BenchError::ConfigInvalid(format!("invalid {} '{}': {}", name, value, e))
            })
        }

        if let Some(v) = get("TARGET_URL") {
            self.target = v;
        }
        if let Some(v) = get("MODEL") {
            self.model = v;
        }
        if let Some(v) = get("ENDPOINT_KIND") {
            self.endpoint = match v.to_lowercase().as_str() {
                "text" => EndpointKind::Text,
                "chat" => EndpointKind::Chat,
                other => {
                    return Err(BenchError::ConfigInvalid(format!(
                        "invalid ENDPOINT_KIND '{}': use 'text' or 'chat'",
                        other
                    )))
                }
            };
        }
        if let Some(v) = get("API_KEY") {
            self.api_key = Some(v);
        }
        if let Some(v) = get("EXTRA_HEADERS") {
            self.extra_headers = Some(v);
        }
        if let Some(v) = get("RATE_TYPE") {
            self.rate_type = v
                .parse::<RateType>()
                .map_err(BenchError::ConfigInvalid)?;
        }
        if let Some(v) = get("RATE") {
            self.rate = Some(parsed::<f64>("RATE", v)?);
        }
        if let Some(v) = get("MAX_SECONDS") {
            self.max_seconds = Some(match v.parse::<f64>() {
                Ok(secs) => DurationField::Seconds(secs),
                Err(_) => DurationField::Text(v),
            });
        }
        if let Some(v) = get("MAX_REQUESTS") {
            self.max_requests = Some(parsed::<u64>("MAX_REQUESTS", v)?);
        }
        if let Some(v) = get("MAX_CONCURRENCY") {
            self.max_concurrency = parsed::<usize>("MAX_CONCURRENCY", v)?;
        }
        if let Some(v) = get("REQUEST_TIMEOUT") {
            self.request_timeout = match v.parse::<f64>() {
                Ok(secs) => DurationField::Seconds(secs),
                Err(_) => DurationField::Text(v),
            };
        }
        if let Some(v) = get("RANDOM_SEED") {
            self.random_seed = parsed::<u64>("RANDOM_SEED", v)?;
        }
        if let Some(v) = get("METRICS_PORT") {
            self.metrics_port = Some(parsed::<u16>("METRICS_PORT", v)?);
        }
        if let Some(v) = get("OUTPUT_PATH") {
            self.output_path = PathBuf::from(v);
        }
        Ok(())
    }

    /// Rejects configurations the engine cannot run. Fatal, before any
    /// component is constructed.
    pub fn validate(&self) -> Result<(), BenchError> {
        let invalid = |msg: String| Err(BenchError::ConfigInvalid(msg));

        if self.target.is_empty() {
            return invalid("'target' is required (or set TARGET_URL)".into());
        }
        if self.model.is_empty() {
            return invalid("'model' is required (or set MODEL)".into());
        }
        if self.max_concurrency == 0 {
            return invalid("'max_concurrency' must be at least 1".into());
        }

        match self.rate_type {
            t if t.needs_rate() => {
                let rate = self.rate.ok_or_else(|| {
                    BenchError::ConfigInvalid(format!(
                        "rate_type '{}' requires the 'rate' option",
                        t.label()
                    ))
                })?;
                if !(rate.is_finite() && rate > 0.0) {
                    return invalid(format!("'rate' must be positive, got {}", rate));
                }
                if t == RateType::Concurrent && (rate.fract() != 0.0 || rate < 1.0) {
                    return invalid(format!(
                        "'rate' for concurrent must be a whole number of streams >= 1, got {}",
                        rate
                    ));
                }
            }
            RateType::Sweep => {
                if let Some(rates) = &self.sweep_rates {
                    if rates.is_empty() {
                        return invalid("'sweep_rates' must not be empty".into());
                    }
                    if rates.iter().any(|r| !(r.is_finite() && *r > 0.0)) {
                        return invalid("'sweep_rates' entries must be positive".into());
                    }
                } else if self.sweep_steps < 3 {
                    return invalid(format!(
                        "'sweep_steps' must be at least 3 (got {}): synchronous, throughput, and one interior rate",
                        self.sweep_steps
                    ));
                }
            }
            _ => {}
        }

        if matches!(self.data, DataSpec::Synthetic { .. })
            && self.max_requests.is_none()
            && self.max_seconds.is_none()
        {
            return invalid(
                "synthetic data is unbounded: set 'max_requests' and/or 'max_seconds'".into(),
            );
        }

        for (name, pct) in [
            ("warmup_percent", self.warmup_percent),
            ("cooldown_percent", self.cooldown_percent),
        ] {
            if let Some(p) = pct {
                if !(0.0..100.0).contains(&p) {
                    return invalid(format!("'{}' must be in [0, 100), got {}", name, p));
                }
                if self.max_requests.is_none() && self.max_seconds.is_none() {
                    return invalid(format!(
                        "'{}' needs 'max_requests' or 'max_seconds' to resolve against",
                        name
                    ));
                }
            }
        }
        if let (Some(w), Some(c)) = (self.warmup_percent, self.cooldown_percent) {
            if w + c >= 100.0 {
                return invalid(format!(
                    "warmup_percent + cooldown_percent must stay below 100, got {}",
                    w + c
                ));
            }
        }
        if let (Some(w), Some(c), Some(max)) =
            (self.warmup_requests, self.cooldown_requests, self.max_requests)
        {
            if w + c >= max.max(1) {
                return invalid(format!(
                    "warmup_requests + cooldown_requests ({}) must stay below max_requests ({})",
                    w + c,
                    max
                ));
            }
        }

        for (name, field) in [
            ("request_timeout", &self.request_timeout),
            ("drain_timeout", &self.drain_timeout),
            ("progress_interval", &self.progress_interval),
        ] {
            field
                .to_duration()
                .map_err(|e| BenchError::ConfigInvalid(format!("{}: {}", name, e)))?;
        }
        if let Some(max) = &self.max_seconds {
            max.to_duration()
                .map_err(|e| BenchError::ConfigInvalid(format!("max_seconds: {}", e)))?;
        }

        match self.output_path.extension().and_then(|e| e.to_str()) {
            Some("json") | Some("yaml") | Some("yml") => {}
            other => {
                return invalid(format!(
                    "'output_path' must end in .json, .yaml, or .yml, got {:?}",
                    other
                ))
            }
        }

        Ok(())
    }

    pub fn max_duration(&self) -> Option<Duration> {
        self.max_seconds
            .as_ref()
            .map(|d| d.to_duration().expect("validated"))
    }

    pub fn request_timeout_duration(&self) -> Duration {
        self.request_timeout.to_duration().expect("validated")
    }

    pub fn drain_timeout_duration(&self) -> Duration {
        self.drain_timeout.to_duration().expect("validated")
    }

    pub fn progress_interval_duration(&self) -> Duration {
        self.progress_interval.to_duration().expect("validated")
    }

    /// Leading phase excluded from statistics. Request and wall-time bounds
    /// may both apply; explicit `warmup_requests` wins over the percent form.
    pub fn warmup_bounds(&self) -> PhaseBounds {
        self.phase_bounds(self.warmup_requests, self.warmup_percent)
    }

    /// Trailing phase excluded from statistics, expressed as its extent
    /// (requests from the end, nanoseconds before the duration cap).
    pub fn cooldown_bounds(&self) -> PhaseBounds {
        self.phase_bounds(self.cooldown_requests, self.cooldown_percent)
    }

    fn phase_bounds(&self, requests: Option<u64>, percent: Option<f64>) -> PhaseBounds {
        let requests = requests.or_else(|| {
            let pct = percent?;
            let max = self.max_requests?;
            Some(((max as f64) * pct / 100.0).round() as u64)
        });
        let duration_ns = percent.and_then(|pct| {
            let max = self.max_duration()?;
            Some((max.as_nanos() as f64 * pct / 100.0).round() as u64)
        });
        PhaseBounds {
            requests,
            duration_ns,
        }
    }

    /// Redacted copy embedded in reports.
    pub fn snapshot(&self) -> ConfigSnapshot {
        ConfigSnapshot {
            target: self.target.clone(),
            model: self.model.clone(),
            endpoint: self.endpoint,
            stream: self.stream,
            rate_type: self.rate_type,
            rate: self.rate,
            max_seconds: self.max_duration().map(|d| d.as_secs_f64()),
            max_requests: self.max_requests,
            warmup_percent: self.warmup_percent,
            warmup_requests: self.warmup_requests,
            cooldown_percent: self.cooldown_percent,
            cooldown_requests: self.cooldown_requests,
            max_concurrency: self.max_concurrency,
            request_timeout_s: self.request_timeout_duration().as_secs_f64(),
            random_seed: self.random_seed,
            data: self.data.clone(),
            sample_order: self.sample_order,
        }
    }
}

/// Configuration snapshot stored in every report. Never carries credentials.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigSnapshot {
    pub target: String,
    pub model: String,
    pub endpoint: EndpointKind,
    pub stream: bool,
    pub rate_type: RateType,
    pub rate: Option<f64>,
    pub max_seconds: Option<f64>,
    pub max_requests: Option<u64>,
    pub warmup_percent: Option<f64>,
    pub warmup_requests: Option<u64>,
    pub cooldown_percent: Option<f64>,
    pub cooldown_requests: Option<u64>,
    pub max_concurrency: usize,
    pub request_timeout_s: f64,
    pub random_seed: u64,
    pub data: DataSpec,
    pub sample_order: SampleOrder,
}
