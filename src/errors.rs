//! Error taxonomy for benchmark runs.
//!
//! Two tiers: per-request failures are data, recorded on the request record
//! and reported in the error breakdown; they never abort a run. Fatal errors
//! (`BenchError`) surface to the operator before or during a run and stop it.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Kinds of per-request failure.
///
/// These become labels in the report's error breakdown, so the set is closed
/// and the wire names are stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestErrorKind {
    /// DNS, connection refused, TLS handshake and other transport failures
    /// before a response arrived.
    Connect,

    /// Per-request deadline expired.
    Timeout,

    /// Backend answered with a non-2xx status.
    HttpStatus,

    /// Response body could not be decoded (malformed SSE frame or JSON).
    Decode,

    /// Request was cancelled, individually or by run-level cancellation.
    Cancelled,
}

impl RequestErrorKind {
    /// Stable label used in reports and metrics.
    pub fn label(&self) -> &'static str {
        match self {
            RequestErrorKind::Connect => "connect",
            RequestErrorKind::Timeout => "timeout",
            RequestErrorKind::HttpStatus => "http_status",
            RequestErrorKind::Decode => "decode",
            RequestErrorKind::Cancelled => "cancelled",
        }
    }

    /// Classifies a reqwest error observed while issuing a request or
    /// consuming its body.
    pub fn from_reqwest(error: &reqwest::Error) -> Self {
        if error.is_timeout() {
            RequestErrorKind::Timeout
        } else if error.is_connect() || error.is_request() {
            RequestErrorKind::Connect
        } else if error.is_body() || error.is_decode() {
            RequestErrorKind::Decode
        } else if error.status().is_some() {
            RequestErrorKind::HttpStatus
        } else {
            RequestErrorKind::Connect
        }
    }

    /// All kinds in report order.
    pub fn all() -> [RequestErrorKind; 5] {
        [
            RequestErrorKind::Connect,
            RequestErrorKind::Timeout,
            RequestErrorKind::HttpStatus,
            RequestErrorKind::Decode,
            RequestErrorKind::Cancelled,
        ]
    }
}

impl fmt::Display for RequestErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// Fatal errors: configuration rejects, probe failures, I/O on the report
/// path, and internal invariant violations.
#[derive(Error, Debug)]
pub enum BenchError {
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("backend unreachable: {0}")]
    BackendUnreachable(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("internal invariant violated: {0}")]
    Internal(String),
}
