//! Backend adapter contract.
//!
//! A backend issues exactly one request per `execute` call and exposes the
//! response as a lazy stream of timing events followed by a terminal event.
//! Timestamps are stamped with the shared clock at the moment each event is
//! observed on the wire, never at hand-off to the consumer. Adapters never
//! retry; retry policy belongs to the caller.

use async_trait::async_trait;
use futures_util::stream::BoxStream;

use crate::errors::{BenchError, RequestErrorKind};
use crate::request::RequestPayload;

/// One event observed while driving a request.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// First byte of the HTTP response body. Emitted at most once, before
    /// any `Token`.
    FirstByte { at_ns: u64 },

    /// One streaming chunk carrying decoded token text.
    Token {
        at_ns: u64,
        text: String,
        token_delta: u64,
    },

    /// Success terminal. Token counts come from the server's `usage` object
    /// when present.
    Done {
        at_ns: u64,
        prompt_tokens: Option<u64>,
        output_tokens: Option<u64>,
    },

    /// Failure terminal.
    Error {
        at_ns: u64,
        kind: RequestErrorKind,
        message: String,
    },
}

impl StreamEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEvent::Done { .. } | StreamEvent::Error { .. })
    }
}

/// Lazy event sequence for one request. Dropping the stream aborts the
/// underlying request.
pub type EventStream = BoxStream<'static, StreamEvent>;

/// A backend that can serve benchmark requests.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Validates reachability and model availability before any run.
    /// A failure here is fatal and aborts the benchmarker before dispatch.
    async fn probe(&self) -> Result<(), BenchError>;

    /// Issues one request. `deadline_ns` is the epoch offset after which the
    /// caller will abandon the stream; adapters may use it to bound their own
    /// I/O but the caller enforces it regardless.
    fn execute(&self, payload: RequestPayload, deadline_ns: u64) -> EventStream;
}

/// Rough token-count estimate for when the server reports no `usage`.
///
/// Four characters per token approximates common BPE vocabularies closely
/// enough for throughput accounting.
pub fn estimate_tokens(text: &str) -> u64 {
    let chars = text.chars().count() as u64;
    if chars == 0 {
        0
    } else {
        chars.div_ceil(4).max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_events_are_terminal() {
        assert!(StreamEvent::Done {
            at_ns: 0,
            prompt_tokens: None,
            output_tokens: None
        }
        .is_terminal());
        assert!(StreamEvent::Error {
            at_ns: 0,
            kind: RequestErrorKind::Connect,
            message: String::new()
        }
        .is_terminal());
        assert!(!StreamEvent::FirstByte { at_ns: 0 }.is_terminal());
    }

    #[test]
    fn token_estimate_scales_with_length() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("hi"), 1);
        assert_eq!(estimate_tokens("abcdefgh"), 2);
        assert_eq!(estimate_tokens(&"x".repeat(400)), 100);
    }
}
