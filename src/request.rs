//! Request data model: payloads, dispatch tickets and measurement records.
//!
//! A `RequestPayload` comes out of a request source, is wrapped into a
//! `DispatchTicket` by the scheduler, and is measured through a
//! `RequestRecord`. The record is created by the scheduler at dispatch,
//! mutated only by the worker that drives the request, and handed to the
//! aggregator once it carries a terminal outcome.

use serde::{Deserialize, Serialize};

use crate::backend::StreamEvent;
use crate::errors::RequestErrorKind;

/// Which OpenAI-compatible endpoint family a payload targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndpointKind {
    /// `/v1/completions`
    Text,
    /// `/v1/chat/completions`
    Chat,
}

/// One message of a chat conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

/// Generation parameters passed through to the backend unchanged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationParams {
    pub max_tokens: Option<u64>,
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stop: Vec<String>,
}

/// An immutable request payload produced by a request source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestPayload {
    pub endpoint: EndpointKind,

    /// Prompt text for the `text` endpoint family.
    pub prompt: Option<String>,

    /// Message list for the `chat` endpoint family.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub messages: Vec<ChatMessage>,

    #[serde(default)]
    pub params: GenerationParams,

    /// Source-provided estimate of the prompt's token count.
    pub prompt_tokens_hint: Option<u64>,

    /// Index of the payload within its dataset, when it has one.
    pub dataset_index: Option<u64>,
}

/// Phase a dispatch falls into. Only `measured` records contribute to
/// statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Warmup,
    Measured,
    Cooldown,
}

impl Phase {
    pub fn label(&self) -> &'static str {
        match self {
            Phase::Warmup => "warmup",
            Phase::Measured => "measured",
            Phase::Cooldown => "cooldown",
        }
    }
}

/// Ticket released by the scheduler for one payload.
#[derive(Debug, Clone)]
pub struct DispatchTicket {
    pub payload: RequestPayload,
    pub sequence_index: u64,
    pub targeted_dispatch_ns: u64,
    pub phase: Phase,
}

/// Terminal outcome of one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RequestOutcome {
    Completed,
    Error { kind: RequestErrorKind },
    Cancelled,
    Timeout,
}

impl RequestOutcome {
    /// Label used for metrics and the report's outcome counts.
    pub fn label(&self) -> &'static str {
        match self {
            RequestOutcome::Completed => "completed",
            RequestOutcome::Error { .. } => "error",
            RequestOutcome::Cancelled => "cancelled",
            RequestOutcome::Timeout => "timeout",
        }
    }

    /// Error kind for the breakdown, covering the timeout and cancelled
    /// outcomes as well.
    pub fn error_kind(&self) -> Option<RequestErrorKind> {
        match self {
            RequestOutcome::Completed => None,
            RequestOutcome::Error { kind } => Some(*kind),
            RequestOutcome::Cancelled => Some(RequestErrorKind::Cancelled),
            RequestOutcome::Timeout => Some(RequestErrorKind::Timeout),
        }
    }
}

/// Observable lifecycle state of a request, derived from the record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    Created,
    InFlight,
    Receiving,
    Completed,
    Failed,
    Cancelled,
}

impl RequestState {
    pub fn label(&self) -> &'static str {
        match self {
            RequestState::Created => "created",
            RequestState::InFlight => "in_flight",
            RequestState::Receiving => "receiving",
            RequestState::Completed => "completed",
            RequestState::Failed => "failed",
            RequestState::Cancelled => "cancelled",
        }
    }
}

/// One row of measurement. All times are monotonic nanoseconds from the run
/// epoch; unset fields were never reached.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestRecord {
    pub sequence_index: u64,
    pub phase: Phase,

    pub targeted_dispatch: u64,
    pub actual_dispatch: Option<u64>,
    pub first_response_byte: Option<u64>,
    pub first_token: Option<u64>,
    pub last_token: Option<u64>,
    pub completion: Option<u64>,

    /// Arrival time of every streamed token (or token group).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub token_arrivals: Vec<u64>,

    pub prompt_tokens: Option<u64>,
    pub output_tokens: u64,

    pub outcome: Option<RequestOutcome>,
    pub error_message: Option<String>,
}

impl RequestRecord {
    /// Fresh record at dispatch time; only `targeted_dispatch` is set.
    pub fn new(sequence_index: u64, phase: Phase, targeted_dispatch: u64) -> Self {
        Self {
            sequence_index,
            phase,
            targeted_dispatch,
            actual_dispatch: None,
            first_response_byte: None,
            first_token: None,
            last_token: None,
            completion: None,
            token_arrivals: Vec::new(),
            prompt_tokens: None,
            output_tokens: 0,
            outcome: None,
            error_message: None,
        }
    }

    /// Stamps the moment the worker actually issued the request.
    pub fn mark_dispatched(&mut self, now_ns: u64) {
        self.actual_dispatch = Some(now_ns);
    }

    /// Folds one backend event into the record.
    ///
    /// Terminal events set `outcome`; the caller must stop feeding events
    /// once `is_terminal()` returns true.
    pub fn apply_event(&mut self, event: StreamEvent) {
        match event {
            StreamEvent::FirstByte { at_ns } => {
                if self.first_response_byte.is_none() {
                    self.first_response_byte = Some(at_ns);
                }
            }
            StreamEvent::Token {
                at_ns, token_delta, ..
            } => {
                if self.first_token.is_none() {
                    self.first_token = Some(at_ns);
                }
                self.token_arrivals.push(at_ns);
                self.last_token = Some(at_ns);
                self.output_tokens += token_delta;
            }
            StreamEvent::Done {
                at_ns,
                prompt_tokens,
                output_tokens,
            } => {
                self.completion = Some(at_ns);
                if prompt_tokens.is_some() {
                    self.prompt_tokens = prompt_tokens;
                }
                if let Some(count) = output_tokens {
                    self.output_tokens = count;
                }
                self.outcome = Some(RequestOutcome::Completed);
            }
            StreamEvent::Error {
                at_ns,
                kind,
                message,
            } => {
                self.completion = Some(at_ns);
                self.error_message = Some(message);
                self.outcome = Some(match kind {
                    RequestErrorKind::Timeout => RequestOutcome::Timeout,
                    RequestErrorKind::Cancelled => RequestOutcome::Cancelled,
                    other => RequestOutcome::Error { kind: other },
                });
            }
        }
    }

    /// Marks the record cancelled, noting the state it was in.
    pub fn finalize_cancelled(&mut self, now_ns: u64) {
        if self.is_terminal() {
            return;
        }
        self.error_message = Some(format!("cancelled while {}", self.state().label()));
        self.completion = Some(now_ns);
        self.outcome = Some(RequestOutcome::Cancelled);
    }

    /// Marks the record timed out at its deadline.
    pub fn finalize_timeout(&mut self, now_ns: u64) {
        if self.is_terminal() {
            return;
        }
        self.error_message = Some(format!("deadline expired while {}", self.state().label()));
        self.completion = Some(now_ns);
        self.outcome = Some(RequestOutcome::Timeout);
    }

    /// Marks the record failed with the given kind.
    pub fn finalize_error(&mut self, kind: RequestErrorKind, message: &str, now_ns: u64) {
        if self.is_terminal() {
            return;
        }
        self.error_message = Some(message.to_string());
        self.completion = Some(now_ns);
        self.outcome = Some(match kind {
            RequestErrorKind::Timeout => RequestOutcome::Timeout,
            RequestErrorKind::Cancelled => RequestOutcome::Cancelled,
            other => RequestOutcome::Error { kind: other },
        });
    }

    pub fn is_terminal(&self) -> bool {
        self.outcome.is_some()
    }

    /// Current lifecycle state, derived from which fields are set.
    pub fn state(&self) -> RequestState {
        match self.outcome {
            Some(RequestOutcome::Completed) => RequestState::Completed,
            Some(RequestOutcome::Cancelled) => RequestState::Cancelled,
            Some(_) => RequestState::Failed,
            None => {
                if self.first_response_byte.is_some() {
                    RequestState::Receiving
                } else if self.actual_dispatch.is_some() {
                    RequestState::InFlight
                } else {
                    RequestState::Created
                }
            }
        }
    }

    /// Time to first token: `first_token - actual_dispatch`.
    pub fn ttft_ns(&self) -> Option<u64> {
        Some(self.first_token?.saturating_sub(self.actual_dispatch?))
    }

    /// End-to-end latency: `completion - actual_dispatch`.
    pub fn latency_ns(&self) -> Option<u64> {
        Some(self.completion?.saturating_sub(self.actual_dispatch?))
    }

    /// Gaps between consecutive token arrivals, starting from the first
    /// token. The dispatch-to-first-token gap is TTFT, not an inter-token
    /// gap.
    pub fn token_gaps_ns(&self) -> impl Iterator<Item = u64> + '_ {
        self.token_arrivals
            .windows(2)
            .map(|pair| pair[1].saturating_sub(pair[0]))
    }

    /// Whether every set timestamp respects the required ordering
    /// `targeted <= actual <= first_byte <= first_token <= last_token <= completion`.
    pub fn timeline_is_monotonic(&self) -> bool {
        let chain = [
            Some(self.targeted_dispatch),
            self.actual_dispatch,
            self.first_response_byte,
            self.first_token,
            self.last_token,
            self.completion,
        ];
        let mut prev: Option<u64> = None;
        for ts in chain.into_iter().flatten() {
            if let Some(p) = prev {
                if ts < p {
                    return false;
                }
            }
            prev = Some(ts);
        }
        self.token_arrivals.windows(2).all(|w| w[0] <= w[1])
    }
}
