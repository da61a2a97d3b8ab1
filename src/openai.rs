//! OpenAI-compatible HTTP backend adapter.
//!
//! Drives `/v1/completions` and `/v1/chat/completions` over reqwest.
//! Streaming responses use server-sent-events framing (`data: ` prefixed
//! JSON chunks terminated by `data: [DONE]`); token text comes from
//! `choices[0].delta.content` (chat) or `choices[0].text` (text), and token
//! counts from the terminal `usage` object when the server provides one.
//! Event timestamps are stamped with the shared clock at the moment each
//! chunk is observed. The adapter never retries.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_stream::stream;
use async_trait::async_trait;
use eventsource_stream::{EventStreamError, Eventsource};
use futures_util::StreamExt;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use serde::Deserialize;
use serde_json::json;
use tokio::time::Duration;
use tracing::{debug, info, warn};

use crate::backend::{estimate_tokens, Backend, EventStream, StreamEvent};
use crate::clock::Clock;
use crate::config::BenchmarkConfig;
use crate::errors::{BenchError, RequestErrorKind};
use crate::request::{EndpointKind, RequestPayload};
use crate::utils::parse_header_pairs;

/// SSE streaming chunk from the completions APIs.
#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    delta: Option<StreamDelta>,
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamDelta {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    prompt_tokens: Option<u64>,
    completion_tokens: Option<u64>,
}

/// Non-streaming response body.
#[derive(Debug, Deserialize)]
struct FullResponse {
    #[serde(default)]
    choices: Vec<FullChoice>,
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct FullChoice {
    message: Option<FullMessage>,
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FullMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ListModelsResponse {
    #[serde(default)]
    data: Vec<ModelEntry>,
}

#[derive(Debug, Deserialize)]
struct ModelEntry {
    id: String,
}

/// Backend adapter for one OpenAI-compatible server.
pub struct OpenAiBackend {
    client: reqwest::Client,
    base_url: String,
    model: String,
    stream: bool,
    clock: Clock,
}

impl OpenAiBackend {
    pub fn from_config(config: &BenchmarkConfig, clock: Clock) -> Result<Self, BenchError> {
        let mut headers = HeaderMap::new();
        if let Some(key) = &config.api_key {
            let value = HeaderValue::from_str(&format!("Bearer {}", key))
                .map_err(|e| BenchError::ConfigInvalid(format!("invalid api_key: {}", e)))?;
            headers.insert(AUTHORIZATION, value);
        }
        if let Some(extra) = &config.extra_headers {
            let pairs = parse_header_pairs(extra)
                .map_err(|e| BenchError::ConfigInvalid(format!("extra_headers: {}", e)))?;
            for (name, value) in pairs {
                headers.insert(name, value);
            }
        }

        let mut builder = reqwest::Client::builder().default_headers(headers);
        if config.skip_tls_verify {
            warn!("Skipping TLS certificate verification");
            builder = builder.danger_accept_invalid_certs(true);
        }
        let client = builder
            .build()
            .map_err(|e| BenchError::ConfigInvalid(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: config.target.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            stream: config.stream,
            clock,
        })
    }

    /// Joins the base URL with an API path, tolerating a base that already
    /// ends in `/v1`.
    fn url_for(&self, path: &str) -> String {
        if let Some(root) = self.base_url.strip_suffix("/v1") {
            format!("{}{}", root, path)
        } else {
            format!("{}{}", self.base_url, path)
        }
    }

    fn endpoint_url(&self, endpoint: EndpointKind) -> String {
        match endpoint {
            EndpointKind::Text => self.url_for("/v1/completions"),
            EndpointKind::Chat => self.url_for("/v1/chat/completions"),
        }
    }

    fn build_body(&self, payload: &RequestPayload) -> serde_json::Value {
        let mut body = serde_json::Map::new();
        body.insert("model".to_string(), json!(self.model));
        match payload.endpoint {
            EndpointKind::Chat => {
                body.insert("messages".to_string(), json!(payload.messages));
            }
            EndpointKind::Text => {
                body.insert(
                    "prompt".to_string(),
                    json!(payload.prompt.clone().unwrap_or_default()),
                );
            }
        }
        if let Some(max_tokens) = payload.params.max_tokens {
            body.insert("max_tokens".to_string(), json!(max_tokens));
        }
        if let Some(temperature) = payload.params.temperature {
            body.insert("temperature".to_string(), json!(temperature));
        }
        if !payload.params.stop.is_empty() {
            body.insert("stop".to_string(), json!(payload.params.stop));
        }
        if self.stream {
            body.insert("stream".to_string(), json!(true));
            body.insert(
                "stream_options".to_string(),
                json!({ "include_usage": true }),
            );
        }
        serde_json::Value::Object(body)
    }
}

fn truncate_detail(text: &str) -> String {
    const LIMIT: usize = 200;
    if text.chars().count() <= LIMIT {
        text.to_string()
    } else {
        let cut: String = text.chars().take(LIMIT).collect();
        format!("{}…", cut)
    }
}

fn token_text(choice: &StreamChoice) -> Option<String> {
    choice
        .delta
        .as_ref()
        .and_then(|d| d.content.clone())
        .or_else(|| choice.text.clone())
}

#[async_trait]
impl Backend for OpenAiBackend {
    async fn probe(&self) -> Result<(), BenchError> {
        let url = self.url_for("/v1/models");
        let response = self
            .client
            .get(&url)
            .timeout(Duration::from_secs(10))
            .send()
            .await
            .map_err(|e| BenchError::BackendUnreachable(format!("{}: {}", url, e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(BenchError::BackendUnreachable(format!(
                "{} answered HTTP {}",
                url,
                status.as_u16()
            )));
        }

        match response.json::<ListModelsResponse>().await {
            Ok(listing) => {
                if !listing.data.is_empty() && !listing.data.iter().any(|m| m.id == self.model) {
                    return Err(BenchError::BackendUnreachable(format!(
                        "model '{}' is not served by {} (available: {})",
                        self.model,
                        self.base_url,
                        listing
                            .data
                            .iter()
                            .map(|m| m.id.as_str())
                            .collect::<Vec<_>>()
                            .join(", ")
                    )));
                }
            }
            Err(e) => {
                // Reachability is established; some servers return a
                // non-standard model listing.
                warn!(error = %e, "Could not parse /v1/models listing, skipping model check");
            }
        }

        info!(target = %self.base_url, model = %self.model, "Backend probe succeeded");
        Ok(())
    }

    fn execute(&self, payload: RequestPayload, deadline_ns: u64) -> EventStream {
        let client = self.client.clone();
        let clock = self.clock;
        let url = self.endpoint_url(payload.endpoint);
        let body = self.build_body(&payload);
        let stream_mode = self.stream;
        let prompt_hint = payload.prompt_tokens_hint;

        Box::pin(stream! {
            let remaining_ns = deadline_ns.saturating_sub(clock.now_ns()).max(1);
            let request = client
                .post(&url)
                .json(&body)
                .timeout(Duration::from_nanos(remaining_ns));

            let response = match request.send().await {
                Ok(response) => response,
                Err(e) => {
                    yield StreamEvent::Error {
                        at_ns: clock.now_ns(),
                        kind: RequestErrorKind::from_reqwest(&e),
                        message: e.to_string(),
                    };
                    return;
                }
            };

            let status = response.status();
            if !status.is_success() {
                let at_ns = clock.now_ns();
                let detail = response.text().await.unwrap_or_default();
                yield StreamEvent::Error {
                    at_ns,
                    kind: RequestErrorKind::HttpStatus,
                    message: format!("HTTP {}: {}", status.as_u16(), truncate_detail(&detail)),
                };
                return;
            }

            if stream_mode {
                // Stamp the first body byte as it is observed on the wire;
                // the SSE decoder only surfaces whole events.
                let first_byte_ns = Arc::new(AtomicU64::new(0));
                let mark = first_byte_ns.clone();
                let tapped = response.bytes_stream().inspect(move |_| {
                    let _ = mark.compare_exchange(
                        0,
                        clock.now_ns().max(1),
                        Ordering::Relaxed,
                        Ordering::Relaxed,
                    );
                });

                let mut events = tapped.eventsource();
                let mut first_byte_emitted = false;
                let mut saw_done_marker = false;
                let mut usage: Option<Usage> = None;
                let mut streamed_tokens: u64 = 0;

                while let Some(event) = events.next().await {
                    if !first_byte_emitted {
                        let at_ns = first_byte_ns.load(Ordering::Relaxed);
                        if at_ns != 0 {
                            yield StreamEvent::FirstByte { at_ns };
                            first_byte_emitted = true;
                        }
                    }
                    match event {
                        Ok(event) => {
                            if event.data.trim() == "[DONE]" {
                                saw_done_marker = true;
                                break;
                            }
                            let at_ns = clock.now_ns();
                            let chunk: StreamChunk = match serde_json::from_str(&event.data) {
                                Ok(chunk) => chunk,
                                Err(e) => {
                                    yield StreamEvent::Error {
                                        at_ns,
                                        kind: RequestErrorKind::Decode,
                                        message: format!("invalid SSE chunk: {}", e),
                                    };
                                    return;
                                }
                            };
                            if let Some(chunk_usage) = chunk.usage {
                                usage = Some(chunk_usage);
                            }
                            if let Some(text) = chunk.choices.first().and_then(token_text) {
                                if !text.is_empty() {
                                    streamed_tokens += 1;
                                    yield StreamEvent::Token {
                                        at_ns,
                                        text,
                                        token_delta: 1,
                                    };
                                }
                            }
                        }
                        Err(e) => {
                            let kind = match &e {
                                EventStreamError::Transport(transport) => {
                                    RequestErrorKind::from_reqwest(transport)
                                }
                                _ => RequestErrorKind::Decode,
                            };
                            yield StreamEvent::Error {
                                at_ns: clock.now_ns(),
                                kind,
                                message: e.to_string(),
                            };
                            return;
                        }
                    }
                }

                if !saw_done_marker {
                    debug!(url = %url, "Stream ended without a [DONE] marker");
                }
                let at_ns = clock.now_ns();
                yield StreamEvent::Done {
                    at_ns,
                    prompt_tokens: usage.as_ref().and_then(|u| u.prompt_tokens).or(prompt_hint),
                    output_tokens: usage
                        .as_ref()
                        .and_then(|u| u.completion_tokens)
                        .or(Some(streamed_tokens)),
                };
            } else {
                // Buffered path: accumulate the body by chunk so the first
                // byte still gets a wire-observation timestamp.
                let mut first_byte: Option<u64> = None;
                let mut buffer: Vec<u8> = Vec::new();
                let mut bytes = response.bytes_stream();
                while let Some(chunk) = bytes.next().await {
                    match chunk {
                        Ok(chunk) => {
                            if first_byte.is_none() {
                                first_byte = Some(clock.now_ns());
                            }
                            buffer.extend_from_slice(&chunk);
                        }
                        Err(e) => {
                            yield StreamEvent::Error {
                                at_ns: clock.now_ns(),
                                kind: RequestErrorKind::from_reqwest(&e),
                                message: e.to_string(),
                            };
                            return;
                        }
                    }
                }
                if let Some(at_ns) = first_byte {
                    yield StreamEvent::FirstByte { at_ns };
                }

                let at_ns = clock.now_ns();
                let parsed: FullResponse = match serde_json::from_slice(&buffer) {
                    Ok(parsed) => parsed,
                    Err(e) => {
                        yield StreamEvent::Error {
                            at_ns,
                            kind: RequestErrorKind::Decode,
                            message: format!("invalid response body: {}", e),
                        };
                        return;
                    }
                };
                let text = parsed
                    .choices
                    .first()
                    .and_then(|c| {
                        c.message
                            .as_ref()
                            .and_then(|m| m.content.clone())
                            .or_else(|| c.text.clone())
                    })
                    .unwrap_or_default();
                yield StreamEvent::Done {
                    at_ns,
                    prompt_tokens: parsed
                        .usage
                        .as_ref()
                        .and_then(|u| u.prompt_tokens)
                        .or(prompt_hint),
                    output_tokens: parsed
                        .usage
                        .as_ref()
                        .and_then(|u| u.completion_tokens)
                        .or_else(|| Some(estimate_tokens(&text))),
                };
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{ChatMessage, GenerationParams};

    fn backend(target: &str, stream: bool) -> OpenAiBackend {
        let config: BenchmarkConfig = serde_yaml::from_str(&format!(
            "target: {}\nmodel: test-model\nmax_requests: 1\nstream: {}",
            target, stream
        ))
        .unwrap();
        OpenAiBackend::from_config(&config, Clock::start()).unwrap()
    }

    #[tokio::test]
    async fn endpoint_urls_join_cleanly() {
        let b = backend("http://localhost:8000/", true);
        assert_eq!(
            b.endpoint_url(EndpointKind::Chat),
            "http://localhost:8000/v1/chat/completions"
        );
        assert_eq!(
            b.endpoint_url(EndpointKind::Text),
            "http://localhost:8000/v1/completions"
        );
    }

    #[tokio::test]
    async fn base_url_ending_in_v1_is_not_doubled() {
        let b = backend("http://localhost:8000/v1", true);
        assert_eq!(
            b.endpoint_url(EndpointKind::Chat),
            "http://localhost:8000/v1/chat/completions"
        );
        assert_eq!(b.url_for("/v1/models"), "http://localhost:8000/v1/models");
    }

    #[tokio::test]
    async fn chat_body_carries_messages_and_stream_options() {
        let b = backend("http://x", true);
        let payload = RequestPayload {
            endpoint: EndpointKind::Chat,
            prompt: None,
            messages: vec![ChatMessage::user("hello")],
            params: GenerationParams {
                max_tokens: Some(16),
                temperature: Some(0.5),
                stop: vec!["###".to_string()],
            },
            prompt_tokens_hint: None,
            dataset_index: None,
        };
        let body = b.build_body(&payload);
        assert_eq!(body["model"], "test-model");
        assert_eq!(body["messages"][0]["content"], "hello");
        assert_eq!(body["max_tokens"], 16);
        assert_eq!(body["temperature"], 0.5);
        assert_eq!(body["stop"][0], "###");
        assert_eq!(body["stream"], true);
        assert_eq!(body["stream_options"]["include_usage"], true);
    }

    #[tokio::test]
    async fn text_body_uses_prompt_and_omits_stream_when_disabled() {
        let b = backend("http://x", false);
        let payload = RequestPayload {
            endpoint: EndpointKind::Text,
            prompt: Some("complete me".to_string()),
            messages: Vec::new(),
            params: GenerationParams::default(),
            prompt_tokens_hint: None,
            dataset_index: None,
        };
        let body = b.build_body(&payload);
        assert_eq!(body["prompt"], "complete me");
        assert!(body.get("stream").is_none());
        assert!(body.get("messages").is_none());
    }

    #[test]
    fn detail_truncation_bounds_error_messages() {
        let long = "x".repeat(1000);
        let cut = truncate_detail(&long);
        assert!(cut.chars().count() <= 201);
        assert_eq!(truncate_detail("short"), "short");
    }
}
