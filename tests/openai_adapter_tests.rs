//! HTTP-level adapter tests against a mock OpenAI-compatible server.

use futures_util::StreamExt;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use inferbench::backend::{Backend, StreamEvent};
use inferbench::clock::Clock;
use inferbench::config::BenchmarkConfig;
use inferbench::errors::{BenchError, RequestErrorKind};
use inferbench::openai::OpenAiBackend;
use inferbench::request::{ChatMessage, EndpointKind, GenerationParams, RequestPayload};

fn config(target: &str, stream: bool) -> BenchmarkConfig {
    let config: BenchmarkConfig = serde_yaml::from_str(&format!(
        r#"
target: "{}"
model: test-model
max_requests: 1
stream: {}
"#,
        target, stream
    ))
    .unwrap();
    config
}

fn chat_payload() -> RequestPayload {
    RequestPayload {
        endpoint: EndpointKind::Chat,
        prompt: None,
        messages: vec![ChatMessage::user("hello")],
        params: GenerationParams {
            max_tokens: Some(8),
            temperature: None,
            stop: Vec::new(),
        },
        prompt_tokens_hint: Some(1),
        dataset_index: None,
    }
}

async fn collect_events(backend: &OpenAiBackend, payload: RequestPayload) -> Vec<StreamEvent> {
    let clock = Clock::start();
    let deadline = clock.now_ns() + 10_000_000_000;
    backend.execute(payload, deadline).collect().await
}

#[tokio::test]
async fn probe_accepts_a_served_model() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/models"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(
            r#"{"object":"list","data":[{"id":"test-model","object":"model"}]}"#,
            "application/json",
        ))
        .mount(&server)
        .await;

    let backend = OpenAiBackend::from_config(&config(&server.uri(), true), Clock::start()).unwrap();
    backend.probe().await.unwrap();
}

#[tokio::test]
async fn probe_rejects_a_missing_model() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/models"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(
            r#"{"object":"list","data":[{"id":"some-other-model","object":"model"}]}"#,
            "application/json",
        ))
        .mount(&server)
        .await;

    let backend = OpenAiBackend::from_config(&config(&server.uri(), true), Clock::start()).unwrap();
    let result = backend.probe().await;
    assert!(matches!(result, Err(BenchError::BackendUnreachable(msg)) if msg.contains("test-model")));
}

#[tokio::test]
async fn probe_rejects_an_erroring_server() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/models"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let backend = OpenAiBackend::from_config(&config(&server.uri(), true), Clock::start()).unwrap();
    assert!(matches!(
        backend.probe().await,
        Err(BenchError::BackendUnreachable(_))
    ));
}

#[tokio::test]
async fn streaming_chat_parses_tokens_and_usage() {
    let server = MockServer::start().await;
    let sse_body = concat!(
        "data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n\n",
        "data: {\"choices\":[{\"delta\":{\"content\":\"lo\"}}]}\n\n",
        "data: {\"choices\":[],\"usage\":{\"prompt_tokens\":5,\"completion_tokens\":2}}\n\n",
        "data: [DONE]\n\n",
    );
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(body_partial_json(serde_json::json!({
            "model": "test-model",
            "stream": true,
        })))
        .respond_with(ResponseTemplate::new(200).set_body_raw(sse_body, "text/event-stream"))
        .mount(&server)
        .await;

    let backend = OpenAiBackend::from_config(&config(&server.uri(), true), Clock::start()).unwrap();
    let events = collect_events(&backend, chat_payload()).await;

    assert!(matches!(events[0], StreamEvent::FirstByte { .. }));
    let tokens: Vec<&str> = events
        .iter()
        .filter_map(|e| match e {
            StreamEvent::Token { text, .. } => Some(text.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(tokens, vec!["Hel", "lo"]);
    match events.last().unwrap() {
        StreamEvent::Done {
            prompt_tokens,
            output_tokens,
            ..
        } => {
            assert_eq!(*prompt_tokens, Some(5));
            assert_eq!(*output_tokens, Some(2));
        }
        other => panic!("expected Done, got {:?}", other),
    }
}

#[tokio::test]
async fn streaming_text_endpoint_reads_the_text_field() {
    let server = MockServer::start().await;
    let sse_body = concat!(
        "data: {\"choices\":[{\"text\":\"once\"}]}\n\n",
        "data: {\"choices\":[{\"text\":\" upon\"}]}\n\n",
        "data: [DONE]\n\n",
    );
    Mock::given(method("POST"))
        .and(path("/v1/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(sse_body, "text/event-stream"))
        .mount(&server)
        .await;

    let backend = OpenAiBackend::from_config(&config(&server.uri(), true), Clock::start()).unwrap();
    let payload = RequestPayload {
        endpoint: EndpointKind::Text,
        prompt: Some("story".to_string()),
        messages: Vec::new(),
        params: GenerationParams::default(),
        prompt_tokens_hint: Some(1),
        dataset_index: None,
    };
    let events = collect_events(&backend, payload).await;

    let tokens: Vec<&str> = events
        .iter()
        .filter_map(|e| match e {
            StreamEvent::Token { text, .. } => Some(text.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(tokens, vec!["once", " upon"]);
    // No usage chunk: the streamed count stands in.
    match events.last().unwrap() {
        StreamEvent::Done { output_tokens, .. } => assert_eq!(*output_tokens, Some(2)),
        other => panic!("expected Done, got {:?}", other),
    }
}

#[tokio::test]
async fn non_streaming_response_yields_first_byte_then_done() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(
            r#"{"choices":[{"message":{"role":"assistant","content":"hello there"}}],"usage":{"prompt_tokens":4,"completion_tokens":3}}"#,
            "application/json",
        ))
        .mount(&server)
        .await;

    let backend = OpenAiBackend::from_config(&config(&server.uri(), false), Clock::start()).unwrap();
    let events = collect_events(&backend, chat_payload()).await;

    assert_eq!(events.len(), 2);
    assert!(matches!(events[0], StreamEvent::FirstByte { .. }));
    match &events[1] {
        StreamEvent::Done {
            prompt_tokens,
            output_tokens,
            ..
        } => {
            assert_eq!(*prompt_tokens, Some(4));
            assert_eq!(*output_tokens, Some(3));
        }
        other => panic!("expected Done, got {:?}", other),
    }
}

#[tokio::test]
async fn http_error_status_maps_to_http_status_kind() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(500).set_body_string("upstream exploded"))
        .mount(&server)
        .await;

    let backend = OpenAiBackend::from_config(&config(&server.uri(), true), Clock::start()).unwrap();
    let events = collect_events(&backend, chat_payload()).await;

    assert_eq!(events.len(), 1);
    match &events[0] {
        StreamEvent::Error { kind, message, .. } => {
            assert_eq!(*kind, RequestErrorKind::HttpStatus);
            assert!(message.contains("500"));
            assert!(message.contains("upstream exploded"));
        }
        other => panic!("expected Error, got {:?}", other),
    }
}

#[tokio::test]
async fn malformed_sse_chunk_maps_to_decode_kind() {
    let server = MockServer::start().await;
    let sse_body = "data: {not json at all\n\ndata: [DONE]\n\n";
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(sse_body, "text/event-stream"))
        .mount(&server)
        .await;

    let backend = OpenAiBackend::from_config(&config(&server.uri(), true), Clock::start()).unwrap();
    let events = collect_events(&backend, chat_payload()).await;

    match events.last().unwrap() {
        StreamEvent::Error { kind, .. } => assert_eq!(*kind, RequestErrorKind::Decode),
        other => panic!("expected Error, got {:?}", other),
    }
}

#[tokio::test]
async fn connection_refused_maps_to_connect_kind() {
    // Nothing listens on this port.
    let backend =
        OpenAiBackend::from_config(&config("http://127.0.0.1:9", true), Clock::start()).unwrap();
    let events = collect_events(&backend, chat_payload()).await;

    assert_eq!(events.len(), 1);
    match &events[0] {
        StreamEvent::Error { kind, .. } => {
            assert!(matches!(
                kind,
                RequestErrorKind::Connect | RequestErrorKind::Timeout
            ));
        }
        other => panic!("expected Error, got {:?}", other),
    }
}

#[tokio::test]
async fn api_key_and_extra_headers_are_sent() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(header("authorization", "Bearer sk-test"))
        .and(header("x-benchmark", "inferbench"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(
            "data: [DONE]\n\n",
            "text/event-stream",
        ))
        .mount(&server)
        .await;

    let mut cfg = config(&server.uri(), true);
    cfg.api_key = Some("sk-test".to_string());
    cfg.extra_headers = Some("X-Benchmark:inferbench".to_string());
    let backend = OpenAiBackend::from_config(&cfg, Clock::start()).unwrap();

    let events = collect_events(&backend, chat_payload()).await;
    // The matcher only responds when the headers are present; reaching Done
    // proves they were sent.
    assert!(matches!(events.last().unwrap(), StreamEvent::Done { .. }));
}
