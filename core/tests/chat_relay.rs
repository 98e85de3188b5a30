#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::sync::Arc;

use elephie_core::ChatRelay;
use elephie_core::Message;
use elephie_core::RelayConfig;
use elephie_core::StaticToken;
use elephie_core::error::RelayErr;
use futures::StreamExt;
use pretty_assertions::assert_eq;
use reqwest::StatusCode;
use serde_json::json;
use wiremock::Mock;
use wiremock::MockServer;
use wiremock::ResponseTemplate;
use wiremock::matchers::header;
use wiremock::matchers::method;
use wiremock::matchers::path;

fn sse(frames: &[&str]) -> String {
    frames.iter().map(|f| format!("data: {f}\n\n")).collect()
}

fn delta(text: &str) -> String {
    json!({"choices": [{"delta": {"content": text}, "finish_reason": null}]}).to_string()
}

fn relay_config(server: &MockServer) -> RelayConfig {
    RelayConfig {
        endpoint_url: format!("{}/v1/chat/completions", server.uri()),
        system_prompt: "be brief".to_string(),
        max_tokens: 64,
        ..Default::default()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn relays_deltas_and_sends_expected_payload() {
    let server = MockServer::start().await;
    let body = sse(&[&delta("Hel"), &delta("lo"), "[DONE]"]);
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(header("authorization", "Bearer secret"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
        .expect(1)
        .mount(&server)
        .await;

    let relay = ChatRelay::new(
        relay_config(&server),
        Arc::new(StaticToken(Some("secret".to_string()))),
    );
    let mut stream = relay
        .open(&[Message::user("hi"), Message::assistant("hey"), Message::user("sup")])
        .await
        .unwrap();

    let mut text = String::new();
    while let Some(chunk) = stream.next().await {
        text.push_str(std::str::from_utf8(&chunk.unwrap()).unwrap());
    }
    assert_eq!(text, "Hello");

    let requests = server.received_requests().await.unwrap();
    let payload: serde_json::Value = requests[0].body_json().unwrap();
    assert_eq!(
        payload,
        json!({
            "messages": [
                {"role": "system", "content": "be brief"},
                {"role": "user", "content": "hi"},
                {"role": "assistant", "content": "hey"},
                {"role": "user", "content": "sup"},
            ],
            "max_tokens": 64,
            "stream": true,
        })
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn model_is_sent_when_configured() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(sse(&["[DONE]"]), "text/event-stream"))
        .mount(&server)
        .await;

    let config = RelayConfig {
        model: Some("local-llama".to_string()),
        ..relay_config(&server)
    };
    let relay = ChatRelay::new(config, Arc::new(StaticToken(None)));
    let stream = relay.open(&[Message::user("hi")]).await.unwrap();
    assert_eq!(stream.count().await, 0);

    let requests = server.received_requests().await.unwrap();
    assert!(!requests[0].headers.contains_key("authorization"));
    let payload: serde_json::Value = requests[0].body_json().unwrap();
    assert_eq!(payload["model"], "local-llama");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn upstream_rejection_is_reported_before_streaming() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(401).set_body_string("bad key"))
        .mount(&server)
        .await;

    let relay = ChatRelay::new(relay_config(&server), Arc::new(StaticToken(None)));
    let err = match relay.open(&[Message::user("hi")]).await {
        Ok(_) => panic!("expected rejection"),
        Err(e) => e,
    };

    match err {
        RelayErr::UpstreamRequest { status, body } => {
            assert_eq!(status, StatusCode::UNAUTHORIZED);
            assert_eq!(body, "bad key");
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn aborted_stream_ends_without_error() {
    let server = MockServer::start().await;
    let body = sse(&[&delta("a"), &delta("b"), &delta("c"), "[DONE]"]);
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
        .mount(&server)
        .await;

    let relay = ChatRelay::new(relay_config(&server), Arc::new(StaticToken(None)));
    let mut stream = relay.open(&[Message::user("hi")]).await.unwrap();

    let first = stream.next().await.unwrap().unwrap();
    assert_eq!(&first[..], b"a");

    stream.abort();
    assert!(stream.next().await.is_none());
}
