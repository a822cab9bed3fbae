mod common;

use axum::http::StatusCode;
use serde_json::json;
use termrelay::chat::{SseDeltaDecoder, SseEvent};
use termrelay::config::InvokeMode;
use termrelay::model_client::ScriptedModelClient;
use termrelay_credentials::{CredentialChain, EnvironmentSource, StaticSource};

use common::{header_str, json, static_chain, TestApp};

const HELLO: &str = r#"{"messages":[{"role":"user","content":"hi"}]}"#;

fn frames(body: &[u8]) -> Vec<String> {
    String::from_utf8_lossy(body)
        .split("\n\n")
        .filter(|frame| !frame.is_empty())
        .map(str::to_string)
        .collect()
}

#[tokio::test]
async fn health_reports_the_service() {
    let app = TestApp::new(ScriptedModelClient::new(["x"]));
    let (status, _, body) = app.get("/health").await;
    assert_eq!(status, StatusCode::OK);

    let body = json(&body);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["service"], "termrelay");
    let timestamp = body["timestamp"].as_str().expect("timestamp");
    chrono::DateTime::parse_from_rfc3339(timestamp).expect("rfc3339 timestamp");
}

#[tokio::test]
async fn chat_streams_chunks_in_arrival_order() {
    let app = TestApp::new(ScriptedModelClient::new(["Hel", "lo, ", "world"]));
    let (status, headers, body) = app.post_chat("application/json", HELLO).await;

    assert_eq!(status, StatusCode::OK);
    assert!(header_str(&headers, "content-type").starts_with("text/event-stream"));
    assert_eq!(header_str(&headers, "cache-control"), "no-cache");
    assert_eq!(header_str(&headers, "x-accel-buffering"), "no");

    insta::assert_snapshot!(frames(&body).join("\n"), @r#"
    data: {"choices":[{"delta":{"content":"Hel"}}]}
    data: {"choices":[{"delta":{"content":"lo, "}}]}
    data: {"choices":[{"delta":{"content":"world"}}]}
    data: [DONE]
    "#);

    let mut decoder = SseDeltaDecoder::new();
    let events = decoder.push(&body);
    let text: String = events
        .iter()
        .filter_map(|event| match event {
            SseEvent::Delta(text) => Some(text.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(text, "Hello, world");
    assert_eq!(events.last(), Some(&SseEvent::Done));
}

#[tokio::test]
async fn chat_forwards_the_whole_conversation() {
    let app = TestApp::new(ScriptedModelClient::new(["ok"]));
    let body = json!({
        "messages": [
            { "role": "system", "content": "Be brief." },
            { "role": "user", "content": "hi" },
            { "role": "assistant", "content": "hello" },
            { "role": "user", "content": "again" }
        ]
    });
    let (status, _, _) = app.post_chat("application/json", &body.to_string()).await;
    assert_eq!(status, StatusCode::OK);

    let requests = app.client.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].system, vec!["Be brief.".to_string()]);
    let roles: Vec<_> = requests[0]
        .messages
        .iter()
        .map(|message| message.role.as_str())
        .collect();
    assert_eq!(roles, vec!["user", "assistant", "user"]);
    assert_eq!(requests[0].max_tokens, 1024);
}

#[tokio::test]
async fn upstream_failure_ends_the_stream_with_an_error_frame() {
    let app = TestApp::new(ScriptedModelClient::new(["a", "b"]).failing_after(1, "throttled"));
    let (status, _, body) = app.post_chat("application/json", HELLO).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        frames(&body),
        vec![
            r#"data: {"choices":[{"delta":{"content":"a"}}]}"#.to_string(),
            "data: [ERROR]".to_string(),
        ]
    );
}

#[tokio::test]
async fn chat_rejects_non_json_bodies() {
    let app = TestApp::new(ScriptedModelClient::new(["x"]));
    let (status, headers, body) = app.post_chat("text/plain", HELLO).await;
    assert_eq!(status, StatusCode::UNSUPPORTED_MEDIA_TYPE);
    assert!(header_str(&headers, "content-type").starts_with("application/json"));
    let problem = json(&body);
    assert_eq!(problem["type"], "urn:termrelay:error:unsupported_media_type");
    assert_eq!(problem["status"], 415);
    assert!(app.client.requests().is_empty());
}

#[tokio::test]
async fn chat_accepts_json_with_charset() {
    let app = TestApp::new(ScriptedModelClient::new(["x"]));
    let (status, _, _) = app
        .post_chat("application/json; charset=utf-8", HELLO)
        .await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn chat_rejects_malformed_and_empty_requests() {
    let app = TestApp::new(ScriptedModelClient::new(["x"]));

    let (status, _, body) = app.post_chat("application/json", "{not json").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json(&body)["type"], "urn:termrelay:error:invalid_request");

    let (status, _, body) = app
        .post_chat("application/json", r#"{"messages":[]}"#)
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json(&body)["detail"], "messages must not be empty");

    assert!(app.client.requests().is_empty());
}

#[tokio::test]
async fn credential_failure_is_reported_before_streaming() {
    let chain = CredentialChain::new()
        .with_source(StaticSource::new("AKIDREVOKED", "secret"))
        .with_source(EnvironmentSource::from_pairs(Vec::<(String, String)>::new()));
    let app = TestApp::with_chain(
        ScriptedModelClient::new(["x"]).rejecting("AKIDREVOKED"),
        chain,
        InvokeMode::ResponseStream,
    );

    let (status, _, body) = app.post_chat("application/json", HELLO).await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    let problem = json(&body);
    assert_eq!(problem["type"], "urn:termrelay:error:credential_resolution");
    let attempts = problem["details"]["attempts"].as_array().expect("attempts");
    let sources: Vec<_> = attempts
        .iter()
        .map(|attempt| attempt["source"].as_str().unwrap_or_default())
        .collect();
    assert_eq!(sources, vec!["static", "environment"]);
    assert!(app.client.requests().is_empty());
    assert!(app.state.relay().credentials().resolved().await.is_none());
}

#[tokio::test]
async fn credential_chain_falls_back_and_records_the_source() {
    let chain = CredentialChain::new()
        .with_source(StaticSource::new("AKIDREVOKED", "secret"))
        .with_source(EnvironmentSource::from_pairs([
            ("AWS_ACCESS_KEY_ID", "AKIDROLE"),
            ("AWS_SECRET_ACCESS_KEY", "role-secret"),
            ("AWS_SESSION_TOKEN", "token"),
        ]));
    let app = TestApp::with_chain(
        ScriptedModelClient::new(["x"]).rejecting("AKIDREVOKED"),
        chain,
        InvokeMode::ResponseStream,
    );

    for _ in 0..2 {
        let (status, _, _) = app.post_chat("application/json", HELLO).await;
        assert_eq!(status, StatusCode::OK);
    }

    let resolved = app
        .state
        .relay()
        .credentials()
        .resolved()
        .await
        .expect("credentials cached");
    assert_eq!(resolved.source, "environment");
    assert_eq!(resolved.access_key_id, "AKIDROLE");
    assert_eq!(resolved.session_token.as_deref(), Some("token"));
    assert_eq!(app.client.verify_calls(), 2);
    assert_eq!(app.client.requests().len(), 2);
}

#[tokio::test]
async fn buffered_mode_returns_the_same_frames_at_once() {
    let app = TestApp::with_chain(
        ScriptedModelClient::new(["Hel", "lo"]),
        static_chain(),
        InvokeMode::Buffered,
    );
    let (status, headers, body) = app.post_chat("application/json", HELLO).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(header_str(&headers, "content-type"), "text/event-stream");
    assert_eq!(header_str(&headers, "cache-control"), "no-cache");
    assert_eq!(
        String::from_utf8_lossy(&body),
        "data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n\n\
         data: {\"choices\":[{\"delta\":{\"content\":\"lo\"}}]}\n\n\
         data: [DONE]\n\n"
    );
}

#[tokio::test]
async fn script_endpoint_serves_the_configured_program() {
    let app = TestApp::new(ScriptedModelClient::new(["x"]));
    let (status, _, body) = app.get("/api/script").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(json(&body)["type"], "urn:termrelay:error:not_found");

    let app = TestApp::with_state(
        ScriptedModelClient::new(["x"]),
        static_chain(),
        InvokeMode::ResponseStream,
        |state| state.with_script("You are a pirate."),
    );
    let (status, headers, body) = app.get("/api/script").await;
    assert_eq!(status, StatusCode::OK);
    assert!(header_str(&headers, "content-type").starts_with("text/plain"));
    assert_eq!(&body[..], b"You are a pirate.");
}

#[tokio::test]
async fn unknown_routes_return_problem_details() {
    let app = TestApp::new(ScriptedModelClient::new(["x"]));
    let (status, _, body) = app.get("/v1/nothing").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let problem = json(&body);
    assert_eq!(problem["status"], 404);
    assert_eq!(problem["title"], "Not Found");
}

#[tokio::test]
async fn openapi_document_lists_the_routes() {
    let app = TestApp::new(ScriptedModelClient::new(["x"]));
    let (status, _, body) = app.get("/api/openapi.json").await;
    assert_eq!(status, StatusCode::OK);
    let doc = json(&body);
    assert!(doc["paths"]["/health"].is_object());
    assert!(doc["paths"]["/api/chat"]["post"].is_object());
    assert!(doc["paths"]["/api/script"]["get"].is_object());
    assert!(doc["components"]["schemas"]["ChatRequest"].is_object());
}
