//! HTTP surface tests: chat SSE flow, idempotent ingest, workspace files,
//! conversation reads, cancellation.
//!
//! The LLM side is a wiremock provider speaking the Chat Completions
//! dialect, so these run the real client/orchestrator/store path
//! end-to-end.

use axum::Router;
use axum_test::TestServer;
use orca::{AppState, ConversationStore, OrcaConfig, ProviderRegistry};
use serde_json::json;
use std::sync::Arc;
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const TEXT_ONLY_SSE: &str = concat!(
    "data: {\"choices\":[{\"delta\":{\"content\":\"Hello!\"},\"finish_reason\":null}]}\n\n",
    "data: {\"choices\":[{\"delta\":{},\"finish_reason\":\"stop\"}]}\n\n",
    "data: [DONE]\n\n",
);

async fn mock_provider_text_only() -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(TEXT_ONLY_SSE, "text/event-stream"))
        .mount(&server)
        .await;
    server
}

fn test_state(provider_base: &str) -> (TempDir, AppState) {
    std::env::set_var("ORCA_TEST_API_KEY", "sk-test");
    let raw = format!(
        r#"
        [server]
        heartbeat_secs = 15

        [providers.mock]
        type = "openai"
        api_key_env = "ORCA_TEST_API_KEY"
        api_base = "{provider_base}"

        [models.mock-model]
        provider = "mock"
        model = "mock-model"

        [agent]
        default_model = "mock-model"
        max_iterations = 5

        [tools]
        enabled = ["read_file", "write_file"]
    "#
    );
    let config: OrcaConfig = toml::from_str(&raw).unwrap();
    let tmp = TempDir::new().unwrap();
    let store = Arc::new(
        ConversationStore::new(tmp.path().join("data"), tmp.path().join("outputs")).unwrap(),
    );
    let http = reqwest::Client::new();
    let state = AppState {
        provider_registry: Arc::new(ProviderRegistry::from_config(&config, http.clone())),
        tool_registry: Arc::new(orca::tools::build_registry(&config, http).unwrap()),
        config: Arc::new(config),
        store,
        active_turns: Arc::new(parking_lot::Mutex::new(std::collections::HashMap::new())),
    };
    (tmp, state)
}

fn server(state: AppState) -> TestServer {
    let app = Router::new()
        .nest("/api", orca::api::routes::create_router())
        .with_state(state);
    TestServer::new(app).unwrap()
}

fn chat_body(client_msg_id: &str) -> serde_json::Value {
    json!({
        "conversation_id": "c1",
        "user": "alice",
        "content": "say hello",
        "client_msg_id": client_msg_id,
    })
}

/// Extract the data payload of a named SSE event from a response body.
fn sse_data(body: &str, event: &str) -> Option<serde_json::Value> {
    let mut lines = body.lines();
    while let Some(line) = lines.next() {
        if line == format!("event: {}", event) {
            let data = lines.next()?.strip_prefix("data: ")?;
            return serde_json::from_str(data).ok();
        }
    }
    None
}

#[tokio::test]
async fn test_chat_turn_streams_and_persists() {
    let provider = mock_provider_text_only().await;
    let (_tmp, state) = test_state(&provider.uri());
    let store = state.store.clone();
    let server = server(state);

    let response = server.post("/api/chat").json(&chat_body("m1")).await;
    response.assert_status_ok();
    let body = response.text();

    let first = sse_data(&body, "server_msg_id").expect("server_msg_id event");
    assert_eq!(first["conversation_id"], "c1");
    assert!(first["server_msg_id"].is_string());

    let done = sse_data(&body, "done").expect("done event");
    assert_eq!(done["status"], "completed");
    assert_eq!(done["final_content"], "Hello!");

    assert!(body.contains("event: text_delta"));

    let conversation = store.get("c1").unwrap();
    assert_eq!(conversation.messages.len(), 2);
    assert_eq!(conversation.messages[1].content, "Hello!");
}

#[tokio::test]
async fn test_chat_replay_is_idempotent() {
    let provider = mock_provider_text_only().await;
    let (_tmp, state) = test_state(&provider.uri());
    let store = state.store.clone();
    let server = server(state);

    let first = server.post("/api/chat").json(&chat_body("m1")).await;
    let first_id = sse_data(&first.text(), "server_msg_id").unwrap()["server_msg_id"]
        .as_str()
        .unwrap()
        .to_string();

    let second = server.post("/api/chat").json(&chat_body("m1")).await;
    second.assert_status_ok();
    let body = second.text();
    let replay_id = sse_data(&body, "server_msg_id").unwrap()["server_msg_id"]
        .as_str()
        .unwrap()
        .to_string();

    // Same server id, no new rows, no new provider call
    assert_eq!(first_id, replay_id);
    assert_eq!(store.get("c1").unwrap().messages.len(), 2);
    assert_eq!(provider.received_requests().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_chat_rejects_missing_ids() {
    let provider = mock_provider_text_only().await;
    let (_tmp, state) = test_state(&provider.uri());
    let server = server(state);

    let response = server
        .post("/api/chat")
        .json(&json!({
            "conversation_id": "",
            "user": "",
            "content": "x",
            "client_msg_id": "m1",
        }))
        .await;
    response.assert_status_bad_request();
}

#[tokio::test]
async fn test_outputs_listing_and_range_streaming() {
    let provider = mock_provider_text_only().await;
    let (_tmp, state) = test_state(&provider.uri());
    let store = state.store.clone();
    let server = server(state);

    let workdir = store.workdir("c-files").unwrap();
    std::fs::write(workdir.join("report.txt"), "0123456789").unwrap();

    let listing = server.get("/api/outputs/list/c-files").await;
    listing.assert_status_ok();
    let files = listing.json::<serde_json::Value>();
    assert_eq!(files["files"][0]["name"], "report.txt");
    assert_eq!(files["files"][0]["size"], 10);

    // Whole file
    let full = server.get("/api/stream/c-files/report.txt").await;
    full.assert_status_ok();
    assert_eq!(full.text(), "0123456789");
    assert_eq!(
        full.headers().get("content-disposition").unwrap(),
        "attachment"
    );

    // Byte range
    let partial = server
        .get("/api/stream/c-files/report.txt")
        .add_header(
            axum::http::header::RANGE,
            axum::http::HeaderValue::from_static("bytes=2-5"),
        )
        .await;
    assert_eq!(partial.status_code(), 206);
    assert_eq!(partial.text(), "2345");
    assert_eq!(
        partial.headers().get("content-range").unwrap(),
        "bytes 2-5/10"
    );

    // Overwrite in place: the endpoint serves the new bytes
    std::fs::write(workdir.join("report.txt"), "abcdefghij").unwrap();
    let after = server
        .get("/api/stream/c-files/report.txt")
        .add_header(
            axum::http::header::RANGE,
            axum::http::HeaderValue::from_static("bytes=0-3"),
        )
        .await;
    assert_eq!(after.text(), "abcd");

    // Unsatisfiable range
    let bad = server
        .get("/api/stream/c-files/report.txt")
        .add_header(
            axum::http::header::RANGE,
            axum::http::HeaderValue::from_static("bytes=50-"),
        )
        .await;
    assert_eq!(bad.status_code(), 416);

    // Traversal is refused
    let escape = server.get("/api/stream/c-files/..%2Fsecret.txt").await;
    assert_ne!(escape.status_code(), 200);
}

#[tokio::test]
async fn test_conversation_reads() {
    let provider = mock_provider_text_only().await;
    let (_tmp, state) = test_state(&provider.uri());
    let server = server(state);

    server.post("/api/chat").json(&chat_body("m1")).await;

    let listing = server.get("/api/conversations/alice").await;
    listing.assert_status_ok();
    let summaries = listing.json::<serde_json::Value>();
    assert_eq!(summaries.as_array().unwrap().len(), 1);
    assert_eq!(summaries[0]["conversation_id"], "c1");
    assert_eq!(summaries[0]["message_count"], 2);

    let details = server.get("/api/conversations/alice/c1").await;
    details.assert_status_ok();
    let body = details.json::<serde_json::Value>();
    assert_eq!(body["messages"].as_array().unwrap().len(), 2);
    assert_eq!(body["messages"][0]["role"], "user");
    assert_eq!(body["messages"][1]["role"], "assistant");

    // A different user cannot see it
    let other = server.get("/api/conversations/bob/c1").await;
    other.assert_status_not_found();
}

#[tokio::test]
async fn test_cancel_without_active_turn() {
    let provider = mock_provider_text_only().await;
    let (_tmp, state) = test_state(&provider.uri());
    let server = server(state);

    let response = server.post("/api/chat/c9/cancel").await;
    response.assert_status_ok();
    assert_eq!(response.json::<serde_json::Value>()["cancelled"], false);
}
