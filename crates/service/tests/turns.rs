//! End-to-end coverage of the NDJSON turn endpoint: a real axum server
//! bound to a loopback port, talking to `wiremock`-mocked LLM and MCP
//! backends over actual HTTP rather than calling handler functions
//! directly.

use std::sync::Arc;

use agent_service::{build_router, AppState};
use agentcore::auth::TokenCache;
use agentcore::mcp::{IntegrationRegistry, McpServerConfig, RawAuthConfig};
use agentcore::store::{ChatStore, InMemoryChatStore, SharedChatStore};
use agentcore::{llm::LlmClient, Orchestrator};
use serde_json::{json, Value};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, ResponseTemplate};

/// Matches a JSON-RPC/chat-completions request whose raw body contains
/// `needle` — used to tell `initialize` apart from `tools/list` apart
/// from `tools/call` on the single `/mcp` POST endpoint, and a
/// tool-round-trip's second completion request (which carries a `tool`
/// role message) apart from its first.
struct BodyContains(&'static str);

impl wiremock::Match for BodyContains {
    fn matches(&self, request: &Request) -> bool {
        String::from_utf8_lossy(&request.body).contains(self.0)
    }
}

fn sse_body(chunks: &[Value], done: bool) -> String {
    let mut body = String::new();
    for chunk in chunks {
        body.push_str("data: ");
        body.push_str(&chunk.to_string());
        body.push('\n');
    }
    if done {
        body.push_str("data: [DONE]\n");
    }
    body
}

fn sse_response(body: String) -> ResponseTemplate {
    ResponseTemplate::new(200)
        .insert_header("content-type", "text/event-stream")
        .set_body_raw(body, "text/event-stream")
}

async fn spawn_service(state: AppState) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind loopback");
    let addr = listener.local_addr().expect("local addr");
    let app = build_router(state);
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("server exited");
    });
    format!("http://{addr}")
}

async fn harness(llm: &MockServer) -> (AppState, SharedChatStore) {
    let store: SharedChatStore = Arc::new(InMemoryChatStore::new());
    let auth_cache = Arc::new(TokenCache::new());
    let registry = Arc::new(IntegrationRegistry::new(vec![], auth_cache).expect("registry"));
    let client = Arc::new(LlmClient::new(llm.uri(), None).expect("llm client"));
    let orchestrator = Arc::new(Orchestrator::new(store.clone(), registry, client));
    (
        AppState {
            store: store.clone(),
            orchestrator,
            default_model: "test-model".to_string(),
        },
        store,
    )
}

#[tokio::test]
async fn plain_text_turn_streams_and_persists() {
    let llm = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(sse_response(sse_body(
            &[
                json!({"choices":[{"delta":{"content":"Hello, "}}]}),
                json!({"choices":[{"delta":{"content":"world."},"finish_reason":"stop"}]}),
            ],
            true,
        )))
        .mount(&llm)
        .await;

    let (state, store) = harness(&llm).await;
    let chat_id = uuid::Uuid::new_v4();
    let base = spawn_service(state).await;

    let client = reqwest::Client::new();
    let resp = client
        .post(format!("{base}/v1/turns"))
        .json(&json!({"chat_id": chat_id, "message": "hi there"}))
        .send()
        .await
        .expect("request succeeds");
    assert_eq!(resp.status(), reqwest::StatusCode::OK);
    assert_eq!(
        resp.headers().get("content-type").unwrap(),
        "application/x-ndjson"
    );

    let body = resp.text().await.expect("read body");
    let lines: Vec<&str> = body.lines().filter(|l| !l.is_empty()).collect();
    assert!(!lines.is_empty());
    for line in &lines {
        serde_json::from_str::<Value>(line).expect("every NDJSON line is valid JSON");
    }

    let messages = store.get_messages(chat_id).await.expect("get messages");
    assert_eq!(messages.len(), 2, "user message plus assistant reply");
    assert_eq!(
        messages[1].content.as_llm_text(),
        "Hello, world.".to_string()
    );
}

#[tokio::test]
async fn configured_system_role_is_sent_ahead_of_history() {
    let llm = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(BodyContains("\"role\":\"system\""))
        .and(BodyContains("answer tersely"))
        .respond_with(sse_response(sse_body(
            &[json!({"choices":[{"delta":{"content":"ok"},"finish_reason":"stop"}]})],
            true,
        )))
        .mount(&llm)
        .await;

    let store: SharedChatStore = Arc::new(InMemoryChatStore::new());
    let auth_cache = Arc::new(TokenCache::new());
    let registry = Arc::new(IntegrationRegistry::new(vec![], auth_cache).expect("registry"));
    let client = Arc::new(LlmClient::new(llm.uri(), None).expect("llm client"));
    let orchestrator = Arc::new(
        Orchestrator::new(store.clone(), registry, client)
            .with_system_role(Some("answer tersely".to_string())),
    );
    let state = AppState {
        store: store.clone(),
        orchestrator,
        default_model: "test-model".to_string(),
    };

    let chat_id = uuid::Uuid::new_v4();
    let base = spawn_service(state).await;
    let http = reqwest::Client::new();
    let resp = http
        .post(format!("{base}/v1/turns"))
        .json(&json!({"chat_id": chat_id, "message": "hi"}))
        .send()
        .await
        .expect("request succeeds");
    assert_eq!(resp.status(), reqwest::StatusCode::OK);

    // The system role is injected fresh every turn, not persisted as a
    // chat message.
    let messages = store.get_messages(chat_id).await.expect("get messages");
    assert!(messages.iter().all(|m| !matches!(m.role, agentcore::chat::ChatRole::System)));
}

#[tokio::test]
async fn think_tags_stream_raw_but_are_filtered_from_persistence() {
    let llm = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(sse_response(sse_body(
            &[
                json!({"choices":[{"delta":{"content":"<think>plan the answer</think>"}}]}),
                json!({"choices":[{"delta":{"content":"42"},"finish_reason":"stop"}]}),
            ],
            true,
        )))
        .mount(&llm)
        .await;

    let (state, store) = harness(&llm).await;
    let chat_id = uuid::Uuid::new_v4();
    let base = spawn_service(state).await;

    let client = reqwest::Client::new();
    let resp = client
        .post(format!("{base}/v1/turns"))
        .json(&json!({"chat_id": chat_id, "message": "what is the answer"}))
        .send()
        .await
        .expect("request succeeds");
    let body = resp.text().await.expect("read body");
    assert!(
        body.contains("plan the answer"),
        "raw stream still carries the think-tag content: {body}"
    );

    let messages = store.get_messages(chat_id).await.expect("get messages");
    let assistant = &messages[1];
    assert_eq!(assistant.content.as_llm_text(), "42");
    assert_eq!(
        assistant.raw_content.as_deref(),
        Some("<think>plan the answer</think>42")
    );
}

#[tokio::test]
async fn tool_round_trip_executes_and_returns_final_answer() {
    let llm = MockServer::start().await;
    let mcp = MockServer::start().await;

    // initialize
    Mock::given(method("POST"))
        .and(path("/mcp"))
        .and(BodyContains("\"method\":\"initialize\""))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("Mcp-Session-Id", "test-session")
                .set_body_json(json!({"jsonrpc":"2.0","id":"init-1","result":{}})),
        )
        .mount(&mcp)
        .await;
    // notifications/initialized — best-effort, response body unused.
    Mock::given(method("POST"))
        .and(path("/mcp"))
        .and(BodyContains("notifications/initialized"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .mount(&mcp)
        .await;
    // tools/list — hit once by the session probe, once by discovery.
    Mock::given(method("POST"))
        .and(path("/mcp"))
        .and(BodyContains("\"method\":\"tools/list\""))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "jsonrpc":"2.0",
            "id":"discover-1",
            "result":{"tools":[{"name":"search","description":"Web search","inputSchema":{"type":"object","properties":{}}}]},
        })))
        .mount(&mcp)
        .await;
    // tools/call
    Mock::given(method("POST"))
        .and(path("/mcp"))
        .and(BodyContains("\"method\":\"tools/call\""))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "jsonrpc":"2.0",
            "id":"call-search",
            "result":{"content":[{"type":"text","text":"rust is a systems language"}],"isError":false},
        })))
        .mount(&mcp)
        .await;

    // First completion: model asks to call `search`.
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(sse_response(sse_body(
            &[json!({"choices":[{"delta":{"tool_calls":[{"index":0,"id":"call_1","function":{"name":"search","arguments":"{}"}}]},"finish_reason":"tool_calls"}]})],
            true,
        )))
        .up_to_n_times(1)
        .mount(&llm)
        .await;
    // Second completion, made with the tool result folded into history.
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(sse_response(sse_body(
            &[json!({"choices":[{"delta":{"content":"Rust is a systems language."},"finish_reason":"stop"}]})],
            true,
        )))
        .mount(&llm)
        .await;

    let store: SharedChatStore = Arc::new(InMemoryChatStore::new());
    let auth_cache = Arc::new(TokenCache::new());
    let server_config = McpServerConfig {
        name: "search-server".to_string(),
        base_url: mcp.uri(),
        auth: RawAuthConfig::None,
        is_webcrawl_variant: Some(false),
    };
    let registry = Arc::new(
        IntegrationRegistry::new(vec![server_config], auth_cache).expect("registry"),
    );
    registry.refresh().await;
    let client = Arc::new(LlmClient::new(llm.uri(), None).expect("llm client"));
    let orchestrator = Arc::new(Orchestrator::new(store.clone(), registry, client));
    let state = AppState {
        store: store.clone(),
        orchestrator,
        default_model: "test-model".to_string(),
    };

    let chat_id = uuid::Uuid::new_v4();
    let base = spawn_service(state).await;
    let http = reqwest::Client::new();
    let resp = http
        .post(format!("{base}/v1/turns"))
        .json(&json!({"chat_id": chat_id, "message": "tell me about rust"}))
        .send()
        .await
        .expect("request succeeds");
    let body = resp.text().await.expect("read body");
    assert!(body.contains("Calling tool: search"), "body: {body}");
    assert!(body.contains("Tool result"), "body: {body}");

    let messages = store.get_messages(chat_id).await.expect("get messages");
    let final_message = messages.last().expect("at least one message");
    assert_eq!(
        final_message.content.as_llm_text(),
        "Rust is a systems language."
    );
}

#[tokio::test]
async fn empty_after_filter_turn_emits_terminal_error_and_nothing_is_persisted() {
    let llm = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(sse_response(sse_body(
            &[json!({"choices":[{"delta":{"content":"<think>only hidden reasoning</think>"},"finish_reason":"stop"}]})],
            true,
        )))
        .mount(&llm)
        .await;

    let (state, store) = harness(&llm).await;
    let chat_id = uuid::Uuid::new_v4();
    let base = spawn_service(state).await;

    let client = reqwest::Client::new();
    let resp = client
        .post(format!("{base}/v1/turns"))
        .json(&json!({"chat_id": chat_id, "message": "think quietly"}))
        .send()
        .await
        .expect("request succeeds");
    let body = resp.text().await.expect("read body");
    assert!(
        body.contains("\"error\""),
        "expected a terminal error line, got: {body}"
    );

    let messages = store.get_messages(chat_id).await.expect("get messages");
    assert_eq!(messages.len(), 1, "only the user message was persisted");
}

#[tokio::test]
async fn empty_message_is_rejected_before_touching_the_llm() {
    let llm = MockServer::start().await;
    // No mock mounted: if the facade called the LLM, this would 404 the
    // handshake assumptions baked into LlmClient and fail loudly enough
    // to notice, but validation should reject the request first anyway.
    let (state, _store) = harness(&llm).await;
    let base = spawn_service(state).await;

    let client = reqwest::Client::new();
    let resp = client
        .post(format!("{base}/v1/turns"))
        .json(&json!({"message": "   "}))
        .send()
        .await
        .expect("request succeeds");
    assert_eq!(resp.status(), reqwest::StatusCode::BAD_REQUEST);
}
