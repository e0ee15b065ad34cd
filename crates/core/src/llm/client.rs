//! OpenAI-compatible `/chat/completions` client, non-streaming and SSE.
//!
//! `data: `-line scanning, `[DONE]` terminator detection, and per-index
//! tool call argument accumulation, trimmed down to what the
//! orchestrator needs — a content delta plus completed tool calls —
//! rather than a full multi-provider response enum with usage metadata
//! and cross-provider stop-reason mapping.

use std::collections::HashMap;
use std::time::Duration;

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::chat::{ChatMessage, ChatRole, FunctionCall, Tool, ToolCall};

#[derive(Debug, Clone, thiserror::Error)]
pub enum LlmError {
    #[error("http error: {0}")]
    Http(String),
    #[error("malformed response json: {0}")]
    Json(String),
    #[error("stream protocol error: {0}")]
    Stream(String),
}

/// One increment of an assistant turn: some text, some tool call
/// fragments, or a terminal `finish_reason`.
#[derive(Debug, Clone, Default)]
pub struct Delta {
    pub content_delta: Option<String>,
    /// Only populated once a tool call's arguments are fully assembled
    /// (on `finish_reason == "tool_calls"`), rather than emitting partial
    /// JSON as fragments arrive.
    pub tool_calls: Option<Vec<ToolCall>>,
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Default)]
struct ToolCallBuffer {
    id: String,
    name: String,
    arguments: String,
    started: bool,
}

/// A message as it goes over the wire to an OpenAI-compatible endpoint —
/// deliberately narrower than [`ChatMessage`]: no `id`, `chat_id`,
/// `created_at`, and above all no `raw_content`, which must never leave
/// the process.
#[derive(Debug, Serialize)]
struct WireMessage {
    role: ChatRole,
    content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<ToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

impl From<&ChatMessage> for WireMessage {
    fn from(m: &ChatMessage) -> Self {
        WireMessage {
            role: m.role,
            content: m.content.as_llm_text(),
            tool_calls: m.tool_calls.clone(),
            tool_call_id: m.tool_call_id.clone(),
        }
    }
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<&'a [Tool]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<&'static str>,
}

#[derive(Debug, Deserialize)]
struct OpenAiChoiceDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<OpenAiDeltaToolCall>>,
}

#[derive(Debug, Deserialize)]
struct OpenAiDeltaToolCall {
    index: Option<usize>,
    id: Option<String>,
    function: OpenAiDeltaFunction,
}

#[derive(Debug, Default, Deserialize)]
struct OpenAiDeltaFunction {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: String,
}

#[derive(Debug, Deserialize)]
struct OpenAiStreamChoice {
    delta: OpenAiChoiceDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAiStreamChunk {
    choices: Vec<OpenAiStreamChoice>,
}

#[derive(Debug, Deserialize)]
struct OpenAiChatResponseChoice {
    message: OpenAiResponseMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAiResponseMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ToolCall>>,
}

#[derive(Debug, Deserialize)]
struct OpenAiChatResponse {
    choices: Vec<OpenAiChatResponseChoice>,
}

pub struct LlmClient {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

/// Default read timeout for LLM requests, overridable via `llm.timeoutSeconds`.
pub const DEFAULT_TIMEOUT_SECONDS: u64 = 360;

impl LlmClient {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> Result<Self, LlmError> {
        Self::with_timeout(base_url, api_key, DEFAULT_TIMEOUT_SECONDS)
    }

    pub fn with_timeout(
        base_url: impl Into<String>,
        api_key: Option<String>,
        timeout_seconds: u64,
    ) -> Result<Self, LlmError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_seconds))
            .build()
            .map_err(|e| LlmError::Http(e.to_string()))?;
        Ok(Self {
            http,
            base_url: base_url.into(),
            api_key,
        })
    }

    fn request(&self, body: Value) -> reqwest::RequestBuilder {
        let url = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));
        let mut req = self.http.post(url).json(&body);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }
        req
    }

    /// Non-streaming completion: POST with `stream:false`, return the
    /// single assistant delta in full.
    pub async fn complete(
        &self,
        model: &str,
        history: &[ChatMessage],
        tools: Option<&[Tool]>,
    ) -> Result<Delta, LlmError> {
        let body = build_request_body(model, history, tools, false);
        let resp = self
            .request(body)
            .send()
            .await
            .map_err(|e| LlmError::Http(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(LlmError::Http(format!("HTTP {status}: {text}")));
        }

        let parsed: OpenAiChatResponse = resp
            .json()
            .await
            .map_err(|e| LlmError::Json(e.to_string()))?;
        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| LlmError::Json("response had no choices".to_string()))?;

        Ok(Delta {
            content_delta: choice.message.content,
            tool_calls: choice.message.tool_calls,
            finish_reason: choice.finish_reason,
        })
    }

    /// Streaming completion: POST with `stream:true`, and push parsed
    /// [`Delta`]s to the returned stream as SSE chunks arrive.
    pub async fn complete_stream(
        &self,
        model: &str,
        history: &[ChatMessage],
        tools: Option<&[Tool]>,
    ) -> Result<ReceiverStream<Result<Delta, LlmError>>, LlmError> {
        let body = build_request_body(model, history, tools, true);
        let resp = self
            .request(body)
            .send()
            .await
            .map_err(|e| LlmError::Http(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(LlmError::Http(format!("HTTP {status}: {text}")));
        }

        let (tx, rx) = mpsc::channel(32);
        tokio::spawn(async move {
            let mut byte_stream = resp.bytes_stream();
            let mut line_buffer = String::new();
            let mut tool_states: HashMap<usize, ToolCallBuffer> = HashMap::new();
            let mut saw_finish_reason = false;

            while let Some(chunk) = byte_stream.next().await {
                let bytes = match chunk {
                    Ok(b) => b,
                    Err(e) => {
                        let _ = tx.send(Err(LlmError::Stream(e.to_string()))).await;
                        return;
                    }
                };
                line_buffer.push_str(&String::from_utf8_lossy(&bytes));

                while let Some(pos) = line_buffer.find('\n') {
                    let line = line_buffer[..pos].trim_end_matches('\r').to_string();
                    line_buffer.drain(..=pos);
                    if !process_sse_line(&line, &mut tool_states, &mut saw_finish_reason, &tx).await
                    {
                        return;
                    }
                }
            }
        });

        Ok(ReceiverStream::new(rx))
    }
}

/// Handles one SSE line. Returns `false` when the stream is done (either
/// `[DONE]` was seen or the channel receiver was dropped).
async fn process_sse_line(
    line: &str,
    tool_states: &mut HashMap<usize, ToolCallBuffer>,
    finished: &mut bool,
    tx: &mpsc::Sender<Result<Delta, LlmError>>,
) -> bool {
    let line = line.trim();
    if line.is_empty() {
        return true;
    }
    let Some(data) = line.strip_prefix("data: ") else {
        return true;
    };

    if data == "[DONE]" {
        // A real finish_reason chunk may already have been sent this
        // stream (e.g. "tool_calls" right before the server closes with
        // [DONE]). Don't clobber it with a synthesized "stop".
        if !*finished {
            let remaining = drain_completed_tool_calls(tool_states);
            if tx
                .send(Ok(Delta {
                    tool_calls: remaining,
                    finish_reason: Some("stop".to_string()),
                    ..Default::default()
                }))
                .await
                .is_err()
            {
                return false;
            }
        }
        return false;
    }

    let parsed: OpenAiStreamChunk = match serde_json::from_str(data) {
        Ok(p) => p,
        Err(e) => {
            let _ = tx.send(Err(LlmError::Json(e.to_string()))).await;
            return false;
        }
    };

    for choice in parsed.choices {
        if let Some(content) = choice.delta.content.filter(|c| !c.is_empty()) {
            if tx
                .send(Ok(Delta {
                    content_delta: Some(content),
                    ..Default::default()
                }))
                .await
                .is_err()
            {
                return false;
            }
        }

        if let Some(deltas) = choice.delta.tool_calls {
            for tc in deltas {
                let index = tc.index.unwrap_or(0);
                let state = tool_states.entry(index).or_default();
                if let Some(id) = tc.id {
                    state.id = id;
                }
                if let Some(name) = tc.function.name {
                    state.name = name;
                    state.started = true;
                }
                if !tc.function.arguments.is_empty() {
                    state.arguments.push_str(&tc.function.arguments);
                }
            }
        }

        if let Some(finish_reason) = choice.finish_reason {
            *finished = true;
            let completed = drain_completed_tool_calls(tool_states);
            if tx
                .send(Ok(Delta {
                    tool_calls: completed,
                    finish_reason: Some(finish_reason),
                    ..Default::default()
                }))
                .await
                .is_err()
            {
                return false;
            }
        }
    }

    true
}

fn drain_completed_tool_calls(
    tool_states: &mut HashMap<usize, ToolCallBuffer>,
) -> Option<Vec<ToolCall>> {
    let calls: Vec<ToolCall> = tool_states
        .drain()
        .filter(|(_, state)| state.started)
        .map(|(_, state)| ToolCall {
            id: state.id,
            call_type: "function".to_string(),
            function: FunctionCall {
                name: state.name,
                arguments: state.arguments,
            },
        })
        .collect();
    if calls.is_empty() {
        None
    } else {
        Some(calls)
    }
}

fn build_request_body(
    model: &str,
    history: &[ChatMessage],
    tools: Option<&[Tool]>,
    stream: bool,
) -> Value {
    let messages: Vec<WireMessage> = history.iter().map(WireMessage::from).collect();
    let tool_choice = tools.map(|_| "auto");
    serde_json::to_value(ChatCompletionRequest {
        model,
        messages,
        stream,
        tools,
        tool_choice,
    })
    .expect("ChatCompletionRequest always serializes")
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn wire_request_never_contains_raw_content_or_think_tags() {
        let mut msg = ChatMessage::user(Uuid::new_v4(), "hello");
        msg.raw_content = Some("<think>secret plan</think>hello".to_string());
        let body = build_request_body("gpt-4", &[msg], None, true);
        let serialized = body.to_string();
        assert!(!serialized.contains("raw_content"));
        assert!(!serialized.contains("<think>"));
    }

    #[test]
    fn tool_choice_is_present_only_when_tools_are_offered() {
        let msg = ChatMessage::user(Uuid::new_v4(), "hello");

        let without_tools = build_request_body("gpt-4", &[msg.clone()], None, true);
        assert!(!without_tools.to_string().contains("tool_choice"));

        let tools = vec![Tool {
            tool_type: "function".to_string(),
            function: crate::chat::FunctionTool {
                name: "search".to_string(),
                description: String::new(),
                parameters: serde_json::json!({"type": "object", "properties": {}}),
            },
        }];
        let with_tools = build_request_body("gpt-4", &[msg], Some(&tools), true);
        assert_eq!(with_tools["tool_choice"], serde_json::json!("auto"));
    }

    #[tokio::test]
    async fn accumulates_tool_call_arguments_across_fragments() {
        let mut states: HashMap<usize, ToolCallBuffer> = HashMap::new();
        let mut finished = false;
        let (tx, mut rx) = mpsc::channel(8);

        let chunk1 = r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"call_1","function":{"name":"search","arguments":""}}]}}]}"#;
        let chunk2 = r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"{\"q\":"}}]}}]}"#;
        let chunk3 = r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"\"rust\"}"}}]},"finish_reason":"tool_calls"}]}"#;

        for raw in [chunk1, chunk2, chunk3] {
            let line = format!("data: {raw}");
            assert!(process_sse_line(&line, &mut states, &mut finished, &tx).await);
        }

        let delta = rx.recv().await.unwrap().unwrap();
        let calls = delta.tool_calls.unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].function.name, "search");
        assert_eq!(calls[0].function.arguments, "{\"q\":\"rust\"}");
        assert_eq!(delta.finish_reason.as_deref(), Some("tool_calls"));
        assert!(finished);
    }

    #[tokio::test]
    async fn done_after_tool_calls_finish_does_not_clobber_finish_reason() {
        let mut states: HashMap<usize, ToolCallBuffer> = HashMap::new();
        let mut finished = false;
        let (tx, mut rx) = mpsc::channel(8);

        let chunk = r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"call_1","function":{"name":"search","arguments":"{}"}}]},"finish_reason":"tool_calls"}]}"#;
        assert!(process_sse_line(&format!("data: {chunk}"), &mut states, &mut finished, &tx).await);
        let delta = rx.recv().await.unwrap().unwrap();
        assert_eq!(delta.finish_reason.as_deref(), Some("tool_calls"));

        let more = process_sse_line("data: [DONE]", &mut states, &mut finished, &tx).await;
        assert!(!more);
        // [DONE] after a real finish_reason sends nothing further; the
        // "tool_calls" delta above must not be followed by a "stop" one.
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn done_marker_terminates_and_flushes_pending_tool_calls() {
        let mut states: HashMap<usize, ToolCallBuffer> = HashMap::new();
        states.insert(
            0,
            ToolCallBuffer {
                id: "call_1".into(),
                name: "search".into(),
                arguments: "{}".into(),
                started: true,
            },
        );
        let mut finished = false;
        let (tx, mut rx) = mpsc::channel(8);
        let more = process_sse_line("data: [DONE]", &mut states, &mut finished, &tx).await;
        assert!(!more);
        let delta = rx.recv().await.unwrap().unwrap();
        assert_eq!(delta.tool_calls.unwrap().len(), 1);
        assert!(states.is_empty());
    }
}
