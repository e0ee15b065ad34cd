//! Streaming orchestrator (C7): the assistant-turn loop tying the chat
//! store, tool registry, and LLM client together.
//!
//! The output is a cooperative `mpsc`-backed stream rather than an
//! `async-stream` generator, which keeps the tool-round loop as plain
//! `async fn` control flow instead of a `yield`-laden generator.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use uuid::Uuid;

use crate::chat::{ChatMessage, ChatRole, MessageContent, Tool, ToolCall};
use crate::error::to_stream_error_json;
use crate::filter::{filter_for_persistence_with_limit, DEFAULT_MAX_LENGTH};
use crate::llm::LlmClient;
use crate::mcp::{IntegrationRegistry, ToolSelection};
use crate::store::SharedChatStore;

pub const MAX_ROUNDS: u32 = 8;

pub struct Orchestrator {
    store: SharedChatStore,
    registry: Arc<IntegrationRegistry>,
    llm: Arc<LlmClient>,
    max_rounds: u32,
    content_max_length: usize,
    system_role: Option<String>,
}

impl Orchestrator {
    pub fn new(store: SharedChatStore, registry: Arc<IntegrationRegistry>, llm: Arc<LlmClient>) -> Self {
        Self::with_limits(store, registry, llm, MAX_ROUNDS, DEFAULT_MAX_LENGTH)
    }

    pub fn with_max_rounds(
        store: SharedChatStore,
        registry: Arc<IntegrationRegistry>,
        llm: Arc<LlmClient>,
        max_rounds: u32,
    ) -> Self {
        Self::with_limits(store, registry, llm, max_rounds, DEFAULT_MAX_LENGTH)
    }

    pub fn with_limits(
        store: SharedChatStore,
        registry: Arc<IntegrationRegistry>,
        llm: Arc<LlmClient>,
        max_rounds: u32,
        content_max_length: usize,
    ) -> Self {
        Self {
            store,
            registry,
            llm,
            max_rounds,
            content_max_length,
            system_role: None,
        }
    }

    /// Sets the text prepended as a `system` message ahead of history on
    /// every turn. Not persisted to the chat store — the store only ever
    /// holds user/assistant/tool turns.
    pub fn with_system_role(mut self, system_role: Option<String>) -> Self {
        self.system_role = system_role;
        self
    }

    /// Streams one assistant turn as NDJSON-ready text chunks. The user
    /// message is assumed already persisted by the caller (the HTTP
    /// facade).
    pub fn stream_assistant_turn(
        self: Arc<Self>,
        chat_id: Uuid,
        model: String,
        tool_selection: ToolSelection,
    ) -> ReceiverStream<String> {
        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            if let Err(err) = self.run_turn(chat_id, &model, &tool_selection, &tx).await {
                let _ = tx.send(to_stream_error_json(&err).to_string()).await;
            }
        });
        ReceiverStream::new(rx)
    }

    async fn run_turn(
        &self,
        chat_id: Uuid,
        model: &str,
        tool_selection: &ToolSelection,
        tx: &mpsc::Sender<String>,
    ) -> Result<(), crate::error::AgentError> {
        let mut history = self.store.get_messages(chat_id).await?;
        if let Some(text) = &self.system_role {
            history.insert(
                0,
                ChatMessage {
                    id: Uuid::new_v4(),
                    chat_id,
                    role: ChatRole::System,
                    content: MessageContent::Text(text.clone()),
                    raw_content: None,
                    tool_calls: None,
                    tool_call_id: None,
                    created_at: chrono::Utc::now(),
                },
            );
        }
        let tools: Vec<Tool> = self
            .registry
            .tools_for(tool_selection)
            .await
            .iter()
            .map(Tool::from_descriptor)
            .collect();
        let tools_opt = if tools.is_empty() { None } else { Some(tools.as_slice()) };

        let mut raw_accumulated = String::new();
        let mut round = 0u32;

        loop {
            let mut stream = self.llm.complete_stream(model, &history, tools_opt).await?;
            let mut round_tool_calls: Option<Vec<ToolCall>> = None;

            while let Some(delta) = stream.next().await {
                let delta = delta?;
                if let Some(text) = delta.content_delta {
                    raw_accumulated.push_str(&text);
                    if tx.send(text).await.is_err() {
                        return Ok(());
                    }
                }
                if delta.tool_calls.is_some() {
                    round_tool_calls = delta.tool_calls;
                }
            }

            // A provider may end the stream with assembled tool-call
            // fragments but without ever sending an explicit
            // `finish_reason: "tool_calls"` chunk (the SSE client
            // synthesizes a "stop" fallback on a bare `[DONE]`). Whether
            // assembled tool calls exist is what decides the branch, not
            // the literal finish_reason string.
            let Some(calls) = round_tool_calls else {
                return self.finalize(chat_id, &raw_accumulated, tx).await;
            };

            round += 1;
            if round > self.max_rounds {
                let _ = tx
                    .send(r#"{"error":"tool-call rounds exceeded"}"#.to_string())
                    .await;
                return Ok(());
            }

            history.push(ChatMessage {
                id: Uuid::new_v4(),
                chat_id,
                role: ChatRole::Assistant,
                content: MessageContent::Text(String::new()),
                raw_content: None,
                tool_calls: Some(calls.clone()),
                tool_call_id: None,
                created_at: chrono::Utc::now(),
            });

            for call in &calls {
                if tx
                    .send(format!("[Calling tool: {}]", call.function.name))
                    .await
                    .is_err()
                {
                    return Ok(());
                }

                let args: Value = serde_json::from_str(&call.function.arguments)
                    .unwrap_or(Value::Object(Default::default()));
                let (content, status_chunk) =
                    match self.registry.execute_tool_call(&call.function.name, args).await {
                        Ok(result) if !result.is_error => {
                            (result.content, "[Tool result]".to_string())
                        }
                        Ok(result) => (
                            result.content.clone(),
                            format!("[Tool execution failed: {}]", result.content),
                        ),
                        Err(e) => (
                            e.to_string(),
                            format!("[Tool execution failed: {e}]"),
                        ),
                    };

                if tx.send(status_chunk).await.is_err() {
                    return Ok(());
                }

                history.push(ChatMessage {
                    id: Uuid::new_v4(),
                    chat_id,
                    role: ChatRole::Tool,
                    content: MessageContent::Text(content),
                    raw_content: None,
                    tool_calls: None,
                    tool_call_id: Some(call.id.clone()),
                    created_at: chrono::Utc::now(),
                });
            }

            // Next loop iteration reopens the LLM stream with the
            // extended history.
        }
    }

    async fn finalize(
        &self,
        chat_id: Uuid,
        raw_accumulated: &str,
        tx: &mpsc::Sender<String>,
    ) -> Result<(), crate::error::AgentError> {
        let filtered = filter_for_persistence_with_limit(raw_accumulated, self.content_max_length)?;

        if !raw_accumulated.is_empty() && filtered.is_empty() {
            let _ = tx
                .send(to_stream_error_json(&crate::error::AgentError::EmptyAfterFilter).to_string())
                .await;
            return Ok(());
        }

        let mut message = ChatMessage {
            id: Uuid::new_v4(),
            chat_id,
            role: ChatRole::Assistant,
            content: MessageContent::Text(filtered.clone()),
            raw_content: None,
            tool_calls: None,
            tool_call_id: None,
            created_at: chrono::Utc::now(),
        };
        if filtered != raw_accumulated {
            message.raw_content = Some(raw_accumulated.to_string());
        }
        self.store.append(message).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn max_rounds_is_eight_per_the_proposed_default() {
        assert_eq!(MAX_ROUNDS, 8);
    }
}
