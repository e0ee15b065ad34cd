//! Conversation data model.
//!
//! Provider-agnostic messages (`ChatRole`, `MessageType`, `ChatMessage`),
//! narrowed to what the orchestrator and the LLM client need: a
//! persisted/raw content split instead of a provider-specific response
//! wrapper.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Role of a participant in a chat conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    User,
    Assistant,
    System,
    Tool,
}

/// One block of a multimodal user message.
///
/// An ordered sequence of these forms a single user message; size/type
/// validation of the underlying bytes is a collaborator's concern (the
/// HTTP facade), not this crate's.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text { text: String },
    ImageUrl { image_url: String },
}

/// The persisted form of a message's content: either plain text (the
/// common case) or an ordered sequence of multimodal blocks.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Multimodal(Vec<ContentBlock>),
}

impl MessageContent {
    /// Flattens to the text the LLM wire format actually sends: multimodal
    /// text blocks are joined, image blocks contribute nothing (a real
    /// OpenAI-compatible request would embed them as separate content
    /// parts — out of scope for the core streaming loop).
    pub fn as_llm_text(&self) -> String {
        match self {
            MessageContent::Text(t) => t.clone(),
            MessageContent::Multimodal(blocks) => blocks
                .iter()
                .filter_map(|b| match b {
                    ContentBlock::Text { text } => Some(text.as_str()),
                    ContentBlock::ImageUrl { .. } => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            MessageContent::Text(t) => t.is_empty(),
            MessageContent::Multimodal(blocks) => blocks.is_empty(),
        }
    }
}

impl From<String> for MessageContent {
    fn from(s: String) -> Self {
        MessageContent::Text(s)
    }
}

impl From<&str> for MessageContent {
    fn from(s: &str) -> Self {
        MessageContent::Text(s.to_string())
    }
}

/// A single message in a chat conversation.
///
/// Invariant: `raw_content` is `Some` only when it differs from `content`
/// (i.e. only when the content filter actually removed something); the LLM
/// request payload built from these messages must never serialize
/// `raw_content`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: Uuid,
    pub chat_id: Uuid,
    pub role: ChatRole,
    pub content: MessageContent,
    /// Present iff filtering removed something from the raw stream.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_content: Option<String>,
    /// Present for assistant messages that carried tool calls (empty
    /// textual content, tool_calls array serialized alongside).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    /// Present for `role = tool` messages: which call this is a result of.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl ChatMessage {
    pub fn user(chat_id: Uuid, content: impl Into<MessageContent>) -> Self {
        Self {
            id: Uuid::new_v4(),
            chat_id,
            role: ChatRole::User,
            content: content.into(),
            raw_content: None,
            tool_calls: None,
            tool_call_id: None,
            created_at: Utc::now(),
        }
    }
}

/// A JSON-Schema-described tool the LLM may call, in OpenAI function
/// schema (`{"type":"function","function":{name,description,parameters}}`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tool {
    #[serde(rename = "type")]
    pub tool_type: String,
    pub function: FunctionTool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionTool {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

impl Tool {
    pub fn from_descriptor(d: &crate::mcp::ToolDescriptor) -> Self {
        Tool {
            tool_type: "function".to_string(),
            function: FunctionTool {
                name: d.name.clone(),
                description: d.description.clone(),
                parameters: d.input_schema.clone(),
            },
        }
    }
}

/// A tool call requested by the LLM. IDs are opaque strings assigned by
/// the LLM and must round-trip unchanged back to it in the matching
/// `tool` message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ToolCall {
    pub id: String,
    #[serde(rename = "type")]
    pub call_type: String,
    pub function: FunctionCall,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FunctionCall {
    pub name: String,
    pub arguments: String,
}

/// Result of invoking a tool, ready to be folded back into the
/// conversation as a `role = tool` message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    pub id: String,
    pub content: String,
    pub is_error: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn multimodal_text_blocks_join_with_newlines() {
        let content = MessageContent::Multimodal(vec![
            ContentBlock::Text {
                text: "first".into(),
            },
            ContentBlock::ImageUrl {
                image_url: "data:image/png;base64,AAAA".into(),
            },
            ContentBlock::Text {
                text: "second".into(),
            },
        ]);
        assert_eq!(content.as_llm_text(), "first\nsecond");
    }

    #[test]
    fn raw_content_is_not_serialized_when_absent() {
        let msg = ChatMessage::user(Uuid::new_v4(), "hi");
        let json = serde_json::to_value(&msg).unwrap();
        assert!(json.get("raw_content").is_none());
    }
}
