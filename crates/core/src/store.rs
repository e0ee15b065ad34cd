//! Chat persistence (C5).
//!
//! `ChatStore` is a generic session/entry log narrowed down to what the
//! orchestrator actually needs: append-only message history per chat,
//! plus the one mutation the content filter requires (attaching
//! `raw_content` after the fact once the filtered text is persisted).
//! `InMemoryChatStore` keeps its state behind an `Arc<Mutex<HashMap<...>>>`.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::chat::ChatMessage;

#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("storage backend error: {0}")]
    Backend(String),
}

#[async_trait]
pub trait ChatStore: Send + Sync + 'static {
    async fn get_messages(&self, chat_id: Uuid) -> Result<Vec<ChatMessage>, StoreError>;

    async fn append(&self, message: ChatMessage) -> Result<(), StoreError>;

    /// Attaches `raw_content` to an already-persisted message — used when
    /// the content filter removed something, so the filtered text stays
    /// in `content` and the untouched original is kept alongside it.
    async fn update_raw_content(
        &self,
        message_id: Uuid,
        raw_content: String,
    ) -> Result<(), StoreError>;

    async fn mark_read(&self, chat_id: Uuid) -> Result<(), StoreError>;
}

#[derive(Debug, Clone, Default)]
struct ChatRecord {
    messages: Vec<ChatMessage>,
    last_read_at: Option<chrono::DateTime<chrono::Utc>>,
}

/// In-process chat store. Adequate for single-node deployments and
/// tests; a durable backend implements the same trait.
pub struct InMemoryChatStore {
    chats: Mutex<HashMap<Uuid, ChatRecord>>,
}

impl Default for InMemoryChatStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryChatStore {
    pub fn new() -> Self {
        Self {
            chats: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl ChatStore for InMemoryChatStore {
    async fn get_messages(&self, chat_id: Uuid) -> Result<Vec<ChatMessage>, StoreError> {
        let chats = self.chats.lock().await;
        Ok(chats
            .get(&chat_id)
            .map(|r| r.messages.clone())
            .unwrap_or_default())
    }

    async fn append(&self, message: ChatMessage) -> Result<(), StoreError> {
        let mut chats = self.chats.lock().await;
        chats.entry(message.chat_id).or_default().messages.push(message);
        Ok(())
    }

    async fn update_raw_content(
        &self,
        message_id: Uuid,
        raw_content: String,
    ) -> Result<(), StoreError> {
        let mut chats = self.chats.lock().await;
        for record in chats.values_mut() {
            if let Some(message) = record.messages.iter_mut().find(|m| m.id == message_id) {
                message.raw_content = Some(raw_content);
                return Ok(());
            }
        }
        Err(StoreError::NotFound(message_id.to_string()))
    }

    async fn mark_read(&self, chat_id: Uuid) -> Result<(), StoreError> {
        let mut chats = self.chats.lock().await;
        let record = chats
            .get_mut(&chat_id)
            .ok_or_else(|| StoreError::NotFound(chat_id.to_string()))?;
        record.last_read_at = Some(chrono::Utc::now());
        Ok(())
    }
}

pub type SharedChatStore = Arc<dyn ChatStore>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::ChatRole;

    #[tokio::test]
    async fn append_then_get_returns_in_order() {
        let store = InMemoryChatStore::new();
        let chat_id = Uuid::new_v4();
        let first = ChatMessage::user(chat_id, "hi");
        let second = ChatMessage::user(chat_id, "there");
        store.append(first.clone()).await.unwrap();
        store.append(second.clone()).await.unwrap();

        let messages = store.get_messages(chat_id).await.unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].id, first.id);
        assert_eq!(messages[1].id, second.id);
    }

    #[tokio::test]
    async fn unknown_chat_returns_empty_not_error() {
        let store = InMemoryChatStore::new();
        let messages = store.get_messages(Uuid::new_v4()).await.unwrap();
        assert!(messages.is_empty());
    }

    #[tokio::test]
    async fn update_raw_content_attaches_to_existing_message() {
        let store = InMemoryChatStore::new();
        let chat_id = Uuid::new_v4();
        let mut msg = ChatMessage::user(chat_id, "answer");
        msg.role = ChatRole::Assistant;
        let id = msg.id;
        store.append(msg).await.unwrap();

        store
            .update_raw_content(id, "<think>plan</think>answer".to_string())
            .await
            .unwrap();

        let messages = store.get_messages(chat_id).await.unwrap();
        assert_eq!(
            messages[0].raw_content.as_deref(),
            Some("<think>plan</think>answer")
        );
    }

    #[tokio::test]
    async fn update_raw_content_unknown_message_errors() {
        let store = InMemoryChatStore::new();
        let err = store
            .update_raw_content(Uuid::new_v4(), "x".to_string())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }
}
