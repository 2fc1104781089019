use anyhow::Result;
use async_trait::async_trait;
use shared::domain::{Conversation, ConversationId, Message};
use storage::Storage;

/// Everything needed to rebuild the in-memory cache after a restart.
#[derive(Debug, Clone, Default)]
pub struct CacheSnapshot {
    /// Identity the snapshot belongs to.
    pub owner: Option<String>,
    pub conversations: Vec<Conversation>,
    pub messages: Vec<Message>,
}

/// Write-through target for the local cache.
#[async_trait]
pub trait CachePersistence: Send + Sync {
    async fn load(&self) -> Result<CacheSnapshot>;
    async fn save_conversation(&self, conversation: &Conversation) -> Result<()>;
    async fn save_messages(&self, messages: &[Message]) -> Result<()>;
    async fn evict(&self, conversation_id: &ConversationId) -> Result<()>;
    async fn set_owner(&self, identity: &str) -> Result<()>;
    /// Removes everything, owner included.
    async fn clear(&self) -> Result<()>;
}

#[async_trait]
impl CachePersistence for Storage {
    async fn load(&self) -> Result<CacheSnapshot> {
        let conversations = self.list_conversations().await?;
        let mut messages = Vec::new();
        for conversation in &conversations {
            messages.extend(self.list_messages(&conversation.id).await?);
        }
        Ok(CacheSnapshot {
            owner: self.cache_owner().await?,
            conversations,
            messages,
        })
    }

    async fn save_conversation(&self, conversation: &Conversation) -> Result<()> {
        self.upsert_conversation(conversation).await
    }

    async fn save_messages(&self, messages: &[Message]) -> Result<()> {
        self.insert_messages(messages).await.map(|_| ())
    }

    async fn evict(&self, conversation_id: &ConversationId) -> Result<()> {
        self.delete_conversation(conversation_id).await.map(|_| ())
    }

    async fn set_owner(&self, identity: &str) -> Result<()> {
        self.set_cache_owner(identity).await
    }

    async fn clear(&self) -> Result<()> {
        self.clear_all().await
    }
}
