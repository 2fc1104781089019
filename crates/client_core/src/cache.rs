//! In-memory conversation and message cache.
//!
//! Each conversation has its own writer lane (a mutex around its metadata and
//! message list). The lane map lock is only held long enough to find or create
//! a lane, so writes to unrelated conversations never wait on each other.
//! Nothing in here talks to the network.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use anyhow::Result;
use shared::{
    domain::{
        ConsentState, Conversation, ConversationId, DeliveryStatus, HistoryCursor, Message,
        MessageId,
    },
    protocol::ConversationDescriptor,
};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::persistence::CachePersistence;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
    Unchanged,
}

#[derive(Default)]
struct Lane {
    conversation: Option<Conversation>,
    messages: Vec<Message>,
    ids: HashSet<MessageId>,
}

impl Lane {
    /// Inserts in `(sent_at_ns, id)` order; known ids are ignored.
    fn insert(&mut self, message: Message) -> bool {
        if !self.ids.insert(message.id.clone()) {
            return false;
        }
        let position = self
            .messages
            .binary_search_by(|existing| existing.sort_key().cmp(&message.sort_key()))
            .unwrap_or_else(|position| position);
        self.messages.insert(position, message);
        true
    }

    fn remove(&mut self, id: &MessageId) -> Option<Message> {
        if !self.ids.remove(id) {
            return None;
        }
        let position = self.messages.iter().position(|m| &m.id == id)?;
        Some(self.messages.remove(position))
    }

    fn last_activity_ns(&self) -> i64 {
        self.messages
            .last()
            .map(|m| m.sent_at_ns)
            .or_else(|| self.conversation.as_ref().map(|c| c.created_at_ns))
            .unwrap_or_default()
    }
}

type LaneRef = Arc<Mutex<Lane>>;

#[derive(Default)]
pub struct LocalCache {
    lanes: RwLock<HashMap<ConversationId, LaneRef>>,
    /// Identity the cached conversations belong to.
    owner: Mutex<Option<String>>,
    persistence: Option<Arc<dyn CachePersistence>>,
}

impl LocalCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_persistence(persistence: Arc<dyn CachePersistence>) -> Self {
        Self {
            lanes: RwLock::new(HashMap::new()),
            owner: Mutex::new(None),
            persistence: Some(persistence),
        }
    }

    async fn lane(&self, conversation_id: &ConversationId) -> LaneRef {
        if let Some(lane) = self.lanes.read().await.get(conversation_id) {
            return Arc::clone(lane);
        }
        let mut lanes = self.lanes.write().await;
        Arc::clone(lanes.entry(conversation_id.clone()).or_default())
    }

    async fn existing_lane(&self, conversation_id: &ConversationId) -> Option<LaneRef> {
        self.lanes.read().await.get(conversation_id).cloned()
    }

    /// Loads the persisted snapshot, if any. Returns the number of
    /// conversations restored.
    pub async fn hydrate(&self) -> Result<usize> {
        let Some(persistence) = &self.persistence else {
            return Ok(0);
        };
        let snapshot = persistence.load().await?;
        let restored = snapshot.conversations.len();
        *self.owner.lock().await = snapshot.owner;
        for conversation in snapshot.conversations {
            let lane = self.lane(&conversation.id).await;
            lane.lock().await.conversation = Some(conversation);
        }
        let mut by_conversation: HashMap<ConversationId, Vec<Message>> = HashMap::new();
        for message in snapshot.messages {
            by_conversation
                .entry(message.conversation_id.clone())
                .or_default()
                .push(message);
        }
        for (conversation_id, messages) in by_conversation {
            let lane = self.lane(&conversation_id).await;
            let mut lane = lane.lock().await;
            for message in messages {
                lane.insert(message);
            }
        }
        info!(restored, "cache: hydrated from persisted snapshot");
        Ok(restored)
    }

    pub async fn owner(&self) -> Option<String> {
        self.owner.lock().await.clone()
    }

    /// Ties the cache to `identity`. Anything cached for another identity,
    /// or for no recorded identity, is dropped from memory and from the
    /// persisted copy. Returns `None` when `identity` already owns the
    /// cache, otherwise the conversations that were removed.
    pub async fn bind_owner(&self, identity: &str) -> Option<Vec<ConversationId>> {
        let mut owner = self.owner.lock().await;
        if owner.as_deref() == Some(identity) {
            return None;
        }
        let removed: Vec<ConversationId> = {
            let mut lanes = self.lanes.write().await;
            lanes.drain().map(|(id, _)| id).collect()
        };
        if let Some(persistence) = &self.persistence {
            if owner.is_some() || !removed.is_empty() {
                if let Err(err) = persistence.clear().await {
                    warn!(error = %err, "cache: failed to clear persisted conversations");
                }
            }
            if let Err(err) = persistence.set_owner(identity).await {
                warn!(identity = %identity, error = %err, "cache: failed to persist owner");
            }
        }
        info!(
            previous = owner.as_deref().unwrap_or("none"),
            identity = %identity,
            removed = removed.len(),
            "cache: bound to identity"
        );
        *owner = Some(identity.to_string());
        Some(removed)
    }

    pub async fn upsert_conversation(&self, conversation: Conversation) -> UpsertOutcome {
        let lane = self.lane(&conversation.id).await;
        let (outcome, saved) = {
            let mut lane = lane.lock().await;
            let changed = lane
                .conversation
                .as_ref()
                .map(|existing| existing.differs_from(&conversation));
            match changed {
                Some(false) => (UpsertOutcome::Unchanged, None),
                Some(true) => {
                    lane.conversation = Some(conversation.clone());
                    (UpsertOutcome::Updated, Some(conversation))
                }
                None => {
                    lane.conversation = Some(conversation.clone());
                    (UpsertOutcome::Inserted, Some(conversation))
                }
            }
        };
        if let Some(conversation) = saved {
            self.persist_conversation(&conversation).await;
        }
        outcome
    }

    /// Merges a freshly listed descriptor, keeping the local history cursor.
    /// A group already seen as published stays published.
    pub async fn upsert_descriptor(&self, descriptor: ConversationDescriptor) -> UpsertOutcome {
        let existing = self.conversation(&descriptor.id).await;
        let cursor = existing
            .as_ref()
            .map(|c| c.cursor.clone())
            .unwrap_or_default();
        let mut conversation = descriptor.into_conversation(cursor);
        if existing.is_some_and(|c| c.membership_published) {
            conversation.membership_published = true;
        }
        self.upsert_conversation(conversation).await
    }

    /// Adds messages to a conversation, skipping ids already present.
    /// Returns how many were new.
    pub async fn append_messages(
        &self,
        conversation_id: &ConversationId,
        messages: Vec<Message>,
    ) -> usize {
        self.ingest(conversation_id, messages).await.len()
    }

    /// Like [`append_messages`](Self::append_messages) but hands back the
    /// messages that were actually inserted.
    pub async fn ingest(
        &self,
        conversation_id: &ConversationId,
        messages: Vec<Message>,
    ) -> Vec<Message> {
        let lane = self.lane(conversation_id).await;
        let inserted = {
            let mut lane = lane.lock().await;
            let mut inserted = Vec::new();
            for message in messages {
                if &message.conversation_id != conversation_id {
                    debug!(
                        conversation_id = %conversation_id,
                        message_id = %message.id,
                        "cache: dropping message addressed to another conversation"
                    );
                    continue;
                }
                if lane.insert(message.clone()) {
                    inserted.push(message);
                }
            }
            inserted
        };
        self.persist_messages(&inserted).await;
        inserted
    }

    /// Conversations visible to the UI, most recently active first.
    pub async fn get_conversations(&self) -> Vec<Conversation> {
        let lanes: Vec<LaneRef> = self.lanes.read().await.values().cloned().collect();
        let mut visible = Vec::with_capacity(lanes.len());
        for lane in lanes {
            let lane = lane.lock().await;
            if let Some(conversation) = &lane.conversation {
                if conversation.consent != ConsentState::Denied {
                    visible.push((lane.last_activity_ns(), conversation.clone()));
                }
            }
        }
        visible.sort_by(|(a_at, a), (b_at, b)| b_at.cmp(a_at).then_with(|| a.id.cmp(&b.id)));
        visible.into_iter().map(|(_, c)| c).collect()
    }

    pub async fn conversation(&self, conversation_id: &ConversationId) -> Option<Conversation> {
        let lane = self.existing_lane(conversation_id).await?;
        let lane = lane.lock().await;
        lane.conversation.clone()
    }

    pub async fn get_messages(&self, conversation_id: &ConversationId) -> Vec<Message> {
        match self.existing_lane(conversation_id).await {
            Some(lane) => lane.lock().await.messages.clone(),
            None => Vec::new(),
        }
    }

    pub async fn contains_message(&self, conversation_id: &ConversationId, message_id: &MessageId) -> bool {
        match self.existing_lane(conversation_id).await {
            Some(lane) => lane.lock().await.ids.contains(message_id),
            None => false,
        }
    }

    pub async fn message_count(&self, conversation_id: &ConversationId) -> usize {
        match self.existing_lane(conversation_id).await {
            Some(lane) => lane.lock().await.messages.len(),
            None => 0,
        }
    }

    /// Drops a conversation and its messages. Returns whether it was cached.
    pub async fn evict_conversation(&self, conversation_id: &ConversationId) -> bool {
        let removed = self.lanes.write().await.remove(conversation_id).is_some();
        if let Some(persistence) = &self.persistence {
            if let Err(err) = persistence.evict(conversation_id).await {
                warn!(conversation_id = %conversation_id, error = %err, "cache: failed to evict persisted conversation");
            }
        }
        removed
    }

    /// Swaps a pending local message for its accepted id and marks it sent.
    /// If the accepted id already arrived through another path, the pending
    /// copy is simply dropped.
    pub async fn replace_provisional(
        &self,
        conversation_id: &ConversationId,
        provisional_id: &MessageId,
        accepted_id: MessageId,
    ) -> Option<Message> {
        let lane = self.existing_lane(conversation_id).await?;
        let accepted = {
            let mut lane = lane.lock().await;
            let mut message = lane.remove(provisional_id)?;
            if lane.ids.contains(&accepted_id) {
                return lane.messages.iter().find(|m| m.id == accepted_id).cloned();
            }
            message.id = accepted_id;
            message.status = DeliveryStatus::Sent;
            lane.insert(message.clone());
            message
        };
        self.persist_messages(std::slice::from_ref(&accepted)).await;
        Some(accepted)
    }

    pub async fn mark_failed(
        &self,
        conversation_id: &ConversationId,
        provisional_id: &MessageId,
    ) -> Option<Message> {
        let lane = self.existing_lane(conversation_id).await?;
        let mut lane = lane.lock().await;
        let message = lane.messages.iter_mut().find(|m| &m.id == provisional_id)?;
        message.status = DeliveryStatus::Failed;
        Some(message.clone())
    }

    pub async fn cursor(&self, conversation_id: &ConversationId) -> HistoryCursor {
        self.conversation(conversation_id)
            .await
            .map(|c| c.cursor)
            .unwrap_or_default()
    }

    pub async fn set_cursor(&self, conversation_id: &ConversationId, cursor: HistoryCursor) {
        let Some(lane) = self.existing_lane(conversation_id).await else {
            return;
        };
        let saved = {
            let mut lane = lane.lock().await;
            let Some(conversation) = lane.conversation.as_mut() else {
                return;
            };
            conversation.cursor = cursor;
            conversation.clone()
        };
        self.persist_conversation(&saved).await;
    }

    /// Returns true when the flag flipped.
    pub async fn mark_membership_published(&self, conversation_id: &ConversationId) -> bool {
        let Some(lane) = self.existing_lane(conversation_id).await else {
            return false;
        };
        let saved = {
            let mut lane = lane.lock().await;
            match lane.conversation.as_mut() {
                Some(conversation) if !conversation.membership_published => {
                    conversation.membership_published = true;
                    conversation.clone()
                }
                _ => return false,
            }
        };
        self.persist_conversation(&saved).await;
        true
    }

    async fn persist_conversation(&self, conversation: &Conversation) {
        let Some(persistence) = &self.persistence else {
            return;
        };
        if let Err(err) = persistence.save_conversation(conversation).await {
            warn!(conversation_id = %conversation.id, error = %err, "cache: failed to persist conversation");
        }
    }

    async fn persist_messages(&self, messages: &[Message]) {
        let Some(persistence) = &self.persistence else {
            return;
        };
        if messages.iter().all(|m| m.status != DeliveryStatus::Sent) {
            return;
        }
        if let Err(err) = persistence.save_messages(messages).await {
            warn!(count = messages.len(), error = %err, "cache: failed to persist messages");
        }
    }
}

#[cfg(test)]
#[path = "tests/cache_tests.rs"]
mod tests;
