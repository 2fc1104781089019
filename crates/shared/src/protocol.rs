use serde::{Deserialize, Serialize};

use crate::domain::{
    ConsentState, Conversation, ConversationId, DeliveryStatus, HistoryCursor, InboxId,
    InstallationId, Membership, Message, MessageId,
};

/// Conversation metadata as reported by the protocol client on sync/list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationDescriptor {
    pub id: ConversationId,
    pub membership: Membership,
    #[serde(default)]
    pub consent: ConsentState,
    #[serde(default)]
    pub membership_published: bool,
    pub created_at_ns: i64,
    /// Newest message the network holds for this conversation.
    #[serde(default)]
    pub last_message_id: Option<MessageId>,
}

impl ConversationDescriptor {
    /// Builds the cache record, keeping an existing history cursor.
    pub fn into_conversation(self, cursor: HistoryCursor) -> Conversation {
        let membership_published = match self.membership {
            Membership::Direct { .. } => true,
            Membership::Group { .. } => self.membership_published,
        };
        Conversation {
            id: self.id,
            membership: self.membership,
            consent: self.consent,
            membership_published,
            created_at_ns: self.created_at_ns,
            cursor,
        }
    }
}

/// A message accepted by the network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolMessage {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender: InboxId,
    pub content: String,
    pub sent_at_ns: i64,
}

impl From<ProtocolMessage> for Message {
    fn from(value: ProtocolMessage) -> Self {
        Self {
            id: value.id,
            conversation_id: value.conversation_id,
            sender: value.sender,
            content: value.content,
            sent_at_ns: value.sent_at_ns,
            status: DeliveryStatus::Sent,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagePage {
    pub messages: Vec<ProtocolMessage>,
    /// `None` once the history is exhausted.
    pub next_cursor: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "target", rename_all = "snake_case")]
pub enum ConversationTarget {
    Direct(InboxId),
    Group(Vec<InboxId>),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallationRef {
    pub id: InstallationId,
    pub created_at_ns: i64,
}
