//! Seams to the encrypted-messaging protocol library.
//!
//! The engine never talks to the network directly; everything goes through
//! these traits. Implementations return `anyhow` errors and may attach a
//! typed [`ProtocolError`](shared::error::ProtocolError) where they know the
//! cause; anything else is classified from its text by [`crate::fault`].

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use futures::stream::BoxStream;
use shared::{
    domain::{ConversationId, InboxId, InstallationId, MessageId, NetworkEnv},
    protocol::{ConversationDescriptor, ConversationTarget, MessagePage, ProtocolMessage},
};

/// Every message arriving on any conversation, until the stream ends.
pub type MessageStream = BoxStream<'static, Result<ProtocolMessage>>;

/// Wallet-side signer backing a messaging identity.
#[async_trait]
pub trait Signer: Send + Sync {
    /// Stable account identifier (e.g. wallet address). Two signers with the
    /// same identifier belong to the same identity.
    fn identifier(&self) -> String;
    async fn sign(&self, payload: &[u8]) -> Result<Vec<u8>>;
}

/// Creates protocol clients and manages the identity store they live in.
#[async_trait]
pub trait ProtocolConnector: Send + Sync {
    async fn create(
        &self,
        signer: Arc<dyn Signer>,
        env: NetworkEnv,
    ) -> Result<Arc<dyn ProtocolClient>>;

    async fn revoke_installation(
        &self,
        signer: Arc<dyn Signer>,
        env: NetworkEnv,
        installation: &InstallationId,
    ) -> Result<()>;

    /// Destroys the persisted identity database for `identity`.
    async fn clear_local_identity_store(&self, identity: &str, env: NetworkEnv) -> Result<()>;

    /// Drops process-wide markers the protocol core leaves behind after a crash.
    fn clear_runtime_markers(&self) {}
}

/// An initialized protocol client bound to one installation.
#[async_trait]
pub trait ProtocolClient: Send + Sync {
    fn inbox_id(&self) -> InboxId;
    fn installation_id(&self) -> InstallationId;

    async fn sync_and_list(&self) -> Result<Vec<ConversationDescriptor>>;
    async fn load_messages(
        &self,
        conversation_id: &ConversationId,
        cursor: Option<&str>,
        limit: u32,
    ) -> Result<MessagePage>;
    async fn send(&self, conversation_id: &ConversationId, content: &str) -> Result<MessageId>;
    async fn can_send(&self, conversation_id: &ConversationId) -> Result<bool>;
    async fn stream_all_messages(&self) -> Result<MessageStream>;
    async fn create_conversation(
        &self,
        target: &ConversationTarget,
    ) -> Result<ConversationDescriptor>;
    /// Marks the conversation hidden for this identity on the network.
    async fn hide_conversation(&self, conversation_id: &ConversationId) -> Result<()>;

    /// Drops conversation/message caches held inside the protocol library.
    async fn clear_protocol_caches(&self) -> Result<()> {
        Ok(())
    }

    /// Best-effort request to free memory held by the crypto core.
    fn reclaim_hint(&self) {}

    async fn close(&self) {}
}
