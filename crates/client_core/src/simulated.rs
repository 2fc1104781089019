//! In-process stand-in for the messaging network.
//!
//! Every client created from one [`SimulatedNetwork`] shares its state, so
//! two identities can talk to each other. Failures, delays and slow group
//! propagation can be scripted per operation.

use std::{
    collections::{BTreeSet, HashMap, HashSet, VecDeque},
    sync::Arc,
    time::Duration,
};

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use futures::StreamExt;
use shared::{
    domain::{
        ConsentState, ConversationId, InboxId, InstallationId, Membership, MessageId, NetworkEnv,
    },
    error::ProtocolError,
    protocol::{
        ConversationDescriptor, ConversationTarget, InstallationRef, MessagePage, ProtocolMessage,
    },
};
use tokio::sync::{mpsc, Mutex};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::debug;

use crate::facade::{MessageStream, ProtocolClient, ProtocolConnector, Signer};

pub const DEFAULT_MAX_INSTALLATIONS: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SimOp {
    Create,
    Sync,
    Load,
    Send,
    CanSend,
    Stream,
    CreateConversation,
    WipeIdentity,
}

/// Signer with a fixed identifier.
#[derive(Debug, Clone)]
pub struct StaticSigner {
    identifier: String,
}

impl StaticSigner {
    pub fn new(identifier: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            identifier: identifier.into(),
        })
    }
}

#[async_trait]
impl Signer for StaticSigner {
    fn identifier(&self) -> String {
        self.identifier.clone()
    }

    async fn sign(&self, payload: &[u8]) -> Result<Vec<u8>> {
        let mut signature = self.identifier.as_bytes().to_vec();
        signature.extend_from_slice(payload);
        Ok(signature)
    }
}

pub fn inbox_for(identity: &str) -> InboxId {
    InboxId::new(format!("inbox-{identity}"))
}

struct SimConversation {
    id: ConversationId,
    group: bool,
    creator: InboxId,
    participants: BTreeSet<InboxId>,
    created_at_ns: i64,
    /// Group `can_send` checks answer false this many times.
    unpublished_checks: u32,
    checks: u32,
    hidden_for: HashSet<InboxId>,
    messages: Vec<ProtocolMessage>,
}

impl SimConversation {
    fn published(&self) -> bool {
        !self.group || self.checks > self.unpublished_checks
    }

    fn descriptor_for(&self, viewer: &InboxId) -> ConversationDescriptor {
        let membership = if self.group {
            Membership::Group {
                members: self.participants.clone(),
            }
        } else {
            let peer = self
                .participants
                .iter()
                .find(|p| *p != viewer)
                .unwrap_or(&self.creator)
                .clone();
            Membership::Direct { peer }
        };
        ConversationDescriptor {
            id: self.id.clone(),
            membership,
            consent: if self.hidden_for.contains(viewer) {
                ConsentState::Denied
            } else {
                ConsentState::Allowed
            },
            membership_published: self.published(),
            created_at_ns: self.created_at_ns,
            last_message_id: self.messages.last().map(|m| m.id.clone()),
        }
    }
}

struct Subscriber {
    inbox_id: InboxId,
    tx: mpsc::UnboundedSender<Result<ProtocolMessage>>,
}

#[derive(Default)]
struct NetworkState {
    registered: HashSet<InboxId>,
    conversations: HashMap<ConversationId, SimConversation>,
    installations: HashMap<InboxId, Vec<InstallationRef>>,
    /// Installation persisted in each identity's local store.
    local_installation: HashMap<String, InstallationId>,
    subscribers: Vec<Subscriber>,
    failures: HashMap<SimOp, VecDeque<String>>,
    calls: HashMap<SimOp, u32>,
    create_delay: Option<Duration>,
    group_publish_checks: u32,
    max_installations: usize,
    marker_clears: u32,
    wiped: Vec<String>,
    sequence: u64,
}

impl NetworkState {
    fn next_sequence(&mut self) -> u64 {
        self.sequence += 1;
        self.sequence
    }

    fn tick(&mut self, op: SimOp) -> Result<()> {
        *self.calls.entry(op).or_default() += 1;
        if let Some(text) = self.failures.get_mut(&op).and_then(VecDeque::pop_front) {
            debug!(op = ?op, text = %text, "sim: injected failure");
            bail!(text);
        }
        Ok(())
    }

    fn deliver(&mut self, message: &ProtocolMessage) {
        let Some(conversation) = self.conversations.get(&message.conversation_id) else {
            return;
        };
        let participants = conversation.participants.clone();
        self.subscribers.retain(|subscriber| {
            if !participants.contains(&subscriber.inbox_id) {
                return !subscriber.tx.is_closed();
            }
            subscriber.tx.send(Ok(message.clone())).is_ok()
        });
    }
}

#[derive(Clone)]
pub struct SimulatedNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl Default for SimulatedNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedNetwork {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(NetworkState {
                max_installations: DEFAULT_MAX_INSTALLATIONS,
                ..NetworkState::default()
            })),
        }
    }

    pub fn connector(&self) -> Arc<dyn ProtocolConnector> {
        Arc::new(self.clone())
    }

    /// Registers an identity on the network without creating a client.
    pub async fn register(&self, identity: &str) -> InboxId {
        let inbox_id = inbox_for(identity);
        self.state.lock().await.registered.insert(inbox_id.clone());
        inbox_id
    }

    /// Drops an identity from the network, as if it never registered.
    pub async fn unregister(&self, identity: &str) {
        self.state.lock().await.registered.remove(&inbox_for(identity));
    }

    /// Queues `text` as the error for the next call of `op`.
    pub async fn fail_next(&self, op: SimOp, text: impl Into<String>) {
        self.state
            .lock()
            .await
            .failures
            .entry(op)
            .or_default()
            .push_back(text.into());
    }

    pub async fn calls(&self, op: SimOp) -> u32 {
        self.state.lock().await.calls.get(&op).copied().unwrap_or_default()
    }

    pub async fn set_create_delay(&self, delay: Option<Duration>) {
        self.state.lock().await.create_delay = delay;
    }

    /// New groups report unpublished membership for this many checks.
    pub async fn set_group_publish_checks(&self, checks: u32) {
        self.state.lock().await.group_publish_checks = checks;
    }

    pub async fn set_max_installations(&self, max: usize) {
        self.state.lock().await.max_installations = max;
    }

    /// Pre-fills an identity's installation list, as if other devices had
    /// signed in.
    pub async fn seed_installations(&self, identity: &str, count: usize) -> Vec<InstallationRef> {
        let mut state = self.state.lock().await;
        let inbox_id = inbox_for(identity);
        state.registered.insert(inbox_id.clone());
        for _ in 0..count {
            let sequence = state.next_sequence();
            state
                .installations
                .entry(inbox_id.clone())
                .or_default()
                .push(InstallationRef {
                    id: InstallationId::new(format!("install-{sequence}")),
                    created_at_ns: sequence as i64,
                });
        }
        state.installations.get(&inbox_id).cloned().unwrap_or_default()
    }

    pub async fn installations(&self, identity: &str) -> Vec<InstallationRef> {
        self.state
            .lock()
            .await
            .installations
            .get(&inbox_for(identity))
            .cloned()
            .unwrap_or_default()
    }

    /// Creates a conversation on behalf of `creator`, bypassing any client.
    pub async fn create_remote(&self, creator: &str, target: &ConversationTarget) -> Result<ConversationId> {
        let mut state = self.state.lock().await;
        let creator = inbox_for(creator);
        state.registered.insert(creator.clone());
        create_conversation(&mut state, &creator, target).map(|d| d.id)
    }

    /// Sends a message as `sender`, bypassing any client.
    pub async fn deliver_remote(
        &self,
        sender: &str,
        conversation_id: &ConversationId,
        content: &str,
    ) -> Result<ProtocolMessage> {
        let mut state = self.state.lock().await;
        post_message(&mut state, &inbox_for(sender), conversation_id, content)
    }

    /// Ends every open stream with `text`.
    pub async fn break_streams(&self, text: &str) {
        let mut state = self.state.lock().await;
        for subscriber in state.subscribers.drain(..) {
            let _ = subscriber.tx.send(Err(anyhow!(text.to_string())));
        }
    }

    pub async fn open_streams(&self) -> usize {
        let mut state = self.state.lock().await;
        state.subscribers.retain(|s| !s.tx.is_closed());
        state.subscribers.len()
    }

    pub async fn marker_clears(&self) -> u32 {
        self.state.lock().await.marker_clears
    }

    pub async fn wiped_identities(&self) -> Vec<String> {
        self.state.lock().await.wiped.clone()
    }
}

fn create_conversation(
    state: &mut NetworkState,
    creator: &InboxId,
    target: &ConversationTarget,
) -> Result<ConversationDescriptor> {
    let (group, others) = match target {
        ConversationTarget::Direct(peer) => (false, vec![peer.clone()]),
        ConversationTarget::Group(members) => (true, members.clone()),
    };
    if let Some(missing) = others.iter().find(|p| !state.registered.contains(*p)) {
        return Err(ProtocolError::RecipientNotRegistered(missing.clone()).into());
    }

    if !group {
        let existing = state.conversations.values().find(|c| {
            !c.group && c.participants.contains(creator) && c.participants.contains(&others[0])
        });
        if let Some(existing) = existing {
            return Ok(existing.descriptor_for(creator));
        }
    }

    let sequence = state.next_sequence();
    let id = ConversationId::new(format!("{}-{sequence}", if group { "group" } else { "dm" }));
    let mut participants: BTreeSet<InboxId> = others.into_iter().collect();
    participants.insert(creator.clone());
    let conversation = SimConversation {
        id: id.clone(),
        group,
        creator: creator.clone(),
        participants,
        created_at_ns: sequence as i64 * 1_000,
        unpublished_checks: if group { state.group_publish_checks } else { 0 },
        checks: 0,
        hidden_for: HashSet::new(),
        messages: Vec::new(),
    };
    let descriptor = conversation.descriptor_for(creator);
    state.conversations.insert(id, conversation);
    Ok(descriptor)
}

fn post_message(
    state: &mut NetworkState,
    sender: &InboxId,
    conversation_id: &ConversationId,
    content: &str,
) -> Result<ProtocolMessage> {
    let sequence = state.next_sequence();
    let conversation = state
        .conversations
        .get_mut(conversation_id)
        .ok_or_else(|| anyhow!("conversation {conversation_id} not found"))?;
    if !conversation.participants.contains(sender) {
        bail!("{sender} is not a member of {conversation_id}");
    }
    if !conversation.published() {
        return Err(ProtocolError::MembershipNotYetPublished(conversation_id.clone()).into());
    }
    let message = ProtocolMessage {
        id: MessageId::new(format!("msg-{sequence}")),
        conversation_id: conversation_id.clone(),
        sender: sender.clone(),
        content: content.to_string(),
        sent_at_ns: sequence as i64 * 1_000,
    };
    conversation.messages.push(message.clone());
    state.deliver(&message);
    Ok(message)
}

#[async_trait]
impl ProtocolConnector for SimulatedNetwork {
    async fn create(
        &self,
        signer: Arc<dyn Signer>,
        _env: NetworkEnv,
    ) -> Result<Arc<dyn ProtocolClient>> {
        let delay = self.state.lock().await.create_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let identity = signer.identifier();
        let inbox_id = inbox_for(&identity);
        let mut state = self.state.lock().await;
        state.tick(SimOp::Create)?;
        state.registered.insert(inbox_id.clone());

        let reusable = state.local_installation.get(&identity).cloned().filter(|id| {
            state
                .installations
                .get(&inbox_id)
                .is_some_and(|list| list.iter().any(|i| &i.id == id))
        });
        let installation_id = match reusable {
            Some(id) => id,
            None => {
                let registered = state.installations.get(&inbox_id).cloned().unwrap_or_default();
                if registered.len() >= state.max_installations {
                    return Err(ProtocolError::InstallationLimitExceeded {
                        inbox_id,
                        max: state.max_installations,
                        installations: registered,
                    }
                    .into());
                }
                let sequence = state.next_sequence();
                let id = InstallationId::new(format!("install-{sequence}"));
                state
                    .installations
                    .entry(inbox_id.clone())
                    .or_default()
                    .push(InstallationRef {
                        id: id.clone(),
                        created_at_ns: sequence as i64,
                    });
                state.local_installation.insert(identity, id.clone());
                id
            }
        };

        Ok(Arc::new(SimulatedClient {
            network: self.clone(),
            inbox_id,
            installation_id,
        }))
    }

    async fn revoke_installation(
        &self,
        signer: Arc<dyn Signer>,
        _env: NetworkEnv,
        installation: &InstallationId,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        let inbox_id = inbox_for(&signer.identifier());
        let list = state.installations.entry(inbox_id).or_default();
        let before = list.len();
        list.retain(|i| &i.id != installation);
        if list.len() == before {
            bail!("installation {installation} is not registered");
        }
        Ok(())
    }

    async fn clear_local_identity_store(&self, identity: &str, _env: NetworkEnv) -> Result<()> {
        let mut state = self.state.lock().await;
        state.tick(SimOp::WipeIdentity)?;
        state.local_installation.remove(identity);
        state.wiped.push(identity.to_string());
        Ok(())
    }

    fn clear_runtime_markers(&self) {
        if let Ok(mut state) = self.state.try_lock() {
            state.marker_clears += 1;
        }
    }
}

pub struct SimulatedClient {
    network: SimulatedNetwork,
    inbox_id: InboxId,
    installation_id: InstallationId,
}

#[async_trait]
impl ProtocolClient for SimulatedClient {
    fn inbox_id(&self) -> InboxId {
        self.inbox_id.clone()
    }

    fn installation_id(&self) -> InstallationId {
        self.installation_id.clone()
    }

    async fn sync_and_list(&self) -> Result<Vec<ConversationDescriptor>> {
        let mut state = self.network.state.lock().await;
        state.tick(SimOp::Sync)?;
        let mut listed: Vec<_> = state
            .conversations
            .values()
            .filter(|c| c.participants.contains(&self.inbox_id))
            .map(|c| c.descriptor_for(&self.inbox_id))
            .collect();
        listed.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(listed)
    }

    async fn load_messages(
        &self,
        conversation_id: &ConversationId,
        cursor: Option<&str>,
        limit: u32,
    ) -> Result<MessagePage> {
        let mut state = self.network.state.lock().await;
        state.tick(SimOp::Load)?;
        let conversation = state
            .conversations
            .get(conversation_id)
            .ok_or_else(|| anyhow!("conversation {conversation_id} not found"))?;
        let end = match cursor {
            Some(cursor) => cursor
                .parse::<usize>()
                .map_err(|_| anyhow!("invalid history cursor {cursor:?}"))?
                .min(conversation.messages.len()),
            None => conversation.messages.len(),
        };
        let start = end.saturating_sub(limit as usize);
        Ok(MessagePage {
            messages: conversation.messages[start..end].to_vec(),
            next_cursor: (start > 0).then(|| start.to_string()),
        })
    }

    async fn send(&self, conversation_id: &ConversationId, content: &str) -> Result<MessageId> {
        let mut state = self.network.state.lock().await;
        state.tick(SimOp::Send)?;
        post_message(&mut state, &self.inbox_id, conversation_id, content).map(|m| m.id)
    }

    async fn can_send(&self, conversation_id: &ConversationId) -> Result<bool> {
        let mut state = self.network.state.lock().await;
        state.tick(SimOp::CanSend)?;
        let registered = state.registered.clone();
        let conversation = state
            .conversations
            .get_mut(conversation_id)
            .ok_or_else(|| anyhow!("conversation {conversation_id} not found"))?;
        if conversation.group {
            conversation.checks += 1;
            Ok(conversation.published())
        } else {
            Ok(conversation.participants.iter().all(|p| registered.contains(p)))
        }
    }

    async fn stream_all_messages(&self) -> Result<MessageStream> {
        let mut state = self.network.state.lock().await;
        state.tick(SimOp::Stream)?;
        let (tx, rx) = mpsc::unbounded_channel();
        state.subscribers.push(Subscriber {
            inbox_id: self.inbox_id.clone(),
            tx,
        });
        Ok(UnboundedReceiverStream::new(rx).boxed())
    }

    async fn create_conversation(&self, target: &ConversationTarget) -> Result<ConversationDescriptor> {
        let mut state = self.network.state.lock().await;
        state.tick(SimOp::CreateConversation)?;
        create_conversation(&mut state, &self.inbox_id, target)
    }

    async fn hide_conversation(&self, conversation_id: &ConversationId) -> Result<()> {
        let mut state = self.network.state.lock().await;
        let conversation = state
            .conversations
            .get_mut(conversation_id)
            .ok_or_else(|| anyhow!("conversation {conversation_id} not found"))?;
        conversation.hidden_for.insert(self.inbox_id.clone());
        Ok(())
    }

    async fn close(&self) {
        let mut state = self.network.state.lock().await;
        let inbox_id = self.inbox_id.clone();
        state.subscribers.retain(|s| s.inbox_id != inbox_id);
    }
}

#[cfg(test)]
#[path = "tests/simulated_tests.rs"]
mod tests;
