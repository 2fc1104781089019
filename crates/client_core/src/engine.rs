use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use shared::{
    domain::{
        Conversation, ConversationId, DeliveryStatus, InstallationId, Membership, Message,
        MessageId,
    },
    error::ProtocolError,
    protocol::ConversationTarget,
};
use storage::{prepare_database_url, Storage};
use tokio::{
    sync::{broadcast, mpsc, Mutex},
    task::JoinHandle,
};
use tracing::{info, warn};

use crate::{
    cache::LocalCache,
    config::EngineSettings,
    discovery::{DiscoveryLoop, DiscoveryOutcome},
    events::{spawn_listener, EngineEvent, EventSender, ListenerHandle},
    facade::{ProtocolConnector, Signer},
    fault::{self, FaultClass},
    readiness::{ReadinessReconciler, ReadinessState},
    recovery::{
        FaultRecoverySupervisor, FaultReport, FaultSink, FaultSource, RecoveryConfig,
        RecoveryOutcome, RecoveryStatus,
    },
    session::{InitResult, SessionManager, SessionState},
    synchronizer::{HistoryPage, MessageSynchronizer},
};

/// The surface the UI talks to.
///
/// Reads are served from the local cache; everything that needs the
/// network goes through the session and is retried or recovered by the
/// supervisor. Must be created inside a Tokio runtime.
pub struct SyncEngine {
    cache: Arc<LocalCache>,
    sessions: Arc<SessionManager>,
    synchronizer: Arc<MessageSynchronizer>,
    discovery: Arc<DiscoveryLoop>,
    readiness: Arc<ReadinessReconciler>,
    supervisor: Arc<FaultRecoverySupervisor>,
    faults: FaultSink,
    events: EventSender,
    pending_reports: Mutex<Option<mpsc::UnboundedReceiver<FaultReport>>>,
    intake: Mutex<Option<JoinHandle<()>>>,
}

impl SyncEngine {
    /// Engine with an in-memory cache.
    pub fn new(connector: Arc<dyn ProtocolConnector>, settings: &EngineSettings) -> Arc<Self> {
        Self::with_cache(connector, settings, Arc::new(LocalCache::new()))
    }

    /// Engine whose cache is backed by sqlite when
    /// `cache_database_url` is set. The persisted snapshot is loaded first.
    pub async fn open(connector: Arc<dyn ProtocolConnector>, settings: &EngineSettings) -> Result<Arc<Self>> {
        let cache = match &settings.cache_database_url {
            Some(url) => {
                let url = prepare_database_url(url)?;
                let storage = Storage::new(&url).await?;
                let cache = LocalCache::with_persistence(Arc::new(storage));
                cache.hydrate().await?;
                cache
            }
            None => LocalCache::new(),
        };
        Ok(Self::with_cache(connector, settings, Arc::new(cache)))
    }

    pub fn with_cache(
        connector: Arc<dyn ProtocolConnector>,
        settings: &EngineSettings,
        cache: Arc<LocalCache>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(settings.event_buffer.max(16));
        let (faults, reports) = FaultSink::channel();
        let synchronizer = MessageSynchronizer::new(
            Arc::clone(&cache),
            events.clone(),
            faults.clone(),
            settings.page_size,
        );
        let sessions = SessionManager::new(
            connector,
            Arc::clone(&synchronizer),
            events.clone(),
            faults.clone(),
            settings.env,
            settings.init_timeout(),
        );
        let discovery = DiscoveryLoop::new(
            Arc::clone(&sessions),
            Arc::clone(&synchronizer),
            Arc::clone(&cache),
            events.clone(),
            faults.clone(),
            settings.discovery_interval(),
        );
        let readiness = ReadinessReconciler::new(
            Arc::clone(&sessions),
            Arc::clone(&cache),
            events.clone(),
            faults.clone(),
            settings.readiness_policy(),
        );
        let supervisor = FaultRecoverySupervisor::new(
            Arc::clone(&sessions),
            Arc::clone(&readiness),
            Arc::clone(&discovery),
            events.clone(),
            RecoveryConfig {
                backoff: settings.backoff_policy(),
                cooldown: settings.recovery_cooldown(),
                recreate_attempts: settings.recreate_attempts(),
                auto_wipe_identity: settings.auto_wipe_identity,
            },
        );

        Arc::new(Self {
            cache,
            sessions,
            synchronizer,
            discovery,
            readiness,
            supervisor,
            faults,
            events,
            pending_reports: Mutex::new(Some(reports)),
            intake: Mutex::new(None),
        })
    }

    async fn ensure_fault_intake(&self) {
        let Some(reports) = self.pending_reports.lock().await.take() else {
            return;
        };
        *self.intake.lock().await = Some(self.supervisor.spawn_intake(reports));
    }

    /// Creates the session, opens the message stream and starts discovery.
    ///
    /// Signing in as a different identity first tears everything down and
    /// drops the previous identity's cached conversations.
    pub async fn initialize(&self, signer: Option<Arc<dyn Signer>>) -> InitResult {
        self.ensure_fault_intake().await;
        if let Some(signer) = &signer {
            self.switch_identity(&signer.identifier()).await;
        }
        match self.sessions.initialize(signer).await {
            Ok(session) => {
                self.discovery.start().await;
                Ok(session)
            }
            Err(error) => {
                if fault::class_of(&error) == FaultClass::ProtocolCoreInstability {
                    self.faults.report(FaultSource::Session, error.clone());
                }
                Err(error)
            }
        }
    }

    async fn switch_identity(&self, identity: &str) {
        let previous = self.sessions.identity().await;
        if let Some(previous) = previous.filter(|previous| previous != identity) {
            info!(from = %previous, to = %identity, "engine: switching identity, tearing down");
            self.discovery.stop().await;
            self.readiness.cancel_all().await;
            self.sessions.shutdown().await;
        }
        let Some(removed) = self.cache.bind_owner(identity).await else {
            return;
        };
        self.readiness.reset_all().await;
        if !removed.is_empty() {
            let _ = self.events.send(EngineEvent::ConversationsChanged {
                added: Vec::new(),
                updated: Vec::new(),
                removed,
            });
        }
    }

    pub async fn shutdown(&self) {
        self.discovery.stop().await;
        self.readiness.cancel_all().await;
        self.sessions.shutdown().await;
    }

    pub async fn session_state(&self) -> SessionState {
        self.sessions.state().await
    }

    /// Records a runtime error raised outside any engine call (for example
    /// a panic message captured by the host).
    pub async fn report_runtime_fault(&self, text: &str) {
        self.sessions.report_runtime_fault(text).await;
    }

    pub async fn get_conversations(&self) -> Vec<Conversation> {
        self.cache.get_conversations().await
    }

    pub async fn get_messages(&self, conversation_id: &ConversationId) -> Vec<Message> {
        self.cache.get_messages(conversation_id).await
    }

    pub async fn load_more(&self, conversation_id: &ConversationId) -> Result<HistoryPage, ProtocolError> {
        let sessions = Arc::clone(&self.sessions);
        let synchronizer = Arc::clone(&self.synchronizer);
        self.supervisor
            .run_with_backoff("load_more", Some(conversation_id), || {
                let sessions = Arc::clone(&sessions);
                let synchronizer = Arc::clone(&synchronizer);
                let conversation_id = conversation_id.clone();
                async move {
                    let session = sessions.require().await?;
                    synchronizer.load_more(&session, &conversation_id).await
                }
            })
            .await
    }

    pub async fn force_discover(&self) -> DiscoveryOutcome {
        self.discovery.poll_once().await
    }

    /// Sends `content`, showing it immediately as pending. Groups whose
    /// membership has not propagated yet are refused until readiness
    /// reports them sendable.
    pub async fn send_message(&self, conversation_id: &ConversationId, content: &str) -> Result<Message, ProtocolError> {
        let content = content.trim();
        if content.is_empty() {
            return Err(ProtocolError::InvalidRequest("message content is empty".into()));
        }
        let conversation = self.cache.conversation(conversation_id).await.ok_or_else(|| {
            ProtocolError::InvalidRequest(format!("unknown conversation {conversation_id}"))
        })?;
        let session = self.sessions.require().await?;

        let readiness = self.readiness.ensure_ready(conversation_id).await;
        if !readiness.can_send {
            return Err(readiness.failure.unwrap_or_else(|| match conversation.membership {
                Membership::Direct { peer } => ProtocolError::RecipientNotRegistered(peer),
                Membership::Group { .. } => {
                    ProtocolError::MembershipNotYetPublished(conversation_id.clone())
                }
            }));
        }

        let provisional = MessageId::provisional();
        let pending = Message {
            id: provisional.clone(),
            conversation_id: conversation_id.clone(),
            sender: session.inbox_id().clone(),
            content: content.to_string(),
            sent_at_ns: Utc::now().timestamp_nanos_opt().unwrap_or_default(),
            status: DeliveryStatus::Pending,
        };
        self.cache
            .append_messages(conversation_id, vec![pending.clone()])
            .await;
        let _ = self.events.send(EngineEvent::MessageUpdated(pending));

        let sessions = Arc::clone(&self.sessions);
        let sent = self
            .supervisor
            .run_with_backoff("send_message", Some(conversation_id), || {
                let sessions = Arc::clone(&sessions);
                let conversation_id = conversation_id.clone();
                let content = content.to_string();
                async move {
                    let session = sessions.require().await?;
                    session.client().send(&conversation_id, &content).await
                }
            })
            .await;

        match sent {
            Ok(accepted) => {
                let message = self
                    .cache
                    .replace_provisional(conversation_id, &provisional, accepted.clone())
                    .await
                    .ok_or_else(|| {
                        ProtocolError::Unknown(format!(
                            "sent message {accepted} vanished from conversation {conversation_id}"
                        ))
                    })?;
                let _ = self.events.send(EngineEvent::MessageUpdated(message.clone()));
                Ok(message)
            }
            Err(error) => {
                warn!(conversation_id = %conversation_id, error = %error, "engine: send failed");
                if let Some(failed) = self.cache.mark_failed(conversation_id, &provisional).await {
                    let _ = self.events.send(EngineEvent::MessageUpdated(failed));
                }
                Err(error)
            }
        }
    }

    pub async fn get_readiness(&self, conversation_id: &ConversationId) -> ReadinessState {
        self.readiness.get(conversation_id).await
    }

    /// Runs (or joins) a readiness cycle and returns its final state.
    pub async fn ensure_ready(&self, conversation_id: &ConversationId) -> ReadinessState {
        self.readiness.ensure_ready(conversation_id).await
    }

    pub async fn retry_readiness(&self, conversation_id: &ConversationId) -> ReadinessState {
        self.readiness.retry(conversation_id).await
    }

    pub async fn refresh_readiness(&self, conversation_id: &ConversationId) -> ReadinessState {
        self.readiness.refresh(conversation_id).await
    }

    /// Creates a conversation, caches it and starts checking readiness in
    /// the background.
    pub async fn create_conversation(&self, target: ConversationTarget) -> Result<ConversationId, ProtocolError> {
        let session = self.sessions.require().await?;
        match &target {
            ConversationTarget::Direct(peer) if peer == session.inbox_id() => {
                return Err(ProtocolError::InvalidRequest(
                    "cannot start a conversation with yourself".into(),
                ));
            }
            ConversationTarget::Group(members) if members.is_empty() => {
                return Err(ProtocolError::InvalidRequest(
                    "a group needs at least one other member".into(),
                ));
            }
            _ => {}
        }

        let sessions = Arc::clone(&self.sessions);
        let descriptor = self
            .supervisor
            .run_with_backoff("create_conversation", None, || {
                let sessions = Arc::clone(&sessions);
                let target = target.clone();
                async move {
                    let session = sessions.require().await?;
                    session.client().create_conversation(&target).await
                }
            })
            .await?;

        let conversation_id = descriptor.id.clone();
        self.cache.upsert_descriptor(descriptor).await;
        let _ = self.events.send(EngineEvent::ConversationsChanged {
            added: vec![conversation_id.clone()],
            updated: Vec::new(),
            removed: Vec::new(),
        });
        info!(conversation_id = %conversation_id, "engine: conversation created");

        let readiness = Arc::clone(&self.readiness);
        let id = conversation_id.clone();
        tokio::spawn(async move {
            readiness.ensure_ready(&id).await;
        });
        Ok(conversation_id)
    }

    /// Removes a conversation from this device and asks the network to hide
    /// it. The local removal stands even if the network call fails.
    pub async fn hide_conversation(&self, conversation_id: &ConversationId) -> bool {
        let removed = self.cache.evict_conversation(conversation_id).await;
        self.readiness.forget(conversation_id).await;
        if let Some(session) = self.sessions.current().await {
            if let Err(err) = session.client().hide_conversation(conversation_id).await {
                warn!(conversation_id = %conversation_id, error = %err, "engine: remote hide failed");
            }
        }
        if removed {
            let _ = self.events.send(EngineEvent::ConversationsChanged {
                added: Vec::new(),
                updated: Vec::new(),
                removed: vec![conversation_id.clone()],
            });
        }
        removed
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    pub fn on_message<F>(&self, callback: F) -> ListenerHandle
    where
        F: FnMut(Message) + Send + 'static,
    {
        spawn_listener(
            &self.events,
            |event| match event {
                EngineEvent::MessageReceived(message) => Some(message),
                _ => None,
            },
            callback,
        )
    }

    pub fn on_conversations_changed<F>(&self, callback: F) -> ListenerHandle
    where
        F: FnMut(Vec<ConversationId>) + Send + 'static,
    {
        spawn_listener(
            &self.events,
            |event| match event {
                EngineEvent::ConversationsChanged {
                    added,
                    updated,
                    removed,
                } => Some(added.into_iter().chain(updated).chain(removed).collect()),
                _ => None,
            },
            callback,
        )
    }

    pub async fn recovery_status(&self) -> RecoveryStatus {
        self.supervisor.status().await
    }

    pub async fn reset_and_reauthenticate(&self) -> RecoveryOutcome {
        self.supervisor.reset_and_reauthenticate().await
    }

    pub async fn revoke_installation_and_retry(
        &self,
        signer: Arc<dyn Signer>,
        installation: &InstallationId,
    ) -> InitResult {
        self.ensure_fault_intake().await;
        self.switch_identity(&signer.identifier()).await;
        let session = self
            .supervisor
            .revoke_installation_and_retry(signer, installation)
            .await?;
        self.discovery.start().await;
        Ok(session)
    }

    pub fn cache(&self) -> &Arc<LocalCache> {
        &self.cache
    }

    pub fn supervisor(&self) -> &Arc<FaultRecoverySupervisor> {
        &self.supervisor
    }

    pub fn discovery(&self) -> &Arc<DiscoveryLoop> {
        &self.discovery
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }
}

impl Drop for SyncEngine {
    fn drop(&mut self) {
        if let Ok(mut intake) = self.intake.try_lock() {
            if let Some(handle) = intake.take() {
                handle.abort();
            }
        }
        self.discovery.abort();
    }
}
