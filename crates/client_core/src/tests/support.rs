use std::{sync::Arc, time::Duration};

use shared::domain::{ConversationId, NetworkEnv};
use tokio::sync::{broadcast, mpsc};

use crate::{
    cache::LocalCache,
    config::{EngineSettings, ReadinessPolicy},
    events::{EngineEvent, EventSender},
    readiness::ReadinessReconciler,
    recovery::{FaultReport, FaultSink},
    session::SessionManager,
    simulated::{SimulatedNetwork, StaticSigner},
    synchronizer::MessageSynchronizer,
};

/// Components wired the way the engine wires them, minus the supervisor.
pub(crate) struct Stack {
    pub network: SimulatedNetwork,
    pub cache: Arc<LocalCache>,
    pub events: EventSender,
    pub faults: FaultSink,
    pub reports: mpsc::UnboundedReceiver<FaultReport>,
    pub synchronizer: Arc<MessageSynchronizer>,
    pub sessions: Arc<SessionManager>,
}

pub(crate) fn stack() -> Stack {
    stack_with(Duration::from_secs(60), 50)
}

pub(crate) fn stack_with(init_timeout: Duration, page_size: u32) -> Stack {
    let network = SimulatedNetwork::new();
    let cache = Arc::new(LocalCache::new());
    let (events, _) = broadcast::channel(256);
    let (faults, reports) = FaultSink::channel();
    let synchronizer =
        MessageSynchronizer::new(Arc::clone(&cache), events.clone(), faults.clone(), page_size);
    let sessions = SessionManager::new(
        network.connector(),
        Arc::clone(&synchronizer),
        events.clone(),
        faults.clone(),
        NetworkEnv::Dev,
        init_timeout,
    );
    Stack {
        network,
        cache,
        events,
        faults,
        reports,
        synchronizer,
        sessions,
    }
}

impl Stack {
    pub fn readiness(&self, max_retries: u32, retry_delay: Duration) -> Arc<ReadinessReconciler> {
        ReadinessReconciler::new(
            Arc::clone(&self.sessions),
            Arc::clone(&self.cache),
            self.events.clone(),
            self.faults.clone(),
            ReadinessPolicy {
                max_retries,
                retry_delay,
                backoff: EngineSettings::default().backoff_policy(),
            },
        )
    }

    pub async fn sign_in(&self, identity: &str) -> Arc<crate::session::Session> {
        self.sessions
            .initialize(Some(StaticSigner::new(identity)))
            .await
            .expect("session")
    }

    /// Lists conversations through the current session and caches them.
    pub async fn discover(&self) -> Vec<ConversationId> {
        let session = self.sessions.require().await.expect("session");
        let descriptors = session.client().sync_and_list().await.expect("sync");
        let mut ids = Vec::new();
        for descriptor in descriptors {
            ids.push(descriptor.id.clone());
            self.cache.upsert_descriptor(descriptor).await;
        }
        ids
    }
}

/// Waits for the first event `select` accepts.
pub(crate) async fn next_event<T>(
    rx: &mut broadcast::Receiver<EngineEvent>,
    select: impl Fn(EngineEvent) -> Option<T>,
) -> T {
    loop {
        let event = tokio::time::timeout(Duration::from_secs(30), rx.recv())
            .await
            .expect("event before timeout")
            .expect("event channel open");
        if let Some(item) = select(event) {
            return item;
        }
    }
}

/// Everything currently queued on `rx`.
pub(crate) fn drain(rx: &mut broadcast::Receiver<EngineEvent>) -> Vec<EngineEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}
