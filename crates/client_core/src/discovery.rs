use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use shared::{
    domain::{ConsentState, ConversationId, HistoryCursor, MessageId},
    error::ProtocolError,
};
use tokio::{
    sync::{Mutex, Notify},
    task::JoinHandle,
    time::{interval, MissedTickBehavior},
};
use tracing::{debug, info, warn};

use crate::{
    cache::{LocalCache, UpsertOutcome},
    events::{EngineEvent, EventSender},
    fault,
    recovery::{FaultSink, FaultSource},
    session::{Session, SessionManager},
    synchronizer::MessageSynchronizer,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryOutcome {
    /// Another poll was still running.
    Skipped,
    NoSession,
    Completed {
        added: Vec<ConversationId>,
        updated: Vec<ConversationId>,
    },
    Failed(ProtocolError),
}

/// Clears the in-flight flag even if the poll future is dropped.
struct PollGuard<'a>(&'a AtomicBool);

impl Drop for PollGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Periodically lists conversations and merges them into the cache.
///
/// Conversations without any history yet get their most recent page; known
/// ones whose newest remote message is missing locally are caught up. A
/// resync request (sent after the message stream is reopened) runs the
/// catch-up for every cached conversation without waiting for the timer.
pub struct DiscoveryLoop {
    sessions: Arc<SessionManager>,
    synchronizer: Arc<MessageSynchronizer>,
    cache: Arc<LocalCache>,
    events: EventSender,
    faults: FaultSink,
    interval: Duration,
    polling: AtomicBool,
    resync: Notify,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl DiscoveryLoop {
    pub fn new(
        sessions: Arc<SessionManager>,
        synchronizer: Arc<MessageSynchronizer>,
        cache: Arc<LocalCache>,
        events: EventSender,
        faults: FaultSink,
        interval: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            sessions,
            synchronizer,
            cache,
            events,
            faults,
            interval,
            polling: AtomicBool::new(false),
            resync: Notify::new(),
            task: Mutex::new(None),
        })
    }

    /// Runs a single poll. Overlapping calls return [`DiscoveryOutcome::Skipped`].
    pub async fn poll_once(&self) -> DiscoveryOutcome {
        if self
            .polling
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("discovery: previous poll still running, skipping");
            return DiscoveryOutcome::Skipped;
        }
        let _guard = PollGuard(&self.polling);
        self.poll().await
    }

    async fn poll(&self) -> DiscoveryOutcome {
        let Some(session) = self.sessions.current().await else {
            return DiscoveryOutcome::NoSession;
        };
        let descriptors = match session.client().sync_and_list().await {
            Ok(descriptors) => descriptors,
            Err(err) => {
                let error = fault::to_protocol_error(&err, None);
                warn!(error = %error, "discovery: sync failed");
                self.faults.report(FaultSource::Discovery, error.clone());
                return DiscoveryOutcome::Failed(error);
            }
        };

        let listed = descriptors.len();
        let mut added = Vec::new();
        let mut updated = Vec::new();
        let mut latest = Vec::new();
        for descriptor in descriptors {
            let id = descriptor.id.clone();
            // Hidden here and never cached (or evicted): keep it out.
            if descriptor.consent == ConsentState::Denied && self.cache.conversation(&id).await.is_none() {
                continue;
            }
            if descriptor.consent != ConsentState::Denied {
                latest.push((id.clone(), descriptor.last_message_id.clone()));
            }
            match self.cache.upsert_descriptor(descriptor).await {
                UpsertOutcome::Inserted => added.push(id),
                UpsertOutcome::Updated => updated.push(id),
                UpsertOutcome::Unchanged => {}
            }
        }

        for (conversation_id, last_message_id) in &latest {
            self.sync_history(&session, conversation_id, last_message_id.as_ref())
                .await;
        }

        if added.is_empty() && updated.is_empty() {
            debug!(listed, "discovery: no changes");
        } else {
            info!(listed, added = added.len(), updated = updated.len(), "discovery: conversations changed");
            let _ = self.events.send(EngineEvent::ConversationsChanged {
                added: added.clone(),
                updated: updated.clone(),
                removed: Vec::new(),
            });
        }
        DiscoveryOutcome::Completed { added, updated }
    }

    /// Fills the gap between the cache and the network for one conversation.
    ///
    /// The stream only covers what arrives while it is open. A conversation
    /// that never got history is primed with its latest page (and retried on
    /// later polls until that works); a known one is caught up when the
    /// newest remote message is not cached.
    async fn sync_history(
        &self,
        session: &Session,
        conversation_id: &ConversationId,
        last_message_id: Option<&MessageId>,
    ) {
        let result = match self.cache.cursor(conversation_id).await {
            HistoryCursor::NotStarted => self
                .synchronizer
                .load_more(session, conversation_id)
                .await
                .map(|page| page.messages.len()),
            _ => match last_message_id {
                Some(id) if !self.cache.contains_message(conversation_id, id).await => {
                    self.synchronizer.catch_up(session, conversation_id).await
                }
                _ => return,
            },
        };
        if let Err(err) = result {
            let error = fault::to_protocol_error(&err, Some(conversation_id));
            warn!(conversation_id = %conversation_id, error = %error, "discovery: failed to sync history");
            self.faults.report(FaultSource::Discovery, error);
        }
    }

    /// Asks the running loop to catch up every cached conversation.
    pub fn request_resync(&self) {
        self.resync.notify_one();
    }

    /// Pulls the newest pages of every cached conversation that already has
    /// history. Returns how many messages were new.
    pub async fn catch_up_all(&self) -> usize {
        let Some(session) = self.sessions.current().await else {
            return 0;
        };
        let mut inserted = 0;
        for conversation in self.cache.get_conversations().await {
            if conversation.cursor == HistoryCursor::NotStarted {
                continue;
            }
            match self.synchronizer.catch_up(&session, &conversation.id).await {
                Ok(count) => inserted += count,
                Err(err) => {
                    let error = fault::to_protocol_error(&err, Some(&conversation.id));
                    warn!(conversation_id = %conversation.id, error = %error, "discovery: catch-up failed");
                    self.faults.report(FaultSource::Discovery, error);
                }
            }
        }
        debug!(inserted, "discovery: resync finished");
        inserted
    }

    /// Starts the background loop; the first poll runs immediately.
    /// Calling it again while running is a no-op.
    pub async fn start(self: &Arc<Self>) {
        let mut task = self.task.lock().await;
        if task.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }
        let discovery = Arc::clone(self);
        *task = Some(tokio::spawn(async move {
            let mut ticker = interval(discovery.interval.max(Duration::from_millis(1)));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        discovery.poll_once().await;
                    }
                    _ = discovery.resync.notified() => {
                        discovery.catch_up_all().await;
                    }
                }
            }
        }));
        info!(interval_ms = self.interval.as_millis() as u64, "discovery: started");
    }

    pub async fn stop(&self) {
        if let Some(handle) = self.task.lock().await.take() {
            handle.abort();
            info!("discovery: stopped");
        }
    }

    /// Non-async [`stop`](Self::stop) for use from `Drop`.
    pub fn abort(&self) {
        if let Ok(mut task) = self.task.try_lock() {
            if let Some(handle) = task.take() {
                handle.abort();
            }
        }
    }

    pub async fn is_running(&self) -> bool {
        self.task
            .lock()
            .await
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }
}

#[cfg(test)]
#[path = "tests/discovery_tests.rs"]
mod tests;
