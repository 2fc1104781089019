use serde::Serialize;
use shared::domain::{ConversationId, Message};
use tokio::{
    sync::broadcast::{self, error::RecvError},
    task::JoinHandle,
};
use tracing::warn;

use crate::{readiness::ReadinessState, recovery::RecoveryStatus, session::SessionState};

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum EngineEvent {
    MessageReceived(Message),
    /// A locally sent message changed delivery status or id.
    MessageUpdated(Message),
    ConversationsChanged {
        added: Vec<ConversationId>,
        updated: Vec<ConversationId>,
        removed: Vec<ConversationId>,
    },
    ReadinessChanged {
        conversation_id: ConversationId,
        state: ReadinessState,
    },
    SessionStateChanged(SessionState),
    RecoveryStateChanged(RecoveryStatus),
    StreamEnded {
        reason: String,
    },
    Error(String),
}

pub type EventSender = broadcast::Sender<EngineEvent>;

/// Keeps a callback subscribed until dropped.
pub struct ListenerHandle {
    task: JoinHandle<()>,
}

impl ListenerHandle {
    pub fn unsubscribe(self) {}
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Runs `callback` for every event `select` picks out.
pub(crate) fn spawn_listener<T, S, F>(events: &EventSender, select: S, mut callback: F) -> ListenerHandle
where
    T: Send + 'static,
    S: Fn(EngineEvent) -> Option<T> + Send + 'static,
    F: FnMut(T) + Send + 'static,
{
    let mut rx = events.subscribe();
    let task = tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    if let Some(item) = select(event) {
                        callback(item);
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "events: listener lagged behind");
                }
                Err(RecvError::Closed) => break,
            }
        }
    });
    ListenerHandle { task }
}
