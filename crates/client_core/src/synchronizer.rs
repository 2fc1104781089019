use std::sync::Arc;

use anyhow::{anyhow, Result};
use futures::StreamExt;
use shared::{
    domain::{ConversationId, HistoryCursor, Message},
    error::ProtocolError,
    protocol::ProtocolMessage,
};
use tokio::{sync::watch, task::JoinHandle};
use tracing::{debug, info, warn};

use crate::{
    cache::LocalCache,
    events::{EngineEvent, EventSender},
    fault,
    recovery::{FaultSink, FaultSource},
    session::Session,
};

/// One page of backward history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryPage {
    pub messages: Vec<Message>,
    /// `None` once there is nothing older to fetch.
    pub next_cursor: Option<String>,
}

/// Cancel handle for the global message stream.
///
/// Cancelling is idempotent and wakes the consumer even while it is parked
/// on a stream read. Dropping the handle cancels too.
pub struct StreamHandle {
    generation: u64,
    cancel: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl StreamHandle {
    pub fn cancel(&self) {
        self.cancel.send_replace(true);
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for StreamHandle {
    fn drop(&mut self) {
        self.cancel();
    }
}

pub struct MessageSynchronizer {
    cache: Arc<LocalCache>,
    events: EventSender,
    faults: FaultSink,
    page_size: u32,
}

impl MessageSynchronizer {
    pub fn new(
        cache: Arc<LocalCache>,
        events: EventSender,
        faults: FaultSink,
        page_size: u32,
    ) -> Arc<Self> {
        Arc::new(Self {
            cache,
            events,
            faults,
            page_size: page_size.max(1),
        })
    }

    /// Fetches the next older page for a conversation and caches it.
    pub async fn load_more(
        &self,
        session: &Session,
        conversation_id: &ConversationId,
    ) -> Result<HistoryPage> {
        let cursor = match self.cache.cursor(conversation_id).await {
            HistoryCursor::Exhausted => {
                return Ok(HistoryPage {
                    messages: Vec::new(),
                    next_cursor: None,
                })
            }
            HistoryCursor::NotStarted => None,
            HistoryCursor::At(cursor) => Some(cursor),
        };

        let page = session
            .client()
            .load_messages(conversation_id, cursor.as_deref(), self.page_size)
            .await?;
        let messages: Vec<Message> = page.messages.into_iter().map(Message::from).collect();
        let inserted = self
            .cache
            .append_messages(conversation_id, messages.clone())
            .await;
        let next_cursor = page.next_cursor;
        self.cache
            .set_cursor(
                conversation_id,
                match &next_cursor {
                    Some(cursor) => HistoryCursor::At(cursor.clone()),
                    None => HistoryCursor::Exhausted,
                },
            )
            .await;
        debug!(
            conversation_id = %conversation_id,
            fetched = messages.len(),
            inserted,
            exhausted = next_cursor.is_none(),
            "stream: loaded history page"
        );
        Ok(HistoryPage {
            messages,
            next_cursor,
        })
    }

    /// Walks the newest pages of a conversation until one overlaps what is
    /// already cached, so messages that arrived while the stream was down
    /// are picked up. The backward history cursor is left alone. Returns
    /// how many messages were new.
    pub async fn catch_up(
        &self,
        session: &Session,
        conversation_id: &ConversationId,
    ) -> Result<usize> {
        let mut cursor: Option<String> = None;
        let mut inserted_total = 0;
        loop {
            let page = session
                .client()
                .load_messages(conversation_id, cursor.as_deref(), self.page_size)
                .await?;
            let fetched = page.messages.len();
            let inserted = self
                .cache
                .ingest(
                    conversation_id,
                    page.messages.into_iter().map(Message::from).collect(),
                )
                .await;
            let overlapped = inserted.len() < fetched;
            inserted_total += inserted.len();
            for message in inserted {
                let _ = self.events.send(EngineEvent::MessageReceived(message));
            }
            match page.next_cursor {
                Some(next) if !overlapped => cursor = Some(next),
                _ => break,
            }
        }
        if inserted_total > 0 {
            info!(conversation_id = %conversation_id, inserted = inserted_total, "stream: caught up on missed messages");
        }
        Ok(inserted_total)
    }

    /// Opens the single stream covering every conversation of `session`.
    ///
    /// When the stream ends for any reason other than cancellation, a
    /// [`FaultSource::Stream`] report goes to the supervisor; the stream is
    /// never reopened from here.
    pub async fn subscribe(self: &Arc<Self>, session: &Session) -> Result<StreamHandle, ProtocolError> {
        let generation = session.generation();
        let mut stream = session
            .client()
            .stream_all_messages()
            .await
            .map_err(|err| fault::to_protocol_error(&err, None))?;

        let (cancel, mut cancelled) = watch::channel(false);
        let synchronizer = Arc::clone(self);
        let task = tokio::spawn(async move {
            let ended_with = loop {
                tokio::select! {
                    biased;
                    _ = cancelled.changed() => break None,
                    next = stream.next() => match next {
                        Some(Ok(message)) => synchronizer.ingest_streamed(message).await,
                        Some(Err(err)) => break Some(err),
                        None => break Some(anyhow!("message stream closed by protocol client")),
                    },
                }
            };

            match ended_with {
                None => info!(generation, "stream: cancelled"),
                Some(err) => {
                    let error = fault::to_protocol_error(&err, None);
                    warn!(generation, error = %error, "stream: terminated");
                    let _ = synchronizer.events.send(EngineEvent::StreamEnded {
                        reason: error.to_string(),
                    });
                    synchronizer
                        .faults
                        .report(FaultSource::Stream { generation }, error);
                }
            }
        });

        info!(generation, "stream: subscribed to all conversations");
        Ok(StreamHandle {
            generation,
            cancel,
            task,
        })
    }

    async fn ingest_streamed(&self, message: ProtocolMessage) {
        let conversation_id = message.conversation_id.clone();
        let inserted = self
            .cache
            .ingest(&conversation_id, vec![Message::from(message)])
            .await;
        for message in inserted {
            let _ = self.events.send(EngineEvent::MessageReceived(message));
        }
    }
}

#[cfg(test)]
#[path = "tests/synchronizer_tests.rs"]
mod tests;
