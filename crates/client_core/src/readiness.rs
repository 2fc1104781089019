//! Per-conversation send readiness.
//!
//! Direct conversations get one definite check whose answer is cached until
//! an explicit refresh; network errors on that check are retried with capped
//! backoff and never cached. Groups are polled on a fixed delay until the network
//! reports their membership as published or the retry budget runs out.
//! Every change is broadcast as [`EngineEvent::ReadinessChanged`].

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use chrono::{DateTime, Utc};
use futures::{
    future::{BoxFuture, Shared},
    FutureExt,
};
use serde::Serialize;
use shared::{
    domain::{ConversationId, InboxId, Membership},
    error::ProtocolError,
};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::{
    cache::LocalCache,
    config::ReadinessPolicy,
    events::{EngineEvent, EventSender},
    fault::{self, FaultClass},
    recovery::{FaultSink, FaultSource},
    session::SessionManager,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadinessPhase {
    Unknown,
    Checking,
    Ready,
    Retrying,
    Exhausted,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReadinessState {
    pub phase: ReadinessPhase,
    pub can_send: bool,
    /// Checks performed in the current cycle, starting at 1.
    pub attempt: u32,
    pub last_error: Option<String>,
    pub last_checked_at: Option<DateTime<Utc>>,
    /// Why the conversation cannot be sent to, once exhausted.
    #[serde(skip)]
    pub failure: Option<ProtocolError>,
}

impl ReadinessState {
    pub fn unknown() -> Self {
        Self {
            phase: ReadinessPhase::Unknown,
            can_send: false,
            attempt: 0,
            last_error: None,
            last_checked_at: None,
            failure: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self.phase,
            ReadinessPhase::Ready | ReadinessPhase::Exhausted
        )
    }

    fn at(phase: ReadinessPhase, attempt: u32, last_error: Option<String>) -> Self {
        Self {
            phase,
            can_send: phase == ReadinessPhase::Ready,
            attempt,
            last_error,
            last_checked_at: Some(Utc::now()),
            failure: None,
        }
    }

    fn exhausted(attempt: u32, failure: ProtocolError) -> Self {
        Self {
            failure: Some(failure.clone()),
            ..Self::at(ReadinessPhase::Exhausted, attempt, Some(failure.to_string()))
        }
    }
}

impl Default for ReadinessState {
    fn default() -> Self {
        Self::unknown()
    }
}

type SharedCheck = Shared<BoxFuture<'static, ReadinessState>>;

#[derive(Default)]
struct Entry {
    state: ReadinessState,
    generation: u64,
    inflight: Option<(u64, SharedCheck)>,
    /// Cached answer for direct conversations.
    direct: Option<bool>,
    /// Exhausted by errors rather than an answer; the next request checks
    /// again.
    recheck: bool,
}

pub struct ReadinessReconciler {
    sessions: Arc<SessionManager>,
    cache: Arc<LocalCache>,
    events: EventSender,
    faults: FaultSink,
    policy: ReadinessPolicy,
    entries: Mutex<HashMap<ConversationId, Entry>>,
    generations: AtomicU64,
}

impl ReadinessReconciler {
    pub fn new(
        sessions: Arc<SessionManager>,
        cache: Arc<LocalCache>,
        events: EventSender,
        faults: FaultSink,
        policy: ReadinessPolicy,
    ) -> Arc<Self> {
        Arc::new(Self {
            sessions,
            cache,
            events,
            faults,
            policy,
            entries: Mutex::new(HashMap::new()),
            generations: AtomicU64::new(0),
        })
    }

    /// Generations are unique across entries so a loop started for a
    /// forgotten entry can never match a newer one.
    fn next_generation(&self) -> u64 {
        self.generations.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn entry<'a>(&self, entries: &'a mut HashMap<ConversationId, Entry>, conversation_id: &ConversationId) -> &'a mut Entry {
        entries
            .entry(conversation_id.clone())
            .or_insert_with(|| Entry {
                generation: self.next_generation(),
                ..Entry::default()
            })
    }

    pub async fn get(&self, conversation_id: &ConversationId) -> ReadinessState {
        self.entries
            .lock()
            .await
            .get(conversation_id)
            .map(|entry| entry.state.clone())
            .unwrap_or_default()
    }

    /// Starts a check cycle unless one is running or a terminal answer is
    /// already known, and waits for the cycle to finish.
    pub async fn ensure_ready(self: &Arc<Self>, conversation_id: &ConversationId) -> ReadinessState {
        let check = {
            let mut entries = self.entries.lock().await;
            let entry = self.entry(&mut entries, conversation_id);
            if entry.state.is_terminal() && !entry.recheck {
                return entry.state.clone();
            }
            let running = match &entry.inflight {
                Some((generation, check)) if *generation == entry.generation => Some(check.clone()),
                _ => None,
            };
            match running {
                Some(check) => check,
                None => self.start_cycle(conversation_id, entry),
            }
        };
        check.await
    }

    /// Resets the attempt counter and starts over. A cached direct answer
    /// is kept.
    pub async fn retry(self: &Arc<Self>, conversation_id: &ConversationId) -> ReadinessState {
        self.reset(conversation_id, false).await;
        self.ensure_ready(conversation_id).await
    }

    /// Like [`retry`](Self::retry) but also forgets a cached direct answer.
    pub async fn refresh(self: &Arc<Self>, conversation_id: &ConversationId) -> ReadinessState {
        self.reset(conversation_id, true).await;
        self.ensure_ready(conversation_id).await
    }

    /// Stops tracking a conversation entirely.
    pub async fn forget(&self, conversation_id: &ConversationId) {
        self.entries.lock().await.remove(conversation_id);
    }

    /// Drops every entry, cached direct answers included. Running cycles
    /// become no-ops.
    pub async fn reset_all(&self) -> usize {
        let dropped = {
            let mut entries = self.entries.lock().await;
            let dropped = entries.len();
            entries.clear();
            dropped
        };
        if dropped > 0 {
            info!(dropped, "readiness: all entries reset");
        }
        dropped
    }

    /// Abandons every running cycle. Conversations that were mid-cycle go
    /// back to `Unknown` so the next request starts fresh.
    pub async fn cancel_all(&self) -> usize {
        let mut reset = Vec::new();
        {
            let mut entries = self.entries.lock().await;
            for (conversation_id, entry) in entries.iter_mut() {
                entry.generation = self.next_generation();
                entry.inflight = None;
                if !entry.state.is_terminal() && entry.state.phase != ReadinessPhase::Unknown {
                    entry.state = ReadinessState::unknown();
                    reset.push(conversation_id.clone());
                }
            }
        }
        for conversation_id in &reset {
            self.emit(conversation_id, ReadinessState::unknown());
        }
        if !reset.is_empty() {
            info!(cancelled = reset.len(), "readiness: cancelled in-flight checks");
        }
        reset.len()
    }

    async fn reset(&self, conversation_id: &ConversationId, clear_direct: bool) {
        let mut entries = self.entries.lock().await;
        let generation = self.next_generation();
        let entry = self.entry(&mut entries, conversation_id);
        entry.generation = generation;
        entry.inflight = None;
        entry.recheck = false;
        entry.state = ReadinessState::unknown();
        if clear_direct {
            entry.direct = None;
        }
    }

    fn start_cycle(self: &Arc<Self>, conversation_id: &ConversationId, entry: &mut Entry) -> SharedCheck {
        entry.recheck = false;
        let generation = entry.generation;
        let task = tokio::spawn(Arc::clone(self).run_cycle(conversation_id.clone(), generation));
        let check = async move {
            task.await.unwrap_or_else(|err| {
                ReadinessState::exhausted(
                    0,
                    ProtocolError::Unknown(format!("readiness task failed: {err}")),
                )
            })
        }
        .boxed()
        .shared();
        entry.inflight = Some((generation, check.clone()));
        check
    }

    async fn run_cycle(self: Arc<Self>, conversation_id: ConversationId, generation: u64) -> ReadinessState {
        let Some(conversation) = self.cache.conversation(&conversation_id).await else {
            let state = ReadinessState::exhausted(
                0,
                ProtocolError::InvalidRequest(format!("conversation {conversation_id} is not cached")),
            );
            return self.finish(&conversation_id, generation, state).await;
        };
        match conversation.membership {
            Membership::Direct { peer } => {
                self.check_direct(&conversation_id, &peer, generation).await
            }
            Membership::Group { .. } => self.check_group(&conversation_id, generation).await,
        }
    }

    async fn check_direct(&self, conversation_id: &ConversationId, peer: &InboxId, generation: u64) -> ReadinessState {
        let answered = |can_send: bool, attempt: u32| {
            if can_send {
                ReadinessState::at(ReadinessPhase::Ready, attempt, None)
            } else {
                ReadinessState::exhausted(attempt, ProtocolError::RecipientNotRegistered(peer.clone()))
            }
        };

        let cached = self
            .entries
            .lock()
            .await
            .get(conversation_id)
            .and_then(|entry| entry.direct);
        if let Some(can_send) = cached {
            return self
                .finish(conversation_id, generation, answered(can_send, 1))
                .await;
        }

        let backoff = self.policy.backoff;
        let mut last_error = None;
        for attempt in 1..=backoff.max_attempts {
            if !self
                .transition(
                    conversation_id,
                    generation,
                    ReadinessState::at(ReadinessPhase::Checking, attempt, last_error.clone()),
                )
                .await
            {
                return self.get(conversation_id).await;
            }

            let error = match self.check_once(conversation_id).await {
                Ok(can_send) => {
                    if let Some(entry) = self.entries.lock().await.get_mut(conversation_id) {
                        if entry.generation == generation {
                            entry.direct = Some(can_send);
                        }
                    }
                    return self
                        .finish(conversation_id, generation, answered(can_send, attempt))
                        .await;
                }
                Err(error) => error,
            };

            if !retryable(&error) || attempt == backoff.max_attempts {
                warn!(
                    conversation_id = %conversation_id,
                    attempt,
                    error = %error,
                    "readiness: direct check failed"
                );
                if let Some(entry) = self.entries.lock().await.get_mut(conversation_id) {
                    if entry.generation == generation {
                        entry.recheck = true;
                    }
                }
                return self
                    .finish(conversation_id, generation, ReadinessState::exhausted(attempt, error))
                    .await;
            }

            let delay = backoff.delay_for(attempt);
            debug!(
                conversation_id = %conversation_id,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "readiness: direct check failed, backing off"
            );
            last_error = Some(error.to_string());
            if !self
                .transition(
                    conversation_id,
                    generation,
                    ReadinessState::at(ReadinessPhase::Retrying, attempt, last_error.clone()),
                )
                .await
            {
                return self.get(conversation_id).await;
            }
            tokio::time::sleep(delay).await;
        }

        // Only reached with a zero attempt budget.
        let state = ReadinessState::exhausted(0, ProtocolError::NotInitialized);
        self.finish(conversation_id, generation, state).await
    }

    async fn check_group(&self, conversation_id: &ConversationId, generation: u64) -> ReadinessState {
        let checks = self.policy.max_retries + 1;
        let mut last_error = None;
        let mut failure = ProtocolError::MembershipNotYetPublished(conversation_id.clone());

        for attempt in 1..=checks {
            if !self
                .transition(
                    conversation_id,
                    generation,
                    ReadinessState::at(ReadinessPhase::Checking, attempt, last_error.clone()),
                )
                .await
            {
                return self.get(conversation_id).await;
            }

            match self.check_once(conversation_id).await {
                Ok(true) => {
                    self.cache.mark_membership_published(conversation_id).await;
                    let state = ReadinessState::at(ReadinessPhase::Ready, attempt, None);
                    return self.finish(conversation_id, generation, state).await;
                }
                Ok(false) => {
                    failure = ProtocolError::MembershipNotYetPublished(conversation_id.clone());
                    last_error = Some(failure.to_string());
                }
                Err(error) => {
                    last_error = Some(error.to_string());
                    failure = error;
                }
            }

            if attempt < checks {
                debug!(
                    conversation_id = %conversation_id,
                    attempt,
                    delay_ms = self.policy.retry_delay.as_millis() as u64,
                    "readiness: group not ready, retrying"
                );
                if !self
                    .transition(
                        conversation_id,
                        generation,
                        ReadinessState::at(ReadinessPhase::Retrying, attempt, last_error.clone()),
                    )
                    .await
                {
                    return self.get(conversation_id).await;
                }
                tokio::time::sleep(self.policy.retry_delay).await;
            }
        }

        warn!(
            conversation_id = %conversation_id,
            checks,
            "readiness: retries exhausted"
        );
        let state = ReadinessState::exhausted(checks, failure);
        self.finish(conversation_id, generation, state).await
    }

    async fn check_once(&self, conversation_id: &ConversationId) -> Result<bool, ProtocolError> {
        let session = self.sessions.require().await?;
        match session.client().can_send(conversation_id).await {
            Ok(can_send) => Ok(can_send),
            Err(err) => {
                let error = fault::to_protocol_error(&err, Some(conversation_id));
                if fault::class_of(&error) != FaultClass::MembershipPropagation {
                    self.faults
                        .report(FaultSource::Readiness(conversation_id.clone()), error.clone());
                }
                Err(error)
            }
        }
    }

    /// Applies `state` unless the cycle was superseded. Returns false when
    /// the cycle should stop.
    async fn transition(&self, conversation_id: &ConversationId, generation: u64, state: ReadinessState) -> bool {
        {
            let mut entries = self.entries.lock().await;
            let Some(entry) = entries.get_mut(conversation_id) else {
                return false;
            };
            if entry.generation != generation {
                return false;
            }
            entry.state = state.clone();
        }
        self.emit(conversation_id, state);
        true
    }

    async fn finish(&self, conversation_id: &ConversationId, generation: u64, state: ReadinessState) -> ReadinessState {
        if self.transition(conversation_id, generation, state.clone()).await {
            if let Some(entry) = self.entries.lock().await.get_mut(conversation_id) {
                if entry.generation == generation {
                    entry.inflight = None;
                }
            }
            info!(
                conversation_id = %conversation_id,
                phase = ?state.phase,
                attempt = state.attempt,
                "readiness: settled"
            );
            state
        } else {
            self.get(conversation_id).await
        }
    }

    fn emit(&self, conversation_id: &ConversationId, state: ReadinessState) {
        let _ = self.events.send(EngineEvent::ReadinessChanged {
            conversation_id: conversation_id.clone(),
            state,
        });
    }
}

/// Network trouble is worth another direct check; answers that need a
/// decision, a missing session and crypto-core faults are not.
fn retryable(error: &ProtocolError) -> bool {
    if fault::surfaces_immediately(error) || *error == ProtocolError::NotInitialized {
        return false;
    }
    matches!(
        fault::class_of(error),
        FaultClass::TransientNetwork | FaultClass::MembershipPropagation | FaultClass::Unknown
    )
}

#[cfg(test)]
#[path = "tests/readiness_tests.rs"]
mod tests;
