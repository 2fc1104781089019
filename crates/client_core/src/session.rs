//! Identity and session lifecycle.
//!
//! At most one protocol client exists at a time. Concurrent `initialize`
//! calls for the same identity share one creation attempt; a different
//! identity tears the current session down first.

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use futures::{
    future::{BoxFuture, Shared},
    FutureExt,
};
use serde::Serialize;
use shared::{
    domain::{InboxId, InstallationId, NetworkEnv},
    error::ProtocolError,
};
use tokio::{
    sync::Mutex,
    time::{timeout, Instant},
};
use tracing::{debug, info, warn};

use crate::{
    events::{EngineEvent, EventSender},
    facade::{ProtocolClient, ProtocolConnector, Signer},
    fault,
    recovery::{FaultSink, FaultSource},
    synchronizer::{MessageSynchronizer, StreamHandle},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Uninitialized,
    Initializing,
    Ready,
    Failed,
}

/// A live protocol client plus the identity it was created for.
pub struct Session {
    generation: u64,
    identity: String,
    inbox_id: InboxId,
    installation_id: InstallationId,
    env: NetworkEnv,
    client: Arc<dyn ProtocolClient>,
}

impl Session {
    /// Increases by one every time a client is created.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn inbox_id(&self) -> &InboxId {
        &self.inbox_id
    }

    pub fn installation_id(&self) -> &InstallationId {
        &self.installation_id
    }

    pub fn env(&self) -> NetworkEnv {
        self.env
    }

    pub fn client(&self) -> &Arc<dyn ProtocolClient> {
        &self.client
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("generation", &self.generation)
            .field("identity", &self.identity)
            .field("inbox_id", &self.inbox_id)
            .field("installation_id", &self.installation_id)
            .field("env", &self.env)
            .finish_non_exhaustive()
    }
}

pub type InitResult = Result<Arc<Session>, ProtocolError>;

/// Recorded runtime faults kept at most; older ones are dropped first.
pub const MAX_RUNTIME_FAULTS: usize = 32;
type SharedInit = Shared<BoxFuture<'static, InitResult>>;

enum Slot {
    Uninitialized,
    Initializing {
        attempt: u64,
        identity: String,
        future: SharedInit,
    },
    Ready(Arc<Session>),
    Failed(ProtocolError),
}

impl Slot {
    fn state(&self) -> SessionState {
        match self {
            Slot::Uninitialized => SessionState::Uninitialized,
            Slot::Initializing { .. } => SessionState::Initializing,
            Slot::Ready(_) => SessionState::Ready,
            Slot::Failed(_) => SessionState::Failed,
        }
    }
}

pub struct SessionManager {
    connector: Arc<dyn ProtocolConnector>,
    synchronizer: Arc<MessageSynchronizer>,
    events: EventSender,
    faults: FaultSink,
    env: NetworkEnv,
    init_timeout: Duration,
    slot: Mutex<Slot>,
    signer: Mutex<Option<Arc<dyn Signer>>>,
    stream: Mutex<Option<StreamHandle>>,
    runtime_faults: Mutex<Vec<(Instant, String)>>,
    attempts: AtomicU64,
    generations: AtomicU64,
}

impl SessionManager {
    pub fn new(
        connector: Arc<dyn ProtocolConnector>,
        synchronizer: Arc<MessageSynchronizer>,
        events: EventSender,
        faults: FaultSink,
        env: NetworkEnv,
        init_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            connector,
            synchronizer,
            events,
            faults,
            env,
            init_timeout,
            slot: Mutex::new(Slot::Uninitialized),
            signer: Mutex::new(None),
            stream: Mutex::new(None),
            runtime_faults: Mutex::new(Vec::new()),
            attempts: AtomicU64::new(0),
            generations: AtomicU64::new(0),
        })
    }

    pub fn connector(&self) -> &Arc<dyn ProtocolConnector> {
        &self.connector
    }

    pub fn env(&self) -> NetworkEnv {
        self.env
    }

    pub async fn state(&self) -> SessionState {
        self.slot.lock().await.state()
    }

    pub async fn current(&self) -> Option<Arc<Session>> {
        match &*self.slot.lock().await {
            Slot::Ready(session) => Some(Arc::clone(session)),
            _ => None,
        }
    }

    pub async fn require(&self) -> InitResult {
        self.current().await.ok_or(ProtocolError::NotInitialized)
    }

    /// Error from the last failed attempt, if the session is in `Failed`.
    pub async fn last_error(&self) -> Option<ProtocolError> {
        match &*self.slot.lock().await {
            Slot::Failed(error) => Some(error.clone()),
            _ => None,
        }
    }

    /// Identifier of the signer the session was last initialized with.
    pub async fn identity(&self) -> Option<String> {
        self.signer.lock().await.as_ref().map(|s| s.identifier())
    }

    pub async fn signer(&self) -> Option<Arc<dyn Signer>> {
        self.signer.lock().await.clone()
    }

    /// Creates (or joins the creation of) the session for `signer`.
    ///
    /// Callers for the same identity all observe the result of a single
    /// attempt. A ready session for the same identity is returned as is.
    pub async fn initialize(self: &Arc<Self>, signer: Option<Arc<dyn Signer>>) -> InitResult {
        let Some(signer) = signer else {
            return Err(ProtocolError::SignerUnavailable);
        };
        let identity = signer.identifier();

        let (future, started) = {
            let mut slot = self.slot.lock().await;
            let mut switching = None;
            let joined = match &*slot {
                Slot::Ready(session) if session.identity == identity => {
                    return Ok(Arc::clone(session));
                }
                Slot::Initializing {
                    identity: current,
                    future,
                    ..
                } if *current == identity => Some(future.clone()),
                Slot::Ready(session) => {
                    switching = Some(Arc::clone(session));
                    None
                }
                Slot::Initializing { .. } | Slot::Failed(_) | Slot::Uninitialized => None,
            };
            match joined {
                Some(future) => {
                    debug!(identity = %identity, "session: joining in-flight initialization");
                    (future, false)
                }
                None => {
                    let attempt = self.attempts.fetch_add(1, Ordering::Relaxed) + 1;
                    let future = Arc::clone(self)
                        .run_initialize(attempt, Arc::clone(&signer), switching)
                        .boxed()
                        .shared();
                    *slot = Slot::Initializing {
                        attempt,
                        identity: identity.clone(),
                        future: future.clone(),
                    };
                    (future, true)
                }
            }
        };

        if started {
            *self.signer.lock().await = Some(signer);
            self.emit_state(SessionState::Initializing);
        }
        future.await
    }

    async fn run_initialize(
        self: Arc<Self>,
        attempt: u64,
        signer: Arc<dyn Signer>,
        previous: Option<Arc<Session>>,
    ) -> InitResult {
        let identity = signer.identifier();
        if let Some(previous) = previous {
            info!(
                from = %previous.identity,
                to = %identity,
                "session: switching identity, closing previous client"
            );
            self.cancel_stream().await;
            previous.client.close().await;
        }

        let started = Instant::now();
        // Only faults raised during this attempt can explain its timeout.
        self.runtime_faults.lock().await.retain(|(at, _)| *at >= started);
        info!(identity = %identity, env = %self.env, attempt, "session: creating protocol client");
        let created = timeout(self.init_timeout, self.connector.create(signer, self.env)).await;
        let result = match created {
            Ok(Ok(client)) => Ok(client),
            Ok(Err(err)) => Err(fault::to_protocol_error(&err, None)),
            Err(_) => Err(self.timeout_error(started).await),
        };

        let client = match result {
            Ok(client) => client,
            Err(error) => {
                warn!(identity = %identity, attempt, error = %error, "session: initialization failed");
                let mut slot = self.slot.lock().await;
                if matches!(&*slot, Slot::Initializing { attempt: current, .. } if *current == attempt)
                {
                    *slot = Slot::Failed(error.clone());
                    drop(slot);
                    self.emit_state(SessionState::Failed);
                }
                return Err(error);
            }
        };

        let session = Arc::new(Session {
            generation: self.generations.fetch_add(1, Ordering::Relaxed) + 1,
            identity,
            inbox_id: client.inbox_id(),
            installation_id: client.installation_id(),
            env: self.env,
            client,
        });

        {
            let mut slot = self.slot.lock().await;
            if !matches!(&*slot, Slot::Initializing { attempt: current, .. } if *current == attempt)
            {
                // Shut down or superseded while the client was being created.
                drop(slot);
                info!(attempt, "session: discarding client from superseded initialization");
                session.client.close().await;
                return Err(ProtocolError::NotInitialized);
            }
            *slot = Slot::Ready(Arc::clone(&session));
        }

        info!(
            identity = %session.identity,
            inbox_id = %session.inbox_id,
            installation_id = %session.installation_id,
            generation = session.generation,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "session: ready"
        );
        if let Err(error) = self.start_stream(&session).await {
            warn!(generation = session.generation, error = %error, "session: failed to open message stream");
            self.faults.report(
                FaultSource::Stream {
                    generation: session.generation,
                },
                error,
            );
        }
        self.emit_state(SessionState::Ready);
        Ok(session)
    }

    async fn timeout_error(&self, started: Instant) -> ProtocolError {
        let faults = self.runtime_faults.lock().await;
        let marker = faults
            .iter()
            .filter(|(at, _)| *at >= started)
            .map(|(_, text)| text)
            .find(|text| fault::is_instability_marker(text));
        match marker {
            Some(marker) => ProtocolError::ProtocolCoreInstability(format!(
                "client creation timed out after {}s: {marker}",
                self.init_timeout.as_secs()
            )),
            None => ProtocolError::Unreachable(format!(
                "client creation timed out after {}s",
                self.init_timeout.as_secs()
            )),
        }
    }

    /// Records an out-of-band runtime error (e.g. an uncaught panic message
    /// from the crypto core) so a pending initialization timeout can be
    /// attributed to it.
    pub async fn report_runtime_fault(&self, text: impl Into<String>) {
        let text = text.into();
        debug!(text = %text, "session: runtime fault recorded");
        let mut faults = self.runtime_faults.lock().await;
        if faults.len() >= MAX_RUNTIME_FAULTS {
            let excess = faults.len() + 1 - MAX_RUNTIME_FAULTS;
            faults.drain(..excess);
        }
        faults.push((Instant::now(), text));
    }

    pub async fn runtime_fault_count(&self) -> usize {
        self.runtime_faults.lock().await.len()
    }

    /// Forgets recorded runtime faults and the connector's own markers.
    pub async fn clear_fault_markers(&self) -> usize {
        let cleared = {
            let mut faults = self.runtime_faults.lock().await;
            let cleared = faults.len();
            faults.clear();
            cleared
        };
        self.connector.clear_runtime_markers();
        cleared
    }

    /// Tears down the current client and creates a new one with the last
    /// signer.
    pub async fn recreate(self: &Arc<Self>) -> InitResult {
        let Some(signer) = self.signer().await else {
            return Err(ProtocolError::SignerUnavailable);
        };
        self.teardown().await;
        self.initialize(Some(signer)).await
    }

    /// Closes the session and forgets the signer.
    pub async fn shutdown(&self) {
        self.teardown().await;
        *self.signer.lock().await = None;
        info!("session: shut down");
    }

    async fn teardown(&self) {
        let previous = std::mem::replace(&mut *self.slot.lock().await, Slot::Uninitialized);
        self.cancel_stream().await;
        if let Slot::Ready(session) = previous {
            session.client.close().await;
        }
        self.emit_state(SessionState::Uninitialized);
    }

    async fn start_stream(&self, session: &Session) -> Result<(), ProtocolError> {
        self.cancel_stream().await;
        let handle = self.synchronizer.subscribe(session).await?;
        *self.stream.lock().await = Some(handle);
        Ok(())
    }

    /// Reopens the message stream on the current session. `generation`
    /// guards against restarting for a session that is already gone.
    pub async fn restart_stream(&self, generation: Option<u64>) -> bool {
        let Some(session) = self.current().await else {
            return false;
        };
        if generation.is_some_and(|g| g != session.generation) {
            debug!(
                stale = generation,
                current = session.generation,
                "session: ignoring stream restart for a replaced session"
            );
            return false;
        }
        match self.start_stream(&session).await {
            Ok(()) => true,
            Err(error) => {
                debug!(generation = session.generation, error = %error, "session: stream restart failed");
                false
            }
        }
    }

    pub async fn cancel_stream(&self) {
        if let Some(handle) = self.stream.lock().await.take() {
            handle.cancel();
        }
    }

    pub async fn stream_active(&self) -> bool {
        self.stream
            .lock()
            .await
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    fn emit_state(&self, state: SessionState) {
        let _ = self.events.send(EngineEvent::SessionStateChanged(state));
    }
}

#[cfg(test)]
#[path = "tests/session_tests.rs"]
mod tests;
