//! Fault intake and the recovery ladder.
//!
//! Components never recover on their own: they push a [`FaultReport`] into
//! the [`FaultSink`] and carry on. The supervisor classifies each report and
//! decides between a stream restart, a backoff retry, or the escalating
//! ladder used for crypto-core instability:
//!
//! 1. cancel in-flight work
//! 2. ask the client to release memory
//! 3. clear runtime fault markers
//! 4. clear protocol-library caches
//! 5. recreate the client (bounded, with backoff)
//! 6. wipe the local identity store (needs consent unless configured)
//!
//! After each step the client is probed with a sync; the first passing probe
//! ends the ladder. Steps 4-6 run at most once per cooldown window.

use std::{future::Future, sync::Arc, time::Duration};

use anyhow::Result;
use serde::Serialize;
use shared::{
    domain::{ConversationId, InstallationId},
    error::ProtocolError,
};
use tokio::{
    sync::{mpsc, Mutex},
    task::JoinHandle,
    time::{sleep, Instant},
};
use tracing::{debug, error, info, warn};

use crate::{
    config::{BackoffPolicy, MIN_RECREATE_ATTEMPTS},
    discovery::DiscoveryLoop,
    events::{EngineEvent, EventSender},
    facade::Signer,
    fault::{self, FaultClass},
    readiness::ReadinessReconciler,
    session::{InitResult, SessionManager},
};

/// Where a fault was observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FaultSource {
    Discovery,
    Stream { generation: u64 },
    Readiness(ConversationId),
    Session,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FaultReport {
    pub source: FaultSource,
    pub error: ProtocolError,
}

/// Write side of the fault channel, cloned into every component.
#[derive(Debug, Clone)]
pub struct FaultSink {
    tx: mpsc::UnboundedSender<FaultReport>,
}

impl FaultSink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<FaultReport>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn report(&self, source: FaultSource, error: ProtocolError) {
        if self.tx.send(FaultReport { source, error }).is_err() {
            debug!("recovery: fault intake closed, dropping report");
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryPhase {
    Idle,
    Recovering,
    /// Light steps did not help and the aggressive ones are cooling down.
    Degraded,
    /// Everything short of wiping the identity failed; waiting for the user.
    AwaitingResetConsent,
    ReauthenticationRequired,
    Fatal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStep {
    CancelInFlight,
    ReclaimResources,
    ClearRuntimeMarkers,
    ClearProtocolCaches,
    RecreateClient,
    WipeIdentityStore,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecoveryStatus {
    pub phase: RecoveryPhase,
    pub fault_class: Option<FaultClass>,
    /// Ladder steps executed since the last reset.
    pub recovery_count: u32,
    /// Ladders that reached the aggressive steps.
    pub full_ladder_runs: u32,
    pub last_step: Option<RecoveryStep>,
    pub last_error: Option<String>,
}

impl Default for RecoveryStatus {
    fn default() -> Self {
        Self {
            phase: RecoveryPhase::Idle,
            fault_class: None,
            recovery_count: 0,
            full_ladder_runs: 0,
            last_step: None,
            last_error: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RecoveryOutcome {
    /// A probe passed after `step`.
    Recovered(RecoveryStep),
    /// A ladder was already running.
    Suppressed,
    /// Nothing to do here; the caller or another component handles it.
    Deferred,
    StreamRestarted,
    Degraded(ProtocolError),
    AwaitingResetConsent,
    ReauthenticationRequired,
    Surfaced(ProtocolError),
    Fatal(ProtocolError),
}

#[derive(Debug, Clone)]
pub struct RecoveryConfig {
    pub backoff: BackoffPolicy,
    pub cooldown: Duration,
    pub recreate_attempts: u32,
    pub auto_wipe_identity: bool,
}

struct Ledger {
    status: RecoveryStatus,
    aggressive_until: Option<Instant>,
}

pub struct FaultRecoverySupervisor {
    sessions: Arc<SessionManager>,
    readiness: Arc<ReadinessReconciler>,
    discovery: Arc<DiscoveryLoop>,
    events: EventSender,
    config: RecoveryConfig,
    ledger: Mutex<Ledger>,
    ladder: Mutex<()>,
}

impl FaultRecoverySupervisor {
    pub fn new(
        sessions: Arc<SessionManager>,
        readiness: Arc<ReadinessReconciler>,
        discovery: Arc<DiscoveryLoop>,
        events: EventSender,
        mut config: RecoveryConfig,
    ) -> Arc<Self> {
        config.recreate_attempts = config.recreate_attempts.max(MIN_RECREATE_ATTEMPTS);
        Arc::new(Self {
            sessions,
            readiness,
            discovery,
            events,
            config,
            ledger: Mutex::new(Ledger {
                status: RecoveryStatus::default(),
                aggressive_until: None,
            }),
            ladder: Mutex::new(()),
        })
    }

    pub async fn status(&self) -> RecoveryStatus {
        self.ledger.lock().await.status.clone()
    }

    /// Drains fault reports for as long as the sink side lives. Each report
    /// is handled on its own task so a running ladder never blocks intake.
    pub fn spawn_intake(self: &Arc<Self>, mut reports: mpsc::UnboundedReceiver<FaultReport>) -> JoinHandle<()> {
        let supervisor = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(report) = reports.recv().await {
                let supervisor = Arc::clone(&supervisor);
                tokio::spawn(async move {
                    supervisor.handle_fault(report).await;
                });
            }
            debug!("recovery: fault intake stopped");
        })
    }

    pub async fn handle_fault(&self, report: FaultReport) -> RecoveryOutcome {
        let class = fault::class_of(&report.error);
        debug!(source = ?report.source, class = ?class, error = %report.error, "recovery: fault reported");
        match class {
            FaultClass::MembershipPropagation => RecoveryOutcome::Deferred,
            FaultClass::InstallationLimit => {
                warn!(error = %report.error, "recovery: installation limit needs a revoke decision");
                self.surface(&report.error);
                RecoveryOutcome::Surfaced(report.error)
            }
            FaultClass::ProtocolCoreInstability => self.recover(report.error).await,
            FaultClass::TransientNetwork | FaultClass::Unknown => match report.source {
                FaultSource::Stream { generation } => {
                    self.restart_stream(generation, report.error).await
                }
                _ => RecoveryOutcome::Deferred,
            },
        }
    }

    async fn restart_stream(&self, generation: u64, error: ProtocolError) -> RecoveryOutcome {
        let backoff = self.config.backoff;
        for attempt in 1..=backoff.max_attempts {
            let delay = backoff.delay_for(attempt);
            debug!(generation, attempt, delay_ms = delay.as_millis() as u64, "recovery: restarting message stream");
            sleep(delay).await;
            match self.sessions.current().await {
                Some(session) if session.generation() == generation => {}
                _ => {
                    debug!(generation, "recovery: session replaced, dropping stream restart");
                    return RecoveryOutcome::Deferred;
                }
            }
            if self.sessions.restart_stream(Some(generation)).await {
                info!(generation, attempt, "recovery: message stream restarted");
                self.discovery.request_resync();
                return RecoveryOutcome::StreamRestarted;
            }
        }
        warn!(generation, error = %error, "recovery: message stream could not be restarted");
        self.surface(&error);
        RecoveryOutcome::Surfaced(error)
    }

    /// Runs the ladder for a crypto-core instability fault.
    pub async fn recover(&self, error: ProtocolError) -> RecoveryOutcome {
        let Ok(_ladder) = self.ladder.try_lock() else {
            info!(error = %error, "recovery: ladder already running, suppressing report");
            return RecoveryOutcome::Suppressed;
        };
        self.run_ladder(error).await
    }

    async fn run_ladder(&self, error: ProtocolError) -> RecoveryOutcome {
        let aggressive_allowed = {
            let mut ledger = self.ledger.lock().await;
            let allowed = ledger
                .aggressive_until
                .map_or(true, |until| Instant::now() >= until);
            ledger.status.phase = RecoveryPhase::Recovering;
            ledger.status.fault_class = Some(FaultClass::ProtocolCoreInstability);
            ledger.status.last_error = Some(error.to_string());
            let status = ledger.status.clone();
            drop(ledger);
            self.emit(status);
            allowed
        };
        warn!(error = %error, aggressive_allowed, "recovery: starting ladder");

        for step in [
            RecoveryStep::CancelInFlight,
            RecoveryStep::ReclaimResources,
            RecoveryStep::ClearRuntimeMarkers,
        ] {
            self.run_light_step(step).await;
            if self.probe().await {
                return self.recovered(step).await;
            }
        }

        if !aggressive_allowed {
            info!("recovery: aggressive steps cooling down, staying degraded");
            self.set_phase(RecoveryPhase::Degraded).await;
            return RecoveryOutcome::Degraded(error);
        }

        {
            let mut ledger = self.ledger.lock().await;
            ledger.aggressive_until = Some(Instant::now() + self.config.cooldown);
            ledger.status.full_ladder_runs += 1;
        }

        self.record_step(RecoveryStep::ClearProtocolCaches).await;
        if let Some(session) = self.sessions.current().await {
            if let Err(err) = session.client().clear_protocol_caches().await {
                warn!(error = %err, "recovery: clearing protocol caches failed");
            }
        }
        if self.probe().await {
            return self.recovered(RecoveryStep::ClearProtocolCaches).await;
        }

        let mut recreate_failures = 0;
        for attempt in 1..=self.config.recreate_attempts {
            self.record_step(RecoveryStep::RecreateClient).await;
            match self.sessions.recreate().await {
                Ok(_) if self.probe().await => {
                    return self.recovered(RecoveryStep::RecreateClient).await;
                }
                Ok(_) => warn!(attempt, "recovery: recreated client still failing probe"),
                Err(err) if fault::surfaces_immediately(&err) => {
                    warn!(attempt, error = %err, "recovery: client recreation needs a decision");
                    self.set_phase(RecoveryPhase::Idle).await;
                    self.surface(&err);
                    return RecoveryOutcome::Surfaced(err);
                }
                Err(err) => warn!(attempt, error = %err, "recovery: client recreation failed"),
            }
            recreate_failures += 1;
            if attempt < self.config.recreate_attempts {
                sleep(self.config.backoff.delay_for(attempt)).await;
            }
        }

        if recreate_failures < MIN_RECREATE_ATTEMPTS {
            self.set_phase(RecoveryPhase::Degraded).await;
            return RecoveryOutcome::Degraded(error);
        }

        if self.config.auto_wipe_identity {
            return self.wipe_identity().await;
        }
        warn!("recovery: waiting for consent to wipe the local identity store");
        self.set_phase(RecoveryPhase::AwaitingResetConsent).await;
        RecoveryOutcome::AwaitingResetConsent
    }

    async fn run_light_step(&self, step: RecoveryStep) {
        self.record_step(step).await;
        match step {
            RecoveryStep::CancelInFlight => {
                self.sessions.cancel_stream().await;
                self.readiness.cancel_all().await;
            }
            RecoveryStep::ReclaimResources => {
                if let Some(session) = self.sessions.current().await {
                    session.client().reclaim_hint();
                }
            }
            RecoveryStep::ClearRuntimeMarkers => {
                let cleared = self.sessions.clear_fault_markers().await;
                debug!(cleared, "recovery: runtime markers cleared");
            }
            _ => {}
        }
    }

    /// A client that can sync is considered operable.
    async fn probe(&self) -> bool {
        let Some(session) = self.sessions.current().await else {
            return false;
        };
        match session.client().sync_and_list().await {
            Ok(_) => true,
            Err(err) => {
                debug!(error = %err, "recovery: probe failed");
                false
            }
        }
    }

    async fn recovered(&self, step: RecoveryStep) -> RecoveryOutcome {
        if !self.sessions.stream_active().await && self.sessions.restart_stream(None).await {
            self.discovery.request_resync();
        }
        info!(step = ?step, "recovery: client operable again");
        self.set_phase(RecoveryPhase::Idle).await;
        RecoveryOutcome::Recovered(step)
    }

    /// User-approved escape hatch: wipe the identity store and ask for a
    /// fresh sign-in.
    pub async fn reset_and_reauthenticate(&self) -> RecoveryOutcome {
        let _ladder = self.ladder.lock().await;
        self.wipe_identity().await
    }

    async fn wipe_identity(&self) -> RecoveryOutcome {
        self.record_step(RecoveryStep::WipeIdentityStore).await;
        let identity = self.sessions.identity().await;
        self.discovery.stop().await;
        self.readiness.cancel_all().await;
        self.sessions.shutdown().await;

        let Some(identity) = identity else {
            self.set_phase(RecoveryPhase::ReauthenticationRequired).await;
            return RecoveryOutcome::ReauthenticationRequired;
        };
        match self
            .sessions
            .connector()
            .clear_local_identity_store(&identity, self.sessions.env())
            .await
        {
            Ok(()) => {
                warn!(identity = %identity, "recovery: local identity store wiped, re-authentication required");
                self.set_phase(RecoveryPhase::ReauthenticationRequired).await;
                RecoveryOutcome::ReauthenticationRequired
            }
            Err(err) => {
                let fatal = ProtocolError::Fatal(format!("failed to wipe local identity store: {err:#}"));
                error!(identity = %identity, error = %fatal, "recovery: unrecoverable");
                {
                    let mut ledger = self.ledger.lock().await;
                    ledger.status.last_error = Some(fatal.to_string());
                }
                self.set_phase(RecoveryPhase::Fatal).await;
                self.surface(&fatal);
                RecoveryOutcome::Fatal(fatal)
            }
        }
    }

    /// Frees an installation slot and retries initialization.
    pub async fn revoke_installation_and_retry(
        &self,
        signer: Arc<dyn Signer>,
        installation: &InstallationId,
    ) -> InitResult {
        info!(installation_id = %installation, "recovery: revoking installation");
        self.sessions
            .connector()
            .revoke_installation(Arc::clone(&signer), self.sessions.env(), installation)
            .await
            .map_err(|err| fault::to_protocol_error(&err, None))?;
        self.sessions.initialize(Some(signer)).await
    }

    /// Runs `operation` with capped exponential backoff.
    ///
    /// Transient failures are retried; instability triggers the ladder and
    /// the operation is retried if the ladder recovered. Anything that needs
    /// a decision is returned right away.
    pub async fn run_with_backoff<T, F, Fut>(
        &self,
        operation: &str,
        conversation_id: Option<&ConversationId>,
        mut attempt_fn: F,
    ) -> Result<T, ProtocolError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let backoff = self.config.backoff;
        let mut last_error = None;
        for attempt in 1..=backoff.max_attempts {
            let error = match attempt_fn().await {
                Ok(value) => {
                    self.record_success().await;
                    return Ok(value);
                }
                Err(err) => fault::to_protocol_error(&err, conversation_id),
            };
            if fault::surfaces_immediately(&error) {
                return Err(error);
            }
            match fault::class_of(&error) {
                FaultClass::MembershipPropagation | FaultClass::InstallationLimit => {
                    return Err(error)
                }
                FaultClass::ProtocolCoreInstability => match self.recover(error.clone()).await {
                    RecoveryOutcome::Recovered(_) => {}
                    RecoveryOutcome::Suppressed => {
                        // Wait for the running ladder before trying again.
                        drop(self.ladder.lock().await);
                    }
                    _ => return Err(error),
                },
                FaultClass::TransientNetwork | FaultClass::Unknown => {
                    if error == ProtocolError::NotInitialized {
                        return Err(error);
                    }
                }
            }
            warn!(operation, attempt, error = %error, "recovery: operation failed");
            last_error = Some(error);
            if attempt < backoff.max_attempts {
                sleep(backoff.delay_for(attempt)).await;
            }
        }

        let error = last_error.unwrap_or(ProtocolError::NotInitialized);
        error!(operation, attempts = backoff.max_attempts, error = %error, "recovery: retries exhausted");
        self.surface(&error);
        Err(error)
    }

    /// A successful operation closes out an earlier recovery episode.
    pub async fn record_success(&self) {
        let status = {
            let mut ledger = self.ledger.lock().await;
            match ledger.status.phase {
                RecoveryPhase::Idle if ledger.status.recovery_count > 0 => {}
                RecoveryPhase::Degraded => {}
                _ => return,
            }
            ledger.status.phase = RecoveryPhase::Idle;
            ledger.status.recovery_count = 0;
            ledger.status.fault_class = None;
            ledger.status.last_step = None;
            ledger.status.last_error = None;
            ledger.status.clone()
        };
        debug!("recovery: reset after successful operation");
        self.emit(status);
    }

    async fn record_step(&self, step: RecoveryStep) {
        let status = {
            let mut ledger = self.ledger.lock().await;
            ledger.status.recovery_count += 1;
            ledger.status.last_step = Some(step);
            ledger.status.clone()
        };
        info!(step = ?step, recovery_count = status.recovery_count, "recovery: running step");
        self.emit(status);
    }

    async fn set_phase(&self, phase: RecoveryPhase) {
        let status = {
            let mut ledger = self.ledger.lock().await;
            ledger.status.phase = phase;
            ledger.status.clone()
        };
        self.emit(status);
    }

    fn surface(&self, error: &ProtocolError) {
        let _ = self.events.send(EngineEvent::Error(error.to_string()));
    }

    fn emit(&self, status: RecoveryStatus) {
        let _ = self.events.send(EngineEvent::RecoveryStateChanged(status));
    }
}

#[cfg(test)]
#[path = "tests/recovery_tests.rs"]
mod tests;
