use std::sync::atomic::{AtomicU32, Ordering};

use anyhow::anyhow;
use futures::future::join;
use shared::domain::InboxId;

use super::*;
use crate::{
    config::EngineSettings,
    simulated::{SimOp, SimulatedNetwork, StaticSigner},
    SessionState, SyncEngine,
};

const INSTABILITY: &str = "RuntimeError: unreachable executed";

fn instability() -> FaultReport {
    FaultReport {
        source: FaultSource::Session,
        error: ProtocolError::ProtocolCoreInstability(INSTABILITY.into()),
    }
}

// Discovery only polls once at start so injected sync failures reach the
// ladder checks.
fn quiet_settings() -> EngineSettings {
    EngineSettings {
        discovery_interval_ms: 3_600_000,
        ..EngineSettings::default()
    }
}

async fn engine_with(settings: EngineSettings) -> (SimulatedNetwork, Arc<SyncEngine>) {
    let network = SimulatedNetwork::new();
    let engine = SyncEngine::new(network.connector(), &settings);
    engine
        .initialize(Some(StaticSigner::new("alice")))
        .await
        .expect("session");
    // Let the first discovery poll run.
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(network.calls(SimOp::Sync).await, 1);
    (network, engine)
}

async fn engine() -> (SimulatedNetwork, Arc<SyncEngine>) {
    engine_with(quiet_settings()).await
}

async fn fail_ladder_checks(network: &SimulatedNetwork, count: usize) {
    for _ in 0..count {
        network.fail_next(SimOp::Sync, INSTABILITY).await;
    }
}

#[tokio::test(start_paused = true)]
async fn ladder_stops_at_first_passing_check() {
    let (network, engine) = engine().await;
    let supervisor = engine.supervisor();

    let outcome = supervisor.handle_fault(instability()).await;
    assert_eq!(outcome, RecoveryOutcome::Recovered(RecoveryStep::CancelInFlight));

    let status = supervisor.status().await;
    assert_eq!(status.phase, RecoveryPhase::Idle);
    assert_eq!(status.recovery_count, 1);
    assert_eq!(status.full_ladder_runs, 0);
    assert_eq!(network.calls(SimOp::Create).await, 1);
    assert!(engine.sessions().stream_active().await);
}

#[tokio::test(start_paused = true)]
async fn full_ladder_recreates_the_client() {
    let (network, engine) = engine().await;
    fail_ladder_checks(&network, 4).await;

    let outcome = engine.supervisor().handle_fault(instability()).await;
    assert_eq!(outcome, RecoveryOutcome::Recovered(RecoveryStep::RecreateClient));

    let status = engine.supervisor().status().await;
    assert_eq!(status.full_ladder_runs, 1);
    assert_eq!(status.recovery_count, 5);
    assert_eq!(network.calls(SimOp::Create).await, 2);
    assert_eq!(network.marker_clears().await, 1);
    let session = engine.sessions().current().await.expect("session");
    assert_eq!(session.generation(), 2);
}

#[tokio::test(start_paused = true)]
async fn repeated_fault_within_cooldown_skips_aggressive_steps() {
    let (network, engine) = engine().await;
    let supervisor = engine.supervisor();

    fail_ladder_checks(&network, 4).await;
    supervisor.handle_fault(instability()).await;

    fail_ladder_checks(&network, 3).await;
    let outcome = supervisor.handle_fault(instability()).await;
    assert!(matches!(outcome, RecoveryOutcome::Degraded(_)));
    assert_eq!(supervisor.status().await.phase, RecoveryPhase::Degraded);
    assert_eq!(supervisor.status().await.full_ladder_runs, 1);
    assert_eq!(network.calls(SimOp::Create).await, 2);

    // Once the window has passed the full ladder is available again.
    tokio::time::advance(Duration::from_secs(31)).await;
    fail_ladder_checks(&network, 4).await;
    let outcome = supervisor.handle_fault(instability()).await;
    assert_eq!(outcome, RecoveryOutcome::Recovered(RecoveryStep::RecreateClient));
    assert_eq!(supervisor.status().await.full_ladder_runs, 2);
}

#[tokio::test(start_paused = true)]
async fn concurrent_faults_run_one_ladder() {
    let (network, engine) = engine().await;
    network
        .set_create_delay(Some(Duration::from_millis(500)))
        .await;
    fail_ladder_checks(&network, 4).await;
    let supervisor = engine.supervisor();

    let (first, second) = join(
        supervisor.handle_fault(instability()),
        supervisor.handle_fault(instability()),
    )
    .await;

    let outcomes = [first, second];
    assert!(outcomes.contains(&RecoveryOutcome::Suppressed));
    assert!(outcomes.contains(&RecoveryOutcome::Recovered(RecoveryStep::RecreateClient)));
    assert_eq!(supervisor.status().await.full_ladder_runs, 1);
    assert_eq!(network.calls(SimOp::Create).await, 2);
}

#[tokio::test(start_paused = true)]
async fn identity_wipe_waits_for_consent() {
    let (network, engine) = engine().await;
    fail_ladder_checks(&network, 4).await;
    network.fail_next(SimOp::Create, INSTABILITY).await;
    network.fail_next(SimOp::Create, INSTABILITY).await;

    let outcome = engine.supervisor().handle_fault(instability()).await;
    assert_eq!(outcome, RecoveryOutcome::AwaitingResetConsent);
    assert_eq!(
        engine.supervisor().status().await.phase,
        RecoveryPhase::AwaitingResetConsent
    );
    assert!(network.wiped_identities().await.is_empty());

    let outcome = engine.reset_and_reauthenticate().await;
    assert_eq!(outcome, RecoveryOutcome::ReauthenticationRequired);
    assert_eq!(network.wiped_identities().await, vec!["alice".to_string()]);
    assert_eq!(engine.session_state().await, SessionState::Uninitialized);
    assert_eq!(
        engine.supervisor().status().await.phase,
        RecoveryPhase::ReauthenticationRequired
    );
}

#[tokio::test(start_paused = true)]
async fn identity_wipe_can_be_automatic() {
    let settings = EngineSettings {
        auto_wipe_identity: true,
        ..quiet_settings()
    };
    let (network, engine) = engine_with(settings).await;
    fail_ladder_checks(&network, 4).await;
    network.fail_next(SimOp::Create, INSTABILITY).await;
    network.fail_next(SimOp::Create, INSTABILITY).await;

    assert!(engine.discovery().is_running().await);

    let outcome = engine.supervisor().handle_fault(instability()).await;
    assert_eq!(outcome, RecoveryOutcome::ReauthenticationRequired);
    assert_eq!(network.wiped_identities().await, vec!["alice".to_string()]);
    assert!(!engine.discovery().is_running().await);
    assert_eq!(engine.session_state().await, SessionState::Uninitialized);
}

#[tokio::test(start_paused = true)]
async fn single_recreate_setting_still_reaches_the_wipe_step() {
    let settings = EngineSettings {
        recreate_attempts: 1,
        ..quiet_settings()
    };
    let (network, engine) = engine_with(settings).await;
    fail_ladder_checks(&network, 4).await;
    network.fail_next(SimOp::Create, INSTABILITY).await;
    network.fail_next(SimOp::Create, INSTABILITY).await;

    let outcome = engine.supervisor().handle_fault(instability()).await;
    assert_eq!(outcome, RecoveryOutcome::AwaitingResetConsent);
    assert_eq!(network.calls(SimOp::Create).await, 3);
}

#[tokio::test]
async fn failed_wipe_is_fatal() {
    let (network, engine) = engine().await;
    network
        .fail_next(SimOp::WipeIdentity, "disk I/O error")
        .await;

    let outcome = engine.reset_and_reauthenticate().await;
    match outcome {
        RecoveryOutcome::Fatal(ProtocolError::Fatal(message)) => {
            assert!(message.contains("disk I/O error"));
        }
        other => panic!("unexpected outcome {other:?}"),
    }
    assert_eq!(engine.supervisor().status().await.phase, RecoveryPhase::Fatal);
}

#[tokio::test]
async fn installation_limit_is_surfaced_untouched() {
    let (network, engine) = engine().await;
    let error = ProtocolError::InstallationLimitExceeded {
        inbox_id: InboxId::from("inbox-alice"),
        max: 10,
        installations: Vec::new(),
    };

    let outcome = engine
        .supervisor()
        .handle_fault(FaultReport {
            source: FaultSource::Session,
            error: error.clone(),
        })
        .await;
    assert_eq!(outcome, RecoveryOutcome::Surfaced(error));
    assert_eq!(engine.supervisor().status().await.recovery_count, 0);
    assert_eq!(network.calls(SimOp::Create).await, 1);
}

#[tokio::test(start_paused = true)]
async fn ended_stream_is_restarted_after_backoff() {
    let (network, engine) = engine().await;
    assert_eq!(network.calls(SimOp::Stream).await, 1);

    network.break_streams("connection reset by peer").await;
    tokio::time::sleep(Duration::from_secs(2)).await;

    assert_eq!(network.calls(SimOp::Stream).await, 2);
    assert!(engine.sessions().stream_active().await);
}

#[tokio::test(start_paused = true)]
async fn transient_failures_back_off_then_succeed() {
    let (_network, engine) = engine().await;
    let attempts = AtomicU32::new(0);

    let started = Instant::now();
    let value = engine
        .supervisor()
        .run_with_backoff("flaky_call", None, || {
            let attempt = attempts.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                if attempt <= 2 {
                    Err(anyhow!("connection timed out"))
                } else {
                    Ok(attempt)
                }
            }
        })
        .await
        .expect("value");

    assert_eq!(value, 3);
    assert_eq!(started.elapsed(), Duration::from_millis(1_500));
}

#[tokio::test(start_paused = true)]
async fn exhausted_backoff_surfaces_the_last_error() {
    let (_network, engine) = engine().await;
    let attempts = AtomicU32::new(0);

    let started = Instant::now();
    let err = engine
        .supervisor()
        .run_with_backoff("flaky_call", None, || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(anyhow!("network unavailable")) }
        })
        .await
        .expect_err("exhausted");

    assert!(matches!(err, ProtocolError::Unreachable(_)));
    assert_eq!(attempts.load(Ordering::SeqCst), 5);
    // 500 + 1000 + 2000 + 4000 ms between the five attempts.
    assert_eq!(started.elapsed(), Duration::from_millis(7_500));
}

#[tokio::test]
async fn membership_errors_are_not_retried() {
    let (_network, engine) = engine().await;
    let attempts = AtomicU32::new(0);
    let conversation = ConversationId::from("g-1");

    let err = engine
        .supervisor()
        .run_with_backoff("send", Some(&conversation), || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(anyhow!("group membership not yet published")) }
        })
        .await
        .expect_err("membership");

    assert_eq!(err, ProtocolError::MembershipNotYetPublished(conversation));
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn success_after_degraded_resets_the_status() {
    let (network, engine) = engine().await;
    let supervisor = engine.supervisor();
    fail_ladder_checks(&network, 4).await;
    supervisor.handle_fault(instability()).await;
    fail_ladder_checks(&network, 3).await;
    supervisor.handle_fault(instability()).await;
    assert_eq!(supervisor.status().await.phase, RecoveryPhase::Degraded);

    supervisor.record_success().await;
    let status = supervisor.status().await;
    assert_eq!(status.phase, RecoveryPhase::Idle);
    assert_eq!(status.recovery_count, 0);
    assert_eq!(status.fault_class, None);
}
