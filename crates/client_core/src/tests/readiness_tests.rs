use std::time::Duration;

use futures::future::join;
use shared::protocol::ConversationTarget;
use tokio::time::Instant;

use super::*;
use crate::{
    simulated::{inbox_for, SimOp},
    test_support::{drain, stack, Stack},
};

async fn group_with_bob(stack: &Stack) -> ConversationId {
    stack.network.register("bob").await;
    let session = stack.sign_in("alice").await;
    let descriptor = session
        .client()
        .create_conversation(&ConversationTarget::Group(vec![inbox_for("bob")]))
        .await
        .expect("group");
    let id = descriptor.id.clone();
    stack.cache.upsert_descriptor(descriptor).await;
    id
}

fn phases(events: Vec<EngineEvent>, conversation: &ConversationId) -> Vec<(ReadinessPhase, u32)> {
    events
        .into_iter()
        .filter_map(|event| match event {
            EngineEvent::ReadinessChanged {
                conversation_id,
                state,
            } if &conversation_id == conversation => Some((state.phase, state.attempt)),
            _ => None,
        })
        .collect()
}

#[tokio::test(start_paused = true)]
async fn group_becomes_ready_on_fourth_check() {
    let stack = stack();
    stack.network.set_group_publish_checks(3).await;
    let group = group_with_bob(&stack).await;
    let readiness = stack.readiness(5, Duration::from_millis(2_000));
    let mut rx = stack.events.subscribe();

    let started = Instant::now();
    let state = readiness.ensure_ready(&group).await;

    assert_eq!(state.phase, ReadinessPhase::Ready);
    assert!(state.can_send);
    assert_eq!(state.attempt, 4);
    assert_eq!(started.elapsed(), Duration::from_secs(6));
    assert_eq!(stack.network.calls(SimOp::CanSend).await, 4);
    assert!(
        stack
            .cache
            .conversation(&group)
            .await
            .expect("cached")
            .membership_published
    );

    let seen = phases(drain(&mut rx), &group);
    assert_eq!(
        seen,
        vec![
            (ReadinessPhase::Checking, 1),
            (ReadinessPhase::Retrying, 1),
            (ReadinessPhase::Checking, 2),
            (ReadinessPhase::Retrying, 2),
            (ReadinessPhase::Checking, 3),
            (ReadinessPhase::Retrying, 3),
            (ReadinessPhase::Checking, 4),
            (ReadinessPhase::Ready, 4),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn unpublished_group_exhausts_after_max_retries() {
    let stack = stack();
    stack.network.set_group_publish_checks(u32::MAX).await;
    let group = group_with_bob(&stack).await;
    let readiness = stack.readiness(5, Duration::from_millis(2_000));
    let mut rx = stack.events.subscribe();

    let started = Instant::now();
    let state = readiness.ensure_ready(&group).await;

    assert_eq!(state.phase, ReadinessPhase::Exhausted);
    assert!(!state.can_send);
    assert!(state.last_error.is_some());
    assert_eq!(started.elapsed(), Duration::from_secs(10));
    assert_eq!(stack.network.calls(SimOp::CanSend).await, 6);

    let seen = phases(drain(&mut rx), &group);
    let retrying = seen
        .iter()
        .filter(|(phase, _)| *phase == ReadinessPhase::Retrying)
        .count();
    assert_eq!(retrying, 5);
    assert_eq!(seen.last(), Some(&(ReadinessPhase::Exhausted, 6)));

    // Exhausted sticks until the user asks again.
    readiness.ensure_ready(&group).await;
    assert_eq!(stack.network.calls(SimOp::CanSend).await, 6);

    let retried = readiness.retry(&group).await;
    assert_eq!(retried.phase, ReadinessPhase::Exhausted);
    assert_eq!(stack.network.calls(SimOp::CanSend).await, 12);
}

#[tokio::test(start_paused = true)]
async fn concurrent_requests_join_one_cycle() {
    let stack = stack();
    stack.network.set_group_publish_checks(1).await;
    let group = group_with_bob(&stack).await;
    let readiness = stack.readiness(5, Duration::from_millis(2_000));

    let (a, b) = join(readiness.ensure_ready(&group), readiness.ensure_ready(&group)).await;
    assert_eq!(a, b);
    assert_eq!(a.phase, ReadinessPhase::Ready);
    assert_eq!(stack.network.calls(SimOp::CanSend).await, 2);
}

#[tokio::test]
async fn direct_with_unregistered_peer_is_checked_once() {
    let stack = stack();
    stack.network.register("alice").await;
    let dm = stack
        .network
        .create_remote("bob", &ConversationTarget::Direct(inbox_for("alice")))
        .await
        .expect("dm");
    stack.sign_in("alice").await;
    stack.discover().await;
    stack.network.unregister("bob").await;
    let readiness = stack.readiness(5, Duration::from_millis(2_000));

    let state = readiness.ensure_ready(&dm).await;
    assert_eq!(state.phase, ReadinessPhase::Exhausted);
    assert_eq!(state.attempt, 1);
    assert_eq!(stack.network.calls(SimOp::CanSend).await, 1);

    // The negative answer is cached through a plain retry...
    readiness.retry(&dm).await;
    assert_eq!(stack.network.calls(SimOp::CanSend).await, 1);

    // ...and only a refresh asks the network again.
    stack.network.register("bob").await;
    let refreshed = readiness.refresh(&dm).await;
    assert_eq!(refreshed.phase, ReadinessPhase::Ready);
    assert_eq!(stack.network.calls(SimOp::CanSend).await, 2);
}

#[tokio::test(start_paused = true)]
async fn cancel_all_abandons_running_cycles() {
    let stack = stack();
    stack.network.set_group_publish_checks(u32::MAX).await;
    let group = group_with_bob(&stack).await;
    let readiness = stack.readiness(5, Duration::from_millis(2_000));

    let pending = {
        let readiness = Arc::clone(&readiness);
        let group = group.clone();
        tokio::spawn(async move { readiness.ensure_ready(&group).await })
    };
    tokio::time::sleep(Duration::from_secs(3)).await;

    assert_eq!(readiness.cancel_all().await, 1);
    assert_eq!(readiness.get(&group).await.phase, ReadinessPhase::Unknown);

    let abandoned = pending.await.expect("join");
    assert_eq!(abandoned.phase, ReadinessPhase::Unknown);
    let calls = stack.network.calls(SimOp::CanSend).await;
    tokio::time::sleep(Duration::from_secs(20)).await;
    assert_eq!(stack.network.calls(SimOp::CanSend).await, calls);
}

#[tokio::test]
async fn uncached_conversation_is_exhausted() {
    let stack = stack();
    stack.sign_in("alice").await;
    let readiness = stack.readiness(5, Duration::from_millis(2_000));

    let state = readiness.ensure_ready(&ConversationId::from("ghost")).await;
    assert_eq!(state.phase, ReadinessPhase::Exhausted);
    assert!(state.last_error.expect("error").contains("ghost"));
}

#[tokio::test(start_paused = true)]
async fn transient_check_errors_are_reported_and_retried() {
    let mut stack = stack();
    stack.network.set_group_publish_checks(0).await;
    let group = group_with_bob(&stack).await;
    stack
        .network
        .fail_next(SimOp::CanSend, "connection reset")
        .await;
    let readiness = stack.readiness(5, Duration::from_millis(2_000));

    let state = readiness.ensure_ready(&group).await;
    assert_eq!(state.phase, ReadinessPhase::Ready);
    assert_eq!(state.attempt, 2);

    let report = stack.reports.try_recv().expect("fault report");
    assert_eq!(report.source, FaultSource::Readiness(group));
}

async fn dm_with_bob(stack: &Stack) -> ConversationId {
    stack.network.register("alice").await;
    let dm = stack
        .network
        .create_remote("bob", &ConversationTarget::Direct(inbox_for("alice")))
        .await
        .expect("dm");
    stack.sign_in("alice").await;
    stack.discover().await;
    dm
}

#[tokio::test(start_paused = true)]
async fn direct_check_backs_off_through_a_network_blip() {
    let stack = stack();
    let dm = dm_with_bob(&stack).await;
    stack
        .network
        .fail_next(SimOp::CanSend, "network timeout")
        .await;
    let readiness = stack.readiness(5, Duration::from_millis(2_000));
    let mut rx = stack.events.subscribe();

    let started = Instant::now();
    let state = readiness.ensure_ready(&dm).await;

    assert_eq!(state.phase, ReadinessPhase::Ready);
    assert_eq!(state.attempt, 2);
    assert_eq!(state.failure, None);
    assert_eq!(started.elapsed(), Duration::from_millis(500));
    assert_eq!(stack.network.calls(SimOp::CanSend).await, 2);
    assert_eq!(
        phases(drain(&mut rx), &dm),
        vec![
            (ReadinessPhase::Checking, 1),
            (ReadinessPhase::Retrying, 1),
            (ReadinessPhase::Checking, 2),
            (ReadinessPhase::Ready, 2),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn direct_check_errors_are_not_cached_as_an_answer() {
    let stack = stack();
    let dm = dm_with_bob(&stack).await;
    for _ in 0..5 {
        stack
            .network
            .fail_next(SimOp::CanSend, "network timeout")
            .await;
    }
    let readiness = stack.readiness(5, Duration::from_millis(2_000));

    let started = Instant::now();
    let state = readiness.ensure_ready(&dm).await;
    assert_eq!(state.phase, ReadinessPhase::Exhausted);
    assert_eq!(state.attempt, 5);
    assert!(matches!(state.failure, Some(ProtocolError::Unreachable(_))));
    assert_eq!(started.elapsed(), Duration::from_millis(7_500));

    // The next request asks the network again instead of reusing the error.
    let state = readiness.ensure_ready(&dm).await;
    assert_eq!(state.phase, ReadinessPhase::Ready);
    assert_eq!(stack.network.calls(SimOp::CanSend).await, 6);
}

#[tokio::test]
async fn unregistered_peer_failure_names_the_peer() {
    let stack = stack();
    let dm = dm_with_bob(&stack).await;
    stack.network.unregister("bob").await;
    let readiness = stack.readiness(5, Duration::from_millis(2_000));

    let state = readiness.ensure_ready(&dm).await;
    assert_eq!(
        state.failure,
        Some(ProtocolError::RecipientNotRegistered(inbox_for("bob")))
    );
}

#[tokio::test(start_paused = true)]
async fn reset_all_forgets_answers_and_running_cycles() {
    let stack = stack();
    stack.network.set_group_publish_checks(u32::MAX).await;
    let group = group_with_bob(&stack).await;
    let readiness = stack.readiness(5, Duration::from_millis(2_000));

    let pending = {
        let readiness = Arc::clone(&readiness);
        let group = group.clone();
        tokio::spawn(async move { readiness.ensure_ready(&group).await })
    };
    tokio::time::sleep(Duration::from_secs(3)).await;

    assert_eq!(readiness.reset_all().await, 1);
    assert_eq!(readiness.get(&group).await, ReadinessState::unknown());
    pending.await.expect("join");
    let calls = stack.network.calls(SimOp::CanSend).await;
    tokio::time::sleep(Duration::from_secs(20)).await;
    assert_eq!(stack.network.calls(SimOp::CanSend).await, calls);
    assert_eq!(readiness.get(&group).await, ReadinessState::unknown());
}
