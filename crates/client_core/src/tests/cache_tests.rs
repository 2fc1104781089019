use std::collections::BTreeSet;

use async_trait::async_trait;
use shared::domain::{InboxId, Membership};

use super::*;
use crate::persistence::CacheSnapshot;

fn direct(id: &str, created_at_ns: i64) -> Conversation {
    Conversation {
        id: ConversationId::from(id),
        membership: Membership::Direct {
            peer: InboxId::from("bob"),
        },
        consent: ConsentState::Allowed,
        membership_published: true,
        created_at_ns,
        cursor: HistoryCursor::NotStarted,
    }
}

fn message(conversation: &str, id: &str, at: i64) -> Message {
    Message {
        id: MessageId::from(id),
        conversation_id: ConversationId::from(conversation),
        sender: InboxId::from("alice"),
        content: format!("body-{id}"),
        sent_at_ns: at,
        status: DeliveryStatus::Sent,
    }
}

fn ids(messages: &[Message]) -> Vec<String> {
    messages.iter().map(|m| m.id.0.clone()).collect()
}

#[tokio::test]
async fn replaying_a_batch_is_idempotent() {
    let cache = LocalCache::new();
    let id = ConversationId::from("c-1");
    let batch = vec![
        message("c-1", "m-3", 30),
        message("c-1", "m-1", 10),
        message("c-1", "m-2", 20),
    ];

    assert_eq!(cache.append_messages(&id, batch.clone()).await, 3);
    let once = cache.get_messages(&id).await;
    for _ in 0..5 {
        assert_eq!(cache.append_messages(&id, batch.clone()).await, 0);
    }
    assert_eq!(cache.get_messages(&id).await, once);
}

#[tokio::test]
async fn order_is_independent_of_arrival_order() {
    let batch = vec![
        message("c-1", "m-b", 20),
        message("c-1", "m-a", 20),
        message("c-1", "m-c", 5),
        message("c-1", "m-d", 40),
    ];
    let id = ConversationId::from("c-1");

    let forward = LocalCache::new();
    forward.append_messages(&id, batch.clone()).await;

    let backward = LocalCache::new();
    for m in batch.iter().rev() {
        backward.append_messages(&id, vec![m.clone()]).await;
    }

    let expected = vec!["m-c", "m-a", "m-b", "m-d"];
    assert_eq!(ids(&forward.get_messages(&id).await), expected);
    assert_eq!(ids(&backward.get_messages(&id).await), expected);
}

#[tokio::test]
async fn messages_for_other_conversations_are_dropped() {
    let cache = LocalCache::new();
    let id = ConversationId::from("c-1");
    let inserted = cache
        .append_messages(&id, vec![message("c-2", "m-1", 1), message("c-1", "m-2", 2)])
        .await;
    assert_eq!(inserted, 1);
    assert_eq!(ids(&cache.get_messages(&id).await), vec!["m-2"]);
}

#[tokio::test]
async fn upsert_reports_insert_update_and_unchanged() {
    let cache = LocalCache::new();
    let conversation = direct("c-1", 1);
    assert_eq!(
        cache.upsert_conversation(conversation.clone()).await,
        UpsertOutcome::Inserted
    );
    assert_eq!(
        cache.upsert_conversation(conversation.clone()).await,
        UpsertOutcome::Unchanged
    );
    let mut denied = conversation;
    denied.consent = ConsentState::Denied;
    assert_eq!(
        cache.upsert_conversation(denied).await,
        UpsertOutcome::Updated
    );
    assert!(cache.get_conversations().await.is_empty());
}

#[tokio::test]
async fn descriptor_merge_keeps_cursor_and_published_flag() {
    let cache = LocalCache::new();
    let id = ConversationId::from("g-1");
    let descriptor = ConversationDescriptor {
        id: id.clone(),
        membership: Membership::Group {
            members: BTreeSet::from([InboxId::from("alice"), InboxId::from("bob")]),
        },
        consent: ConsentState::Allowed,
        membership_published: false,
        created_at_ns: 1,
        last_message_id: None,
    };
    cache.upsert_descriptor(descriptor.clone()).await;
    cache
        .set_cursor(&id, HistoryCursor::At("page-2".into()))
        .await;
    assert!(cache.mark_membership_published(&id).await);
    assert!(!cache.mark_membership_published(&id).await);

    assert_eq!(
        cache.upsert_descriptor(descriptor).await,
        UpsertOutcome::Unchanged
    );
    let cached = cache.conversation(&id).await.expect("cached");
    assert_eq!(cached.cursor, HistoryCursor::At("page-2".into()));
    assert!(cached.membership_published);
}

#[tokio::test]
async fn conversations_sort_by_latest_activity() {
    let cache = LocalCache::new();
    cache.upsert_conversation(direct("old", 1)).await;
    cache.upsert_conversation(direct("new", 50)).await;
    cache
        .append_messages(&ConversationId::from("old"), vec![message("old", "m-1", 100)])
        .await;

    let order: Vec<_> = cache
        .get_conversations()
        .await
        .into_iter()
        .map(|c| c.id.0)
        .collect();
    assert_eq!(order, vec!["old", "new"]);
}

#[tokio::test]
async fn provisional_message_is_replaced_once_accepted() {
    let cache = LocalCache::new();
    let id = ConversationId::from("c-1");
    cache.upsert_conversation(direct("c-1", 1)).await;

    let provisional = MessageId::provisional();
    let mut pending = message("c-1", &provisional.0, 10);
    pending.status = DeliveryStatus::Pending;
    cache.append_messages(&id, vec![pending]).await;

    let accepted = cache
        .replace_provisional(&id, &provisional, MessageId::from("m-net"))
        .await
        .expect("replaced");
    assert_eq!(accepted.status, DeliveryStatus::Sent);

    // The stream delivering the accepted id afterwards is a no-op.
    assert_eq!(
        cache
            .append_messages(&id, vec![message("c-1", "m-net", 10)])
            .await,
        0
    );
    assert_eq!(ids(&cache.get_messages(&id).await), vec!["m-net"]);
}

#[tokio::test]
async fn provisional_is_dropped_when_stream_won_the_race() {
    let cache = LocalCache::new();
    let id = ConversationId::from("c-1");
    let provisional = MessageId::provisional();
    let mut pending = message("c-1", &provisional.0, 10);
    pending.status = DeliveryStatus::Pending;
    cache
        .append_messages(&id, vec![pending, message("c-1", "m-net", 11)])
        .await;

    let kept = cache
        .replace_provisional(&id, &provisional, MessageId::from("m-net"))
        .await
        .expect("existing");
    assert_eq!(kept.sent_at_ns, 11);
    assert_eq!(cache.message_count(&id).await, 1);
}

#[tokio::test]
async fn failed_send_keeps_message_with_failed_status() {
    let cache = LocalCache::new();
    let id = ConversationId::from("c-1");
    let provisional = MessageId::provisional();
    let mut pending = message("c-1", &provisional.0, 10);
    pending.status = DeliveryStatus::Pending;
    cache.append_messages(&id, vec![pending]).await;

    let failed = cache.mark_failed(&id, &provisional).await.expect("failed");
    assert_eq!(failed.status, DeliveryStatus::Failed);
    assert_eq!(cache.get_messages(&id).await[0].status, DeliveryStatus::Failed);
}

#[derive(Default)]
struct RecordingPersistence {
    snapshot: CacheSnapshot,
    saved_messages: Mutex<Vec<MessageId>>,
    saved_conversations: Mutex<Vec<ConversationId>>,
    evicted: Mutex<Vec<ConversationId>>,
    owners: Mutex<Vec<String>>,
    clears: Mutex<u32>,
}

#[async_trait]
impl CachePersistence for RecordingPersistence {
    async fn load(&self) -> Result<CacheSnapshot> {
        Ok(self.snapshot.clone())
    }

    async fn save_conversation(&self, conversation: &Conversation) -> Result<()> {
        self.saved_conversations
            .lock()
            .await
            .push(conversation.id.clone());
        Ok(())
    }

    async fn save_messages(&self, messages: &[Message]) -> Result<()> {
        self.saved_messages
            .lock()
            .await
            .extend(messages.iter().map(|m| m.id.clone()));
        Ok(())
    }

    async fn evict(&self, conversation_id: &ConversationId) -> Result<()> {
        self.evicted.lock().await.push(conversation_id.clone());
        Ok(())
    }

    async fn set_owner(&self, identity: &str) -> Result<()> {
        self.owners.lock().await.push(identity.to_string());
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        *self.clears.lock().await += 1;
        Ok(())
    }
}

#[tokio::test]
async fn hydrate_restores_snapshot_and_writes_through() {
    let persistence = Arc::new(RecordingPersistence {
        snapshot: CacheSnapshot {
            owner: Some("alice".into()),
            conversations: vec![direct("c-1", 1)],
            messages: vec![message("c-1", "m-2", 20), message("c-1", "m-1", 10)],
        },
        ..Default::default()
    });
    let cache = LocalCache::with_persistence(persistence.clone());
    assert_eq!(cache.hydrate().await.expect("hydrate"), 1);

    let id = ConversationId::from("c-1");
    assert_eq!(ids(&cache.get_messages(&id).await), vec!["m-1", "m-2"]);

    cache
        .append_messages(&id, vec![message("c-1", "m-3", 30), message("c-1", "m-1", 10)])
        .await;
    assert_eq!(
        *persistence.saved_messages.lock().await,
        vec![MessageId::from("m-3")]
    );

    assert!(cache.evict_conversation(&id).await);
    assert!(cache.get_conversations().await.is_empty());
    assert_eq!(*persistence.evicted.lock().await, vec![id]);
}

#[tokio::test]
async fn binding_another_identity_drops_everything() {
    let persistence = Arc::new(RecordingPersistence {
        snapshot: CacheSnapshot {
            owner: Some("alice".into()),
            conversations: vec![direct("c-1", 1)],
            messages: vec![message("c-1", "m-1", 10)],
        },
        ..Default::default()
    });
    let cache = LocalCache::with_persistence(persistence.clone());
    cache.hydrate().await.expect("hydrate");
    assert_eq!(cache.owner().await.as_deref(), Some("alice"));

    assert_eq!(cache.bind_owner("alice").await, None);
    assert_eq!(cache.get_conversations().await.len(), 1);
    assert_eq!(*persistence.clears.lock().await, 0);

    let removed = cache.bind_owner("carol").await.expect("switched");
    assert_eq!(removed, vec![ConversationId::from("c-1")]);
    assert!(cache.get_conversations().await.is_empty());
    assert!(cache.get_messages(&ConversationId::from("c-1")).await.is_empty());
    assert_eq!(*persistence.clears.lock().await, 1);
    assert_eq!(*persistence.owners.lock().await, vec!["carol".to_string()]);
}

#[tokio::test]
async fn first_binding_keeps_an_empty_cache_untouched() {
    let persistence = Arc::new(RecordingPersistence::default());
    let cache = LocalCache::with_persistence(persistence.clone());

    assert_eq!(cache.bind_owner("alice").await, Some(Vec::new()));
    assert_eq!(*persistence.clears.lock().await, 0);
    assert_eq!(cache.owner().await.as_deref(), Some("alice"));
}
