use anyhow::{Context, Result};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
    Pool, Row, Sqlite,
};
use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};
use tracing::debug;

use shared::domain::{
    ConsentState, Conversation, ConversationId, DeliveryStatus, HistoryCursor, InboxId,
    Membership, Message, MessageId,
};

pub const DEFAULT_DATABASE_URL: &str = "sqlite://./data/conversation_cache.db";

/// Sqlite-backed copy of the conversation cache.
///
/// Only messages the network accepted are stored; pending and failed
/// outbound messages live in memory only.
#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(connect_options)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    /// Identity whose conversations are stored here, if any was recorded.
    pub async fn cache_owner(&self) -> Result<Option<String>> {
        let owner = sqlx::query_scalar::<_, String>("SELECT identity FROM cache_owner WHERE slot = 0")
            .fetch_optional(&self.pool)
            .await
            .context("failed to read cache owner")?;
        Ok(owner)
    }

    pub async fn set_cache_owner(&self, identity: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO cache_owner (slot, identity) VALUES (0, ?)
             ON CONFLICT(slot) DO UPDATE SET identity = excluded.identity",
        )
        .bind(identity)
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to record cache owner {identity}"))?;
        Ok(())
    }

    pub async fn upsert_conversation(&self, conversation: &Conversation) -> Result<()> {
        let membership_json = serde_json::to_string(&conversation.membership)?;
        let consent = serde_json::to_string(&conversation.consent)?;
        let cursor_json = serde_json::to_string(&conversation.cursor)?;
        sqlx::query(
            "INSERT INTO conversations
                 (id, membership_json, consent, membership_published, created_at_ns, cursor_json)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                 membership_json = excluded.membership_json,
                 consent = excluded.consent,
                 membership_published = excluded.membership_published,
                 created_at_ns = excluded.created_at_ns,
                 cursor_json = excluded.cursor_json,
                 updated_at = CURRENT_TIMESTAMP",
        )
        .bind(conversation.id.as_str())
        .bind(membership_json)
        .bind(consent)
        .bind(conversation.membership_published)
        .bind(conversation.created_at_ns)
        .bind(cursor_json)
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to upsert conversation {}", conversation.id))?;
        Ok(())
    }

    pub async fn list_conversations(&self) -> Result<Vec<Conversation>> {
        let rows = sqlx::query(
            "SELECT id, membership_json, consent, membership_published, created_at_ns, cursor_json
             FROM conversations
             ORDER BY created_at_ns ASC, id ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(conversation_from_row).collect()
    }

    /// Inserts accepted messages, ignoring ids already stored. Returns the
    /// number of new rows.
    pub async fn insert_messages(&self, messages: &[Message]) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        let mut inserted = 0;
        for message in messages {
            if message.status != DeliveryStatus::Sent {
                continue;
            }
            let result = sqlx::query(
                "INSERT OR IGNORE INTO messages (conversation_id, id, sender, content, sent_at_ns)
                 VALUES (?, ?, ?, ?, ?)",
            )
            .bind(message.conversation_id.as_str())
            .bind(message.id.as_str())
            .bind(message.sender.as_str())
            .bind(&message.content)
            .bind(message.sent_at_ns)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("failed to insert message {}", message.id))?;
            inserted += result.rows_affected();
        }
        tx.commit().await?;
        debug!(inserted, "cache: persisted message batch");
        Ok(inserted)
    }

    pub async fn list_messages(&self, conversation_id: &ConversationId) -> Result<Vec<Message>> {
        let rows = sqlx::query(
            "SELECT conversation_id, id, sender, content, sent_at_ns
             FROM messages
             WHERE conversation_id = ?
             ORDER BY sent_at_ns ASC, id ASC",
        )
        .bind(conversation_id.as_str())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|r| Message {
                conversation_id: ConversationId(r.get::<String, _>(0)),
                id: MessageId(r.get::<String, _>(1)),
                sender: InboxId(r.get::<String, _>(2)),
                content: r.get::<String, _>(3),
                sent_at_ns: r.get::<i64, _>(4),
                status: DeliveryStatus::Sent,
            })
            .collect())
    }

    /// Removes a conversation and its messages. Returns whether it existed.
    pub async fn delete_conversation(&self, conversation_id: &ConversationId) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM messages WHERE conversation_id = ?")
            .bind(conversation_id.as_str())
            .execute(&mut *tx)
            .await?;
        let removed = sqlx::query("DELETE FROM conversations WHERE id = ?")
            .bind(conversation_id.as_str())
            .execute(&mut *tx)
            .await?
            .rows_affected();
        tx.commit().await?;
        Ok(removed > 0)
    }

    /// Drops every conversation, message and the recorded owner.
    pub async fn clear_all(&self) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM messages").execute(&mut *tx).await?;
        sqlx::query("DELETE FROM conversations")
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM cache_owner").execute(&mut *tx).await?;
        tx.commit().await?;
        Ok(())
    }
}

fn conversation_from_row(row: &SqliteRow) -> Result<Conversation> {
    let id = ConversationId(row.try_get::<String, _>(0)?);
    let membership: Membership = serde_json::from_str(&row.try_get::<String, _>(1)?)
        .with_context(|| format!("corrupt membership for conversation {id}"))?;
    let consent: ConsentState = serde_json::from_str(&row.try_get::<String, _>(2)?)
        .with_context(|| format!("corrupt consent state for conversation {id}"))?;
    let cursor: HistoryCursor = serde_json::from_str(&row.try_get::<String, _>(5)?)
        .with_context(|| format!("corrupt history cursor for conversation {id}"))?;
    Ok(Conversation {
        membership,
        consent,
        membership_published: row.try_get::<bool, _>(3)?,
        created_at_ns: row.try_get::<i64, _>(4)?,
        cursor,
        id,
    })
}

/// Normalizes a user-supplied database location into a sqlite url and makes
/// sure its parent directory exists.
pub fn prepare_database_url(raw_database_url: &str) -> Result<String> {
    let database_url = normalize_database_url(raw_database_url);
    ensure_sqlite_parent_dir_exists(&database_url)?;
    Ok(database_url)
}

fn normalize_database_url(raw_database_url: &str) -> String {
    let raw_database_url = raw_database_url.trim();

    if raw_database_url.is_empty() {
        return DEFAULT_DATABASE_URL.to_string();
    }

    if raw_database_url.starts_with("sqlite::memory:")
        || raw_database_url.starts_with("sqlite://")
        || raw_database_url.contains("://")
    {
        return raw_database_url.to_string();
    }

    if let Some(path) = raw_database_url.strip_prefix("sqlite:") {
        let path = path.replace('\\', "/");
        return format!("sqlite://{path}");
    }

    format!("sqlite://{}", raw_database_url.replace('\\', "/"))
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url == "sqlite::memory:" || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
