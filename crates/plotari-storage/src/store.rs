//! Durable conversation store contract and its implementations.
//!
//! The store is a key-value contract: whole conversations are loaded and
//! upserted by identity. Every call is idempotent.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::OptionalExtension;
use tracing::debug;

use plotari_core::error::{PlotariError, Result};
use plotari_core::types::{Conversation, ConversationKey};

use crate::db::Database;

/// Durable tier of the conversation cache.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn load(&self, key: &ConversationKey) -> Result<Option<Conversation>>;

    /// Insert or replace the record for `conversation.key`.
    async fn save(&self, conversation: &Conversation) -> Result<()>;

    /// Returns whether a record existed.
    async fn delete(&self, key: &ConversationKey) -> Result<bool>;

    /// Delete every record whose `expires_at <= now` and return their keys.
    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<Vec<ConversationKey>>;
}

// =============================================================================
// SQLite
// =============================================================================

/// SQLite-backed store. Blocking calls run on the tokio blocking pool.
#[derive(Debug, Clone)]
pub struct SqliteConversationStore {
    db: Arc<Database>,
}

impl SqliteConversationStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Database) -> Result<T> + Send + 'static,
    {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || f(&db))
            .await
            .map_err(|e| PlotariError::Storage(format!("Store task failed: {}", e)))?
    }
}

fn load_sync(db: &Database, key: &ConversationKey) -> Result<Option<Conversation>> {
    let payload: Option<String> = db.with_conn(|conn| {
        conn.query_row(
            "SELECT payload FROM conversations WHERE user_id = ?1 AND session_id = ?2",
            rusqlite::params![key.user_id, key.session_id],
            |row| row.get(0),
        )
        .optional()
        .map_err(|e| PlotariError::Storage(format!("Failed to load conversation: {}", e)))
    })?;
    payload
        .map(|p| serde_json::from_str(&p).map_err(PlotariError::from))
        .transpose()
}

fn save_sync(db: &Database, conversation: &Conversation) -> Result<()> {
    let payload = serde_json::to_string(conversation)?;
    db.with_conn(|conn| {
        conn.execute(
            "INSERT INTO conversations
                (user_id, session_id, payload, message_count, created_at, last_activity, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT (user_id, session_id) DO UPDATE SET
                payload = excluded.payload,
                message_count = excluded.message_count,
                last_activity = excluded.last_activity,
                expires_at = excluded.expires_at",
            rusqlite::params![
                conversation.key.user_id,
                conversation.key.session_id,
                payload,
                conversation.messages.len() as i64,
                conversation.created_at.timestamp_millis(),
                conversation.last_activity.timestamp_millis(),
                conversation.expires_at.timestamp_millis(),
            ],
        )
        .map_err(|e| PlotariError::Storage(format!("Failed to save conversation: {}", e)))?;
        Ok(())
    })
}

fn delete_sync(db: &Database, key: &ConversationKey) -> Result<bool> {
    db.with_conn(|conn| {
        let deleted = conn
            .execute(
                "DELETE FROM conversations WHERE user_id = ?1 AND session_id = ?2",
                rusqlite::params![key.user_id, key.session_id],
            )
            .map_err(|e| PlotariError::Storage(format!("Failed to delete conversation: {}", e)))?;
        Ok(deleted > 0)
    })
}

fn purge_sync(db: &Database, now: DateTime<Utc>) -> Result<Vec<ConversationKey>> {
    let cutoff = now.timestamp_millis();
    db.with_conn(|conn| {
        let tx = conn
            .unchecked_transaction()
            .map_err(|e| PlotariError::Storage(format!("Failed to begin purge: {}", e)))?;

        let keys = {
            let mut stmt = tx
                .prepare("SELECT user_id, session_id FROM conversations WHERE expires_at <= ?1")
                .map_err(|e| PlotariError::Storage(format!("Purge query failed: {}", e)))?;
            let rows = stmt
                .query_map(rusqlite::params![cutoff], |row| {
                    Ok(ConversationKey::new(
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                    ))
                })
                .map_err(|e| PlotariError::Storage(format!("Purge query failed: {}", e)))?;
            rows.collect::<std::result::Result<Vec<_>, _>>()
                .map_err(|e| PlotariError::Storage(format!("Purge row failed: {}", e)))?
        };

        tx.execute(
            "DELETE FROM conversations WHERE expires_at <= ?1",
            rusqlite::params![cutoff],
        )
        .map_err(|e| PlotariError::Storage(format!("Purge delete failed: {}", e)))?;
        tx.commit()
            .map_err(|e| PlotariError::Storage(format!("Purge commit failed: {}", e)))?;

        debug!(removed = keys.len(), "Purged expired conversations");
        Ok(keys)
    })
}

#[async_trait]
impl ConversationStore for SqliteConversationStore {
    async fn load(&self, key: &ConversationKey) -> Result<Option<Conversation>> {
        let key = key.clone();
        self.blocking(move |db| load_sync(db, &key)).await
    }

    async fn save(&self, conversation: &Conversation) -> Result<()> {
        let conversation = conversation.clone();
        self.blocking(move |db| save_sync(db, &conversation)).await
    }

    async fn delete(&self, key: &ConversationKey) -> Result<bool> {
        let key = key.clone();
        self.blocking(move |db| delete_sync(db, &key)).await
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<Vec<ConversationKey>> {
        self.blocking(move |db| purge_sync(db, now)).await
    }
}

// =============================================================================
// In-memory
// =============================================================================

/// Process-local store for tests and ephemeral runs.
#[derive(Debug, Default)]
pub struct MemoryConversationStore {
    records: Mutex<HashMap<ConversationKey, Conversation>>,
}

impl MemoryConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.lock().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn records(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, HashMap<ConversationKey, Conversation>>> {
        self.records
            .lock()
            .map_err(|e| PlotariError::Storage(format!("store lock poisoned: {}", e)))
    }
}

#[async_trait]
impl ConversationStore for MemoryConversationStore {
    async fn load(&self, key: &ConversationKey) -> Result<Option<Conversation>> {
        Ok(self.records()?.get(key).cloned())
    }

    async fn save(&self, conversation: &Conversation) -> Result<()> {
        self.records()?
            .insert(conversation.key.clone(), conversation.clone());
        Ok(())
    }

    async fn delete(&self, key: &ConversationKey) -> Result<bool> {
        Ok(self.records()?.remove(key).is_some())
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<Vec<ConversationKey>> {
        let mut records = self.records()?;
        let expired: Vec<ConversationKey> = records
            .values()
            .filter(|c| c.is_expired(now))
            .map(|c| c.key.clone())
            .collect();
        for key in &expired {
            records.remove(key);
        }
        Ok(expired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use plotari_core::types::Message;

    fn conversation(user: &str, session: &str, ttl_minutes: i64) -> Conversation {
        let now = Utc::now();
        let mut c = Conversation::new(
            ConversationKey::new(user, session),
            now,
            chrono::Duration::minutes(ttl_minutes),
        );
        c.push(Message::user("hello", now));
        c
    }

    fn sqlite_store() -> SqliteConversationStore {
        SqliteConversationStore::new(Arc::new(Database::in_memory().unwrap()))
    }

    async fn exercise_store(store: &dyn ConversationStore) {
        let live = conversation("u1", "s1", 60);
        let expired = conversation("u1", "s2", -5);

        store.save(&live).await.unwrap();
        store.save(&expired).await.unwrap();

        let loaded = store.load(&live.key).await.unwrap().unwrap();
        assert_eq!(loaded, live);
        assert!(store.load(&ConversationKey::new("u9", "s9")).await.unwrap().is_none());

        // Upsert replaces the record.
        let mut updated = live.clone();
        updated.push(Message::assistant("hi there", Utc::now(), vec![]));
        store.save(&updated).await.unwrap();
        store.save(&updated).await.unwrap();
        assert_eq!(store.load(&live.key).await.unwrap().unwrap().messages.len(), 2);

        let purged = store.purge_expired(Utc::now()).await.unwrap();
        assert_eq!(purged, vec![expired.key.clone()]);
        assert!(store.load(&expired.key).await.unwrap().is_none());

        assert!(store.delete(&live.key).await.unwrap());
        assert!(!store.delete(&live.key).await.unwrap());
    }

    #[tokio::test]
    async fn test_sqlite_store_contract() {
        exercise_store(&sqlite_store()).await;
    }

    #[tokio::test]
    async fn test_memory_store_contract() {
        exercise_store(&MemoryConversationStore::new()).await;
    }

    #[tokio::test]
    async fn test_sqlite_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plotari.db");
        let conv = conversation("u1", "s1", 60);
        {
            let store = SqliteConversationStore::new(Arc::new(Database::new(&path).unwrap()));
            store.save(&conv).await.unwrap();
        }
        let store = SqliteConversationStore::new(Arc::new(Database::new(&path).unwrap()));
        assert_eq!(store.load(&conv.key).await.unwrap(), Some(conv));
    }

    #[tokio::test]
    async fn test_corrupt_payload_is_an_error() {
        let db = Arc::new(Database::in_memory().unwrap());
        db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO conversations
                    (user_id, session_id, payload, created_at, last_activity, expires_at)
                 VALUES ('u', 's', 'not json', 0, 0, 0)",
                [],
            )
            .map_err(|e| PlotariError::Storage(e.to_string()))?;
            Ok(())
        })
        .unwrap();
        let store = SqliteConversationStore::new(db);
        let err = store.load(&ConversationKey::new("u", "s")).await.unwrap_err();
        assert!(matches!(err, PlotariError::Serialization(_)));
    }
}
