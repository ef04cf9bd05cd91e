//! Persistent conversation storage.
//!
//! Two layers per session: a bounded `contexts` snapshot for fast reads and
//! an append-only `message_archive` from which transcripts and topic
//! summaries are re-derived. Snapshot and archive rows for one message are
//! written in a single transaction so readers see both or neither.

use std::num::NonZeroUsize;
use std::sync::Mutex;

use lru::LruCache;
use rusqlite::Connection;
use tracing::debug;

use mika_core::message::{parse_archived_content, ChatMessage, MessageContent, Role};
use mika_core::types::SessionKey;

use crate::error::Result;

/// Initialise context tables and pragmas. Idempotent.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "PRAGMA journal_mode=WAL;
         PRAGMA synchronous=NORMAL;
         PRAGMA busy_timeout=5000;
         CREATE TABLE IF NOT EXISTS contexts (
            context_key TEXT PRIMARY KEY,
            messages    TEXT NOT NULL DEFAULT '[]',
            created_at  REAL NOT NULL,
            updated_at  REAL NOT NULL
         );
         CREATE TABLE IF NOT EXISTS message_archive (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            context_key TEXT NOT NULL,
            user_id     TEXT NOT NULL DEFAULT '',
            role        TEXT NOT NULL,
            content     TEXT NOT NULL,
            message_id  TEXT,
            timestamp   REAL NOT NULL,
            created_at  REAL NOT NULL
         );
         CREATE INDEX IF NOT EXISTS idx_archive_key_ts
            ON message_archive(context_key, timestamp);",
    )?;
    Ok(())
}

/// One row re-read from the archive.
#[derive(Debug, Clone)]
pub struct ArchivedMessage {
    pub id: i64,
    pub user_id: String,
    pub role: Role,
    pub content: MessageContent,
    pub message_id: Option<String>,
    pub timestamp: f64,
}

fn role_from_str(role: &str) -> Role {
    match role {
        "system" => Role::System,
        "assistant" => Role::Assistant,
        "tool" => Role::Tool,
        _ => Role::User,
    }
}

/// Archive encoding: plain text stays plain, part lists are JSON strings.
fn encode_content(content: &MessageContent) -> String {
    match content {
        MessageContent::Text(text) => text.clone(),
        MessageContent::Parts(parts) => serde_json::to_string(parts).unwrap_or_default(),
    }
}

fn now_epoch() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64 / 1000.0
}

pub struct ContextStore {
    db: Mutex<Connection>,
    cache: Mutex<LruCache<String, Vec<ChatMessage>>>,
    snapshot_max: usize,
}

impl ContextStore {
    pub fn new(conn: Connection, snapshot_max: usize, cache_entries: usize) -> Result<Self> {
        init_db(&conn)?;
        let capacity = NonZeroUsize::new(cache_entries.max(1)).unwrap();
        Ok(Self {
            db: Mutex::new(conn),
            cache: Mutex::new(LruCache::new(capacity)),
            snapshot_max: snapshot_max.max(1),
        })
    }

    /// Append one message: archive row + refreshed snapshot, atomically.
    pub fn append_message(&self, session_key: &SessionKey, msg: &ChatMessage) -> Result<()> {
        self.append_messages(session_key, std::slice::from_ref(msg))
    }

    /// Append a batch (user input, tool trace, assistant reply) in one
    /// transaction so a session's archive contains all inputs before the
    /// final assistant row becomes visible.
    pub fn append_messages(&self, session_key: &SessionKey, batch: &[ChatMessage]) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let mut snapshot = self.snapshot_from_db(session_key)?;
        let now = now_epoch();

        {
            let mut db = self.db.lock().unwrap();
            let tx = db.transaction()?;
            for msg in batch {
                let ts = msg.timestamp.unwrap_or(now);
                tx.execute(
                    "INSERT INTO message_archive
                     (context_key, user_id, role, content, message_id, timestamp, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    rusqlite::params![
                        session_key.as_str(),
                        msg.user_id.clone().unwrap_or_default(),
                        msg.role.as_str(),
                        encode_content(&msg.content),
                        msg.message_id,
                        ts,
                        now,
                    ],
                )?;
                let mut stored = msg.clone();
                stored.timestamp = Some(ts);
                snapshot.push(stored);
            }
            if snapshot.len() > self.snapshot_max {
                snapshot.drain(..snapshot.len() - self.snapshot_max);
            }
            tx.execute(
                "INSERT INTO contexts (context_key, messages, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?3)
                 ON CONFLICT(context_key)
                 DO UPDATE SET messages = excluded.messages, updated_at = excluded.updated_at",
                rusqlite::params![
                    session_key.as_str(),
                    serde_json::to_string(&snapshot)?,
                    now,
                ],
            )?;
            tx.commit()?;
        }

        self.cache
            .lock()
            .unwrap()
            .put(session_key.as_str().to_string(), snapshot);
        debug!(session_key = %session_key, count = batch.len(), "context persisted");
        Ok(())
    }

    /// Last-N snapshot, from cache when warm.
    pub fn get_snapshot(&self, session_key: &SessionKey) -> Result<Vec<ChatMessage>> {
        if let Some(hit) = self.cache.lock().unwrap().get(session_key.as_str()) {
            return Ok(hit.clone());
        }
        let snapshot = self.snapshot_from_db(session_key)?;
        self.cache
            .lock()
            .unwrap()
            .put(session_key.as_str().to_string(), snapshot.clone());
        Ok(snapshot)
    }

    fn snapshot_from_db(&self, session_key: &SessionKey) -> Result<Vec<ChatMessage>> {
        let db = self.db.lock().unwrap();
        let raw: Option<String> = db
            .query_row(
                "SELECT messages FROM contexts WHERE context_key = ?1",
                [session_key.as_str()],
                |row| row.get(0),
            )
            .ok();
        match raw {
            Some(json) => Ok(serde_json::from_str(&json).unwrap_or_default()),
            None => Ok(Vec::new()),
        }
    }

    pub fn clear_session(&self, session_key: &SessionKey) -> Result<()> {
        {
            let db = self.db.lock().unwrap();
            db.execute(
                "DELETE FROM contexts WHERE context_key = ?1",
                [session_key.as_str()],
            )?;
        }
        self.cache.lock().unwrap().pop(session_key.as_str());
        Ok(())
    }

    pub fn archive_count(&self, session_key: &SessionKey) -> Result<u64> {
        let db = self.db.lock().unwrap();
        let count: i64 = db.query_row(
            "SELECT COUNT(*) FROM message_archive WHERE context_key = ?1",
            [session_key.as_str()],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    /// Archive rows in insertion order, `offset`-based (for the topic
    /// summarizer's batch cursor).
    pub fn fetch_archive(
        &self,
        session_key: &SessionKey,
        offset: u64,
        limit: u64,
    ) -> Result<Vec<ArchivedMessage>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT id, user_id, role, content, message_id, timestamp
             FROM message_archive
             WHERE context_key = ?1
             ORDER BY id
             LIMIT ?2 OFFSET ?3",
        )?;
        let rows = stmt.query_map(
            rusqlite::params![session_key.as_str(), limit as i64, offset as i64],
            |row| {
                let role: String = row.get(2)?;
                let content: String = row.get(3)?;
                Ok(ArchivedMessage {
                    id: row.get(0)?,
                    user_id: row.get(1)?,
                    role: role_from_str(&role),
                    content: parse_archived_content(&content),
                    message_id: row.get(4)?,
                    timestamp: row.get(5)?,
                })
            },
        )?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    /// Latest archive timestamp, for idle detection.
    pub fn last_activity(&self, session_key: &SessionKey) -> Result<Option<f64>> {
        let db = self.db.lock().unwrap();
        let ts: rusqlite::Result<Option<f64>> = db.query_row(
            "SELECT MAX(timestamp) FROM message_archive WHERE context_key = ?1",
            [session_key.as_str()],
            |row| row.get::<_, Option<f64>>(0),
        );
        Ok(ts.ok().flatten())
    }

    /// All session keys with archived traffic (dream scheduling).
    pub fn session_keys(&self) -> Result<Vec<SessionKey>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare("SELECT DISTINCT context_key FROM message_archive")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        Ok(rows
            .filter_map(|r| r.ok())
            .map(|k| SessionKey::from(k.as_str()))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> ContextStore {
        ContextStore::new(Connection::open_in_memory().unwrap(), 5, 8).unwrap()
    }

    #[test]
    fn snapshot_and_archive_stay_consistent() {
        let store = store();
        let key = SessionKey::for_group("g1");
        let mut msg = ChatMessage::user("[Alice(1)]: hello");
        msg.user_id = Some("1".into());
        msg.message_id = Some("m1".into());
        store.append_message(&key, &msg).unwrap();

        let snapshot = store.get_snapshot(&key).unwrap();
        assert_eq!(snapshot.len(), 1);
        assert!(snapshot[0].timestamp.is_some());
        assert_eq!(store.archive_count(&key).unwrap(), 1);

        let rows = store.fetch_archive(&key, 0, 10).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].user_id, "1");
        assert_eq!(rows[0].content.to_text(), "[Alice(1)]: hello");
    }

    #[test]
    fn snapshot_caps_at_configured_length() {
        let store = store();
        let key = SessionKey::for_private("u1");
        for i in 0..9 {
            store
                .append_message(&key, &ChatMessage::user(format!("msg {}", i)))
                .unwrap();
        }
        let snapshot = store.get_snapshot(&key).unwrap();
        assert_eq!(snapshot.len(), 5);
        assert_eq!(snapshot[0].content.to_text(), "msg 4");
        // The archive keeps everything.
        assert_eq!(store.archive_count(&key).unwrap(), 9);
    }

    #[test]
    fn batch_append_is_one_visible_unit() {
        let store = store();
        let key = SessionKey::for_group("g2");
        let batch = vec![
            ChatMessage::user("[A(1)]: question"),
            ChatMessage::assistant("[Mika]: answer"),
        ];
        store.append_messages(&key, &batch).unwrap();
        assert_eq!(store.archive_count(&key).unwrap(), 2);
        let snapshot = store.get_snapshot(&key).unwrap();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[1].role, Role::Assistant);
    }

    #[test]
    fn rows_survive_connection_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ctx.db");
        let key = SessionKey::for_group("g3");
        {
            let store = ContextStore::new(Connection::open(&path).unwrap(), 5, 8).unwrap();
            store
                .append_message(&key, &ChatMessage::user("durable line"))
                .unwrap();
        }
        let store = ContextStore::new(Connection::open(&path).unwrap(), 5, 8).unwrap();
        let snapshot = store.get_snapshot(&key).unwrap();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].content.to_text(), "durable line");
        assert_eq!(store.archive_count(&key).unwrap(), 1);
    }

    #[test]
    fn parts_content_round_trips_through_archive() {
        let store = store();
        let key = SessionKey::for_private("u2");
        let msg = ChatMessage {
            content: MessageContent::Parts(vec![mika_core::message::ContentPart::Text {
                text: "with parts".into(),
            }]),
            ..ChatMessage::user("")
        };
        store.append_message(&key, &msg).unwrap();
        let rows = store.fetch_archive(&key, 0, 10).unwrap();
        assert!(matches!(rows[0].content, MessageContent::Parts(_)));
    }
}
