//! Topic summary storage.
//!
//! `topic_summaries` is unique on (session_key, topic); upserts accumulate
//! `source_message_count`. `topic_summary_state` tracks the summarizer's
//! per-session batch cursor.

use std::sync::Mutex;

use rusqlite::Connection;

use mika_core::types::SessionKey;

use crate::error::Result;

#[derive(Debug, Clone, PartialEq)]
pub struct TopicSummaryEntry {
    pub id: i64,
    pub session_key: String,
    pub topic: String,
    pub keywords: Vec<String>,
    pub summary: String,
    pub key_points: Vec<String>,
    pub participants: Vec<String>,
    pub timestamp_start: f64,
    pub timestamp_end: f64,
    pub source_message_count: u32,
    pub created_at: f64,
    pub updated_at: f64,
}

/// Fields written on upsert/merge.
#[derive(Debug, Clone, Default)]
pub struct TopicUpsert {
    pub topic: String,
    pub summary: String,
    pub keywords: Vec<String>,
    pub key_points: Vec<String>,
    pub participants: Vec<String>,
    pub timestamp_start: f64,
    pub timestamp_end: f64,
    pub source_message_count: u32,
}

fn now_epoch() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64 / 1000.0
}

fn encode_list(items: &[String]) -> String {
    serde_json::to_string(items).unwrap_or_else(|_| "[]".into())
}

fn decode_list(raw: &str) -> Vec<String> {
    serde_json::from_str(raw).unwrap_or_default()
}

pub struct TopicStore {
    db: Mutex<Connection>,
}

impl TopicStore {
    pub fn new(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS topic_summaries (
                id                   INTEGER PRIMARY KEY AUTOINCREMENT,
                session_key          TEXT NOT NULL,
                topic                TEXT NOT NULL,
                keywords             TEXT NOT NULL DEFAULT '[]',
                summary              TEXT NOT NULL DEFAULT '',
                key_points           TEXT NOT NULL DEFAULT '[]',
                participants         TEXT NOT NULL DEFAULT '[]',
                timestamp_start      REAL NOT NULL DEFAULT 0,
                timestamp_end        REAL NOT NULL DEFAULT 0,
                source_message_count INTEGER NOT NULL DEFAULT 0,
                created_at           REAL NOT NULL,
                updated_at           REAL NOT NULL,
                UNIQUE(session_key, topic)
             );
             CREATE TABLE IF NOT EXISTS topic_summary_state (
                session_key             TEXT PRIMARY KEY,
                processed_message_count INTEGER NOT NULL DEFAULT 0,
                updated_at              REAL NOT NULL
             );",
        )?;
        Ok(Self {
            db: Mutex::new(conn),
        })
    }

    pub fn processed_count(&self, session_key: &SessionKey) -> Result<u64> {
        let db = self.db.lock().unwrap();
        let count: Option<i64> = db
            .query_row(
                "SELECT processed_message_count FROM topic_summary_state WHERE session_key = ?1",
                [session_key.as_str()],
                |row| row.get(0),
            )
            .ok();
        Ok(count.unwrap_or(0).max(0) as u64)
    }

    pub fn set_processed_count(&self, session_key: &SessionKey, count: u64) -> Result<()> {
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO topic_summary_state (session_key, processed_message_count, updated_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(session_key)
             DO UPDATE SET processed_message_count = excluded.processed_message_count,
                           updated_at = excluded.updated_at",
            rusqlite::params![session_key.as_str(), count as i64, now_epoch()],
        )?;
        Ok(())
    }

    /// Insert or merge one topic. Existing rows accumulate
    /// source_message_count and widen their time range.
    pub fn upsert(&self, session_key: &SessionKey, entry: &TopicUpsert) -> Result<()> {
        let db = self.db.lock().unwrap();
        let now = now_epoch();
        db.execute(
            "INSERT INTO topic_summaries (
                session_key, topic, keywords, summary, key_points, participants,
                timestamp_start, timestamp_end, source_message_count, created_at, updated_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10)
             ON CONFLICT(session_key, topic) DO UPDATE SET
                keywords = excluded.keywords,
                summary = excluded.summary,
                key_points = excluded.key_points,
                participants = excluded.participants,
                timestamp_start = MIN(topic_summaries.timestamp_start, excluded.timestamp_start),
                timestamp_end = MAX(topic_summaries.timestamp_end, excluded.timestamp_end),
                source_message_count = topic_summaries.source_message_count + excluded.source_message_count,
                updated_at = excluded.updated_at",
            rusqlite::params![
                session_key.as_str(),
                entry.topic,
                encode_list(&entry.keywords),
                entry.summary,
                encode_list(&entry.key_points),
                encode_list(&entry.participants),
                entry.timestamp_start,
                entry.timestamp_end,
                entry.source_message_count,
                now,
            ],
        )?;
        Ok(())
    }

    /// Overwrite a topic wholesale (dream merges rebuild the row).
    pub fn replace(&self, session_key: &SessionKey, entry: &TopicUpsert) -> Result<()> {
        let db = self.db.lock().unwrap();
        db.execute(
            "UPDATE topic_summaries SET
                keywords = ?3, summary = ?4, key_points = ?5, participants = ?6,
                timestamp_start = ?7, timestamp_end = ?8, source_message_count = ?9,
                updated_at = ?10
             WHERE session_key = ?1 AND topic = ?2",
            rusqlite::params![
                session_key.as_str(),
                entry.topic,
                encode_list(&entry.keywords),
                entry.summary,
                encode_list(&entry.key_points),
                encode_list(&entry.participants),
                entry.timestamp_start,
                entry.timestamp_end,
                entry.source_message_count,
                now_epoch(),
            ],
        )?;
        Ok(())
    }

    pub fn list_topics(&self, session_key: &SessionKey, limit: usize) -> Result<Vec<TopicSummaryEntry>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT id, session_key, topic, keywords, summary, key_points, participants,
                    timestamp_start, timestamp_end, source_message_count, created_at, updated_at
             FROM topic_summaries
             WHERE session_key = ?1
             ORDER BY updated_at DESC
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(
            rusqlite::params![session_key.as_str(), limit.max(1) as i64],
            |row| {
                let keywords: String = row.get(3)?;
                let key_points: String = row.get(5)?;
                let participants: String = row.get(6)?;
                Ok(TopicSummaryEntry {
                    id: row.get(0)?,
                    session_key: row.get(1)?,
                    topic: row.get(2)?,
                    keywords: decode_list(&keywords),
                    summary: row.get(4)?,
                    key_points: decode_list(&key_points),
                    participants: decode_list(&participants),
                    timestamp_start: row.get(7)?,
                    timestamp_end: row.get(8)?,
                    source_message_count: row.get::<_, i64>(9)?.max(0) as u32,
                    created_at: row.get(10)?,
                    updated_at: row.get(11)?,
                })
            },
        )?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    pub fn delete_topic(&self, session_key: &SessionKey, topic: &str) -> Result<bool> {
        let db = self.db.lock().unwrap();
        let n = db.execute(
            "DELETE FROM topic_summaries WHERE session_key = ?1 AND topic = ?2",
            rusqlite::params![session_key.as_str(), topic],
        )?;
        Ok(n > 0)
    }

    pub fn clear_session(&self, session_key: &SessionKey) -> Result<()> {
        let db = self.db.lock().unwrap();
        db.execute(
            "DELETE FROM topic_summaries WHERE session_key = ?1",
            [session_key.as_str()],
        )?;
        db.execute(
            "DELETE FROM topic_summary_state WHERE session_key = ?1",
            [session_key.as_str()],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> TopicStore {
        TopicStore::new(Connection::open_in_memory().unwrap()).unwrap()
    }

    fn entry(topic: &str, count: u32) -> TopicUpsert {
        TopicUpsert {
            topic: topic.to_string(),
            summary: format!("about {}", topic),
            keywords: vec!["k1".into()],
            key_points: vec!["p1".into()],
            participants: vec!["Alice".into()],
            timestamp_start: 100.0,
            timestamp_end: 200.0,
            source_message_count: count,
        }
    }

    #[test]
    fn upsert_accumulates_source_count() {
        let store = store();
        let key = SessionKey::for_group("g");
        store.upsert(&key, &entry("旅行", 10)).unwrap();
        store.upsert(&key, &entry("旅行", 5)).unwrap();
        let topics = store.list_topics(&key, 10).unwrap();
        assert_eq!(topics.len(), 1);
        assert_eq!(topics[0].source_message_count, 15);
    }

    #[test]
    fn cursor_round_trips() {
        let store = store();
        let key = SessionKey::for_private("u");
        assert_eq!(store.processed_count(&key).unwrap(), 0);
        store.set_processed_count(&key, 30).unwrap();
        assert_eq!(store.processed_count(&key).unwrap(), 30);
    }

    #[test]
    fn delete_reports_whether_row_existed() {
        let store = store();
        let key = SessionKey::for_group("g");
        store.upsert(&key, &entry("美食", 1)).unwrap();
        assert!(store.delete_topic(&key, "美食").unwrap());
        assert!(!store.delete_topic(&key, "美食").unwrap());
    }
}
