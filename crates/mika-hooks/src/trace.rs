//! Persistent per-request trace store.
//!
//! One `agent_traces` row per request: the plan snapshot plus an
//! append-only event array. Writes are best-effort; a failing trace write
//! must never surface to the user.

use std::sync::Mutex;

use async_trait::async_trait;
use rusqlite::Connection;
use serde_json::{json, Value};
use tracing::debug;

use mika_core::types::SessionKey;

use crate::hooks::AgentHooks;

/// Minimum spacing between prune passes.
const PRUNE_INTERVAL_SECS: f64 = 600.0;

#[derive(Debug, Clone)]
pub struct TraceRow {
    pub request_id: String,
    pub session_key: String,
    pub user_id: String,
    pub group_id: String,
    pub created_at: f64,
    pub plan: Value,
    pub events: Vec<Value>,
}

#[derive(Debug, Clone)]
pub struct TraceSummary {
    pub request_id: String,
    pub session_key: String,
    pub user_id: String,
    pub group_id: String,
    pub created_at: f64,
}

pub struct TraceStore {
    db: Mutex<Connection>,
    enabled: bool,
    retention_days: u32,
    max_rows: u32,
    last_prune_at: Mutex<f64>,
}

fn now_epoch() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64 / 1000.0
}

fn resolve_session_key(user_id: &str, group_id: &str) -> String {
    let gid = group_id.trim();
    let uid = user_id.trim();
    if !gid.is_empty() {
        SessionKey::for_group(gid).0
    } else if !uid.is_empty() {
        SessionKey::for_private(uid).0
    } else {
        "unknown".to_string()
    }
}

impl TraceStore {
    pub fn new(
        conn: Connection,
        enabled: bool,
        retention_days: u32,
        max_rows: u32,
    ) -> rusqlite::Result<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS agent_traces (
                request_id  TEXT PRIMARY KEY,
                session_key TEXT NOT NULL,
                user_id     TEXT NOT NULL DEFAULT '',
                group_id    TEXT NOT NULL DEFAULT '',
                created_at  REAL NOT NULL,
                plan_json   TEXT NOT NULL DEFAULT '',
                events_json TEXT NOT NULL DEFAULT '[]'
             );
             CREATE INDEX IF NOT EXISTS idx_agent_traces_session_created
                ON agent_traces(session_key, created_at);
             CREATE INDEX IF NOT EXISTS idx_agent_traces_created
                ON agent_traces(created_at);",
        )?;
        Ok(Self {
            db: Mutex::new(conn),
            enabled,
            retention_days: retention_days.max(1),
            max_rows: max_rows.max(100),
            // Start the prune clock now so a fresh store doesn't prune on
            // its very first write.
            last_prune_at: Mutex::new(now_epoch()),
        })
    }

    fn ensure_row(
        conn: &Connection,
        request_id: &str,
        session_key: &str,
        user_id: &str,
        group_id: &str,
        created_at: f64,
    ) -> rusqlite::Result<()> {
        conn.execute(
            "INSERT OR IGNORE INTO agent_traces
                (request_id, session_key, user_id, group_id, created_at, plan_json, events_json)
             VALUES (?1, ?2, ?3, ?4, ?5, '', '[]')",
            rusqlite::params![request_id, session_key, user_id, group_id, created_at],
        )?;
        Ok(())
    }

    /// Append one event to the request's event log, in emission order.
    pub fn append_event(
        &self,
        request_id: &str,
        session_key: &str,
        user_id: &str,
        group_id: &str,
        event: Value,
    ) {
        if !self.enabled || request_id.trim().is_empty() {
            return;
        }
        let sk = if session_key.trim().is_empty() {
            resolve_session_key(user_id, group_id)
        } else {
            session_key.trim().to_string()
        };

        let mut safe_event = match event {
            Value::Object(map) => Value::Object(map),
            other => json!({ "value": other }),
        };
        if safe_event.get("ts").is_none() {
            safe_event["ts"] = json!(now_epoch());
        }
        let ts = safe_event["ts"].as_f64().unwrap_or_else(now_epoch);

        let result: rusqlite::Result<()> = (|| {
            let conn = self.db.lock().unwrap();
            Self::ensure_row(&conn, request_id.trim(), &sk, user_id.trim(), group_id.trim(), ts)?;
            let raw: String = conn.query_row(
                "SELECT events_json FROM agent_traces WHERE request_id = ?1",
                [request_id.trim()],
                |row| row.get(0),
            )?;
            let mut events: Vec<Value> = serde_json::from_str(&raw).unwrap_or_default();
            events.push(safe_event);
            conn.execute(
                "UPDATE agent_traces SET events_json = ?1 WHERE request_id = ?2",
                rusqlite::params![
                    serde_json::to_string(&events).unwrap_or_else(|_| "[]".into()),
                    request_id.trim()
                ],
            )?;
            Ok(())
        })();
        if let Err(err) = result {
            debug!(%err, "trace append_event failed");
        }
        self.prune_if_needed();
    }

    /// Store (overwrite) the request's plan snapshot.
    pub fn set_plan(
        &self,
        request_id: &str,
        session_key: &str,
        user_id: &str,
        group_id: &str,
        plan: &Value,
    ) {
        if !self.enabled || request_id.trim().is_empty() {
            return;
        }
        let sk = if session_key.trim().is_empty() {
            resolve_session_key(user_id, group_id)
        } else {
            session_key.trim().to_string()
        };
        let result: rusqlite::Result<()> = (|| {
            let conn = self.db.lock().unwrap();
            Self::ensure_row(
                &conn,
                request_id.trim(),
                &sk,
                user_id.trim(),
                group_id.trim(),
                now_epoch(),
            )?;
            conn.execute(
                "UPDATE agent_traces SET plan_json = ?1 WHERE request_id = ?2",
                rusqlite::params![
                    serde_json::to_string(plan).unwrap_or_default(),
                    request_id.trim()
                ],
            )?;
            Ok(())
        })();
        if let Err(err) = result {
            debug!(%err, "trace set_plan failed");
        }
    }

    pub fn get_trace(&self, request_id: &str) -> Option<TraceRow> {
        let conn = self.db.lock().unwrap();
        conn.query_row(
            "SELECT request_id, session_key, user_id, group_id, created_at, plan_json, events_json
             FROM agent_traces WHERE request_id = ?1",
            [request_id.trim()],
            |row| {
                let plan_raw: String = row.get(5)?;
                let events_raw: String = row.get(6)?;
                Ok(TraceRow {
                    request_id: row.get(0)?,
                    session_key: row.get(1)?,
                    user_id: row.get(2)?,
                    group_id: row.get(3)?,
                    created_at: row.get(4)?,
                    plan: serde_json::from_str(&plan_raw).unwrap_or(Value::Null),
                    events: serde_json::from_str(&events_raw).unwrap_or_default(),
                })
            },
        )
        .ok()
    }

    pub fn list_recent(&self, session_key: Option<&str>, limit: usize) -> Vec<TraceSummary> {
        let limit = limit.clamp(1, 200) as i64;
        let conn = self.db.lock().unwrap();
        let map_row = |row: &rusqlite::Row<'_>| -> rusqlite::Result<TraceSummary> {
            Ok(TraceSummary {
                request_id: row.get(0)?,
                session_key: row.get(1)?,
                user_id: row.get(2)?,
                group_id: row.get(3)?,
                created_at: row.get(4)?,
            })
        };
        let result = match session_key.map(str::trim).filter(|s| !s.is_empty()) {
            Some(sk) => conn
                .prepare(
                    "SELECT request_id, session_key, user_id, group_id, created_at
                     FROM agent_traces WHERE session_key = ?1
                     ORDER BY created_at DESC LIMIT ?2",
                )
                .and_then(|mut stmt| {
                    let rows = stmt.query_map(rusqlite::params![sk, limit], map_row)?;
                    Ok(rows.filter_map(|r| r.ok()).collect::<Vec<_>>())
                }),
            None => conn
                .prepare(
                    "SELECT request_id, session_key, user_id, group_id, created_at
                     FROM agent_traces ORDER BY created_at DESC LIMIT ?1",
                )
                .and_then(|mut stmt| {
                    let rows = stmt.query_map([limit], map_row)?;
                    Ok(rows.filter_map(|r| r.ok()).collect::<Vec<_>>())
                }),
        };
        result.unwrap_or_default()
    }

    /// Age out rows past retention, then cap the table at max_rows
    /// (oldest first). Rate-limited to one pass per ten minutes.
    pub fn prune_if_needed(&self) {
        if !self.enabled {
            return;
        }
        let now = now_epoch();
        {
            let mut last = self.last_prune_at.lock().unwrap();
            if now - *last < PRUNE_INTERVAL_SECS {
                return;
            }
            *last = now;
        }
        let result: rusqlite::Result<()> = (|| {
            let conn = self.db.lock().unwrap();
            let cutoff = now - self.retention_days as f64 * 86_400.0;
            conn.execute("DELETE FROM agent_traces WHERE created_at < ?1", [cutoff])?;
            let total: i64 = conn.query_row("SELECT COUNT(*) FROM agent_traces", [], |r| r.get(0))?;
            if total > self.max_rows as i64 {
                conn.execute(
                    "DELETE FROM agent_traces WHERE request_id IN (
                        SELECT request_id FROM agent_traces ORDER BY created_at ASC LIMIT ?1
                     )",
                    [total - self.max_rows as i64],
                )?;
            }
            Ok(())
        })();
        if let Err(err) = result {
            debug!(%err, "trace prune failed");
        }
    }

    #[cfg(test)]
    fn force_prune(&self) {
        *self.last_prune_at.lock().unwrap() = 0.0;
        self.prune_if_needed();
    }
}

/// Default hooks implementation persisting every lifecycle event as a
/// trace row event.
pub struct TraceHooks {
    store: std::sync::Arc<TraceStore>,
}

impl TraceHooks {
    pub fn new(store: std::sync::Arc<TraceStore>) -> Self {
        Self { store }
    }

    fn record(&self, event_type: &str, payload: &Value) {
        let request_id = payload
            .get("request_id")
            .and_then(|v| v.as_str())
            .unwrap_or("");
        if request_id.is_empty() {
            return;
        }
        let user_id = payload.get("user_id").and_then(|v| v.as_str()).unwrap_or("");
        let group_id = payload.get("group_id").and_then(|v| v.as_str()).unwrap_or("");
        let session_key = payload
            .get("session_key")
            .and_then(|v| v.as_str())
            .unwrap_or("");
        let mut event = payload.clone();
        event["type"] = json!(event_type);
        self.store
            .append_event(request_id, session_key, user_id, group_id, event);
    }
}

#[async_trait]
impl AgentHooks for TraceHooks {
    async fn on_before_llm(&self, payload: &Value) {
        self.record("before_llm", payload);
    }
    async fn on_after_llm(&self, payload: &Value) {
        self.record("after_llm", payload);
    }
    async fn on_tool_start(&self, payload: &Value) {
        self.record("tool_start", payload);
    }
    async fn on_tool_end(&self, payload: &Value) {
        self.record("tool_end", payload);
    }
}
