//! `search_group_history` — recent group lines from the context archive.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use mika_context::ContextStore;
use mika_core::types::SessionKey;

use crate::error::ToolError;
use crate::registry::{Tool, ToolContext};

const DEFAULT_COUNT: u64 = 20;
const MAX_COUNT: u64 = 100;

pub struct SearchGroupHistoryTool {
    store: Arc<ContextStore>,
}

impl SearchGroupHistoryTool {
    pub fn new(store: Arc<ContextStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Tool for SearchGroupHistoryTool {
    fn name(&self) -> &str {
        "search_group_history"
    }

    fn description(&self) -> &str {
        "查看当前群聊最近的历史消息记录。"
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "count": {
                    "type": "integer",
                    "description": "要获取的消息条数",
                    "minimum": 1,
                    "maximum": 100,
                }
            }
        })
    }

    async fn call(&self, args: Value, ctx: &ToolContext) -> Result<String, ToolError> {
        let Some(group_id) = ctx.group_id.as_deref().filter(|g| !g.trim().is_empty()) else {
            return Err(ToolError::InvalidArgs("group history requires a group session".into()));
        };
        let count = args
            .get("count")
            .and_then(|v| v.as_u64())
            .unwrap_or(DEFAULT_COUNT)
            .clamp(1, MAX_COUNT);

        let key = SessionKey::for_group(group_id);
        let total = self
            .store
            .archive_count(&key)
            .map_err(|e| ToolError::Handler(e.to_string()))?;
        let offset = total.saturating_sub(count);
        let rows = self
            .store
            .fetch_archive(&key, offset, count)
            .map_err(|e| ToolError::Handler(e.to_string()))?;

        if rows.is_empty() {
            return Ok("群聊里还没有历史消息。".to_string());
        }
        let lines: Vec<String> = rows
            .iter()
            .map(|row| format!("{}: {}", row.role.as_str(), row.content.to_text()))
            .collect();
        Ok(lines.join("\n"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::test_support::ctx;
    use mika_core::message::ChatMessage;
    use rusqlite::Connection;

    #[tokio::test]
    async fn returns_latest_lines_for_group() {
        let store = Arc::new(
            ContextStore::new(Connection::open_in_memory().unwrap(), 50, 8).unwrap(),
        );
        let key = SessionKey::for_group("g1");
        for i in 0..5 {
            store
                .append_message(&key, &ChatMessage::user(format!("line {}", i)))
                .unwrap();
        }
        let tool = SearchGroupHistoryTool::new(store);
        let out = tool.call(json!({"count": 2}), &ctx()).await.unwrap();
        assert!(out.contains("line 3"));
        assert!(out.contains("line 4"));
        assert!(!out.contains("line 0"));
    }

    #[tokio::test]
    async fn private_session_is_rejected() {
        let store = Arc::new(
            ContextStore::new(Connection::open_in_memory().unwrap(), 50, 8).unwrap(),
        );
        let tool = SearchGroupHistoryTool::new(store);
        let mut context = ctx();
        context.group_id = None;
        assert!(tool.call(json!({}), &context).await.is_err());
    }
}
