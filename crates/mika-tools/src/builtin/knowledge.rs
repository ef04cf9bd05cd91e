//! `search_knowledge` — vector search over the configured knowledge base.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use mika_memory::KnowledgeStore;

use crate::error::ToolError;
use crate::registry::{Tool, ToolContext};

const DEFAULT_TOP_K: u64 = 5;

pub struct SearchKnowledgeTool {
    store: Arc<dyn KnowledgeStore>,
    default_corpus_id: String,
}

impl SearchKnowledgeTool {
    pub fn new(store: Arc<dyn KnowledgeStore>, default_corpus_id: impl Into<String>) -> Self {
        Self {
            store,
            default_corpus_id: default_corpus_id.into(),
        }
    }
}

#[async_trait]
impl Tool for SearchKnowledgeTool {
    fn name(&self) -> &str {
        "search_knowledge"
    }

    fn description(&self) -> &str {
        "在知识库中检索与问题相关的资料片段。"
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": {"type": "string", "description": "检索内容"},
                "top_k": {"type": "integer", "minimum": 1, "maximum": 20},
            },
            "required": ["query"]
        })
    }

    async fn call(&self, args: Value, _ctx: &ToolContext) -> Result<String, ToolError> {
        let query = args
            .get("query")
            .and_then(|v| v.as_str())
            .map(str::trim)
            .filter(|q| !q.is_empty())
            .ok_or_else(|| ToolError::InvalidArgs("missing query".into()))?;
        let top_k = args
            .get("top_k")
            .and_then(|v| v.as_u64())
            .unwrap_or(DEFAULT_TOP_K)
            .clamp(1, 20) as usize;
        let corpus_id = args
            .get("corpus_id")
            .and_then(|v| v.as_str())
            .unwrap_or(&self.default_corpus_id);

        let hits = self
            .store
            .search(query, top_k, corpus_id)
            .await
            .map_err(|e| ToolError::Handler(e.to_string()))?;
        if hits.is_empty() {
            return Ok("知识库中没有找到相关内容。".to_string());
        }
        let lines: Vec<String> = hits
            .iter()
            .map(|h| format!("[{:.2}] {}: {}", h.score, h.title, h.snippet))
            .collect();
        Ok(lines.join("\n"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::test_support::ctx;
    use mika_memory::stores::reference::InMemoryKnowledgeStore;

    #[tokio::test]
    async fn hits_are_rendered_with_scores() {
        let store = Arc::new(InMemoryKnowledgeStore::new());
        store.insert("docs", "Ownership", "rust ownership explained with examples");
        let tool = SearchKnowledgeTool::new(store, "docs");
        let out = tool
            .call(json!({"query": "rust ownership"}), &ctx())
            .await
            .unwrap();
        assert!(out.contains("Ownership"));
        assert!(out.starts_with('['));
    }
}
