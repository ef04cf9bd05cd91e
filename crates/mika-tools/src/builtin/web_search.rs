//! `web_search` — external search behind an opaque backend.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::error::ToolError;
use crate::registry::{Tool, ToolContext};

/// Search engine seam; the concrete engine lives outside the core.
#[async_trait]
pub trait SearchBackend: Send + Sync {
    /// Returns a formatted text result set for the query.
    async fn search(&self, query: &str) -> Result<String, ToolError>;
}

pub struct WebSearchTool {
    backend: Arc<dyn SearchBackend>,
}

impl WebSearchTool {
    pub fn new(backend: Arc<dyn SearchBackend>) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl Tool for WebSearchTool {
    fn name(&self) -> &str {
        "web_search"
    }

    fn description(&self) -> &str {
        "搜索互联网获取实时信息。用于回答需要最新资讯的问题。"
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": {
                    "type": "string",
                    "description": "搜索关键词",
                }
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
        self.backend.search(query).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::test_support::ctx;

    struct FixedBackend;

    #[async_trait]
    impl SearchBackend for FixedBackend {
        async fn search(&self, query: &str) -> Result<String, ToolError> {
            Ok(format!("results for {}", query))
        }
    }

    #[tokio::test]
    async fn missing_query_is_invalid_args() {
        let tool = WebSearchTool::new(Arc::new(FixedBackend));
        let err = tool.call(json!({}), &ctx()).await.unwrap_err();
        assert!(matches!(err, ToolError::InvalidArgs(_)));
        let ok = tool.call(json!({"query": "rust"}), &ctx()).await.unwrap();
        assert_eq!(ok, "results for rust");
    }
}
