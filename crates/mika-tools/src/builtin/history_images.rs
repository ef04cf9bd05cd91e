//! `fetch_history_images` — re-fetch images referenced by message ids.
//!
//! The backend owns the image cache; the tool enforces that requested
//! messages belong to the current group before anything is returned.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Value};

use crate::error::ToolError;
use crate::registry::{Tool, ToolContext};

const DEFAULT_MAX_IMAGES: usize = 3;

#[derive(Debug, Clone, Serialize)]
pub struct HistoryImages {
    pub count: usize,
    /// One entry per requested message id: `{msg_id, found, sender}`.
    pub mapping: Vec<Value>,
    /// Data URLs ready for multimodal injection.
    pub images: Vec<String>,
}

/// Image-cache seam. `fetch` must only return images whose source message
/// belongs to `group_id`; foreign message ids are reported as not found.
#[async_trait]
pub trait HistoryImageBackend: Send + Sync {
    async fn fetch(
        &self,
        group_id: &str,
        msg_ids: &[String],
        max_images: usize,
    ) -> Result<HistoryImages, ToolError>;
}

pub struct FetchHistoryImagesTool {
    backend: Arc<dyn HistoryImageBackend>,
}

impl FetchHistoryImagesTool {
    pub fn new(backend: Arc<dyn HistoryImageBackend>) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl Tool for FetchHistoryImagesTool {
    fn name(&self) -> &str {
        "fetch_history_images"
    }

    fn description(&self) -> &str {
        "根据消息 ID 取回历史消息中的图片内容（仅限当前群聊）。"
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "msg_ids": {
                    "type": "array",
                    "items": {"type": "string"},
                    "description": "要取回图片的消息 ID 列表",
                },
                "max_images": {"type": "integer", "minimum": 1, "maximum": 8},
            },
            "required": ["msg_ids"]
        })
    }

    async fn call(&self, args: Value, ctx: &ToolContext) -> Result<String, ToolError> {
        let Some(group_id) = ctx.group_id.as_deref().filter(|g| !g.trim().is_empty()) else {
            return Ok(json!({"error": "仅群聊可用", "images": []}).to_string());
        };
        let msg_ids: Vec<String> = args
            .get("msg_ids")
            .and_then(|v| v.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|v| v.as_str())
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_default();
        if msg_ids.is_empty() {
            return Ok(json!({"error": "缺少 msg_ids", "images": []}).to_string());
        }
        let max_images = args
            .get("max_images")
            .and_then(|v| v.as_u64())
            .map(|v| v as usize)
            .unwrap_or(DEFAULT_MAX_IMAGES)
            .clamp(1, 8);

        match self.backend.fetch(group_id, &msg_ids, max_images).await {
            Ok(result) => Ok(json!({
                "success": true,
                "count": result.count,
                "mapping": result.mapping,
                "images": result.images,
            })
            .to_string()),
            Err(err) => Ok(json!({"error": err.to_string(), "images": []}).to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::test_support::ctx;

    /// Only serves images for its own group; anything else is "not found".
    struct StrictBackend;

    #[async_trait]
    impl HistoryImageBackend for StrictBackend {
        async fn fetch(
            &self,
            group_id: &str,
            msg_ids: &[String],
            _max_images: usize,
        ) -> Result<HistoryImages, ToolError> {
            let mut images = Vec::new();
            let mut mapping = Vec::new();
            for id in msg_ids {
                let owned = group_id == "g1" && id == "m1";
                mapping.push(json!({"msg_id": id, "found": owned}));
                if owned {
                    images.push("data:image/png;base64,QUJD".to_string());
                }
            }
            Ok(HistoryImages {
                count: images.len(),
                mapping,
                images,
            })
        }
    }

    #[tokio::test]
    async fn owned_message_returns_images() {
        let tool = FetchHistoryImagesTool::new(Arc::new(StrictBackend));
        let out = tool
            .call(json!({"msg_ids": ["m1", "m_other"]}), &ctx())
            .await
            .unwrap();
        let parsed: Value = serde_json::from_str(&out).unwrap();
        assert_eq!(parsed["success"], true);
        assert_eq!(parsed["count"], 1);
        assert_eq!(parsed["mapping"][1]["found"], false);
    }

    #[tokio::test]
    async fn private_session_yields_error_payload() {
        let tool = FetchHistoryImagesTool::new(Arc::new(StrictBackend));
        let mut context = ctx();
        context.group_id = None;
        let out = tool.call(json!({"msg_ids": ["m1"]}), &context).await.unwrap();
        let parsed: Value = serde_json::from_str(&out).unwrap();
        assert!(parsed.get("error").is_some());
        assert_eq!(parsed["images"].as_array().unwrap().len(), 0);
    }
}
