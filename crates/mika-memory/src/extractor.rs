//! LLM-driven extraction of durable facts from dialogue snippets.

use std::sync::Arc;

use regex::Regex;
use std::sync::OnceLock;
use tracing::{debug, warn};

use mika_core::message::{ChatMessage, Role};
use mika_core::types::SessionKey;
use mika_provider::{CompletionClient, CompletionRequest};

use crate::stores::VectorMemoryStore;

const EXTRACT_SYSTEM_PROMPT: &str = "你是一个信息提取助手。从对话中提取值得长期记住的关键事实。\n\
只提取具体、可复用的信息（偏好、身份、经历、计划、关系）。\n\
不要提取临时信息（天气、当前时间、新闻）或流程信息。\n\
每条事实一行，格式：user_id: 事实内容\n\
如果 user_id 无法确定，使用 unknown。\n\
如果没有可提取内容，仅输出 NONE。";

fn fact_line_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(\S+?):\s*(.+)$").unwrap())
}

pub struct MemoryExtractor {
    client: Arc<dyn CompletionClient>,
    model: String,
    max_facts: usize,
}

impl MemoryExtractor {
    pub fn new(client: Arc<dyn CompletionClient>, model: impl Into<String>, max_facts: usize) -> Self {
        Self {
            client,
            model: model.into(),
            max_facts: max_facts.max(1),
        }
    }

    fn render_messages(messages: &[ChatMessage]) -> String {
        let mut lines: Vec<String> = Vec::new();
        for msg in messages {
            if !matches!(msg.role, Role::User | Role::Assistant) {
                continue;
            }
            let text = msg.content.to_text();
            if !text.trim().is_empty() {
                lines.push(format!("{}: {}", msg.role.as_str(), text.trim()));
            }
        }
        lines.join("\n")
    }

    /// `user_id: fact` per line, NONE sentinel, facts under 3 chars dropped.
    pub fn parse_facts(raw: &str, max_facts: usize) -> Vec<(String, String)> {
        let trimmed = raw.trim();
        if trimmed.is_empty() || trimmed.to_uppercase().contains("NONE") {
            return Vec::new();
        }
        let mut facts = Vec::new();
        for line in trimmed.lines() {
            let text = line.trim();
            if text.is_empty() {
                continue;
            }
            let Some(caps) = fact_line_re().captures(text) else {
                continue;
            };
            let user_id = caps.get(1).map(|m| m.as_str().trim()).unwrap_or("");
            let fact = caps.get(2).map(|m| m.as_str().trim()).unwrap_or("");
            if fact.chars().count() < 3 {
                continue;
            }
            facts.push((user_id.to_string(), fact.to_string()));
            if facts.len() >= max_facts.max(1) {
                break;
            }
        }
        facts
    }

    pub async fn extract(&self, messages: &[ChatMessage], request_id: &str) -> Vec<(String, String)> {
        let rendered = Self::render_messages(messages);
        if rendered.chars().count() < 8 {
            return Vec::new();
        }

        let mut req = CompletionRequest::new(
            self.model.clone(),
            vec![
                ChatMessage::system(EXTRACT_SYSTEM_PROMPT),
                ChatMessage::user(format!("请从以下对话中提取关键事实：\n{}", rendered)),
            ],
        );
        req.temperature = Some(0.1);
        req.max_tokens = Some(512);

        match self.client.complete(&req, "memory_extract", request_id).await {
            Ok(reply) => Self::parse_facts(&reply.content_text(), self.max_facts),
            Err(err) => {
                warn!(%err, "memory extraction failed");
                Vec::new()
            }
        }
    }

    /// Extract and persist; dedup is implicit in the vector store.
    pub async fn extract_and_store(
        &self,
        messages: &[ChatMessage],
        session_key: &SessionKey,
        store: &dyn VectorMemoryStore,
        request_id: &str,
    ) -> usize {
        let facts = self.extract(messages, request_id).await;
        let mut stored = 0usize;
        for (user_id, fact) in &facts {
            match store.add_fact(session_key, user_id, fact, "extract").await {
                Ok(()) => stored += 1,
                Err(err) => warn!(%err, "storing extracted fact failed"),
            }
        }
        if stored > 0 {
            debug!(session_key = %session_key, stored, "long-term memory facts stored");
        }
        stored
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn none_sentinel_yields_no_facts() {
        assert!(MemoryExtractor::parse_facts("NONE", 5).is_empty());
        assert!(MemoryExtractor::parse_facts("  none\n", 5).is_empty());
    }

    #[test]
    fn facts_parse_per_line_with_cap() {
        let raw = "42: 喜欢打羽毛球\nunknown: 下周要去东京旅行\nbad line without colon format…\n7: ok\n8: 养了一只叫小白的猫";
        let facts = MemoryExtractor::parse_facts(raw, 2);
        assert_eq!(facts.len(), 2);
        assert_eq!(facts[0], ("42".to_string(), "喜欢打羽毛球".to_string()));
        assert_eq!(facts[1].0, "unknown");
    }

    #[test]
    fn short_facts_are_dropped() {
        let facts = MemoryExtractor::parse_facts("42: ab\n43: long enough fact", 5);
        assert_eq!(facts.len(), 1);
        assert_eq!(facts[0].0, "43");
    }
}
