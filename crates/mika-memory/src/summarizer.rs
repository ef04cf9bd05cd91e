//! Background topic summarization over the message archive.
//!
//! Keeps a per-session cursor; when enough new messages accumulate, one
//! LLM call partitions the batch into topics and a second pass summarizes
//! each candidate.

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, warn};

use mika_context::ContextStore;
use mika_core::jsonx::parse_loose_json;
use mika_core::message::ChatMessage;
use mika_core::types::SessionKey;
use mika_provider::{CompletionClient, CompletionRequest};

use crate::topic::{TopicStore, TopicUpsert};

const PARTITION_SYSTEM_PROMPT: &str = "你是群聊话题分析助手。把给定的消息批次划分为最多{max_topics}个话题。\n\
输出 JSON：{\"topics\": [{\"topic\": \"话题名\", \"message_indices\": [0,1,...]}]}\n\
跳过闲聊与无信息内容；没有可用话题时输出 {\"topics\": []}。";

const SUMMARIZE_SYSTEM_PROMPT: &str = "你是话题总结助手。针对给定话题的消息输出 JSON：\n\
{\"summary\": \"两三句概括\", \"key_points\": [\"要点\"], \"keywords\": [\"关键词\"]}";

pub struct TopicSummarizer {
    client: Arc<dyn CompletionClient>,
    store: Arc<TopicStore>,
    context: Arc<ContextStore>,
    model: String,
    batch_size: u32,
    max_topics: usize,
}

#[derive(Debug, Default, PartialEq)]
pub struct SummarizeStats {
    pub topics_upserted: usize,
    pub messages_processed: u64,
}

impl TopicSummarizer {
    pub fn new(
        client: Arc<dyn CompletionClient>,
        store: Arc<TopicStore>,
        context: Arc<ContextStore>,
        model: impl Into<String>,
        batch_size: u32,
        max_topics: usize,
    ) -> Self {
        Self {
            client,
            store,
            context,
            model: model.into(),
            batch_size: batch_size.max(1),
            max_topics: max_topics.clamp(1, 3),
        }
    }

    fn string_list(value: Option<&Value>) -> Vec<String> {
        value
            .and_then(|v| v.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|v| v.as_str())
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_default()
    }

    async fn call_json(&self, system: &str, user: String, request_id: &str) -> Option<Value> {
        let mut req = CompletionRequest::new(
            self.model.clone(),
            vec![ChatMessage::system(system), ChatMessage::user(user)],
        );
        req.temperature = Some(0.2);
        req.max_tokens = Some(768);
        match self.client.complete(&req, "topic_summary", request_id).await {
            Ok(reply) => parse_loose_json(&reply.content_text()),
            Err(err) => {
                warn!(%err, "topic summarizer LLM call failed");
                None
            }
        }
    }

    /// One summarization pass. No-op until `batch_size` new messages exist
    /// past the cursor; the cursor advances even when no topic survives so
    /// the same batch is never re-billed.
    pub async fn run_once(&self, session_key: &SessionKey, request_id: &str) -> SummarizeStats {
        let mut stats = SummarizeStats::default();

        let processed = match self.store.processed_count(session_key) {
            Ok(n) => n,
            Err(err) => {
                warn!(%err, "topic cursor read failed");
                return stats;
            }
        };
        let total = match self.context.archive_count(session_key) {
            Ok(n) => n,
            Err(err) => {
                warn!(%err, "archive count failed");
                return stats;
            }
        };
        if total.saturating_sub(processed) < self.batch_size as u64 {
            return stats;
        }

        let batch = match self
            .context
            .fetch_archive(session_key, processed, self.batch_size as u64)
        {
            Ok(rows) => rows,
            Err(err) => {
                warn!(%err, "archive fetch failed");
                return stats;
            }
        };
        if batch.is_empty() {
            return stats;
        }

        let rendered: Vec<String> = batch
            .iter()
            .enumerate()
            .map(|(i, row)| format!("[{}] {}: {}", i, row.role.as_str(), row.content.to_text()))
            .collect();

        let partition_prompt = PARTITION_SYSTEM_PROMPT.replace("{max_topics}", &self.max_topics.to_string());
        let partition = self
            .call_json(&partition_prompt, rendered.join("\n"), request_id)
            .await;

        let topics: Vec<(String, Vec<usize>)> = partition
            .as_ref()
            .and_then(|v| v.get("topics"))
            .and_then(|v| v.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|item| {
                        let topic = item.get("topic")?.as_str()?.trim().to_string();
                        if topic.is_empty() {
                            return None;
                        }
                        let indices: Vec<usize> = item
                            .get("message_indices")
                            .and_then(|v| v.as_array())
                            .map(|a| {
                                a.iter()
                                    .filter_map(|v| v.as_u64())
                                    .map(|v| v as usize)
                                    .filter(|i| *i < batch.len())
                                    .collect()
                            })
                            .unwrap_or_default();
                        Some((topic, indices))
                    })
                    .take(self.max_topics)
                    .collect()
            })
            .unwrap_or_default();

        for (topic, indices) in topics {
            if indices.is_empty() {
                continue;
            }
            let selected: Vec<&str> = indices
                .iter()
                .filter_map(|i| rendered.get(*i))
                .map(String::as_str)
                .collect();
            let Some(summary_json) = self
                .call_json(
                    SUMMARIZE_SYSTEM_PROMPT,
                    format!("话题：{}\n消息：\n{}", topic, selected.join("\n")),
                    request_id,
                )
                .await
            else {
                continue;
            };
            let summary = summary_json
                .get("summary")
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .trim()
                .to_string();
            if summary.is_empty() {
                continue;
            }

            let mut participants: Vec<String> = Vec::new();
            for index in &indices {
                if let Some(row) = batch.get(*index) {
                    let uid = row.user_id.trim();
                    if !uid.is_empty() && !participants.iter().any(|p| p == uid) {
                        participants.push(uid.to_string());
                    }
                }
            }
            let timestamps: Vec<f64> = indices
                .iter()
                .filter_map(|i| batch.get(*i))
                .map(|row| row.timestamp)
                .filter(|ts| *ts > 0.0)
                .collect();

            let timestamp_start = timestamps.iter().cloned().fold(f64::INFINITY, f64::min);
            let upsert = TopicUpsert {
                topic,
                summary,
                keywords: Self::string_list(summary_json.get("keywords")),
                key_points: Self::string_list(summary_json.get("key_points")),
                participants,
                timestamp_start: if timestamp_start.is_finite() { timestamp_start } else { 0.0 },
                timestamp_end: timestamps.iter().cloned().fold(0.0, f64::max),
                source_message_count: indices.len() as u32,
            };
            match self.store.upsert(session_key, &upsert) {
                Ok(()) => stats.topics_upserted += 1,
                Err(err) => warn!(%err, "topic upsert failed"),
            }
        }

        let new_cursor = processed + batch.len() as u64;
        if let Err(err) = self.store.set_processed_count(session_key, new_cursor) {
            warn!(%err, "topic cursor update failed");
        } else {
            stats.messages_processed = batch.len() as u64;
            debug!(
                session_key = %session_key,
                cursor = new_cursor,
                upserted = stats.topics_upserted,
                "topic summarization pass complete"
            );
        }
        stats
    }
}
