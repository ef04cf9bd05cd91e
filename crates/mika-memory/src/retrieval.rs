//! ReAct retrieval agent.
//!
//! Before replying, iterate decide → query → observe over a closed action
//! set (chat-history topics, user profile, long-term memory, knowledge
//! base) until the planner declares an answer or the budget runs out. The
//! agent never executes arbitrary tools.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tracing::{debug, warn};

use mika_core::jsonx::parse_loose_json;
use mika_core::message::ChatMessage;
use mika_core::types::SessionKey;
use mika_provider::{CompletionClient, CompletionRequest};

use crate::stores::{KnowledgeStore, UserProfileStore, VectorMemoryStore};
use crate::topic::TopicStore;

const PLANNER_SYSTEM_PROMPT: &str = "你是记忆检索规划器。请在 query_chat_history/query_user_profile/\
query_memory/query_knowledge/found_answer 中选择下一步动作，并输出 JSON：\
{\"action\": \"...\", \"args\": {...}, \"reason\": \"...\"}";

const FINAL_OBSERVATIONS: usize = 3;

#[derive(Debug, Clone, PartialEq)]
pub struct RetrievalDecision {
    pub action: String,
    pub args: Value,
    pub reason: String,
}

#[derive(Debug, Clone)]
struct Observation {
    action: String,
    observation: String,
}

pub struct RetrievalAgent {
    client: Arc<dyn CompletionClient>,
    topic_store: Arc<TopicStore>,
    memory_store: Arc<dyn VectorMemoryStore>,
    knowledge_store: Arc<dyn KnowledgeStore>,
    profile_store: Arc<dyn UserProfileStore>,
    model: String,
    max_iterations: u32,
    timeout: Duration,
    default_top_k: usize,
}

impl RetrievalAgent {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        client: Arc<dyn CompletionClient>,
        topic_store: Arc<TopicStore>,
        memory_store: Arc<dyn VectorMemoryStore>,
        knowledge_store: Arc<dyn KnowledgeStore>,
        profile_store: Arc<dyn UserProfileStore>,
        model: impl Into<String>,
        max_iterations: u32,
        timeout_seconds: u64,
        default_top_k: usize,
    ) -> Self {
        Self {
            client,
            topic_store,
            memory_store,
            knowledge_store,
            profile_store,
            model: model.into(),
            max_iterations: max_iterations.max(1),
            timeout: Duration::from_secs(timeout_seconds.max(1)),
            default_top_k: default_top_k.max(1),
        }
    }

    pub fn parse_decision(raw: &str) -> Option<RetrievalDecision> {
        let payload = parse_loose_json(raw)?;
        let action = payload
            .get("action")?
            .as_str()?
            .trim()
            .to_ascii_lowercase();
        if action.is_empty() {
            return None;
        }
        let args = payload
            .get("args")
            .filter(|v| v.is_object())
            .cloned()
            .unwrap_or_else(|| Value::Object(Default::default()));
        let reason = payload
            .get("reason")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .trim()
            .to_string();
        Some(RetrievalDecision { action, args, reason })
    }

    fn format_observations(observations: &[Observation]) -> String {
        if observations.is_empty() {
            return "(无)".to_string();
        }
        observations
            .iter()
            .enumerate()
            .map(|(i, obs)| format!("{}. [{}] {}", i + 1, obs.action, obs.observation))
            .collect::<Vec<_>>()
            .join("\n")
    }

    async fn decide(
        &self,
        question: &str,
        session_key: &SessionKey,
        user_id: &str,
        group_id: &str,
        observations: &[Observation],
        request_id: &str,
    ) -> Option<RetrievalDecision> {
        let user_prompt = format!(
            "[当前问题]\n{}\n\n[会话]\nsession_key={}\nuser_id={}\ngroup_id={}\n\n\
             [已观察结果]\n{}\n\n请给出下一步动作 JSON。",
            question,
            session_key,
            user_id,
            group_id,
            Self::format_observations(observations),
        );
        let mut req = CompletionRequest::new(
            self.model.clone(),
            vec![
                ChatMessage::system(PLANNER_SYSTEM_PROMPT),
                ChatMessage::user(user_prompt),
            ],
        );
        req.temperature = Some(0.0);
        req.max_tokens = Some(512);

        match self.client.complete(&req, "memory_retrieval", request_id).await {
            Ok(reply) => Self::parse_decision(&reply.content_text()),
            Err(err) => {
                warn!(%err, "retrieval planner call failed");
                None
            }
        }
    }

    fn arg_top_k(args: &Value, default: usize) -> usize {
        args.get("top_k")
            .and_then(|v| v.as_u64())
            .map(|v| v as usize)
            .filter(|v| *v > 0)
            .unwrap_or(default)
            .min(20)
    }

    async fn execute(
        &self,
        decision: &RetrievalDecision,
        question: &str,
        session_key: &SessionKey,
        user_id: &str,
    ) -> String {
        let top_k = Self::arg_top_k(&decision.args, self.default_top_k);
        match decision.action.as_str() {
            "query_chat_history" => match self.topic_store.list_topics(session_key, top_k) {
                Ok(topics) if !topics.is_empty() => topics
                    .iter()
                    .map(|t| format!("{}：{}", t.topic, t.summary))
                    .collect::<Vec<_>>()
                    .join("\n"),
                Ok(_) => "没有可用的话题总结。".to_string(),
                Err(err) => format!("话题查询失败: {}", err),
            },
            "query_user_profile" => {
                let target = decision
                    .args
                    .get("user_id")
                    .and_then(|v| v.as_str())
                    .unwrap_or(user_id);
                match self.profile_store.profile_summary(target).await {
                    Ok(Some(summary)) => summary,
                    Ok(None) => "没有该用户的画像记录。".to_string(),
                    Err(err) => format!("用户画像查询失败: {}", err),
                }
            }
            "query_memory" => {
                let query = decision
                    .args
                    .get("query")
                    .and_then(|v| v.as_str())
                    .unwrap_or(question);
                match self.memory_store.search(session_key, query, top_k).await {
                    Ok(hits) if !hits.is_empty() => hits
                        .iter()
                        .map(|h| format!("{} (score={:.2})", h.fact, h.score))
                        .collect::<Vec<_>>()
                        .join("\n"),
                    Ok(_) => "长期记忆中没有相关内容。".to_string(),
                    Err(err) => format!("长期记忆查询失败: {}", err),
                }
            }
            "query_knowledge" => {
                let query = decision
                    .args
                    .get("query")
                    .and_then(|v| v.as_str())
                    .unwrap_or(question);
                let corpus_id = decision
                    .args
                    .get("corpus_id")
                    .and_then(|v| v.as_str())
                    .unwrap_or("");
                match self.knowledge_store.search(query, top_k, corpus_id).await {
                    Ok(hits) if !hits.is_empty() => hits
                        .iter()
                        .map(|h| format!("{}: {} (score={:.2})", h.title, h.snippet, h.score))
                        .collect::<Vec<_>>()
                        .join("\n"),
                    Ok(_) => "知识库中没有相关内容。".to_string(),
                    Err(err) => format!("知识库查询失败: {}", err),
                }
            }
            other => format!("unsupported: {}", other),
        }
    }

    /// Run the ReAct loop. Returns the composed retrieval context, or None
    /// when nothing useful was observed.
    pub async fn retrieve(
        &self,
        question: &str,
        session_key: &SessionKey,
        user_id: &str,
        group_id: &str,
        request_id: &str,
    ) -> Option<String> {
        let deadline = Instant::now() + self.timeout;
        let mut observations: Vec<Observation> = Vec::new();

        for iteration in 0..self.max_iterations {
            if Instant::now() >= deadline {
                debug!(iteration, "retrieval deadline reached, stopping early");
                break;
            }
            let Some(decision) = self
                .decide(question, session_key, user_id, group_id, &observations, request_id)
                .await
            else {
                break;
            };
            debug!(
                iteration,
                action = %decision.action,
                reason = %decision.reason,
                "retrieval decision"
            );

            if decision.action == "found_answer" {
                let answer = decision
                    .args
                    .get("answer")
                    .and_then(|v| v.as_str())
                    .unwrap_or("")
                    .trim()
                    .to_string();
                if !answer.is_empty() {
                    return Some(answer);
                }
                break;
            }

            let observation = self.execute(&decision, question, session_key, user_id).await;
            observations.push(Observation {
                action: decision.action,
                observation,
            });
        }

        if observations.is_empty() {
            return None;
        }
        let start = observations.len().saturating_sub(FINAL_OBSERVATIONS);
        Some(Self::format_observations(&observations[start..]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stores::reference::{
        InMemoryKnowledgeStore, InMemoryProfileStore, InMemoryVectorStore,
    };
    use async_trait::async_trait;
    use mika_core::error::MikaError;
    use mika_provider::{CompletionReply, Usage};
    use rusqlite::Connection;
    use std::sync::Mutex;

    /// Scripted planner: returns canned decision JSON per call.
    struct ScriptedClient {
        replies: Mutex<Vec<String>>,
    }

    impl ScriptedClient {
        fn new(replies: Vec<&str>) -> Self {
            Self {
                replies: Mutex::new(replies.into_iter().rev().map(String::from).collect()),
            }
        }
    }

    #[async_trait]
    impl CompletionClient for ScriptedClient {
        async fn complete(
            &self,
            _req: &CompletionRequest,
            _phase: &str,
            _request_id: &str,
        ) -> Result<CompletionReply, MikaError> {
            let content = self.replies.lock().unwrap().pop().unwrap_or_default();
            Ok(CompletionReply {
                assistant: ChatMessage::assistant(content),
                tool_calls: Vec::new(),
                api_key: "k".into(),
                usage: Usage::default(),
                finish_reason: "stop".into(),
                empty_meta: None,
            })
        }
    }

    fn agent(client: ScriptedClient, memory: Arc<InMemoryVectorStore>) -> RetrievalAgent {
        RetrievalAgent::new(
            Arc::new(client),
            Arc::new(TopicStore::new(Connection::open_in_memory().unwrap()).unwrap()),
            memory,
            Arc::new(InMemoryKnowledgeStore::new()),
            Arc::new(InMemoryProfileStore::new()),
            "fast-model",
            4,
            20,
            5,
        )
    }

    #[test]
    fn decision_parses_from_fenced_json() {
        let decision = RetrievalAgent::parse_decision(
            "```json\n{\"action\": \"Query_Memory\", \"args\": {\"query\": \"猫\"}, \"reason\": \"r\"}\n```",
        )
        .unwrap();
        assert_eq!(decision.action, "query_memory");
        assert_eq!(decision.args["query"], "猫");
    }

    #[tokio::test]
    async fn found_answer_short_circuits() {
        let client = ScriptedClient::new(vec![
            r#"{"action": "found_answer", "args": {"answer": "用户养了一只猫"}, "reason": "known"}"#,
        ]);
        let agent = agent(client, Arc::new(InMemoryVectorStore::new()));
        let out = agent
            .retrieve("用户养了什么宠物", &SessionKey::for_group("g"), "42", "g", "r1")
            .await;
        assert_eq!(out.as_deref(), Some("用户养了一只猫"));
    }

    #[tokio::test]
    async fn observations_feed_final_context() {
        let memory = Arc::new(InMemoryVectorStore::new());
        let key = SessionKey::for_group("g");
        memory
            .add_fact(&key, "42", "keeps a cat named xiaobai", "extract")
            .await
            .unwrap();

        let client = ScriptedClient::new(vec![
            r#"{"action": "query_memory", "args": {"query": "cat named"}, "reason": "look"}"#,
            "not json at all — loop ends here",
        ]);
        let agent = agent(client, memory);
        let out = agent
            .retrieve("what pet", &key, "42", "g", "r1")
            .await
            .unwrap();
        assert!(out.contains("query_memory"));
        assert!(out.contains("xiaobai"));
    }

    #[tokio::test]
    async fn unsupported_action_is_reported_not_executed() {
        let client = ScriptedClient::new(vec![
            r#"{"action": "run_shell", "args": {}, "reason": "nope"}"#,
            "done",
        ]);
        let agent = agent(client, Arc::new(InMemoryVectorStore::new()));
        let out = agent
            .retrieve("q", &SessionKey::for_group("g"), "42", "g", "r1")
            .await
            .unwrap();
        assert!(out.contains("unsupported: run_shell"));
    }
}
