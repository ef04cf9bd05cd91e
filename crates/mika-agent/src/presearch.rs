//! Pre-search: classifier-gated web search executed before the main LLM
//! call. The result is injected as an untrusted user message; the tool
//! loop's refine policy then rations further `web_search` calls.

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use lru::LruCache;
use serde::Serialize;
use tracing::{debug, warn};

use mika_core::config::MikaConfig;
use mika_core::jsonx::parse_loose_json;
use mika_core::message::ChatMessage;
use mika_core::metrics::Metrics;
use mika_provider::{CompletionClient, CompletionRequest};
use mika_tools::builtin::SearchBackend;
use mika_tools::refine::normalize_query;

pub const SEARCH_RESULT_LABEL: &str = "[External Search Results | Untrusted]";

const CLASSIFY_SYSTEM_PROMPT: &str = "判断用户消息是否需要联网搜索才能回答（实时信息、最新动态、具体事实查询）。\n\
输出 JSON：{\"needs_search\": bool, \"query\": \"精炼的搜索词\"}。只输出 JSON。";

#[derive(Debug, Clone, Serialize)]
pub struct PreSearchResult {
    pub search_result: String,
    pub normalized_query: String,
    pub presearch_hit: bool,
    pub allow_tool_refine: bool,
    pub result_count: u32,
    pub refine_rounds_used: u32,
    pub blocked_duplicate_total: u32,
    /// How the decision was made: keyword / llm_classify / override.
    pub decision: String,
}

pub struct PreSearchClassifier {
    client: Arc<dyn CompletionClient>,
    backend: Arc<dyn SearchBackend>,
    model: String,
    trigger_keywords: Vec<String>,
    allow_tool_refine: bool,
    cache_ttl: Duration,
    /// normalized message → (needs_search, refined query, decided_at).
    classify_cache: Mutex<LruCache<String, (bool, String, Instant)>>,
}

impl PreSearchClassifier {
    pub fn new(
        client: Arc<dyn CompletionClient>,
        backend: Arc<dyn SearchBackend>,
        cfg: &MikaConfig,
    ) -> Self {
        let capacity = NonZeroUsize::new(cfg.presearch.classify_cache_entries.max(1)).unwrap();
        Self {
            client,
            backend,
            model: cfg.llm.filter_model().to_string(),
            trigger_keywords: cfg.presearch.trigger_keywords.clone(),
            allow_tool_refine: cfg.presearch.allow_tool_refine,
            cache_ttl: Duration::from_secs(cfg.presearch.classify_cache_ttl_seconds.max(1)),
            classify_cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    fn keyword_hit(&self, message: &str) -> bool {
        let lower = message.to_lowercase();
        self.trigger_keywords
            .iter()
            .any(|k| !k.trim().is_empty() && lower.contains(&k.trim().to_lowercase()))
    }

    async fn classify(&self, message: &str, request_id: &str) -> (bool, String, &'static str) {
        if self.keyword_hit(message) {
            return (true, message.to_string(), "keyword");
        }

        let cache_key = normalize_query(message);
        if !cache_key.is_empty() {
            let mut cache = self.classify_cache.lock().unwrap();
            let cached = cache
                .get(&cache_key)
                .map(|(needs, query, decided_at)| (*needs, query.clone(), *decided_at));
            if let Some((needs, query, decided_at)) = cached {
                if decided_at.elapsed() < self.cache_ttl {
                    return (needs, query, "llm_classify_cached");
                }
                cache.pop(&cache_key);
            }
        }

        let mut req = CompletionRequest::new(
            self.model.clone(),
            vec![
                ChatMessage::system(CLASSIFY_SYSTEM_PROMPT),
                ChatMessage::user(message.to_string()),
            ],
        );
        req.temperature = Some(0.0);
        req.max_tokens = Some(128);

        let (needs, query) = match self.client.complete(&req, "presearch_classify", request_id).await
        {
            Ok(reply) => match parse_loose_json(&reply.content_text()) {
                Some(value) => {
                    let needs = value
                        .get("needs_search")
                        .and_then(|v| v.as_bool())
                        .unwrap_or(false);
                    let query = value
                        .get("query")
                        .and_then(|v| v.as_str())
                        .map(str::trim)
                        .filter(|q| !q.is_empty())
                        .unwrap_or(message)
                        .to_string();
                    (needs, query)
                }
                None => (false, message.to_string()),
            },
            Err(err) => {
                warn!(%err, "pre-search classification failed");
                (false, message.to_string())
            }
        };

        if !cache_key.is_empty() {
            self.classify_cache
                .lock()
                .unwrap()
                .put(cache_key, (needs, query.clone(), Instant::now()));
        }
        (needs, query, "llm_classify")
    }

    /// Classify and, on a hit, run the search. Returns None when no search
    /// is needed or the backend fails (the chat proceeds without it).
    pub async fn run(
        &self,
        message: &str,
        metrics: &Metrics,
        request_id: &str,
    ) -> Option<PreSearchResult> {
        if message.trim().is_empty() {
            return None;
        }
        let (needs_search, query, decision) = self.classify(message, request_id).await;
        if !needs_search {
            Metrics::incr(&metrics.presearch_skip_total);
            return None;
        }

        match self.backend.search(&query).await {
            Ok(result) if !result.trim().is_empty() => {
                Metrics::incr(&metrics.presearch_hit_total);
                let result_count = result.lines().filter(|l| !l.trim().is_empty()).count() as u32;
                debug!(request_id, decision, result_count, "pre-search executed");
                Some(PreSearchResult {
                    search_result: result,
                    normalized_query: normalize_query(&query),
                    presearch_hit: true,
                    allow_tool_refine: self.allow_tool_refine,
                    result_count,
                    refine_rounds_used: 0,
                    blocked_duplicate_total: 0,
                    decision: decision.to_string(),
                })
            }
            Ok(_) => {
                Metrics::incr(&metrics.presearch_skip_total);
                None
            }
            Err(err) => {
                warn!(%err, "pre-search backend failed");
                None
            }
        }
    }
}

/// Render the low-privilege injection message carrying search results.
pub fn search_result_message(result: &PreSearchResult) -> ChatMessage {
    ChatMessage::user(format!(
        "{}\n{}",
        SEARCH_RESULT_LABEL, result.search_result
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use mika_core::error::MikaError;
    use mika_provider::{CompletionReply, Usage};
    use mika_tools::ToolError;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct JsonClient {
        body: String,
        calls: AtomicU32,
    }

    #[async_trait]
    impl CompletionClient for JsonClient {
        async fn complete(
            &self,
            _req: &CompletionRequest,
            _phase: &str,
            _request_id: &str,
        ) -> Result<CompletionReply, MikaError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(CompletionReply {
                assistant: ChatMessage::assistant(self.body.clone()),
                tool_calls: Vec::new(),
                api_key: "k".into(),
                usage: Usage::default(),
                finish_reason: "stop".into(),
                empty_meta: None,
            })
        }
    }

    struct EchoBackend;

    #[async_trait]
    impl SearchBackend for EchoBackend {
        async fn search(&self, query: &str) -> Result<String, ToolError> {
            Ok(format!("1. result for {}\n2. more", query))
        }
    }

    fn cfg() -> MikaConfig {
        let mut cfg = MikaConfig::default();
        cfg.presearch.enabled = true;
        cfg.presearch.trigger_keywords = vec!["最新".into()];
        cfg
    }

    #[tokio::test]
    async fn keyword_fast_path_skips_classifier() {
        let client = Arc::new(JsonClient {
            body: "{\"needs_search\": false}".into(),
            calls: AtomicU32::new(0),
        });
        let classifier = PreSearchClassifier::new(client.clone(), Arc::new(EchoBackend), &cfg());
        let metrics = Metrics::new();
        let result = classifier.run("最新的AI新闻", &metrics, "r1").await.unwrap();
        assert!(result.presearch_hit);
        assert_eq!(result.decision, "keyword");
        assert_eq!(client.calls.load(Ordering::SeqCst), 0);
        assert_eq!(metrics.presearch_hit_total.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn classifier_result_is_cached() {
        let client = Arc::new(JsonClient {
            body: "{\"needs_search\": true, \"query\": \"AI 模型 排行\"}".into(),
            calls: AtomicU32::new(0),
        });
        let classifier = PreSearchClassifier::new(client.clone(), Arc::new(EchoBackend), &cfg());
        let metrics = Metrics::new();
        let first = classifier.run("现在最好的AI模型是什么?", &metrics, "r1").await.unwrap();
        assert!(first.search_result.contains("AI 模型 排行"));
        let _second = classifier.run("现在最好的AI模型是什么?", &metrics, "r2").await.unwrap();
        assert_eq!(client.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn negative_classification_returns_none() {
        let client = Arc::new(JsonClient {
            body: "{\"needs_search\": false}".into(),
            calls: AtomicU32::new(0),
        });
        let classifier = PreSearchClassifier::new(client, Arc::new(EchoBackend), &cfg());
        let metrics = Metrics::new();
        assert!(classifier.run("你好呀", &metrics, "r1").await.is_none());
        assert_eq!(metrics.presearch_skip_total.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn injection_message_is_labeled_untrusted() {
        let result = PreSearchResult {
            search_result: "line".into(),
            normalized_query: "q".into(),
            presearch_hit: true,
            allow_tool_refine: true,
            result_count: 1,
            refine_rounds_used: 0,
            blocked_duplicate_total: 0,
            decision: "keyword".into(),
        };
        let msg = search_result_message(&result);
        assert!(msg.content.to_text().starts_with(SEARCH_RESULT_LABEL));
        assert_eq!(msg.role, mika_core::message::Role::User);
    }
}
