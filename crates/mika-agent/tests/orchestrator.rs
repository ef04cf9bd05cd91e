//! End-to-end pipeline tests against a scripted transport.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rusqlite::Connection;

use mika_agent::{
    ChatOrchestrator, ChatParams, NoopMatcher, OrchestratorDeps, PreSearchClassifier,
    ProactiveGate, SEARCH_RESULT_LABEL,
};
use mika_context::ContextStore;
use mika_core::config::MikaConfig;
use mika_core::envelope::{Author, EnvelopePart, EventEnvelope, OutboundAction};
use mika_core::error::MikaError;
use mika_core::message::{ChatMessage, Role, ToolCall, ToolCallFunction};
use mika_core::metrics::Metrics;
use mika_core::types::SessionKey;
use mika_hooks::{NoopHooks, TraceStore};
use mika_memory::stores::reference::{
    InMemoryKnowledgeStore, InMemoryProfileStore, InMemoryVectorStore,
};
use mika_provider::{CompletionClient, CompletionReply, CompletionRequest, Usage};
use mika_tasks::TaskSupervisor;
use mika_tools::builtin::SearchBackend;
use mika_tools::{Tool, ToolContext, ToolError, ToolExecutor, ToolRegistry, ToolSource};

fn text_reply(text: &str) -> CompletionReply {
    CompletionReply {
        assistant: ChatMessage::assistant(text),
        tool_calls: Vec::new(),
        api_key: "k".into(),
        usage: Usage::default(),
        finish_reason: "stop".into(),
        empty_meta: None,
    }
}

fn tool_call_reply(name: &str, args: &str) -> CompletionReply {
    let call = ToolCall {
        id: "c1".into(),
        r#type: "function".into(),
        function: ToolCallFunction {
            name: name.into(),
            arguments: args.into(),
        },
    };
    let mut assistant = ChatMessage::assistant("");
    assistant.tool_calls = Some(vec![call.clone()]);
    CompletionReply {
        assistant,
        tool_calls: vec![call],
        api_key: "k".into(),
        usage: Usage::default(),
        finish_reason: "tool_calls".into(),
        empty_meta: None,
    }
}

/// Scripted transport: hands out canned replies and records every request.
struct ScriptedClient {
    replies: Mutex<Vec<CompletionReply>>,
    requests: Mutex<Vec<CompletionRequest>>,
    calls: AtomicU32,
}

impl ScriptedClient {
    fn new(mut replies: Vec<CompletionReply>) -> Arc<Self> {
        replies.reverse();
        Arc::new(Self {
            replies: Mutex::new(replies),
            requests: Mutex::new(Vec::new()),
            calls: AtomicU32::new(0),
        })
    }
}

#[async_trait]
impl CompletionClient for ScriptedClient {
    async fn complete(
        &self,
        req: &CompletionRequest,
        _phase: &str,
        _request_id: &str,
    ) -> Result<CompletionReply, MikaError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(req.clone());
        Ok(self
            .replies
            .lock()
            .unwrap()
            .pop()
            .unwrap_or_else(|| text_reply("fallback")))
    }
}

struct EchoSearch;

#[async_trait]
impl SearchBackend for EchoSearch {
    async fn search(&self, query: &str) -> Result<String, ToolError> {
        Ok(format!("1. 搜索结果：{}", query))
    }
}

struct EchoTool;

#[async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &str {
        "web_search"
    }
    fn description(&self) -> &str {
        "search"
    }
    fn parameters(&self) -> serde_json::Value {
        serde_json::json!({"type": "object", "properties": {"query": {"type": "string"}}})
    }
    async fn call(&self, args: serde_json::Value, _ctx: &ToolContext) -> Result<String, ToolError> {
        Ok(format!(
            "R1 for {}",
            args.get("query").and_then(|v| v.as_str()).unwrap_or("")
        ))
    }
}

struct Harness {
    orchestrator: ChatOrchestrator,
    client: Arc<ScriptedClient>,
    context_store: Arc<ContextStore>,
    metrics: Arc<Metrics>,
}

fn harness(cfg: MikaConfig, client: Arc<ScriptedClient>) -> Harness {
    let context_store =
        Arc::new(ContextStore::new(Connection::open_in_memory().unwrap(), 200, 16).unwrap());
    let metrics = Arc::new(Metrics::new());
    let registry = Arc::new(ToolRegistry::new());
    registry
        .register(Arc::new(EchoTool), ToolSource::Builtin)
        .unwrap();
    let presearch = Arc::new(PreSearchClassifier::new(
        client.clone() as Arc<dyn CompletionClient>,
        Arc::new(EchoSearch),
        &cfg,
    ));
    let gate = Arc::new(ProactiveGate::new(
        cfg.proactive.clone(),
        Arc::new(NoopMatcher),
    ));
    let trace =
        Arc::new(TraceStore::new(Connection::open_in_memory().unwrap(), true, 7, 1000).unwrap());

    let deps = OrchestratorDeps {
        config: cfg,
        client: client.clone() as Arc<dyn CompletionClient>,
        context_store: context_store.clone(),
        registry,
        executor: Arc::new(ToolExecutor::new(true, 60, 64)),
        hooks: Arc::new(NoopHooks),
        trace,
        metrics: metrics.clone(),
        supervisor: Arc::new(TaskSupervisor::new()),
        memory_store: Arc::new(InMemoryVectorStore::new()),
        knowledge_store: Arc::new(InMemoryKnowledgeStore::new()),
        profile_store: Arc::new(InMemoryProfileStore::new()),
        retrieval: None,
        extractor: None,
        summarizer: None,
        dream: None,
        presearch: Some(presearch),
        captioner: None,
        gate,
        persona_template: String::new(),
    };
    Harness {
        orchestrator: ChatOrchestrator::new(deps),
        client,
        context_store,
        metrics,
    }
}

fn base_cfg() -> MikaConfig {
    let mut cfg = MikaConfig::default();
    cfg.llm.api_keys = vec!["test-key".into()];
    cfg.transport.empty_reply_retry_delay_seconds = 0.0;
    cfg.degrade.retry_delay_seconds = 0.0;
    cfg
}

fn group_params(message: &str) -> ChatParams {
    let mut params = ChatParams::new(message, "10001");
    params.user_nickname = "Alice".into();
    params.group_id = Some("777".into());
    params
}

#[tokio::test]
async fn keyword_presearch_injects_untrusted_results_without_tool_loop() {
    let mut cfg = base_cfg();
    cfg.presearch.enabled = true;
    cfg.presearch.trigger_keywords = vec!["最好".into()];
    let client = ScriptedClient::new(vec![text_reply("根据搜索结果，Gemini 目前评价很高。")]);
    let h = harness(cfg, client);

    let reply = h.orchestrator.chat(group_params("现在最好的AI模型是什么?")).await;

    // Search-exposure prefix sanitized away.
    assert_eq!(reply, "Gemini 目前评价很高。");
    assert_eq!(h.client.calls.load(Ordering::SeqCst), 1);

    // Exactly one user message carries the untrusted search block.
    let requests = h.client.requests.lock().unwrap();
    let injected: Vec<&ChatMessage> = requests[0]
        .messages
        .iter()
        .filter(|m| m.role == Role::User && m.content.to_text().contains(SEARCH_RESULT_LABEL))
        .collect();
    assert_eq!(injected.len(), 1);

    // Snapshot rows for user and assistant appear in order.
    let snapshot = h
        .context_store
        .get_snapshot(&SessionKey::for_group("777"))
        .unwrap();
    assert_eq!(snapshot.len(), 2);
    assert!(snapshot[0].content.to_text().starts_with("[Alice(10001)]:"));
    assert!(snapshot[1].content.to_text().starts_with("[Mika]:"));
}

#[tokio::test]
async fn tool_loop_runs_and_trace_is_persisted() {
    let mut cfg = base_cfg();
    cfg.tools.allowlist = vec!["web_search".into()];
    let client = ScriptedClient::new(vec![
        tool_call_reply("web_search", "{\"query\": \"rust\"}"),
        text_reply("查好了，是关于 rust 的。"),
    ]);
    let h = harness(cfg, client);

    let mut params = group_params("帮我搜一下 rust");
    params.enable_tools = true;
    let reply = h.orchestrator.chat(params).await;

    assert_eq!(reply, "查好了，是关于 rust 的。");
    // main call + one tool-loop continuation
    assert_eq!(h.client.calls.load(Ordering::SeqCst), 2);

    // Archive order: user, assistant(tool_calls), tool, assistant reply.
    let key = SessionKey::for_group("777");
    let rows = h.context_store.fetch_archive(&key, 0, 10).unwrap();
    assert_eq!(rows.len(), 4);
    assert_eq!(rows[0].role, Role::User);
    assert_eq!(rows[1].role, Role::Assistant);
    assert_eq!(rows[2].role, Role::Tool);
    assert!(rows[2].content.to_text().contains("R1 for rust"));
    assert_eq!(rows[3].role, Role::Assistant);
}

#[tokio::test]
async fn empty_replies_degrade_then_succeed() {
    let cfg = base_cfg();
    let client = ScriptedClient::new(vec![
        text_reply(""),
        text_reply(""),
        text_reply("第三次终于说话了"),
    ]);
    let h = harness(cfg, client);

    let reply = h.orchestrator.chat(group_params("在吗")).await;
    assert_eq!(reply, "第三次终于说话了");
    // L0, L1, L2 — one transport call per degrade level.
    assert_eq!(h.client.calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn exhausted_degradation_returns_empty_reply_template() {
    let cfg = base_cfg();
    let client = ScriptedClient::new(vec![text_reply(""), text_reply(""), text_reply("")]);
    let h = harness(cfg, client);

    let reply = h.orchestrator.chat(group_params("在吗")).await;
    assert!(reply.contains("Mika"));
    assert_eq!(h.client.calls.load(Ordering::SeqCst), 3);
    // Nothing persisted for a failed exchange.
    assert_eq!(
        h.context_store
            .archive_count(&SessionKey::for_group("777"))
            .unwrap(),
        0
    );
}

fn group_envelope(text: &str) -> EventEnvelope {
    EventEnvelope {
        schema_version: 1,
        session_id: "group:777".into(),
        platform: "onebot".into(),
        protocol: "v11".into(),
        message_id: "m1".into(),
        timestamp: 1_700_000_000.0,
        author: Author {
            id: "10001".into(),
            nickname: "Alice".into(),
            role: "member".into(),
        },
        content_parts: vec![EnvelopePart::Text { text: text.into() }],
        meta: Default::default(),
        raw: serde_json::Value::Null,
        bot_self_id: "bot-1".into(),
        group_id: "777".into(),
        is_tome: false,
    }
}

#[tokio::test]
async fn cold_group_rejects_proactive_without_llm_call() {
    let mut cfg = base_cfg();
    cfg.proactive.enabled = true;
    cfg.proactive.rate = 1.0;
    cfg.proactive.heat_threshold = 5;
    let client = ScriptedClient::new(vec![]);
    let h = harness(cfg, client);

    // heat after one message = 1 < threshold 5
    let action = h
        .orchestrator
        .handle_envelope(&group_envelope("随便聊聊今天的天气怎么样"))
        .await;

    assert_eq!(action, OutboundAction::Noop);
    assert_eq!(h.client.calls.load(Ordering::SeqCst), 0);
    assert_eq!(
        h.metrics.proactive_trigger_total.load(Ordering::Relaxed),
        0
    );
    // The observed line still landed in the shared transcript.
    assert_eq!(
        h.context_store
            .archive_count(&SessionKey::for_group("777"))
            .unwrap(),
        1
    );
}

#[tokio::test]
async fn addressed_group_message_produces_send_action() {
    let cfg = base_cfg();
    let client = ScriptedClient::new(vec![text_reply("叫我吗？")]);
    let h = harness(cfg, client);

    let mut envelope = group_envelope("Mika 在不在");
    envelope.is_tome = true;
    let action = h.orchestrator.handle_envelope(&envelope).await;

    match action {
        OutboundAction::SendMessage {
            text,
            reply_to_message_id,
            ..
        } => {
            assert_eq!(text, "叫我吗？");
            assert_eq!(reply_to_message_id.as_deref(), Some("m1"));
        }
        other => panic!("expected SendMessage, got {:?}", other),
    }
}
