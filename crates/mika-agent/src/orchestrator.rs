//! Top-level chat pipeline.
//!
//! plan → pre-search → retrieval → message build → transport → tool loop →
//! sanitize → persist, with a server-error retry budget and the empty-reply
//! degradation ladder wrapped around the attempt.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde_json::json;
use tracing::{debug, info, warn};

use mika_context::{
    build_participants_line, build_transcript_block, build_transcript_lines, enforce_budgets,
    resolve_soft_tokens, ContextManager, ContextMode, ContextStore,
};
use mika_core::config::MikaConfig;
use mika_core::envelope::{EventEnvelope, OutboundAction};
use mika_core::error::{ErrorTemplates, MikaError};
use mika_core::guard::{GuardAction, GuardSource, InjectionGuard};
use mika_core::media::placeholder_for_url;
use mika_core::message::{ChatMessage, ContentPart, ImageUrl, MessageContent};
use mika_core::metrics::Metrics;
use mika_core::types::{RequestId, SessionKey};
use mika_hooks::{emit, AgentHooks, HookEvent, TraceStore};
use mika_memory::{
    DreamAgent, KnowledgeStore, MemoryExtractor, RetrievalAgent, TopicSummarizer, UserProfileStore,
    VectorMemoryStore,
};
use mika_provider::{
    get_provider_capabilities, CompletionClient, CompletionRequest, ProviderCapabilities,
    ProviderKind, ToolSpec,
};
use mika_tasks::TaskSupervisor;
use mika_tools::{
    build_tool_specs, SchemaFallback, SchemaMode, SearchState, ToolContext, ToolExecutor, ToolLoop,
    ToolLoopConfig, ToolRegistry,
};

use crate::captions::{build_caption_injection, CaptionProvider};
use crate::degrade::{mask_messages, tail_for_level};
use crate::llm_planner::build_request_plan;
use crate::planner::{MediaNeed, PlanInput, RequestPlan};
use crate::presearch::{search_result_message, PreSearchClassifier, PreSearchResult};
use crate::proactive::{extract_nickname, judge_proactive_intent, proactive_instruction, ProactiveGate};
use crate::prompt::PromptContext;
use crate::sanitize::sanitize_reply;

const DEFAULT_PERSONA_TEMPLATE: &str = "你是{bot_name}，一个活跃在聊天群里的伙伴。\
用自然的口语回复，不要使用 Markdown。当前时间：{now}。\n{user_profile}";

/// Callback receiving streamed text deltas.
pub type StreamHandler = Arc<dyn Fn(&str) + Send + Sync>;

/// One chat request's inputs.
#[derive(Clone)]
pub struct ChatParams {
    pub message: String,
    pub user_id: String,
    pub user_nickname: String,
    pub group_id: Option<String>,
    pub image_urls: Vec<String>,
    pub enable_tools: bool,
    pub retry_count: u32,
    pub message_id: Option<String>,
    pub system_injection: Option<String>,
    pub context_level: u8,
    pub history_override: Option<Vec<ChatMessage>>,
    pub search_result_override: Option<PreSearchResult>,
    pub is_proactive: bool,
    /// When set, text deltas are streamed through this callback
    /// (OpenAI-compatible transport only; others deliver the text once).
    pub stream_handler: Option<StreamHandler>,
}

impl ChatParams {
    pub fn new(message: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            user_id: user_id.into(),
            user_nickname: String::new(),
            group_id: None,
            image_urls: Vec::new(),
            enable_tools: false,
            retry_count: 1,
            message_id: None,
            system_injection: None,
            context_level: 0,
            history_override: None,
            search_result_override: None,
            is_proactive: false,
            stream_handler: None,
        }
    }
}

/// Everything the orchestrator composes. All stores and agents are
/// injected; the orchestrator owns no global state.
pub struct OrchestratorDeps {
    pub config: MikaConfig,
    pub client: Arc<dyn CompletionClient>,
    pub context_store: Arc<ContextStore>,
    pub registry: Arc<ToolRegistry>,
    pub executor: Arc<ToolExecutor>,
    pub hooks: Arc<dyn AgentHooks>,
    pub trace: Arc<TraceStore>,
    pub metrics: Arc<Metrics>,
    pub supervisor: Arc<TaskSupervisor>,
    pub memory_store: Arc<dyn VectorMemoryStore>,
    pub knowledge_store: Arc<dyn KnowledgeStore>,
    pub profile_store: Arc<dyn UserProfileStore>,
    pub retrieval: Option<Arc<RetrievalAgent>>,
    pub extractor: Option<Arc<MemoryExtractor>>,
    pub summarizer: Option<Arc<TopicSummarizer>>,
    pub dream: Option<Arc<DreamAgent>>,
    pub presearch: Option<Arc<PreSearchClassifier>>,
    pub captioner: Option<Arc<dyn CaptionProvider>>,
    pub gate: Arc<ProactiveGate>,
    /// Persona prompt template; empty uses the built-in default.
    pub persona_template: String,
}

struct AttemptOutcome {
    reply: String,
    tool_trace: Vec<ChatMessage>,
}

pub struct ChatOrchestrator {
    deps: OrchestratorDeps,
    guard: InjectionGuard,
    templates: ErrorTemplates,
    manager: ContextManager,
    capabilities: ProviderCapabilities,
    schema_fallback: SchemaFallback,
    /// Messages persisted per session since the last extraction run.
    mem_counters: DashMap<String, u32>,
}

impl ChatOrchestrator {
    pub fn new(deps: OrchestratorDeps) -> Self {
        let cfg = &deps.config;
        let guard = InjectionGuard::new(
            cfg.guard.enabled,
            GuardAction::parse(&cfg.guard.action),
            &cfg.guard.patterns,
        );
        let templates = ErrorTemplates::new(cfg.bot.name.clone(), &cfg.errors.templates);
        let soft_tokens = resolve_soft_tokens(cfg.context.max_tokens_soft, &cfg.llm.model);
        let manager = ContextManager::new(
            ContextMode::parse(&cfg.context.mode),
            cfg.context.max_turns,
            soft_tokens,
            cfg.context.hard_max_messages,
        );
        let capabilities = get_provider_capabilities(
            ProviderKind::detect(&cfg.llm.provider),
            &cfg.llm.base_url,
            &cfg.llm.model,
            cfg.llm.supports_images,
        );
        Self {
            deps,
            guard,
            templates,
            manager,
            capabilities,
            schema_fallback: SchemaFallback::new(),
            mem_counters: DashMap::new(),
        }
    }

    pub fn config(&self) -> &MikaConfig {
        &self.deps.config
    }

    pub fn capabilities(&self) -> ProviderCapabilities {
        self.capabilities
    }

    /// Main contract: one inbound message to one reply string. Errors are
    /// rendered from the user-facing template set.
    pub async fn chat(&self, params: ChatParams) -> String {
        match self.chat_result(params).await {
            Ok(reply) => reply,
            Err(err) => {
                warn!(code = err.code(), %err, "chat failed");
                self.templates.render_for(&err)
            }
        }
    }

    pub async fn chat_result(&self, mut params: ChatParams) -> Result<String, MikaError> {
        let request_id = RequestId::new();
        let started = Instant::now();
        Metrics::incr(&self.deps.metrics.requests_total);
        let session_key = SessionKey::resolve(&params.user_id, params.group_id.as_deref());
        let cfg = &self.deps.config;
        info!(
            request_id = %request_id,
            session_key = %session_key,
            proactive = params.is_proactive,
            "chat request started"
        );

        // Pre-search runs once; degraded retries reuse the result.
        let presearch = match params.search_result_override.take() {
            Some(result) => Some(result),
            None => match (&self.deps.presearch, cfg.presearch.enabled) {
                (Some(classifier), true) => {
                    classifier
                        .run(&params.message, &self.deps.metrics, request_id.as_str())
                        .await
                }
                _ => None,
            },
        };

        let plan_input = PlanInput {
            message: params.message.clone(),
            enable_tools: params.enable_tools,
            is_proactive: params.is_proactive,
            image_urls_count: params.image_urls.len(),
            system_injection: params.system_injection.clone(),
        };
        let plan = build_request_plan(&self.deps.client, cfg, &plan_input, request_id.as_str()).await;
        self.deps.trace.set_plan(
            request_id.as_str(),
            session_key.as_str(),
            &params.user_id,
            params.group_id.as_deref().unwrap_or(""),
            &serde_json::to_value(&plan)?,
        );

        let injections = self
            .build_injections(&params, &plan, &session_key, request_id.as_str())
            .await;

        let max_level = if cfg.degrade.enabled {
            cfg.degrade.max_level
        } else {
            params.context_level
        };
        let mut level = params.context_level;
        let mut retries_left = params.retry_count;
        let mut server_attempt = 0u32;

        loop {
            let attempt = self
                .chat_attempt(&params, &plan, presearch.as_ref(), &injections, &session_key, &request_id, level)
                .await;

            match attempt {
                Ok(outcome) if !outcome.reply.is_empty() => {
                    self.persist_exchange(&params, &session_key, &outcome).await;
                    self.spawn_background_tasks(&session_key, &request_id);
                    info!(
                        request_id = %request_id,
                        latency_ms = started.elapsed().as_millis() as u64,
                        degrade_level = level,
                        "chat request complete"
                    );
                    return Ok(outcome.reply);
                }
                Ok(_) => {
                    // Empty after sanitization: walk down the degradation
                    // ladder, strictly increasing the level.
                    if level >= max_level {
                        warn!(request_id = %request_id, level, "empty reply after final degrade level");
                        return Err(MikaError::EmptyReply);
                    }
                    level += 1;
                    info!(request_id = %request_id, level, "empty reply, degrading context");
                    let delay = cfg.degrade.retry_delay_seconds.max(0.0);
                    if delay > 0.0 {
                        tokio::time::sleep(Duration::from_secs_f64(delay)).await;
                    }
                }
                Err(err) if err.is_retryable() && retries_left > 0 => {
                    retries_left -= 1;
                    server_attempt += 1;
                    let backoff = Duration::from_secs_f64(2f64.powi(server_attempt as i32 - 1));
                    warn!(
                        request_id = %request_id,
                        retries_left,
                        backoff_secs = backoff.as_secs_f64(),
                        "server error, backing off"
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Resolve retrieval/knowledge/memory injections for this request.
    async fn build_injections(
        &self,
        params: &ChatParams,
        plan: &RequestPlan,
        session_key: &SessionKey,
        request_id: &str,
    ) -> Vec<String> {
        let cfg = &self.deps.config;
        let mut injections: Vec<String> = Vec::new();
        if let Some(block) = params.system_injection.as_deref() {
            if !block.trim().is_empty() {
                injections.push(block.to_string());
            }
        }

        // Retrieval replaces the direct LTM/knowledge injections; captions
        // below are an independent stage and apply in every mode.
        if plan.use_memory_retrieval {
            if let Some(retrieval) = &self.deps.retrieval {
                if let Some(context) = retrieval
                    .retrieve(
                        &params.message,
                        session_key,
                        &params.user_id,
                        params.group_id.as_deref().unwrap_or(""),
                        request_id,
                    )
                    .await
                {
                    injections.push(format!("[Memory Retrieval]\n{}", context));
                }
            }
        } else {
            if plan.use_ltm_memory {
                match self
                    .deps
                    .memory_store
                    .search(session_key, &params.message, cfg.memory.top_k)
                    .await
                {
                    Ok(hits) if !hits.is_empty() => {
                        let lines: Vec<String> =
                            hits.iter().map(|h| format!("- {}", h.fact)).collect();
                        injections.push(format!("[长期记忆]\n{}", lines.join("\n")));
                    }
                    Ok(_) => {}
                    Err(err) => warn!(%err, "long-term memory lookup failed"),
                }
            }

            if plan.use_knowledge_auto_inject {
                match self
                    .deps
                    .knowledge_store
                    .search(&params.message, cfg.knowledge.top_k, &cfg.knowledge.corpus_id)
                    .await
                {
                    Ok(hits) if !hits.is_empty() => {
                        let lines: Vec<String> = hits
                            .iter()
                            .map(|h| format!("- {}: {}", h.title, h.snippet))
                            .collect();
                        injections.push(format!("[知识库]\n{}", lines.join("\n")));
                    }
                    Ok(_) => {}
                    Err(err) => warn!(%err, "knowledge lookup failed"),
                }
            }
        }

        // Caption when the plan asks for it, or when the request carries
        // images the model cannot see directly.
        let wants_caption = plan.need_media == MediaNeed::Caption
            || (plan.need_media == MediaNeed::Images && !self.capabilities.supports_images);
        if wants_caption && cfg.media.caption_enabled && !params.image_urls.is_empty() {
            if let Some(captioner) = &self.deps.captioner {
                if let Some(block) = build_caption_injection(
                    captioner.as_ref(),
                    &params.image_urls,
                    cfg.media.history_image_two_stage_max,
                )
                .await
                {
                    injections.push(block);
                }
            }
        }

        injections
    }

    /// Format the current user line the way it is archived and rendered in
    /// transcripts: `[nick(uid)]: text` for groups, raw text for private.
    fn format_user_line(&self, params: &ChatParams, guarded_text: &str) -> String {
        if params.group_id.is_some() {
            let nick = if params.user_nickname.trim().is_empty() {
                "User"
            } else {
                params.user_nickname.trim()
            };
            format!("[{}({})]: {}", nick, params.user_id, guarded_text)
        } else {
            guarded_text.to_string()
        }
    }

    fn current_user_message(&self, params: &ChatParams, plan: &RequestPlan, guarded_text: &str) -> ChatMessage {
        let line = self.format_user_line(params, guarded_text);
        let want_images = plan.need_media == MediaNeed::Images
            && self.capabilities.supports_images
            && !params.image_urls.is_empty();

        let mut msg = if want_images {
            let mut parts = vec![ContentPart::Text { text: line }];
            for url in params.image_urls.iter().take(self.deps.config.media.max_images) {
                parts.push(ContentPart::ImageUrl {
                    image_url: ImageUrl { url: url.clone() },
                    media_semantic: Some(mika_core::media::build_media_semantic(
                        "image", "", url, "", "chat",
                    )),
                });
            }
            ChatMessage {
                content: MessageContent::Parts(parts),
                ..ChatMessage::user("")
            }
        } else if !params.image_urls.is_empty() {
            // No image capability: keep stable placeholders in the text.
            let placeholders: Vec<String> = params
                .image_urls
                .iter()
                .take(self.deps.config.media.max_images)
                .map(|url| placeholder_for_url(url))
                .collect();
            ChatMessage::user(format!("{} {}", line, placeholders.join(" ")))
        } else {
            ChatMessage::user(line)
        };

        msg.user_id = Some(params.user_id.clone());
        msg.message_id = params.message_id.clone();
        msg.timestamp = Some(chrono::Utc::now().timestamp_millis() as f64 / 1000.0);
        msg
    }

    async fn chat_attempt(
        &self,
        params: &ChatParams,
        plan: &RequestPlan,
        presearch: Option<&PreSearchResult>,
        injections: &[String],
        session_key: &SessionKey,
        request_id: &RequestId,
        level: u8,
    ) -> Result<AttemptOutcome, MikaError> {
        let cfg = &self.deps.config;

        let mut prompt_ctx = PromptContext::new(
            &cfg.bot.name,
            &cfg.bot.master_id,
            session_key.clone(),
            &params.user_id,
            &params.user_nickname,
            params.group_id.clone(),
        );
        if let Ok(Some(summary)) = self.deps.profile_store.profile_summary(&params.user_id).await {
            prompt_ctx.user_profile_summary = Some(summary);
        }
        for block in injections {
            prompt_ctx.push_injection(block.clone());
        }

        // History working set.
        let history = match &params.history_override {
            Some(messages) => messages.clone(),
            None => self
                .deps
                .context_store
                .get_snapshot(session_key)
                .map_err(|e| MikaError::Database(e.to_string()))?,
        };
        let mut history = self.manager.process(history);
        history = tail_for_level(history, level, &cfg.degrade);
        // Masking starts at L1: degraded retries over persistent history
        // are safety-masked, and this store is always SQLite-backed.
        if level >= 1 {
            mask_messages(&mut history, &cfg.degrade.sensitive_terms);
        }

        let persona = if self.deps.persona_template.trim().is_empty() {
            DEFAULT_PERSONA_TEMPLATE
        } else {
            &self.deps.persona_template
        };
        let mut messages: Vec<ChatMessage> =
            vec![ChatMessage::system(prompt_ctx.build_system_prompt(persona))];

        if session_key.is_group() {
            // Group history goes in as one compact transcript block.
            let lines = build_transcript_lines(
                &history,
                &cfg.bot.name,
                cfg.context.transcript_max_lines,
                cfg.context.transcript_line_max_chars,
            );
            let participants = build_participants_line(&lines, &cfg.bot.name, 8, 60);
            let block = build_transcript_block(&lines);
            let text = if participants.is_empty() {
                block.text
            } else {
                format!("{}\n{}", participants, block.text)
            };
            messages.push(ChatMessage::system(text));
        } else {
            messages.extend(history);
        }

        if let Some(result) = presearch {
            let guarded = self
                .guard
                .apply(&result.search_result, GuardSource::SearchResult);
            let mut guarded_result = result.clone();
            guarded_result.search_result = guarded.text;
            messages.push(search_result_message(&guarded_result));
        }

        let guarded_message = self.guard.apply(&params.message, GuardSource::UserMessage);
        messages.push(self.current_user_message(params, plan, &guarded_message.text));

        // Budget enforcement over the assembled set.
        let soft_tokens = resolve_soft_tokens(cfg.context.max_tokens_soft, &cfg.llm.model);
        let budget = enforce_budgets(&mut messages, soft_tokens, cfg.context.request_body_max_bytes);
        debug!(
            request_id = %request_id,
            tokens = budget.tokens,
            bytes = budget.bytes,
            shrunk = budget.applied_ratio.is_some(),
            "request budget resolved"
        );

        let tools_active =
            plan.tool_policy.enabled && params.enable_tools && self.capabilities.supports_tools;
        let tool_specs: Vec<ToolSpec> = if tools_active {
            let allowlist = self
                .deps
                .registry
                .effective_allowlist(&cfg.tools.allowlist, cfg.tools.allow_dynamic_registered);
            build_tool_specs(
                &self.deps.registry,
                &allowlist,
                SchemaMode::parse(&cfg.tools.schema_mode),
                cfg.tools.schema_auto_threshold,
                self.schema_fallback.is_active(session_key.as_str()),
            )
        } else {
            Vec::new()
        };

        let mut request = CompletionRequest::new(cfg.llm.model.clone(), messages);
        request.temperature = Some(cfg.llm.temperature);
        request.max_tokens = Some(cfg.llm.max_tokens);
        request.tools = tool_specs;

        emit(
            self.deps.hooks.as_ref(),
            HookEvent::BeforeLlm,
            &json!({
                "request_id": request_id.as_str(),
                "session_key": session_key.as_str(),
                "user_id": params.user_id,
                "group_id": params.group_id.clone().unwrap_or_default(),
                "model": cfg.llm.model,
                "estimated_tokens": budget.tokens,
                "estimated_bytes": budget.bytes,
                "context_level": level,
                "tools_exposed": request.tools.len(),
            }),
        )
        .await;

        let llm_started = Instant::now();
        let reply = match &params.stream_handler {
            Some(handler) => {
                self.deps
                    .client
                    .complete_stream(&request, "main", request_id.as_str(), handler.as_ref())
                    .await
            }
            None => {
                self.deps
                    .client
                    .complete(&request, "main", request_id.as_str())
                    .await
            }
        };

        let after_payload = |ok: bool, error: Option<String>| {
            json!({
                "request_id": request_id.as_str(),
                "session_key": session_key.as_str(),
                "user_id": params.user_id,
                "group_id": params.group_id.clone().unwrap_or_default(),
                "model": cfg.llm.model,
                "latency_ms": llm_started.elapsed().as_millis() as u64,
                "success": ok,
                "error": error,
            })
        };

        let reply = match reply {
            Ok(reply) => reply,
            Err(err) => {
                emit(
                    self.deps.hooks.as_ref(),
                    HookEvent::AfterLlm,
                    &after_payload(false, Some(err.code().to_string())),
                )
                .await;
                return Err(err);
            }
        };

        let mut tool_trace: Vec<ChatMessage> = Vec::new();
        let raw_reply = if !reply.tool_calls.is_empty() && tools_active {
            let loop_cfg = ToolLoopConfig {
                max_rounds: cfg.tools.max_rounds,
                timeout_seconds: cfg.tools.timeout_seconds,
                force_final_on_max_rounds: cfg.tools.force_final_on_max_rounds,
                react_reflection: cfg.tools.react_reflection,
                result_max_chars: cfg.tools.result_max_chars,
                allowlist: cfg.tools.allowlist.clone(),
                allow_dynamic_registered: cfg.tools.allow_dynamic_registered,
                search_refine_enabled: cfg.presearch.allow_tool_refine,
                search_refine_max_rounds: cfg.presearch.max_refine_rounds,
                duplicate_similarity: cfg.presearch.duplicate_similarity,
            };
            let tool_ctx = ToolContext {
                session_key: session_key.clone(),
                request_id: request_id.as_str().to_string(),
                user_id: params.user_id.clone(),
                group_id: params.group_id.clone(),
            };
            let mut search_state = presearch.map(|p| {
                SearchState::from_presearch(p.presearch_hit, p.allow_tool_refine, &p.normalized_query)
            });
            let tool_loop = ToolLoop {
                client: self.deps.client.as_ref(),
                registry: &self.deps.registry,
                executor: &self.deps.executor,
                hooks: self.deps.hooks.as_ref(),
                metrics: &self.deps.metrics,
            };
            let outcome = tool_loop
                .run(&request, reply, &tool_ctx, search_state.as_mut(), &loop_cfg)
                .await?;
            if outcome.schema_mismatch_suspected {
                self.schema_fallback.activate(
                    session_key.as_str(),
                    Duration::from_secs(cfg.tools.schema_fallback_ttl_seconds),
                );
            }
            tool_trace = outcome.trace_messages;
            outcome.reply
        } else {
            reply.content_text()
        };

        emit(
            self.deps.hooks.as_ref(),
            HookEvent::AfterLlm,
            &after_payload(true, None),
        )
        .await;

        let cleaned = sanitize_reply(&raw_reply, &cfg.errors.proxy_fallback_sentinels);
        Ok(AttemptOutcome {
            reply: cleaned,
            tool_trace,
        })
    }

    /// Persist user input, tool trace, and the assistant reply as one unit.
    async fn persist_exchange(
        &self,
        params: &ChatParams,
        session_key: &SessionKey,
        outcome: &AttemptOutcome,
    ) {
        let cfg = &self.deps.config;
        let mut batch: Vec<ChatMessage> = Vec::new();

        let mut user_msg = ChatMessage::user(self.format_user_line(params, &params.message));
        user_msg.user_id = Some(params.user_id.clone());
        user_msg.message_id = params.message_id.clone();
        batch.push(user_msg);

        batch.extend(outcome.tool_trace.iter().cloned());

        let reply_text = if session_key.is_group() {
            format!("[{}]: {}", cfg.bot.name, outcome.reply)
        } else {
            outcome.reply.clone()
        };
        batch.push(ChatMessage::assistant(reply_text));

        if let Err(err) = self.deps.context_store.append_messages(session_key, &batch) {
            warn!(%err, "context persistence failed");
        }
    }

    /// Supervised background work: memory extraction (rate limited by a
    /// message counter), topic summarization, and a dream tick.
    fn spawn_background_tasks(&self, session_key: &SessionKey, request_id: &RequestId) {
        let cfg = &self.deps.config;

        if cfg.memory.enabled {
            if let Some(extractor) = &self.deps.extractor {
                let interval = cfg.memory.extract_interval_messages.max(1);
                let due = {
                    let mut counter = self
                        .mem_counters
                        .entry(session_key.as_str().to_string())
                        .or_insert(0);
                    *counter += 1;
                    if *counter >= interval {
                        *counter = 0;
                        true
                    } else {
                        false
                    }
                };
                if due {
                    let extractor = Arc::clone(extractor);
                    let store = Arc::clone(&self.deps.memory_store);
                    let context = Arc::clone(&self.deps.context_store);
                    let key = session_key.clone();
                    let rid = request_id.as_str().to_string();
                    self.deps.supervisor.spawn(
                        "memory_extract",
                        &format!("mem:{}", session_key),
                        async move {
                            let snapshot = context.get_snapshot(&key).unwrap_or_default();
                            let tail: Vec<ChatMessage> = snapshot
                                .into_iter()
                                .rev()
                                .take(interval as usize * 2)
                                .rev()
                                .collect();
                            extractor
                                .extract_and_store(&tail, &key, store.as_ref(), &rid)
                                .await;
                        },
                    );
                }
            }
        }

        if cfg.topic_summary.enabled {
            if let Some(summarizer) = &self.deps.summarizer {
                let summarizer = Arc::clone(summarizer);
                let key = session_key.clone();
                let rid = request_id.as_str().to_string();
                self.deps.supervisor.spawn(
                    "topic_summary",
                    &format!("topic:{}", session_key),
                    async move {
                        summarizer.run_once(&key, &rid).await;
                    },
                );
            }
        }

        if cfg.dream.enabled {
            if let Some(dream) = &self.deps.dream {
                let dream = Arc::clone(dream);
                let context = Arc::clone(&self.deps.context_store);
                let idle_minutes = cfg.dream.idle_minutes;
                let key = session_key.clone();
                self.deps.supervisor.spawn(
                    "dream_tick",
                    &format!("dream:{}", session_key),
                    async move {
                        let now = chrono::Utc::now().timestamp() as f64;
                        let last = context.last_activity(&key).ok().flatten();
                        if DreamAgent::is_idle(last, idle_minutes, now) {
                            dream.run_session(&key);
                        }
                    },
                );
            }
        }
    }

    /// Full inbound path: envelope → (gate/judge for unsolicited group
    /// traffic) → chat → outbound action.
    pub async fn handle_envelope(&self, envelope: &EventEnvelope) -> OutboundAction {
        if envelope.is_self_message() {
            return OutboundAction::Noop;
        }
        let cfg = &self.deps.config;

        if envelope.is_group() {
            let group_id = envelope.group_id.trim().to_string();
            if !cfg.bot.group_whitelist.is_empty()
                && !cfg.bot.group_whitelist.iter().any(|g| *g == group_id)
            {
                return OutboundAction::Noop;
            }
            self.deps.gate.record_message(&group_id);
            let session_key = SessionKey::for_group(&group_id);
            let text = envelope.plaintext();

            if envelope.is_at_me() {
                let reply = self
                    .chat(self.params_from_envelope(envelope, true))
                    .await;
                return OutboundAction::SendMessage {
                    session_id: envelope.session_id.clone(),
                    text: reply,
                    reply_to_message_id: Some(envelope.message_id.clone()),
                };
            }

            // Unaddressed group traffic still feeds the shared transcript.
            if !text.is_empty() {
                let nick = if envelope.author.nickname.trim().is_empty() {
                    "User"
                } else {
                    envelope.author.nickname.trim()
                };
                let mut msg =
                    ChatMessage::user(format!("[{}({})]: {}", nick, envelope.author.id, text));
                msg.user_id = Some(envelope.author.id.clone());
                msg.message_id = Some(envelope.message_id.clone());
                msg.timestamp = Some(envelope.timestamp);
                if let Err(err) = self.deps.context_store.append_message(&session_key, &msg) {
                    warn!(%err, "group observation persistence failed");
                }
            }

            if self.deps.gate.check_proactive(envelope, &self.deps.metrics) {
                let request_id = RequestId::new();
                let snapshot = self
                    .deps
                    .context_store
                    .get_snapshot(&session_key)
                    .unwrap_or_default();
                let tail_start = snapshot
                    .len()
                    .saturating_sub(cfg.proactive.judge_context_messages);
                let should_reply = judge_proactive_intent(
                    &self.deps.client,
                    cfg.llm.filter_model(),
                    &cfg.bot.name,
                    &snapshot[tail_start..],
                    self.deps.gate.heat(&group_id),
                    cfg.proactive.judge_max_retries,
                    request_id.as_str(),
                )
                .await;
                if !should_reply {
                    Metrics::incr(&self.deps.metrics.proactive_reject_total);
                    return OutboundAction::Noop;
                }
                self.deps.gate.mark_triggered(&group_id);

                let (sender, line) = extract_nickname(&format!(
                    "[{}({})]: {}",
                    envelope.author.nickname, envelope.author.id, text
                ));
                let mut params = self.params_from_envelope(envelope, true);
                params.is_proactive = true;
                params.system_injection = Some(proactive_instruction(&sender, &line));
                let reply = self.chat(params).await;
                return OutboundAction::SendMessage {
                    session_id: envelope.session_id.clone(),
                    text: reply,
                    reply_to_message_id: None,
                };
            }
            return OutboundAction::Noop;
        }

        if envelope.is_private() {
            let reply = self.chat(self.params_from_envelope(envelope, true)).await;
            return OutboundAction::SendMessage {
                session_id: envelope.session_id.clone(),
                text: reply,
                reply_to_message_id: None,
            };
        }

        OutboundAction::Noop
    }

    fn params_from_envelope(&self, envelope: &EventEnvelope, enable_tools: bool) -> ChatParams {
        let mut params = ChatParams::new(envelope.plaintext(), envelope.author.id.clone());
        params.user_nickname = envelope.author.nickname.clone();
        params.group_id = if envelope.is_group() {
            Some(envelope.group_id.trim().to_string())
        } else {
            None
        };
        params.image_urls = envelope.image_refs(self.deps.config.media.max_images);
        params.enable_tools = enable_tools;
        params.message_id = Some(envelope.message_id.clone());
        params
    }
}
