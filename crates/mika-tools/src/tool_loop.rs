//! Bounded multi-round tool-calling loop.
//!
//! Flow: assistant tool_calls → execute serially → tool results → re-send.
//! Stops on a plain reply, the round budget, or a forced final pass with
//! tools hidden. Transport is called at most `max_rounds + 1` times here
//! (the initial call happened in the orchestrator).

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use tracing::{debug, info, warn};

use mika_core::error::MikaError;
use mika_core::message::{ChatMessage, ToolCall};
use mika_core::metrics::Metrics;
use mika_hooks::{emit, AgentHooks, HookEvent};
use mika_provider::{CompletionClient, CompletionReply, CompletionRequest};

use crate::error::ToolError;
use crate::executor::{truncate_result, ToolExecutor};
use crate::refine::SearchState;
use crate::registry::{ToolContext, ToolRegistry};

const REFLECTION_PROMPT: &str = "观察与反思：以上工具结果是否足以回答用户？\
如果足够，请直接给出最终回答；如果不够，再调用必要的工具。";

const FORCE_FINAL_PROMPT: &str = "请停止调用工具，基于以上已有信息直接给出最终回答。";

const ALLOWLIST_BLOCK_RESULT: &str = "该工具未被允许使用，请基于已有信息回答。";

#[derive(Debug, Clone)]
pub struct ToolLoopConfig {
    pub max_rounds: u32,
    pub timeout_seconds: u64,
    pub force_final_on_max_rounds: bool,
    pub react_reflection: bool,
    pub result_max_chars: usize,
    pub allowlist: Vec<String>,
    pub allow_dynamic_registered: bool,
    pub search_refine_enabled: bool,
    pub search_refine_max_rounds: u32,
    pub duplicate_similarity: f64,
}

#[derive(Debug)]
pub struct ToolLoopOutcome {
    pub reply: String,
    /// Assistant tool-call and tool-result messages, for persistence.
    pub trace_messages: Vec<ChatMessage>,
    pub rounds_used: u32,
    pub llm_calls: u32,
    pub schema_mismatch_suspected: bool,
}

pub struct ToolLoop<'a> {
    pub client: &'a dyn CompletionClient,
    pub registry: &'a ToolRegistry,
    pub executor: &'a ToolExecutor,
    pub hooks: &'a dyn AgentHooks,
    pub metrics: &'a Metrics,
}

impl<'a> ToolLoop<'a> {
    fn parse_args(raw: &str, schema_mismatch: &mut bool) -> Value {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return json!({});
        }
        match serde_json::from_str::<Value>(trimmed) {
            Ok(value) if value.is_object() => value,
            _ => {
                *schema_mismatch = true;
                json!({ "input": raw })
            }
        }
    }

    /// Execute one tool call end to end: alias, allowlist, refine policy,
    /// cache/dedupe, timeout, truncation, hooks.
    #[allow(clippy::too_many_arguments)]
    async fn run_one_call(
        &self,
        call: &ToolCall,
        ctx: &ToolContext,
        cfg: &ToolLoopConfig,
        allowlist: &HashSet<String>,
        search_state: &mut Option<&mut SearchState>,
        schema_mismatch: &mut bool,
    ) -> String {
        let resolved = self.registry.resolve_alias(&call.function.name);
        let args = Self::parse_args(&call.function.arguments, schema_mismatch);
        let started = Instant::now();

        emit(
            self.hooks,
            HookEvent::ToolStart,
            &json!({
                "request_id": ctx.request_id,
                "session_key": ctx.session_key.as_str(),
                "user_id": ctx.user_id,
                "group_id": ctx.group_id.clone().unwrap_or_default(),
                "tool": resolved,
                "args": args,
            }),
        )
        .await;

        let mut cache_hit = false;
        let mut blocked = false;

        let result_text = if !allowlist.contains(&resolved) {
            Metrics::incr(&self.metrics.tool_blocked_total);
            blocked = true;
            warn!(tool = %resolved, "tool blocked by allowlist");
            ALLOWLIST_BLOCK_RESULT.to_string()
        } else if resolved == "web_search" {
            let query = args
                .get("query")
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .to_string();
            let block = search_state.as_mut().and_then(|state| {
                state.check_web_search(
                    &query,
                    cfg.search_refine_enabled,
                    cfg.search_refine_max_rounds,
                    cfg.duplicate_similarity,
                )
            });
            match block {
                Some(reason) => {
                    Metrics::incr(&self.metrics.tool_blocked_total);
                    blocked = true;
                    info!(
                        request_id = %ctx.request_id,
                        blocked = reason.as_str(),
                        "web_search refine blocked"
                    );
                    reason.instruction().to_string()
                }
                None => {
                    let (text, hit) = self.invoke_handler(&resolved, &args, ctx, cfg).await;
                    cache_hit = hit;
                    text
                }
            }
        } else {
            let (text, hit) = self.invoke_handler(&resolved, &args, ctx, cfg).await;
            cache_hit = hit;
            text
        };

        let result_text = truncate_result(&result_text, cfg.result_max_chars);
        if cache_hit {
            Metrics::incr(&self.metrics.tool_cache_hits);
        }

        emit(
            self.hooks,
            HookEvent::ToolEnd,
            &json!({
                "request_id": ctx.request_id,
                "session_key": ctx.session_key.as_str(),
                "user_id": ctx.user_id,
                "group_id": ctx.group_id.clone().unwrap_or_default(),
                "tool": resolved,
                "duration_ms": started.elapsed().as_millis() as u64,
                "cache_hit": cache_hit,
                "blocked": blocked,
                "result_chars": result_text.chars().count(),
            }),
        )
        .await;

        result_text
    }

    /// Look up and run the handler under the executor (cache + dedupe +
    /// timeout). Failures become textual results; the loop continues.
    async fn invoke_handler(
        &self,
        name: &str,
        args: &Value,
        ctx: &ToolContext,
        cfg: &ToolLoopConfig,
    ) -> (String, bool) {
        let Some(entry) = self.registry.get(name) else {
            return (format!("未知工具: {}", name), false);
        };
        let tool = Arc::clone(&entry.tool);
        let timeout = Duration::from_secs(cfg.timeout_seconds.max(1));
        let scope = ctx.session_key.as_str().to_string();
        let call_ctx = ctx.clone();
        let call_args = args.clone();

        let outcome = self
            .executor
            .execute(&scope, name, args, move || async move {
                match tokio::time::timeout(timeout, tool.call(call_args, &call_ctx)).await {
                    Ok(result) => result,
                    Err(_) => Err(ToolError::Timeout {
                        seconds: timeout.as_secs(),
                    }),
                }
            })
            .await;

        match outcome {
            Ok(exec) => (exec.result, exec.cache_hit),
            Err(err) => {
                warn!(tool = name, %err, "tool execution failed");
                (format!("工具执行失败: {}", err), false)
            }
        }
    }

    /// Run the loop starting from an assistant reply that carries tool
    /// calls. `base_request` holds the already-built message list and the
    /// exposed tool specs.
    pub async fn run(
        &self,
        base_request: &CompletionRequest,
        first_reply: CompletionReply,
        ctx: &ToolContext,
        mut search_state: Option<&mut SearchState>,
        cfg: &ToolLoopConfig,
    ) -> Result<ToolLoopOutcome, MikaError> {
        let allowlist = self
            .registry
            .effective_allowlist(&cfg.allowlist, cfg.allow_dynamic_registered);

        let mut messages = base_request.messages.clone();
        let mut trace: Vec<ChatMessage> = Vec::new();
        let mut assistant = first_reply.assistant;
        let mut tool_calls = first_reply.tool_calls;
        let mut schema_mismatch = false;
        let mut llm_calls = 0u32;
        let mut rounds_used = 0u32;

        for round in 0..cfg.max_rounds {
            rounds_used = round + 1;
            debug!(round = rounds_used, calls = tool_calls.len(), "tool loop round");

            // Duplicate ids within a round would detach results from calls.
            let mut seen_ids: HashSet<String> = HashSet::new();
            for (index, call) in tool_calls.iter_mut().enumerate() {
                if call.id.trim().is_empty() || !seen_ids.insert(call.id.clone()) {
                    call.id = format!("call_{}_{}", rounds_used, index);
                    seen_ids.insert(call.id.clone());
                }
            }
            assistant.tool_calls = Some(tool_calls.clone());

            messages.push(assistant.clone());
            trace.push(assistant.clone());

            for call in &tool_calls {
                let result = self
                    .run_one_call(call, ctx, cfg, &allowlist, &mut search_state, &mut schema_mismatch)
                    .await;
                let tool_msg =
                    ChatMessage::tool_result(call.id.clone(), call.function.name.clone(), result);
                messages.push(tool_msg.clone());
                trace.push(tool_msg);
            }

            if cfg.react_reflection && rounds_used < cfg.max_rounds {
                messages.push(ChatMessage::user(REFLECTION_PROMPT));
            }

            let mut req = base_request.clone();
            req.messages = messages.clone();
            let reply = self
                .client
                .complete(&req, "tool_loop", &ctx.request_id)
                .await?;
            llm_calls += 1;

            if reply.tool_calls.is_empty() {
                return Ok(ToolLoopOutcome {
                    reply: reply.content_text(),
                    trace_messages: trace,
                    rounds_used,
                    llm_calls,
                    schema_mismatch_suspected: schema_mismatch,
                });
            }
            assistant = reply.assistant;
            tool_calls = reply.tool_calls;
        }

        // Round budget exhausted with tool calls still pending.
        if cfg.force_final_on_max_rounds {
            info!(
                request_id = %ctx.request_id,
                rounds = rounds_used,
                "max tool rounds reached, forcing final answer"
            );
            messages.push(ChatMessage::user(FORCE_FINAL_PROMPT));
            let mut req = base_request.clone();
            req.messages = messages;
            req.tools = Vec::new();
            let reply = self
                .client
                .complete(&req, "tool_loop_final", &ctx.request_id)
                .await?;
            llm_calls += 1;
            return Ok(ToolLoopOutcome {
                reply: reply.content_text(),
                trace_messages: trace,
                rounds_used,
                llm_calls,
                schema_mismatch_suspected: schema_mismatch,
            });
        }

        warn!(request_id = %ctx.request_id, "tool loop ended without final reply");
        Ok(ToolLoopOutcome {
            reply: assistant.content.to_text(),
            trace_messages: trace,
            rounds_used,
            llm_calls,
            schema_mismatch_suspected: schema_mismatch,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::test_support::{ctx, StaticTool};
    use crate::registry::ToolSource;
    use async_trait::async_trait;
    use mika_core::message::ToolCallFunction;
    use mika_hooks::NoopHooks;
    use mika_provider::Usage;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    fn call(id: &str, name: &str, args: &str) -> ToolCall {
        ToolCall {
            id: id.into(),
            r#type: "function".into(),
            function: ToolCallFunction {
                name: name.into(),
                arguments: args.into(),
            },
        }
    }

    fn reply_with_calls(calls: Vec<ToolCall>) -> CompletionReply {
        let mut assistant = ChatMessage::assistant("");
        if !calls.is_empty() {
            assistant.tool_calls = Some(calls.clone());
        }
        CompletionReply {
            assistant,
            tool_calls: calls,
            api_key: "k".into(),
            usage: Usage::default(),
            finish_reason: "tool_calls".into(),
            empty_meta: None,
        }
    }

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

    /// Scripted transport: pops the next canned reply per call.
    struct ScriptedClient {
        replies: Mutex<Vec<CompletionReply>>,
        calls: AtomicU32,
        saw_tools_on_last: Mutex<Vec<bool>>,
    }

    impl ScriptedClient {
        fn new(mut replies: Vec<CompletionReply>) -> Self {
            replies.reverse();
            Self {
                replies: Mutex::new(replies),
                calls: AtomicU32::new(0),
                saw_tools_on_last: Mutex::new(Vec::new()),
            }
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
            self.saw_tools_on_last
                .lock()
                .unwrap()
                .push(!req.tools.is_empty());
            Ok(self
                .replies
                .lock()
                .unwrap()
                .pop()
                .unwrap_or_else(|| text_reply("fallback")))
        }
    }

    fn cfg(max_rounds: u32) -> ToolLoopConfig {
        ToolLoopConfig {
            max_rounds,
            timeout_seconds: 5,
            force_final_on_max_rounds: true,
            react_reflection: false,
            result_max_chars: 4000,
            allowlist: vec!["web_search".into(), "echo".into()],
            allow_dynamic_registered: true,
            search_refine_enabled: true,
            search_refine_max_rounds: 2,
            duplicate_similarity: 0.9,
        }
    }

    fn base_request() -> CompletionRequest {
        let mut req = CompletionRequest::new("m", vec![ChatMessage::user("question")]);
        req.tools = vec![mika_provider::ToolSpec {
            name: "echo".into(),
            description: "echo".into(),
            parameters: json!({"type": "object"}),
        }];
        req
    }

    #[tokio::test]
    async fn loop_executes_then_returns_final_reply() {
        let registry = ToolRegistry::new();
        registry
            .register(StaticTool::new("echo", "tool says hi"), ToolSource::Builtin)
            .unwrap();
        let executor = ToolExecutor::new(false, 0, 1);
        let metrics = Metrics::new();
        let client = ScriptedClient::new(vec![text_reply("final answer")]);

        let lp = ToolLoop {
            client: &client,
            registry: &registry,
            executor: &executor,
            hooks: &NoopHooks,
            metrics: &metrics,
        };
        let outcome = lp
            .run(
                &base_request(),
                reply_with_calls(vec![call("c1", "echo", "{}")]),
                &ctx(),
                None,
                &cfg(5),
            )
            .await
            .unwrap();

        assert_eq!(outcome.reply, "final answer");
        assert_eq!(outcome.rounds_used, 1);
        assert_eq!(outcome.llm_calls, 1);
        // assistant tool_calls message + tool result message persisted.
        assert_eq!(outcome.trace_messages.len(), 2);
        assert_eq!(
            outcome.trace_messages[1].tool_call_id.as_deref(),
            Some("c1")
        );
    }

    #[tokio::test]
    async fn transport_calls_stay_bounded_with_forced_final() {
        let registry = ToolRegistry::new();
        registry
            .register(StaticTool::new("echo", "r"), ToolSource::Builtin)
            .unwrap();
        let executor = ToolExecutor::new(false, 0, 1);
        let metrics = Metrics::new();
        // The model stubbornly keeps calling tools every time.
        let replies: Vec<CompletionReply> = (0..10)
            .map(|i| reply_with_calls(vec![call(&format!("c{}", i), "echo", "{}")]))
            .collect();
        let client = ScriptedClient::new(replies);

        let lp = ToolLoop {
            client: &client,
            registry: &registry,
            executor: &executor,
            hooks: &NoopHooks,
            metrics: &metrics,
        };
        let max_rounds = 3;
        let outcome = lp
            .run(
                &base_request(),
                reply_with_calls(vec![call("c0", "echo", "{}")]),
                &ctx(),
                None,
                &cfg(max_rounds),
            )
            .await
            .unwrap();

        // rounds + forced final; with the orchestrator's first call this is
        // the max_rounds + 2 transport bound.
        assert_eq!(client.calls.load(Ordering::SeqCst), max_rounds + 1);
        assert_eq!(outcome.rounds_used, max_rounds);
        // Forced-final request hides the tools.
        let saw_tools = client.saw_tools_on_last.lock().unwrap();
        assert!(!saw_tools.last().unwrap());
    }

    #[tokio::test]
    async fn disallowed_tool_returns_blocked_result_without_handler() {
        let registry = ToolRegistry::new();
        registry
            .register(StaticTool::new("secret_tool", "should not run"), ToolSource::Builtin)
            .unwrap();
        let executor = ToolExecutor::new(false, 0, 1);
        let metrics = Metrics::new();
        let client = ScriptedClient::new(vec![text_reply("done")]);

        let lp = ToolLoop {
            client: &client,
            registry: &registry,
            executor: &executor,
            hooks: &NoopHooks,
            metrics: &metrics,
        };
        let outcome = lp
            .run(
                &base_request(),
                reply_with_calls(vec![call("c1", "secret_tool", "{}")]),
                &ctx(),
                None,
                &cfg(5),
            )
            .await
            .unwrap();

        let tool_msg = &outcome.trace_messages[1];
        assert!(tool_msg.content.to_text().contains("未被允许"));
        assert_eq!(
            metrics.tool_blocked_total.load(Ordering::Relaxed),
            1
        );
    }

    #[tokio::test]
    async fn duplicate_web_search_is_blocked_after_presearch() {
        let registry = ToolRegistry::new();
        registry
            .register(StaticTool::new("web_search", "results"), ToolSource::Builtin)
            .unwrap();
        let executor = ToolExecutor::new(false, 0, 1);
        let metrics = Metrics::new();
        let client = ScriptedClient::new(vec![text_reply("done")]);

        let lp = ToolLoop {
            client: &client,
            registry: &registry,
            executor: &executor,
            hooks: &NoopHooks,
            metrics: &metrics,
        };
        let mut state = SearchState::from_presearch(true, true, "现在最好的AI模型是什么");
        let outcome = lp
            .run(
                &base_request(),
                reply_with_calls(vec![call(
                    "c1",
                    "web_search",
                    "{\"query\": \"最好的AI模型\"}",
                )]),
                &ctx(),
                Some(&mut state),
                &cfg(5),
            )
            .await
            .unwrap();

        assert!(outcome.trace_messages[1].content.to_text().contains("重复"));
        assert_eq!(state.blocked_duplicate_total, 1);
    }

    #[tokio::test]
    async fn malformed_arguments_flag_schema_mismatch() {
        let registry = ToolRegistry::new();
        registry
            .register(StaticTool::new("echo", "ok"), ToolSource::Builtin)
            .unwrap();
        let executor = ToolExecutor::new(false, 0, 1);
        let metrics = Metrics::new();
        let client = ScriptedClient::new(vec![text_reply("done")]);

        let lp = ToolLoop {
            client: &client,
            registry: &registry,
            executor: &executor,
            hooks: &NoopHooks,
            metrics: &metrics,
        };
        let outcome = lp
            .run(
                &base_request(),
                reply_with_calls(vec![call("c1", "echo", "not json at all")]),
                &ctx(),
                None,
                &cfg(5),
            )
            .await
            .unwrap();
        assert!(outcome.schema_mismatch_suspected);
    }
}
