//! Optional LLM-driven planning. One fast-model call produces a JSON plan;
//! any failure (timeout, parse, transport) falls back to the heuristic.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tracing::{debug, warn};

use mika_core::config::MikaConfig;
use mika_core::jsonx::parse_loose_json;
use mika_core::message::ChatMessage;
use mika_provider::{CompletionClient, CompletionRequest};

use crate::planner::{
    build_heuristic_plan, gate_plan_by_config, MediaNeed, PlanInput, ReplyMode, RequestPlan,
    ToolPolicy,
};

const PLANNER_SYSTEM_PROMPT: &str = "你是请求规划器。根据用户消息输出一个 JSON 计划对象：\n\
{\"should_reply\": bool, \"reply_mode\": \"direct|tool_loop|no_reply\", \
\"need_media\": \"none|caption|images\", \"use_memory_retrieval\": bool, \
\"use_ltm_memory\": bool, \"use_knowledge_auto_inject\": bool, \
\"tool_policy\": {\"enabled\": bool, \"allow\": []}, \"reason\": \"...\", \"confidence\": 0.0}\n\
只输出 JSON。";

fn parse_plan(raw: &str) -> Option<RequestPlan> {
    let value = parse_loose_json(raw)?;
    let reply_mode = match value.get("reply_mode").and_then(|v| v.as_str()).unwrap_or("direct") {
        "tool_loop" => ReplyMode::ToolLoop,
        "no_reply" => ReplyMode::NoReply,
        _ => ReplyMode::Direct,
    };
    let need_media = value
        .get("need_media")
        .and_then(|v| v.as_str())
        .and_then(MediaNeed::parse)
        .unwrap_or(MediaNeed::None);
    let tool_policy = ToolPolicy {
        enabled: value
            .pointer("/tool_policy/enabled")
            .and_then(|v| v.as_bool())
            .unwrap_or(false),
        allow: value
            .pointer("/tool_policy/allow")
            .and_then(|v| v.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|v| v.as_str())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default(),
    };
    Some(RequestPlan {
        should_reply: value.get("should_reply").and_then(|v| v.as_bool()).unwrap_or(true),
        reply_mode,
        need_media,
        use_memory_retrieval: value
            .get("use_memory_retrieval")
            .and_then(|v| v.as_bool())
            .unwrap_or(false),
        use_ltm_memory: value
            .get("use_ltm_memory")
            .and_then(|v| v.as_bool())
            .unwrap_or(false),
        use_knowledge_auto_inject: value
            .get("use_knowledge_auto_inject")
            .and_then(|v| v.as_bool())
            .unwrap_or(false),
        tool_policy,
        reason: value
            .get("reason")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string(),
        confidence: value
            .get("confidence")
            .and_then(|v| v.as_f64())
            .unwrap_or(0.5)
            .clamp(0.0, 1.0),
        planner_mode: "llm".into(),
    })
}

/// Build the request plan per config: heuristic, or LLM-gated with
/// heuristic fallback.
pub async fn build_request_plan(
    client: &Arc<dyn CompletionClient>,
    cfg: &MikaConfig,
    input: &PlanInput,
    request_id: &str,
) -> RequestPlan {
    let heuristic = build_heuristic_plan(cfg, input);
    if !cfg.planner.enabled || cfg.planner.mode.trim().to_ascii_lowercase() != "llm" {
        return heuristic;
    }

    let user_prompt = json!({
        "message": input.message,
        "is_proactive": input.is_proactive,
        "has_images": input.image_urls_count > 0,
        "tools_available": input.enable_tools,
    })
    .to_string();

    let mut req = CompletionRequest::new(
        cfg.llm.filter_model().to_string(),
        vec![
            ChatMessage::system(PLANNER_SYSTEM_PROMPT),
            ChatMessage::user(user_prompt),
        ],
    );
    req.temperature = Some(0.0);
    req.max_tokens = Some(384);

    let timeout = Duration::from_secs(cfg.planner.llm_timeout_seconds.max(1));
    let planned = match tokio::time::timeout(timeout, client.complete(&req, "planner", request_id)).await
    {
        Ok(Ok(reply)) => parse_plan(&reply.content_text()),
        Ok(Err(err)) => {
            warn!(%err, "llm planner call failed, using heuristic");
            None
        }
        Err(_) => {
            warn!("llm planner timed out, using heuristic");
            None
        }
    };

    match planned {
        Some(plan) => {
            debug!(reason = %plan.reason, "llm plan accepted");
            gate_plan_by_config(plan, cfg, input)
        }
        None => heuristic,
    }
}
