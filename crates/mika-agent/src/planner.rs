//! Request planning: which capabilities a request activates.
//!
//! The heuristic planner is deterministic and explainable; the optional
//! LLM planner asks a fast model for a JSON plan and falls back to the
//! heuristic on any failure. Config gates always win: a plan can never
//! switch on a feature the config has off.

use serde::{Deserialize, Serialize};

use mika_core::config::MikaConfig;

pub const CAPTION_BLOCK_MARKER: &str = "[Context Media Captions";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplyMode {
    Direct,
    ToolLoop,
    NoReply,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaNeed {
    None,
    Caption,
    Images,
}

impl MediaNeed {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "none" => Some(MediaNeed::None),
            "caption" => Some(MediaNeed::Caption),
            "images" => Some(MediaNeed::Images),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolPolicy {
    pub enabled: bool,
    pub allow: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestPlan {
    pub should_reply: bool,
    pub reply_mode: ReplyMode,
    pub need_media: MediaNeed,
    pub use_memory_retrieval: bool,
    pub use_ltm_memory: bool,
    pub use_knowledge_auto_inject: bool,
    pub tool_policy: ToolPolicy,
    pub reason: String,
    pub confidence: f64,
    pub planner_mode: String,
}

/// Inputs the planner looks at for one request.
#[derive(Debug, Clone, Default)]
pub struct PlanInput {
    pub message: String,
    pub enable_tools: bool,
    pub is_proactive: bool,
    pub image_urls_count: usize,
    pub system_injection: Option<String>,
}

pub fn build_heuristic_plan(cfg: &MikaConfig, input: &PlanInput) -> RequestPlan {
    // Relevance filtering happened upstream; by the time a request reaches
    // the planner the answer to "should we reply" is yes.
    let tool_enabled = input.enable_tools;
    let reply_mode = if tool_enabled {
        ReplyMode::ToolLoop
    } else {
        ReplyMode::Direct
    };

    let policy_default = MediaNeed::parse(&cfg.media.policy_default).unwrap_or(MediaNeed::Caption);
    let need_media = if input.image_urls_count > 0 {
        MediaNeed::Images
    } else if input
        .system_injection
        .as_deref()
        .is_some_and(|s| s.contains(CAPTION_BLOCK_MARKER))
    {
        MediaNeed::Caption
    } else {
        policy_default
    };

    let use_memory_retrieval = cfg.memory.retrieval_enabled;
    let use_ltm_memory = !use_memory_retrieval && cfg.memory.enabled;
    let use_knowledge_auto_inject =
        !use_memory_retrieval && cfg.knowledge.enabled && cfg.knowledge.auto_inject;

    let mut reason_parts: Vec<String> = Vec::new();
    if input.is_proactive {
        reason_parts.push("proactive".into());
    }
    if !input.message.trim().is_empty() && input.message.trim().chars().count() <= 12 {
        reason_parts.push("short_message".into());
    }
    reason_parts.push(format!("tools={}", if tool_enabled { "on" } else { "off" }));
    reason_parts.push(format!("media={:?}", need_media).to_lowercase());
    reason_parts.push(format!(
        "retrieval={}",
        if use_memory_retrieval { "on" } else { "off" }
    ));
    if use_ltm_memory {
        reason_parts.push("ltm=on".into());
    }
    if use_knowledge_auto_inject {
        reason_parts.push("knowledge=on".into());
    }

    RequestPlan {
        should_reply: true,
        reply_mode,
        need_media,
        use_memory_retrieval,
        use_ltm_memory,
        use_knowledge_auto_inject,
        tool_policy: ToolPolicy {
            enabled: tool_enabled,
            allow: cfg.tools.allowlist.clone(),
        },
        reason: format!("heuristic:{}", reason_parts.join(",")),
        confidence: 0.9,
        planner_mode: "heuristic".into(),
    }
}

/// Clamp an (LLM-produced) plan to what config allows. The planner may
/// narrow features, never widen them.
pub fn gate_plan_by_config(plan: RequestPlan, cfg: &MikaConfig, input: &PlanInput) -> RequestPlan {
    let tool_enabled = input.enable_tools && plan.tool_policy.enabled;
    let reply_mode = if tool_enabled {
        ReplyMode::ToolLoop
    } else {
        ReplyMode::Direct
    };

    let allow_retrieval = cfg.memory.retrieval_enabled;
    let allow_ltm = cfg.memory.enabled;
    let allow_knowledge = cfg.knowledge.enabled && cfg.knowledge.auto_inject;

    let use_memory_retrieval = plan.use_memory_retrieval && allow_retrieval;
    let use_ltm_memory = plan.use_ltm_memory && allow_ltm && !use_memory_retrieval;
    let use_knowledge_auto_inject =
        plan.use_knowledge_auto_inject && allow_knowledge && !use_memory_retrieval;

    let policy_default = MediaNeed::parse(&cfg.media.policy_default).unwrap_or(MediaNeed::Caption);
    let mut need_media = if input.image_urls_count > 0 {
        MediaNeed::Images
    } else if input
        .system_injection
        .as_deref()
        .is_some_and(|s| s.contains(CAPTION_BLOCK_MARKER))
    {
        MediaNeed::Caption
    } else {
        policy_default
    };
    if cfg.llm.supports_images == Some(false) && need_media == MediaNeed::Images {
        need_media = if policy_default == MediaNeed::None {
            MediaNeed::None
        } else {
            MediaNeed::Caption
        };
    }

    RequestPlan {
        should_reply: plan.should_reply,
        reply_mode,
        need_media,
        use_memory_retrieval,
        use_ltm_memory,
        use_knowledge_auto_inject,
        tool_policy: ToolPolicy {
            enabled: tool_enabled,
            allow: plan.tool_policy.allow,
        },
        reason: if plan.reason.trim().is_empty() {
            "llm:unspecified".into()
        } else {
            plan.reason
        },
        confidence: plan.confidence,
        planner_mode: if plan.planner_mode.trim().is_empty() {
            "llm".into()
        } else {
            plan.planner_mode
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> MikaConfig {
        let mut cfg = MikaConfig::default();
        cfg.memory.enabled = true;
        cfg.knowledge.enabled = true;
        cfg.knowledge.auto_inject = true;
        cfg
    }

    #[test]
    fn heuristic_prefers_retrieval_over_direct_injection() {
        let mut config = cfg();
        config.memory.retrieval_enabled = true;
        let plan = build_heuristic_plan(&config, &PlanInput::default());
        assert!(plan.use_memory_retrieval);
        assert!(!plan.use_ltm_memory);
        assert!(!plan.use_knowledge_auto_inject);
        assert_eq!(plan.planner_mode, "heuristic");
        assert!((plan.confidence - 0.9).abs() < f64::EPSILON);
    }

    #[test]
    fn request_images_override_media_policy() {
        let plan = build_heuristic_plan(
            &cfg(),
            &PlanInput {
                image_urls_count: 2,
                ..Default::default()
            },
        );
        assert_eq!(plan.need_media, MediaNeed::Images);
    }

    #[test]
    fn caption_block_in_injection_selects_caption() {
        let plan = build_heuristic_plan(
            &cfg(),
            &PlanInput {
                system_injection: Some("[Context Media Captions | Untrusted]\n...".into()),
                ..Default::default()
            },
        );
        assert_eq!(plan.need_media, MediaNeed::Caption);
    }

    #[test]
    fn gate_cannot_enable_config_disabled_features() {
        let mut config = MikaConfig::default();
        config.memory.enabled = false;
        config.memory.retrieval_enabled = false;
        let ambitious = RequestPlan {
            should_reply: true,
            reply_mode: ReplyMode::ToolLoop,
            need_media: MediaNeed::Images,
            use_memory_retrieval: true,
            use_ltm_memory: true,
            use_knowledge_auto_inject: true,
            tool_policy: ToolPolicy {
                enabled: true,
                allow: vec![],
            },
            reason: "llm:wants everything".into(),
            confidence: 0.8,
            planner_mode: "llm".into(),
        };
        let gated = gate_plan_by_config(
            ambitious,
            &config,
            &PlanInput {
                enable_tools: false,
                ..Default::default()
            },
        );
        assert!(!gated.use_memory_retrieval);
        assert!(!gated.use_ltm_memory);
        assert!(!gated.use_knowledge_auto_inject);
        assert!(!gated.tool_policy.enabled);
        assert_eq!(gated.reply_mode, ReplyMode::Direct);
    }

    #[test]
    fn images_downgrade_to_caption_when_model_lacks_vision() {
        let mut config = cfg();
        config.llm.supports_images = Some(false);
        let plan = build_heuristic_plan(
            &config,
            &PlanInput {
                image_urls_count: 1,
                ..Default::default()
            },
        );
        let gated = gate_plan_by_config(
            plan,
            &config,
            &PlanInput {
                image_urls_count: 1,
                enable_tools: false,
                ..Default::default()
            },
        );
        assert_eq!(gated.need_media, MediaNeed::Caption);
    }
}
