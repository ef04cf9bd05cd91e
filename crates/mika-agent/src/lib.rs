//! Chat orchestration: planner, pre-search, proactive gate, reply
//! sanitizer, degradation ladder, and the top-level pipeline wiring them
//! to providers, tools, context, memory, hooks, and background tasks.

pub mod captions;
pub mod degrade;
pub mod llm_planner;
pub mod orchestrator;
pub mod planner;
pub mod presearch;
pub mod proactive;
pub mod prompt;
pub mod sanitize;

pub use captions::{build_caption_injection, CaptionProvider, CAPTION_BLOCK_LABEL};
pub use llm_planner::build_request_plan;
pub use orchestrator::{ChatOrchestrator, ChatParams, OrchestratorDeps, StreamHandler};
pub use planner::{build_heuristic_plan, gate_plan_by_config, MediaNeed, PlanInput, ReplyMode, RequestPlan};
pub use presearch::{search_result_message, PreSearchClassifier, PreSearchResult, SEARCH_RESULT_LABEL};
pub use proactive::{judge_proactive_intent, HeatMonitor, NoopMatcher, ProactiveGate, SemanticMatcher};
pub use prompt::PromptContext;
pub use sanitize::{clean_thinking_markers, sanitize_reply, strip_markdown, strip_role_tags};
