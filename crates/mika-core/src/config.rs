use std::collections::BTreeMap;

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::MikaError;

/// Top-level config (mika.toml + MIKA_* env overrides).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MikaConfig {
    #[serde(default)]
    pub bot: BotConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub context: ContextConfig,
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub degrade: DegradeConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
    #[serde(default)]
    pub memory: MemoryConfig,
    #[serde(default)]
    pub knowledge: KnowledgeConfig,
    #[serde(default)]
    pub topic_summary: TopicSummaryConfig,
    #[serde(default)]
    pub dream: DreamConfig,
    #[serde(default)]
    pub planner: PlannerConfig,
    #[serde(default)]
    pub presearch: PresearchConfig,
    #[serde(default)]
    pub proactive: ProactiveConfig,
    #[serde(default)]
    pub trace: TraceConfig,
    #[serde(default)]
    pub guard: GuardConfig,
    #[serde(default)]
    pub media: MediaConfig,
    #[serde(default)]
    pub errors: ErrorsConfig,
}

impl MikaConfig {
    /// Load from a TOML file with MIKA_* env var overrides
    /// (e.g. `MIKA_CONTEXT_MAX_TURNS=40`).
    pub fn load(config_path: Option<&str>) -> Result<Self, MikaError> {
        let path = config_path.unwrap_or("mika.toml");
        Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("MIKA_").split("_"))
            .extract()
            .map_err(|e| MikaError::Config(e.to_string()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotConfig {
    #[serde(default = "default_bot_name")]
    pub name: String,
    /// Operator user id, exposed as a prompt variable.
    #[serde(default)]
    pub master_id: String,
    /// Group whitelist; empty means every group is allowed.
    #[serde(default)]
    pub group_whitelist: Vec<String>,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            name: default_bot_name(),
            master_id: String::new(),
            group_whitelist: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// `openai_compat` | `anthropic` | `google_genai`.
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_model")]
    pub model: String,
    /// Fast model for classifier/judge/planner calls; falls back to `model`.
    #[serde(default)]
    pub filter_model: String,
    #[serde(default)]
    pub api_keys: Vec<String>,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default)]
    pub extra_headers: BTreeMap<String, String>,
    /// Cooldown applied to a key on 429 when Retry-After is absent.
    #[serde(default = "default_key_cooldown")]
    pub key_cooldown_seconds: u64,
    /// Override the image-capability probe. None = probe by model name.
    #[serde(default)]
    pub supports_images: Option<bool>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            base_url: default_base_url(),
            model: default_model(),
            filter_model: String::new(),
            api_keys: Vec::new(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            extra_headers: BTreeMap::new(),
            key_cooldown_seconds: default_key_cooldown(),
            supports_images: None,
        }
    }
}

impl LlmConfig {
    pub fn filter_model(&self) -> &str {
        if self.filter_model.trim().is_empty() {
            &self.model
        } else {
            &self.filter_model
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextConfig {
    /// `legacy` keeps old pass-through semantics; `structured` trims by turns.
    #[serde(default = "default_context_mode")]
    pub mode: String,
    #[serde(default = "default_max_turns")]
    pub max_turns: usize,
    /// Soft token budget; <=0 resolves from the model family.
    #[serde(default = "default_max_tokens_soft")]
    pub max_tokens_soft: i64,
    #[serde(default = "default_hard_max_messages")]
    pub hard_max_messages: usize,
    /// Hard byte cap for the outgoing request body.
    #[serde(default = "default_body_max_bytes")]
    pub request_body_max_bytes: usize,
    /// Messages kept in each session snapshot.
    #[serde(default = "default_snapshot_messages")]
    pub snapshot_max_messages: usize,
    #[serde(default = "default_snapshot_cache")]
    pub snapshot_cache_entries: usize,
    #[serde(default = "default_transcript_lines")]
    pub transcript_max_lines: usize,
    #[serde(default = "default_line_chars")]
    pub transcript_line_max_chars: usize,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            mode: default_context_mode(),
            max_turns: default_max_turns(),
            max_tokens_soft: default_max_tokens_soft(),
            hard_max_messages: default_hard_max_messages(),
            request_body_max_bytes: default_body_max_bytes(),
            snapshot_max_messages: default_snapshot_messages(),
            snapshot_cache_entries: default_snapshot_cache(),
            transcript_max_lines: default_transcript_lines(),
            transcript_line_max_chars: default_line_chars(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
    /// Extra attempts on timeout only, with linear backoff.
    #[serde(default = "default_timeout_retries")]
    pub timeout_retries: u32,
    #[serde(default = "default_timeout_retry_delay")]
    pub timeout_retry_delay_seconds: f64,
    #[serde(default = "default_empty_retries")]
    pub empty_reply_local_retries: u32,
    #[serde(default = "default_empty_retry_delay")]
    pub empty_reply_retry_delay_seconds: f64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: default_timeout_seconds(),
            timeout_retries: default_timeout_retries(),
            timeout_retry_delay_seconds: default_timeout_retry_delay(),
            empty_reply_local_retries: default_empty_retries(),
            empty_reply_retry_delay_seconds: default_empty_retry_delay(),
        }
    }
}

/// Empty-reply context degradation (L0 full → L1 ~20 msgs → L2 ~5;
/// degraded levels are safety-masked over persistent history).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DegradeConfig {
    #[serde(default = "bool_true")]
    pub enabled: bool,
    #[serde(default = "default_degrade_max_level")]
    pub max_level: u8,
    #[serde(default = "default_degrade_delay")]
    pub retry_delay_seconds: f64,
    #[serde(default = "default_degrade_l1")]
    pub level1_tail_messages: usize,
    #[serde(default = "default_degrade_l2")]
    pub level2_tail_messages: usize,
    /// Terms masked at degraded levels (>= 1).
    #[serde(default)]
    pub sensitive_terms: Vec<String>,
}

impl Default for DegradeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_level: default_degrade_max_level(),
            retry_delay_seconds: default_degrade_delay(),
            level1_tail_messages: default_degrade_l1(),
            level2_tail_messages: default_degrade_l2(),
            sensitive_terms: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsConfig {
    #[serde(default = "default_tool_rounds")]
    pub max_rounds: u32,
    #[serde(default = "default_tool_timeout")]
    pub timeout_seconds: u64,
    #[serde(default = "bool_true")]
    pub force_final_on_max_rounds: bool,
    #[serde(default)]
    pub react_reflection: bool,
    #[serde(default = "bool_true")]
    pub cache_enabled: bool,
    #[serde(default = "default_cache_ttl")]
    pub cache_ttl_seconds: u64,
    #[serde(default = "default_cache_entries")]
    pub cache_max_entries: usize,
    #[serde(default)]
    pub allowlist: Vec<String>,
    /// Also allow tools registered dynamically (MCP, plugins).
    #[serde(default = "bool_true")]
    pub allow_dynamic_registered: bool,
    /// `full` | `light` | `auto`.
    #[serde(default = "default_schema_mode")]
    pub schema_mode: String,
    /// In `auto` mode, switch to light schemas above this many tools.
    #[serde(default = "default_schema_auto_threshold")]
    pub schema_auto_threshold: usize,
    /// Window during which a session falls back to full schemas after
    /// repeated argument-parse failures.
    #[serde(default = "default_schema_fallback_ttl")]
    pub schema_fallback_ttl_seconds: u64,
    #[serde(default = "default_result_chars")]
    pub result_max_chars: usize,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            max_rounds: default_tool_rounds(),
            timeout_seconds: default_tool_timeout(),
            force_final_on_max_rounds: true,
            react_reflection: false,
            cache_enabled: true,
            cache_ttl_seconds: default_cache_ttl(),
            cache_max_entries: default_cache_entries(),
            allowlist: Vec::new(),
            allow_dynamic_registered: true,
            schema_mode: default_schema_mode(),
            schema_auto_threshold: default_schema_auto_threshold(),
            schema_fallback_ttl_seconds: default_schema_fallback_ttl(),
            result_max_chars: default_result_chars(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    #[serde(default)]
    pub enabled: bool,
    /// ReAct retrieval agent; when on it replaces direct LTM injection.
    #[serde(default)]
    pub retrieval_enabled: bool,
    #[serde(default = "default_retrieval_iterations")]
    pub retrieval_max_iterations: u32,
    #[serde(default = "default_retrieval_timeout")]
    pub retrieval_timeout_seconds: u64,
    /// Run the extractor once per this many persisted messages.
    #[serde(default = "default_extract_interval")]
    pub extract_interval_messages: u32,
    #[serde(default = "default_max_facts")]
    pub extract_max_facts: usize,
    #[serde(default = "default_memory_top_k")]
    pub top_k: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            retrieval_enabled: false,
            retrieval_max_iterations: default_retrieval_iterations(),
            retrieval_timeout_seconds: default_retrieval_timeout(),
            extract_interval_messages: default_extract_interval(),
            extract_max_facts: default_max_facts(),
            top_k: default_memory_top_k(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub auto_inject: bool,
    #[serde(default = "default_memory_top_k")]
    pub top_k: usize,
    #[serde(default)]
    pub corpus_id: String,
}

impl Default for KnowledgeConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            auto_inject: false,
            top_k: default_memory_top_k(),
            corpus_id: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopicSummaryConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_topic_batch")]
    pub batch_size: u32,
    #[serde(default = "default_topic_max")]
    pub max_topics_per_batch: usize,
}

impl Default for TopicSummaryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            batch_size: default_topic_batch(),
            max_topics_per_batch: default_topic_max(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DreamConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_dream_idle")]
    pub idle_minutes: u64,
    #[serde(default = "default_dream_iterations")]
    pub max_iterations: u32,
    #[serde(default = "default_min_summary_chars")]
    pub min_summary_chars: usize,
    #[serde(default = "default_max_merged_chars")]
    pub max_merged_summary_chars: usize,
}

impl Default for DreamConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            idle_minutes: default_dream_idle(),
            max_iterations: default_dream_iterations(),
            min_summary_chars: default_min_summary_chars(),
            max_merged_summary_chars: default_max_merged_chars(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannerConfig {
    #[serde(default = "bool_true")]
    pub enabled: bool,
    /// `heuristic` | `llm`.
    #[serde(default = "default_planner_mode")]
    pub mode: String,
    #[serde(default = "default_planner_timeout")]
    pub llm_timeout_seconds: u64,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            mode: default_planner_mode(),
            llm_timeout_seconds: default_planner_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresearchConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Keywords that short-circuit the classifier to "needs search".
    #[serde(default)]
    pub trigger_keywords: Vec<String>,
    #[serde(default = "default_presearch_cache")]
    pub classify_cache_entries: usize,
    #[serde(default = "default_presearch_ttl")]
    pub classify_cache_ttl_seconds: u64,
    #[serde(default = "bool_true")]
    pub allow_tool_refine: bool,
    #[serde(default = "default_refine_rounds")]
    pub max_refine_rounds: u32,
    #[serde(default = "default_dup_similarity")]
    pub duplicate_similarity: f64,
}

impl Default for PresearchConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            trigger_keywords: Vec::new(),
            classify_cache_entries: default_presearch_cache(),
            classify_cache_ttl_seconds: default_presearch_ttl(),
            allow_tool_refine: true,
            max_refine_rounds: default_refine_rounds(),
            duplicate_similarity: default_dup_similarity(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProactiveConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Groups eligible for proactive replies; empty = all.
    #[serde(default)]
    pub whitelist: Vec<String>,
    #[serde(default)]
    pub keywords: Vec<String>,
    /// Semantic-path trigger probability in [0, 1]. 0 disables the path.
    #[serde(default)]
    pub rate: f64,
    /// Outer probability gate applied to every proactive candidate.
    #[serde(default = "default_one")]
    pub active_reply_probability: f64,
    #[serde(default = "default_heat_threshold")]
    pub heat_threshold: u32,
    #[serde(default = "default_proactive_cooldown")]
    pub cooldown_seconds: u64,
    #[serde(default = "default_proactive_messages")]
    pub cooldown_messages: u32,
    #[serde(default = "default_keyword_cooldown")]
    pub keyword_cooldown_seconds: u64,
    /// Messages this short (and without images) never trigger semantically.
    #[serde(default = "default_ignore_len")]
    pub ignore_len: usize,
    #[serde(default = "default_judge_context")]
    pub judge_context_messages: usize,
    #[serde(default = "default_judge_retries")]
    pub judge_max_retries: u32,
    #[serde(default = "default_judge_timeout")]
    pub judge_timeout_seconds: u64,
    #[serde(default = "default_heat_decay")]
    pub heat_decay_seconds: u64,
}

impl Default for ProactiveConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            whitelist: Vec::new(),
            keywords: Vec::new(),
            rate: 0.0,
            active_reply_probability: 1.0,
            heat_threshold: default_heat_threshold(),
            cooldown_seconds: default_proactive_cooldown(),
            cooldown_messages: default_proactive_messages(),
            keyword_cooldown_seconds: default_keyword_cooldown(),
            ignore_len: default_ignore_len(),
            judge_context_messages: default_judge_context(),
            judge_max_retries: default_judge_retries(),
            judge_timeout_seconds: default_judge_timeout(),
            heat_decay_seconds: default_heat_decay(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceConfig {
    #[serde(default = "bool_true")]
    pub enabled: bool,
    #[serde(default = "default_trace_retention")]
    pub retention_days: u32,
    #[serde(default = "default_trace_rows")]
    pub max_rows: u32,
}

impl Default for TraceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            retention_days: default_trace_retention(),
            max_rows: default_trace_rows(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardConfig {
    #[serde(default = "bool_true")]
    pub enabled: bool,
    /// `annotate` | `strip`.
    #[serde(default = "default_guard_action")]
    pub action: String,
    /// Custom pattern set; empty uses the built-in defaults.
    #[serde(default)]
    pub patterns: Vec<String>,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            action: default_guard_action(),
            patterns: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaConfig {
    /// `none` | `caption` | `images` — default when the request itself
    /// carries no images.
    #[serde(default = "default_media_policy")]
    pub policy_default: String,
    #[serde(default)]
    pub caption_enabled: bool,
    #[serde(default = "default_caption_max")]
    pub history_image_two_stage_max: usize,
    #[serde(default = "default_max_images")]
    pub max_images: usize,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            policy_default: default_media_policy(),
            caption_enabled: false,
            history_image_two_stage_max: default_caption_max(),
            max_images: default_max_images(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ErrorsConfig {
    /// Overrides for the user-facing error templates (`{name}` placeholder).
    #[serde(default)]
    pub templates: BTreeMap<String, String>,
    /// Replies equal to one of these are treated as empty (relay fallback
    /// strings some proxies substitute for an empty completion).
    #[serde(default)]
    pub proxy_fallback_sentinels: Vec<String>,
}

fn bool_true() -> bool {
    true
}
fn default_one() -> f64 {
    1.0
}
fn default_bot_name() -> String {
    "Mika".to_string()
}
fn default_provider() -> String {
    "openai_compat".to_string()
}
fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}
fn default_model() -> String {
    "gpt-4o-mini".to_string()
}
fn default_temperature() -> f64 {
    0.7
}
fn default_max_tokens() -> u32 {
    2048
}
fn default_key_cooldown() -> u64 {
    60
}
fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.mika/mika.db", home)
}
fn default_context_mode() -> String {
    "structured".to_string()
}
fn default_max_turns() -> usize {
    30
}
fn default_max_tokens_soft() -> i64 {
    12_000
}
fn default_hard_max_messages() -> usize {
    160
}
fn default_body_max_bytes() -> usize {
    512 * 1024
}
fn default_snapshot_messages() -> usize {
    200
}
fn default_snapshot_cache() -> usize {
    64
}
fn default_transcript_lines() -> usize {
    120
}
fn default_line_chars() -> usize {
    240
}
fn default_timeout_seconds() -> u64 {
    120
}
fn default_timeout_retries() -> u32 {
    1
}
fn default_timeout_retry_delay() -> f64 {
    0.6
}
fn default_empty_retries() -> u32 {
    1
}
fn default_empty_retry_delay() -> f64 {
    0.4
}
fn default_degrade_max_level() -> u8 {
    2
}
fn default_degrade_delay() -> f64 {
    1.0
}
fn default_degrade_l1() -> usize {
    20
}
fn default_degrade_l2() -> usize {
    5
}
fn default_tool_rounds() -> u32 {
    5
}
fn default_tool_timeout() -> u64 {
    30
}
fn default_cache_ttl() -> u64 {
    180
}
fn default_cache_entries() -> usize {
    256
}
fn default_schema_mode() -> String {
    "auto".to_string()
}
fn default_schema_auto_threshold() -> usize {
    12
}
fn default_schema_fallback_ttl() -> u64 {
    600
}
fn default_result_chars() -> usize {
    6000
}
fn default_retrieval_iterations() -> u32 {
    4
}
fn default_retrieval_timeout() -> u64 {
    20
}
fn default_extract_interval() -> u32 {
    10
}
fn default_max_facts() -> usize {
    5
}
fn default_memory_top_k() -> usize {
    5
}
fn default_topic_batch() -> u32 {
    30
}
fn default_topic_max() -> usize {
    3
}
fn default_dream_idle() -> u64 {
    30
}
fn default_dream_iterations() -> u32 {
    20
}
fn default_min_summary_chars() -> usize {
    24
}
fn default_max_merged_chars() -> usize {
    2000
}
fn default_planner_mode() -> String {
    "heuristic".to_string()
}
fn default_planner_timeout() -> u64 {
    8
}
fn default_presearch_cache() -> usize {
    128
}
fn default_presearch_ttl() -> u64 {
    300
}
fn default_refine_rounds() -> u32 {
    2
}
fn default_dup_similarity() -> f64 {
    0.9
}
fn default_heat_threshold() -> u32 {
    5
}
fn default_proactive_cooldown() -> u64 {
    180
}
fn default_proactive_messages() -> u32 {
    8
}
fn default_keyword_cooldown() -> u64 {
    60
}
fn default_ignore_len() -> usize {
    6
}
fn default_judge_context() -> usize {
    15
}
fn default_judge_retries() -> u32 {
    1
}
fn default_judge_timeout() -> u64 {
    10
}
fn default_heat_decay() -> u64 {
    120
}
fn default_guard_action() -> String {
    "annotate".to_string()
}
fn default_media_policy() -> String {
    "caption".to_string()
}
fn default_caption_max() -> usize {
    3
}
fn default_max_images() -> usize {
    4
}
fn default_trace_retention() -> u32 {
    7
}
fn default_trace_rows() -> u32 {
    20_000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_usable() {
        let cfg = MikaConfig::default();
        assert_eq!(cfg.context.mode, "structured");
        assert_eq!(cfg.tools.max_rounds, 5);
        assert!(cfg.trace.enabled);
        assert_eq!(cfg.llm.filter_model(), cfg.llm.model);
    }

    #[test]
    fn toml_overrides_nest_per_section() {
        let cfg: MikaConfig = Figment::new()
            .merge(Toml::string(
                r#"
                [context]
                max_turns = 7
                mode = "legacy"

                [llm]
                provider = "anthropic"
                api_keys = ["k1", "k2"]
                "#,
            ))
            .extract()
            .unwrap();
        assert_eq!(cfg.context.max_turns, 7);
        assert_eq!(cfg.context.mode, "legacy");
        assert_eq!(cfg.llm.provider, "anthropic");
        assert_eq!(cfg.llm.api_keys.len(), 2);
    }
}
