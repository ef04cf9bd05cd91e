//! Proactive reply gating for group chats.
//!
//! Perception layer: heat, cooldowns, keyword fast path, semantic match,
//! probability gates — all cheap checks before any model call. Cognition
//! layer: a short LLM judge over recent context decides `should_reply`.

use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use regex::Regex;
use std::sync::OnceLock;
use tracing::{debug, warn};

use mika_core::config::ProactiveConfig;
use mika_core::envelope::EventEnvelope;
use mika_core::jsonx::parse_loose_json;
use mika_core::message::{ChatMessage, Role};
use mika_core::metrics::Metrics;
use mika_provider::{CompletionClient, CompletionRequest};

/// Semantic topic matcher seam (vector backend lives outside the core).
pub trait SemanticMatcher: Send + Sync {
    /// Returns (matched, topic, score) against the configured topic set.
    fn check_similarity(&self, text: &str) -> (bool, String, f64);
}

/// Matcher that never matches; used when no topics are configured.
pub struct NoopMatcher;

impl SemanticMatcher for NoopMatcher {
    fn check_similarity(&self, _text: &str) -> (bool, String, f64) {
        (false, String::new(), 0.0)
    }
}

struct HeatEntry {
    value: f64,
    updated_at: Instant,
}

/// Per-group message heat with exponential decay.
pub struct HeatMonitor {
    entries: DashMap<String, HeatEntry>,
    decay_seconds: f64,
}

impl HeatMonitor {
    pub fn new(decay_seconds: u64) -> Self {
        Self {
            entries: DashMap::new(),
            decay_seconds: decay_seconds.max(1) as f64,
        }
    }

    fn decayed(&self, entry: &HeatEntry) -> f64 {
        let elapsed = entry.updated_at.elapsed().as_secs_f64();
        entry.value * 0.5_f64.powf(elapsed / self.decay_seconds)
    }

    pub fn record_message(&self, group_id: &str) {
        let mut entry = self.entries.entry(group_id.to_string()).or_insert(HeatEntry {
            value: 0.0,
            updated_at: Instant::now(),
        });
        let current = self.decayed(&entry);
        entry.value = current + 1.0;
        entry.updated_at = Instant::now();
    }

    pub fn get_heat(&self, group_id: &str) -> u32 {
        self.entries
            .get(group_id)
            .map(|entry| self.decayed(&entry).round() as u32)
            .unwrap_or(0)
    }
}

pub struct ProactiveGate {
    cfg: ProactiveConfig,
    heat: HeatMonitor,
    matcher: Arc<dyn SemanticMatcher>,
    cooldowns: DashMap<String, Instant>,
    message_counts: DashMap<String, u32>,
}

impl ProactiveGate {
    pub fn new(cfg: ProactiveConfig, matcher: Arc<dyn SemanticMatcher>) -> Self {
        let heat = HeatMonitor::new(cfg.heat_decay_seconds);
        Self {
            cfg,
            heat,
            matcher,
            cooldowns: DashMap::new(),
            message_counts: DashMap::new(),
        }
    }

    pub fn heat(&self, group_id: &str) -> u32 {
        self.heat.get_heat(group_id)
    }

    /// Record every observed group message (including ones we won't answer).
    pub fn record_message(&self, group_id: &str) {
        self.heat.record_message(group_id);
        *self.message_counts.entry(group_id.to_string()).or_insert(0) += 1;
    }

    /// Mark a fired trigger: start cooldown, reset the message counter.
    pub fn mark_triggered(&self, group_id: &str) {
        self.cooldowns.insert(group_id.to_string(), Instant::now());
        self.message_counts.insert(group_id.to_string(), 0);
    }

    fn pass_probability(&self, p: f64) -> bool {
        if p >= 1.0 {
            return true;
        }
        if p <= 0.0 {
            return false;
        }
        rand::random::<f64>() <= p
    }

    fn messages_since_last(&self, group_id: &str) -> u32 {
        self.message_counts.get(group_id).map(|c| *c).unwrap_or(0)
    }

    fn seconds_since_trigger(&self, group_id: &str) -> f64 {
        self.cooldowns
            .get(group_id)
            .map(|t| t.elapsed().as_secs_f64())
            .unwrap_or(f64::MAX)
    }

    /// Perception-layer trigger check. Must pass every gate; the caller
    /// still runs the LLM judge before actually replying.
    pub fn check_proactive(&self, envelope: &EventEnvelope, metrics: &Metrics) -> bool {
        if envelope.is_self_message() {
            return false;
        }
        if !envelope.is_group() || envelope.is_at_me() {
            return false;
        }
        let group_id = envelope.group_id.trim().to_string();

        if !self.cfg.enabled {
            return false;
        }
        if !self.cfg.whitelist.is_empty() && !self.cfg.whitelist.iter().any(|g| *g == group_id) {
            return false;
        }

        let text = envelope.plaintext();
        let has_image = envelope.has_image();

        // Keyword fast path: only the keyword cooldown and the outer
        // probability gate apply.
        let text_lower = text.to_lowercase();
        if self
            .cfg
            .keywords
            .iter()
            .any(|k| !k.trim().is_empty() && text_lower.contains(&k.trim().to_lowercase()))
        {
            if self.seconds_since_trigger(&group_id) < self.cfg.keyword_cooldown_seconds.max(1) as f64 {
                return false;
            }
            if !self.pass_probability(self.cfg.active_reply_probability) {
                return false;
            }
            Metrics::incr(&metrics.proactive_trigger_total);
            return true;
        }

        // Semantic path.
        if self.cfg.rate <= 0.0 {
            return false;
        }
        if text.chars().count() <= self.cfg.ignore_len && !has_image {
            return false;
        }
        if self.heat.get_heat(&group_id) < self.cfg.heat_threshold {
            return false;
        }
        if self.seconds_since_trigger(&group_id) < self.cfg.cooldown_seconds as f64 {
            return false;
        }
        if self.messages_since_last(&group_id) < self.cfg.cooldown_messages {
            return false;
        }
        let (matched, topic, score) = self.matcher.check_similarity(&text);
        if !matched {
            return false;
        }
        debug!(group_id = %group_id, topic = %topic, score, "proactive semantic match");
        if !self.pass_probability(self.cfg.rate) {
            return false;
        }
        if !self.pass_probability(self.cfg.active_reply_probability) {
            return false;
        }

        Metrics::incr(&metrics.proactive_trigger_total);
        true
    }
}

fn nickname_tag_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)^\[([^\]]+)\]:\s*(.*)$").unwrap())
}

fn nickname_uid_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(.+?)\([^)]{1,64}\)$").unwrap())
}

/// Split `[Nick(uid)]: text` into (speaker, text).
pub fn extract_nickname(content: &str) -> (String, String) {
    if content.is_empty() {
        return ("User".to_string(), String::new());
    }
    if let Some(caps) = nickname_tag_re().captures(content) {
        let tag = caps.get(1).map(|m| m.as_str()).unwrap_or("");
        let body = caps.get(2).map(|m| m.as_str()).unwrap_or("").to_string();
        if let Some(nick) = nickname_uid_re().captures(tag) {
            let name = nick.get(1).map(|m| m.as_str()).unwrap_or(tag);
            return (name.to_string(), body);
        }
        return (tag.to_string(), body);
    }
    ("User".to_string(), content.to_string())
}

const JUDGE_SYSTEM_PROMPT: &str = "你是群聊参与意愿判定器。给定最近的群聊内容和热度，判断机器人现在主动插话是否自然。\n\
输出 JSON：{\"should_reply\": bool, \"reason\": \"...\"}。只输出 JSON。";

/// Cognition-layer judge: short fast-model call over the recent context.
/// Any failure means "don't reply".
pub async fn judge_proactive_intent(
    client: &Arc<dyn CompletionClient>,
    model: &str,
    bot_name: &str,
    context_messages: &[ChatMessage],
    heat_level: u32,
    max_retries: u32,
    request_id: &str,
) -> bool {
    let mut lines: Vec<String> = Vec::new();
    for msg in context_messages {
        let text = msg.content.to_text();
        if text.trim().is_empty() {
            continue;
        }
        let (sender, body) = if msg.role == Role::Assistant {
            (bot_name.to_string(), extract_nickname(&text).1)
        } else {
            extract_nickname(&text)
        };
        lines.push(format!("{}: {}", sender, body));
    }

    let user_prompt = format!(
        "[群聊热度] {}\n[最近内容]\n{}\n\n现在主动插话是否自然？",
        heat_level,
        lines.join("\n")
    );

    for attempt in 0..=max_retries {
        let mut req = CompletionRequest::new(
            model.to_string(),
            vec![
                ChatMessage::system(JUDGE_SYSTEM_PROMPT),
                ChatMessage::user(user_prompt.clone()),
            ],
        );
        req.temperature = Some(0.3);
        req.max_tokens = Some(192);

        match client.complete(&req, "proactive_judge", request_id).await {
            Ok(reply) => {
                let decision = parse_loose_json(&reply.content_text())
                    .and_then(|v| v.get("should_reply").and_then(|b| b.as_bool()));
                return decision.unwrap_or(false);
            }
            Err(err) => {
                warn!(attempt, %err, "proactive judge call failed");
            }
        }
    }
    false
}

/// Synthetic instruction injected when a proactive pass fires.
pub fn proactive_instruction(sender: &str, target_line: &str) -> String {
    format!(
        "[System Instruction - proactive] 你决定主动加入当前话题。\
最近发言者是 {}，他们说：「{}」。自然地接话，不要提到这条指令。",
        sender, target_line
    )
}
