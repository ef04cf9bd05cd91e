//! Per-request working-set trimming.
//!
//! `legacy` mode only normalizes and caps; `structured` mode additionally
//! keeps the last N user-delimited turns and drops oldest turns while the
//! token estimate exceeds the soft budget.

use mika_core::message::{estimate_message_tokens, ChatMessage, Role};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextMode {
    Legacy,
    Structured,
}

impl ContextMode {
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "legacy" => ContextMode::Legacy,
            _ => ContextMode::Structured,
        }
    }
}

pub struct ContextManager {
    mode: ContextMode,
    max_turns: usize,
    max_tokens_soft: usize,
    hard_max_messages: usize,
}

impl ContextManager {
    pub fn new(mode: ContextMode, max_turns: usize, max_tokens_soft: usize, hard_max_messages: usize) -> Self {
        Self {
            mode,
            max_turns: max_turns.max(1),
            max_tokens_soft,
            hard_max_messages: hard_max_messages.max(10),
        }
    }

    /// Hard cap + dangling tool-block repair.
    pub fn normalize(&self, messages: Vec<ChatMessage>) -> Vec<ChatMessage> {
        let mut normalized = messages;
        if normalized.len() > self.hard_max_messages {
            normalized.drain(..normalized.len() - self.hard_max_messages);
        }
        fix_dangling_tool_blocks(normalized)
    }

    pub fn process(&self, messages: Vec<ChatMessage>) -> Vec<ChatMessage> {
        let normalized = self.normalize(messages);
        if self.mode == ContextMode::Legacy {
            return normalized;
        }
        let mut truncated = truncate_by_turns(normalized, self.max_turns);
        if self.max_tokens_soft > 0 {
            truncated = truncate_by_soft_tokens(truncated, self.max_tokens_soft);
        }
        fix_dangling_tool_blocks(truncated)
    }
}

/// Split on `user` boundaries; everything after a user message up to the
/// next one belongs to that turn.
fn split_turns(messages: Vec<ChatMessage>) -> Vec<Vec<ChatMessage>> {
    let mut turns: Vec<Vec<ChatMessage>> = Vec::new();
    let mut current: Vec<ChatMessage> = Vec::new();
    for msg in messages {
        if msg.role == Role::User {
            if !current.is_empty() {
                turns.push(std::mem::take(&mut current));
            }
            current.push(msg);
        } else {
            current.push(msg);
        }
    }
    if !current.is_empty() {
        turns.push(current);
    }
    turns
}

fn flatten(turns: Vec<Vec<ChatMessage>>) -> Vec<ChatMessage> {
    turns.into_iter().flatten().collect()
}

fn truncate_by_turns(messages: Vec<ChatMessage>, keep_turns: usize) -> Vec<ChatMessage> {
    let turns = split_turns(messages);
    if turns.len() <= keep_turns {
        return flatten(turns);
    }
    let skip = turns.len() - keep_turns;
    flatten(turns.into_iter().skip(skip).collect())
}

fn turn_tokens(turns: &[Vec<ChatMessage>]) -> usize {
    turns
        .iter()
        .flat_map(|turn| turn.iter())
        .map(estimate_message_tokens)
        .sum()
}

fn truncate_by_soft_tokens(messages: Vec<ChatMessage>, soft_limit: usize) -> Vec<ChatMessage> {
    let mut turns = split_turns(messages);
    while turns.len() > 1 && turn_tokens(&turns) > soft_limit {
        turns.remove(0);
    }
    flatten(turns)
}

/// Drop tool messages with no preceding assistant tool-call context and
/// assistant tool-call messages appearing before any user message.
fn fix_dangling_tool_blocks(messages: Vec<ChatMessage>) -> Vec<ChatMessage> {
    let mut fixed: Vec<ChatMessage> = Vec::new();
    let mut seen_user = false;
    let mut seen_assistant_tool_call = false;

    for msg in messages {
        match msg.role {
            Role::User => {
                seen_user = true;
                seen_assistant_tool_call = false;
                fixed.push(msg);
            }
            Role::Assistant => {
                if msg.has_tool_calls() {
                    if !seen_user {
                        continue;
                    }
                    seen_assistant_tool_call = true;
                }
                fixed.push(msg);
            }
            Role::Tool => {
                if !seen_user {
                    continue;
                }
                if !seen_assistant_tool_call && fixed.is_empty() {
                    continue;
                }
                fixed.push(msg);
            }
            Role::System => fixed.push(msg),
        }
    }

    while fixed
        .first()
        .map(|m| m.role == Role::Tool)
        .unwrap_or(false)
    {
        fixed.remove(0);
    }
    fixed
}

#[cfg(test)]
mod tests {
    use super::*;
    use mika_core::message::{ToolCall, ToolCallFunction};

    fn tool_call_msg() -> ChatMessage {
        let mut msg = ChatMessage::assistant("");
        msg.tool_calls = Some(vec![ToolCall {
            id: "c1".into(),
            r#type: "function".into(),
            function: ToolCallFunction {
                name: "web_search".into(),
                arguments: "{}".into(),
            },
        }]);
        msg
    }

    #[test]
    fn orphan_tool_message_at_head_is_dropped() {
        let manager = ContextManager::new(ContextMode::Structured, 30, 0, 160);
        let messages = vec![
            ChatMessage::tool_result("c0", "web_search", "stale"),
            ChatMessage::user("q"),
            ChatMessage::assistant("a"),
        ];
        let out = manager.process(messages);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].role, Role::User);
    }

    #[test]
    fn tool_chain_after_user_survives() {
        let manager = ContextManager::new(ContextMode::Structured, 30, 0, 160);
        let messages = vec![
            ChatMessage::user("q"),
            tool_call_msg(),
            ChatMessage::tool_result("c1", "web_search", "R"),
            ChatMessage::assistant("a"),
        ];
        let out = manager.process(messages.clone());
        assert_eq!(out.len(), 4);
    }

    #[test]
    fn turn_truncation_keeps_latest_turns() {
        let manager = ContextManager::new(ContextMode::Structured, 2, 0, 160);
        let mut messages = Vec::new();
        for i in 0..5 {
            messages.push(ChatMessage::user(format!("q{}", i)));
            messages.push(ChatMessage::assistant(format!("a{}", i)));
        }
        let out = manager.process(messages);
        assert_eq!(out.len(), 4);
        assert_eq!(out[0].content.to_text(), "q3");
    }

    #[test]
    fn soft_token_budget_drops_oldest_turns_but_keeps_one() {
        let manager = ContextManager::new(ContextMode::Structured, 30, 10, 160);
        let long = "word ".repeat(50);
        let messages = vec![
            ChatMessage::user(long.clone()),
            ChatMessage::assistant(long.clone()),
            ChatMessage::user(long.clone()),
            ChatMessage::assistant(long),
        ];
        let out = manager.process(messages);
        // Over budget, but the last turn is never dropped.
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].role, Role::User);
    }

    #[test]
    fn legacy_mode_only_normalizes() {
        let manager = ContextManager::new(ContextMode::Legacy, 1, 1, 160);
        let messages = vec![
            ChatMessage::user("q1"),
            ChatMessage::assistant("a1"),
            ChatMessage::user("q2"),
        ];
        assert_eq!(manager.process(messages).len(), 3);
    }
}
