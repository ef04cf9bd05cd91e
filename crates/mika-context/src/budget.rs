//! Outgoing-request budget enforcement.
//!
//! After assembly the request is estimated in tokens and JSON bytes; when
//! over either budget the transcript block is shrunk through fixed ratios
//! until both fit or the ratios are exhausted.

use tracing::warn;

use mika_core::message::{estimate_message_tokens, ChatMessage, MessageContent};

use crate::transcript::{shrink_transcript_block, TRANSCRIPT_HEADER};

pub const SHRINK_RATIOS: [f64; 3] = [0.7, 0.5, 0.3];

pub fn estimate_request_tokens(messages: &[ChatMessage]) -> usize {
    messages.iter().map(estimate_message_tokens).sum()
}

pub fn estimate_body_bytes(messages: &[ChatMessage]) -> usize {
    serde_json::to_vec(messages).map(|v| v.len()).unwrap_or(0)
}

/// Resolve the soft token budget; non-positive configs pick a default from
/// the model family's usable context.
pub fn resolve_soft_tokens(configured: i64, model: &str) -> usize {
    if configured > 0 {
        return configured as usize;
    }
    let model = model.to_ascii_lowercase();
    if model.contains("gemini") {
        24_000
    } else if model.contains("claude") {
        16_000
    } else {
        12_000
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BudgetOutcome {
    pub tokens: usize,
    pub bytes: usize,
    pub applied_ratio: Option<f64>,
    pub satisfied: bool,
}

fn within(messages: &[ChatMessage], max_tokens: usize, max_bytes: usize) -> (usize, usize, bool) {
    let tokens = estimate_request_tokens(messages);
    let bytes = estimate_body_bytes(messages);
    (tokens, bytes, tokens <= max_tokens && bytes <= max_bytes)
}

/// Shrink the transcript block (when present) until the request fits both
/// budgets. Mutates `messages` in place.
pub fn enforce_budgets(
    messages: &mut [ChatMessage],
    max_tokens_soft: usize,
    max_body_bytes: usize,
) -> BudgetOutcome {
    let (tokens, bytes, ok) = within(messages, max_tokens_soft, max_body_bytes);
    if ok {
        return BudgetOutcome {
            tokens,
            bytes,
            applied_ratio: None,
            satisfied: true,
        };
    }

    let transcript_index = messages.iter().position(|m| match &m.content {
        MessageContent::Text(text) => text.contains(TRANSCRIPT_HEADER),
        MessageContent::Parts(_) => false,
    });

    let Some(index) = transcript_index else {
        warn!(tokens, bytes, "request over budget and no transcript block to shrink");
        return BudgetOutcome {
            tokens,
            bytes,
            applied_ratio: None,
            satisfied: false,
        };
    };

    for ratio in SHRINK_RATIOS {
        if let MessageContent::Text(text) = &messages[index].content {
            let shrunk = shrink_transcript_block(text, ratio);
            messages[index].content = MessageContent::Text(shrunk.text);
        }
        let (tokens, bytes, ok) = within(messages, max_tokens_soft, max_body_bytes);
        if ok {
            return BudgetOutcome {
                tokens,
                bytes,
                applied_ratio: Some(ratio),
                satisfied: true,
            };
        }
    }

    let (tokens, bytes, _) = within(messages, max_tokens_soft, max_body_bytes);
    warn!(tokens, bytes, "request still over budget after all shrink ratios");
    BudgetOutcome {
        tokens,
        bytes,
        applied_ratio: Some(SHRINK_RATIOS[SHRINK_RATIOS.len() - 1]),
        satisfied: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transcript::build_transcript_block;

    #[test]
    fn under_budget_is_untouched() {
        let mut messages = vec![ChatMessage::system("sys"), ChatMessage::user("hi")];
        let outcome = enforce_budgets(&mut messages, 10_000, 1_000_000);
        assert!(outcome.satisfied);
        assert_eq!(outcome.applied_ratio, None);
    }

    #[test]
    fn oversized_transcript_shrinks_through_ratios() {
        // 400 lines x ~100 chars each overflows a 12k-token budget.
        let lines: Vec<String> = (0..400)
            .map(|i| format!("User{}: {}", i, "呱".repeat(100)))
            .collect();
        let block = build_transcript_block(&lines);
        let mut messages = vec![
            ChatMessage::system(block.text),
            ChatMessage::user("question"),
        ];
        let before_tokens = estimate_request_tokens(&messages);
        assert!(before_tokens > 12_000);

        let outcome = enforce_budgets(&mut messages, 12_000, 10_000_000);
        assert!(outcome.satisfied);
        assert!(outcome.applied_ratio.is_some());
        assert!(outcome.tokens <= 12_000);
        // The newest line always survives.
        assert!(messages[0].content.to_text().contains("User399"));
    }

    #[test]
    fn no_transcript_block_reports_unsatisfied() {
        let mut messages = vec![ChatMessage::user("呱".repeat(50_000))];
        let outcome = enforce_budgets(&mut messages, 100, 1_000_000);
        assert!(!outcome.satisfied);
        assert_eq!(outcome.applied_ratio, None);
    }

    #[test]
    fn model_family_defaults_apply_when_unset() {
        assert_eq!(resolve_soft_tokens(0, "gemini-2.0-flash"), 24_000);
        assert_eq!(resolve_soft_tokens(-1, "claude-sonnet"), 16_000);
        assert_eq!(resolve_soft_tokens(500, "anything"), 500);
    }
}
