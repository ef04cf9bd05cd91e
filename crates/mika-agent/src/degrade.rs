//! Empty-reply context degradation.
//!
//! Level 0 sends the full working set; level 1 keeps a ~20-message tail;
//! level 2 keeps ~5. Degraded levels mask configured sensitive terms when
//! the history comes from persistent storage (always the case here).
//! Levels only ever increase within one request.

use mika_core::config::DegradeConfig;
use mika_core::message::{ChatMessage, ContentPart, MessageContent};

pub const MASK: &str = "***";

/// Working-set tail for a degradation level.
pub fn tail_for_level(messages: Vec<ChatMessage>, level: u8, cfg: &DegradeConfig) -> Vec<ChatMessage> {
    let keep = match level {
        0 => return messages,
        1 => cfg.level1_tail_messages.max(1),
        _ => cfg.level2_tail_messages.max(1),
    };
    if messages.len() <= keep {
        return messages;
    }
    messages[messages.len() - keep..].to_vec()
}

pub fn mask_text(text: &str, terms: &[String]) -> String {
    let mut out = text.to_string();
    for term in terms {
        let term = term.trim();
        if !term.is_empty() {
            out = out.replace(term, MASK);
        }
    }
    out
}

/// Mask sensitive terms across a message list (degraded levels).
pub fn mask_messages(messages: &mut [ChatMessage], terms: &[String]) {
    if terms.iter().all(|t| t.trim().is_empty()) {
        return;
    }
    for msg in messages {
        match &mut msg.content {
            MessageContent::Text(text) => *text = mask_text(text, terms),
            MessageContent::Parts(parts) => {
                for part in parts {
                    if let ContentPart::Text { text } = part {
                        *text = mask_text(text, terms);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn history(n: usize) -> Vec<ChatMessage> {
        (0..n).map(|i| ChatMessage::user(format!("m{}", i))).collect()
    }

    #[test]
    fn level_zero_keeps_everything() {
        let cfg = DegradeConfig::default();
        assert_eq!(tail_for_level(history(100), 0, &cfg).len(), 100);
    }

    #[test]
    fn levels_shrink_monotonically() {
        let cfg = DegradeConfig::default();
        let l1 = tail_for_level(history(100), 1, &cfg);
        let l2 = tail_for_level(history(100), 2, &cfg);
        assert_eq!(l1.len(), cfg.level1_tail_messages);
        assert_eq!(l2.len(), cfg.level2_tail_messages);
        assert!(l2.len() < l1.len());
        // The newest message survives every level.
        assert_eq!(l2.last().unwrap().content.to_text(), "m99");
    }

    #[test]
    fn masking_replaces_terms() {
        let mut messages = vec![ChatMessage::user("机密项目代号是 Alpha")];
        mask_messages(&mut messages, &["Alpha".to_string()]);
        assert_eq!(messages[0].content.to_text(), "机密项目代号是 ***");
    }
}
