//! Platform-neutral inbound event and outbound action contracts.
//!
//! Adapters convert native platform events into [`EventEnvelope`] and consume
//! [`OutboundAction`]. The envelope is immutable once created and its JSON
//! encoding is stable (round-trippable).

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Author of an inbound message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Author {
    pub id: String,
    #[serde(default)]
    pub nickname: String,
    #[serde(default)]
    pub role: String,
}

/// One segment of an inbound message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EnvelopePart {
    Text {
        text: String,
    },
    Mention {
        target_id: String,
    },
    Reply {
        ref_message_id: String,
    },
    Image {
        /// Platform asset reference (file id, URL, or data URL).
        asset_ref: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        emoji_id: Option<String>,
    },
}

/// Immutable inbound chat event produced by a platform adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub schema_version: u32,
    pub session_id: String,
    pub platform: String,
    pub protocol: String,
    pub message_id: String,
    /// Unix timestamp in seconds.
    pub timestamp: f64,
    pub author: Author,
    #[serde(default)]
    pub content_parts: Vec<EnvelopePart>,
    #[serde(default)]
    pub meta: BTreeMap<String, Value>,
    #[serde(default)]
    pub raw: Value,
    /// The bot's own platform id, if the adapter knows it.
    #[serde(default)]
    pub bot_self_id: String,
    /// Group id when the event came from a group room.
    #[serde(default)]
    pub group_id: String,
    /// Set by the adapter when the message directly addresses the bot.
    #[serde(default)]
    pub is_tome: bool,
}

impl EventEnvelope {
    /// True when the event was emitted by the bot itself (echo of our own
    /// send, or author id equals the bot's id).
    pub fn is_self_message(&self) -> bool {
        let post_type = self
            .meta
            .get("post_type")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .trim()
            .to_ascii_lowercase();
        if post_type == "message_sent" {
            return true;
        }
        let sent_type = self
            .meta
            .get("message_sent_type")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .trim()
            .to_ascii_lowercase();
        if sent_type == "self" {
            return true;
        }
        let bot = self.bot_self_id.trim();
        let author = self.author.id.trim();
        !bot.is_empty() && !author.is_empty() && bot == author
    }

    pub fn is_group(&self) -> bool {
        !self.group_id.trim().is_empty()
    }

    pub fn is_private(&self) -> bool {
        !self.is_self_message() && !self.is_group() && !self.author.id.trim().is_empty()
    }

    /// True when the message @-mentions the bot (or the adapter marked it
    /// as directly addressed). Self messages never count.
    pub fn is_at_me(&self) -> bool {
        if self.is_self_message() || !self.is_group() {
            return false;
        }
        if self.is_tome {
            return true;
        }
        let bot = self.bot_self_id.trim();
        if bot.is_empty() {
            return false;
        }
        self.content_parts.iter().any(|part| {
            matches!(part, EnvelopePart::Mention { target_id } if target_id.trim() == bot)
        })
    }

    /// Concatenated plain text of all text parts.
    pub fn plaintext(&self) -> String {
        let mut out = String::new();
        for part in &self.content_parts {
            if let EnvelopePart::Text { text } = part {
                if !out.is_empty() && !text.is_empty() {
                    out.push(' ');
                }
                out.push_str(text);
            }
        }
        out.trim().to_string()
    }

    pub fn has_image(&self) -> bool {
        self.content_parts
            .iter()
            .any(|p| matches!(p, EnvelopePart::Image { .. }))
    }

    /// Up to `max` image asset refs, in message order.
    pub fn image_refs(&self, max: usize) -> Vec<String> {
        let mut refs = Vec::new();
        if max == 0 {
            return refs;
        }
        for part in &self.content_parts {
            if let EnvelopePart::Image { asset_ref, .. } = part {
                let item = asset_ref.trim();
                if item.is_empty() {
                    continue;
                }
                refs.push(item.to_string());
                if refs.len() >= max {
                    break;
                }
            }
        }
        refs
    }
}

/// Action the core hands back to the platform adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundAction {
    SendMessage {
        session_id: String,
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reply_to_message_id: Option<String>,
    },
    Noop,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_envelope() -> EventEnvelope {
        EventEnvelope {
            schema_version: 1,
            session_id: "group:1001".into(),
            platform: "onebot".into(),
            protocol: "v11".into(),
            message_id: "m-1".into(),
            timestamp: 1_700_000_000.0,
            author: Author {
                id: "42".into(),
                nickname: "Alice".into(),
                role: "member".into(),
            },
            content_parts: vec![
                EnvelopePart::Text {
                    text: "hello".into(),
                },
                EnvelopePart::Mention {
                    target_id: "bot-9".into(),
                },
                EnvelopePart::Image {
                    asset_ref: "https://example.com/a.png".into(),
                    emoji_id: None,
                },
            ],
            meta: BTreeMap::new(),
            raw: Value::Null,
            bot_self_id: "bot-9".into(),
            group_id: "1001".into(),
            is_tome: false,
        }
    }

    #[test]
    fn json_round_trip_is_lossless() {
        let env = sample_envelope();
        let json = serde_json::to_string(&env).unwrap();
        let back: EventEnvelope = serde_json::from_str(&json).unwrap();
        assert_eq!(back, env);
    }

    #[test]
    fn mention_of_bot_counts_as_at_me() {
        let env = sample_envelope();
        assert!(env.is_at_me());
    }

    #[test]
    fn self_message_detected_from_meta() {
        let mut env = sample_envelope();
        env.meta
            .insert("post_type".into(), Value::String("message_sent".into()));
        assert!(env.is_self_message());
        assert!(!env.is_at_me());
    }

    #[test]
    fn image_refs_respect_limit() {
        let env = sample_envelope();
        assert_eq!(env.image_refs(3), vec!["https://example.com/a.png"]);
        assert!(env.image_refs(0).is_empty());
    }
}
