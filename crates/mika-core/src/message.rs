//! Internal OpenAI-style message schema shared by the whole pipeline.
//!
//! Everything the core archives or sends to a provider is a [`ChatMessage`].
//! Provider adapters translate this shape to the wire; the context layer
//! normalizes whatever it reads back from storage into it.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::media::MediaSemantic;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }
}

/// `{type: "text"|"image_url", ...}` content part.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text {
        text: String,
    },
    ImageUrl {
        image_url: ImageUrl,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        media_semantic: Option<MediaSemantic>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageUrl {
    pub url: String,
}

/// Message content: plain string or a part list. Untagged so both archived
/// encodings deserialize.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl Default for MessageContent {
    fn default() -> Self {
        MessageContent::Text(String::new())
    }
}

impl MessageContent {
    /// Flatten to plain text; image parts become their media placeholder.
    pub fn to_text(&self) -> String {
        match self {
            MessageContent::Text(text) => text.clone(),
            MessageContent::Parts(parts) => {
                let mut chunks: Vec<String> = Vec::new();
                for part in parts {
                    match part {
                        ContentPart::Text { text } => {
                            if !text.is_empty() {
                                chunks.push(text.clone());
                            }
                        }
                        ContentPart::ImageUrl { media_semantic, .. } => {
                            chunks.push(crate::media::placeholder(media_semantic.as_ref()));
                        }
                    }
                }
                chunks.join(" ").trim().to_string()
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            MessageContent::Text(text) => text.trim().is_empty(),
            MessageContent::Parts(parts) => parts.is_empty(),
        }
    }
}

/// One tool invocation requested by the model (OpenAI shape).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    #[serde(default = "default_call_type")]
    pub r#type: String,
    pub function: ToolCallFunction,
}

fn default_call_type() -> String {
    "function".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallFunction {
    pub name: String,
    /// Raw JSON string as transmitted on the wire.
    pub arguments: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    #[serde(default)]
    pub content: MessageContent,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_content: Option<String>,
}

impl ChatMessage {
    pub fn text(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            content: MessageContent::Text(text.into()),
            message_id: None,
            timestamp: None,
            user_id: None,
            tool_calls: None,
            tool_call_id: None,
            name: None,
            reasoning_content: None,
        }
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self::text(Role::System, text)
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::text(Role::User, text)
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::text(Role::Assistant, text)
    }

    pub fn tool_result(tool_call_id: impl Into<String>, name: impl Into<String>, text: impl Into<String>) -> Self {
        let mut msg = Self::text(Role::Tool, text);
        msg.tool_call_id = Some(tool_call_id.into());
        msg.name = Some(name.into());
        msg
    }

    pub fn has_tool_calls(&self) -> bool {
        self.tool_calls.as_ref().is_some_and(|c| !c.is_empty())
    }
}

/// Parse archived content: JSON part lists were stored as strings, plain
/// text stays as-is.
pub fn parse_archived_content(raw: &str) -> MessageContent {
    let text = raw.trim();
    if text.starts_with('[') || text.starts_with('{') {
        if let Ok(parts) = serde_json::from_str::<Vec<ContentPart>>(text) {
            return MessageContent::Parts(parts);
        }
        if let Ok(value) = serde_json::from_str::<Value>(text) {
            if let Some(s) = value.as_str() {
                return MessageContent::Text(s.to_string());
            }
        }
    }
    MessageContent::Text(raw.to_string())
}

/// Rough token estimate: 1 token per CJK char, chars/4 for the rest.
/// Matches the archival budget heuristic; no tokenizer dependency.
pub fn estimate_text_tokens(text: &str) -> usize {
    let mut cjk = 0usize;
    let mut other = 0usize;
    for ch in text.chars() {
        let code = ch as u32;
        if (0x4E00..=0x9FFF).contains(&code)
            || (0x3040..=0x30FF).contains(&code)
            || (0xAC00..=0xD7AF).contains(&code)
        {
            cjk += 1;
        } else {
            other += 1;
        }
    }
    cjk + other.div_ceil(4)
}

/// Token estimate for a full message, including tool-call payloads.
pub fn estimate_message_tokens(msg: &ChatMessage) -> usize {
    let mut total = 4; // per-message framing overhead
    total += estimate_text_tokens(&msg.content.to_text());
    if let Some(calls) = &msg.tool_calls {
        for call in calls {
            total += estimate_text_tokens(&call.function.name);
            total += estimate_text_tokens(&call.function.arguments);
        }
    }
    if let Some(reasoning) = &msg.reasoning_content {
        total += estimate_text_tokens(reasoning);
    }
    total
}
