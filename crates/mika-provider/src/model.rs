//! Internal request/response model shared by all provider adapters.
//!
//! The internal shape is OpenAI-style; adapters translate it to the wire
//! format of the configured provider and parse responses back into it.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use mika_core::message::{ChatMessage, MessageContent, ToolCall};

/// Provider wire-format family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    OpenaiCompat,
    Anthropic,
    GoogleGenai,
}

impl ProviderKind {
    /// Unknown configured values fall back to OpenAI-compatible mode.
    pub fn detect(configured: &str) -> Self {
        match configured.trim().to_ascii_lowercase().as_str() {
            "anthropic" => ProviderKind::Anthropic,
            "google_genai" => ProviderKind::GoogleGenai,
            _ => ProviderKind::OpenaiCompat,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::OpenaiCompat => "openai_compat",
            ProviderKind::Anthropic => "anthropic",
            ProviderKind::GoogleGenai => "google_genai",
        }
    }
}

/// Tool definition in the internal (OpenAI) shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    /// JSON Schema of the arguments object.
    pub parameters: Value,
}

/// Internal completion request.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub tools: Vec<ToolSpec>,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u32>,
    pub stream: bool,
    pub response_format: Option<Value>,
}

impl CompletionRequest {
    pub fn new(model: impl Into<String>, messages: Vec<ChatMessage>) -> Self {
        Self {
            model: model.into(),
            messages,
            tools: Vec::new(),
            temperature: None,
            max_tokens: None,
            stream: false,
            response_format: None,
        }
    }
}

/// A fully prepared HTTP request for one provider.
#[derive(Debug, Clone)]
pub struct PreparedRequest {
    pub provider: ProviderKind,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub query: Vec<(String, String)>,
    pub body: Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

/// Provider response normalized back into the internal shape.
#[derive(Debug, Clone)]
pub struct ParsedResponse {
    pub assistant: ChatMessage,
    pub tool_calls: Vec<ToolCall>,
    pub content: String,
    pub finish_reason: String,
    pub reasoning_content: Option<String>,
    pub usage: Usage,
    pub response_id: String,
}

impl ParsedResponse {
    pub fn is_empty_content(&self) -> bool {
        self.content.trim().is_empty()
    }
}

/// Why a completion ended up empty; attached to the reply for tracing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmptyReplyKind {
    ProviderEmpty,
    ReasoningOnlyEmpty,
    EmptyWithToolCalls,
}

impl EmptyReplyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EmptyReplyKind::ProviderEmpty => "provider_empty",
            EmptyReplyKind::ReasoningOnlyEmpty => "reasoning_only_empty",
            EmptyReplyKind::EmptyWithToolCalls => "empty_with_tool_calls",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmptyReplyMeta {
    pub kind: EmptyReplyKind,
    pub finish_reason: String,
    pub local_retries: u32,
    pub response_id: String,
    pub phase: String,
    pub request_id: String,
    pub model: String,
}

/// Final transport outcome handed to the orchestrator.
#[derive(Debug, Clone)]
pub struct CompletionReply {
    pub assistant: ChatMessage,
    pub tool_calls: Vec<ToolCall>,
    /// The key that served the request (callers track rotation).
    pub api_key: String,
    pub usage: Usage,
    pub finish_reason: String,
    pub empty_meta: Option<EmptyReplyMeta>,
}

impl CompletionReply {
    pub fn content_text(&self) -> String {
        self.assistant.content.to_text()
    }
}

/// Content part flattened for wire translation.
#[derive(Debug, Clone, PartialEq)]
pub enum WirePart {
    Text(String),
    Image(String),
}

/// Flatten [`MessageContent`] to wire-translatable parts, dropping empty
/// text and internal-only metadata.
pub fn normalize_wire_parts(content: &MessageContent) -> Vec<WirePart> {
    match content {
        MessageContent::Text(text) => {
            let trimmed = text.trim();
            if trimmed.is_empty() {
                Vec::new()
            } else {
                vec![WirePart::Text(trimmed.to_string())]
            }
        }
        MessageContent::Parts(parts) => {
            let mut out = Vec::new();
            for part in parts {
                match part {
                    mika_core::message::ContentPart::Text { text } => {
                        let trimmed = text.trim();
                        if !trimmed.is_empty() {
                            out.push(WirePart::Text(trimmed.to_string()));
                        }
                    }
                    mika_core::message::ContentPart::ImageUrl { image_url, .. } => {
                        let url = image_url.url.trim();
                        if !url.is_empty() {
                            out.push(WirePart::Image(url.to_string()));
                        }
                    }
                }
            }
            out
        }
    }
}

/// Decode `data:<mime>;base64,<payload>` into (mime, payload).
pub fn data_url_to_inline(url: &str) -> Option<(String, String)> {
    if !url.starts_with("data:") {
        return None;
    }
    let (header, payload) = url.split_once(',')?;
    let mime = header
        .strip_prefix("data:")?
        .split(';')
        .next()
        .filter(|m| !m.is_empty())
        .unwrap_or("image/jpeg");
    Some((mime.to_string(), payload.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use mika_core::message::{ContentPart, ImageUrl};

    #[test]
    fn unknown_provider_falls_back_to_openai_compat() {
        assert_eq!(ProviderKind::detect("azure"), ProviderKind::OpenaiCompat);
        assert_eq!(ProviderKind::detect("ANTHROPIC"), ProviderKind::Anthropic);
    }

    #[test]
    fn wire_parts_drop_empty_text() {
        let content = MessageContent::Parts(vec![
            ContentPart::Text { text: "  ".into() },
            ContentPart::ImageUrl {
                image_url: ImageUrl {
                    url: "https://x/a.png".into(),
                },
                media_semantic: None,
            },
        ]);
        assert_eq!(
            normalize_wire_parts(&content),
            vec![WirePart::Image("https://x/a.png".into())]
        );
    }

    #[test]
    fn data_url_decodes_mime_and_payload() {
        let (mime, payload) = data_url_to_inline("data:image/png;base64,QUJD").unwrap();
        assert_eq!(mime, "image/png");
        assert_eq!(payload, "QUJD");
        assert!(data_url_to_inline("https://x/a.png").is_none());
    }
}
