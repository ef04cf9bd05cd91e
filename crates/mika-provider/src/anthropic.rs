//! Anthropic Messages API translation.
//!
//! System texts join into the top-level `system`, tool results become
//! `tool_result` user blocks, assistant tool calls become `tool_use`
//! blocks, and the response is folded back into OpenAI-style tool calls.

use serde::Deserialize;
use serde_json::{json, Value};

use mika_core::message::{ChatMessage, Role, ToolCall, ToolCallFunction};

use crate::model::{
    data_url_to_inline, normalize_wire_parts, CompletionRequest, ParsedResponse, PreparedRequest,
    ProviderKind, Usage, WirePart,
};

const API_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 1024;

fn parse_arguments(raw: &str) -> Value {
    match serde_json::from_str::<Value>(raw) {
        Ok(value) if value.is_object() => value,
        // Unparseable argument strings are wrapped so the call still carries
        // the payload the model produced.
        _ => json!({ "input": raw }),
    }
}

pub fn build_request(
    base_url: &str,
    model: &str,
    api_key: &str,
    req: &CompletionRequest,
    extra_headers: &[(String, String)],
    default_temperature: f64,
) -> PreparedRequest {
    let mut system_chunks: Vec<String> = Vec::new();
    let mut messages: Vec<Value> = Vec::new();

    for msg in &req.messages {
        match msg.role {
            Role::System => {
                for part in normalize_wire_parts(&msg.content) {
                    if let WirePart::Text(text) = part {
                        system_chunks.push(text);
                    }
                }
            }
            Role::Tool => {
                messages.push(json!({
                    "role": "user",
                    "content": [{
                        "type": "tool_result",
                        "tool_use_id": msg.tool_call_id.clone().unwrap_or_default(),
                        "content": msg.content.to_text(),
                        "is_error": false,
                    }],
                }));
            }
            Role::User | Role::Assistant => {
                let mut blocks: Vec<Value> = Vec::new();
                for part in normalize_wire_parts(&msg.content) {
                    match part {
                        WirePart::Text(text) => blocks.push(json!({"type": "text", "text": text})),
                        WirePart::Image(url) => match data_url_to_inline(&url) {
                            Some((mime, data)) => blocks.push(json!({
                                "type": "image",
                                "source": {"type": "base64", "media_type": mime, "data": data},
                            })),
                            // Remote URLs degrade to a textual marker.
                            None => blocks.push(json!({"type": "text", "text": format!("[image] {}", url)})),
                        },
                    }
                }

                if msg.role == Role::Assistant {
                    for call in msg.tool_calls.iter().flatten() {
                        if call.function.name.trim().is_empty() {
                            continue;
                        }
                        blocks.push(json!({
                            "type": "tool_use",
                            "id": call.id,
                            "name": call.function.name,
                            "input": parse_arguments(&call.function.arguments),
                        }));
                    }
                }

                if !blocks.is_empty() {
                    let role = if msg.role == Role::Assistant {
                        "assistant"
                    } else {
                        "user"
                    };
                    messages.push(json!({"role": role, "content": blocks}));
                }
            }
        }
    }

    let mut body = json!({
        "model": model,
        "max_tokens": req.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
        "temperature": req.temperature.unwrap_or(default_temperature),
        "messages": messages,
        "stream": req.stream,
    });
    if !system_chunks.is_empty() {
        body["system"] = json!(system_chunks.join("\n\n"));
    }
    if !req.tools.is_empty() {
        body["tools"] = json!(req
            .tools
            .iter()
            .map(|t| json!({
                "name": t.name,
                "description": t.description,
                "input_schema": t.parameters,
            }))
            .collect::<Vec<_>>());
    }

    let mut headers = vec![
        ("x-api-key".to_string(), api_key.to_string()),
        ("anthropic-version".to_string(), API_VERSION.to_string()),
        ("Content-Type".to_string(), "application/json".to_string()),
    ];
    headers.extend(extra_headers.iter().cloned());

    PreparedRequest {
        provider: ProviderKind::Anthropic,
        url: format!("{}/messages", base_url.trim_end_matches('/')),
        headers,
        query: Vec::new(),
        body,
    }
}

// Anthropic API response types (private — only used for deserialization)

#[derive(Deserialize)]
struct ApiResponse {
    #[serde(default)]
    id: String,
    #[serde(default)]
    content: Vec<ContentBlock>,
    #[serde(default)]
    stop_reason: Option<String>,
    #[serde(default)]
    usage: Option<ApiUsage>,
}

#[derive(Deserialize)]
#[serde(tag = "type")]
enum ContentBlock {
    #[serde(rename = "text")]
    Text { text: String },
    /// Extended-thinking block; surfaced as reasoning_content, never as
    /// user-visible text.
    #[serde(rename = "thinking")]
    Thinking { thinking: String },
    #[serde(rename = "tool_use")]
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Deserialize)]
struct ApiUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

pub fn parse_response(data: &Value) -> Result<ParsedResponse, serde_json::Error> {
    let resp: ApiResponse = serde_json::from_value(data.clone())?;

    let mut text_chunks: Vec<String> = Vec::new();
    let mut thinking_chunks: Vec<String> = Vec::new();
    let mut tool_calls: Vec<ToolCall> = Vec::new();

    for (index, block) in resp.content.into_iter().enumerate() {
        match block {
            ContentBlock::Text { text } => {
                if !text.is_empty() {
                    text_chunks.push(text);
                }
            }
            ContentBlock::Thinking { thinking } => {
                if !thinking.trim().is_empty() {
                    thinking_chunks.push(thinking);
                }
            }
            ContentBlock::ToolUse { id, name, input } => {
                if name.trim().is_empty() {
                    continue;
                }
                tool_calls.push(ToolCall {
                    id: if id.is_empty() {
                        format!("anthropic_tool_{}", index)
                    } else {
                        id
                    },
                    r#type: "function".to_string(),
                    function: ToolCallFunction {
                        name,
                        arguments: serde_json::to_string(&input).unwrap_or_else(|_| "{}".into()),
                    },
                });
            }
            ContentBlock::Unknown => {}
        }
    }

    let content = text_chunks.join("\n").trim().to_string();
    let reasoning_content = if thinking_chunks.is_empty() {
        None
    } else {
        Some(thinking_chunks.join("\n"))
    };

    let mut assistant = ChatMessage::text(Role::Assistant, content.clone());
    if !tool_calls.is_empty() {
        assistant.tool_calls = Some(tool_calls.clone());
    }
    assistant.reasoning_content = reasoning_content.clone();

    let usage = resp
        .usage
        .map(|u| Usage {
            prompt_tokens: u.input_tokens,
            completion_tokens: u.output_tokens,
            total_tokens: u.input_tokens + u.output_tokens,
        })
        .unwrap_or_default();

    Ok(ParsedResponse {
        assistant,
        tool_calls,
        content,
        finish_reason: resp.stop_reason.unwrap_or_default(),
        reasoning_content,
        usage,
        response_id: resp.id,
    })
}
