//! Google GenAI (`generateContent`) translation.

use serde_json::{json, Value};

use mika_core::message::{ChatMessage, Role, ToolCall, ToolCallFunction};

use crate::model::{
    data_url_to_inline, normalize_wire_parts, CompletionRequest, ParsedResponse, PreparedRequest,
    ProviderKind, Usage, WirePart,
};

fn parse_arguments(raw: &str) -> Value {
    match serde_json::from_str::<Value>(raw) {
        Ok(value) if value.is_object() => value,
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
    let mut contents: Vec<Value> = Vec::new();

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
                let name = msg
                    .name
                    .clone()
                    .filter(|n| !n.trim().is_empty())
                    .unwrap_or_else(|| "tool".to_string());
                contents.push(json!({
                    "role": "user",
                    "parts": [{
                        "functionResponse": {
                            "name": name,
                            "response": {"content": msg.content.to_text()},
                        }
                    }],
                }));
            }
            Role::User | Role::Assistant => {
                let genai_role = if msg.role == Role::Assistant {
                    "model"
                } else {
                    "user"
                };
                let mut parts: Vec<Value> = Vec::new();
                for part in normalize_wire_parts(&msg.content) {
                    match part {
                        WirePart::Text(text) => parts.push(json!({"text": text})),
                        WirePart::Image(url) => match data_url_to_inline(&url) {
                            Some((mime, data)) => parts.push(json!({
                                "inline_data": {"mime_type": mime, "data": data},
                            })),
                            None => parts.push(json!({"text": format!("[image] {}", url)})),
                        },
                    }
                }
                if msg.role == Role::Assistant {
                    for call in msg.tool_calls.iter().flatten() {
                        if call.function.name.trim().is_empty() {
                            continue;
                        }
                        parts.push(json!({
                            "functionCall": {
                                "name": call.function.name,
                                "args": parse_arguments(&call.function.arguments),
                            }
                        }));
                    }
                }
                if !parts.is_empty() {
                    contents.push(json!({"role": genai_role, "parts": parts}));
                }
            }
        }
    }

    let mut generation_config = json!({
        "temperature": req.temperature.unwrap_or(default_temperature),
    });
    if let Some(max_tokens) = req.max_tokens {
        generation_config["maxOutputTokens"] = json!(max_tokens);
    }

    let mut body = json!({
        "contents": contents,
        "generationConfig": generation_config,
    });
    if !system_chunks.is_empty() {
        body["systemInstruction"] = json!({"parts": [{"text": system_chunks.join("\n\n")}]});
    }
    if !req.tools.is_empty() {
        body["tools"] = json!([{
            "functionDeclarations": req
                .tools
                .iter()
                .map(|t| json!({
                    "name": t.name,
                    "description": t.description,
                    "parameters": t.parameters,
                }))
                .collect::<Vec<_>>()
        }]);
    }

    let mut headers = vec![("Content-Type".to_string(), "application/json".to_string())];
    headers.extend(extra_headers.iter().cloned());

    PreparedRequest {
        provider: ProviderKind::GoogleGenai,
        url: format!(
            "{}/models/{}:generateContent",
            base_url.trim_end_matches('/'),
            model
        ),
        headers,
        query: vec![("key".to_string(), api_key.to_string())],
        body,
    }
}

pub fn parse_response(data: &Value) -> Result<ParsedResponse, serde_json::Error> {
    let candidate = data
        .get("candidates")
        .and_then(|c| c.as_array())
        .and_then(|c| c.first())
        .cloned()
        .unwrap_or(Value::Null);
    let parts = candidate
        .pointer("/content/parts")
        .and_then(|p| p.as_array())
        .cloned()
        .unwrap_or_default();

    let mut text_chunks: Vec<String> = Vec::new();
    let mut tool_calls: Vec<ToolCall> = Vec::new();

    for (index, part) in parts.iter().enumerate() {
        if let Some(text) = part.get("text").and_then(|t| t.as_str()) {
            if !text.trim().is_empty() {
                text_chunks.push(text.to_string());
            }
        }
        if let Some(call) = part.get("functionCall").filter(|c| c.is_object()) {
            let name = call
                .get("name")
                .and_then(|n| n.as_str())
                .unwrap_or("")
                .trim()
                .to_string();
            if name.is_empty() {
                continue;
            }
            let args = call.get("args").cloned().unwrap_or_else(|| json!({}));
            tool_calls.push(ToolCall {
                id: format!("genai_tool_{}", index),
                r#type: "function".to_string(),
                function: ToolCallFunction {
                    name,
                    arguments: serde_json::to_string(&args).unwrap_or_else(|_| "{}".into()),
                },
            });
        }
    }

    let content = text_chunks.join("\n").trim().to_string();
    let mut assistant = ChatMessage::text(Role::Assistant, content.clone());
    if !tool_calls.is_empty() {
        assistant.tool_calls = Some(tool_calls.clone());
    }

    let usage = Usage {
        prompt_tokens: data
            .pointer("/usageMetadata/promptTokenCount")
            .and_then(|v| v.as_u64())
            .unwrap_or(0),
        completion_tokens: data
            .pointer("/usageMetadata/candidatesTokenCount")
            .and_then(|v| v.as_u64())
            .unwrap_or(0),
        total_tokens: data
            .pointer("/usageMetadata/totalTokenCount")
            .and_then(|v| v.as_u64())
            .unwrap_or(0),
    };

    Ok(ParsedResponse {
        assistant,
        tool_calls,
        content,
        finish_reason: candidate
            .get("finishReason")
            .and_then(|f| f.as_str())
            .unwrap_or("")
            .to_string(),
        reasoning_content: None,
        usage,
        response_id: data
            .get("responseId")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string(),
    })
}
