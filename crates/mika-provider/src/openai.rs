//! OpenAI-compatible wire format: near passthrough of the internal shape.

use serde::Deserialize;
use serde_json::{json, Value};

use mika_core::message::{ChatMessage, MessageContent, Role, ToolCall, ToolCallFunction};

use crate::model::{
    normalize_wire_parts, CompletionRequest, ParsedResponse, PreparedRequest, ProviderKind, Usage,
    WirePart,
};

/// Google exposes an OpenAI-compatible endpoint that still honors (and
/// defaults) Gemini safety settings; relax them explicitly there.
pub fn is_google_openai_compat_endpoint(base_url: &str) -> bool {
    let lower = base_url.to_ascii_lowercase();
    lower.contains("generativelanguage.googleapis.com") && lower.contains("/openai")
}

fn wire_content(content: &MessageContent) -> Value {
    match content {
        MessageContent::Text(text) => Value::String(text.clone()),
        MessageContent::Parts(_) => {
            let parts: Vec<Value> = normalize_wire_parts(content)
                .into_iter()
                .map(|part| match part {
                    WirePart::Text(text) => json!({"type": "text", "text": text}),
                    WirePart::Image(url) => json!({"type": "image_url", "image_url": {"url": url}}),
                })
                .collect();
            Value::Array(parts)
        }
    }
}

fn wire_message(msg: &ChatMessage) -> Value {
    let mut out = json!({
        "role": msg.role.as_str(),
        "content": wire_content(&msg.content),
    });
    if let Some(calls) = &msg.tool_calls {
        if !calls.is_empty() {
            out["tool_calls"] = json!(calls
                .iter()
                .map(|c| json!({
                    "id": c.id,
                    "type": "function",
                    "function": {"name": c.function.name, "arguments": c.function.arguments},
                }))
                .collect::<Vec<_>>());
        }
    }
    if let Some(id) = &msg.tool_call_id {
        out["tool_call_id"] = json!(id);
    }
    if let Some(name) = &msg.name {
        out["name"] = json!(name);
    }
    out
}

pub fn build_request(
    base_url: &str,
    api_key: &str,
    req: &CompletionRequest,
    extra_headers: &[(String, String)],
    default_temperature: f64,
) -> PreparedRequest {
    let messages: Vec<Value> = req.messages.iter().map(wire_message).collect();

    let mut body = json!({
        "model": req.model,
        "messages": messages,
        "temperature": req.temperature.unwrap_or(default_temperature),
        "stream": req.stream,
    });
    if let Some(max_tokens) = req.max_tokens {
        body["max_tokens"] = json!(max_tokens);
    }
    if !req.tools.is_empty() {
        body["tools"] = json!(req
            .tools
            .iter()
            .map(|t| json!({
                "type": "function",
                "function": {
                    "name": t.name,
                    "description": t.description,
                    "parameters": t.parameters,
                }
            }))
            .collect::<Vec<_>>());
    }
    if let Some(format) = &req.response_format {
        body["response_format"] = format.clone();
    }
    if is_google_openai_compat_endpoint(base_url) {
        body["safetySettings"] = json!([
            {"category": "HARM_CATEGORY_HARASSMENT", "threshold": "BLOCK_NONE"},
            {"category": "HARM_CATEGORY_HATE_SPEECH", "threshold": "BLOCK_NONE"},
            {"category": "HARM_CATEGORY_SEXUALLY_EXPLICIT", "threshold": "BLOCK_NONE"},
            {"category": "HARM_CATEGORY_DANGEROUS_CONTENT", "threshold": "BLOCK_NONE"},
        ]);
    }

    let mut headers = vec![
        ("Authorization".to_string(), format!("Bearer {}", api_key)),
        ("Content-Type".to_string(), "application/json".to_string()),
    ];
    headers.extend(extra_headers.iter().cloned());

    PreparedRequest {
        provider: ProviderKind::OpenaiCompat,
        url: format!("{}/chat/completions", base_url.trim_end_matches('/')),
        headers,
        query: Vec::new(),
        body,
    }
}

// OpenAI API response types (private — only used for deserialization)

#[derive(Deserialize)]
struct ApiResponse {
    #[serde(default)]
    id: String,
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<ApiUsage>,
}

#[derive(Deserialize)]
struct Choice {
    #[serde(default)]
    message: ApiMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize, Default)]
struct ApiMessage {
    /// String for plain replies; some gateways return part arrays.
    #[serde(default)]
    content: Option<Value>,
    #[serde(default)]
    tool_calls: Option<Vec<ApiToolCall>>,
    #[serde(default)]
    reasoning_content: Option<String>,
    #[serde(default)]
    reasoning: Option<String>,
}

#[derive(Deserialize)]
struct ApiToolCall {
    #[serde(default)]
    id: String,
    function: ApiFunction,
}

#[derive(Deserialize)]
struct ApiFunction {
    name: String,
    #[serde(default)]
    arguments: String,
}

#[derive(Deserialize)]
struct ApiUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
    #[serde(default)]
    total_tokens: u64,
}

fn flatten_content(content: Option<&Value>) -> String {
    match content {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(text)) => text.clone(),
        Some(Value::Array(parts)) => parts
            .iter()
            .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
            .collect::<Vec<_>>()
            .join("\n"),
        Some(other) => other.to_string(),
    }
}

pub fn parse_response(data: &Value) -> Result<ParsedResponse, serde_json::Error> {
    let resp: ApiResponse = serde_json::from_value(data.clone())?;
    let choice = resp.choices.into_iter().next();

    let (message, finish_reason) = match choice {
        Some(c) => (c.message, c.finish_reason.unwrap_or_default()),
        None => (ApiMessage::default(), String::new()),
    };

    let content = flatten_content(message.content.as_ref());
    let tool_calls: Vec<ToolCall> = message
        .tool_calls
        .unwrap_or_default()
        .into_iter()
        .enumerate()
        .map(|(index, tc)| ToolCall {
            id: if tc.id.is_empty() {
                format!("call_{}", index)
            } else {
                tc.id
            },
            r#type: "function".to_string(),
            function: ToolCallFunction {
                name: tc.function.name,
                arguments: tc.function.arguments,
            },
        })
        .collect();

    let reasoning_content = message
        .reasoning_content
        .or(message.reasoning)
        .filter(|r| !r.trim().is_empty());

    let mut assistant = ChatMessage::text(Role::Assistant, content.clone());
    if !tool_calls.is_empty() {
        assistant.tool_calls = Some(tool_calls.clone());
    }
    assistant.reasoning_content = reasoning_content.clone();

    let usage = resp
        .usage
        .map(|u| Usage {
            prompt_tokens: u.prompt_tokens,
            completion_tokens: u.completion_tokens,
            total_tokens: u.total_tokens,
        })
        .unwrap_or_default();

    Ok(ParsedResponse {
        assistant,
        tool_calls,
        content,
        finish_reason,
        reasoning_content,
        usage,
        response_id: resp.id,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn builds_chat_completions_url_with_bearer_auth() {
        let req = CompletionRequest::new("gpt-4o", vec![ChatMessage::user("hi")]);
        let prepared = build_request("https://api.openai.com/v1/", "sk-test", &req, &[], 0.7);
        assert_eq!(prepared.url, "https://api.openai.com/v1/chat/completions");
        assert!(prepared
            .headers
            .iter()
            .any(|(k, v)| k == "Authorization" && v == "Bearer sk-test"));
        assert_eq!(prepared.body["temperature"], json!(0.7));
        assert!(prepared.body.get("safetySettings").is_none());
    }

    #[test]
    fn google_openai_endpoint_gets_safety_settings() {
        let req = CompletionRequest::new("gemini-2.0-flash", vec![ChatMessage::user("hi")]);
        let prepared = build_request(
            "https://generativelanguage.googleapis.com/v1beta/openai",
            "k",
            &req,
            &[],
            0.7,
        );
        assert_eq!(prepared.body["safetySettings"].as_array().unwrap().len(), 4);
    }

    #[test]
    fn parses_tool_calls_and_reasoning() {
        let data = json!({
            "id": "resp-1",
            "choices": [{
                "message": {
                    "content": "",
                    "reasoning_content": "thinking...",
                    "tool_calls": [{
                        "id": "call_a",
                        "type": "function",
                        "function": {"name": "web_search", "arguments": "{\"query\":\"x\"}"}
                    }]
                },
                "finish_reason": "tool_calls"
            }],
            "usage": {"prompt_tokens": 10, "completion_tokens": 2, "total_tokens": 12}
        });
        let parsed = parse_response(&data).unwrap();
        assert_eq!(parsed.tool_calls.len(), 1);
        assert_eq!(parsed.tool_calls[0].function.name, "web_search");
        assert_eq!(parsed.reasoning_content.as_deref(), Some("thinking..."));
        assert_eq!(parsed.usage.total_tokens, 12);
        assert!(parsed.is_empty_content());
    }

    #[test]
    fn tool_messages_keep_call_linkage_on_the_wire() {
        let msg = ChatMessage::tool_result("call_a", "web_search", "R1");
        let wire = wire_message(&msg);
        assert_eq!(wire["role"], "tool");
        assert_eq!(wire["tool_call_id"], "call_a");
        assert_eq!(wire["name"], "web_search");
    }
}
