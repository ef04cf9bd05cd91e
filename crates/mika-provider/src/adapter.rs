//! Dispatch between the internal request shape and provider wire formats.

use serde_json::Value;

use crate::model::{CompletionRequest, ParsedResponse, PreparedRequest, ProviderKind};
use crate::{anthropic, google, openai};

pub fn build_provider_request(
    provider: ProviderKind,
    base_url: &str,
    model: &str,
    api_key: &str,
    req: &CompletionRequest,
    extra_headers: &[(String, String)],
    default_temperature: f64,
) -> PreparedRequest {
    match provider {
        ProviderKind::OpenaiCompat => {
            openai::build_request(base_url, api_key, req, extra_headers, default_temperature)
        }
        ProviderKind::Anthropic => {
            anthropic::build_request(base_url, model, api_key, req, extra_headers, default_temperature)
        }
        ProviderKind::GoogleGenai => {
            google::build_request(base_url, model, api_key, req, extra_headers, default_temperature)
        }
    }
}

pub fn parse_provider_response(
    provider: ProviderKind,
    data: &Value,
) -> Result<ParsedResponse, serde_json::Error> {
    match provider {
        ProviderKind::OpenaiCompat => openai::parse_response(data),
        ProviderKind::Anthropic => anthropic::parse_response(data),
        ProviderKind::GoogleGenai => google::parse_response(data),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mika_core::message::ChatMessage;
    use serde_json::json;

    /// Round-trip law: internal messages → anthropic wire → parsed response
    /// keeps the OpenAI-internal assistant shape.
    #[test]
    fn anthropic_round_trip_preserves_internal_shape() {
        let req = CompletionRequest::new(
            "claude-sonnet",
            vec![ChatMessage::system("sys"), ChatMessage::user("question")],
        );
        let prepared = build_provider_request(
            ProviderKind::Anthropic,
            "https://api.anthropic.com/v1",
            "claude-sonnet",
            "k",
            &req,
            &[],
            0.7,
        );
        assert_eq!(prepared.provider, ProviderKind::Anthropic);

        let wire_response = json!({
            "id": "msg_rt",
            "content": [
                {"type": "text", "text": "answer"},
                {"type": "tool_use", "id": "t1", "name": "web_search", "input": {"query": "q"}}
            ],
            "stop_reason": "tool_use",
            "usage": {"input_tokens": 1, "output_tokens": 2}
        });
        let parsed = parse_provider_response(ProviderKind::Anthropic, &wire_response).unwrap();
        assert_eq!(parsed.assistant.role, mika_core::message::Role::Assistant);
        assert_eq!(parsed.assistant.content.to_text(), "answer");
        let calls = parsed.assistant.tool_calls.as_ref().unwrap();
        assert_eq!(calls[0].function.name, "web_search");
        // Arguments are re-stringified JSON, as the internal schema demands.
        let args: Value = serde_json::from_str(&calls[0].function.arguments).unwrap();
        assert_eq!(args["query"], "q");
    }
}
