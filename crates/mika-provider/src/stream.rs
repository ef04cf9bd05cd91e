//! SSE streaming for OpenAI-compatible endpoints.
//!
//! Text deltas are dispatched through a callback. Tool-call deltas are not
//! processed mid-stream: the outcome flags them so the caller can fall
//! back to the non-streaming path.

use serde::Deserialize;
use tracing::{debug, warn};

use mika_core::error::MikaError;

use crate::adapter::build_provider_request;
use crate::model::{CompletionRequest, ProviderKind, Usage};
use crate::transport::Transport;

#[derive(Debug, PartialEq)]
pub enum SseParsed {
    Event(String),
    Data(String),
}

pub fn parse_sse_line(line: &str) -> Option<SseParsed> {
    let line = line.trim();
    if let Some(rest) = line.strip_prefix("event:") {
        return Some(SseParsed::Event(rest.trim().to_string()));
    }
    if let Some(rest) = line.strip_prefix("data:") {
        return Some(SseParsed::Data(rest.trim().to_string()));
    }
    None
}

#[derive(Debug, Default)]
pub struct StreamOutcome {
    pub text: String,
    pub finish_reason: String,
    /// Tool calls appeared in the deltas; caller must redo the request
    /// non-streaming.
    pub tool_calls_detected: bool,
    pub usage: Usage,
}

#[derive(Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    usage: Option<StreamUsage>,
}

#[derive(Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize, Default)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<serde_json::Value>,
}

#[derive(Deserialize)]
struct StreamUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

impl Transport {
    /// Stream a completion, invoking `on_delta` for each text fragment.
    /// Only the OpenAI-compatible wire format supports this.
    pub async fn send_api_request_stream(
        &self,
        req: &CompletionRequest,
        api_key: &str,
        on_delta: &(dyn for<'a> Fn(&'a str) + Send + Sync),
    ) -> Result<StreamOutcome, MikaError> {
        if self.provider() != ProviderKind::OpenaiCompat {
            return Err(MikaError::Internal(format!(
                "streaming not supported for provider {}",
                self.provider().as_str()
            )));
        }

        let mut stream_req = req.clone();
        stream_req.stream = true;
        let prepared = build_provider_request(
            ProviderKind::OpenaiCompat,
            self.base_url_for_stream(),
            &stream_req.model,
            api_key,
            &stream_req,
            self.extra_headers_for_stream(),
            self.default_temperature_for_stream(),
        );

        let mut builder = self.http_client().post(&prepared.url).json(&prepared.body);
        for (key, value) in &prepared.headers {
            builder = builder.header(key.as_str(), value.as_str());
        }
        let resp = builder
            .send()
            .await
            .map_err(|e| MikaError::Network(e.to_string()))?;
        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let message = resp.text().await.unwrap_or_default();
            return Err(MikaError::Api { status, message });
        }

        let mut outcome = StreamOutcome::default();
        let mut line_buf = String::new();

        use futures_util::StreamExt;
        let mut byte_stream = resp.bytes_stream();

        'outer: while let Some(chunk) = byte_stream.next().await {
            let chunk = chunk.map_err(|e| MikaError::Network(e.to_string()))?;
            let Ok(text) = std::str::from_utf8(&chunk) else {
                continue;
            };
            line_buf.push_str(text);

            // Process complete lines; keep the trailing partial line buffered.
            let mut rest = String::new();
            {
                let mut lines: Vec<&str> = line_buf.split('\n').collect();
                if let Some(last) = lines.pop() {
                    rest = last.to_string();
                }
                for line in lines {
                    let Some(SseParsed::Data(data)) = parse_sse_line(line) else {
                        continue;
                    };
                    if data == "[DONE]" {
                        break 'outer;
                    }
                    let Ok(chunk_resp) = serde_json::from_str::<StreamChunk>(&data) else {
                        continue;
                    };
                    if let Some(usage) = &chunk_resp.usage {
                        outcome.usage.prompt_tokens = usage.prompt_tokens;
                        outcome.usage.completion_tokens = usage.completion_tokens;
                        outcome.usage.total_tokens = usage.prompt_tokens + usage.completion_tokens;
                    }
                    for choice in &chunk_resp.choices {
                        if choice.delta.tool_calls.is_some() {
                            warn!("tool calls in stream deltas, falling back to non-streaming");
                            outcome.tool_calls_detected = true;
                            break 'outer;
                        }
                        if let Some(reason) = &choice.finish_reason {
                            if !reason.is_empty() {
                                outcome.finish_reason = reason.clone();
                            }
                        }
                        if let Some(content) = &choice.delta.content {
                            if !content.is_empty() {
                                debug!(len = content.len(), "stream text delta");
                                outcome.text.push_str(content);
                                on_delta(content);
                            }
                        }
                    }
                }
            }
            line_buf = rest;
        }

        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sse_lines_parse_into_kinds() {
        assert_eq!(
            parse_sse_line("data: {\"x\":1}"),
            Some(SseParsed::Data("{\"x\":1}".into()))
        );
        assert_eq!(
            parse_sse_line("event: message_stop"),
            Some(SseParsed::Event("message_stop".into()))
        );
        assert_eq!(parse_sse_line(": keepalive"), None);
    }

    #[test]
    fn delta_chunk_deserializes() {
        let chunk: StreamChunk = serde_json::from_str(
            r#"{"choices":[{"delta":{"content":"hel"},"finish_reason":null}]}"#,
        )
        .unwrap();
        assert_eq!(chunk.choices[0].delta.content.as_deref(), Some("hel"));
        assert!(chunk.choices[0].delta.tool_calls.is_none());
    }
}
