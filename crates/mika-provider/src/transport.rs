//! Non-streaming transport: POST, retry, error mapping, empty-reply
//! recovery.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, info, warn};

use mika_core::config::MikaConfig;
use mika_core::error::MikaError;
use mika_core::message::ChatMessage;
use mika_core::metrics::Metrics;

use crate::adapter::{build_provider_request, parse_provider_response};
use crate::keypool::KeyPool;
use crate::model::{
    CompletionReply, CompletionRequest, EmptyReplyKind, EmptyReplyMeta, ParsedResponse,
    ProviderKind,
};

/// Injected when a completion carried only reasoning; forces the model to
/// produce the user-visible answer on the follow-up call.
const REASONING_COMPLETION_INSTRUCTION: &str = "你上一次输出只包含思考过程，没有正文。\
现在请直接给出最终回答正文，不要复述思考过程。";

/// Seam for everything that asks the LLM a question. The HTTP transport is
/// the production implementation; tests substitute scripted fakes.
#[async_trait]
pub trait CompletionClient: Send + Sync {
    async fn complete(
        &self,
        req: &CompletionRequest,
        phase: &str,
        request_id: &str,
    ) -> Result<CompletionReply, MikaError>;

    /// Streaming variant. Default: non-streaming send with the whole text
    /// delivered through the callback once.
    async fn complete_stream(
        &self,
        req: &CompletionRequest,
        phase: &str,
        request_id: &str,
        on_delta: &(dyn for<'a> Fn(&'a str) + Send + Sync),
    ) -> Result<CompletionReply, MikaError> {
        let reply = self.complete(req, phase, request_id).await?;
        let text = reply.content_text();
        if !text.is_empty() {
            on_delta(&text);
        }
        Ok(reply)
    }
}

pub struct Transport {
    client: reqwest::Client,
    provider: ProviderKind,
    base_url: String,
    extra_headers: Vec<(String, String)>,
    default_temperature: f64,
    timeout: Duration,
    timeout_retries: u32,
    timeout_retry_delay: f64,
    empty_local_retries: u32,
    empty_retry_delay: f64,
    keys: Arc<KeyPool>,
    metrics: Arc<Metrics>,
}

impl Transport {
    pub fn new(cfg: &MikaConfig, keys: Arc<KeyPool>, metrics: Arc<Metrics>) -> Self {
        Self {
            client: reqwest::Client::new(),
            provider: ProviderKind::detect(&cfg.llm.provider),
            base_url: cfg.llm.base_url.clone(),
            extra_headers: cfg
                .llm
                .extra_headers
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            default_temperature: cfg.llm.temperature,
            timeout: Duration::from_secs(cfg.transport.timeout_seconds.max(1)),
            timeout_retries: cfg.transport.timeout_retries,
            timeout_retry_delay: cfg.transport.timeout_retry_delay_seconds.max(0.0),
            empty_local_retries: cfg.transport.empty_reply_local_retries,
            empty_retry_delay: cfg.transport.empty_reply_retry_delay_seconds.max(0.0),
            keys,
            metrics,
        }
    }

    pub fn provider(&self) -> ProviderKind {
        self.provider
    }

    pub fn keys(&self) -> &Arc<KeyPool> {
        &self.keys
    }

    pub(crate) fn http_client(&self) -> &reqwest::Client {
        &self.client
    }

    pub(crate) fn base_url_for_stream(&self) -> &str {
        &self.base_url
    }

    pub(crate) fn extra_headers_for_stream(&self) -> &[(String, String)] {
        &self.extra_headers
    }

    pub(crate) fn default_temperature_for_stream(&self) -> f64 {
        self.default_temperature
    }

    fn map_reqwest_error(&self, err: reqwest::Error) -> MikaError {
        if err.is_timeout() {
            MikaError::Timeout {
                ms: self.timeout.as_millis() as u64,
            }
        } else {
            MikaError::Network(err.to_string())
        }
    }

    async fn post_once(
        &self,
        req: &CompletionRequest,
        api_key: &str,
    ) -> Result<reqwest::Response, reqwest::Error> {
        let prepared = build_provider_request(
            self.provider,
            &self.base_url,
            &req.model,
            api_key,
            req,
            &self.extra_headers,
            self.default_temperature,
        );
        let mut builder = self
            .client
            .post(&prepared.url)
            .timeout(self.timeout)
            .json(&prepared.body);
        for (key, value) in &prepared.headers {
            builder = builder.header(key.as_str(), value.as_str());
        }
        if !prepared.query.is_empty() {
            builder = builder.query(&prepared.query);
        }
        builder.send().await
    }

    /// POST with linear-backoff retry on timeout only.
    async fn post_with_timeout_retry(
        &self,
        req: &CompletionRequest,
        api_key: &str,
        phase: &str,
        request_id: &str,
    ) -> Result<reqwest::Response, MikaError> {
        let mut attempt = 0u32;
        loop {
            match self.post_once(req, api_key).await {
                Ok(resp) => return Ok(resp),
                Err(err) if err.is_timeout() && attempt < self.timeout_retries => {
                    attempt += 1;
                    let wait = self.timeout_retry_delay * attempt as f64;
                    warn!(
                        request_id,
                        phase,
                        attempt,
                        wait_secs = wait,
                        "request timed out, retrying"
                    );
                    if wait > 0.0 {
                        tokio::time::sleep(Duration::from_secs_f64(wait)).await;
                    }
                }
                Err(err) => return Err(self.map_reqwest_error(err)),
            }
        }
    }

    /// Map the HTTP status per the error taxonomy. 429 also marks the key
    /// cooled so rotation skips it.
    async fn check_status(
        &self,
        resp: reqwest::Response,
        api_key: &str,
    ) -> Result<Value, MikaError> {
        let status = resp.status().as_u16();
        if status == 429 {
            let retry_after = resp
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(0);
            self.keys.mark_rate_limited(api_key, retry_after);
            return Err(MikaError::RateLimit {
                retry_after_secs: if retry_after > 0 { retry_after } else { 60 },
            });
        }
        if status == 401 || status == 403 {
            let message = resp.text().await.unwrap_or_default();
            return Err(MikaError::Authentication { status, message });
        }
        if matches!(status, 500 | 502 | 503 | 504) {
            let message = resp.text().await.unwrap_or_default();
            return Err(MikaError::Server { status, message });
        }
        if status >= 400 {
            let message = resp.text().await.unwrap_or_default();
            let lower = message.to_ascii_lowercase();
            if lower.contains("safety") || lower.contains("blocked") {
                return Err(MikaError::ContentFilter { status, message });
            }
            return Err(MikaError::Api { status, message });
        }
        resp.json::<Value>()
            .await
            .map_err(|e| self.map_reqwest_error(e))
    }

    async fn post_and_parse(
        &self,
        req: &CompletionRequest,
        api_key: &str,
        phase: &str,
        request_id: &str,
    ) -> Result<ParsedResponse, MikaError> {
        let started = std::time::Instant::now();
        let resp = self
            .post_with_timeout_retry(req, api_key, phase, request_id)
            .await?;
        let data = self.check_status(resp, api_key).await?;
        let parsed = parse_provider_response(self.provider, &data)?;
        debug!(
            request_id,
            phase,
            latency_ms = started.elapsed().as_millis() as u64,
            prompt_tokens = parsed.usage.prompt_tokens,
            completion_tokens = parsed.usage.completion_tokens,
            finish_reason = %parsed.finish_reason,
            "completion received"
        );
        Ok(parsed)
    }

    /// Send one completion request: timeout retry, reasoning-only fallback,
    /// then bounded local retries on an empty reply.
    pub async fn send_api_request(
        &self,
        req: &CompletionRequest,
        phase: &str,
        request_id: &str,
    ) -> Result<CompletionReply, MikaError> {
        let api_key = self
            .keys
            .select()
            .ok_or_else(|| MikaError::Config("no API keys configured".into()))?;

        let mut parsed = self.post_and_parse(req, &api_key, phase, request_id).await?;
        let mut reasoning_only_seen = false;
        let mut local_retries = 0u32;

        // Reasoning-only completion: the model filled reasoning_content but
        // left the answer blank. One follow-up forces it to write the body;
        // reasoning is never exposed to the user.
        if parsed.is_empty_content()
            && parsed.tool_calls.is_empty()
            && parsed.reasoning_content.is_some()
        {
            reasoning_only_seen = true;
            info!(request_id, "reasoning-only completion, requesting final answer");
            let mut follow = req.clone();
            follow
                .messages
                .push(ChatMessage::system(REASONING_COMPLETION_INSTRUCTION));
            match self
                .post_and_parse(&follow, &api_key, "reasoning_completion", request_id)
                .await
            {
                Ok(second) if !second.is_empty_content() => parsed = second,
                Ok(_) => {}
                Err(err) => warn!(request_id, %err, "reasoning completion follow-up failed"),
            }
        }

        while parsed.is_empty_content()
            && parsed.tool_calls.is_empty()
            && local_retries < self.empty_local_retries
        {
            local_retries += 1;
            let wait = self.empty_retry_delay * local_retries as f64;
            warn!(
                request_id,
                attempt = local_retries,
                wait_secs = wait,
                "empty reply, local retry"
            );
            if wait > 0.0 {
                tokio::time::sleep(Duration::from_secs_f64(wait)).await;
            }
            parsed = self.post_and_parse(req, &api_key, phase, request_id).await?;
        }

        let empty_meta = if parsed.is_empty_content() {
            let kind = if !parsed.tool_calls.is_empty() {
                EmptyReplyKind::EmptyWithToolCalls
            } else if reasoning_only_seen {
                EmptyReplyKind::ReasoningOnlyEmpty
            } else {
                EmptyReplyKind::ProviderEmpty
            };
            if parsed.tool_calls.is_empty() {
                self.metrics.record_empty_reply_reason(kind.as_str());
            }
            Some(EmptyReplyMeta {
                kind,
                finish_reason: parsed.finish_reason.clone(),
                local_retries,
                response_id: parsed.response_id.clone(),
                phase: phase.to_string(),
                request_id: request_id.to_string(),
                model: req.model.clone(),
            })
        } else {
            None
        };

        Ok(CompletionReply {
            assistant: parsed.assistant,
            tool_calls: parsed.tool_calls,
            api_key,
            usage: parsed.usage,
            finish_reason: parsed.finish_reason,
            empty_meta,
        })
    }
}

#[async_trait]
impl CompletionClient for Transport {
    async fn complete(
        &self,
        req: &CompletionRequest,
        phase: &str,
        request_id: &str,
    ) -> Result<CompletionReply, MikaError> {
        self.send_api_request(req, phase, request_id).await
    }

    /// SSE streaming on OpenAI-compatible endpoints. Tool-call deltas or
    /// stream failures fall back to the non-streaming path.
    async fn complete_stream(
        &self,
        req: &CompletionRequest,
        phase: &str,
        request_id: &str,
        on_delta: &(dyn for<'a> Fn(&'a str) + Send + Sync),
    ) -> Result<CompletionReply, MikaError> {
        if self.provider != ProviderKind::OpenaiCompat {
            let reply = self.send_api_request(req, phase, request_id).await?;
            let text = reply.content_text();
            if !text.is_empty() {
                on_delta(&text);
            }
            return Ok(reply);
        }

        let api_key = self
            .keys
            .select()
            .ok_or_else(|| MikaError::Config("no API keys configured".into()))?;
        match self.send_api_request_stream(req, &api_key, on_delta).await {
            Ok(outcome) if !outcome.tool_calls_detected => Ok(CompletionReply {
                assistant: ChatMessage::assistant(outcome.text),
                tool_calls: Vec::new(),
                api_key,
                usage: outcome.usage,
                finish_reason: outcome.finish_reason,
                empty_meta: None,
            }),
            Ok(_) => {
                info!(request_id, "tool calls in stream, replaying non-streaming");
                self.send_api_request(req, phase, request_id).await
            }
            Err(err) => {
                warn!(request_id, %err, "streaming failed, replaying non-streaming");
                self.send_api_request(req, phase, request_id).await
            }
        }
    }
}
