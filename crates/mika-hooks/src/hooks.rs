//! Agent lifecycle hooks.
//!
//! Four awaitable callbacks around the LLM call and each tool execution.
//! A failing hook is logged and swallowed; hooks can never break the reply
//! path.

use async_trait::async_trait;
use futures_util::FutureExt;
use serde_json::Value;
use std::panic::AssertUnwindSafe;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookEvent {
    BeforeLlm,
    AfterLlm,
    ToolStart,
    ToolEnd,
}

impl HookEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            HookEvent::BeforeLlm => "before_llm",
            HookEvent::AfterLlm => "after_llm",
            HookEvent::ToolStart => "tool_start",
            HookEvent::ToolEnd => "tool_end",
        }
    }
}

/// Lifecycle observer. Payloads are structured JSON objects carrying
/// request_id, session, model, token estimates, tool timings, and
/// cache-hit flags.
#[async_trait]
pub trait AgentHooks: Send + Sync {
    async fn on_before_llm(&self, payload: &Value);
    async fn on_after_llm(&self, payload: &Value);
    async fn on_tool_start(&self, payload: &Value);
    async fn on_tool_end(&self, payload: &Value);
}

pub struct NoopHooks;

#[async_trait]
impl AgentHooks for NoopHooks {
    async fn on_before_llm(&self, _payload: &Value) {}
    async fn on_after_llm(&self, _payload: &Value) {}
    async fn on_tool_start(&self, _payload: &Value) {}
    async fn on_tool_end(&self, _payload: &Value) {}
}

/// Emit one hook event, catching panics so a broken observer cannot take
/// down the pipeline.
pub async fn emit(hooks: &dyn AgentHooks, event: HookEvent, payload: &Value) {
    let fut = async {
        match event {
            HookEvent::BeforeLlm => hooks.on_before_llm(payload).await,
            HookEvent::AfterLlm => hooks.on_after_llm(payload).await,
            HookEvent::ToolStart => hooks.on_tool_start(payload).await,
            HookEvent::ToolEnd => hooks.on_tool_end(payload).await,
        }
    };
    if AssertUnwindSafe(fut).catch_unwind().await.is_err() {
        warn!(event = event.as_str(), "hook panicked — ignored");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct PanickyHooks;

    #[async_trait]
    impl AgentHooks for PanickyHooks {
        async fn on_before_llm(&self, _payload: &Value) {
            panic!("observer bug");
        }
        async fn on_after_llm(&self, _payload: &Value) {}
        async fn on_tool_start(&self, _payload: &Value) {}
        async fn on_tool_end(&self, _payload: &Value) {}
    }

    #[tokio::test]
    async fn hook_panic_never_propagates() {
        emit(&PanickyHooks, HookEvent::BeforeLlm, &json!({"request_id": "r1"})).await;
        // Reaching this line is the assertion.
    }
}
