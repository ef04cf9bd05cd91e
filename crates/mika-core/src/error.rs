use std::collections::BTreeMap;

use thiserror::Error;

/// Unified error taxonomy for the chat pipeline.
///
/// Transport maps HTTP outcomes into these; the orchestrator maps them to
/// user-facing text via [`ErrorTemplates`].
#[derive(Debug, Error)]
pub enum MikaError {
    #[error("rate limited, retry after {retry_after_secs}s")]
    RateLimit { retry_after_secs: u64 },

    #[error("authentication failed ({status}): {message}")]
    Authentication { status: u16, message: String },

    #[error("server error ({status}): {message}")]
    Server { status: u16, message: String },

    #[error("content filtered ({status}): {message}")]
    ContentFilter { status: u16, message: String },

    #[error("request timeout after {ms}ms")]
    Timeout { ms: u64 },

    #[error("network error: {0}")]
    Network(String),

    #[error("empty reply from provider")]
    EmptyReply,

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl MikaError {
    /// Short stable code for logs and trace events.
    pub fn code(&self) -> &'static str {
        match self {
            MikaError::RateLimit { .. } => "RATE_LIMIT",
            MikaError::Authentication { .. } => "AUTH_ERROR",
            MikaError::Server { .. } => "SERVER_ERROR",
            MikaError::ContentFilter { .. } => "CONTENT_FILTER",
            MikaError::Timeout { .. } => "TIMEOUT",
            MikaError::Network(_) => "NETWORK",
            MikaError::EmptyReply => "EMPTY_REPLY",
            MikaError::Api { .. } => "API_ERROR",
            MikaError::Config(_) => "CONFIG_ERROR",
            MikaError::Database(_) => "DATABASE_ERROR",
            MikaError::Serialization(_) => "SERIALIZATION_ERROR",
            MikaError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Template key used to render the user-visible message.
    /// Network failures read as timeouts to the user.
    pub fn user_text_key(&self) -> &'static str {
        match self {
            MikaError::RateLimit { .. } => "rate_limit",
            MikaError::Authentication { .. } => "auth_error",
            MikaError::Server { .. } => "server_error",
            MikaError::ContentFilter { .. } => "content_filter",
            MikaError::Timeout { .. } | MikaError::Network(_) => "timeout",
            MikaError::EmptyReply => "empty_reply",
            MikaError::Api { .. } => "api_error",
            _ => "unknown",
        }
    }

    /// Whether the caller may retry with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, MikaError::Server { .. })
    }
}

pub type Result<T> = std::result::Result<T, MikaError>;

/// User-facing message templates with a `{name}` placeholder for the bot
/// persona. Keys match [`MikaError::user_text_key`].
#[derive(Debug, Clone)]
pub struct ErrorTemplates {
    templates: BTreeMap<String, String>,
    bot_name: String,
}

impl ErrorTemplates {
    pub fn new(bot_name: impl Into<String>, overrides: &BTreeMap<String, String>) -> Self {
        let mut templates = Self::defaults();
        for (key, value) in overrides {
            templates.insert(key.clone(), value.clone());
        }
        Self {
            templates,
            bot_name: bot_name.into(),
        }
    }

    fn defaults() -> BTreeMap<String, String> {
        let pairs = [
            ("rate_limit", "{name}忙不过来了，稍等一下再问吧。"),
            ("auth_error", "{name}的接口凭证出了问题，请联系管理员。"),
            ("server_error", "{name}那边的服务暂时出错了，稍后再试试。"),
            ("content_filter", "这个话题{name}没法回答哦。"),
            ("timeout", "{name}等了很久也没等到回应，请再试一次。"),
            ("empty_reply", "{name}想了半天也没组织好语言，再问一次试试？"),
            ("api_error", "{name}遇到了一点接口问题，稍后再试。"),
            ("unknown", "{name}出了点小状况，稍后再试。"),
        ];
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    pub fn render(&self, key: &str) -> String {
        let template = self
            .templates
            .get(key)
            .or_else(|| self.templates.get("unknown"))
            .cloned()
            .unwrap_or_else(|| "{name}出了点小状况。".to_string());
        template.replace("{name}", &self.bot_name)
    }

    pub fn render_for(&self, err: &MikaError) -> String {
        self.render(err.user_text_key())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn templates_substitute_bot_name() {
        let templates = ErrorTemplates::new("Mika", &BTreeMap::new());
        let text = templates.render_for(&MikaError::EmptyReply);
        assert!(text.contains("Mika"));
        assert!(!text.contains("{name}"));
    }

    #[test]
    fn network_errors_read_as_timeout() {
        assert_eq!(MikaError::Network("reset".into()).user_text_key(), "timeout");
    }

    #[test]
    fn only_server_errors_are_retryable() {
        assert!(MikaError::Server { status: 502, message: String::new() }.is_retryable());
        assert!(!MikaError::Authentication { status: 401, message: String::new() }.is_retryable());
    }
}
