//! Feature probe used to gate message building per provider/model.

use serde::Serialize;

use crate::model::ProviderKind;
use crate::openai::is_google_openai_compat_endpoint;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ProviderCapabilities {
    pub supports_images: bool,
    pub supports_tools: bool,
    pub supports_json_object_response: bool,
}

/// Best-effort capability probe from provider + endpoint + model name.
/// `supports_images_override` (config) wins when set.
pub fn get_provider_capabilities(
    provider: ProviderKind,
    base_url: &str,
    model: &str,
    supports_images_override: Option<bool>,
) -> ProviderCapabilities {
    let model_lower = model.to_ascii_lowercase();

    let supports_images = supports_images_override.unwrap_or_else(|| match provider {
        ProviderKind::Anthropic => true,
        ProviderKind::GoogleGenai => true,
        ProviderKind::OpenaiCompat => {
            is_google_openai_compat_endpoint(base_url)
                || model_lower.contains("gemini")
                || model_lower.contains("gpt-4o")
                || model_lower.contains("gpt-4.1")
                || model_lower.contains("claude")
                || model_lower.contains("vision")
                || model_lower.contains("vl")
        }
    });

    // Every wire format we speak can carry tool definitions; text-only
    // completion models are the exception.
    let supports_tools = !model_lower.contains("instruct-legacy");

    let supports_json_object_response = match provider {
        ProviderKind::Anthropic => false,
        ProviderKind::GoogleGenai => false,
        ProviderKind::OpenaiCompat => true,
    };

    ProviderCapabilities {
        supports_images,
        supports_tools,
        supports_json_object_response,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn override_wins_over_probe() {
        let caps = get_provider_capabilities(
            ProviderKind::OpenaiCompat,
            "https://api.openai.com/v1",
            "gpt-3.5-turbo",
            Some(true),
        );
        assert!(caps.supports_images);
    }

    #[test]
    fn anthropic_has_images_but_not_json_mode() {
        let caps = get_provider_capabilities(
            ProviderKind::Anthropic,
            "https://api.anthropic.com/v1",
            "claude-sonnet-4",
            None,
        );
        assert!(caps.supports_images);
        assert!(!caps.supports_json_object_response);
    }

    #[test]
    fn gemini_on_openai_endpoint_supports_images() {
        let caps = get_provider_capabilities(
            ProviderKind::OpenaiCompat,
            "https://generativelanguage.googleapis.com/v1beta/openai",
            "gemini-2.0-flash",
            None,
        );
        assert!(caps.supports_images);
        assert!(caps.supports_json_object_response);
    }
}
