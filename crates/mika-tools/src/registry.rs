//! Named tool catalog.
//!
//! Tools carry a source tag (builtin / MCP / plugin); names are unique and
//! MCP collisions are renamed `<server>:<tool>` deterministically.
//! Allowlist filtering happens at exposure time, never at registration.

use std::collections::BTreeMap;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;
use tracing::warn;

use mika_core::types::SessionKey;

use crate::error::ToolError;

/// Request-scoped facts a tool may need.
#[derive(Debug, Clone)]
pub struct ToolContext {
    pub session_key: SessionKey,
    pub request_id: String,
    pub user_id: String,
    pub group_id: Option<String>,
}

#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    /// JSON Schema of the arguments object.
    fn parameters(&self) -> Value;
    async fn call(&self, args: Value, ctx: &ToolContext) -> Result<String, ToolError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolSource {
    Builtin,
    Mcp { server: String },
    Plugin,
}

impl ToolSource {
    pub fn is_dynamic(&self) -> bool {
        !matches!(self, ToolSource::Builtin)
    }
}

#[derive(Clone)]
pub struct RegisteredTool {
    pub exposed_name: String,
    pub tool: Arc<dyn Tool>,
    pub source: ToolSource,
    pub enabled: bool,
}

#[derive(Default)]
pub struct ToolRegistry {
    tools: Mutex<BTreeMap<String, RegisteredTool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool. On a name collision, MCP tools are renamed to
    /// `<server>:<tool>`; other collisions are rejected.
    pub fn register(&self, tool: Arc<dyn Tool>, source: ToolSource) -> Result<String, ToolError> {
        let mut tools = self.tools.lock().unwrap();
        let base_name = tool.name().trim().to_string();
        if base_name.is_empty() {
            return Err(ToolError::InvalidDefinition("empty tool name".into()));
        }

        let exposed_name = if tools.contains_key(&base_name) {
            match &source {
                ToolSource::Mcp { server } => {
                    let renamed = format!("{}:{}", server, base_name);
                    if tools.contains_key(&renamed) {
                        return Err(ToolError::InvalidDefinition(format!(
                            "tool name collision: {}",
                            renamed
                        )));
                    }
                    warn!(tool = %base_name, renamed = %renamed, "MCP tool name collision, renamed");
                    renamed
                }
                _ => {
                    return Err(ToolError::InvalidDefinition(format!(
                        "tool name collision: {}",
                        base_name
                    )))
                }
            }
        } else {
            base_name
        };

        tools.insert(
            exposed_name.clone(),
            RegisteredTool {
                exposed_name: exposed_name.clone(),
                tool,
                source,
                enabled: true,
            },
        );
        Ok(exposed_name)
    }

    pub fn get(&self, name: &str) -> Option<RegisteredTool> {
        self.tools.lock().unwrap().get(name).cloned()
    }

    /// Strip a `provider:` prefix when the bare name is registered; some
    /// models echo namespaced names back.
    pub fn resolve_alias(&self, name: &str) -> String {
        let tools = self.tools.lock().unwrap();
        if tools.contains_key(name) {
            return name.to_string();
        }
        if let Some((_, base)) = name.split_once(':') {
            if tools.contains_key(base) {
                return base.to_string();
            }
        }
        name.to_string()
    }

    pub fn set_enabled(&self, name: &str, enabled: bool) {
        if let Some(entry) = self.tools.lock().unwrap().get_mut(name) {
            entry.enabled = enabled;
        }
    }

    pub fn list(&self) -> Vec<RegisteredTool> {
        self.tools.lock().unwrap().values().cloned().collect()
    }

    /// Names exposed to the model: configured allowlist plus, when
    /// permitted, every dynamically-registered (MCP/plugin) tool.
    pub fn effective_allowlist(&self, configured: &[String], allow_dynamic: bool) -> HashSet<String> {
        let mut allow: HashSet<String> = configured
            .iter()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        if allow_dynamic {
            for entry in self.tools.lock().unwrap().values() {
                if entry.enabled && entry.source.is_dynamic() {
                    allow.insert(entry.exposed_name.clone());
                }
            }
        }
        allow
    }

    /// Enabled tools whose exposed name passes the allowlist.
    pub fn exposed(&self, allowlist: &HashSet<String>) -> Vec<RegisteredTool> {
        self.tools
            .lock()
            .unwrap()
            .values()
            .filter(|t| t.enabled && allowlist.contains(&t.exposed_name))
            .cloned()
            .collect()
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    pub struct StaticTool {
        pub tool_name: String,
        pub reply: String,
    }

    impl StaticTool {
        pub fn new(name: &str, reply: &str) -> Arc<Self> {
            Arc::new(Self {
                tool_name: name.to_string(),
                reply: reply.to_string(),
            })
        }
    }

    #[async_trait]
    impl Tool for StaticTool {
        fn name(&self) -> &str {
            &self.tool_name
        }
        fn description(&self) -> &str {
            "static test tool"
        }
        fn parameters(&self) -> Value {
            serde_json::json!({"type": "object", "properties": {}})
        }
        async fn call(&self, _args: Value, _ctx: &ToolContext) -> Result<String, ToolError> {
            Ok(self.reply.clone())
        }
    }

    pub fn ctx() -> ToolContext {
        ToolContext {
            session_key: SessionKey::for_group("g1"),
            request_id: "r1".into(),
            user_id: "42".into(),
            group_id: Some("g1".into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::StaticTool;
    use super::*;

    #[test]
    fn mcp_collision_renames_deterministically() {
        let registry = ToolRegistry::new();
        registry
            .register(StaticTool::new("web_search", "a"), ToolSource::Builtin)
            .unwrap();
        let renamed = registry
            .register(
                StaticTool::new("web_search", "b"),
                ToolSource::Mcp {
                    server: "searchsrv".into(),
                },
            )
            .unwrap();
        assert_eq!(renamed, "searchsrv:web_search");
        assert!(registry.get("searchsrv:web_search").is_some());
    }

    #[test]
    fn builtin_collision_is_rejected() {
        let registry = ToolRegistry::new();
        registry
            .register(StaticTool::new("dup", "a"), ToolSource::Builtin)
            .unwrap();
        assert!(registry
            .register(StaticTool::new("dup", "b"), ToolSource::Builtin)
            .is_err());
    }

    #[test]
    fn alias_strips_provider_prefix_when_base_exists() {
        let registry = ToolRegistry::new();
        registry
            .register(StaticTool::new("web_search", "a"), ToolSource::Builtin)
            .unwrap();
        assert_eq!(registry.resolve_alias("openai:web_search"), "web_search");
        assert_eq!(registry.resolve_alias("unknown:tool"), "unknown:tool");
    }

    #[test]
    fn allowlist_union_includes_dynamic_tools() {
        let registry = ToolRegistry::new();
        registry
            .register(StaticTool::new("web_search", "a"), ToolSource::Builtin)
            .unwrap();
        registry
            .register(StaticTool::new("remote_thing", "b"), ToolSource::Plugin)
            .unwrap();

        let allow = registry.effective_allowlist(&["web_search".to_string()], true);
        assert!(allow.contains("web_search"));
        assert!(allow.contains("remote_thing"));

        let strict = registry.effective_allowlist(&["web_search".to_string()], false);
        assert!(!strict.contains("remote_thing"));
        assert_eq!(registry.exposed(&strict).len(), 1);
    }
}
