//! Tool schema exposure policy.
//!
//! `full` sends schemas verbatim; `light` strips descriptions and
//! non-structural keys to save tokens; `auto` flips to light above a tool
//! count threshold. A session that produced repeated argument-parse
//! failures falls back to full schemas for a TTL window.

use std::collections::HashSet;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde_json::{Map, Value};

use mika_provider::ToolSpec;

use crate::registry::{RegisteredTool, ToolRegistry};

const ALLOWED_KEYS: &[&str] = &[
    "type",
    "properties",
    "required",
    "items",
    "enum",
    "const",
    "format",
    "minimum",
    "maximum",
    "exclusiveMinimum",
    "exclusiveMaximum",
    "minLength",
    "maxLength",
    "minItems",
    "maxItems",
    "additionalProperties",
    "oneOf",
    "anyOf",
    "allOf",
    "nullable",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaMode {
    Full,
    Light,
    Auto,
}

impl SchemaMode {
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "full" => SchemaMode::Full,
            "light" => SchemaMode::Light,
            _ => SchemaMode::Auto,
        }
    }
}

/// Keep only structural schema keys; drop descriptions unless requested.
pub fn compact_json_schema_node(node: &Value, keep_param_description: bool) -> Value {
    match node {
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| compact_json_schema_node(item, keep_param_description))
                .collect(),
        ),
        Value::Object(map) => {
            let mut compact = Map::new();
            for (key, value) in map {
                if key == "description" {
                    if keep_param_description {
                        compact.insert(key.clone(), value.clone());
                    }
                    continue;
                }
                if !ALLOWED_KEYS.contains(&key.as_str()) {
                    continue;
                }
                match key.as_str() {
                    "properties" => {
                        if let Value::Object(props) = value {
                            let mut out = Map::new();
                            for (prop_name, prop_schema) in props {
                                if prop_name.trim().is_empty() {
                                    continue;
                                }
                                out.insert(
                                    prop_name.clone(),
                                    compact_json_schema_node(prop_schema, keep_param_description),
                                );
                            }
                            compact.insert(key.clone(), Value::Object(out));
                        }
                    }
                    "items" | "additionalProperties" => {
                        compact.insert(
                            key.clone(),
                            compact_json_schema_node(value, keep_param_description),
                        );
                    }
                    _ => {
                        compact.insert(key.clone(), value.clone());
                    }
                }
            }
            Value::Object(compact)
        }
        other => other.clone(),
    }
}

/// Per-session window forcing full schemas after suspected mismatches.
#[derive(Default)]
pub struct SchemaFallback {
    windows: DashMap<String, Instant>,
}

impl SchemaFallback {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn activate(&self, session_key: &str, ttl: Duration) {
        self.windows
            .insert(session_key.to_string(), Instant::now() + ttl);
    }

    pub fn is_active(&self, session_key: &str) -> bool {
        // Copy the deadline out before any removal; holding a map ref
        // across remove() would deadlock on the shard.
        let until = self.windows.get(session_key).map(|entry| *entry.value());
        match until {
            Some(until) if until > Instant::now() => true,
            Some(_) => {
                self.windows.remove(session_key);
                false
            }
            None => false,
        }
    }
}

/// Build the tool specs exposed to the model for this request.
pub fn build_tool_specs(
    registry: &ToolRegistry,
    allowlist: &HashSet<String>,
    mode: SchemaMode,
    auto_threshold: usize,
    fallback_active: bool,
) -> Vec<ToolSpec> {
    let exposed: Vec<RegisteredTool> = registry.exposed(allowlist);
    let use_light = !fallback_active
        && match mode {
            SchemaMode::Full => false,
            SchemaMode::Light => true,
            SchemaMode::Auto => exposed.len() > auto_threshold,
        };

    exposed
        .iter()
        .map(|entry| {
            let parameters = entry.tool.parameters();
            ToolSpec {
                name: entry.exposed_name.clone(),
                description: entry.tool.description().to_string(),
                parameters: if use_light {
                    compact_json_schema_node(&parameters, false)
                } else {
                    parameters
                },
            }
        })
        .collect()
}
