//! Function-tool definitions for LLM tool calling.

use lavs_shared::{EndpointMethod, Manifest};
use serde::Serialize;
use serde_json::{json, Value};

/// OpenAI-style tool names are limited to 64 chars of `[A-Za-z0-9_-]`.
pub const MAX_TOOL_NAME_LEN: usize = 64;

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ToolDefinition {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub function: ToolFunction,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ToolFunction {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

#[must_use]
pub fn tool_name(agent_id: &str, endpoint_id: &str) -> String {
    let raw = format!("lavs_{}_{}", agent_id, endpoint_id);
    let mut name: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect();
    name.truncate(MAX_TOOL_NAME_LEN);
    name
}

/// One tool per query/mutation endpoint. Subscriptions cannot be called as tools.
#[must_use]
pub fn tool_definitions(agent_id: &str, manifest: &Manifest) -> Vec<ToolDefinition> {
    manifest
        .endpoints
        .iter()
        .filter(|e| e.method != EndpointMethod::Subscription)
        .map(|endpoint| {
            let description = endpoint.description.clone().unwrap_or_else(|| {
                format!("{} '{}' of {}", endpoint.method, endpoint.id, manifest.name)
            });
            let parameters = endpoint
                .schema
                .as_ref()
                .and_then(|s| s.input.clone())
                .unwrap_or_else(|| json!({ "type": "object", "properties": {} }));

            ToolDefinition {
                kind: "function",
                function: ToolFunction {
                    name: tool_name(agent_id, &endpoint.id),
                    description,
                    parameters,
                },
            }
        })
        .collect()
}
