//! Typed representation of an agent's `lavs.json` manifest.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};

use crate::{LavsError, LavsResult};

/// Longest accepted agent or endpoint identifier.
pub const MAX_IDENTIFIER_LEN: usize = 128;

/// Identifiers are 1-128 chars of `[A-Za-z0-9_.-]` and never `.` or `..`,
/// so they are safe to use as a single path component.
#[must_use]
pub fn is_valid_identifier(value: &str) -> bool {
    !value.is_empty()
        && value.len() <= MAX_IDENTIFIER_LEN
        && value != "."
        && value != ".."
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.')
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub endpoints: Vec<Endpoint>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permissions: Option<Permissions>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub view: Option<ViewConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Endpoint {
    pub id: String,
    pub method: EndpointMethod,
    pub handler: Handler,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<EndpointSchema>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permissions: Option<Permissions>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum EndpointMethod {
    Query,
    Mutation,
    Subscription,
}

impl std::fmt::Display for EndpointMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Query => "query",
            Self::Mutation => "mutation",
            Self::Subscription => "subscription",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct EndpointSchema {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
}

/// Policy bounding a handler. An absent field means "unrestricted" for that field.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Permissions {
    /// Ordered glob patterns; a leading `!` marks a denial.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_access: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_access: Option<bool>,
    /// Milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_execution_time: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ViewConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub component: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Handler {
    Script(ScriptHandler),
    Function(FunctionHandler),
    Http(HttpHandler),
    Mcp(McpHandler),
}

impl Handler {
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Script(_) => "script",
            Self::Function(_) => "function",
            Self::Http(_) => "http",
            Self::Mcp(_) => "mcp",
        }
    }

    /// Handler-declared timeout in milliseconds, if any.
    #[must_use]
    pub fn timeout_ms(&self) -> Option<u64> {
        match self {
            Self::Script(h) => h.timeout,
            Self::Function(h) => h.timeout,
            Self::Http(_) | Self::Mcp(_) => None,
        }
    }
}

/// How a script receives its input.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum InputMode {
    /// Only through `{{key}}` substitution in `args`.
    #[default]
    Args,
    Stdin,
    Env,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ScriptHandler {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub input: InputMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FunctionHandler {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub module: Option<String>,
    pub function: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
}

impl FunctionHandler {
    /// Registry key: `module:function`, or the bare function name.
    #[must_use]
    pub fn qualified_name(&self) -> String {
        match &self.module {
            Some(module) if !module.is_empty() => format!("{}:{}", module, self.function),
            _ => self.function.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HttpHandler {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct McpHandler {
    pub server: String,
    pub tool: String,
}

impl Manifest {
    /// Parse manifest text and run the structural checks.
    pub fn from_json_str(text: &str) -> LavsResult<Self> {
        let manifest: Manifest = serde_json::from_str(text)
            .map_err(|e| LavsError::parse_error(format!("Invalid manifest: {}", e)))?;
        manifest.validate_structure()?;
        Ok(manifest)
    }

    pub fn validate_structure(&self) -> LavsResult<()> {
        if self.name.trim().is_empty() {
            return Err(LavsError::parse_error("Manifest name must not be empty"));
        }

        let mut seen = HashSet::new();
        for endpoint in &self.endpoints {
            if endpoint.id.trim().is_empty() {
                return Err(LavsError::parse_error("Endpoint id must not be empty"));
            }
            // must stay callable through the same id rule the routes enforce
            if !is_valid_identifier(&endpoint.id) {
                return Err(LavsError::parse_error(format!(
                    "Invalid endpoint id: '{}'",
                    endpoint.id
                )));
            }
            if !seen.insert(endpoint.id.as_str()) {
                return Err(LavsError::parse_error(format!(
                    "Duplicate endpoint id: {}",
                    endpoint.id
                )));
            }
            let missing = match &endpoint.handler {
                Handler::Script(h) if h.command.trim().is_empty() => Some("command"),
                Handler::Function(h) if h.function.trim().is_empty() => Some("function"),
                Handler::Http(h) if h.url.trim().is_empty() => Some("url"),
                Handler::Mcp(h) if h.server.trim().is_empty() => Some("server"),
                Handler::Mcp(h) if h.tool.trim().is_empty() => Some("tool"),
                _ => None,
            };
            if let Some(field) = missing {
                return Err(LavsError::parse_error(format!(
                    "Endpoint '{}': {} handler is missing required field '{}'",
                    endpoint.id,
                    endpoint.handler.kind(),
                    field
                )));
            }
        }
        Ok(())
    }

    #[must_use]
    pub fn endpoint(&self, id: &str) -> Option<&Endpoint> {
        self.endpoints.iter().find(|e| e.id == id)
    }
}
