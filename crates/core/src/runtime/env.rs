//! Environment composition for script handlers.

use lavs_shared::{InputMode, ScriptHandler};
use serde_json::Value;
use std::collections::HashMap;

use super::ExecutionContext;

/// Case-insensitive name fragments that mark an inherited variable as secret.
const SENSITIVE_FRAGMENTS: &[&str] = &[
    "SECRET",
    "TOKEN",
    "API_KEY",
    "APIKEY",
    "PASSWORD",
    "PASSWD",
    "CREDENTIAL",
    "PRIVATE_KEY",
    "AWS_ACCESS_KEY",
];

/// Inherited variables that survive filtering even if a fragment matches.
const SAFE_VARS: &[&str] = &[
    "PATH", "HOME", "USER", "SHELL", "LANG", "LC_ALL", "TERM", "TMPDIR", "TZ", "NODE_ENV", "PWD",
];

const LAVS_PREFIX: &str = "LAVS_";

#[must_use]
pub fn is_sensitive_var(name: &str) -> bool {
    if name.starts_with(LAVS_PREFIX) || SAFE_VARS.contains(&name) {
        return false;
    }
    let upper = name.to_ascii_uppercase();
    SENSITIVE_FRAGMENTS.iter().any(|f| upper.contains(f))
}

/// Drop inherited host variables that look like secrets.
pub fn filter_sensitive_vars<I>(vars: I) -> HashMap<String, String>
where
    I: IntoIterator<Item = (String, String)>,
{
    vars.into_iter()
        .filter(|(name, _)| !is_sensitive_var(name))
        .collect()
}

/// Strings are passed raw, `null` as empty, everything else as compact JSON.
#[must_use]
pub fn value_to_env_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Top-level input fields as `(name, value)` pairs for `input: "env"`.
#[must_use]
pub fn flatten_input(input: &Value) -> Vec<(String, String)> {
    match input {
        Value::Object(map) => map
            .iter()
            .map(|(k, v)| (k.clone(), value_to_env_string(v)))
            .collect(),
        _ => Vec::new(),
    }
}

/// Build the full environment for a script, lowest precedence first:
///
/// 1. filtered host environment
/// 2. caller variables from the context
/// 3. flattened input (`input: "env"` only)
/// 4. `handler.env`
/// 5. `LAVS_*` context values, which nothing above can shadow
pub fn compose_env<I>(
    host: I,
    handler: &ScriptHandler,
    input: &Value,
    ctx: &ExecutionContext,
    timeout_ms: u64,
) -> HashMap<String, String>
where
    I: IntoIterator<Item = (String, String)>,
{
    let mut env = filter_sensitive_vars(host);

    let (protected, caller): (Vec<_>, Vec<_>) = ctx
        .env
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .partition(|(k, _)| k.starts_with(LAVS_PREFIX));

    env.extend(caller);
    if handler.input == InputMode::Env {
        env.extend(flatten_input(input));
    }
    env.extend(handler.env.iter().map(|(k, v)| (k.clone(), v.clone())));

    env.extend(protected);
    env.insert("LAVS_AGENT_ID".into(), ctx.agent_id.clone());
    env.insert("LAVS_ENDPOINT_ID".into(), ctx.endpoint_id.clone());
    env.insert(
        "LAVS_AGENT_DIR".into(),
        ctx.workdir.to_string_lossy().into_owned(),
    );
    env.insert("LAVS_TIMEOUT_MS".into(), timeout_ms.to_string());
    if let Some(network) = ctx.permissions.network_access {
        env.insert("LAVS_NETWORK_ACCESS".into(), network.to_string());
    }

    env
}
