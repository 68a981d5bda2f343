//! Handler execution: external scripts and in-process functions.

pub mod env;
pub mod function;
pub mod output;
pub mod process;
pub mod script;

use lavs_shared::{LavsError, LavsResult, Permissions};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::permissions::{check_file_access, check_path_traversal};

pub use function::{EndpointFunction, FunctionExecutor, FunctionRegistry};
pub use process::ProcessArena;
pub use script::ScriptExecutor;

/// Per-call bundle handed to an executor. Built fresh for every call.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub endpoint_id: String,
    pub agent_id: String,
    /// Absolute, existing agent directory. Every policy check resolves against it.
    pub workdir: PathBuf,
    /// Manifest and endpoint permissions, already merged.
    pub permissions: Permissions,
    /// Extra variables from the caller (e.g. `LAVS_PROJECT_PATH`).
    pub env: HashMap<String, String>,
}

impl ExecutionContext {
    #[must_use]
    pub fn new(
        agent_id: impl Into<String>,
        endpoint_id: impl Into<String>,
        workdir: impl Into<PathBuf>,
        permissions: Permissions,
    ) -> Self {
        Self {
            endpoint_id: endpoint_id.into(),
            agent_id: agent_id.into(),
            workdir: workdir.into(),
            permissions,
            env: HashMap::new(),
        }
    }

    #[must_use]
    pub fn with_env(mut self, env: HashMap<String, String>) -> Self {
        self.env = env;
        self
    }

    /// Resolve `path` inside the agent directory and check it against `fileAccess`.
    ///
    /// Function handlers have no process boundary, so they call this before
    /// touching any file named by their input.
    pub fn ensure_file_access(&self, path: impl AsRef<Path>) -> LavsResult<PathBuf> {
        let path = path.as_ref();
        let resolved = check_path_traversal(path, &self.workdir)?;

        let relative = resolved
            .strip_prefix(&self.workdir)
            .map(|p| format!("./{}", p.to_string_lossy()))
            .unwrap_or_else(|_| resolved.to_string_lossy().into_owned());

        if !check_file_access(&relative, &self.permissions) {
            tracing::warn!(
                agent_id = %self.agent_id,
                endpoint_id = %self.endpoint_id,
                path = %relative,
                "🚫 File access denied by policy"
            );
            return Err(LavsError::permission_denied(format!(
                "File access denied: {}",
                path.display()
            )));
        }
        Ok(resolved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lavs_shared::LavsErrorCode;

    fn context(patterns: Option<Vec<&str>>) -> ExecutionContext {
        ExecutionContext::new(
            "notes",
            "read",
            "/agents/notes",
            Permissions {
                file_access: patterns.map(|p| p.into_iter().map(String::from).collect()),
                ..Permissions::default()
            },
        )
    }

    #[test]
    fn test_ensure_file_access_applies_globs() {
        let ctx = context(Some(vec!["./data/*.json", "!./data/secrets.json"]));

        assert_eq!(
            ctx.ensure_file_access("data/todos.json").unwrap(),
            PathBuf::from("/agents/notes/data/todos.json")
        );
        let err = ctx.ensure_file_access("./data/secrets.json").unwrap_err();
        assert_eq!(err.code, LavsErrorCode::PermissionDenied);
        assert!(ctx.ensure_file_access("scripts/run.sh").is_err());
    }

    #[test]
    fn test_ensure_file_access_blocks_traversal_even_when_unrestricted() {
        let ctx = context(None);
        assert!(ctx.ensure_file_access("anything/at/all").is_ok());
        assert!(ctx.ensure_file_access("../other/data.json").is_err());
    }
}
