//! Policy decisions for endpoint handlers.
//!
//! Everything here is side-effect free apart from reading filesystem metadata
//! to resolve symlinks. The security boundary is policy based: path and glob
//! checks, not OS isolation.

use glob::{MatchOptions, Pattern};
use lavs_shared::{Handler, LavsError, LavsResult, Permissions, ScriptHandler};
use std::path::{Component, Path, PathBuf};
use tracing::warn;

/// Fallback when neither the handler nor its policy declares a timeout.
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;

const GLOB_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

/// Field-wise merge: endpoint value, else manifest value, else absent.
#[must_use]
pub fn merge_permissions(
    manifest_level: Option<&Permissions>,
    endpoint_level: Option<&Permissions>,
) -> Permissions {
    let base = manifest_level.cloned().unwrap_or_default();
    let Some(over) = endpoint_level else {
        return base;
    };
    Permissions {
        file_access: over.file_access.clone().or(base.file_access),
        network_access: over.network_access.or(base.network_access),
        max_execution_time: over.max_execution_time.or(base.max_execution_time),
    }
}

/// Resolve `.` and `..` without touching the filesystem.
fn normalize_lexically(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Prefix(_) | Component::RootDir => out.push(component.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            Component::Normal(part) => out.push(part),
        }
    }
    out
}

fn absolute_base(base_dir: &Path) -> PathBuf {
    if base_dir.is_absolute() {
        normalize_lexically(base_dir)
    } else {
        let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/"));
        normalize_lexically(&cwd.join(base_dir))
    }
}

/// Resolve `candidate` against `base_dir` and reject anything that lands outside it.
///
/// `base_dir` itself is accepted. When the resolved path exists it is also
/// canonicalized so a symlink inside the directory cannot point out of it.
pub fn check_path_traversal(candidate: impl AsRef<Path>, base_dir: &Path) -> LavsResult<PathBuf> {
    let candidate = candidate.as_ref();
    let base = absolute_base(base_dir);
    let resolved = normalize_lexically(&base.join(candidate));

    let deny = || {
        warn!(
            path = %candidate.display(),
            base = %base.display(),
            "🚫 Path traversal blocked"
        );
        LavsError::permission_denied(format!(
            "Path '{}' escapes the agent directory",
            candidate.display()
        ))
    };

    if !resolved.starts_with(&base) {
        return Err(deny());
    }

    if let (Ok(real), Ok(real_base)) = (resolved.canonicalize(), base.canonicalize()) {
        if !real.starts_with(&real_base) {
            return Err(deny());
        }
    }

    Ok(resolved)
}

/// `./`-relative form used for glob matching; absolute paths are left alone.
fn to_relative_form(path: &str) -> String {
    let unified = path.replace('\\', "/");
    if unified.starts_with('/') {
        return unified;
    }
    let mut rest = unified.as_str();
    while let Some(stripped) = rest.strip_prefix("./") {
        rest = stripped;
    }
    format!("./{}", rest)
}

/// Evaluate the ordered `fileAccess` patterns for `path`.
///
/// No patterns (absent or empty) allows everything. Otherwise a path is allowed
/// when some positive pattern matches it and no `!` pattern does: a matching
/// denial overrides positive matches wherever it appears in the list. An
/// unparsable denial counts as matching.
#[must_use]
pub fn check_file_access(path: &str, permissions: &Permissions) -> bool {
    let patterns = match permissions.file_access.as_deref() {
        None | Some([]) => return true,
        Some(p) => p,
    };

    let target = to_relative_form(path);
    let mut allowed = false;

    for raw in patterns {
        let (negated, body) = match raw.strip_prefix('!') {
            Some(rest) => (true, rest),
            None => (false, raw.as_str()),
        };
        let pattern = match Pattern::new(&to_relative_form(body)) {
            Ok(p) => Some(p),
            Err(e) => {
                warn!(pattern = %raw, "Ignoring invalid fileAccess pattern: {}", e);
                None
            }
        };
        let matched = pattern.map_or(negated, |p| p.matches_with(&target, GLOB_OPTIONS));

        if matched {
            if negated {
                return false;
            }
            allowed = true;
        }
    }

    allowed
}

/// A declared handler `cwd` must stay inside the agent directory.
pub fn check_handler_cwd(handler: &ScriptHandler, agent_dir: &Path) -> LavsResult<Option<PathBuf>> {
    handler
        .cwd
        .as_deref()
        .map(|cwd| check_path_traversal(cwd, agent_dir))
        .transpose()
}

/// Handler timeout capped by the policy's `maxExecutionTime`.
#[must_use]
pub fn get_effective_timeout(handler: &Handler, permissions: &Permissions, default_ms: u64) -> u64 {
    cap_timeout(handler.timeout_ms(), permissions, default_ms)
}

/// [`get_effective_timeout`] for a bare requested value.
#[must_use]
pub fn cap_timeout(requested: Option<u64>, permissions: &Permissions, default_ms: u64) -> u64 {
    match (requested, permissions.max_execution_time) {
        (Some(requested), Some(max)) => requested.min(max),
        (Some(requested), None) => requested,
        (None, Some(max)) => max,
        (None, None) => default_ms,
    }
}

/// True when `command` names a path rather than an executable looked up on PATH.
#[must_use]
pub fn is_path_command(command: &str) -> bool {
    command.contains('/') || command.contains('\\')
}

/// Pre-execution policy check for a handler.
pub fn assert_allowed(handler: &Handler, _permissions: &Permissions, agent_dir: &Path) -> LavsResult<()> {
    if let Handler::Script(script) = handler {
        check_handler_cwd(script, agent_dir)?;
        if is_path_command(&script.command) {
            check_path_traversal(&script.command, agent_dir)?;
        }
    }
    Ok(())
}
