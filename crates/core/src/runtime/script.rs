use lavs_shared::{InputMode, LavsError, LavsResult, ScriptHandler};
use serde_json::Value;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::env::{compose_env, value_to_env_string};
use super::output::{parse_output, preview};
use super::process::ProcessArena;
use super::ExecutionContext;
use crate::permissions::{
    cap_timeout, check_handler_cwd, check_path_traversal, is_path_command, DEFAULT_TIMEOUT_MS,
};

/// Number of trailing stderr lines attached to a `HandlerError`.
const STDERR_TAIL_LINES: usize = 20;

/// Replace `{{key}}` in each argument with the matching top-level input field.
///
/// Strings are inserted raw and other values as JSON. Placeholders with no
/// matching field are left as written.
#[must_use]
pub fn substitute_args(args: &[String], input: &Value) -> Vec<String> {
    args.iter().map(|arg| substitute(arg, input)).collect()
}

fn substitute(template: &str, input: &Value) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(open) = rest.find("{{") {
        let Some(close) = rest[open + 2..].find("}}") else {
            break;
        };
        let close = open + 2 + close;
        let key = rest[open + 2..close].trim();

        out.push_str(&rest[..open]);
        match input.get(key) {
            Some(value) => out.push_str(&value_to_env_string(value)),
            None => out.push_str(&rest[open..close + 2]),
        }
        rest = &rest[close + 2..];
    }
    out.push_str(rest);
    out
}

/// Runs `script` handlers as child processes.
pub struct ScriptExecutor {
    arena: Arc<ProcessArena>,
    default_timeout_ms: u64,
}

impl Default for ScriptExecutor {
    fn default() -> Self {
        Self::new(Arc::new(ProcessArena::new()), DEFAULT_TIMEOUT_MS)
    }
}

impl ScriptExecutor {
    #[must_use]
    pub fn new(arena: Arc<ProcessArena>, default_timeout_ms: u64) -> Self {
        Self {
            arena,
            default_timeout_ms,
        }
    }

    #[must_use]
    pub fn arena(&self) -> &Arc<ProcessArena> {
        &self.arena
    }

    /// Spawn the handler, deliver input, wait for exit within the effective
    /// timeout and parse stdout as JSON.
    pub async fn execute(
        &self,
        handler: &ScriptHandler,
        input: &Value,
        ctx: &ExecutionContext,
    ) -> LavsResult<Value> {
        let timeout_ms = cap_timeout(handler.timeout, &ctx.permissions, self.default_timeout_ms);
        let cwd = check_handler_cwd(handler, &ctx.workdir)?.unwrap_or_else(|| ctx.workdir.clone());
        let program: PathBuf = if is_path_command(&handler.command) {
            check_path_traversal(&handler.command, &ctx.workdir)?
        } else {
            PathBuf::from(&handler.command)
        };
        let args = substitute_args(&handler.args, input);
        let env = compose_env(std::env::vars(), handler, input, ctx, timeout_ms);

        debug!(
            agent_id = %ctx.agent_id,
            endpoint_id = %ctx.endpoint_id,
            command = %handler.command,
            timeout_ms,
            "Spawning script handler"
        );

        let mut cmd = Command::new(&program);
        cmd.args(&args)
            .current_dir(&cwd)
            .env_clear()
            .envs(&env)
            .stdin(if handler.input == InputMode::Stdin {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(|e| {
            warn!(command = %handler.command, "Failed to spawn script: {}", e);
            LavsError::handler(format!("Failed to spawn '{}': {}", handler.command, e))
        })?;

        let pid = child.id().unwrap_or_default();
        let guard = self.arena.track(pid, &ctx.agent_id, &ctx.endpoint_id);

        if let Some(mut stdin) = child.stdin.take() {
            let payload = serde_json::to_vec(input).unwrap_or_default();
            tokio::spawn(async move {
                if let Err(e) = stdin.write_all(&payload).await {
                    if e.kind() != std::io::ErrorKind::BrokenPipe {
                        debug!("Failed to write script stdin: {}", e);
                    }
                }
                // dropping stdin closes the pipe
            });
        }

        let stderr_task = child.stderr.take().map(|stderr| {
            let command = handler.command.clone();
            tokio::spawn(async move {
                let mut tail = VecDeque::with_capacity(STDERR_TAIL_LINES);
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(command = %command, "[script stderr] {}", line);
                    if tail.len() == STDERR_TAIL_LINES {
                        tail.pop_front();
                    }
                    tail.push_back(line);
                }
                Vec::from(tail).join("\n")
            })
        });

        let mut stdout = child.stdout.take();
        let run = async {
            let mut buf = Vec::new();
            if let Some(out) = stdout.as_mut() {
                out.read_to_end(&mut buf).await?;
            }
            let status = child.wait().await?;
            Ok::<_, std::io::Error>((status, buf))
        };

        let outcome = tokio::time::timeout(Duration::from_millis(timeout_ms), run).await;
        // Reap anything the script left behind in its group.
        guard.kill_group();

        let (status, stdout_bytes) = match outcome {
            Err(_) => {
                let _ = child.start_kill();
                let _ = child.wait().await;
                warn!(
                    agent_id = %ctx.agent_id,
                    endpoint_id = %ctx.endpoint_id,
                    timeout_ms,
                    "⏱️ Script handler timed out"
                );
                return Err(LavsError::timeout(format!(
                    "Script '{}' timed out after {}ms",
                    handler.command, timeout_ms
                ))
                .with_data(serde_json::json!({ "timeoutMs": timeout_ms })));
            }
            Ok(Err(e)) => {
                return Err(LavsError::handler(format!(
                    "I/O error while running '{}': {}",
                    handler.command, e
                )));
            }
            Ok(Ok(result)) => result,
        };
        drop(guard);

        let stderr_tail = match stderr_task {
            Some(task) => task.await.unwrap_or_default(),
            None => String::new(),
        };

        if !status.success() {
            let code = status.code();
            let code_text = code.map_or_else(|| "a signal".to_string(), |c| c.to_string());
            info!(
                agent_id = %ctx.agent_id,
                endpoint_id = %ctx.endpoint_id,
                "Script handler exited with code {}",
                code_text
            );
            return Err(LavsError::handler(format!(
                "Script '{}' exited with code {}",
                handler.command, code_text
            ))
            .with_data(serde_json::json!({
                "exitCode": code,
                "stderr": preview(&stderr_tail, 4096),
            })));
        }

        parse_output(&String::from_utf8_lossy(&stdout_bytes))
    }
}
