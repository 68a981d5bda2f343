#![allow(dead_code)]

use lavs_core::agents::FsAgentDirectory;
use lavs_core::manifest::MANIFEST_FILE_NAME;
use lavs_core::rate_limit::RateLimitConfig;
use lavs_core::{AppState, Dispatcher, DispatcherConfig};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

/// Create `<root>/<id>/lavs.json` and return the agent directory.
pub fn write_agent(root: &Path, id: &str, manifest: &Value) -> PathBuf {
    let dir = root.join(id);
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join(MANIFEST_FILE_NAME), manifest.to_string()).unwrap();
    dir
}

/// Write an executable shell script into an agent directory.
#[cfg(unix)]
pub fn write_script(agent_dir: &Path, name: &str, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = agent_dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

pub fn dispatcher_with_limit(root: &Path, max_requests: u32) -> Arc<Dispatcher> {
    Arc::new(Dispatcher::new(
        Arc::new(FsAgentDirectory::new(root)),
        DispatcherConfig {
            default_timeout_ms: 5_000,
            rate_limit: RateLimitConfig {
                max_requests,
                window: Duration::from_secs(60),
            },
            ..DispatcherConfig::default()
        },
    ))
}

pub fn dispatcher(root: &Path) -> Arc<Dispatcher> {
    dispatcher_with_limit(root, 1_000)
}

pub fn app_state(dispatcher: Arc<Dispatcher>) -> Arc<AppState> {
    Arc::new(AppState {
        dispatcher,
        shutdown: Arc::new(Notify::new()),
    })
}
