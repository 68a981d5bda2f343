use async_trait::async_trait;
use lavs_shared::{LavsError, LavsResult};
use std::path::{Path, PathBuf};

use crate::validation::validate_agent_id;

/// Maps an agent id to its absolute, existing directory.
#[async_trait]
pub trait AgentDirectory: Send + Sync {
    async fn resolve(&self, agent_id: &str) -> LavsResult<PathBuf>;
}

/// Agents live in `<root>/<agentId>`.
pub struct FsAgentDirectory {
    root: PathBuf,
}

impl FsAgentDirectory {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[async_trait]
impl AgentDirectory for FsAgentDirectory {
    async fn resolve(&self, agent_id: &str) -> LavsResult<PathBuf> {
        validate_agent_id(agent_id)?;

        let candidate = self.root.join(agent_id);
        let dir = match tokio::fs::canonicalize(&candidate).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(LavsError::not_found(format!("Agent not found: {}", agent_id)));
            }
            Err(e) => {
                return Err(LavsError::internal(format!(
                    "Failed to resolve agent directory {}: {}",
                    candidate.display(),
                    e
                )));
            }
        };

        let is_dir = tokio::fs::metadata(&dir)
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false);
        if !is_dir {
            return Err(LavsError::not_found(format!("Agent not found: {}", agent_id)));
        }
        Ok(dir)
    }
}
