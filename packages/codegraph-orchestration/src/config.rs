//! Orchestrator configuration

use crate::error::{OrchestratorError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OrchestratorConfig {
    /// Checkouts live under `<workspace_root>/repo/<username>/<repo_name>`
    pub workspace_root: PathBuf,

    /// Worker pool size (jobs beyond this stay PENDING)
    pub max_concurrent_jobs: usize,

    /// Hard timeout for one sync operation
    pub sync_timeout_secs: u64,

    /// An existing checkout younger than this is reused without pulling
    pub update_interval_minutes: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            workspace_root: PathBuf::from("./workspace"),
            max_concurrent_jobs: num_cpus::get().clamp(1, 4),
            sync_timeout_secs: 300,
            update_interval_minutes: 60,
        }
    }
}

impl OrchestratorConfig {
    pub fn with_workspace_root(root: impl Into<PathBuf>) -> Self {
        Self {
            workspace_root: root.into(),
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_jobs == 0 {
            return Err(OrchestratorError::config(
                "max_concurrent_jobs must be at least 1",
            ));
        }
        if self.sync_timeout_secs == 0 {
            return Err(OrchestratorError::config(
                "sync_timeout_secs must be at least 1",
            ));
        }
        Ok(())
    }

    pub fn sync_timeout(&self) -> Duration {
        Duration::from_secs(self.sync_timeout_secs)
    }

    pub fn update_interval(&self) -> Duration {
        Duration::from_secs(self.update_interval_minutes * 60)
    }

    /// All checkouts owned by `username`
    pub fn user_dir(&self, username: &str) -> PathBuf {
        self.workspace_root.join("repo").join(username)
    }

    pub fn repo_path(&self, username: &str, repo_name: &str) -> PathBuf {
        self.user_dir(username).join(repo_name)
    }

    pub fn workspace_root(&self) -> &Path {
        &self.workspace_root
    }
}
