//! Repository sync seam

use crate::error::SyncResult;
use crate::registry::JobRegistry;
use crate::remote::SyncRequest;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

/// Fetches or updates a remote source tree into `target`.
///
/// Implementations check `cancel` between steps and must drop any child
/// process when their future is dropped; the orchestrator enforces the
/// operation timeout from outside.
#[async_trait]
pub trait RepositorySync: Send + Sync {
    async fn sync(
        &self,
        request: &SyncRequest,
        target: &Path,
        progress: &ProgressReporter,
        cancel: CancellationToken,
    ) -> SyncResult<PathBuf>;
}

/// Writes a job's progress message
#[derive(Clone)]
pub struct ProgressReporter {
    target: Option<(Arc<JobRegistry>, Uuid)>,
}

impl ProgressReporter {
    pub fn new(registry: Arc<JobRegistry>, job_id: Uuid) -> Self {
        Self {
            target: Some((registry, job_id)),
        }
    }

    /// Reporter that only logs (direct calls outside a job)
    pub fn detached() -> Self {
        Self { target: None }
    }

    pub fn report(&self, message: impl Into<String>) {
        let message = message.into();
        match &self.target {
            Some((registry, id)) => {
                debug!("Job {}: {}", id, message);
                // Fails only once the job is terminal
                let _ = registry.set_progress(*id, message);
            }
            None => debug!("{}", message),
        }
    }
}

/// Does an existing checkout need fetching?
///
/// Missing path, `sync_enabled`, missing `.git`, or a `.git` older than
/// `interval` all mean yes.
pub fn should_update(path: &Path, sync_enabled: bool, interval: Duration) -> bool {
    if !path.exists() || sync_enabled {
        return true;
    }

    let git_dir = path.join(".git");
    if !git_dir.exists() {
        return true;
    }

    match git_dir
        .metadata()
        .and_then(|meta| meta.modified())
        .map(|modified| SystemTime::now().duration_since(modified).unwrap_or_default())
    {
        Ok(age) => age > interval,
        Err(e) => {
            warn!(
                "Cannot read last update time of {}: {}, updating",
                path.display(),
                e
            );
            true
        }
    }
}
