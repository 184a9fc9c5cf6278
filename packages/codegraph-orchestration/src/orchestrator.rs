use crate::config::OrchestratorConfig;
use crate::error::{OrchestratorError, Result, SyncError, SyncErrorKind};
use crate::job::{Job, JobKind};
use crate::registry::{CancelRequest, Finished, JobCallback, JobRegistry, Registration};
use crate::remote::SyncRequest;
use crate::sync::{ProgressReporter, RepositorySync};
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Background job orchestrator for repository syncs
///
/// `submit` returns immediately; a bounded pool of tokio tasks runs the jobs.
/// Outcomes are observable only through `status`, `list_all`, `wait` or a
/// completion callback, never as an error from `submit`.
pub struct JobOrchestrator {
    registry: Arc<JobRegistry>,
    sync: Arc<dyn RepositorySync>,
    config: OrchestratorConfig,
    permits: Arc<Semaphore>,
    tracker: TaskTracker,
    shutdown: CancellationToken,
}

/// What a worker task needs, detached from `&self`
#[derive(Clone)]
struct Worker {
    registry: Arc<JobRegistry>,
    sync: Arc<dyn RepositorySync>,
    permits: Arc<Semaphore>,
    timeout: Duration,
}

impl JobOrchestrator {
    pub fn new(config: OrchestratorConfig, sync: Arc<dyn RepositorySync>) -> Result<Self> {
        Self::with_registry(config, sync, Arc::new(JobRegistry::new()))
    }

    /// Share an existing registry (e.g. with a status endpoint)
    pub fn with_registry(
        config: OrchestratorConfig,
        sync: Arc<dyn RepositorySync>,
        registry: Arc<JobRegistry>,
    ) -> Result<Self> {
        config.validate()?;
        info!(
            "Job orchestrator ready: {} workers, {}s sync timeout, workspace {}",
            config.max_concurrent_jobs,
            config.sync_timeout_secs,
            config.workspace_root.display()
        );
        Ok(Self {
            registry,
            sync,
            permits: Arc::new(Semaphore::new(config.max_concurrent_jobs)),
            config,
            tracker: TaskTracker::new(),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Submit a sync for `subject`.
    ///
    /// If `subject` already has a non-terminal job, its id is returned and
    /// nothing new is scheduled. A different subject that maps to a checkout
    /// an active job is writing is refused with `TargetBusy`. Must be called
    /// inside a tokio runtime.
    pub fn submit(&self, subject: impl Into<String>, request: SyncRequest) -> Result<Uuid> {
        self.submit_inner(subject.into(), request, None)
    }

    /// Like [`submit`](Self::submit); `callback` runs once with the terminal snapshot.
    pub fn submit_with_callback<F>(
        &self,
        subject: impl Into<String>,
        request: SyncRequest,
        callback: F,
    ) -> Result<Uuid>
    where
        F: FnOnce(&Job) + Send + 'static,
    {
        self.submit_inner(subject.into(), request, Some(Box::new(callback)))
    }

    fn submit_inner(
        &self,
        subject: String,
        request: SyncRequest,
        callback: Option<JobCallback>,
    ) -> Result<Uuid> {
        if self.shutdown.is_cancelled() {
            return Err(OrchestratorError::ShutDown);
        }
        request
            .validate()
            .map_err(|e| OrchestratorError::InvalidRequest(e.message().to_string()))?;

        let target = self
            .config
            .repo_path(&request.credentials.username, &request.remote.name);
        let cancel = self.shutdown.child_token();
        let job = Job::new_pending(subject.clone(), JobKind::Sync);

        match self
            .registry
            .register(job, target.clone(), callback, cancel.clone())?
        {
            Registration::Joined(id) => {
                info!("Subject {} already has active job {}, reusing it", subject, id);
                Ok(id)
            }
            Registration::Created(id) => {
                info!(
                    "Submitted job {} for {} ({} -> {})",
                    id,
                    subject,
                    request.remote,
                    target.display()
                );
                let worker = self.worker();
                self.tracker
                    .spawn(async move { worker.run(id, request, target, cancel).await });
                Ok(id)
            }
        }
    }

    /// Snapshot of one job
    pub fn status(&self, job_id: Uuid) -> Result<Job> {
        self.registry
            .get(job_id)
            .ok_or(OrchestratorError::JobNotFound(job_id))
    }

    /// PENDING jobs are cancelled immediately; RUNNING jobs are signalled and
    /// become CANCELLED once the worker notices. Terminal jobs return `false`.
    pub fn cancel(&self, job_id: Uuid) -> Result<bool> {
        match self.registry.request_cancel(job_id, "cancelled by request")? {
            CancelRequest::Cancelled(finished) => {
                info!("Job {} cancelled before start", job_id);
                finished.notify();
                Ok(true)
            }
            CancelRequest::Signalled => {
                info!("Job {} signalled to cancel", job_id);
                Ok(true)
            }
            CancelRequest::Rejected => Ok(false),
        }
    }

    /// Point-in-time copy of every job
    pub fn list_all(&self) -> Vec<Job> {
        self.registry.list()
    }

    /// Wait until `job_id` is terminal or `timeout` elapses; returns the
    /// latest snapshot either way.
    pub async fn wait(&self, job_id: Uuid, timeout: Duration) -> Result<Job> {
        let mut updates = self
            .registry
            .subscribe(job_id)
            .ok_or(OrchestratorError::JobNotFound(job_id))?;

        let waited = tokio::time::timeout(timeout, updates.wait_for(|job| job.is_terminal())).await;
        match waited {
            Ok(Ok(job)) => Ok(job.clone()),
            // Timed out, or the job was removed meanwhile
            Ok(Err(_)) | Err(_) => self.status(job_id),
        }
    }

    /// Remove terminal jobs from the registry
    pub fn purge_finished(&self) -> usize {
        let purged = self.registry.purge_finished();
        debug!("Purged {} finished jobs", purged);
        purged
    }

    /// Remove one terminal job; `Ok(false)` if it is still active
    pub fn remove(&self, job_id: Uuid) -> Result<bool> {
        self.registry.remove(job_id)
    }

    /// Cancel everything in flight, refuse new work, and wait for workers to drain.
    pub async fn close(&self) {
        info!("Shutting down job orchestrator");
        self.shutdown.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        info!("Job orchestrator stopped");
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    fn worker(&self) -> Worker {
        Worker {
            registry: Arc::clone(&self.registry),
            sync: Arc::clone(&self.sync),
            permits: Arc::clone(&self.permits),
            timeout: self.config.sync_timeout(),
        }
    }
}

impl Worker {
    async fn run(self, id: Uuid, request: SyncRequest, target: PathBuf, cancel: CancellationToken) {
        let permit = tokio::select! {
            biased;
            () = cancel.cancelled() => {
                self.finish_cancelled(id, "cancelled before start");
                return;
            }
            permit = Arc::clone(&self.permits).acquire_owned() => permit,
        };
        let Ok(_permit) = permit else {
            self.finish_cancelled(id, "worker pool closed");
            return;
        };

        // Cancelled while waiting for the permit
        if let Err(e) = self.registry.start(id) {
            debug!("Job {} not started: {}", id, e);
            return;
        }
        let started = Instant::now();
        info!("Job {} running", id);

        // The sync observes `cancel` itself so it can clean up before
        // returning; the timeout is the backstop for one that does not.
        let progress = ProgressReporter::new(Arc::clone(&self.registry), id);
        let operation = AssertUnwindSafe(self.sync.sync(&request, &target, &progress, cancel.clone()))
            .catch_unwind();

        let outcome = match tokio::time::timeout(self.timeout, operation).await {
            Err(_) => Err(SyncError::timeout(format!(
                "sync did not finish within {}s",
                self.timeout.as_secs()
            ))),
            Ok(Err(panic)) => Err(SyncError::new(
                SyncErrorKind::Panicked,
                format!("sync panicked: {}", panic_message(panic.as_ref())),
            )),
            Ok(Ok(result)) => result,
        };

        let finished = match outcome {
            Ok(local_path) => {
                info!(
                    "Job {} completed in {}ms: {}",
                    id,
                    started.elapsed().as_millis(),
                    local_path.display()
                );
                self.registry.complete(id, local_path)
            }
            Err(e) if e.is_cancelled() || cancel.is_cancelled() => {
                info!("Job {} cancelled: {}", id, e.message());
                self.registry.cancel(id, e.message())
            }
            Err(e) => {
                error!("Job {} failed ({}): {}", id, e.category(), e);
                self.registry.fail(id, &e)
            }
        };
        Self::notify(id, finished);
    }

    fn finish_cancelled(&self, id: Uuid, reason: &str) {
        // Already terminal when cancel() got there first
        Self::notify(id, self.registry.cancel(id, reason));
    }

    fn notify(id: Uuid, finished: Result<Finished>) {
        match finished {
            Ok(finished) => {
                finished.notify();
            }
            Err(e) => debug!("Job {} already finished: {}", id, e),
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

impl Drop for JobOrchestrator {
    fn drop(&mut self) {
        if !self.shutdown.is_cancelled() && !self.tracker.is_empty() {
            warn!("Job orchestrator dropped with jobs in flight, cancelling them");
            self.shutdown.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_panic_message() {
        let boxed: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(boxed.as_ref()), "boom");

        let boxed: Box<dyn Any + Send> = Box::new(String::from("owned boom"));
        assert_eq!(panic_message(boxed.as_ref()), "owned boom");

        let boxed: Box<dyn Any + Send> = Box::new(42u32);
        assert_eq!(panic_message(boxed.as_ref()), "unknown panic payload");
    }
}
