/// Job orchestrator integration tests
///
/// Runs the real orchestrator and registry against a scripted RepositorySync,
/// so no network or git is needed.
use async_trait::async_trait;
use codegraph_orchestration::{
    Credentials, ErrorCategory, GitSync, Job, JobKind, JobOrchestrator, JobStatus,
    OrchestratorConfig, OrchestratorError, ProgressReporter, RepositorySync, SyncError,
    SyncErrorKind, SyncRequest, SyncResult,
};
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

const WAIT: Duration = Duration::from_secs(5);

enum Behavior {
    Succeed,
    Fail(SyncError),
    Panic,
    /// Never finishes and ignores cancellation (only the timeout ends it)
    Stuck,
}

struct FakeSync {
    behavior: Behavior,
    /// When set, each sync waits for a notification (or cancellation) first
    gate: Option<Arc<Notify>>,
    calls: AtomicUsize,
}

impl FakeSync {
    fn new(behavior: Behavior) -> Self {
        Self {
            behavior,
            gate: None,
            calls: AtomicUsize::new(0),
        }
    }

    fn gated(behavior: Behavior) -> (Arc<Self>, Arc<Notify>) {
        let gate = Arc::new(Notify::new());
        let sync = Self {
            behavior,
            gate: Some(Arc::clone(&gate)),
            calls: AtomicUsize::new(0),
        };
        (Arc::new(sync), gate)
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RepositorySync for FakeSync {
    async fn sync(
        &self,
        _request: &SyncRequest,
        target: &Path,
        progress: &ProgressReporter,
        cancel: CancellationToken,
    ) -> SyncResult<PathBuf> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        progress.report("fetching");

        if let Some(gate) = &self.gate {
            tokio::select! {
                () = cancel.cancelled() => return Err(SyncError::cancelled("stopped at checkpoint")),
                () = gate.notified() => {}
            }
        }

        match &self.behavior {
            Behavior::Succeed => {
                std::fs::create_dir_all(target).map_err(|e| SyncError::io(target.display(), e))?;
                Ok(target.to_path_buf())
            }
            Behavior::Fail(err) => Err(err.clone()),
            Behavior::Panic => panic!("sync implementation bug"),
            Behavior::Stuck => {
                futures::future::pending::<()>().await;
                unreachable!()
            }
        }
    }
}

fn config(dir: &TempDir) -> OrchestratorConfig {
    OrchestratorConfig {
        max_concurrent_jobs: 2,
        ..OrchestratorConfig::with_workspace_root(dir.path())
    }
}

fn request(repo: &str) -> SyncRequest {
    SyncRequest::new(repo, Credentials::new("alice", "glpat-test")).unwrap()
}

async fn wait_for_status(orchestrator: &JobOrchestrator, id: Uuid, status: JobStatus) -> Job {
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        let job = orchestrator.status(id).unwrap();
        if job.status == status || tokio::time::Instant::now() > deadline {
            return job;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn test_end_to_end_sync_completes() {
    let dir = TempDir::new().unwrap();
    let orchestrator =
        JobOrchestrator::new(config(&dir), Arc::new(FakeSync::new(Behavior::Succeed))).unwrap();

    let id = orchestrator.submit("repo1", request("team/app")).unwrap();
    let submitted = orchestrator.status(id).unwrap();
    assert!(matches!(
        submitted.status,
        JobStatus::Pending | JobStatus::Running
    ));
    assert_eq!(submitted.subject, "repo1");
    assert_eq!(submitted.kind, JobKind::Sync);

    let job = orchestrator.wait(id, WAIT).await.unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    let local_path = job.local_path.clone().unwrap();
    assert_eq!(local_path, dir.path().join("repo").join("alice").join("app"));
    assert!(local_path.is_dir());
    assert!(job.started_at.is_some());
    assert!(job.ended_at.is_some());
    assert!(job.error.is_none());
}

#[tokio::test]
async fn test_duplicate_submission_is_coalesced() {
    let dir = TempDir::new().unwrap();
    let (sync, gate) = FakeSync::gated(Behavior::Succeed);
    let orchestrator = JobOrchestrator::new(config(&dir), sync.clone()).unwrap();

    let first = orchestrator.submit("repo1", request("team/app")).unwrap();
    let second = orchestrator.submit("repo1", request("team/app")).unwrap();
    assert_eq!(first, second);
    assert_eq!(orchestrator.list_all().len(), 1);

    wait_for_status(&orchestrator, first, JobStatus::Running).await;
    gate.notify_one();
    let job = orchestrator.wait(first, WAIT).await.unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(sync.calls(), 1);

    // Subject is free again once the job is terminal
    let third = orchestrator.submit("repo1", request("team/app")).unwrap();
    assert_ne!(third, first);
    gate.notify_one();
    orchestrator.wait(third, WAIT).await.unwrap();
}

#[tokio::test]
async fn test_different_subjects_run_independently() {
    let dir = TempDir::new().unwrap();
    let sync = Arc::new(FakeSync::new(Behavior::Succeed));
    let orchestrator = JobOrchestrator::new(config(&dir), sync.clone()).unwrap();

    let a = orchestrator.submit("repo-a", request("team/a")).unwrap();
    let b = orchestrator.submit("repo-b", request("team/b")).unwrap();
    assert_ne!(a, b);

    for id in [a, b] {
        assert_eq!(
            orchestrator.wait(id, WAIT).await.unwrap().status,
            JobStatus::Completed
        );
    }
    assert_eq!(sync.calls(), 2);
}

#[tokio::test]
async fn test_cancel_pending_job_is_immediate() {
    let dir = TempDir::new().unwrap();
    let (sync, gate) = FakeSync::gated(Behavior::Succeed);
    let orchestrator = JobOrchestrator::new(
        OrchestratorConfig {
            max_concurrent_jobs: 1,
            ..config(&dir)
        },
        sync.clone(),
    )
    .unwrap();

    let running = orchestrator.submit("repo-a", request("team/a")).unwrap();
    wait_for_status(&orchestrator, running, JobStatus::Running).await;
    let queued = orchestrator.submit("repo-b", request("team/b")).unwrap();
    assert_eq!(orchestrator.status(queued).unwrap().status, JobStatus::Pending);

    assert!(orchestrator.cancel(queued).unwrap());
    let cancelled = orchestrator.status(queued).unwrap();
    assert_eq!(cancelled.status, JobStatus::Cancelled);
    assert!(cancelled.started_at.is_none());
    assert!(cancelled.error.is_none());

    gate.notify_one();
    orchestrator.wait(running, WAIT).await.unwrap();
    assert_eq!(sync.calls(), 1);
    assert_eq!(
        orchestrator.status(queued).unwrap().status,
        JobStatus::Cancelled
    );
}

#[tokio::test]
async fn test_cancel_running_job() {
    let dir = TempDir::new().unwrap();
    let (sync, _gate) = FakeSync::gated(Behavior::Succeed);
    let orchestrator = JobOrchestrator::new(config(&dir), sync).unwrap();

    let id = orchestrator.submit("repo1", request("team/app")).unwrap();
    wait_for_status(&orchestrator, id, JobStatus::Running).await;

    assert!(orchestrator.cancel(id).unwrap());
    let job = orchestrator.wait(id, WAIT).await.unwrap();
    assert_eq!(job.status, JobStatus::Cancelled);
    assert!(job.local_path.is_none());

    // Terminal: no-op returning false
    assert!(!orchestrator.cancel(id).unwrap());
    assert_eq!(orchestrator.status(id).unwrap().status, JobStatus::Cancelled);
}

#[tokio::test]
async fn test_failure_is_captured_with_category() {
    let dir = TempDir::new().unwrap();
    let orchestrator = JobOrchestrator::new(
        config(&dir),
        Arc::new(FakeSync::new(Behavior::Fail(SyncError::auth(
            "HTTP Basic: Access denied",
        )))),
    )
    .unwrap();

    let seen: Arc<Mutex<Vec<Job>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let id = orchestrator
        .submit_with_callback("repo1", request("team/app"), move |job| {
            sink.lock().push(job.clone());
        })
        .unwrap();

    let job = orchestrator.wait(id, WAIT).await.unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    let failure = job.error.clone().unwrap();
    assert_eq!(failure.kind, SyncErrorKind::Auth);
    assert_eq!(failure.category, ErrorCategory::Permanent);
    assert_eq!(failure.message, "HTTP Basic: Access denied");
    assert!(job.local_path.is_none());

    let seen = seen.lock();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].status, JobStatus::Failed);
    assert_eq!(seen[0].id, id);
}

#[tokio::test]
async fn test_sync_timeout_fails_job() {
    let dir = TempDir::new().unwrap();
    let orchestrator = JobOrchestrator::new(
        OrchestratorConfig {
            sync_timeout_secs: 1,
            ..config(&dir)
        },
        Arc::new(FakeSync::new(Behavior::Stuck)),
    )
    .unwrap();

    let id = orchestrator.submit("repo1", request("team/app")).unwrap();
    let job = orchestrator.wait(id, WAIT).await.unwrap();

    assert_eq!(job.status, JobStatus::Failed);
    let failure = job.error.unwrap();
    assert_eq!(failure.kind, SyncErrorKind::Timeout);
    assert!(failure.category.is_retryable());
}

#[tokio::test]
async fn test_panicking_sync_fails_job() {
    let dir = TempDir::new().unwrap();
    let orchestrator =
        JobOrchestrator::new(config(&dir), Arc::new(FakeSync::new(Behavior::Panic))).unwrap();

    let id = orchestrator.submit("repo1", request("team/app")).unwrap();
    let job = orchestrator.wait(id, WAIT).await.unwrap();

    assert_eq!(job.status, JobStatus::Failed);
    let failure = job.error.unwrap();
    assert_eq!(failure.kind, SyncErrorKind::Panicked);
    assert_eq!(failure.category, ErrorCategory::Infrastructure);
    assert!(failure.message.contains("sync implementation bug"));
}

#[tokio::test]
async fn test_invalid_request_is_rejected_synchronously() {
    let dir = TempDir::new().unwrap();
    let orchestrator =
        JobOrchestrator::new(config(&dir), Arc::new(FakeSync::new(Behavior::Succeed))).unwrap();

    let no_token = SyncRequest::new("team/app", Credentials::new("alice", "")).unwrap();
    let err = orchestrator.submit("repo1", no_token).unwrap_err();
    assert!(matches!(err, OrchestratorError::InvalidRequest(_)));
    assert!(orchestrator.list_all().is_empty());
}

#[tokio::test]
async fn test_unknown_job_is_not_found() {
    let dir = TempDir::new().unwrap();
    let orchestrator =
        JobOrchestrator::new(config(&dir), Arc::new(FakeSync::new(Behavior::Succeed))).unwrap();

    let unknown = Uuid::new_v4();
    assert!(matches!(
        orchestrator.status(unknown),
        Err(OrchestratorError::JobNotFound(id)) if id == unknown
    ));
    assert!(matches!(
        orchestrator.cancel(unknown),
        Err(OrchestratorError::JobNotFound(_))
    ));
    assert!(orchestrator.wait(unknown, WAIT).await.is_err());
}

#[tokio::test]
async fn test_close_cancels_in_flight_and_refuses_new_work() {
    let dir = TempDir::new().unwrap();
    let (sync, _gate) = FakeSync::gated(Behavior::Succeed);
    let orchestrator = JobOrchestrator::new(
        OrchestratorConfig {
            max_concurrent_jobs: 1,
            ..config(&dir)
        },
        sync,
    )
    .unwrap();

    let running = orchestrator.submit("repo-a", request("team/a")).unwrap();
    wait_for_status(&orchestrator, running, JobStatus::Running).await;
    let queued = orchestrator.submit("repo-b", request("team/b")).unwrap();

    orchestrator.close().await;
    assert!(orchestrator.is_closed());
    assert_eq!(
        orchestrator.status(running).unwrap().status,
        JobStatus::Cancelled
    );
    assert_eq!(
        orchestrator.status(queued).unwrap().status,
        JobStatus::Cancelled
    );
    assert!(matches!(
        orchestrator.submit("repo-c", request("team/c")),
        Err(OrchestratorError::ShutDown)
    ));
}

#[tokio::test]
async fn test_list_and_purge() {
    let dir = TempDir::new().unwrap();
    let orchestrator =
        JobOrchestrator::new(config(&dir), Arc::new(FakeSync::new(Behavior::Succeed))).unwrap();

    let a = orchestrator.submit("repo-a", request("team/a")).unwrap();
    let b = orchestrator.submit("repo-b", request("team/b")).unwrap();
    orchestrator.wait(a, WAIT).await.unwrap();
    orchestrator.wait(b, WAIT).await.unwrap();

    let listed = orchestrator.list_all();
    assert_eq!(listed.len(), 2);
    assert!(listed.iter().all(|job| job.status == JobStatus::Completed));

    assert!(orchestrator.remove(a).unwrap());
    assert_eq!(orchestrator.purge_finished(), 1);
    assert!(orchestrator.list_all().is_empty());
}

#[tokio::test]
async fn test_progress_is_visible_while_running() {
    let dir = TempDir::new().unwrap();
    let (sync, gate) = FakeSync::gated(Behavior::Succeed);
    let orchestrator = JobOrchestrator::new(config(&dir), sync).unwrap();

    let id = orchestrator.submit("repo1", request("team/app")).unwrap();
    let job = wait_for_status(&orchestrator, id, JobStatus::Running).await;
    assert_eq!(job.status, JobStatus::Running);

    let deadline = tokio::time::Instant::now() + WAIT;
    while orchestrator.status(id).unwrap().progress_message != "fetching" {
        assert!(tokio::time::Instant::now() < deadline);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    gate.notify_one();
    let done = orchestrator.wait(id, WAIT).await.unwrap();
    assert!(done.progress_message.starts_with("synced to"));
}

#[tokio::test]
async fn test_shared_checkout_is_never_synced_twice() {
    let dir = TempDir::new().unwrap();
    let (sync, gate) = FakeSync::gated(Behavior::Succeed);
    let orchestrator = JobOrchestrator::new(config(&dir), sync.clone()).unwrap();

    // Different owners, same repository name: both map to repo/alice/app
    let first_request = request("team-x/app");
    let second_request = request("team-y/app");
    assert_ne!(first_request.subject(), second_request.subject());

    let first = orchestrator
        .submit(first_request.subject(), first_request)
        .unwrap();
    let refused = orchestrator.submit(second_request.subject(), second_request);
    match refused {
        Err(OrchestratorError::TargetBusy { target, job_id }) => {
            assert_eq!(job_id, first);
            assert_eq!(target, dir.path().join("repo").join("alice").join("app"));
        }
        other => panic!("expected TargetBusy, got {:?}", other),
    }
    assert_eq!(orchestrator.list_all().len(), 1);

    wait_for_status(&orchestrator, first, JobStatus::Running).await;
    gate.notify_one();
    orchestrator.wait(first, WAIT).await.unwrap();
    assert_eq!(sync.calls(), 1);

    // Free once the owning job is terminal
    let retry = request("team-y/app");
    let second = orchestrator.submit(retry.subject(), retry).unwrap();
    gate.notify_one();
    assert_eq!(
        orchestrator.wait(second, WAIT).await.unwrap().status,
        JobStatus::Completed
    );
}

/// Shell stand-in for git whose clone writes `<dest>/.git/HEAD` and then hangs
#[cfg(unix)]
fn hanging_git(dir: &Path) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join("git");
    std::fs::write(
        &path,
        "#!/bin/sh\n\
         case \"$1\" in\n\
         --version) echo \"git version 2.43.0\" ;;\n\
         clone)\n\
         for dest; do :; done\n\
         mkdir -p \"$dest/.git\" && echo \"ref: refs/heads/main\" > \"$dest/.git/HEAD\"\n\
         sleep 30\n\
         ;;\n\
         esac\n",
    )
    .unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// Any direct child of `dir` that holds a git directory, staged or not
#[cfg(unix)]
fn has_git_dir_under(dir: &Path) -> bool {
    std::fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter_map(|entry| entry.ok())
                .any(|entry| entry.path().join(".git").join("HEAD").exists())
        })
        .unwrap_or(false)
}

#[cfg(unix)]
#[tokio::test]
async fn test_cancel_mid_clone_leaves_no_partial_checkout() {
    let dir = TempDir::new().unwrap();
    let git = hanging_git(dir.path());
    let config = OrchestratorConfig::with_workspace_root(dir.path().join("ws"));
    let target = config.repo_path("alice", "app");
    let user_dir = config.user_dir("alice");
    let orchestrator = JobOrchestrator::new(
        config.clone(),
        Arc::new(GitSync::new(config).with_git_binary(git)),
    )
    .unwrap();

    let id = orchestrator.submit("repo1", request("team/app")).unwrap();
    let deadline = tokio::time::Instant::now() + WAIT;
    while !has_git_dir_under(&user_dir) {
        assert!(tokio::time::Instant::now() < deadline, "clone never started");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    assert!(orchestrator.cancel(id).unwrap());
    let job = orchestrator.wait(id, WAIT).await.unwrap();

    assert_eq!(job.status, JobStatus::Cancelled);
    assert!(!target.exists());
    assert!(!has_git_dir_under(&user_dir));
}
