/*
 * Codegraph Orchestration - Background Repository Sync Jobs
 *
 * Keeps local checkouts of remote repositories current so the analysis
 * cache always sees a stable file set.
 *
 * Architecture:
 * - Job State Machine (PENDING → RUNNING → COMPLETED | FAILED | CANCELLED)
 * - Job Registry (single mutex, point-in-time snapshots, per-job watch channel)
 * - Job Orchestrator (bounded tokio worker pool, cooperative cancellation, timeouts)
 * - Repository Sync seam (git CLI implementation)
 */

// Public modules
pub mod config;
pub mod error;
pub mod git;
pub mod job;
pub mod orchestrator;
pub mod registry;
pub mod remote;
pub mod sync;

// Re-exports
pub use config::OrchestratorConfig;
pub use error::{ErrorCategory, OrchestratorError, Result, SyncError, SyncErrorKind, SyncResult};
pub use git::{GitSync, RepositoryInfo, TreeStatus};
pub use job::{Job, JobFailure, JobKind, JobStateMachine, JobStatus};
pub use orchestrator::JobOrchestrator;
pub use registry::{CancelRequest, Finished, JobCallback, JobRegistry, Registration};
pub use remote::{Credentials, RemoteRepo, SyncOptions, SyncRequest, DEFAULT_HOST};
pub use sync::{should_update, ProgressReporter, RepositorySync};
