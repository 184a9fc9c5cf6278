use crate::error::{ErrorCategory, OrchestratorError, Result, SyncError, SyncErrorKind};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

/// Job status
///
/// `PENDING → RUNNING → {COMPLETED | FAILED | CANCELLED}`, plus
/// `PENDING → CANCELLED`. Terminal states are final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "PENDING",
            JobStatus::Running => "RUNNING",
            JobStatus::Completed => "COMPLETED",
            JobStatus::Failed => "FAILED",
            JobStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Operation kind a job performs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// Fetch or update a remote source tree into a local path
    Sync,
}

/// Error detail of a FAILED job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobFailure {
    pub category: ErrorCategory,
    pub kind: SyncErrorKind,
    pub message: String,
}

impl From<&SyncError> for JobFailure {
    fn from(err: &SyncError) -> Self {
        Self {
            category: err.category(),
            kind: err.kind(),
            message: err.message().to_string(),
        }
    }
}

/// Job model
///
/// Values handed out by the registry are point-in-time snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    /// Which project/source this job is for (at most one active job per subject)
    pub subject: String,
    pub kind: JobKind,
    pub status: JobStatus,
    pub progress_message: String,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    /// Unset until terminal
    pub ended_at: Option<DateTime<Utc>>,
    /// Set only when FAILED
    pub error: Option<JobFailure>,
    /// Set only when COMPLETED
    pub local_path: Option<PathBuf>,
}

impl Job {
    /// Create a new pending job
    pub fn new_pending(subject: impl Into<String>, kind: JobKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            subject: subject.into(),
            kind,
            status: JobStatus::Pending,
            progress_message: "waiting for a worker".to_string(),
            created_at: Utc::now(),
            started_at: None,
            ended_at: None,
            error: None,
            local_path: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Wall time from start to end (None until terminal, or if never started)
    pub fn duration_ms(&self) -> Option<i64> {
        match (self.started_at, self.ended_at) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds()),
            _ => None,
        }
    }
}

/// Job state machine for transitions
pub struct JobStateMachine {
    job: Job,
}

impl JobStateMachine {
    pub fn new(job: Job) -> Self {
        Self { job }
    }

    pub fn job(&self) -> &Job {
        &self.job
    }

    pub fn into_job(self) -> Job {
        self.job
    }

    /// Transition: PENDING → RUNNING
    pub fn start(&mut self) -> Result<()> {
        self.expect(&[JobStatus::Pending], JobStatus::Running)?;
        self.job.status = JobStatus::Running;
        self.job.started_at = Some(Utc::now());
        self.job.progress_message = "started".to_string();
        Ok(())
    }

    /// Transition: RUNNING → COMPLETED
    pub fn complete(&mut self, local_path: PathBuf) -> Result<()> {
        self.expect(&[JobStatus::Running], JobStatus::Completed)?;
        self.job.status = JobStatus::Completed;
        self.job.progress_message = format!("synced to {}", local_path.display());
        self.job.local_path = Some(local_path);
        self.job.ended_at = Some(Utc::now());
        Ok(())
    }

    /// Transition: RUNNING → FAILED
    pub fn fail(&mut self, error: &SyncError) -> Result<()> {
        self.expect(&[JobStatus::Running], JobStatus::Failed)?;
        self.job.status = JobStatus::Failed;
        self.job.progress_message = format!("failed: {}", error.message());
        self.job.error = Some(JobFailure::from(error));
        self.job.ended_at = Some(Utc::now());
        Ok(())
    }

    /// Transition: PENDING | RUNNING → CANCELLED
    pub fn cancel(&mut self, reason: &str) -> Result<()> {
        self.expect(
            &[JobStatus::Pending, JobStatus::Running],
            JobStatus::Cancelled,
        )?;
        self.job.status = JobStatus::Cancelled;
        self.job.progress_message = format!("cancelled: {}", reason);
        self.job.ended_at = Some(Utc::now());
        Ok(())
    }

    /// Update progress (non-terminal jobs only)
    pub fn set_progress(&mut self, message: impl Into<String>) -> Result<()> {
        if self.job.is_terminal() {
            return Err(OrchestratorError::InvalidStateTransition {
                from: self.job.status.to_string(),
                to: "progress".to_string(),
            });
        }
        self.job.progress_message = message.into();
        Ok(())
    }

    fn expect(&self, allowed: &[JobStatus], to: JobStatus) -> Result<()> {
        if allowed.contains(&self.job.status) {
            Ok(())
        } else {
            Err(OrchestratorError::InvalidStateTransition {
                from: self.job.status.to_string(),
                to: to.to_string(),
            })
        }
    }
}
