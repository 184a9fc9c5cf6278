use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;
use uuid::Uuid;

pub type Result<T> = std::result::Result<T, OrchestratorError>;

pub type SyncResult<T> = std::result::Result<T, SyncError>;

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("Job not found: {0}")]
    JobNotFound(Uuid),

    #[error("Invalid state transition: {from} -> {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Orchestrator is shut down")]
    ShutDown,

    #[error("Configuration error: {0}")]
    Config(String),

    /// Another active job is already syncing into the same checkout
    #[error("Checkout {} is in use by job {job_id}", target.display())]
    TargetBusy { target: PathBuf, job_id: Uuid },
}

impl OrchestratorError {
    pub fn config<E: fmt::Display>(e: E) -> Self {
        Self::Config(e.to_string())
    }
}

/// Error category for retry logic (from semantica-task-engine)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Transient error - retry automatically (e.g., timeout, connection)
    Transient,
    /// Permanent error - don't retry (e.g., bad credentials, unknown repository)
    Permanent,
    /// Infrastructure error - alert ops (e.g., git missing, disk full)
    Infrastructure,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Transient => "transient",
            ErrorCategory::Permanent => "permanent",
            ErrorCategory::Infrastructure => "infrastructure",
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorCategory::Transient)
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// What went wrong during a repository sync
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncErrorKind {
    /// Rejected credentials or missing permission
    Auth,
    /// Host unreachable, DNS, connection reset
    Network,
    /// Operation-level timeout elapsed
    Timeout,
    /// git exited non-zero for another reason
    Git,
    /// git binary missing or not runnable
    GitUnavailable,
    /// Local filesystem failure
    Io,
    /// Malformed URL, empty credentials
    InvalidRequest,
    /// Stopped by request (not a true failure)
    Cancelled,
    /// The sync implementation panicked
    Panicked,
}

impl SyncErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncErrorKind::Auth => "auth",
            SyncErrorKind::Network => "network",
            SyncErrorKind::Timeout => "timeout",
            SyncErrorKind::Git => "git",
            SyncErrorKind::GitUnavailable => "git_unavailable",
            SyncErrorKind::Io => "io",
            SyncErrorKind::InvalidRequest => "invalid_request",
            SyncErrorKind::Cancelled => "cancelled",
            SyncErrorKind::Panicked => "panicked",
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            SyncErrorKind::Network | SyncErrorKind::Timeout | SyncErrorKind::Cancelled => {
                ErrorCategory::Transient
            }
            SyncErrorKind::Auth | SyncErrorKind::Git | SyncErrorKind::InvalidRequest => {
                ErrorCategory::Permanent
            }
            SyncErrorKind::GitUnavailable | SyncErrorKind::Io | SyncErrorKind::Panicked => {
                ErrorCategory::Infrastructure
            }
        }
    }
}

impl fmt::Display for SyncErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Remote sync failure, tagged with a kind so callers can decide whether to retry.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind} error: {message}")]
pub struct SyncError {
    kind: SyncErrorKind,
    message: String,
}

impl SyncError {
    pub fn new(kind: SyncErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Self::new(SyncErrorKind::Auth, message)
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(SyncErrorKind::Network, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(SyncErrorKind::Timeout, message)
    }

    pub fn git(message: impl Into<String>) -> Self {
        Self::new(SyncErrorKind::Git, message)
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(SyncErrorKind::InvalidRequest, message)
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(SyncErrorKind::Cancelled, message)
    }

    pub fn io(context: impl fmt::Display, err: std::io::Error) -> Self {
        Self::new(SyncErrorKind::Io, format!("{}: {}", context, err))
    }

    pub fn kind(&self) -> SyncErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn category(&self) -> ErrorCategory {
        self.kind.category()
    }

    pub fn is_cancelled(&self) -> bool {
        self.kind == SyncErrorKind::Cancelled
    }
}
