//! Error types for cache system

use std::path::PathBuf;
use thiserror::Error;

/// Boxed analyzer failure, kept intact so callers can downcast it.
pub type AnalysisFailure = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Project root not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("I/O error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Analysis failed: {0}")]
    Analysis(#[source] AnalysisFailure),

    #[error("Cache corrupted: {0}")]
    Corrupted(String),

    #[error("Cache version mismatch: found {found}, expected {expected}")]
    VersionMismatch { found: u32, expected: u32 },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Metrics registration failed: {0}")]
    Metrics(#[from] prometheus::Error),
}

impl CacheError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn analysis<E>(err: E) -> Self
    where
        E: Into<AnalysisFailure>,
    {
        Self::Analysis(err.into())
    }

    /// True for failures raised by the external analyzer rather than by the cache itself.
    pub fn is_analysis(&self) -> bool {
        matches!(self, Self::Analysis(_))
    }
}

pub type CacheResult<T> = Result<T, CacheError>;
