//! Error types for the scheduler.

use drover_store::StoreError;
use thiserror::Error;

/// Errors that can occur in scheduler operations.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Store error.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// HTTP client could not be built.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Invalid scheduler configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Tenant processing panicked.
    #[error("panicked: {0}")]
    Panicked(String),
}

impl SchedulerError {
    /// Whether the store could not run the operation at all.
    pub fn is_store_unavailable(&self) -> bool {
        matches!(self, SchedulerError::Store(e) if e.is_unavailable())
    }
}

/// Errors returned when handing a job to an execution facility.
///
/// These describe the hand-off only; how the job itself runs is the worker's
/// concern.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubmissionError {
    /// The execution facility cannot take work.
    #[error("executor unavailable: {0}")]
    Unavailable(String),

    /// The submission queue is full.
    #[error("submission queue full")]
    QueueFull,

    /// The execution facility has shut down.
    #[error("executor closed")]
    Closed,
}
