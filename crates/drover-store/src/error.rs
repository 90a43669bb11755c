//! Error types for store operations.

use rusqlite::ErrorCode;
use thiserror::Error;

use crate::{JobStatus, TenantId};

/// Errors that can occur in store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store cannot serve requests right now (busy, locked, unreachable).
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// Tenant is not known to the store.
    #[error("tenant not found: {0}")]
    TenantNotFound(TenantId),

    /// Job not found.
    #[error("job not found: {tenant}/{key}")]
    JobNotFound { tenant: TenantId, key: String },

    /// Job already exists.
    #[error("job already exists: {tenant}/{key}")]
    JobExists { tenant: TenantId, key: String },

    /// A status change was requested from a state that does not allow it.
    #[error("job {key} cannot move from {from} to {to}")]
    InvalidTransition {
        key: String,
        from: JobStatus,
        to: JobStatus,
    },

    /// A stored record could not be decoded.
    #[error("corrupt record: {0}")]
    Corrupt(String),

    /// SQLite error.
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Filesystem error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    /// Whether this error means the store could not run the operation at all,
    /// as opposed to the operation itself failing.
    pub fn is_unavailable(&self) -> bool {
        match self {
            StoreError::Unavailable(_) | StoreError::Io(_) => true,
            StoreError::Sqlite(e) => matches!(
                e.sqlite_error_code(),
                Some(ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked | ErrorCode::CannotOpen)
            ),
            _ => false,
        }
    }
}
