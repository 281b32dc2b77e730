// src/error.rs

use crate::connection_manager::DbRole;

/// Errors raised by a storage backend (source, sink or enrichment table).
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("SQL error: {0}")]
    Sql(#[from] sqlx::Error),
    #[error("Connection timed out after {0}s")]
    Timeout(u64),
    #[error("Database unavailable: {0}")]
    Unavailable(String),
    #[error("Backend error: {0}")]
    Backend(String),
}

impl StoreError {
    /// True when the store could not be reached at all (as opposed to a failed statement).
    pub fn is_unavailable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_) | StoreError::Timeout(_))
    }
}

/// Run-level failures. Only these make the process exit non-zero.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("Cannot connect to {role} database after {attempts} attempts: {reason}")]
    Connectivity {
        role: DbRole,
        attempts: usize,
        reason: String,
    },
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SyncError {
    /// Failures that end the process with a non-zero status: unreachable
    /// databases and unusable configuration. Anything else is reported in the
    /// run summary.
    pub fn is_fatal(&self) -> bool {
        match self {
            SyncError::Connectivity { .. } | SyncError::Config(_) => true,
            SyncError::Store(e) => e.is_unavailable(),
            SyncError::Io(_) => false,
        }
    }
}

impl From<SyncError> for StoreError {
    fn from(e: SyncError) -> Self {
        match e {
            SyncError::Store(inner) => inner,
            other => StoreError::Unavailable(other.to_string()),
        }
    }
}

/// Why a single source row could not be turned into a sink row.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RowError {
    #[error("Missing key column '{0}'")]
    MissingKey(String),
    #[error("Key column '{column}' is not an integer: {value}")]
    InvalidKey { column: String, value: String },
    #[error("Column '{column}' expects {expected}, got '{value}'")]
    Coercion {
        column: String,
        expected: &'static str,
        value: String,
    },
}
