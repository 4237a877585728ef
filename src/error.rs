// ABOUTME: Error taxonomy for the reconciliation core
// ABOUTME: Separates fatal schema problems from retryable storage failures

use thiserror::Error;

pub type Result<T, E = ReconcileError> = std::result::Result<T, E>;

/// Errors raised by offsets, table adapters, comparators, trackers and sinks.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// Offsets or columns that cannot be compared against each other.
    #[error("schema mismatch: {0}")]
    SchemaMismatch(String),
    /// A master range that cannot be expressed against the slave schema.
    #[error("range translation failed: {0}")]
    RangeTranslation(String),
    /// The comparator was handed records of different widths.
    #[error("column count mismatch: master has {master} columns, slave has {slave}")]
    ColumnCountMismatch { master: usize, slave: usize },
    /// Transient adapter, tracker or sink failure.
    #[error("storage I/O: {0}")]
    StorageIo(String),
    /// The caller's cancellation token fired.
    #[error("cancelled")]
    Cancelled,
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("{kind} '{name}' is already registered")]
    DuplicateName { kind: &'static str, name: String },
    #[error("{kind} '{name}' is not registered")]
    NotFound { kind: &'static str, name: String },
}

impl ReconcileError {
    pub fn storage(msg: impl Into<String>) -> Self {
        ReconcileError::StorageIo(msg.into())
    }

    /// Only storage failures may be retried; the last checkpoint is still consistent.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ReconcileError::StorageIo(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, ReconcileError::Cancelled)
    }
}

impl From<rusqlite::Error> for ReconcileError {
    fn from(e: rusqlite::Error) -> Self {
        match e {
            rusqlite::Error::SqliteFailure(ref err, _)
                if err.code == rusqlite::ErrorCode::OperationInterrupted =>
            {
                ReconcileError::Cancelled
            }
            other => ReconcileError::StorageIo(other.to_string()),
        }
    }
}

impl From<std::io::Error> for ReconcileError {
    fn from(e: std::io::Error) -> Self {
        ReconcileError::StorageIo(e.to_string())
    }
}

impl From<serde_json::Error> for ReconcileError {
    fn from(e: serde_json::Error) -> Self {
        ReconcileError::StorageIo(format!("serialization: {}", e))
    }
}

impl From<tokio::task::JoinError> for ReconcileError {
    fn from(e: tokio::task::JoinError) -> Self {
        ReconcileError::StorageIo(format!("blocking task failed: {}", e))
    }
}
