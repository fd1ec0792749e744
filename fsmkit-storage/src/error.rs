//! Storage error types.

use fsmkit_core::{CoreError, StoreError};
use std::path::PathBuf;
use thiserror::Error;

/// Errors from the storage layer.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("time parse error: {0}")]
    Timestamp(#[from] chrono::ParseError),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("data corruption in {key}: {reason}")]
    Corruption { key: String, reason: String },

    #[error("{}: {source}", .path.display())]
    Definition {
        path: PathBuf,
        #[source]
        source: CoreError,
    },

    #[error("core error: {0}")]
    Core(#[from] CoreError),
}

impl StorageError {
    /// Returns whether SQLite reported a busy or locked database.
    pub fn is_busy(&self) -> bool {
        matches!(
            self,
            StorageError::Sqlite(rusqlite::Error::SqliteFailure(e, _))
                if matches!(
                    e.code,
                    rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
                )
        )
    }
}

impl From<StorageError> for StoreError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Json(e) => StoreError::Json(e),
            StorageError::Corruption { key, reason } => StoreError::Corrupt { key, reason },
            e if e.is_busy() => StoreError::Transient(Box::new(e)),
            e => StoreError::backend(e),
        }
    }
}
