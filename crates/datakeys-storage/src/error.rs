use datakeys_core::DataKeyStoreError;
use rusqlite::{ffi, ErrorCode};
use thiserror::Error;

/// Failures raised by the SQLite backend itself (open, migrations, sessions).
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("blocking task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error("transaction scope is no longer usable")]
    ScopeClosed,
}

impl BackendError {
    /// Map into the store taxonomy. Only the message of the backend error survives.
    pub fn into_store_error(self, op: &'static str, name: Option<&str>) -> DataKeyStoreError {
        if let BackendError::Sqlite(rusqlite::Error::SqliteFailure(err, _)) = &self {
            if err.code == ErrorCode::OperationInterrupted {
                return DataKeyStoreError::Cancelled { op };
            }
            if let (true, Some(name)) = (is_unique_violation(err), name) {
                return DataKeyStoreError::Conflict {
                    name: name.to_string(),
                };
            }
        }
        DataKeyStoreError::storage(op, name, self)
    }
}

fn is_unique_violation(err: &ffi::Error) -> bool {
    err.code == ErrorCode::ConstraintViolation
        && (err.extended_code == ffi::SQLITE_CONSTRAINT_PRIMARYKEY
            || err.extended_code == ffi::SQLITE_CONSTRAINT_UNIQUE)
}
