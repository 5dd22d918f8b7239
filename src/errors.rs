use std::time::Duration;

use thiserror::Error;

/// MySQL error number for `Deadlock found when trying to get lock`.
const ER_LOCK_DEADLOCK: u16 = 1213;
/// MySQL error number for `Transaction branch was rolled back: deadlock was
/// detected`.
const ER_XA_RBDEADLOCK: u16 = 1614;

/// Errors that can occur during storage operations.
///
/// This enum represents the failure taxonomy of the storage engine: database
/// and serialization failures, cancellation, lock/retry deadlines, and
/// argument validation. Deadlocks reported by MySQL are absorbed by the
/// retry layer and only surface as [`StorageError::RetriesExhausted`] once
/// the deadline has passed.
#[derive(Error, Debug)]
pub enum StorageError {
    /// An error occurred while executing an SQL query
    #[error("Error occured while query: {0}")]
    Sql(#[from] sqlx::Error),

    /// An error occurred while serializing or deserializing JSON data
    #[error("Error while serializing payload: {0}")]
    Json(#[from] serde_json::Error),

    /// The cancellation signal fired before the operation completed
    #[error("Operation was cancelled")]
    Cancelled,

    /// A named advisory lock could not be acquired before the deadline
    #[error("Timed out after {timeout:?} while acquiring lock `{name}`")]
    LockTimeout { name: String, timeout: Duration },

    /// Database contention persisted past the retry deadline
    #[error("Timed out after {timeout:?} while retrying through database contention")]
    RetriesExhausted {
        timeout: Duration,
        #[source]
        source: sqlx::Error,
    },

    /// Invalid arguments supplied by the caller
    #[error("Invalid argument: {0}")]
    Validation(String),
}

impl StorageError {
    /// Whether this error is a deadlock-class failure the retry layer should
    /// absorb (MySQL 1213, 1614).
    pub(crate) fn is_deadlock(&self) -> bool {
        match self {
            StorageError::Sql(e) => is_deadlock_sql(e),
            _ => false,
        }
    }

    /// Converts a deadlock-class error into the terminal timeout form.
    pub(crate) fn into_retries_exhausted(self, timeout: Duration) -> StorageError {
        match self {
            StorageError::Sql(source) => StorageError::RetriesExhausted { timeout, source },
            other => other,
        }
    }
}

pub(crate) fn is_deadlock_sql(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => db
            .try_downcast_ref::<sqlx::mysql::MySqlDatabaseError>()
            .map(|mysql| {
                let number = mysql.number();
                number == ER_LOCK_DEADLOCK || number == ER_XA_RBDEADLOCK
            })
            .unwrap_or(false),
        _ => false,
    }
}

/// A Result type alias for StorageError.
pub type Result<T> = core::result::Result<T, StorageError>;
