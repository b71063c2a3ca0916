use crate::domain::ids::UserId;
use crate::domain::task::RateLimit;
use miette::Diagnostic;
use thiserror::Error;

#[derive(Error, Diagnostic, Debug)]
pub enum PortalError {
    #[error("Validation error: {0}")]
    #[diagnostic(code(portal::validation))]
    ValidationError(String),

    #[error("Not found: {0}")]
    #[diagnostic(code(portal::not_found))]
    NotFound(String),

    #[error("State conflict: {0}")]
    #[diagnostic(code(portal::state_conflict))]
    StateConflict(String),

    #[error("Rate limited: {0}")]
    #[diagnostic(code(portal::rate_limited), help("retry after the reported time"))]
    RateLimited(RateLimit),

    #[error("Insufficient balance for user {user}: balance {balance}, change {delta}")]
    #[diagnostic(code(portal::insufficient_balance))]
    InsufficientBalance {
        user: UserId,
        balance: i64,
        delta: i64,
    },

    #[error("Permanent failure: {0}")]
    #[diagnostic(
        code(portal::permanent_failure),
        help("retry budget exhausted; the record needs operator attention")
    )]
    PermanentFailure(String),

    #[error("Write conflict: {0}")]
    #[diagnostic(code(portal::write_conflict))]
    WriteConflict(String),

    #[error("Storage error: {0}")]
    #[diagnostic(code(portal::storage))]
    StorageError(String),

    #[error("Serialization error: {0}")]
    #[diagnostic(code(portal::serialization))]
    SerializationError(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    #[diagnostic(code(portal::csv))]
    CsvError(#[from] csv::Error),

    #[error("IO error: {0}")]
    #[diagnostic(code(portal::io))]
    IoError(#[from] std::io::Error),

    #[error("Lock backend error: {0}")]
    #[diagnostic(code(portal::lock_backend))]
    LockBackendError(String),
}

#[cfg(feature = "storage-rocksdb")]
impl From<rocksdb::Error> for PortalError {
    fn from(err: rocksdb::Error) -> Self {
        PortalError::StorageError(err.to_string())
    }
}

#[cfg(feature = "lock-redis")]
impl From<redis::RedisError> for PortalError {
    fn from(err: redis::RedisError) -> Self {
        PortalError::LockBackendError(err.to_string())
    }
}

impl PortalError {
    /// Errors a later attempt may succeed on. Business rejections are never transient.
    pub fn is_transient(&self) -> bool {
        match self {
            PortalError::WriteConflict(_)
            | PortalError::StorageError(_)
            | PortalError::IoError(_)
            | PortalError::LockBackendError(_) => true,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, PortalError>;
