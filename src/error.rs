//! Error types for allocation operations

use crate::core::notifier::NotifierError;
use crate::core::prefix::{PrefixError, Usage};
use thiserror::Error;
use uuid::Uuid;

/// Allocation operation result type
pub type Result<T> = std::result::Result<T, AllocError>;

/// Coarse error classes surfaced to the transport layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed or missing input
    Validation,
    /// Referenced entity is absent
    NotFound,
    /// Name collision, insufficient capacity, exhausted prefix, live dependents
    Conflict,
    /// Database, lock, transaction or notifier failure
    Internal,
}

/// Allocation operation errors
#[derive(Error, Debug)]
pub enum AllocError {
    /// Request failed validation before any lock or mutation
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Referenced entity does not exist
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// Request conflicts with existing state
    ///
    /// `conflicting_id` names the entity the caller must resolve, `usage`
    /// carries parent prefix utilization when carving failed.
    #[error("Conflict: {message}")]
    Conflict {
        message: String,
        conflicting_id: Option<Uuid>,
        usage: Option<Box<Usage>>,
    },

    /// Advisory lock is held by another transaction
    #[error("Advisory lock {lock_id} for key '{key}' is held by another transaction")]
    LockUnavailable { key: String, lock_id: u64 },

    /// Request deadline passed before the transaction committed
    #[error("Request deadline exceeded")]
    DeadlineExceeded,

    /// Orchestration notifier failed on a path configured to abort
    #[error("Notifier error: {0}")]
    Notifier(#[from] NotifierError),

    /// SQLite error
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// JSON (de)serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration could not be loaded or is invalid
    #[error("Configuration error: {0}")]
    Config(String),

    /// Stored state is inconsistent
    #[error("Internal error: {0}")]
    Internal(String),
}

impl AllocError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        AllocError::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        AllocError::Conflict {
            message: message.into(),
            conflicting_id: None,
            usage: None,
        }
    }

    pub fn conflict_with(message: impl Into<String>, conflicting_id: Uuid) -> Self {
        AllocError::Conflict {
            message: message.into(),
            conflicting_id: Some(conflicting_id),
            usage: None,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            AllocError::Validation(_) => ErrorKind::Validation,
            AllocError::NotFound { .. } => ErrorKind::NotFound,
            AllocError::Conflict { .. } => ErrorKind::Conflict,
            AllocError::LockUnavailable { .. }
            | AllocError::DeadlineExceeded
            | AllocError::Notifier(_)
            | AllocError::Database(_)
            | AllocError::Serialization(_)
            | AllocError::Config(_)
            | AllocError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// HTTP status used by the transport layer
    pub fn status_code(&self) -> u16 {
        match self.kind() {
            ErrorKind::Validation => 400,
            ErrorKind::NotFound => 404,
            ErrorKind::Conflict => 409,
            ErrorKind::Internal => 500,
        }
    }

    /// Whether the caller may retry the whole operation unchanged
    pub fn is_retryable(&self) -> bool {
        match self {
            AllocError::LockUnavailable { .. } | AllocError::DeadlineExceeded => true,
            AllocError::Database(rusqlite::Error::SqliteFailure(e, _)) => matches!(
                e.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }

    /// Id of the entity the caller has to resolve, if any
    pub fn conflicting_id(&self) -> Option<Uuid> {
        match self {
            AllocError::Conflict { conflicting_id, .. } => *conflicting_id,
            _ => None,
        }
    }
}

impl From<validator::ValidationErrors> for AllocError {
    fn from(err: validator::ValidationErrors) -> Self {
        AllocError::Validation(err.to_string())
    }
}

impl From<PrefixError> for AllocError {
    fn from(err: PrefixError) -> Self {
        match err {
            PrefixError::NoSpace { .. } | PrefixError::AlreadyExists { .. } | PrefixError::HasChildren(_) => {
                AllocError::conflict(err.to_string())
            }
            PrefixError::NotFound { cidr, .. } => AllocError::not_found("Prefix", cidr),
            PrefixError::InvalidChildLength { .. } => AllocError::Validation(err.to_string()),
            PrefixError::Corrupt(msg) => AllocError::Internal(msg),
            PrefixError::Database(e) => AllocError::Database(e),
            PrefixError::Serialization(e) => AllocError::Serialization(e),
        }
    }
}

impl From<toml::de::Error> for AllocError {
    fn from(err: toml::de::Error) -> Self {
        AllocError::Config(err.to_string())
    }
}
